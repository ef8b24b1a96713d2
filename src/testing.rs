//! Shared helpers for testing the networkstatus code.
//!
//! Real documents come from the external parser and transport; these
//! stand-ins let the tests script both.  The fake "wire format" for
//! microdescriptors is one `desc <hex-digest> <payload>` line per
//! descriptor, optionally preceded by an `@last-listed` annotation,
//! which is all the cache code ever needs to see.

use crate::authority::Authority;
use crate::config::{NetstatusConfig, NetstatusConfigBuilder};
use crate::doc::{
    Consensus, ConsensusFlavor, DigestAlgorithm, DocDigests, Lifetime, RouterStatus, V2Status,
    Voter, VoterSignature,
};
use crate::ids::{CertKeyIds, DocDigest, MdDigest, RsaIdentity};
use crate::mdcache::{parse_last_listed, AllowAnnotations, ParsedMicrodesc};
use crate::quorum::{AuthorityCert, CertStore};
use crate::schedule::{DirTransport, FetchPurpose};
use crate::{DocumentParser, Error, NodeList, Result, WallClock};

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Shorthand for a SystemTime at `secs` past the epoch.
pub(crate) fn t(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
}

/// The digest our fake wire format assigns to test descriptor `i`.
pub(crate) fn md_digest(i: u8) -> MdDigest {
    [i; 32]
}

/// One descriptor in the fake wire format, with an optional payload
/// size to fatten it up.
pub(crate) fn md_entry(i: u8, pad: Option<usize>) -> Vec<u8> {
    let mut line = format!("desc {} ", hex::encode(md_digest(i)));
    match pad {
        Some(n) => line.push_str(&"x".repeat(n)),
        None => line.push_str("payload"),
    }
    line.push('\n');
    line.into_bytes()
}

/// A scriptable stand-in for the external document parser.
///
/// Consensus and v2 documents are returned verbatim for inputs that
/// were registered in advance; microdescriptors use the fake line
/// format above.
#[derive(Default)]
pub(crate) struct TestParser {
    /// Canned consensuses, keyed by their exact input bytes.
    consensuses: HashMap<Vec<u8>, Consensus>,
    /// Canned v2 documents, keyed by their exact input bytes.
    v2_statuses: HashMap<Vec<u8>, V2Status>,
}

impl TestParser {
    /// Register `c` as the result of parsing `bytes`.
    pub(crate) fn add_consensus(&mut self, bytes: Vec<u8>, c: Consensus) {
        self.consensuses.insert(bytes, c);
    }
    /// Register `ns` as the result of parsing `bytes`.
    pub(crate) fn add_v2(&mut self, bytes: Vec<u8>, ns: V2Status) {
        self.v2_statuses.insert(bytes, ns);
    }
}

impl DocumentParser for TestParser {
    fn parse_consensus(&self, input: &[u8]) -> Result<Consensus> {
        self.consensuses
            .get(input)
            .cloned()
            .ok_or(Error::BadParse("not a registered consensus"))
    }

    fn parse_v2_status(&self, input: &[u8]) -> Result<V2Status> {
        self.v2_statuses
            .get(input)
            .cloned()
            .ok_or(Error::BadParse("not a registered v2 status"))
    }

    fn parse_microdescs(
        &self,
        input: &[u8],
        allow: AllowAnnotations,
    ) -> Result<Vec<ParsedMicrodesc>> {
        let mut out = Vec::new();
        let mut pending_annotation = None;
        let mut pos = 0;
        while pos < input.len() {
            let line_end = input[pos..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|i| pos + i + 1)
                .unwrap_or(input.len());
            let line = std::str::from_utf8(&input[pos..line_end])
                .map_err(|_| Error::BadParse("not utf8"))?;
            if line.starts_with("@last-listed") {
                if allow == AllowAnnotations::AnnotationsNotAllowed {
                    return Err(Error::BadParse("unexpected annotation"));
                }
                pending_annotation = parse_last_listed(line.trim_end());
            } else if let Some(rest) = line.strip_prefix("desc ") {
                let hex_digest = rest.get(..64).ok_or(Error::BadParse("short digest"))?;
                let bytes =
                    hex::decode(hex_digest).map_err(|_| Error::BadParse("bad digest hex"))?;
                let mut digest = [0_u8; 32];
                digest.copy_from_slice(&bytes);
                out.push(ParsedMicrodesc {
                    digest,
                    last_listed: pending_annotation.take(),
                    body: pos..line_end,
                });
            } else if line.trim().is_empty() {
                // skip blank lines
            } else {
                return Err(Error::BadParse("unrecognized line"));
            }
            pos = line_end;
        }
        Ok(out)
    }
}

/// Return `n` test authorities named `auth1..authN` with identities
/// `[i; 20]` and signing keys `[i ^ 0xff; 20]`.
pub(crate) fn authorities(n: u8) -> Vec<Authority> {
    (1..=n)
        .map(|i| Authority::new(format!("auth{}", i), [i; 20].into()))
        .collect()
}

/// Build a finalized config rooted at `dir`, with test authorities
/// and any builder tweaks from `f`.
pub(crate) fn test_config(
    dir: &Path,
    f: impl FnOnce(&mut NetstatusConfigBuilder),
) -> NetstatusConfig {
    let mut b = NetstatusConfigBuilder::new();
    b.set_data_directory(dir);
    b.authorities = authorities(9);
    f(&mut b);
    b.finalize().unwrap()
}

/// Build a consensus of `flavor` whose signed-portion digests are
/// `[seed; _]`, with good signatures from the authorities in `good`
/// and cert-less signatures from those in `missing`.
pub(crate) fn build_consensus(
    flavor: ConsensusFlavor,
    lifetime: Lifetime,
    seed: u8,
    good: &[u8],
    missing: &[u8],
    relays: Vec<RouterStatus>,
) -> Consensus {
    let digests = DocDigests::new(Some([seed; 20]), Some([seed; 32]));
    let mut c = Consensus::new(flavor, lifetime, digests);
    for i in good.iter().chain(missing) {
        let identity: RsaIdentity = [*i; 20].into();
        let sk: RsaIdentity = [*i ^ 0xff; 20].into();
        let mut v = Voter::new(format!("auth{}", i), identity, "192.0.2.1".into(), 80);
        let (alg, sig) = match flavor {
            ConsensusFlavor::Ns => (DigestAlgorithm::Sha1, vec![seed; 20]),
            ConsensusFlavor::Microdesc => (DigestAlgorithm::Sha256, vec![seed; 32]),
        };
        v.add_signature(VoterSignature::new(alg, identity, sk, sig));
        c.add_voter(v);
    }
    for rs in relays {
        c.add_relay(rs).unwrap();
    }
    c
}

/// A relay entry whose identity and descriptor digest derive from
/// `idbyte`.
pub(crate) fn relay(idbyte: u8, flavor: ConsensusFlavor) -> RouterStatus {
    let desc = match flavor {
        ConsensusFlavor::Ns => DocDigest::Sha1([idbyte; 20]),
        ConsensusFlavor::Microdesc => DocDigest::Sha256([idbyte; 32]),
    };
    RouterStatus::new(
        RsaIdentity::from_bytes(&[idbyte; 20]).unwrap(),
        desc,
        format!("router{}", idbyte),
        "192.0.2.5".parse().unwrap(),
        9001,
        9030,
    )
}

/// Register a fake v2 status document for authority `[i; 20]` with
/// the given publication time and digest byte; returns the document
/// bytes.
pub(crate) fn v2_doc(
    parser: &mut TestParser,
    i: u8,
    published: SystemTime,
    tag: u8,
) -> Vec<u8> {
    let mut ns = V2Status::new(
        [i; 20].into(),
        published,
        [tag; 20],
        "192.0.2.9".into(),
        80,
    );
    let rs = RouterStatus::new(
        RsaIdentity::from_bytes(&[0x40 + i; 20]).unwrap(),
        DocDigest::Sha1([i.wrapping_mul(0x11); 20]),
        format!("v2router{}", i),
        "192.0.2.5".parse().unwrap(),
        9001,
        9030,
    );
    ns.add_entry(rs).unwrap();
    let secs = published
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let bytes = format!("v2-status {} {} {}\n", i, tag, secs).into_bytes();
    parser.add_v2(bytes.clone(), ns);
    bytes
}

/// A certificate that "recovers" the signature bytes themselves, so
/// a signature verifies whenever its bytes equal the document digest.
pub(crate) struct SimpleCert {
    /// Authority identity digest.
    identity: RsaIdentity,
    /// Signing key digest.
    sk: RsaIdentity,
    /// Expiry time.
    expires: SystemTime,
}

impl AuthorityCert for SimpleCert {
    fn identity(&self) -> &RsaIdentity {
        &self.identity
    }
    fn signing_key_digest(&self) -> &RsaIdentity {
        &self.sk
    }
    fn expires(&self) -> SystemTime {
        self.expires
    }
    fn checksig(&self, signature: &[u8]) -> Option<Vec<u8>> {
        Some(signature.to_vec())
    }
}

/// Interior state of a [`TestCertStore`].
#[derive(Default)]
struct CertInner {
    /// The certificates the store holds.
    certs: HashMap<CertKeyIds, Arc<SimpleCert>>,
    /// Identities whose cert downloads "recently failed".
    uncertain: HashSet<RsaIdentity>,
    /// How many times fetch_missing was invoked.
    fetch_missing_calls: u32,
}

/// A shareable in-memory certificate store.
///
/// Clones share state, so a test can keep a handle and add
/// certificates after the store has been handed to the directory
/// state.
#[derive(Clone, Default)]
pub(crate) struct TestCertStore {
    /// Shared interior.
    inner: Rc<RefCell<CertInner>>,
}

impl TestCertStore {
    /// Add a certificate for test authority `idbyte`.
    pub(crate) fn add_cert(&self, idbyte: u8) {
        let cert = SimpleCert {
            identity: [idbyte; 20].into(),
            sk: [idbyte ^ 0xff; 20].into(),
            expires: t(u32::MAX as u64),
        };
        let ids = cert.key_ids();
        self.inner.borrow_mut().certs.insert(ids, Arc::new(cert));
    }
    /// Mark cert downloads for `idbyte` as looking uncertain.
    pub(crate) fn mark_uncertain(&self, idbyte: u8) {
        self.inner.borrow_mut().uncertain.insert([idbyte; 20].into());
    }
    /// Return how many times fetch_missing has been called.
    pub(crate) fn fetch_missing_calls(&self) -> u32 {
        self.inner.borrow().fetch_missing_calls
    }
}

impl CertStore for TestCertStore {
    fn lookup(&self, ids: &CertKeyIds) -> Option<Arc<dyn AuthorityCert>> {
        self.inner
            .borrow()
            .certs
            .get(ids)
            .map(|c| Arc::clone(c) as Arc<dyn AuthorityCert>)
    }
    fn dl_looks_uncertain(&self, id: &RsaIdentity) -> bool {
        self.inner.borrow().uncertain.contains(id)
    }
    fn fetch_missing(&mut self, _consensus: &Consensus, _now: SystemTime) {
        self.inner.borrow_mut().fetch_missing_calls += 1;
    }
}

/// Interior state of a [`TestTransport`].
#[derive(Default)]
struct TransportInner {
    /// Every fetch launched, in order.
    launched: Vec<(FetchPurpose, String)>,
    /// Fetches to report as in flight.
    in_flight: HashSet<(FetchPurpose, String)>,
    /// Digests to report as pending microdescriptor downloads.
    pending_mds: HashSet<MdDigest>,
}

/// A transport that records fetches instead of performing them.
#[derive(Clone, Default)]
pub(crate) struct TestTransport {
    /// Shared interior.
    inner: Rc<RefCell<TransportInner>>,
}

impl TestTransport {
    /// Return every fetch launched so far.
    pub(crate) fn launched(&self) -> Vec<(FetchPurpose, String)> {
        self.inner.borrow().launched.clone()
    }
    /// Forget all recorded fetches.
    pub(crate) fn clear_launched(&self) {
        self.inner.borrow_mut().launched.clear();
    }
    /// Pretend a fetch of (`purpose`, `resource`) is in flight.
    pub(crate) fn set_in_flight(&self, purpose: FetchPurpose, resource: &str) {
        self.inner
            .borrow_mut()
            .in_flight
            .insert((purpose, resource.to_string()));
    }
}

impl DirTransport for TestTransport {
    fn launch_fetch(&mut self, purpose: FetchPurpose, resource: &str) {
        self.inner
            .borrow_mut()
            .launched
            .push((purpose, resource.to_string()));
    }
    fn in_flight(&self, purpose: FetchPurpose, resource: Option<&str>) -> bool {
        let inner = self.inner.borrow();
        match resource {
            Some(r) => inner.in_flight.contains(&(purpose, r.to_string())),
            None => inner.in_flight.iter().any(|(p, _)| *p == purpose),
        }
    }
    fn pending_microdescs(&self) -> HashSet<MdDigest> {
        self.inner.borrow().pending_mds.clone()
    }
}

/// Interior state of a [`TestNodeList`].
#[derive(Default)]
struct NodeInner {
    /// How many times set_consensus was invoked.
    set_consensus_calls: u32,
    /// Digests of every microdescriptor handed to the node list.
    added_mds: Vec<MdDigest>,
    /// Digests the node list claims to be using.
    in_use: Vec<MdDigest>,
    /// Whether any bridge is currently known.
    bridges_known: bool,
    /// Whether some bridge can't serve microdescriptors.
    bridge_lacks_md: bool,
    /// Canned answers for statuses_by_purpose.
    by_purpose: HashMap<String, Vec<RouterStatus>>,
}

/// A node list that records what the directory state tells it.
#[derive(Clone, Default)]
pub(crate) struct TestNodeList {
    /// Shared interior.
    inner: Rc<RefCell<NodeInner>>,
}

impl TestNodeList {
    /// Return how many times set_consensus has been called.
    pub(crate) fn set_consensus_calls(&self) -> u32 {
        self.inner.borrow().set_consensus_calls
    }
    /// Return the digests of every microdescriptor we were given.
    pub(crate) fn added_mds(&self) -> Vec<MdDigest> {
        self.inner.borrow().added_mds.clone()
    }
    /// Pretend bridges are (or aren't) known.
    pub(crate) fn set_bridges_known(&self, known: bool) {
        self.inner.borrow_mut().bridges_known = known;
    }
    /// Register canned statuses for a purpose string.
    pub(crate) fn set_purpose_statuses(&self, purpose: &str, statuses: Vec<RouterStatus>) {
        self.inner
            .borrow_mut()
            .by_purpose
            .insert(purpose.to_string(), statuses);
    }
}

impl NodeList for TestNodeList {
    fn set_consensus(&mut self, _consensus: &Consensus) {
        self.inner.borrow_mut().set_consensus_calls += 1;
    }
    fn add_microdesc(&mut self, digest: &MdDigest, _body: &[u8]) {
        self.inner.borrow_mut().added_mds.push(*digest);
    }
    fn md_digests_in_use(&self) -> Vec<MdDigest> {
        self.inner.borrow().in_use.clone()
    }
    fn any_bridges_known(&self) -> bool {
        self.inner.borrow().bridges_known
    }
    fn any_bridge_lacks_md_support(&self) -> bool {
        self.inner.borrow().bridge_lacks_md
    }
    fn statuses_by_purpose(&self, purpose: &str) -> Option<Vec<RouterStatus>> {
        self.inner.borrow().by_purpose.get(purpose).cloned()
    }
}

/// A clock the tests can set and advance.
#[derive(Clone)]
pub(crate) struct TestClock {
    /// The frozen "current" time.
    now: Rc<Cell<SystemTime>>,
}

impl TestClock {
    /// Create a clock frozen at `now`.
    pub(crate) fn at(now: SystemTime) -> Self {
        TestClock {
            now: Rc::new(Cell::new(now)),
        }
    }
    /// Move the clock to `now`.
    pub(crate) fn set(&self, now: SystemTime) {
        self.now.set(now);
    }
    /// Move the clock forward by `d`.
    pub(crate) fn advance(&self, d: Duration) {
        self.now.set(self.now.get() + d);
    }
}

impl WallClock for TestClock {
    fn now(&self) -> SystemTime {
        self.now.get()
    }
}
