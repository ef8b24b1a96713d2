//! Structured representations of networkstatus documents.
//!
//! The types here describe a consensus directory document and the
//! entries inside it.  Turning raw bytes into these types is the
//! parser's job; the parser is an external collaborator reached
//! through [`DocumentParser`](crate::DocumentParser).  The code in
//! this crate consumes parsed documents, decides whether to believe
//! them, and caches them.

use crate::ids::{DocDigest, RsaIdentity};
use crate::retry::DownloadStatus;
use crate::{Error, Result};

use bitflags::bitflags;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, SystemTime};
use tracing::warn;

/// A recognized 'flavor' of consensus document.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum ConsensusFlavor {
    /// A "networkstatus"-flavored consensus, which refers to full
    /// router descriptors by SHA1 digest.
    Ns,
    /// A "microdesc"-flavored consensus, which refers to separate
    /// microdescriptor documents by SHA256 digest.
    Microdesc,
}

/// Every flavor we know about, in a fixed order.
pub const ALL_FLAVORS: [ConsensusFlavor; 2] = [ConsensusFlavor::Ns, ConsensusFlavor::Microdesc];

impl ConsensusFlavor {
    /// Return the name of this consensus flavor.
    pub fn name(&self) -> &'static str {
        match self {
            ConsensusFlavor::Ns => "ns",
            ConsensusFlavor::Microdesc => "microdesc",
        }
    }
    /// Try to find the flavor whose name is `name`.
    ///
    /// Unknown flavors are rejected outright: we have no way to
    /// validate or use a document whose flavor we don't recognize.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "ns" => Ok(ConsensusFlavor::Ns),
            "microdesc" => Ok(ConsensusFlavor::Microdesc),
            _ => Err(Error::BadArgument("unrecognized consensus flavor")),
        }
    }
}

/// A small fixed-arity record holding one value per consensus flavor.
///
/// We use this instead of an array indexed by flavor so that code that
/// handles "the flavor we aren't using" has to say so explicitly.
#[derive(Debug, Clone, Default)]
pub(crate) struct FlavorPair<T> {
    /// Value for the "ns" flavor.
    ns: T,
    /// Value for the "microdesc" flavor.
    microdesc: T,
}

impl<T> FlavorPair<T> {
    /// Return a reference to the value for `flavor`.
    pub(crate) fn get(&self, flavor: ConsensusFlavor) -> &T {
        match flavor {
            ConsensusFlavor::Ns => &self.ns,
            ConsensusFlavor::Microdesc => &self.microdesc,
        }
    }
    /// Return a mutable reference to the value for `flavor`.
    pub(crate) fn get_mut(&mut self, flavor: ConsensusFlavor) -> &mut T {
        match flavor {
            ConsensusFlavor::Ns => &mut self.ns,
            ConsensusFlavor::Microdesc => &mut self.microdesc,
        }
    }
}

/// A digest algorithm used to sign networkstatus documents.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum DigestAlgorithm {
    /// SHA1, used on "ns" flavored consensuses.
    Sha1,
    /// SHA256, used on "microdesc" flavored consensuses.
    Sha256,
}

impl DigestAlgorithm {
    /// Return the number of bytes in a digest made with this algorithm.
    pub fn digest_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Sha256 => 32,
        }
    }
}

/// The digests of a consensus document's signed portion, one per
/// supported algorithm.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocDigests {
    /// The SHA1 digest of the signed portion, if computed.
    sha1: Option<[u8; 20]>,
    /// The SHA256 digest of the signed portion, if computed.
    sha256: Option<[u8; 32]>,
}

impl DocDigests {
    /// Construct a new set of document digests.
    pub fn new(sha1: Option<[u8; 20]>, sha256: Option<[u8; 32]>) -> Self {
        DocDigests { sha1, sha256 }
    }
    /// Return the digest for `alg`, if we have one.
    pub fn get(&self, alg: DigestAlgorithm) -> Option<&[u8]> {
        match alg {
            DigestAlgorithm::Sha1 => self.sha1.as_ref().map(|d| &d[..]),
            DigestAlgorithm::Sha256 => self.sha256.as_ref().map(|d| &d[..]),
        }
    }
}

/// The lifetime of a networkstatus document.
///
/// A consensus is "live" between its valid-after and valid-until
/// times; it is "fresh" until its fresh-until time, when a better one
/// is expected to appear.
#[derive(Clone, Debug)]
pub struct Lifetime {
    /// Time at which the document becomes valid.
    valid_after: SystemTime,
    /// Time after which there is expected to be a better version of
    /// this consensus.
    fresh_until: SystemTime,
    /// Time after which this consensus is expired.
    ///
    /// (In practice, clients will keep using documents for a while
    /// after this expiration time, if no better one can be found.)
    valid_until: SystemTime,
}

/// How long after its valid-until time do we consider a consensus
/// "reasonably live"?
pub const REASONABLY_LIVE_TIME: Duration = Duration::from_secs(24 * 60 * 60);

impl Lifetime {
    /// Construct a new Lifetime.
    pub fn new(
        valid_after: SystemTime,
        fresh_until: SystemTime,
        valid_until: SystemTime,
    ) -> Result<Self> {
        if valid_after <= fresh_until && fresh_until <= valid_until {
            Ok(Lifetime {
                valid_after,
                fresh_until,
                valid_until,
            })
        } else {
            Err(Error::InvalidLifetime)
        }
    }
    /// Return the time when this consensus first becomes valid.
    pub fn valid_after(&self) -> SystemTime {
        self.valid_after
    }
    /// Return the time when this consensus is no longer fresh.
    pub fn fresh_until(&self) -> SystemTime {
        self.fresh_until
    }
    /// Return the time when this consensus is no longer valid.
    pub fn valid_until(&self) -> SystemTime {
        self.valid_until
    }
    /// Return true if this consensus is live at `now`.
    ///
    /// Both endpoints count as live.
    pub fn is_live(&self, now: SystemTime) -> bool {
        self.valid_after <= now && now <= self.valid_until
    }
    /// Return true if this consensus is live at `now`, or expired by
    /// no more than [`REASONABLY_LIVE_TIME`].
    pub fn is_reasonably_live(&self, now: SystemTime) -> bool {
        self.valid_after <= now && now <= self.valid_until + REASONABLY_LIVE_TIME
    }
    /// Return the voting interval: the distance from valid-after to
    /// fresh-until.
    pub fn voting_interval(&self) -> Duration {
        self.fresh_until
            .duration_since(self.valid_after)
            .unwrap_or_default()
    }
}

/// A set of named integer parameters from a consensus.
///
/// These are used both for the `params` line (network tunables) and
/// the bandwidth-weights line in the footer.
#[derive(Debug, Clone, Default)]
pub struct NetParams {
    /// Map from parameter name to value.
    params: HashMap<String, i32>,
}

impl NetParams {
    /// Create a new empty parameter list.
    pub fn new() -> Self {
        NetParams::default()
    }
    /// Retrieve a parameter, if it is present.
    pub fn get(&self, k: &str) -> Option<i32> {
        self.params.get(k).copied()
    }
    /// Set or replace the value of a parameter.
    pub fn set(&mut self, k: String, v: i32) {
        self.params.insert(k, v);
    }
    /// Return an iterator over all key value pairs in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &i32)> {
        self.params.iter()
    }
    /// Look up `k`, returning `default` if absent, and clamping the
    /// result into `min..=max`.
    ///
    /// Out-of-range values get a warning: they mean the authorities
    /// voted for something this implementation considers unusable.
    pub fn get_clamped(&self, k: &str, default: i32, min: i32, max: i32) -> i32 {
        debug_assert!(min <= default && default <= max);
        let v = match self.get(k) {
            Some(v) => v,
            None => return default,
        };
        if v < min {
            warn!("Consensus parameter {} is too small. Got {}, raising to {}.", k, v, min);
            min
        } else if v > max {
            warn!("Consensus parameter {} is too large. Got {}, capping to {}.", k, v, max);
            max
        } else {
            v
        }
    }
}

bitflags! {
    /// A set of recognized directory flags on a single relay.
    ///
    /// These come from the consensus, and describe what the
    /// authorities believe about the relay.
    pub struct RelayFlags: u16 {
        /// Is this a directory authority?
        const AUTHORITY = (1 << 0);
        /// Is this relay marked as a bad exit?
        const BAD_EXIT = (1 << 1);
        /// Is this relay marked as a bad directory?
        const BAD_DIRECTORY = (1 << 2);
        /// Is this relay marked as an exit for weighting purposes?
        const EXIT = (1 << 3);
        /// Is this relay considered "fast" above a certain threshold?
        const FAST = (1 << 4);
        /// Is this relay suitable for use as a guard relay?
        const GUARD = (1 << 5);
        /// Does this relay participate in the hidden service directory
        /// ring?
        const HSDIR = (1 << 6);
        /// Does the binding from this relay's nickname to its identity
        /// carry the authorities' endorsement?
        const NAMED = (1 << 7);
        /// Is this relay's nickname one that the authorities have
        /// assigned to a *different* identity?
        const UNNAMED = (1 << 8);
        /// Is this relay currently running?
        const RUNNING = (1 << 9);
        /// Is this relay considered "stable" enough for long-lived
        /// circuits?
        const STABLE = (1 << 10);
        /// Is this relay allowed on the network at all?
        const VALID = (1 << 11);
        /// Does this relay support a recognized version of the
        /// directory protocol?
        const V2DIR = (1 << 12);
    }
}

bitflags! {
    /// Capabilities that a relay's advertised software version implies.
    #[derive(Default)]
    pub struct VersionCaps: u8 {
        /// The relay supports tunneled directory requests.
        const BEGINDIR = (1 << 0);
        /// The relay accepts extra-info uploads.
        const EXTRAINFO_UPLOAD = (1 << 1);
        /// The relay supports conditional consensus downloads.
        const CONDITIONAL_CONSENSUS = (1 << 2);
        /// The relay speaks the v3 directory protocol.
        const V3_DIR = (1 << 3);
    }
}

/// A single relay, as listed in a consensus document.
#[derive(Debug, Clone)]
pub struct RouterStatus {
    /// Identity digest of the relay's long-term identity key.
    identity: RsaIdentity,
    /// Digest of the descriptor document this entry refers to.
    desc_digest: DocDigest,
    /// The relay's self-chosen nickname.
    nickname: String,
    /// Address at which the relay can be reached.
    addr: IpAddr,
    /// Port for the main OR protocol.
    or_port: u16,
    /// Port for directory requests, or 0 if none.
    dir_port: u16,
    /// When the descriptor this entry refers to was published.
    published_on: Option<SystemTime>,
    /// Directory flags the authorities assigned to this relay.
    flags: RelayFlags,
    /// Capabilities implied by the relay's advertised version.
    caps: VersionCaps,
    /// The relay's advertised software version, if it gave one.
    version: Option<String>,
    /// Download status for the descriptor this entry refers to.
    dl_status: DownloadStatus,
    /// The last time a directory request for this relay's descriptor
    /// got a 503 response.
    last_dir_503_at: Option<SystemTime>,
}

impl RouterStatus {
    /// Construct a new RouterStatus with the given identity and
    /// descriptor digest.
    pub fn new(
        identity: RsaIdentity,
        desc_digest: DocDigest,
        nickname: String,
        addr: IpAddr,
        or_port: u16,
        dir_port: u16,
    ) -> Self {
        RouterStatus {
            identity,
            desc_digest,
            nickname,
            addr,
            or_port,
            dir_port,
            published_on: None,
            flags: RelayFlags::empty(),
            caps: VersionCaps::empty(),
            version: None,
            dl_status: DownloadStatus::default(),
            last_dir_503_at: None,
        }
    }
    /// Set the directory flags for this entry.
    pub fn set_flags(&mut self, flags: RelayFlags) {
        self.flags = flags;
    }
    /// Set the advertised version (and derived capabilities) for this
    /// entry.
    pub fn set_version(&mut self, version: String, caps: VersionCaps) {
        self.version = Some(version);
        self.caps = caps;
    }
    /// Set the publication time of the referenced descriptor.
    pub fn set_published_on(&mut self, when: SystemTime) {
        self.published_on = Some(when);
    }

    /// Return the identity digest for this entry.
    pub fn identity(&self) -> &RsaIdentity {
        &self.identity
    }
    /// Return the descriptor digest for this entry.
    pub fn desc_digest(&self) -> &DocDigest {
        &self.desc_digest
    }
    /// Return this relay's nickname.
    pub fn nickname(&self) -> &str {
        &self.nickname
    }
    /// Return the address of this relay.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }
    /// Return the OR port of this relay.
    pub fn or_port(&self) -> u16 {
        self.or_port
    }
    /// Return the directory port of this relay, or 0 if it has none.
    pub fn dir_port(&self) -> u16 {
        self.dir_port
    }
    /// Return the publication time of the referenced descriptor.
    pub fn published_on(&self) -> Option<SystemTime> {
        self.published_on
    }
    /// Return the directory flags for this entry.
    pub fn flags(&self) -> RelayFlags {
        self.flags
    }
    /// Return the advertised version for this entry, if any.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }
    /// Return true if this entry carries the Named flag.
    pub fn is_named(&self) -> bool {
        self.flags.contains(RelayFlags::NAMED)
    }
    /// Return true if this entry carries the Unnamed flag.
    pub fn is_unnamed(&self) -> bool {
        self.flags.contains(RelayFlags::UNNAMED)
    }
    /// Return the download status for this entry's descriptor.
    pub fn dl_status(&self) -> &DownloadStatus {
        &self.dl_status
    }
    /// Return a mutable reference to the download status for this
    /// entry's descriptor.
    pub(crate) fn dl_status_mut(&mut self) -> &mut DownloadStatus {
        &mut self.dl_status
    }
    /// Record the last time a request for this descriptor got a 503.
    pub(crate) fn set_last_dir_503_at(&mut self, when: Option<SystemTime>) {
        self.last_dir_503_at = when;
    }
    /// Return the last time a request for this descriptor got a 503.
    pub fn last_dir_503_at(&self) -> Option<SystemTime> {
        self.last_dir_503_at
    }
    /// Copy the download status from an older entry for the same
    /// descriptor.
    pub(crate) fn copy_dl_status_from(&mut self, other: &RouterStatus) {
        self.dl_status = other.dl_status.clone();
    }

    /// Return true if the contents of this entry differ from `other`
    /// in any way a controller would care about.
    ///
    /// Both entries must be for the same identity.
    pub(crate) fn has_changed(&self, other: &RouterStatus) -> bool {
        debug_assert_eq!(self.identity, other.identity);
        self.nickname != other.nickname
            || self.desc_digest != other.desc_digest
            || self.addr != other.addr
            || self.or_port != other.or_port
            || self.dir_port != other.dir_port
            || self.flags != other.flags
            || self.caps != other.caps
            || self.version != other.version
    }
}

/// A single directory signature on a consensus document.
///
/// After verification, exactly zero or one of `good_signature` and
/// `bad_signature` is set.
#[derive(Debug, Clone)]
pub struct VoterSignature {
    /// The digest algorithm this signature covers.
    alg: DigestAlgorithm,
    /// Digest of the long-term identity key of the signing authority.
    identity_digest: RsaIdentity,
    /// Digest of the signing key used to make this signature.
    signing_key_digest: RsaIdentity,
    /// The raw signature bytes.
    signature: Vec<u8>,
    /// Set once this signature has been checked and found good.
    good_signature: bool,
    /// Set once this signature has been checked and found bad.
    bad_signature: bool,
}

impl VoterSignature {
    /// Construct a new, unchecked signature.
    pub fn new(
        alg: DigestAlgorithm,
        identity_digest: RsaIdentity,
        signing_key_digest: RsaIdentity,
        signature: Vec<u8>,
    ) -> Self {
        VoterSignature {
            alg,
            identity_digest,
            signing_key_digest,
            signature,
            good_signature: false,
            bad_signature: false,
        }
    }
    /// Return the digest algorithm this signature covers.
    pub fn alg(&self) -> DigestAlgorithm {
        self.alg
    }
    /// Return the identity digest of the authority that allegedly made
    /// this signature.
    pub fn identity_digest(&self) -> &RsaIdentity {
        &self.identity_digest
    }
    /// Return the digest of the signing key used for this signature.
    pub fn signing_key_digest(&self) -> &RsaIdentity {
        &self.signing_key_digest
    }
    /// Return the raw signature bytes.
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }
    /// Return true if this signature has been checked and found good.
    pub fn is_good(&self) -> bool {
        self.good_signature
    }
    /// Return true if this signature has been checked and found bad.
    pub fn is_bad(&self) -> bool {
        self.bad_signature
    }
    /// Return true if this signature has been checked either way.
    pub fn is_checked(&self) -> bool {
        self.good_signature || self.bad_signature
    }
    /// Mark this signature as verified.
    pub(crate) fn mark_good(&mut self) {
        debug_assert!(!self.bad_signature);
        self.good_signature = true;
    }
    /// Mark this signature as failing verification.
    pub(crate) fn mark_bad(&mut self) {
        debug_assert!(!self.good_signature);
        self.bad_signature = true;
    }
}

/// A voter whose vote contributed to a consensus, together with the
/// signatures it made.
#[derive(Debug, Clone)]
pub struct Voter {
    /// The voter's self-chosen nickname.
    nickname: String,
    /// Digest of the voter's long-term identity key.
    identity: RsaIdentity,
    /// The voter's address, in string form, for diagnostics.
    address: String,
    /// Directory port the voter listens on.
    dir_port: u16,
    /// Contact information for the voter's operator.
    contact: Option<String>,
    /// The signatures this voter made on the document.
    signatures: Vec<VoterSignature>,
}

impl Voter {
    /// Construct a new voter record.
    pub fn new(nickname: String, identity: RsaIdentity, address: String, dir_port: u16) -> Self {
        Voter {
            nickname,
            identity,
            address,
            dir_port,
            contact: None,
            signatures: Vec::new(),
        }
    }
    /// Set the contact line for this voter.
    pub fn set_contact(&mut self, contact: String) {
        self.contact = Some(contact);
    }
    /// Add a signature made by this voter.
    pub fn add_signature(&mut self, sig: VoterSignature) {
        self.signatures.push(sig);
    }
    /// Return this voter's nickname.
    pub fn nickname(&self) -> &str {
        &self.nickname
    }
    /// Return this voter's identity digest.
    pub fn identity(&self) -> &RsaIdentity {
        &self.identity
    }
    /// Return this voter's address.
    pub fn address(&self) -> &str {
        &self.address
    }
    /// Return this voter's directory port.
    pub fn dir_port(&self) -> u16 {
        self.dir_port
    }
    /// Return this voter's contact line, if it gave one.
    pub fn contact(&self) -> Option<&str> {
        self.contact.as_deref()
    }
    /// Return the signatures this voter made.
    pub fn signatures(&self) -> &[VoterSignature] {
        &self.signatures
    }
    /// Return the signatures this voter made, mutably.
    pub(crate) fn signatures_mut(&mut self) -> &mut [VoterSignature] {
        &mut self.signatures
    }
}

/// A parsed consensus networkstatus document.
///
/// Once installed as current, a consensus is immutable except for the
/// per-entry download bookkeeping and the lazily-built descriptor
/// digest index.
#[derive(Debug, Clone)]
pub struct Consensus {
    /// The flavor of this consensus.
    flavor: ConsensusFlavor,
    /// The time over which this consensus is valid.
    lifetime: Lifetime,
    /// Digests of the signed portion, one per supported algorithm.
    digests: DocDigests,
    /// The voters that contributed to this consensus, in document
    /// order.
    voters: Vec<Voter>,
    /// Router status entries, sorted by ascending identity digest.
    relays: Vec<RouterStatus>,
    /// Declared network parameters.
    params: NetParams,
    /// Bandwidth weight parameters from the footer.
    bw_weights: NetParams,
    /// Recommended client software versions.
    client_versions: Vec<String>,
    /// Recommended relay software versions.
    relay_versions: Vec<String>,
    /// Lazily built map from descriptor digest to index in `relays`.
    desc_index: OnceCell<HashMap<DocDigest, usize>>,
}

impl Consensus {
    /// Construct a new consensus with no voters or relays.
    pub fn new(flavor: ConsensusFlavor, lifetime: Lifetime, digests: DocDigests) -> Self {
        Consensus {
            flavor,
            lifetime,
            digests,
            voters: Vec::new(),
            relays: Vec::new(),
            params: NetParams::new(),
            bw_weights: NetParams::new(),
            client_versions: Vec::new(),
            relay_versions: Vec::new(),
            desc_index: OnceCell::new(),
        }
    }

    /// Add a voter to this consensus.
    pub fn add_voter(&mut self, voter: Voter) {
        self.voters.push(voter);
    }

    /// Append a router status entry.
    ///
    /// Entries must arrive sorted by strictly ascending identity
    /// digest; within one consensus, identities are unique.
    pub fn add_relay(&mut self, rs: RouterStatus) -> Result<()> {
        if let Some(prev) = self.relays.last() {
            if prev.identity() >= rs.identity() {
                return Err(Error::BadParse("router statuses not sorted by identity"));
            }
        }
        self.relays.push(rs);
        Ok(())
    }

    /// Set the network parameters for this consensus.
    pub fn set_params(&mut self, params: NetParams) {
        self.params = params;
    }
    /// Set the bandwidth-weight parameters for this consensus.
    pub fn set_bw_weights(&mut self, weights: NetParams) {
        self.bw_weights = weights;
    }
    /// Set the recommended client and relay versions.
    pub fn set_recommended_versions(&mut self, client: Vec<String>, relay: Vec<String>) {
        self.client_versions = client;
        self.relay_versions = relay;
    }

    /// Return the flavor of this consensus.
    pub fn flavor(&self) -> ConsensusFlavor {
        self.flavor
    }
    /// Return the lifetime of this consensus.
    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }
    /// Return the digests of this consensus's signed portion.
    pub fn digests(&self) -> &DocDigests {
        &self.digests
    }
    /// Return the voters listed on this consensus.
    pub fn voters(&self) -> &[Voter] {
        &self.voters
    }
    /// Return the digests of the document, and the voter list mutably.
    ///
    /// (Signature checking needs to read the one while marking flags
    /// on the other.)
    pub(crate) fn digests_and_voters_mut(&mut self) -> (&DocDigests, &mut [Voter]) {
        (&self.digests, &mut self.voters)
    }
    /// Return all the router status entries in this consensus.
    pub fn relays(&self) -> &[RouterStatus] {
        &self.relays
    }
    /// Return all the router status entries, mutably.
    pub(crate) fn relays_mut(&mut self) -> &mut [RouterStatus] {
        &mut self.relays
    }
    /// Return the network parameters of this consensus.
    pub fn params(&self) -> &NetParams {
        &self.params
    }
    /// Return the bandwidth-weight parameters of this consensus.
    pub fn bw_weights(&self) -> &NetParams {
        &self.bw_weights
    }
    /// Return the recommended client versions.
    pub fn client_versions(&self) -> &[String] {
        &self.client_versions
    }
    /// Return the recommended relay versions.
    pub fn relay_versions(&self) -> &[String] {
        &self.relay_versions
    }

    /// Return true if this consensus is live at `now`.
    pub fn is_live(&self, now: SystemTime) -> bool {
        self.lifetime.is_live(now)
    }
    /// Return true if this consensus is live or only recently expired
    /// at `now`.
    pub fn is_reasonably_live(&self, now: SystemTime) -> bool {
        self.lifetime.is_reasonably_live(now)
    }

    /// Find the entry whose identity digest is `id`, using binary
    /// search over the sorted entry list.
    pub fn relay_by_id(&self, id: &RsaIdentity) -> Option<&RouterStatus> {
        self.relays
            .binary_search_by(|rs| rs.identity().cmp(id))
            .ok()
            .map(|idx| &self.relays[idx])
    }
    /// As `relay_by_id`, but return a mutable reference.
    pub(crate) fn relay_by_id_mut(&mut self, id: &RsaIdentity) -> Option<&mut RouterStatus> {
        let idx = self.relays.binary_search_by(|rs| rs.identity().cmp(id)).ok()?;
        self.relays.get_mut(idx)
    }

    /// Return the map from descriptor digest to entry index, building
    /// it the first time it is needed.
    fn desc_index(&self) -> &HashMap<DocDigest, usize> {
        self.desc_index.get_or_init(|| {
            self.relays
                .iter()
                .enumerate()
                .map(|(idx, rs)| (*rs.desc_digest(), idx))
                .collect()
        })
    }
    /// Find the entry whose descriptor digest is `d`.
    pub fn relay_by_desc_digest(&self, d: &DocDigest) -> Option<&RouterStatus> {
        let idx = self.desc_index().get(d).copied()?;
        self.relays.get(idx)
    }
    /// As `relay_by_desc_digest`, but return a mutable reference.
    ///
    /// This is safe to call after the index is built, since the
    /// descriptor digests of installed entries never change.
    pub(crate) fn relay_by_desc_digest_mut(&mut self, d: &DocDigest) -> Option<&mut RouterStatus> {
        let idx = self.desc_index().get(d).copied()?;
        self.relays.get_mut(idx)
    }

    /// Look up a named integer parameter, clamped into `min..=max`.
    pub fn param(&self, name: &str, default: i32, min: i32, max: i32) -> i32 {
        self.params.get_clamped(name, default, min, max)
    }
    /// Look up a bandwidth-weight parameter, clamped into `0..=max`.
    pub fn bw_weight(&self, name: &str, default: i32, max: i32) -> i32 {
        self.bw_weights.get_clamped(name, default, 0, max)
    }
}

/// A legacy "v2" networkstatus document, as published by a single
/// directory authority.
///
/// These are obsolete on the live network, but directory caches still
/// mirror them for old clients.
#[derive(Debug, Clone)]
pub struct V2Status {
    /// Identity digest of the authority that published this document.
    identity: RsaIdentity,
    /// When the authority published this document.
    published_on: SystemTime,
    /// Digest of the document itself, for duplicate suppression.
    digest: [u8; 20],
    /// Address the document says it was served from, for diagnostics.
    source_address: String,
    /// Directory port the document says it was served from.
    source_dirport: u16,
    /// When we received this document.  Set by the cache, clamped to
    /// the present.
    received_on: Option<SystemTime>,
    /// Router entries listed in this document, sorted by identity.
    entries: Vec<RouterStatus>,
}

impl V2Status {
    /// Construct a new v2 status document record.
    pub fn new(
        identity: RsaIdentity,
        published_on: SystemTime,
        digest: [u8; 20],
        source_address: String,
        source_dirport: u16,
    ) -> Self {
        V2Status {
            identity,
            published_on,
            digest,
            source_address,
            source_dirport,
            received_on: None,
            entries: Vec::new(),
        }
    }
    /// Append a router entry; entries must be sorted by identity.
    pub fn add_entry(&mut self, rs: RouterStatus) -> Result<()> {
        if let Some(prev) = self.entries.last() {
            if prev.identity() >= rs.identity() {
                return Err(Error::BadParse("v2 status entries not sorted by identity"));
            }
        }
        self.entries.push(rs);
        Ok(())
    }
    /// Return the identity of the authority that published this
    /// document.
    pub fn identity(&self) -> &RsaIdentity {
        &self.identity
    }
    /// Return the publication time of this document.
    pub fn published_on(&self) -> SystemTime {
        self.published_on
    }
    /// Return the digest of this document.
    pub fn digest(&self) -> &[u8; 20] {
        &self.digest
    }
    /// Return the address this document claims it was served from.
    pub fn source_address(&self) -> &str {
        &self.source_address
    }
    /// Return the port this document claims it was served from.
    pub fn source_dirport(&self) -> u16 {
        self.source_dirport
    }
    /// Return the time at which we received this document.
    pub fn received_on(&self) -> Option<SystemTime> {
        self.received_on
    }
    /// Record the time at which we received this document.
    pub(crate) fn set_received_on(&mut self, when: SystemTime) {
        self.received_on = Some(when);
    }
    /// Return the router entries in this document.
    pub fn entries(&self) -> &[RouterStatus] {
        &self.entries
    }
    /// Find the entry whose identity digest is `id`.
    pub fn entry_by_id(&self, id: &RsaIdentity) -> Option<&RouterStatus> {
        self.entries
            .binary_search_by(|rs| rs.identity().cmp(id))
            .ok()
            .map(|idx| &self.entries[idx])
    }
}
