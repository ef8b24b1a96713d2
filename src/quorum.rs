//! Checking consensus signatures against a quorum of authorities.
//!
//! A consensus document is believable when more than half of the
//! authorities we recognize have good signatures on it.  Working that
//! out is subtler than it sounds: signatures may be made with signing
//! keys whose certificates we haven't fetched yet, by authorities we
//! don't recognize at all, or with digest algorithms we don't support.
//! The checker classifies every voter and decides whether the right
//! move is to accept, to wait for more certificates, or to reject.
//!
//! The cryptography itself lives behind [`AuthorityCert`]: the code
//! here never touches a key, only compares digests.

use crate::authority::{id_is_recognized, Authority};
use crate::doc::{Consensus, DocDigests, VoterSignature};
use crate::ids::{CertKeyIds, RsaIdentity};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{info, warn};

/// An authority's signing-key certificate, as much of it as signature
/// checking needs.
///
/// Implementations live in the certificate store, which is external
/// to this crate.
pub trait AuthorityCert {
    /// Return the digest of the authority's long-term identity key.
    fn identity(&self) -> &RsaIdentity;
    /// Return the digest of the signing key this certificate endorses.
    fn signing_key_digest(&self) -> &RsaIdentity;
    /// Return the expiration time of this certificate.
    fn expires(&self) -> SystemTime;
    /// Check `signature` against the signing key, and return the
    /// digest it signed, or None if the signature is not well-formed.
    ///
    /// (This is raw public-key signature recovery; deciding whether
    /// the recovered digest matches any document is the caller's
    /// business.)
    fn checksig(&self, signature: &[u8]) -> Option<Vec<u8>>;
    /// Return both key digests together.
    fn key_ids(&self) -> CertKeyIds {
        CertKeyIds {
            id_fingerprint: *self.identity(),
            sk_fingerprint: *self.signing_key_digest(),
        }
    }
}

/// The certificate store this crate consults.
///
/// Fetching and validating certificates is somebody else's job; we
/// only ask what is available now, and nudge the store when we notice
/// we're missing something.
pub trait CertStore {
    /// Return the certificate matching both digests in `ids`, if the
    /// store has it.
    fn lookup(&self, ids: &CertKeyIds) -> Option<Arc<dyn AuthorityCert>>;
    /// Return true if a recent attempt to download a certificate for
    /// `id` failed, so another one is unlikely to appear soon.
    fn dl_looks_uncertain(&self, id: &RsaIdentity) -> bool;
    /// Start fetching whatever certificates `consensus` needs that the
    /// store doesn't have.
    fn fetch_missing(&mut self, consensus: &Consensus, now: SystemTime);
}

/// The outcome of checking a consensus against the recognized
/// authorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumResult {
    /// Every recognized authority has a good signature on the
    /// document.
    AllGood,
    /// A majority of recognized authorities have good signatures.
    Enough,
    /// Not enough good signatures yet, but fetching missing
    /// certificates might get us to a majority.
    NeedCerts,
    /// This document can never be signed enough.
    Insufficient,
}

impl QuorumResult {
    /// Return true if the document may be installed now.
    pub fn is_sufficient(&self) -> bool {
        matches!(self, QuorumResult::AllGood | QuorumResult::Enough)
    }
}

/// How loudly should the quorum checker complain about problems?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Log nothing at all.
    Quiet,
    /// Warn only if the document can't reach a quorum.
    WarnIfFailing,
    /// Warn about every problem found.
    WarnAll,
}

/// Check one signature against one certificate.
///
/// Preconditions: the signature's signing-key digest and identity
/// digest must both match the certificate; if they don't, return false
/// without classifying the signature.  Otherwise set exactly one of
/// the signature's good/bad flags and return true.
pub fn check_signature(
    digests: &DocDigests,
    sig: &mut VoterSignature,
    cert: &dyn AuthorityCert,
) -> bool {
    if sig.signing_key_digest() != cert.signing_key_digest()
        || sig.identity_digest() != cert.identity()
    {
        return false;
    }

    let dlen = sig.alg().digest_len();
    let ok = match (cert.checksig(sig.signature()), digests.get(sig.alg())) {
        (Some(recovered), Some(expected)) => {
            recovered.len() >= dlen && recovered[..dlen] == expected[..dlen]
        }
        _ => false,
    };

    if ok {
        sig.mark_good();
    } else {
        warn!("Got a bad signature on a networkstatus consensus");
        sig.mark_bad();
    }
    true
}

/// What one voter contributed toward the quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VoterClass {
    /// At least one of the voter's signatures verified.
    Good,
    /// The voter's checkable signatures all failed verification.
    Bad,
    /// We lack the certificates to check the voter's signatures.
    MissingCert {
        /// True if a recent cert download for this voter failed.
        dl_failed: bool,
    },
    /// The voter is not an authority we recognize.
    Unknown,
    /// The voter supplied no usable signature at all.
    NoSignature,
}

/// Classify a single voter's signatures, checking whatever is not yet
/// checked against the certificate store.
fn classify_voter(
    digests: &DocDigests,
    voter_identity: &RsaIdentity,
    sigs: &mut [VoterSignature],
    authorities: &[Authority],
    certs: &dyn CertStore,
    now: SystemTime,
) -> VoterClass {
    let mut good_here = false;
    let mut bad_here = false;
    let mut unknown_here = false;
    let mut missing_key_here = false;
    let mut dl_failed_key_here = false;

    for sig in sigs.iter_mut() {
        if !sig.is_checked() && !sig.signature().is_empty() {
            // The parser guarantees this; a violation would mean we
            // are checking a signature against the wrong voter.
            debug_assert_eq!(sig.identity_digest(), voter_identity);

            if !id_is_recognized(authorities, sig.identity_digest()) {
                unknown_here = true;
                continue;
            }
            let ids = CertKeyIds {
                id_fingerprint: *sig.identity_digest(),
                sk_fingerprint: *sig.signing_key_digest(),
            };
            let usable_cert = match certs.lookup(&ids) {
                Some(cert) if cert.expires() >= now => Some(cert),
                _ => None,
            };
            // A missing or expired cert, or one whose digests don't
            // line up, all leave the signature uncheckable.
            let checked = match usable_cert {
                Some(cert) => check_signature(digests, sig, &*cert),
                None => false,
            };
            if !checked {
                missing_key_here = true;
                if certs.dl_looks_uncertain(sig.identity_digest()) {
                    dl_failed_key_here = true;
                }
                continue;
            }
        }
        if sig.is_good() {
            good_here = true;
        } else if sig.is_bad() {
            bad_here = true;
        }
    }

    if good_here {
        VoterClass::Good
    } else if bad_here {
        VoterClass::Bad
    } else if missing_key_here {
        VoterClass::MissingCert {
            dl_failed: dl_failed_key_here,
        }
    } else if unknown_here {
        VoterClass::Unknown
    } else {
        VoterClass::NoSignature
    }
}

/// Check every as-yet-unchecked signature on `consensus`, and decide
/// whether the document has a quorum of good signatures.
///
/// Signature good/bad flags are updated in place; everything else is
/// read-only.  The result is a pure function of the voters, their
/// signatures, the certificate store, the clock, and the authority
/// list.
pub fn check_consensus_signatures(
    consensus: &mut Consensus,
    authorities: &[Authority],
    certs: &dyn CertStore,
    now: SystemTime,
    verbosity: Verbosity,
) -> QuorumResult {
    let n_authorities = authorities.len();
    let n_required = n_authorities / 2 + 1;

    let mut n_good = 0_usize;
    let mut n_bad = 0_usize;
    let mut n_missing_key = 0_usize;
    let mut n_dl_failed_key = 0_usize;
    let mut n_unknown = 0_usize;
    let mut n_no_signature = 0_usize;

    let mut list_good: Vec<String> = Vec::new();
    let mut list_no_signature: Vec<String> = Vec::new();
    let mut unrecognized: Vec<String> = Vec::new();
    let mut need_certs_from: Vec<String> = Vec::new();

    let mut voter_ids: HashSet<RsaIdentity> = HashSet::new();

    let (digests, voters) = consensus.digests_and_voters_mut();
    for voter in voters.iter_mut() {
        let identity = *voter.identity();
        voter_ids.insert(identity);
        let nickname = voter.nickname().to_string();
        let describe = format!(
            "'{}' at {}:{} (identity {})",
            nickname,
            voter.address(),
            voter.dir_port(),
            identity
        );
        match classify_voter(
            digests,
            &identity,
            voter.signatures_mut(),
            authorities,
            certs,
            now,
        ) {
            VoterClass::Good => {
                n_good += 1;
                list_good.push(nickname);
            }
            VoterClass::Bad => n_bad += 1,
            VoterClass::MissingCert { dl_failed } => {
                n_missing_key += 1;
                if dl_failed {
                    n_dl_failed_key += 1;
                }
                need_certs_from.push(describe);
            }
            VoterClass::Unknown => {
                n_unknown += 1;
                unrecognized.push(describe);
            }
            VoterClass::NoSignature => {
                n_no_signature += 1;
                list_no_signature.push(nickname);
            }
        }
    }

    // Now see whether any recognized authority is missing from the
    // voter list entirely.
    let missing_authorities: Vec<&str> = authorities
        .iter()
        .filter(|a| !voter_ids.contains(a.v3ident()))
        .map(|a| a.name())
        .collect();

    let certainly_failing =
        n_good + n_missing_key - n_dl_failed_key < n_required;
    let warn = match verbosity {
        Verbosity::Quiet => None,
        Verbosity::WarnIfFailing => Some(certainly_failing),
        Verbosity::WarnAll => Some(true),
    };

    if let Some(warn) = warn {
        /// Log one diagnostic line at the chosen severity.
        macro_rules! diag {
            ($($arg:tt)*) => {
                if warn {
                    warn!($($arg)*);
                } else {
                    info!($($arg)*);
                }
            };
        }
        for v in &unrecognized {
            diag!("Consensus includes unrecognized authority {}", v);
        }
        for v in &need_certs_from {
            diag!(
                "Looks like we need to download a new certificate from authority {}",
                v
            );
        }
        for name in &missing_authorities {
            diag!("Consensus does not include configured authority '{}'", name);
        }
        let mut summary = format!(
            "A consensus needs {} good signatures from recognized authorities \
             for us to accept it. This one has {} ({}).",
            n_required,
            n_good,
            list_good.join(" ")
        );
        if n_no_signature > 0 {
            summary.push_str(&format!(
                " {} ({}) of the authorities we know didn't sign it.",
                n_no_signature,
                list_no_signature.join(" ")
            ));
        }
        if n_unknown > 0 {
            summary.push_str(&format!(
                " It has {} signatures from authorities we don't recognize.",
                n_unknown
            ));
        }
        if n_bad > 0 {
            summary.push_str(&format!(
                " {} of the signatures on it didn't verify correctly.",
                n_bad
            ));
        }
        if n_missing_key > 0 {
            summary.push_str(&format!(
                " We were unable to check {} of the signatures, because we were \
                 missing the keys.",
                n_missing_key
            ));
        }
        diag!("{}", summary);
    }

    if n_good == n_authorities {
        QuorumResult::AllGood
    } else if n_good >= n_required {
        QuorumResult::Enough
    } else if n_good + n_missing_key >= n_required
        && n_good + n_missing_key - n_dl_failed_key >= n_required
    {
        QuorumResult::NeedCerts
    } else {
        QuorumResult::Insufficient
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::doc::{ConsensusFlavor, DigestAlgorithm, Lifetime, Voter};
    use std::collections::HashMap;
    use std::time::Duration;

    fn t(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    /// A fake certificate whose `checksig` "recovers" whatever bytes
    /// the signature contains.  A signature is thus "good" whenever
    /// its bytes equal the document digest.
    struct FakeCert {
        identity: RsaIdentity,
        sk: RsaIdentity,
        expires: SystemTime,
    }
    impl AuthorityCert for FakeCert {
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

    #[derive(Default)]
    struct FakeCertStore {
        certs: HashMap<CertKeyIds, Arc<FakeCert>>,
        uncertain: HashSet<RsaIdentity>,
    }
    impl FakeCertStore {
        fn add(&mut self, idbyte: u8, expires: SystemTime) {
            let identity: RsaIdentity = [idbyte; 20].into();
            let sk: RsaIdentity = [idbyte ^ 0xff; 20].into();
            let cert = FakeCert {
                identity,
                sk,
                expires,
            };
            self.certs.insert(cert.key_ids(), Arc::new(cert));
        }
    }
    impl CertStore for FakeCertStore {
        fn lookup(&self, ids: &CertKeyIds) -> Option<Arc<dyn AuthorityCert>> {
            self.certs
                .get(ids)
                .map(|c| Arc::clone(c) as Arc<dyn AuthorityCert>)
        }
        fn dl_looks_uncertain(&self, id: &RsaIdentity) -> bool {
            self.uncertain.contains(id)
        }
        fn fetch_missing(&mut self, _consensus: &Consensus, _now: SystemTime) {}
    }

    const DOC_DIGEST: [u8; 32] = [0xd1; 32];

    fn authorities(n: u8) -> Vec<Authority> {
        (1..=n)
            .map(|i| Authority::new(format!("auth{}", i), [i; 20].into()))
            .collect()
    }

    /// Build a consensus signed by the authorities in `good`, with
    /// garbage signatures from `bad`, and unchecked signatures from
    /// `signers_without_effect`.
    fn consensus_signed_by(good: &[u8], bad: &[u8], missing: &[u8]) -> Consensus {
        let lt = Lifetime::new(t(1000), t(2000), t(3000)).unwrap();
        let digests = DocDigests::new(None, Some(DOC_DIGEST));
        let mut c = Consensus::new(ConsensusFlavor::Microdesc, lt, digests);
        let mut add_voter = |i: u8, sigbytes: Vec<u8>| {
            let identity: RsaIdentity = [i; 20].into();
            let sk: RsaIdentity = [i ^ 0xff; 20].into();
            let mut v = Voter::new(
                format!("auth{}", i),
                identity,
                "192.0.2.1".into(),
                80,
            );
            v.add_signature(VoterSignature::new(
                DigestAlgorithm::Sha256,
                identity,
                sk,
                sigbytes,
            ));
            c.add_voter(v);
        };
        for i in good {
            add_voter(*i, DOC_DIGEST.to_vec());
        }
        for i in bad {
            add_voter(*i, vec![0x00; 32]);
        }
        for i in missing {
            add_voter(*i, DOC_DIGEST.to_vec());
        }
        c
    }

    fn store_with_certs(ids: &[u8]) -> FakeCertStore {
        let mut store = FakeCertStore::default();
        for i in ids {
            store.add(*i, t(1_000_000));
        }
        store
    }

    #[test]
    fn all_good() {
        let auths = authorities(3);
        let store = store_with_certs(&[1, 2, 3]);
        let mut c = consensus_signed_by(&[1, 2, 3], &[], &[]);
        let r = check_consensus_signatures(&mut c, &auths, &store, t(5000), Verbosity::Quiet);
        assert_eq!(r, QuorumResult::AllGood);
        for v in c.voters() {
            assert!(v.signatures().iter().any(|s| s.is_good() && !s.is_bad()));
        }
    }

    #[test]
    fn enough_but_not_all() {
        // 5 good of 9 authorities: quorum is 5.
        let auths = authorities(9);
        let store = store_with_certs(&[1, 2, 3, 4, 5]);
        let mut c = consensus_signed_by(&[1, 2, 3, 4, 5], &[], &[]);
        let r = check_consensus_signatures(&mut c, &auths, &store, t(5000), Verbosity::Quiet);
        assert_eq!(r, QuorumResult::Enough);
        assert!(r.is_sufficient());
    }

    #[test]
    fn quorum_sizes() {
        // |A| = 1 requires 1 good signature.
        let auths = authorities(1);
        let store = store_with_certs(&[1]);
        let mut c = consensus_signed_by(&[1], &[], &[]);
        let r = check_consensus_signatures(&mut c, &auths, &store, t(5000), Verbosity::Quiet);
        assert_eq!(r, QuorumResult::AllGood);

        // |A| = 9 requires 5; 4 good is not sufficient.
        let auths = authorities(9);
        let store = store_with_certs(&[1, 2, 3, 4]);
        let mut c = consensus_signed_by(&[1, 2, 3, 4], &[], &[]);
        let r = check_consensus_signatures(&mut c, &auths, &store, t(5000), Verbosity::Quiet);
        assert_eq!(r, QuorumResult::Insufficient);
    }

    #[test]
    fn need_more_certs() {
        // 3 good, 2 known authorities whose certs we lack: we might
        // reach the quorum of 5 by fetching certificates.
        let auths = authorities(9);
        let store = store_with_certs(&[1, 2, 3]);
        let mut c = consensus_signed_by(&[1, 2, 3], &[], &[4, 5]);
        let r = check_consensus_signatures(&mut c, &auths, &store, t(5000), Verbosity::Quiet);
        assert_eq!(r, QuorumResult::NeedCerts);
        assert!(!r.is_sufficient());
    }

    #[test]
    fn failed_cert_downloads_give_up() {
        // Same as need_more_certs, but the missing certs have failing
        // downloads: waiting for them would be pointless.
        let auths = authorities(9);
        let mut store = store_with_certs(&[1, 2, 3]);
        store.uncertain.insert([4_u8; 20].into());
        let mut c = consensus_signed_by(&[1, 2, 3], &[], &[4, 5]);
        let r = check_consensus_signatures(&mut c, &auths, &store, t(5000), Verbosity::Quiet);
        assert_eq!(r, QuorumResult::Insufficient);
    }

    #[test]
    fn bad_signatures_do_not_count() {
        let auths = authorities(3);
        let store = store_with_certs(&[1, 2, 3]);
        let mut c = consensus_signed_by(&[1], &[2, 3], &[]);
        let r = check_consensus_signatures(&mut c, &auths, &store, t(5000), Verbosity::Quiet);
        assert_eq!(r, QuorumResult::Insufficient);
        // The bad voters' signatures are flagged bad, not good.
        let bads: usize = c
            .voters()
            .iter()
            .flat_map(|v| v.signatures())
            .filter(|s| s.is_bad())
            .count();
        assert_eq!(bads, 2);
    }

    #[test]
    fn unknown_authorities_ignored() {
        // Signatures from identities outside the authority set don't
        // help, no matter how many there are.
        let auths = authorities(3);
        let store = store_with_certs(&[1, 40, 41, 42]);
        let mut c = consensus_signed_by(&[1, 40, 41, 42], &[], &[]);
        let r = check_consensus_signatures(&mut c, &auths, &store, t(5000), Verbosity::Quiet);
        assert_eq!(r, QuorumResult::Insufficient);
    }

    #[test]
    fn expired_cert_is_missing() {
        let auths = authorities(1);
        let mut store = FakeCertStore::default();
        store.add(1, t(10));
        let mut c = consensus_signed_by(&[1], &[], &[]);
        // The only cert expired long before `now`.
        let r = check_consensus_signatures(&mut c, &auths, &store, t(5000), Verbosity::Quiet);
        assert_eq!(r, QuorumResult::NeedCerts);
    }

    #[test]
    fn checking_is_idempotent() {
        // Re-running the checker classifies already-checked
        // signatures the same way.
        let auths = authorities(3);
        let store = store_with_certs(&[1, 2, 3]);
        let mut c = consensus_signed_by(&[1, 2], &[3], &[]);
        let r1 = check_consensus_signatures(&mut c, &auths, &store, t(5000), Verbosity::Quiet);
        let r2 = check_consensus_signatures(&mut c, &auths, &store, t(5000), Verbosity::Quiet);
        assert_eq!(r1, r2);
        assert_eq!(r1, QuorumResult::Enough);
    }

    #[test]
    fn cert_mismatch_rejected_without_classifying() {
        let digests = DocDigests::new(None, Some(DOC_DIGEST));
        let identity: RsaIdentity = [1_u8; 20].into();
        let cert = FakeCert {
            identity,
            sk: [2_u8; 20].into(),
            expires: t(1_000_000),
        };
        let mut sig = VoterSignature::new(
            DigestAlgorithm::Sha256,
            identity,
            // Signing key digest doesn't match the cert.
            [3_u8; 20].into(),
            DOC_DIGEST.to_vec(),
        );
        assert!(!check_signature(&digests, &mut sig, &cert));
        assert!(!sig.is_checked());
    }
}
