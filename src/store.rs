//! Holding the current consensus, and the one we hope to verify.
//!
//! For each flavor there is at most one *current* consensus, and at
//! most one *parked* consensus sitting in the cert-waiting slot until
//! enough authority certificates show up to verify it.  Installs are
//! strictly monotonic in valid-after time within a flavor; the parked
//! consensus, if any, is always newer than the current one.

use crate::doc::Consensus;
use crate::ids::RsaIdentity;
use crate::retry::DownloadStatus;

use std::time::{Duration, SystemTime};

/// After this long past its valid-until time, a consensus loaded from
/// the disk cache is too old to bother with.
pub(crate) const OLD_ROUTER_DESC_MAX_AGE: Duration = Duration::from_secs(5 * 24 * 60 * 60);

/// If a consensus appears more than this far before its declared
/// valid-after time, our clock is probably skewed.
pub(crate) const EARLY_CONSENSUS_NOTICE_SKEW: Duration = Duration::from_secs(60);

/// Options controlling one call to
/// [`DirectoryState::set_current_consensus`](crate::DirectoryState::set_current_consensus).
#[derive(Debug, Clone, Copy, Default)]
pub struct SetConsensusOptions {
    /// The document came from our own disk cache; don't write it back
    /// out, and don't treat acceptance as a download success.
    pub from_cache: bool,
    /// The document already went through the cert-waiting slot, so
    /// skip warnings we already issued for it.
    pub was_waiting_for_certs: bool,
    /// Don't launch certificate downloads, even if we could use more
    /// certificates.
    pub dont_download_certs: bool,
    /// Accept the document even if it expired long ago.  (Used for
    /// fallback bootstrap files.)
    pub accept_obsolete: bool,
    /// Fail instead of adapting when the document's flavor isn't the
    /// one we asked for.
    pub require_flavor: bool,
}

impl SetConsensusOptions {
    /// Options for a document freshly downloaded from the network.
    pub fn from_download() -> Self {
        SetConsensusOptions::default()
    }
    /// Options for a document loaded from our own disk cache.
    pub fn from_cache() -> Self {
        SetConsensusOptions {
            from_cache: true,
            dont_download_certs: true,
            ..Default::default()
        }
    }
}

/// What a successful `set_current_consensus` call did with the
/// document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusChange {
    /// The document was verified and installed as current.
    Installed,
    /// The document was parked in the cert-waiting slot until more
    /// certificates arrive.
    Parked,
}

/// A consensus parked in the cert-waiting slot.
#[derive(Debug)]
pub(crate) struct PendingConsensus {
    /// The parsed document.
    pub(crate) consensus: Consensus,
    /// The bytes it was parsed from, kept for re-running the install
    /// protocol once certificates arrive.
    pub(crate) body: Vec<u8>,
    /// When the document was parked.
    pub(crate) set_at: SystemTime,
    /// Set once we've waited so long for certificates that the
    /// scheduler is allowed to fetch a fresh consensus instead.
    pub(crate) dl_failed: bool,
}

/// Everything we track for one consensus flavor.
#[derive(Debug, Default)]
pub(crate) struct FlavorState {
    /// The current consensus, if we have one.
    pub(crate) current: Option<Consensus>,
    /// A consensus waiting for certificates, if any.
    pub(crate) waiting: Option<PendingConsensus>,
    /// Download status for fetches of this flavor.
    pub(crate) dl_status: DownloadStatus,
    /// When we next plan to fetch this flavor, if scheduled.
    pub(crate) next_download_time: Option<SystemTime>,
}

/// Copy all the ancillary information (download statuses and 503
/// timestamps) from `old_c` to `new_c`.
///
/// Both relay lists are sorted by identity, so this is a linear
/// merge.  A download status carries over only when the entry still
/// refers to the same descriptor.
pub(crate) fn copy_old_consensus_info(new_c: &mut Consensus, old_c: &Consensus) {
    let old_relays = old_c.relays();
    let mut old_i = 0;
    for rs_new in new_c.relays_mut() {
        while old_i < old_relays.len() && old_relays[old_i].identity() < rs_new.identity() {
            old_i += 1;
        }
        let rs_old = match old_relays.get(old_i) {
            Some(rs) if rs.identity() == rs_new.identity() => rs,
            _ => continue,
        };
        rs_new.set_last_dir_503_at(rs_old.last_dir_503_at());
        if rs_old.desc_digest() == rs_new.desc_digest() {
            // Same descriptor too, so the download bookkeeping still
            // applies.
            rs_new.copy_dl_status_from(rs_old);
        }
    }
}

/// Return the identities of every entry in `new_c` that was added or
/// changed relative to `old_c`.
pub(crate) fn changed_entries(old_c: Option<&Consensus>, new_c: &Consensus) -> Vec<RsaIdentity> {
    let old_c = match old_c {
        Some(c) => c,
        None => return new_c.relays().iter().map(|rs| *rs.identity()).collect(),
    };
    let mut changed = Vec::new();
    let old_relays = old_c.relays();
    let mut old_i = 0;
    for rs_new in new_c.relays() {
        while old_i < old_relays.len() && old_relays[old_i].identity() < rs_new.identity() {
            old_i += 1;
        }
        match old_relays.get(old_i) {
            Some(rs_old) if rs_old.identity() == rs_new.identity() => {
                if rs_new.has_changed(rs_old) {
                    changed.push(*rs_new.identity());
                }
            }
            _ => changed.push(*rs_new.identity()),
        }
    }
    changed
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::doc::{ConsensusFlavor, DocDigests, Lifetime, RelayFlags, RouterStatus};
    use crate::ids::DocDigest;

    fn t(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn consensus(entries: Vec<RouterStatus>) -> Consensus {
        let lt = Lifetime::new(t(1000), t(2000), t(3000)).unwrap();
        let mut c = Consensus::new(ConsensusFlavor::Microdesc, lt, DocDigests::default());
        for rs in entries {
            c.add_relay(rs).unwrap();
        }
        c
    }

    fn rs(idbyte: u8, descbyte: u8) -> RouterStatus {
        RouterStatus::new(
            RsaIdentity::from_bytes(&[idbyte; 20]).unwrap(),
            DocDigest::Sha256([descbyte; 32]),
            format!("r{}", idbyte),
            "192.0.2.5".parse().unwrap(),
            9001,
            0,
        )
    }

    #[test]
    fn ancillary_state_carries_over() {
        let now = t(1500);
        let mut old = consensus(vec![rs(1, 1), rs(2, 2), rs(3, 3)]);
        for entry in old.relays_mut() {
            entry.set_last_dir_503_at(Some(now));
            entry.dl_status_mut().note_failure(now);
        }

        // Entry 2 changed its descriptor; entry 4 is new.
        let mut new = consensus(vec![rs(1, 1), rs(2, 22), rs(4, 4)]);
        copy_old_consensus_info(&mut new, &old);

        let relays = new.relays();
        // Same identity, same descriptor: everything carries over.
        assert_eq!(relays[0].last_dir_503_at(), Some(now));
        assert_eq!(relays[0].dl_status().n_failures(), 1);
        // Same identity, new descriptor: 503 time carries, download
        // status doesn't.
        assert_eq!(relays[1].last_dir_503_at(), Some(now));
        assert_eq!(relays[1].dl_status().n_failures(), 0);
        // New identity: nothing carries over.
        assert_eq!(relays[2].last_dir_503_at(), None);
        assert_eq!(relays[2].dl_status().n_failures(), 0);
    }

    #[test]
    fn diff_finds_added_and_changed() {
        let old = consensus(vec![rs(1, 1), rs(2, 2), rs(3, 3)]);
        let mut changed_rs = rs(2, 2);
        changed_rs.set_flags(RelayFlags::EXIT);
        let new = consensus(vec![rs(1, 1), changed_rs, rs(5, 5)]);

        let changed = changed_entries(Some(&old), &new);
        assert_eq!(
            changed,
            vec![
                RsaIdentity::from_bytes(&[2; 20]).unwrap(),
                RsaIdentity::from_bytes(&[5; 20]).unwrap(),
            ]
        );
    }

    #[test]
    fn diff_without_previous_lists_everything() {
        let new = consensus(vec![rs(1, 1), rs(2, 2)]);
        assert_eq!(changed_entries(None, &new).len(), 2);
    }
}
