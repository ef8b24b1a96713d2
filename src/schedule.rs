//! Deciding when to download directory documents.
//!
//! A consensus stays useful for a while after a better one exists, so
//! nobody should fetch its replacement the instant it stops being
//! fresh.  Instead, every party picks a uniformly random time inside
//! a window that depends on its role: caches fetch soon after
//! freshness ends so clients can fetch from them, ordinary clients
//! spread themselves over the middle of the validity period, and
//! bridge clients wait for the ordinary clients to finish.
//!
//! The arithmetic here matches dir-spec: "This time is chosen
//! uniformly at random from the interval between the time 3/4 into
//! the first interval after the consensus is no longer fresh, and 7/8
//! of the time remaining after that before the consensus is invalid."

use crate::config::NetstatusConfig;
use crate::doc::Lifetime;
use crate::ids::MdDigest;

use rand::Rng;
use std::collections::HashSet;
use std::time::{Duration, SystemTime};
use tracing::info;

/// How long do we hang onto a possibly live consensus for which we're
/// fetching certs before we check whether there is a better one?
pub const DELAY_WHILE_FETCHING_CERTS: Duration = Duration::from_secs(20 * 60);

/// How long do we (as a cache) wait after a consensus stops being
/// fresh before trying to fetch another?
pub const CONSENSUS_MIN_SECONDS_BEFORE_CACHING: Duration = Duration::from_secs(120);

/// How frequently do v2 directory authorities re-fetch each other's
/// status documents?
pub const AUTHORITY_NS_CACHE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// How frequently do non-authority directory caches re-fetch v2
/// status documents?
pub const NONAUTHORITY_NS_CACHE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// How many microdescriptor digests fit in a single request?
const MAX_MD_PER_REQUEST: usize = 92;

/// What kind of document a fetch is for.
///
/// Used both to launch fetches and to suppress duplicates of ones
/// already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum FetchPurpose {
    /// A consensus document; the resource names the flavor.
    Consensus,
    /// Authority signing-key certificates.
    Certificates,
    /// A legacy v2 status document.
    V2Status,
    /// A batch of microdescriptors.
    Microdesc,
}

/// The transport this crate uses to fetch directory documents.
///
/// Implementations wrap whatever connection machinery the hosting
/// application has.  Fetches are fire-and-forget from our side:
/// results come back through
/// [`DirectoryState::set_current_consensus`](crate::DirectoryState::set_current_consensus)
/// and its siblings, and failures through
/// [`DirectoryState::consensus_download_failed`](crate::DirectoryState::consensus_download_failed).
pub trait DirTransport {
    /// Start fetching `resource` for `purpose`.
    fn launch_fetch(&mut self, purpose: FetchPurpose, resource: &str);
    /// Return true if a fetch with this purpose (and, if given, this
    /// resource) is already in progress.
    fn in_flight(&self, purpose: FetchPurpose, resource: Option<&str>) -> bool;
    /// Return the digests of every microdescriptor currently being
    /// fetched.
    fn pending_microdescs(&self) -> HashSet<MdDigest>;
}

/// Compute the time window in which we should fetch the successor of
/// a consensus with lifetime `lt`: returns the window's start and
/// length.
pub(crate) fn fetch_window(lt: &Lifetime, config: &NetstatusConfig) -> (SystemTime, Duration) {
    /// Whole seconds from `a` to `b`, or 0 if `b` precedes `a`.
    fn secs_between(a: SystemTime, b: SystemTime) -> u64 {
        b.duration_since(a).map(|d| d.as_secs()).unwrap_or(0)
    }

    let interval = lt.voting_interval().as_secs();
    // Usually we allow a 2-minute slop factor in case clocks get
    // desynchronized a little.  On a private network with a
    // crazy-fast voting interval, 2 minutes may be too much.
    let slop = CONSENSUS_MIN_SECONDS_BEFORE_CACHING
        .as_secs()
        .min(interval / 16);

    let (start, mut dl_interval);
    if config.fetches_dir_info_early() {
        // We want to cache the next consensus at some point soon
        // after this one stops being fresh...
        start = lt.fresh_until() + Duration::from_secs(slop);
        if config.fetch_dir_info_extra_early() || config.authority_v3() {
            // Some caches need the consensus sooner than others.
            if slop + 60 > interval {
                dl_interval = interval / 2;
            } else {
                dl_interval = 60;
            }
        } else {
            // ...but only in the first half-interval after that.
            dl_interval = interval / 2;
        }
    } else {
        // We're an ordinary client.  Give all the caches enough time
        // to download the consensus...
        let client_start = lt.fresh_until() + Duration::from_secs(interval * 3 / 4);
        // ...but download the next one well before this one expires.
        let client_interval = secs_between(client_start, lt.valid_until()) * 7 / 8;
        if config.fetches_dir_info_later() {
            // We're a bridge client: pick from the rest of the
            // interval *after* the ordinary clients, ending just
            // before the consensus expires.
            start = client_start + Duration::from_secs(client_interval + slop);
            dl_interval = secs_between(start, lt.valid_until()).saturating_sub(slop);
        } else {
            start = client_start;
            dl_interval = client_interval;
        }
    }
    if dl_interval < 1 {
        dl_interval = 1;
    }
    let dl_interval = Duration::from_secs(dl_interval);

    // We must not try to replace the consensus while it's still
    // fresh, and we must replace it before it expires.
    debug_assert!(lt.fresh_until() < start);
    debug_assert!(start + dl_interval < lt.valid_until());

    (start, dl_interval)
}

/// Pick the randomized time at which to start fetching the successor
/// of a consensus with lifetime `lt`.
pub(crate) fn pick_download_time<R: Rng>(
    lt: &Lifetime,
    config: &NetstatusConfig,
    rng: &mut R,
) -> SystemTime {
    let (start, dl_interval) = fetch_window(lt, config);
    let offset = rng.gen_range(0..dl_interval.as_secs().max(1));
    let when = start + Duration::from_secs(offset);
    info!(
        "Consensus expires at {:?}; fetching the next one at {:?}.",
        lt.valid_until(),
        when
    );
    when
}

/// Return the v2 refresh interval for our role.
pub(crate) fn v2_cache_interval(config: &NetstatusConfig) -> Duration {
    if config.authority_v2() {
        AUTHORITY_NS_CACHE_INTERVAL
    } else {
        NONAUTHORITY_NS_CACHE_INTERVAL
    }
}

/// Split a list of missing microdescriptor digests into per-request
/// resource strings.
pub(crate) fn microdesc_resources(missing: &[MdDigest]) -> Vec<String> {
    missing
        .chunks(MAX_MD_PER_REQUEST)
        .map(|chunk| {
            let joined: Vec<String> = chunk
                .iter()
                .map(|d| base64::encode_config(d, base64::STANDARD_NO_PAD))
                .collect();
            format!("d/{}", joined.join("-"))
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::NetstatusConfigBuilder;
    use std::path::Path;

    fn t(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn cfg(f: impl FnOnce(&mut NetstatusConfigBuilder)) -> NetstatusConfig {
        let mut b = NetstatusConfigBuilder::new();
        b.set_data_directory(Path::new("/nonexistent"));
        f(&mut b);
        b.finalize().unwrap()
    }

    /// A standard lifetime: one hour fresh, three hours valid.
    fn lifetime() -> Lifetime {
        Lifetime::new(t(0), t(3600), t(3 * 3600)).unwrap()
    }

    #[test]
    fn client_window() {
        let c = cfg(|_| {});
        let (start, ival) = fetch_window(&lifetime(), &c);
        // 3/4 into the first interval after freshness ends.
        assert_eq!(start, t(3600 + 2700));
        // 7/8 of the remaining time.
        assert_eq!(ival, Duration::from_secs((10800 - 6300) * 7 / 8));
        assert!(start + ival < t(10800));
    }

    #[test]
    fn cache_window() {
        let c = cfg(|b| b.directory_cache = true);
        let (start, ival) = fetch_window(&lifetime(), &c);
        assert_eq!(start, t(3600 + 120));
        assert_eq!(ival, Duration::from_secs(1800));
    }

    #[test]
    fn extra_early_window() {
        let c = cfg(|b| {
            b.directory_cache = true;
            b.fetch_dir_info_extra_early = true;
        });
        let (start, ival) = fetch_window(&lifetime(), &c);
        assert_eq!(start, t(3600 + 120));
        assert_eq!(ival, Duration::from_secs(60));
    }

    #[test]
    fn tiny_interval_shrinks_slop() {
        // A 160-second voting interval makes the slop 10 seconds, not
        // two minutes.
        let lt = Lifetime::new(t(0), t(160), t(480)).unwrap();
        let c = cfg(|b| b.directory_cache = true);
        let (start, _) = fetch_window(&lt, &c);
        assert_eq!(start, t(170));
    }

    #[test]
    fn bridge_window_after_clients() {
        let c_client = cfg(|_| {});
        let c_bridge = cfg(|b| b.use_bridges = true);
        let lt = lifetime();
        let (client_start, client_ival) = fetch_window(&lt, &c_client);
        let (bridge_start, bridge_ival) = fetch_window(&lt, &c_bridge);
        // Bridges start after the whole client window, plus slop.
        assert_eq!(
            bridge_start,
            client_start + client_ival + Duration::from_secs(120)
        );
        // And still finish before the consensus expires.
        assert!(bridge_start + bridge_ival < lt.valid_until());
        assert!(bridge_ival >= Duration::from_secs(1));
    }

    #[test]
    fn random_pick_in_window() {
        let c = cfg(|_| {});
        let lt = lifetime();
        let (start, ival) = fetch_window(&lt, &c);
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let when = pick_download_time(&lt, &c, &mut rng);
            assert!(when >= start);
            assert!(when < start + ival);
            assert!(when > lt.fresh_until());
            assert!(when < lt.valid_until());
        }
    }

    #[test]
    fn md_resource_chunking() {
        let missing: Vec<MdDigest> = (0..200_u8).map(|i| [i; 32]).collect();
        let resources = microdesc_resources(&missing);
        assert_eq!(resources.len(), 3); // 92 + 92 + 16
        assert!(resources[0].starts_with("d/"));
        assert_eq!(resources[0].matches('-').count(), 91);
        assert_eq!(resources[2].matches('-').count(), 15);
        // Base64 of a 32-byte digest, without padding.
        let first = &resources[0][2..][..43];
        assert_eq!(base64::decode_config(first, base64::STANDARD_NO_PAD).unwrap(), vec![0_u8; 32]);
    }

    #[test]
    fn v2_intervals() {
        let c = cfg(|b| b.authority_v2 = true);
        assert_eq!(v2_cache_interval(&c), Duration::from_secs(600));
        let c = cfg(|b| b.directory_cache = true);
        assert_eq!(v2_cache_interval(&c), Duration::from_secs(3600));
    }
}
