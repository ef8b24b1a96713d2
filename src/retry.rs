//! Retry timing for failed directory downloads.
//!
//! Every downloadable resource carries a [`DownloadStatus`]: a count
//! of consecutive failures and the earliest time at which another
//! attempt is allowed.  The delay between attempts follows a fixed,
//! capped schedule, so that a resource that keeps failing backs off
//! to a plateau instead of hammering the directory servers.
//!
//! For a more full specification, see [`dir-spec.txt`].
//!
//! [`dir-spec.txt`]: https://spec.torproject.org/dir-spec

use std::time::{Duration, SystemTime};

/// How many times will we try to fetch a consensus before the retry
/// schedule plateaus?
pub const CONSENSUS_NETWORKSTATUS_MAX_DL_TRIES: u8 = 8;

/// How many times will we try to fetch a single microdescriptor
/// before the retry schedule plateaus?
pub const MAX_MICRODESC_DOWNLOAD_TRIES: u8 = 8;

/// Delay schedule, in seconds, indexed by the number of consecutive
/// failures so far.  Failures past the end of the table keep using the
/// final entry.
const DL_SCHEDULE: &[u64] = &[0, 0, 60, 300, 600, 1800, 3600, 7200];

/// Per-resource retry record: how many times in a row a download has
/// failed, and when we may next try it.
#[derive(Debug, Clone)]
pub struct DownloadStatus {
    /// Consecutive failures since the last success or reset.
    n_failures: u8,
    /// Earliest time at which another attempt is allowed.
    next_attempt_at: SystemTime,
}

impl Default for DownloadStatus {
    fn default() -> Self {
        DownloadStatus {
            n_failures: 0,
            next_attempt_at: SystemTime::UNIX_EPOCH,
        }
    }
}

impl DownloadStatus {
    /// Return true if we are allowed to launch another attempt at
    /// `now`, given a cap of `max_failures` consecutive failures.
    pub fn is_ready(&self, now: SystemTime, max_failures: u8) -> bool {
        self.n_failures <= max_failures && self.next_attempt_at <= now
    }

    /// Record a failed attempt at `now`, and compute the next allowed
    /// attempt time from the backoff schedule.
    pub fn note_failure(&mut self, now: SystemTime) -> SystemTime {
        self.n_failures = self.n_failures.saturating_add(1);
        let idx = usize::from(self.n_failures).min(DL_SCHEDULE.len() - 1);
        self.next_attempt_at = now + Duration::from_secs(DL_SCHEDULE[idx]);
        self.next_attempt_at
    }

    /// Record a success: clear the failure count and allow an
    /// immediate attempt.
    pub fn note_success(&mut self) {
        self.n_failures = 0;
        self.next_attempt_at = SystemTime::UNIX_EPOCH;
    }

    /// Return the number of consecutive failures so far.
    pub fn n_failures(&self) -> u8 {
        self.n_failures
    }

    /// Return the earliest time at which another attempt is allowed.
    pub fn next_attempt_at(&self) -> SystemTime {
        self.next_attempt_at
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn t(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn fresh_status_is_ready() {
        let dls = DownloadStatus::default();
        assert!(dls.is_ready(t(0), CONSENSUS_NETWORKSTATUS_MAX_DL_TRIES));
        assert_eq!(dls.n_failures(), 0);
    }

    #[test]
    fn backoff_schedule() {
        let mut dls = DownloadStatus::default();
        let now = t(100_000);

        // First two failures retry immediately; later ones back off.
        assert_eq!(dls.note_failure(now), now);
        assert_eq!(dls.note_failure(now), now + Duration::from_secs(60));
        assert_eq!(dls.note_failure(now), now + Duration::from_secs(300));
        assert_eq!(dls.n_failures(), 3);

        // The schedule plateaus at its final entry.
        for _ in 0..20 {
            dls.note_failure(now);
        }
        assert_eq!(dls.next_attempt_at(), now + Duration::from_secs(7200));
    }

    #[test]
    fn next_attempt_never_precedes_failure() {
        let mut dls = DownloadStatus::default();
        let now = t(5_000);
        for _ in 0..10 {
            let next = dls.note_failure(now);
            assert!(next >= now);
        }
    }

    #[test]
    fn readiness_gating() {
        let mut dls = DownloadStatus::default();
        let now = t(100_000);
        dls.note_failure(now);
        dls.note_failure(now);
        // Two failures: not ready again for 60 seconds.
        assert!(!dls.is_ready(now, CONSENSUS_NETWORKSTATUS_MAX_DL_TRIES));
        assert!(dls.is_ready(now + Duration::from_secs(60), 8));

        // Too many failures: not ready no matter how long we wait.
        for _ in 0..10 {
            dls.note_failure(now);
        }
        assert!(!dls.is_ready(now + Duration::from_secs(86400), 8));

        // Success resets everything.
        dls.note_success();
        assert!(dls.is_ready(now, 8));
        assert_eq!(dls.n_failures(), 0);
    }
}
