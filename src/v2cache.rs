//! Cache of legacy per-authority ("v2") status documents.
//!
//! No current client uses these, but directory caches keep mirroring
//! them for the benefit of old ones.  We hold one document per v2
//! authority, replace it only with a strictly newer publication from
//! the same authority, and sweep out documents that pass the
//! configured age limit.

use crate::config::NetstatusConfig;
use crate::doc::V2Status;
use crate::event::{DirEvent, Publisher};
use crate::ids::{DocDigest, RsaIdentity};
use crate::retry::DownloadStatus;
use crate::storage::DirStore;
use crate::{DocumentParser, Result};

use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

/// How far in the future may a v2 status document be dated before we
/// refuse to cache it?
pub const NETWORKSTATUS_ALLOW_SKEW: Duration = Duration::from_secs(24 * 60 * 60);

/// Retain any descriptor mentioned in a v2 status document for at
/// least this long after the document's publication time.
pub const V2_NETWORKSTATUS_ROUTER_LIFETIME: Duration = Duration::from_secs(3 * 60 * 60);

/// Where a v2 status document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum V2Source {
    /// Loaded from our own disk cache.
    FromCache,
    /// Fetched from an authority by fingerprint.
    FromDirByFp,
    /// Fetched from an authority that was asked for every status it
    /// knows ("all").
    FromDirAll,
}

/// The in-memory v2 status cache.
pub(crate) struct V2Cache {
    /// Cached documents, sorted by ascending publication time for
    /// deterministic iteration.
    list: Vec<V2Status>,
    /// Download status for every descriptor digest mentioned by any
    /// cached v2 document.
    dl_status_map: HashMap<DocDigest, DownloadStatus>,
    /// Per-authority download status for the status documents
    /// themselves.
    auth_dl_status: HashMap<RsaIdentity, DownloadStatus>,
    /// True when `list` changed and `dl_status_map` needs a refresh.
    has_changed: bool,
}

impl V2Cache {
    /// Construct an empty v2 cache.
    pub(crate) fn new() -> Self {
        V2Cache {
            list: Vec::new(),
            dl_status_map: HashMap::new(),
            auth_dl_status: HashMap::new(),
            has_changed: false,
        }
    }

    /// Return the cached documents, oldest publication first.
    pub(crate) fn list(&self) -> &[V2Status] {
        &self.list
    }

    /// Return the cached document from the authority with `identity`.
    pub(crate) fn get_by_identity(&self, identity: &RsaIdentity) -> Option<&V2Status> {
        self.list.iter().find(|ns| ns.identity() == identity)
    }

    /// Return the per-authority download status record for `identity`,
    /// creating it if needed.
    pub(crate) fn auth_dl_status(&mut self, identity: &RsaIdentity) -> &mut DownloadStatus {
        self.auth_dl_status.entry(*identity).or_default()
    }

    /// Handle a v2 status document in `s` that we received at
    /// `arrived_at` from `source`: parse it, decide whether we want
    /// it, and cache it as appropriate.
    ///
    /// If `requested_fingerprints` is provided, it holds uppercased
    /// hex identity fingerprints; documents we never asked for are
    /// dropped, and fingerprints we did receive are removed from the
    /// list.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn set_status(
        &mut self,
        s: &[u8],
        arrived_at: SystemTime,
        source: V2Source,
        mut requested_fingerprints: Option<&mut Vec<String>>,
        config: &NetstatusConfig,
        parser: &dyn DocumentParser,
        store: &DirStore,
        events: &Publisher,
        now: SystemTime,
    ) -> Result<()> {
        if !config.caches_v2_dir_info() {
            // Don't bother storing it.
            return Ok(());
        }

        let mut ns = match parser.parse_v2_status(s) {
            Ok(ns) => ns,
            Err(e) => {
                warn!("Couldn't parse network status.");
                return Err(e);
            }
        };
        let identity = *ns.identity();
        let fp = hex::encode(identity.as_bytes()).to_uppercase();
        let trusted = config
            .authorities()
            .iter()
            .any(|a| a.publishes_v2() && a.v3ident() == &identity);

        // A document can't have arrived in the future.
        let arrived_at = arrived_at.min(now);
        ns.set_received_on(arrived_at);

        if ns.published_on() > now + NETWORKSTATUS_ALLOW_SKEW {
            let delta = crate::clock_delta(now, ns.published_on());
            warn!(
                "Network status from {} was published in the future. Check your \
                 time and date settings! Not caching.",
                fp
            );
            events.send(DirEvent::ClockSkew {
                min_skew: delta,
                source: format!(
                    "NETWORKSTATUS:{}:{}",
                    ns.source_address(),
                    ns.source_dirport()
                ),
            });
            return Ok(());
        }

        if matches!(source, V2Source::FromDirByFp | V2Source::FromDirAll)
            && config.own_identity() == Some(&identity)
        {
            // Don't replace our own status when we get it from
            // somebody else.
            return Ok(());
        }

        if let Some(req) = requested_fingerprints.as_deref_mut() {
            if let Some(idx) = req.iter().position(|r| r == &fp) {
                req.remove(idx);
            } else if source != V2Source::FromDirAll {
                warn!(
                    "We received a network status with a fingerprint ({}) that we \
                     never requested. Dropping.",
                    fp
                );
                return Ok(());
            }
        }

        if !trusted {
            // We're a cache and an authority told us about an
            // authority we don't recognize; mirror it anyway.
            info!(
                "We do not recognize authority ({}) but we are willing to cache it.",
                fp
            );
            self.write_to_disk(&ns, s, source, store);
            return Ok(());
        }

        if let Some(idx) = self.list.iter().position(|old| old.identity() == &identity) {
            let old = &self.list[idx];
            if old.digest() == ns.digest() {
                // Same one we had before.
                info!("Not replacing network-status from {}; we already have it.", fp);
                if old.received_on().map(|t| t < arrived_at).unwrap_or(true) {
                    if source != V2Source::FromCache {
                        // We use the file mtime to tell when this
                        // arrived, so refresh it.
                        self.write_to_disk(&ns, s, source, store);
                    }
                    self.list[idx].set_received_on(arrived_at);
                }
                self.auth_dl_status(&identity).note_failure(now);
                return Ok(());
            } else if old.published_on() >= ns.published_on() {
                info!(
                    "Not replacing network-status from {}; we have a newer one for \
                     this authority.",
                    fp
                );
                self.auth_dl_status(&identity).note_failure(now);
                return Ok(());
            } else {
                self.list[idx] = ns;
            }
        } else {
            self.list.push(ns);
        }

        if source != V2Source::FromCache {
            self.auth_dl_status(&identity).note_success();
        }

        self.has_changed = true;
        self.list
            .sort_by_key(|ns| (ns.published_on(), *ns.identity()));

        if let Some(stored) = self.get_by_identity(&identity) {
            self.write_to_disk(stored, s, source, store);
        }

        Ok(())
    }

    /// Write a v2 status to the disk cache, unless it came from there.
    fn write_to_disk(&self, ns: &V2Status, s: &[u8], source: V2Source, store: &DirStore) {
        if source == V2Source::FromCache {
            return;
        }
        if let Err(e) = store.ensure_v2_status_dir() {
            warn!("Couldn't create v2 status directory: {}", e);
            return;
        }
        store.write_doc(&store.v2_status_fname(ns.identity()), s);
    }

    /// Remove every document older than the configured age limit,
    /// both from memory and from disk.
    pub(crate) fn clean(&mut self, now: SystemTime, max_age: Duration, store: &DirStore) {
        let mut removed = Vec::new();
        self.list.retain(|ns| {
            if ns.published_on() + max_age > now {
                true
            } else {
                removed.push(*ns.identity());
                false
            }
        });
        for identity in removed {
            let fname = store.v2_status_fname(&identity);
            info!("Removing too-old networkstatus in {:?}", fname);
            store.remove_doc(&fname);
            self.has_changed = true;
        }
    }

    /// Rebuild the per-descriptor download status map so it has an
    /// entry for every descriptor listed in any cached v2 document,
    /// preserving the status of descriptors that stay listed.
    ///
    /// Does nothing unless the document list changed since the last
    /// call.
    pub(crate) fn refresh_download_status_map(&mut self) {
        if !self.has_changed {
            return;
        }
        let mut fresh: HashMap<DocDigest, DownloadStatus> = HashMap::new();
        for ns in &self.list {
            for rs in ns.entries() {
                let d = *rs.desc_digest();
                if fresh.contains_key(&d) {
                    continue;
                }
                let status = self.dl_status_map.remove(&d).unwrap_or_default();
                fresh.insert(d, status);
            }
        }
        self.dl_status_map = fresh;
        self.has_changed = false;
    }

    /// Return the download status record for the descriptor digest
    /// `d`, if any v2 document lists it.
    pub(crate) fn desc_dl_status(&mut self, d: &DocDigest) -> Option<&mut DownloadStatus> {
        self.dl_status_map.get_mut(d)
    }

    /// Return the latest time any v2 document vouches for the
    /// descriptor with digest `d`.
    pub(crate) fn desc_listed_until(&self, d: &DocDigest) -> Option<SystemTime> {
        self.list
            .iter()
            .filter(|ns| ns.entries().iter().any(|rs| rs.desc_digest() == d))
            .map(|ns| ns.published_on() + V2_NETWORKSTATUS_ROUTER_LIFETIME)
            .max()
    }

    /// Reset the failure count on every download status we hold.
    pub(crate) fn reset_download_failures(&mut self) {
        for status in self.dl_status_map.values_mut() {
            status.note_success();
        }
        for status in self.auth_dl_status.values_mut() {
            status.note_success();
        }
    }
}
