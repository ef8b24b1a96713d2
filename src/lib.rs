//! Code to fetch, validate, and cache network status documents.
//!
//! To use the network, a client needs an up-to-date, authenticated
//! consensus document describing the currently usable relays,
//! together with the per-relay microdescriptors it refers to.  This
//! crate is responsible for deciding when to download those
//! documents, checking that enough directory authorities have signed
//! them, keeping them cached on disk, and exposing the current view
//! to the rest of the application.
//!
//! Parsing document bytes, storing authority certificates, and moving
//! bytes over the network are all somebody else's job: this crate
//! reaches them through the [`DocumentParser`], [`CertStore`], and
//! [`DirTransport`] traits.
//!
//! All state lives in a single [`DirectoryState`] value, mutated only
//! from the hosting application's main task.

#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]

pub mod authority;
mod config;
mod doc;
mod err;
mod event;
mod getinfo;
mod ids;
mod mdcache;
mod names;
mod quorum;
mod retry;
mod schedule;
mod storage;
mod store;
#[cfg(test)]
pub(crate) mod testing;
mod v2cache;

use crate::doc::FlavorPair;
use crate::event::Publisher;
use crate::mdcache::MicrodescCache;
use crate::names::NicknameMaps;
use crate::storage::{DirStore, InputBytes};
use crate::store::{FlavorState, PendingConsensus, EARLY_CONSENSUS_NOTICE_SKEW, OLD_ROUTER_DESC_MAX_AGE};

use std::collections::HashSet;
use std::path::Path;
use std::time::SystemTime;
use tracing::{info, warn};

pub use authority::Authority;
pub use config::{NetstatusConfig, NetstatusConfigBuilder, UseMicrodescriptors};
pub use doc::{
    Consensus, ConsensusFlavor, DigestAlgorithm, DocDigests, Lifetime, NetParams, RelayFlags,
    RouterStatus, V2Status, VersionCaps, Voter, VoterSignature, ALL_FLAVORS, REASONABLY_LIVE_TIME,
};
pub use err::{Error, Result};
pub use event::DirEvent;
pub use ids::{CertKeyIds, DocDigest, MdDigest, RsaIdentity};
pub use mdcache::{
    AllowAnnotations, Microdesc, ParsedMicrodesc, SavedLocation, TOLERATE_MICRODESC_AGE,
};
pub use quorum::{AuthorityCert, CertStore, QuorumResult, Verbosity};
pub use retry::{DownloadStatus, CONSENSUS_NETWORKSTATUS_MAX_DL_TRIES};
pub use schedule::{DirTransport, FetchPurpose, DELAY_WHILE_FETCHING_CERTS};
pub use store::{ConsensusChange, SetConsensusOptions};
pub use v2cache::{V2Source, NETWORKSTATUS_ALLOW_SKEW, V2_NETWORKSTATUS_ROUTER_LIFETIME};

/// The parser that turns document bytes into the structured types of
/// this crate.
///
/// Implemented externally; the formats themselves are opaque here.
pub trait DocumentParser {
    /// Parse a consensus document of either flavor.
    ///
    /// The parser must fill in the content digests, the lifetime, the
    /// voter list with signatures, and the router entries sorted by
    /// identity.
    fn parse_consensus(&self, input: &[u8]) -> Result<Consensus>;
    /// Parse a legacy v2 status document.
    fn parse_v2_status(&self, input: &[u8]) -> Result<V2Status>;
    /// Parse a concatenated batch of microdescriptors, optionally
    /// preceded by `@last-listed` annotations.
    fn parse_microdescs(
        &self,
        input: &[u8],
        allow: AllowAnnotations,
    ) -> Result<Vec<ParsedMicrodesc>>;
}

/// The node list that consumes what this crate learns.
///
/// Nodes keep handles to microdescriptors rather than owning them;
/// the cache's reference counters are maintained through
/// [`DirectoryState::microdesc_held_by_node`] and
/// [`DirectoryState::microdesc_dropped_by_node`].
pub trait NodeList {
    /// A new consensus was installed; re-project the node list from
    /// it.
    fn set_consensus(&mut self, consensus: &Consensus);
    /// A new microdescriptor is available.
    fn add_microdesc(&mut self, digest: &MdDigest, body: &[u8]);
    /// Return the digest of every microdescriptor any node currently
    /// uses, once per using node.
    fn md_digests_in_use(&self) -> Vec<MdDigest>;
    /// Return true if we currently know at least one bridge.
    fn any_bridges_known(&self) -> bool;
    /// Return true if some configured bridge can't serve
    /// microdescriptors.
    fn any_bridge_lacks_md_support(&self) -> bool;
    /// Return entries for the routers with the given purpose (the
    /// bridge-listing path), or None if the purpose is unknown.
    fn statuses_by_purpose(&self, purpose: &str) -> Option<Vec<RouterStatus>>;
}

/// A source of wall-clock time.
///
/// All time comparisons in this crate go through one of these, so
/// tests can freeze the clock.
pub trait WallClock {
    /// Return the current time.
    fn now(&self) -> SystemTime;
}

/// The real system clock.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Seconds from `doc_time` to `now`: negative when the document comes
/// from our future, meaning our clock is probably behind.
pub(crate) fn clock_delta(now: SystemTime, doc_time: SystemTime) -> i64 {
    match now.duration_since(doc_time) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// All the state of the consensus directory subsystem.
///
/// One of these exists per process; every store described in the
/// module docs hangs off it, and all mutation happens through its
/// methods on the main task.
pub struct DirectoryState {
    /// Configuration for the whole subsystem.
    config: NetstatusConfig,
    /// Handle to our on-disk cache.
    store: DirStore,
    /// Per-flavor current consensus, cert-waiting slot, and download
    /// bookkeeping.
    flavors: FlavorPair<FlavorState>,
    /// When we last tried to refresh the v2 status cache.
    last_v2_attempt: Option<SystemTime>,
    /// The `named`/`unnamed` nickname maps for the current consensus.
    names: NicknameMaps,
    /// The microdescriptor cache.
    mdcache: MicrodescCache,
    /// The legacy v2 status cache.
    v2cache: v2cache::V2Cache,
    /// Publisher for directory events.
    events: Publisher,
    /// Set once we've warned that our version is obsolete.
    warned_old_version: bool,
    /// Set once we've warned that our version is newer than any
    /// recommended one.
    warned_new_version: bool,
    /// Nicknames we've already warned about looking up unofficially.
    warned_name_lookups: HashSet<String>,
    /// The external document parser.
    parser: Box<dyn DocumentParser>,
    /// The external certificate store.
    certs: Box<dyn CertStore>,
    /// The external directory transport.
    transport: Box<dyn DirTransport>,
    /// The external node list.
    nodes: Box<dyn NodeList>,
    /// Where the time comes from.
    clock: Box<dyn WallClock>,
}

impl DirectoryState {
    /// Construct a DirectoryState from a configuration and its
    /// external collaborators, using the system clock.
    pub fn new(
        config: NetstatusConfig,
        parser: Box<dyn DocumentParser>,
        certs: Box<dyn CertStore>,
        transport: Box<dyn DirTransport>,
        nodes: Box<dyn NodeList>,
    ) -> Result<Self> {
        Self::with_clock(config, parser, certs, transport, nodes, Box::new(SystemClock))
    }

    /// As [`new`](Self::new), but with an explicit clock.
    pub fn with_clock(
        config: NetstatusConfig,
        parser: Box<dyn DocumentParser>,
        certs: Box<dyn CertStore>,
        transport: Box<dyn DirTransport>,
        nodes: Box<dyn NodeList>,
        clock: Box<dyn WallClock>,
    ) -> Result<Self> {
        let store = DirStore::open(config.data_directory())?;
        let mdcache = MicrodescCache::new(&store);
        Ok(DirectoryState {
            config,
            store,
            flavors: FlavorPair::default(),
            last_v2_attempt: None,
            names: NicknameMaps::new(),
            mdcache,
            v2cache: v2cache::V2Cache::new(),
            events: Publisher::new(),
            warned_old_version: false,
            warned_new_version: false,
            warned_name_lookups: HashSet::new(),
            parser,
            certs,
            transport,
            nodes,
            clock,
        })
    }

    /// Return a receiver for the stream of [`DirEvent`]s this state
    /// publishes.
    pub fn events(&self) -> postage::broadcast::Receiver<DirEvent> {
        self.events.subscribe()
    }

    /// Return the configuration in use.
    pub fn config(&self) -> &NetstatusConfig {
        &self.config
    }

    /// Return the consensus flavor we use for our own purposes.
    pub fn usable_flavor(&self) -> ConsensusFlavor {
        self.config
            .usable_consensus_flavor(self.nodes.any_bridge_lacks_md_support())
    }

    /// Return the most recent consensus of the flavor we use, if we
    /// have one.
    pub fn latest_consensus(&self) -> Option<&Consensus> {
        self.latest_consensus_by_flavor(self.usable_flavor())
    }

    /// Return the most recent consensus of `flavor`, if we have one.
    pub fn latest_consensus_by_flavor(&self, flavor: ConsensusFlavor) -> Option<&Consensus> {
        self.flavors.get(flavor).current.as_ref()
    }

    /// Return the current consensus of the flavor we use, but only if
    /// it is live right now.
    pub fn live_consensus(&self) -> Option<&Consensus> {
        let now = self.clock.now();
        self.latest_consensus().filter(|c| c.is_live(now))
    }

    /// Return the current consensus of `flavor` if it is live, or
    /// expired by no more than a day.
    ///
    /// (Clients that spend a while fetching a new consensus shouldn't
    /// totally lose in the meantime.)
    pub fn reasonably_live_consensus(&self, flavor: ConsensusFlavor) -> Option<&Consensus> {
        let now = self.clock.now();
        self.latest_consensus_by_flavor(flavor)
            .filter(|c| c.is_reasonably_live(now))
    }

    /// Return true if we have a consensus for the flavor we use, but
    /// not enough certificates to start using it yet.
    pub fn consensus_is_waiting_for_certs(&self) -> bool {
        self.flavors.get(self.usable_flavor()).waiting.is_some()
    }

    /// Return the identity that `nickname` is officially mapped to by
    /// the current consensus, if any.
    pub fn router_digest_by_nickname(&self, nickname: &str) -> Option<&RsaIdentity> {
        self.names.lookup_named(nickname)
    }

    /// Return true if `nickname` may not be used to refer to any
    /// relay.
    pub fn nickname_is_unnamed(&self, nickname: &str) -> bool {
        self.names.is_unnamed(nickname)
    }

    /// Try to replace the current consensus of `flavor` with the one
    /// encoded in `bytes`.
    ///
    /// On success, the document was either installed
    /// ([`ConsensusChange::Installed`]) or parked to wait for
    /// certificates ([`ConsensusChange::Parked`]).  On failure, the
    /// error's [`bumps_failure_count`](Error::bumps_failure_count)
    /// says whether the caller should treat this as a download
    /// failure.
    pub fn set_current_consensus(
        &mut self,
        bytes: &[u8],
        flavor: ConsensusFlavor,
        options: &SetConsensusOptions,
    ) -> Result<ConsensusChange> {
        let now = self.clock.now();

        // Make sure it's parseable.
        let mut c = match self.parser.parse_consensus(bytes) {
            Ok(c) => c,
            Err(e) => {
                warn!("Unable to parse networkstatus consensus");
                return Err(e);
            }
        };

        let mut flavor = flavor;
        if c.flavor() != flavor {
            // This wasn't the flavor we thought we were getting.
            if options.require_flavor {
                warn!(
                    "Got consensus with unexpected flavor {} (wanted {})",
                    c.flavor().name(),
                    flavor.name()
                );
                return Err(Error::WrongFlavor {
                    expected: flavor.name(),
                    got: c.flavor().name(),
                });
            }
            flavor = c.flavor();
        }

        let usable = self.usable_flavor();
        if flavor != usable && !self.config.caches_dir_info() {
            // This consensus is totally boring to us: we won't use
            // it, and we won't serve it.
            return Err(Error::Unwanted("consensus flavor we neither use nor serve"));
        }

        if options.from_cache
            && !options.accept_obsolete
            && c.lifetime().valid_until() + OLD_ROUTER_DESC_MAX_AGE < now
        {
            info!("Loaded an expired consensus. Discarding.");
            return Err(Error::Obsolete);
        }

        if let Some(cur) = self.flavors.get(flavor).current.as_ref() {
            if cur.digests() == c.digests() {
                // We already have this one.  That's a failure.
                info!("Got a {} consensus we already have", flavor.name());
                return Err(Error::Duplicate);
            }
            if c.lifetime().valid_after() <= cur.lifetime().valid_after() {
                // We have a newer one.  There's no point in accepting
                // this one, even if it's great.
                info!(
                    "Got a {} consensus at least as old as the one we have",
                    flavor.name()
                );
                return Err(Error::Stale);
            }
        }

        // Make sure it's signed enough.
        let verbosity = if options.was_waiting_for_certs {
            Verbosity::Quiet
        } else {
            Verbosity::WarnIfFailing
        };
        let quorum = quorum::check_consensus_signatures(
            &mut c,
            self.config.authorities(),
            &*self.certs,
            now,
            verbosity,
        );
        match quorum {
            QuorumResult::Insufficient => {
                // This can never be signed enough: kill it.
                if !options.was_waiting_for_certs {
                    warn!("Not enough good signatures on networkstatus consensus");
                }
                if options.was_waiting_for_certs && options.from_cache {
                    let fname = self.store.unverified_fname(flavor);
                    self.store.remove_doc(&fname);
                }
                return Err(Error::InsufficientSignatures);
            }
            QuorumResult::NeedCerts => {
                // Okay, so it _might_ be signed enough if we get more
                // certificates.
                let c_valid_after = c.lifetime().valid_after();
                let slot = self.flavors.get(flavor);
                let newer_than_current = slot
                    .current
                    .as_ref()
                    .map(|cur| c_valid_after > cur.lifetime().valid_after())
                    .unwrap_or(true);
                let newer_than_parked = slot
                    .waiting
                    .as_ref()
                    .map(|w| c_valid_after > w.consensus.lifetime().valid_after())
                    .unwrap_or(true);
                if newer_than_current && newer_than_parked {
                    if !options.was_waiting_for_certs {
                        info!("Not enough certificates to check networkstatus consensus");
                    }
                    if !options.from_cache {
                        let fname = self.store.unverified_fname(flavor);
                        self.store.write_doc(&fname, bytes);
                    }
                    if !options.dont_download_certs {
                        self.certs.fetch_missing(&c, now);
                    }
                    self.flavors.get_mut(flavor).waiting = Some(PendingConsensus {
                        consensus: c,
                        body: bytes.to_vec(),
                        set_at: now,
                        dl_failed: false,
                    });
                    // Not a success or a failure until we get the
                    // certs or fail to.
                    return Ok(ConsensusChange::Parked);
                } else {
                    // Even if we had enough signatures, we'd never
                    // use this as the latest consensus.
                    if options.was_waiting_for_certs && options.from_cache {
                        let fname = self.store.unverified_fname(flavor);
                        self.store.remove_doc(&fname);
                    }
                    return Err(Error::Stale);
                }
            }
            QuorumResult::AllGood | QuorumResult::Enough => {}
        }

        if !options.from_cache && flavor == usable {
            self.events.send(DirEvent::ConsensusArrived);
        }

        // Are we missing any certificates at all?
        if quorum != QuorumResult::AllGood && !options.dont_download_certs {
            self.certs.fetch_missing(&c, now);
        }

        if flavor == usable {
            let changed = store::changed_entries(self.flavors.get(flavor).current.as_ref(), &c);
            self.events.send(DirEvent::NewConsensus { flavor });
            self.events.send(DirEvent::NetworkStatusChanged { changed });
        }

        {
            let slot = self.flavors.get_mut(flavor);
            if let Some(old) = slot.current.take() {
                store::copy_old_consensus_info(&mut c, &old);
            }
            slot.current = Some(c);
        }

        // If the cert-waiting slot holds something no newer than what
        // we just installed, it has lost its chance.
        let new_valid_after = self
            .flavors
            .get(flavor)
            .current
            .as_ref()
            .expect("current consensus was just installed")
            .lifetime()
            .valid_after();
        let evict_waiting = self
            .flavors
            .get(flavor)
            .waiting
            .as_ref()
            .map(|w| w.consensus.lifetime().valid_after() <= new_valid_after)
            .unwrap_or(false);
        if evict_waiting {
            self.flavors.get_mut(flavor).waiting = None;
            let fname = self.store.unverified_fname(flavor);
            self.store.remove_doc(&fname);
        }

        // Reset the failure count only if this consensus is actually
        // live.
        {
            let slot = self.flavors.get_mut(flavor);
            let live_now = slot
                .current
                .as_ref()
                .map(|cur| cur.is_live(now))
                .unwrap_or(false);
            if live_now {
                slot.dl_status.note_success();
            } else if !options.from_cache {
                slot.dl_status.note_failure(now);
            }
        }

        if flavor == usable {
            self.update_consensus_fetch_time(now);
            let current = self
                .flavors
                .get(flavor)
                .current
                .as_ref()
                .expect("current consensus was just installed");
            self.nodes.set_consensus(current);
            self.names = NicknameMaps::from_consensus(current);

            // Complain (once) if the authorities don't like our
            // version.
            let recommended = if self.config.server_mode() {
                current.relay_versions()
            } else {
                current.client_versions()
            };
            let vstatus = version_status(self.config.software_version(), recommended);
            match vstatus {
                VersionStatus::Recommended | VersionStatus::Empty => {}
                VersionStatus::New => {
                    if !self.warned_new_version {
                        self.warned_new_version = true;
                        warn!(
                            "This version ({}) is newer than any recommended version, according \
                             to the directory authorities. Recommended versions are: {}",
                            self.config.software_version(),
                            recommended.join(",")
                        );
                        self.events.send(DirEvent::DangerousVersion {
                            current: self.config.software_version().to_string(),
                            reason: "NEW",
                            recommended: recommended.join(","),
                        });
                    }
                }
                VersionStatus::Obsolete | VersionStatus::Unrecommended => {
                    if !self.warned_old_version {
                        self.warned_old_version = true;
                        let reason = if vstatus == VersionStatus::Obsolete {
                            "OBSOLETE"
                        } else {
                            "UNRECOMMENDED"
                        };
                        warn!(
                            "Please upgrade! This version ({}) is {}, according to the directory \
                             authorities. Recommended versions are: {}",
                            self.config.software_version(),
                            reason,
                            recommended.join(",")
                        );
                        self.events.send(DirEvent::DangerousVersion {
                            current: self.config.software_version().to_string(),
                            reason,
                            recommended: recommended.join(","),
                        });
                    }
                }
            }
        }

        if flavor == ConsensusFlavor::Microdesc {
            let current = self
                .flavors
                .get(flavor)
                .current
                .as_ref()
                .expect("current consensus was just installed");
            self.mdcache.update_listed_from_consensus(current);
        }
        self.v2cache.refresh_download_status_map();

        if !options.from_cache {
            let fname = self.store.consensus_fname(flavor);
            self.store.write_doc(&fname, bytes);
        }

        let valid_after = self
            .flavors
            .get(flavor)
            .current
            .as_ref()
            .expect("current consensus was just installed")
            .lifetime()
            .valid_after();
        if now + EARLY_CONSENSUS_NOTICE_SKEW < valid_after {
            let delta = clock_delta(now, valid_after);
            warn!(
                "Our clock is behind the time published in the consensus network status \
                 document. Please check your time and date settings!"
            );
            self.events.send(DirEvent::ClockSkew {
                min_skew: delta,
                source: "CONSENSUS".into(),
            });
        }

        Ok(ConsensusChange::Installed)
    }

    /// Called when we have gotten more certificates: see whether we
    /// can now verify a pending consensus.
    pub fn note_certs_arrived(&mut self) {
        let now = self.clock.now();
        let mut ready = Vec::new();
        for flavor in ALL_FLAVORS {
            if let Some(waiting) = self.flavors.get_mut(flavor).waiting.as_mut() {
                let quorum = quorum::check_consensus_signatures(
                    &mut waiting.consensus,
                    self.config.authorities(),
                    &*self.certs,
                    now,
                    Verbosity::Quiet,
                );
                if quorum.is_sufficient() {
                    ready.push((flavor, waiting.body.clone()));
                }
            }
        }
        for (flavor, body) in ready {
            let options = SetConsensusOptions {
                was_waiting_for_certs: true,
                ..Default::default()
            };
            if let Err(e) = self.set_current_consensus(&body, flavor, &options) {
                info!("Couldn't install verified pending consensus: {}", e);
            }
        }
    }

    /// Called by the transport when a consensus download fails:
    /// record the failure and retry immediately if appropriate.
    pub fn consensus_download_failed(&mut self, _status_code: u16, flavor_name: &str) {
        if let Ok(flavor) = ConsensusFlavor::from_name(flavor_name) {
            let now = self.clock.now();
            self.flavors.get_mut(flavor).dl_status.note_failure(now);
            self.update_consensus_downloads(now);
        }
    }

    /// Launch requests for networkstatus documents, certificates, and
    /// microdescriptors as appropriate.
    ///
    /// Called from the main loop on a coarse interval.
    pub fn update_downloads(&mut self) {
        let now = self.clock.now();
        if self.should_delay_dir_fetches() {
            info!("delaying dir fetches (no running bridges known)");
            return;
        }
        if self.config.authority_v2()
            || self.config.authority_v3()
            || self.config.fetch_v2_networkstatus()
        {
            self.update_v2_cache_downloads(now);
        }
        self.update_consensus_downloads(now);
        self.update_certificate_downloads(now);
        self.update_microdesc_downloads(now);
    }

    /// Return true if there's a reason we shouldn't try any directory
    /// fetches yet (e.g. we demand bridges and none are yet known).
    fn should_delay_dir_fetches(&self) -> bool {
        self.config.use_bridges() && !self.nodes.any_bridges_known()
    }

    /// If we want a fresh consensus of some flavor, launch a download
    /// as appropriate.
    fn update_consensus_downloads(&mut self, now: SystemTime) {
        let bridge_no_md = self.nodes.any_bridge_lacks_md_support();
        for flavor in ALL_FLAVORS {
            if !self.config.want_to_fetch_flavor(flavor, bridge_no_md) {
                continue;
            }
            let in_flight = self
                .transport
                .in_flight(FetchPurpose::Consensus, Some(flavor.name()));
            let slot = self.flavors.get_mut(flavor);

            let live = slot
                .current
                .as_ref()
                .map(|c| c.is_live(now))
                .unwrap_or(false);
            if !live {
                // No live consensus?  Get one now!
                slot.next_download_time = Some(now);
            }
            if let Some(when) = slot.next_download_time {
                if when > now {
                    // Wait until the current consensus is older.
                    continue;
                }
            }
            if !slot
                .dl_status
                .is_ready(now, CONSENSUS_NETWORKSTATUS_MAX_DL_TRIES)
            {
                // We failed downloading a consensus too recently.
                continue;
            }
            if in_flight {
                // There's an in-progress download.
                continue;
            }
            if let Some(waiting) = slot.waiting.as_mut() {
                if waiting.set_at + DELAY_WHILE_FETCHING_CERTS > now {
                    // We're still getting certs for this one.
                    continue;
                } else if !waiting.dl_failed {
                    waiting.dl_failed = true;
                    slot.dl_status.note_failure(now);
                }
            }
            info!(
                "Launching {} networkstatus consensus download.",
                flavor.name()
            );
            self.transport
                .launch_fetch(FetchPurpose::Consensus, flavor.name());
        }
    }

    /// We are a directory server, or were asked to mirror the legacy
    /// v2 documents; initiate downloads as needed to refresh them.
    ///
    /// Authorities ask every other v2 authority for its own status;
    /// caches ask a single authority for all of them.
    fn update_v2_cache_downloads(&mut self, now: SystemTime) {
        let interval = schedule::v2_cache_interval(&self.config);
        if let Some(last) = self.last_v2_attempt {
            if last + interval >= now {
                return;
            }
        }
        self.last_v2_attempt = Some(now);

        if self.config.authority_v2() {
            // An authority launches a separate request for everybody.
            for auth in self.config.authorities() {
                if !auth.publishes_v2() {
                    continue;
                }
                if self.config.own_identity() == Some(auth.v3ident()) {
                    continue;
                }
                let resource = format!(
                    "fp/{}.z",
                    hex::encode(auth.v3ident().as_bytes()).to_uppercase()
                );
                if self
                    .transport
                    .in_flight(FetchPurpose::V2Status, Some(&resource))
                {
                    continue;
                }
                self.transport.launch_fetch(FetchPurpose::V2Status, &resource);
            }
        } else {
            // A non-authority cache launches one request to a random
            // authority.
            if !self.transport.in_flight(FetchPurpose::V2Status, None) {
                self.transport.launch_fetch(FetchPurpose::V2Status, "all.z");
            }
        }
    }

    /// Launch requests as appropriate for missing authority
    /// certificates.
    fn update_certificate_downloads(&mut self, now: SystemTime) {
        for flavor in ALL_FLAVORS {
            if let Some(waiting) = self.flavors.get(flavor).waiting.as_ref() {
                self.certs.fetch_missing(&waiting.consensus, now);
            }
            if let Some(current) = self.flavors.get(flavor).current.as_ref() {
                self.certs.fetch_missing(current, now);
            }
        }
    }

    /// Launch download requests for microdescriptors listed in the
    /// current consensus that we don't have and aren't already
    /// fetching.
    fn update_microdesc_downloads(&mut self, now: SystemTime) {
        if !self.we_fetch_microdescriptors() {
            return;
        }
        let current = match self.flavors.get(ConsensusFlavor::Microdesc).current.as_ref() {
            Some(c) if c.is_reasonably_live(now) => c,
            _ => return,
        };
        let pending = self.transport.pending_microdescs();
        let missing = self.mdcache.list_missing(current, now, true, Some(&pending));
        for resource in schedule::microdesc_resources(&missing) {
            self.transport.launch_fetch(FetchPurpose::Microdesc, &resource);
        }
    }

    /// Return true if we should try to download microdescriptors at
    /// all.
    fn we_fetch_microdescriptors(&self) -> bool {
        self.config.caches_dir_info()
            || self.config.fetch_useless_descriptors()
            || self.usable_flavor() == ConsensusFlavor::Microdesc
    }

    /// Recompute when to fetch the successor of every flavor we care
    /// about.
    fn update_consensus_fetch_time(&mut self, now: SystemTime) {
        let bridge_no_md = self.nodes.any_bridge_lacks_md_support();
        for flavor in ALL_FLAVORS {
            if !self.config.want_to_fetch_flavor(flavor, bridge_no_md) {
                continue;
            }
            let when = match self.flavors.get(flavor).current.as_ref() {
                Some(c) if c.is_live(now) => {
                    schedule::pick_download_time(c.lifetime(), &self.config, &mut rand::thread_rng())
                }
                _ => {
                    info!(
                        "No live {} consensus; we should fetch one immediately.",
                        flavor.name()
                    );
                    now
                }
            };
            self.flavors.get_mut(flavor).next_download_time = Some(when);
        }
    }

    /// Add a batch of freshly downloaded microdescriptors to the
    /// cache, and hand new ones to the node list if the current
    /// consensus uses them.
    ///
    /// If `requested` is given, descriptors we never asked for are
    /// dropped with a protocol warning, and the digests we received
    /// are removed from the set.  Returns the digests actually added.
    pub fn add_microdescs(
        &mut self,
        bytes: &[u8],
        requested: Option<&mut HashSet<MdDigest>>,
    ) -> Result<Vec<MdDigest>> {
        let now = self.clock.now();
        let added = self.mdcache.add_bytes(
            bytes,
            SavedLocation::Nowhere,
            false,
            Some(now),
            requested,
            &*self.parser,
        )?;
        let md_in_use = self.usable_flavor() == ConsensusFlavor::Microdesc
            && self
                .flavors
                .get(ConsensusFlavor::Microdesc)
                .current
                .is_some();
        if md_in_use {
            for digest in &added {
                if let Some(body) = self.mdcache.body_by_digest(digest) {
                    self.nodes.add_microdesc(digest, body);
                }
            }
        }
        Ok(added)
    }

    /// Return the body of the cached microdescriptor with `digest`.
    pub fn microdesc_body(&self, digest: &MdDigest) -> Option<&[u8]> {
        self.mdcache.body_by_digest(digest)
    }

    /// Return the cached microdescriptor with `digest`.
    pub fn microdesc(&self, digest: &MdDigest) -> Option<&Microdesc> {
        self.mdcache.lookup(digest)
    }

    /// Note that a node now holds a handle to the microdescriptor
    /// with `digest`.
    pub fn microdesc_held_by_node(&mut self, digest: &MdDigest) {
        self.mdcache.note_held_by_node(digest);
    }

    /// Note that a node dropped its handle to the microdescriptor
    /// with `digest`.
    pub fn microdesc_dropped_by_node(&mut self, digest: &MdDigest) {
        self.mdcache.note_dropped_by_node(digest);
    }

    /// Return the mean size of the microdescriptors in the cache, for
    /// estimating how large a pending download will be.
    pub fn microdesc_average_size(&self) -> usize {
        self.mdcache.average_size()
    }

    /// Reconcile the microdescriptor reference counters against the
    /// node list.
    pub fn check_microdesc_counts(&mut self) {
        let in_use = self.nodes.md_digests_in_use();
        self.mdcache.check_counts(&in_use);
    }

    /// Called by the transport when downloads of the given
    /// microdescriptors failed.
    pub fn microdesc_download_failed(&mut self, digests: &[MdDigest]) {
        let now = self.clock.now();
        if let Some(c) = self
            .flavors
            .get_mut(ConsensusFlavor::Microdesc)
            .current
            .as_mut()
        {
            for digest in digests {
                if let Some(rs) = c.relay_by_desc_digest_mut(&DocDigest::Sha256(*digest)) {
                    rs.dl_status_mut().note_failure(now);
                }
            }
        }
    }

    /// Called by the transport when a download of the full descriptor
    /// with `digest` failed.
    pub fn descriptor_download_failed(&mut self, digest: &DocDigest) {
        let now = self.clock.now();
        if let Some(c) = self.flavors.get_mut(ConsensusFlavor::Ns).current.as_mut() {
            if let Some(rs) = c.relay_by_desc_digest_mut(digest) {
                rs.dl_status_mut().note_failure(now);
                return;
            }
        }
        if let Some(status) = self.v2cache.desc_dl_status(digest) {
            status.note_failure(now);
        }
    }

    /// Note that a directory request to the relay with `identity`
    /// got a 503 response just now.
    pub fn note_dir_server_busy(&mut self, identity: &RsaIdentity) {
        let now = self.clock.now();
        for flavor in ALL_FLAVORS {
            if let Some(c) = self.flavors.get_mut(flavor).current.as_mut() {
                if let Some(rs) = c.relay_by_id_mut(identity) {
                    rs.set_last_dir_503_at(Some(now));
                }
            }
        }
    }

    /// Return the latest time the current "ns" consensus vouches for
    /// the descriptor with `digest`.
    ///
    /// Only the "ns" consensus is consulted: the microdesc consensus
    /// refers to different documents entirely.
    pub fn desc_listed_until(&self, digest: &DocDigest) -> Option<SystemTime> {
        let c = self.flavors.get(ConsensusFlavor::Ns).current.as_ref()?;
        c.relay_by_desc_digest(digest)
            .map(|_| c.lifetime().valid_until())
    }

    /// Return the latest time any cached v2 status document vouches
    /// for the descriptor with `digest`.
    pub fn v2_desc_listed_until(&self, digest: &DocDigest) -> Option<SystemTime> {
        self.v2cache.desc_listed_until(digest)
    }

    /// Return the cached v2 status documents, oldest publication
    /// first.
    pub fn v2_status_list(&self) -> &[V2Status] {
        self.v2cache.list()
    }

    /// Handle a v2 status document from `source`.
    pub fn set_v2_status(
        &mut self,
        bytes: &[u8],
        arrived_at: SystemTime,
        source: V2Source,
        requested_fingerprints: Option<&mut Vec<String>>,
    ) -> Result<()> {
        let now = self.clock.now();
        self.v2cache.set_status(
            bytes,
            arrived_at,
            source,
            requested_fingerprints,
            &self.config,
            &*self.parser,
            &self.store,
            &self.events,
            now,
        )
    }

    /// Load every cached document from the data directory.
    ///
    /// Nothing here is fatal: unreadable or unbelievable files are
    /// logged and skipped.
    pub fn load_from_disk(&mut self) -> Result<()> {
        let now = self.clock.now();

        for flavor in ALL_FLAVORS {
            let fname = self.store.consensus_fname(flavor);
            if let Some(bytes) = self.load_ignoring_errors(&fname) {
                let options = SetConsensusOptions::from_cache();
                if let Err(e) = self.set_current_consensus(bytes.as_ref(), flavor, &options) {
                    if e.bumps_failure_count() {
                        warn!(
                            "Couldn't load consensus {} networkstatus from {:?}: {}",
                            flavor.name(),
                            fname,
                            e
                        );
                    }
                }
            }

            let fname = self.store.unverified_fname(flavor);
            if let Some(bytes) = self.load_ignoring_errors(&fname) {
                let options = SetConsensusOptions {
                    was_waiting_for_certs: true,
                    ..SetConsensusOptions::from_cache()
                };
                if let Err(e) = self.set_current_consensus(bytes.as_ref(), flavor, &options) {
                    info!(
                        "Couldn't load unverified consensus {} networkstatus from {:?}: {}",
                        flavor.name(),
                        fname,
                        e
                    );
                }
            }
        }

        // A fallback consensus is only interesting when the cache
        // gave us nothing newer.
        if let Some(path) = self.config.fallback_networkstatus_file().map(|p| p.to_path_buf()) {
            let current_valid_after = self
                .flavors
                .get(self.usable_flavor())
                .current
                .as_ref()
                .map(|c| c.lifetime().valid_after());
            let use_fallback = match current_valid_after {
                None => true,
                Some(valid_after) => self
                    .store
                    .mtime(&path)
                    .map(|mtime| mtime > valid_after)
                    .unwrap_or(false),
            };
            if use_fallback {
                if let Some(bytes) = self.load_ignoring_errors(&path) {
                    let options = SetConsensusOptions {
                        accept_obsolete: self.config.allow_obsolete_fallback(),
                        ..SetConsensusOptions::from_cache()
                    };
                    match self.set_current_consensus(bytes.as_ref(), ConsensusFlavor::Ns, &options)
                    {
                        Ok(_) => {
                            info!("Loaded fallback consensus networkstatus from {:?}", path);
                        }
                        Err(e) => {
                            info!(
                                "Couldn't load consensus networkstatus from {:?}: {}",
                                path, e
                            );
                        }
                    }
                }
            }
        }

        if self.config.caches_v2_dir_info() {
            for (name, path, mtime) in self.store.list_v2_status_files()? {
                if name.len() != 40 || hex::decode(&name).is_err() {
                    info!(
                        "Skipping cached-status file with unexpected name {:?}",
                        name
                    );
                    continue;
                }
                if let Some(bytes) = self.load_ignoring_errors(&path) {
                    let arrived = mtime.unwrap_or(now);
                    if let Err(e) = self.v2cache.set_status(
                        bytes.as_ref(),
                        arrived,
                        V2Source::FromCache,
                        None,
                        &self.config,
                        &*self.parser,
                        &self.store,
                        &self.events,
                        now,
                    ) {
                        warn!("Couldn't load networkstatus from {:?}: {}", path, e);
                    }
                }
            }
            self.v2cache
                .clean(now, self.config.max_v2_networkstatus_age(), &self.store);
            self.v2cache.refresh_download_status_map();
        }

        self.mdcache.reload(&*self.parser);
        let have_live_md = self
            .flavors
            .get(ConsensusFlavor::Microdesc)
            .current
            .as_ref()
            .map(|c| c.is_reasonably_live(now))
            .unwrap_or(false);
        if let Err(e) = self.mdcache.rebuild(false, have_live_md, now) {
            warn!("Couldn't rebuild microdescriptor cache: {}", e);
        }
        if let Some(c) = self.flavors.get(ConsensusFlavor::Microdesc).current.as_ref() {
            self.mdcache.update_listed_from_consensus(c);
        }

        self.update_certificate_downloads(now);
        Ok(())
    }

    /// Helper: load `path`, turning read errors into log lines.
    fn load_ignoring_errors(&self, path: &Path) -> Option<InputBytes> {
        match self.store.load_doc(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Couldn't read {:?}: {}", path, e);
                None
            }
        }
    }

    /// Remove long-unlisted microdescriptors and long-expired v2
    /// documents, and compact the microdescriptor cache when that
    /// would save space.
    ///
    /// Called from the main loop every hour or so.
    pub fn run_periodic_cleanup(&mut self) {
        let now = self.clock.now();
        self.v2cache
            .clean(now, self.config.max_v2_networkstatus_age(), &self.store);
        self.v2cache.refresh_download_status_map();
        let have_live_md = self
            .flavors
            .get(ConsensusFlavor::Microdesc)
            .current
            .as_ref()
            .map(|c| c.is_reasonably_live(now))
            .unwrap_or(false);
        if let Err(e) = self.mdcache.rebuild(false, have_live_md, now) {
            warn!("Couldn't rebuild microdescriptor cache: {}", e);
        }
    }

    /// Forget that we've warned about anything, so that fresh
    /// problems get fresh warnings.
    pub fn reset_warnings(&mut self) {
        self.warned_old_version = false;
        self.warned_new_version = false;
        self.warned_name_lookups.clear();
    }

    /// Reset the download failure count on every document we track,
    /// so that long-failed downloads are retried immediately.
    pub fn reset_download_failures(&mut self) {
        for flavor in ALL_FLAVORS {
            let slot = self.flavors.get_mut(flavor);
            slot.dl_status.note_success();
            if let Some(c) = slot.current.as_mut() {
                for rs in c.relays_mut() {
                    rs.dl_status_mut().note_success();
                }
            }
        }
        self.v2cache.reset_download_failures();
    }
}

/// How our software version relates to the consensus recommendations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VersionStatus {
    /// Our version is in the recommended list.
    Recommended,
    /// The consensus recommends no versions at all.
    Empty,
    /// Our version is newer than everything recommended.
    New,
    /// Our version is older than everything recommended.
    Obsolete,
    /// Our version is inside the recommended range, but not listed.
    Unrecommended,
}

/// Compare `mine` against a consensus recommended-versions list.
fn version_status(mine: &str, recommended: &[String]) -> VersionStatus {
    /// Split a version string into numeric components for comparison.
    fn components(v: &str) -> Vec<u64> {
        v.split(|c: char| !c.is_ascii_digit())
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse().ok())
            .collect()
    }
    if recommended.is_empty() {
        return VersionStatus::Empty;
    }
    if recommended.iter().any(|r| r == mine) {
        return VersionStatus::Recommended;
    }
    let mine_c = components(mine);
    if recommended.iter().all(|r| components(r) < mine_c) {
        VersionStatus::New
    } else if recommended.iter().all(|r| components(r) > mine_c) {
        VersionStatus::Obsolete
    } else {
        VersionStatus::Unrecommended
    }
}
