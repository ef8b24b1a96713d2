//! Types for managing networkstatus configuration.
//!
//! Configuration tells us where to store directory state on disk,
//! which authorities to believe, which consensus flavor to use, and
//! what role (client, server, cache, authority) we play in the
//! directory system.

use crate::authority::{default_authorities, Authority};
use crate::doc::ConsensusFlavor;
use crate::ids::RsaIdentity;
use crate::{Error, Result};

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Whether to use microdescriptors, full descriptors, or decide
/// automatically.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UseMicrodescriptors {
    /// Always use the microdesc-flavored consensus.
    Yes,
    /// Always use the ns-flavored consensus.
    No,
    /// Use microdescriptors unless we're a server, we're fetching
    /// everything anyway, or a configured bridge can't serve them.
    Auto,
}

impl Default for UseMicrodescriptors {
    fn default() -> Self {
        UseMicrodescriptors::Auto
    }
}

/// How long may a v2 status document sit in the cache before the
/// periodic sweep removes it?
const DEFAULT_MAX_V2_NETWORKSTATUS_AGE: Duration = Duration::from_secs(10 * 24 * 60 * 60);

/// Builder for a [`NetstatusConfig`].
///
/// To create a configuration, create one of these, adjust it, then
/// call its finalize function.  The builder can also be deserialized
/// directly from a configuration file section.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct NetstatusConfigBuilder {
    /// A list of authorities to trust.
    pub authorities: Vec<Authority>,
    /// Root directory for all on-disk networkstatus state.
    pub data_directory: Option<PathBuf>,
    /// Which consensus flavor should we use for our own purposes?
    pub use_microdescriptors: UseMicrodescriptors,
    /// If true, fetch every consensus flavor and every descriptor,
    /// whether we plan to use them or not.
    pub fetch_useless_descriptors: bool,
    /// If true, fetch legacy v2 status documents even though we are
    /// not an authority.
    pub fetch_v2_networkstatus: bool,
    /// If true, we reach the directory system through bridges, and
    /// must delay fetches until a bridge is known.
    pub use_bridges: bool,
    /// A file holding a consensus to bootstrap from when our cache is
    /// empty or stale.
    pub fallback_networkstatus_file: Option<PathBuf>,
    /// If true, the fallback consensus may be installed even when it
    /// is long expired.
    pub allow_obsolete_fallback: bool,
    /// If true, collapse the cache fetch window so that we fetch new
    /// consensuses almost as soon as they stop being fresh.
    pub fetch_dir_info_extra_early: bool,
    /// True if we are running as a relay.
    pub server_mode: bool,
    /// True if we are a v3 directory authority.
    pub authority_v3: bool,
    /// True if we are a (legacy) v2 directory authority.
    pub authority_v2: bool,
    /// True if we cache and serve directory information to others.
    pub directory_cache: bool,
    /// Our own relay identity, if we have one; used to avoid fetching
    /// our own documents from ourselves.
    pub own_identity: Option<RsaIdentity>,
    /// Maximum age of a v2 status document before the sweep removes it.
    pub max_v2_networkstatus_age: Duration,
    /// The version string to compare against the consensus
    /// recommended-versions lists.
    pub software_version: String,
}

impl Default for NetstatusConfigBuilder {
    fn default() -> Self {
        NetstatusConfigBuilder {
            authorities: Vec::new(),
            data_directory: None,
            use_microdescriptors: UseMicrodescriptors::default(),
            fetch_useless_descriptors: false,
            fetch_v2_networkstatus: false,
            use_bridges: false,
            fallback_networkstatus_file: None,
            allow_obsolete_fallback: false,
            fetch_dir_info_extra_early: false,
            server_mode: false,
            authority_v3: false,
            authority_v2: false,
            directory_cache: false,
            own_identity: None,
            max_v2_networkstatus_age: DEFAULT_MAX_V2_NETWORKSTATUS_AGE,
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl NetstatusConfigBuilder {
    /// Construct a new builder with default settings.
    pub fn new() -> Self {
        NetstatusConfigBuilder::default()
    }

    /// Use `path` as the data directory.
    pub fn set_data_directory(&mut self, path: &Path) -> &mut Self {
        self.data_directory = Some(path.to_path_buf());
        self
    }

    /// Consume this builder and return a [`NetstatusConfig`].
    ///
    /// If no authorities were configured, the default authority list
    /// is used.
    pub fn finalize(mut self) -> Result<NetstatusConfig> {
        if self.authorities.is_empty() {
            self.authorities = default_authorities();
        }
        let data_directory = self
            .data_directory
            .ok_or(Error::BadArgument("no data directory configured"))?;
        Ok(NetstatusConfig {
            authorities: self.authorities,
            data_directory,
            use_microdescriptors: self.use_microdescriptors,
            fetch_useless_descriptors: self.fetch_useless_descriptors,
            fetch_v2_networkstatus: self.fetch_v2_networkstatus,
            use_bridges: self.use_bridges,
            fallback_networkstatus_file: self.fallback_networkstatus_file,
            allow_obsolete_fallback: self.allow_obsolete_fallback,
            fetch_dir_info_extra_early: self.fetch_dir_info_extra_early,
            server_mode: self.server_mode,
            authority_v3: self.authority_v3,
            authority_v2: self.authority_v2,
            directory_cache: self.directory_cache,
            own_identity: self.own_identity,
            max_v2_networkstatus_age: self.max_v2_networkstatus_age,
            software_version: self.software_version,
        })
    }
}

/// Configuration for the networkstatus subsystem.
///
/// This type is immutable once constructed; to build one, use
/// [`NetstatusConfigBuilder`].
#[derive(Debug, Clone)]
pub struct NetstatusConfig {
    /// A list of authorities to trust.  A consensus is considered
    /// valid if it is signed by more than half of these.
    authorities: Vec<Authority>,
    /// Root directory for all on-disk networkstatus state.
    data_directory: PathBuf,
    /// Which consensus flavor should we use for our own purposes?
    use_microdescriptors: UseMicrodescriptors,
    /// If true, fetch every flavor and every descriptor.
    fetch_useless_descriptors: bool,
    /// If true, fetch legacy v2 status documents as a non-authority.
    fetch_v2_networkstatus: bool,
    /// If true, delay directory fetches until a bridge is known.
    use_bridges: bool,
    /// A file holding a consensus to bootstrap from.
    fallback_networkstatus_file: Option<PathBuf>,
    /// If true, the fallback consensus may be installed even when it
    /// is long expired.
    allow_obsolete_fallback: bool,
    /// If true, collapse the cache fetch window.
    fetch_dir_info_extra_early: bool,
    /// True if we are running as a relay.
    server_mode: bool,
    /// True if we are a v3 directory authority.
    authority_v3: bool,
    /// True if we are a legacy v2 directory authority.
    authority_v2: bool,
    /// True if we cache and serve directory information.
    directory_cache: bool,
    /// Our own relay identity, if we have one.
    own_identity: Option<RsaIdentity>,
    /// Maximum age of a v2 status document.
    max_v2_networkstatus_age: Duration,
    /// Version string for recommended-version checks.
    software_version: String,
}

impl NetstatusConfig {
    /// Return the configured authorities.
    pub fn authorities(&self) -> &[Authority] {
        &self.authorities[..]
    }
    /// Return the data directory.
    pub fn data_directory(&self) -> &Path {
        &self.data_directory
    }
    /// Return the configured flavor preference.
    pub fn use_microdescriptors(&self) -> UseMicrodescriptors {
        self.use_microdescriptors
    }
    /// Return true if we fetch every flavor and descriptor.
    pub fn fetch_useless_descriptors(&self) -> bool {
        self.fetch_useless_descriptors
    }
    /// Return true if we fetch legacy v2 documents as a non-authority.
    pub fn fetch_v2_networkstatus(&self) -> bool {
        self.fetch_v2_networkstatus
    }
    /// Return true if directory fetches must wait for a known bridge.
    pub fn use_bridges(&self) -> bool {
        self.use_bridges
    }
    /// Return the fallback consensus file, if one is configured.
    pub fn fallback_networkstatus_file(&self) -> Option<&Path> {
        self.fallback_networkstatus_file.as_deref()
    }
    /// Return true if the fallback consensus may be obsolete.
    pub fn allow_obsolete_fallback(&self) -> bool {
        self.allow_obsolete_fallback
    }
    /// Return true if we fetch new consensuses extra early.
    pub fn fetch_dir_info_extra_early(&self) -> bool {
        self.fetch_dir_info_extra_early
    }
    /// Return true if we are running as a relay.
    pub fn server_mode(&self) -> bool {
        self.server_mode
    }
    /// Return true if we are a v3 directory authority.
    pub fn authority_v3(&self) -> bool {
        self.authority_v3
    }
    /// Return true if we are a legacy v2 directory authority.
    pub fn authority_v2(&self) -> bool {
        self.authority_v2
    }
    /// Return our own relay identity, if we have one.
    pub fn own_identity(&self) -> Option<&RsaIdentity> {
        self.own_identity.as_ref()
    }
    /// Return the maximum age for cached v2 status documents.
    pub fn max_v2_networkstatus_age(&self) -> Duration {
        self.max_v2_networkstatus_age
    }
    /// Return the version string to compare against recommended
    /// versions.
    pub fn software_version(&self) -> &str {
        &self.software_version
    }

    /// Return true if we cache v3 directory information for others.
    pub fn caches_dir_info(&self) -> bool {
        self.directory_cache || self.authority_v3
    }
    /// Return true if we cache legacy v2 directory information.
    pub fn caches_v2_dir_info(&self) -> bool {
        self.directory_cache || self.authority_v2
    }
    /// Return true if we fetch new directory information as soon as
    /// caches are expected to have it.
    pub fn fetches_dir_info_early(&self) -> bool {
        self.caches_dir_info()
    }
    /// Return true if we fetch new directory information at the tail
    /// of the fetch window, after ordinary clients.
    pub fn fetches_dir_info_later(&self) -> bool {
        self.use_bridges
    }

    /// Decide which consensus flavor we should use for our own
    /// purposes.
    ///
    /// `bridge_without_md_support` should be true if we are configured
    /// to use bridges and some bridge can't serve microdescriptors.
    pub fn usable_consensus_flavor(&self, bridge_without_md_support: bool) -> ConsensusFlavor {
        let use_md = match self.use_microdescriptors {
            UseMicrodescriptors::Yes => true,
            UseMicrodescriptors::No => false,
            UseMicrodescriptors::Auto => {
                if self.use_bridges && bridge_without_md_support {
                    false
                } else {
                    !self.server_mode && !self.fetch_useless_descriptors
                }
            }
        };
        if use_md {
            ConsensusFlavor::Microdesc
        } else {
            ConsensusFlavor::Ns
        }
    }

    /// Return true if `flavor` is one we would like to fetch.
    pub fn want_to_fetch_flavor(
        &self,
        flavor: ConsensusFlavor,
        bridge_without_md_support: bool,
    ) -> bool {
        if self.authority_v3 || self.caches_dir_info() {
            // We want to serve all flavors to others, regardless of
            // whether we would use them ourselves.
            return true;
        }
        if self.fetch_useless_descriptors {
            return true;
        }
        flavor == self.usable_consensus_flavor(bridge_without_md_support)
    }
}
