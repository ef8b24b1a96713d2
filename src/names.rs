//! Nickname maps derived from consensus flags.
//!
//! The authorities can endorse a binding from a nickname to an
//! identity (the `Named` flag), or declare that a nickname belongs to
//! somebody else (the `Unnamed` flag).  We rebuild both maps from
//! scratch on every install of the consensus flavor we use, and look
//! them up case-insensitively.

use crate::doc::Consensus;
use crate::ids::RsaIdentity;

use std::collections::{HashMap, HashSet};

/// The `named` and `unnamed` nickname maps for the current consensus.
#[derive(Debug, Clone, Default)]
pub(crate) struct NicknameMaps {
    /// Map from lowercased nickname to the identity the authorities
    /// have bound it to.
    named: HashMap<String, RsaIdentity>,
    /// Set of lowercased nicknames that may not be used to refer to
    /// any relay.
    unnamed: HashSet<String>,
}

impl NicknameMaps {
    /// Construct empty nickname maps.
    pub(crate) fn new() -> Self {
        NicknameMaps::default()
    }

    /// Build fresh maps from `consensus`.
    ///
    /// The caller swaps the result in, replacing the old maps
    /// wholesale; nothing is ever merged.
    pub(crate) fn from_consensus(consensus: &Consensus) -> Self {
        let mut named = HashMap::new();
        let mut unnamed = HashSet::new();
        for rs in consensus.relays() {
            if rs.is_named() {
                named.insert(rs.nickname().to_lowercase(), *rs.identity());
            }
            if rs.is_unnamed() {
                unnamed.insert(rs.nickname().to_lowercase());
            }
        }
        NicknameMaps { named, unnamed }
    }

    /// Return the identity that `nickname` is officially mapped to, if
    /// any.
    pub(crate) fn lookup_named(&self, nickname: &str) -> Option<&RsaIdentity> {
        self.named.get(&nickname.to_lowercase())
    }

    /// Return true if `nickname` is disallowed from being the nickname
    /// of any relay.
    pub(crate) fn is_unnamed(&self, nickname: &str) -> bool {
        self.unnamed.contains(&nickname.to_lowercase())
    }

    /// Return the number of named entries.  (Testing helper.)
    #[cfg(test)]
    pub(crate) fn n_named(&self) -> usize {
        self.named.len()
    }
}
