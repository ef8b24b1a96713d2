//! Information about directory authorities.
//!
//! From a client's point of view, an authority's role is to sign the
//! consensus directory.  Directory caches additionally mirror the
//! legacy per-authority ("v2") status documents of authorities that
//! still publish them.

use crate::ids::{CertKeyIds, RsaIdentity};
use serde::Deserialize;

/// A single directory authority.
//
// Note that we do *not* set serde(deny_unknown_fields) on this
// structure: we want the authorities format to be future-proof against
// adding new info about each authority.
#[derive(Deserialize, Debug, Clone)]
pub struct Authority {
    /// A memorable nickname for this authority.
    name: String,
    /// A SHA1 digest of the DER-encoded long-term v3 RSA identity key
    /// for this authority.
    v3ident: RsaIdentity,
    /// Address of the authority, in string form, for diagnostics.
    #[serde(default)]
    address: String,
    /// Directory port of the authority.
    #[serde(default)]
    dir_port: u16,
    /// True if this authority also publishes legacy v2 networkstatus
    /// documents.
    #[serde(default)]
    publishes_v2: bool,
}

impl Authority {
    /// Construct information about a new authority.
    pub fn new(name: String, v3ident: RsaIdentity) -> Self {
        Authority {
            name,
            v3ident,
            address: String::new(),
            dir_port: 0,
            publishes_v2: false,
        }
    }
    /// Set the address and directory port for this authority.
    pub fn set_address(&mut self, address: String, dir_port: u16) {
        self.address = address;
        self.dir_port = dir_port;
    }
    /// Mark this authority as one that publishes v2 status documents.
    pub fn set_publishes_v2(&mut self, yes: bool) {
        self.publishes_v2 = yes;
    }

    /// Return the nickname of this authority.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Return the v3 identity key digest of this authority.
    pub fn v3ident(&self) -> &RsaIdentity {
        &self.v3ident
    }
    /// Return the address of this authority, if known.
    pub fn address(&self) -> &str {
        &self.address
    }
    /// Return the directory port of this authority.
    pub fn dir_port(&self) -> u16 {
        self.dir_port
    }
    /// Return true if this authority publishes v2 status documents.
    pub fn publishes_v2(&self) -> bool {
        self.publishes_v2
    }
    /// Return true if this authority matches a given certificate key
    /// identity.
    pub fn matches_keyid(&self, id: &CertKeyIds) -> bool {
        self.v3ident == id.id_fingerprint
    }
}

/// Return true if `id` is the v3 identity of some authority in
/// `authorities`.
pub(crate) fn id_is_recognized(authorities: &[Authority], id: &RsaIdentity) -> bool {
    authorities.iter().any(|a| a.v3ident() == id)
}

/// Return a vector of the default directory authorities.
pub(crate) fn default_authorities() -> Vec<Authority> {
    /// Build an authority; panic if input is bad.
    fn auth(name: &str, key: &str) -> Authority {
        let v3ident =
            RsaIdentity::from_hex(key).expect("Built-in authority identity had bad hex!?");
        Authority::new(name.to_string(), v3ident)
    }

    // (List generated August 2020.)
    vec![
        auth("bastet", "27102BC123E7AF1D4741AE047E160C91ADC76B21"),
        auth("dannenberg", "0232AF901C31A04EE9848595AF9BB7620D4C5B2E"),
        auth("dizum", "E8A9C45EDE6D711294FADF8E7951F4DE6CA56B58"),
        auth("Faravahar", "EFCBE720AB3A82B99F9E953CD5BF50F7EEFC7B97"),
        auth("gabelmoo", "ED03BB616EB2F60BEC80151114BB25CEF515B226"),
        auth("longclaw", "23D15D965BC35114467363C165C4F724B64B4F66"),
        auth("maatuska", "49015F787433103580E3B66A1707A00E60F2D15B"),
        auth("moria1", "D586D18309DED4CD6D57C18FDB97EFA96D330566"),
        auth("tor26", "14C131DFC5C6F93646BE72FA1401C02A8DF2E8B4"),
    ]
}
