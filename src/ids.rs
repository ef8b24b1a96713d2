//! Identity and digest types used throughout the networkstatus code.
//!
//! Relays and directory authorities are identified by a SHA1 digest of
//! their long-term RSA identity key; documents are identified by SHA1
//! or SHA256 digests depending on their flavor.

use serde::{Deserialize, Deserializer};
use std::fmt;

/// How many bytes are in an "RSA ID"?  (This is a legacy tor concept,
/// and refers to identifying a relay or authority by a SHA1 digest of
/// its public key.)
pub const RSA_ID_LEN: usize = 20;

/// How many bytes are in a SHA256 document digest?
pub const D256_LEN: usize = 32;

/// An identifier for a relay or directory authority, based on its
/// legacy RSA identity key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RsaIdentity {
    /// SHA1 digest of a DER encoded public key.
    id: [u8; RSA_ID_LEN],
}

impl fmt::Display for RsaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", hex::encode(&self.id[..]))
    }
}

impl fmt::Debug for RsaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RsaIdentity {{ ${} }}", hex::encode(&self.id[..]))
    }
}

impl RsaIdentity {
    /// Expose an RsaIdentity as a slice of bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.id[..]
    }
    /// Construct an RsaIdentity from a slice of bytes.
    ///
    /// Returns None if the input is not of the correct length.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() == RSA_ID_LEN {
            let mut id = [0_u8; RSA_ID_LEN];
            id.copy_from_slice(bytes);
            Some(RsaIdentity { id })
        } else {
            None
        }
    }
    /// Construct an RsaIdentity from a hexadecimal string, ignoring an
    /// optional `$` prefix.
    pub fn from_hex(s: &str) -> Option<Self> {
        let s = s.strip_prefix('$').unwrap_or(s);
        let bytes = hex::decode(s).ok()?;
        RsaIdentity::from_bytes(&bytes)
    }
    /// Return true if this identity is composed entirely of zero bytes.
    ///
    /// A zero identity can't belong to any real key; it only appears in
    /// placeholder entries.
    pub fn is_zero(&self) -> bool {
        self.id.iter().all(|b| *b == 0)
    }
}

impl From<[u8; RSA_ID_LEN]> for RsaIdentity {
    fn from(id: [u8; RSA_ID_LEN]) -> RsaIdentity {
        RsaIdentity { id }
    }
}

impl<'de> Deserialize<'de> for RsaIdentity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        RsaIdentity::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom("not a valid hex RSA identity"))
    }
}

/// The SHA256 digest of a microdescriptor body: its primary key in the
/// microdescriptor cache.
pub type MdDigest = [u8; D256_LEN];

/// A pair of digests identifying an authority certificate: the digest
/// of the authority's long-term identity key, and the digest of the
/// shorter-term signing key that the certificate endorses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CertKeyIds {
    /// Digest of the authority's long-term identity key.
    pub id_fingerprint: RsaIdentity,
    /// Digest of the authority's medium-term signing key.
    pub sk_fingerprint: RsaIdentity,
}

/// The digest of the document that a router status entry refers to.
///
/// An "ns" flavored consensus refers to router descriptors by SHA1;
/// a "microdesc" flavored consensus refers to microdescriptors by
/// SHA256.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocDigest {
    /// SHA1 digest of a router descriptor.
    Sha1([u8; RSA_ID_LEN]),
    /// SHA256 digest of a microdescriptor.
    Sha256(MdDigest),
}

impl DocDigest {
    /// Expose this digest as a slice of bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            DocDigest::Sha1(d) => &d[..],
            DocDigest::Sha256(d) => &d[..],
        }
    }
    /// Return true if every byte of this digest is zero.
    ///
    /// Consensus entries with an all-zero digest refer to no document
    /// at all, and must never be scheduled for download.
    pub fn is_zero(&self) -> bool {
        self.as_bytes().iter().all(|b| *b == 0)
    }
    /// If this is a SHA256 digest, return it as an MdDigest.
    pub fn as_sha256(&self) -> Option<&MdDigest> {
        match self {
            DocDigest::Sha256(d) => Some(d),
            DocDigest::Sha1(_) => None,
        }
    }
}

impl fmt::Debug for DocDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocDigest::Sha1(d) => write!(f, "DocDigest::Sha1({})", hex::encode(&d[..])),
            DocDigest::Sha256(d) => write!(f, "DocDigest::Sha256({})", hex::encode(&d[..])),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn identity_bytes() {
        let b = b"xyzzyxyzzyxyzzyxyzzy";
        let id = RsaIdentity::from_bytes(b).unwrap();
        assert_eq!(id.as_bytes(), b);
        assert!(RsaIdentity::from_bytes(b"xyzzy").is_none());
        assert!(!id.is_zero());
        assert!(RsaIdentity::from_bytes(&[0_u8; 20]).unwrap().is_zero());
    }

    #[test]
    fn identity_hex() {
        let id = RsaIdentity::from_hex("27102BC123E7AF1D4741AE047E160C91ADC76B21").unwrap();
        assert_eq!(
            id.to_string(),
            "$27102bc123e7af1d4741ae047e160c91adc76b21"
        );
        let id2 = RsaIdentity::from_hex("$27102bc123e7af1d4741ae047e160c91adc76b21").unwrap();
        assert_eq!(id, id2);
        assert!(RsaIdentity::from_hex("deadbeef").is_none());
        assert!(RsaIdentity::from_hex("not hex at all").is_none());
    }

    #[test]
    fn doc_digest() {
        let d = DocDigest::Sha1([3_u8; 20]);
        assert_eq!(d.as_bytes().len(), 20);
        assert!(d.as_sha256().is_none());
        assert!(!d.is_zero());

        let d = DocDigest::Sha256([0_u8; 32]);
        assert!(d.is_zero());
        assert!(d.as_sha256().is_some());
    }
}
