//! The controller's GETINFO window into the consensus.
//!
//! Controllers ask for router status entries by identity, by
//! nickname, by purpose, or all at once; the answers are formatted in
//! the same "r"/"s" line style the consensus itself uses.

use crate::doc::{RelayFlags, RouterStatus};
use crate::ids::RsaIdentity;
use crate::{DirectoryState, Error, Result};

use chrono::{DateTime, Utc};
use tracing::warn;

/// Flag names in the order they appear on an "s" line.
const FLAG_NAMES: [(RelayFlags, &str); 13] = [
    (RelayFlags::AUTHORITY, "Authority"),
    (RelayFlags::BAD_DIRECTORY, "BadDirectory"),
    (RelayFlags::BAD_EXIT, "BadExit"),
    (RelayFlags::EXIT, "Exit"),
    (RelayFlags::FAST, "Fast"),
    (RelayFlags::GUARD, "Guard"),
    (RelayFlags::HSDIR, "HSDir"),
    (RelayFlags::NAMED, "Named"),
    (RelayFlags::RUNNING, "Running"),
    (RelayFlags::STABLE, "Stable"),
    (RelayFlags::UNNAMED, "Unnamed"),
    (RelayFlags::V2DIR, "V2Dir"),
    (RelayFlags::VALID, "Valid"),
];

/// Generate networkstatus lines for a single router status entry.
pub(crate) fn format_entry(rs: &RouterStatus) -> String {
    /// Unpadded base64, as used in directory documents.
    fn b64(bytes: &[u8]) -> String {
        base64::encode_config(bytes, base64::STANDARD_NO_PAD)
    }
    let published: DateTime<Utc> = rs
        .published_on()
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        .into();
    let mut out = format!(
        "r {} {} {} {} {} {} {}\n",
        rs.nickname(),
        b64(rs.identity().as_bytes()),
        b64(rs.desc_digest().as_bytes()),
        published.format("%Y-%m-%d %H:%M:%S"),
        rs.addr(),
        rs.or_port(),
        rs.dir_port(),
    );
    out.push('s');
    for (flag, name) in &FLAG_NAMES {
        if rs.flags().contains(*flag) {
            out.push(' ');
            out.push_str(name);
        }
    }
    out.push('\n');
    if let Some(v) = rs.version() {
        out.push_str("v ");
        out.push_str(v);
        out.push('\n');
    }
    out
}

impl DirectoryState {
    /// Answer a controller GETINFO question beginning with `ns/`.
    ///
    /// Returns `Ok(None)` if the question is not one we answer, or
    /// names a router we don't know.
    pub fn getinfo(&mut self, question: &str) -> Result<Option<String>> {
        if !question.starts_with("ns/") {
            return Ok(None);
        }
        if self.latest_consensus().is_none() {
            return Ok(Some(String::new()));
        }

        if question == "ns/all" {
            let current = self
                .latest_consensus()
                .expect("checked for a consensus above");
            let mut out = String::new();
            for rs in current.relays() {
                out.push_str(&format_entry(rs));
            }
            return Ok(Some(out));
        }
        if let Some(hex_id) = question.strip_prefix("ns/id/") {
            let id = RsaIdentity::from_hex(hex_id)
                .ok_or(Error::BadArgument("Data not decodeable as hex"))?;
            return Ok(self.status_by_id(&id).map(format_entry));
        }
        if let Some(nickname) = question.strip_prefix("ns/name/") {
            let nickname = nickname.to_string();
            return Ok(self
                .status_by_nickname(&nickname, true)
                .map(format_entry));
        }
        if let Some(purpose) = question.strip_prefix("ns/purpose/") {
            let statuses = self
                .nodes
                .statuses_by_purpose(purpose)
                .ok_or(Error::BadArgument("unrecognized purpose"))?;
            let mut out = String::new();
            for rs in &statuses {
                out.push_str(&format_entry(rs));
            }
            return Ok(Some(out));
        }
        Ok(None)
    }

    /// Return the consensus entry for the router whose identity
    /// digest is `id`, if we know about it.
    pub fn status_by_id(&self, id: &RsaIdentity) -> Option<&RouterStatus> {
        self.latest_consensus()?.relay_by_id(id)
    }

    /// Return the consensus entry for `nickname`: a hex digest, an
    /// officially Named nickname, or (as a last resort) any relay
    /// using that nickname.
    ///
    /// When the match comes from an unofficial nickname and
    /// `warn_if_unnamed` is set, warn the first time: the binding is
    /// not guaranteed to be stable.
    pub fn status_by_nickname(
        &mut self,
        nickname: &str,
        warn_if_unnamed: bool,
    ) -> Option<&RouterStatus> {
        let usable = self.usable_flavor();
        let current = self.flavors.get(usable).current.as_ref()?;

        if let Some(id) = RsaIdentity::from_hex(nickname) {
            return current.relay_by_id(&id);
        }
        if let Some(id) = self.names.lookup_named(nickname) {
            let id = *id;
            return current.relay_by_id(&id);
        }
        if self.names.is_unnamed(nickname) {
            return None;
        }

        let mut found = None;
        for rs in current.relays() {
            if rs.nickname().eq_ignore_ascii_case(nickname) {
                if found.is_some() {
                    // More than one relay uses this nickname, and the
                    // authorities haven't blessed any of them.
                    return None;
                }
                found = Some(rs);
            }
        }
        let rs = found?;
        if warn_if_unnamed && !rs.is_named() {
            let key = nickname.to_lowercase();
            if self.warned_name_lookups.insert(key) {
                warn!(
                    "You specified a server \"{}\" by name, but the directory authorities do \
                     not have any key registered for this nickname -- so it could be used by \
                     any server, not just the one you meant.",
                    nickname
                );
            }
        }
        Some(rs)
    }
}
