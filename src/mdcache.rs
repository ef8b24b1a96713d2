//! A disk-backed cache of microdescriptors.
//!
//! There are two active files in the cache: a "cache file" that we
//! mmap, and a "journal file" that we append newly downloaded
//! descriptors to.  Periodically we rebuild the cache file to hold
//! only the descriptors we want to keep, and truncate the journal.
//!
//! Each descriptor on disk may be preceded by an `@last-listed`
//! annotation recording the last time a consensus referred to it;
//! descriptors that go unlisted for too long are dropped at the next
//! cleaning.
//!
//! The in-memory map owns every [`Microdesc`].  The node list keeps
//! handles rather than owning pointers, and the `held_by_nodes`
//! counter tracks how many such handles exist; a descriptor may only
//! be dropped when nobody is looking at it.

use crate::doc::{Consensus, ConsensusFlavor};
use crate::ids::MdDigest;
use crate::retry::MAX_MICRODESC_DOWNLOAD_TRIES;
use crate::storage::{write_replacing, DirStore, InputBytes};
use crate::{DocumentParser, Result};

use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::io::{Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tracing::{error, info, warn};

/// By default, we remove any microdescriptor that has gone at least
/// this long without appearing in a current consensus.
pub const TOLERATE_MICRODESC_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Where the authoritative copy of a microdescriptor's body lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavedLocation {
    /// Not saved to disk at all.
    Nowhere,
    /// Stored in the mmap'd cache file.
    InCache,
    /// Stored in the append journal.
    InJournal,
}

/// Should a batch of microdescriptors be parsed with annotations?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowAnnotations {
    /// Annotations are allowed (cache and journal files carry them).
    AnnotationsAllowed,
    /// Annotations are forbidden (freshly downloaded descriptors
    /// must not have them).
    AnnotationsNotAllowed,
}

/// One microdescriptor as produced by the external parser.
///
/// The body is given as a byte range into the parsed input, so that
/// descriptors loaded from the mmap'd cache file can keep referring
/// to the mapping instead of being copied.
#[derive(Debug, Clone)]
pub struct ParsedMicrodesc {
    /// SHA256 digest of the descriptor body.
    pub digest: MdDigest,
    /// Value of the `@last-listed` annotation, if one was present.
    pub last_listed: Option<SystemTime>,
    /// Range of the descriptor body within the parsed input.
    pub body: Range<usize>,
}

/// Where a microdescriptor's body bytes can be found.
#[derive(Debug)]
enum MdBody {
    /// We own a copy of the body.
    Owned(Box<[u8]>),
    /// The body lives in the cache file mapping, at the descriptor's
    /// recorded offset.
    InCacheFile,
}

/// A single microdescriptor held by the cache.
#[derive(Debug)]
pub struct Microdesc {
    /// SHA256 digest of the body: the descriptor's primary key.
    digest: MdDigest,
    /// The body bytes, owned or mapped.
    body: MdBody,
    /// Length of the body in bytes.
    bodylen: usize,
    /// Offset of the body within whichever file holds it.
    off: usize,
    /// Last time a consensus listed this descriptor.
    last_listed: Option<SystemTime>,
    /// Which file, if any, holds the authoritative copy.
    saved_location: SavedLocation,
    /// If true, never write this descriptor to disk.
    no_save: bool,
    /// True while this descriptor is a value in the cache map.
    held_in_map: bool,
    /// Number of nodes in the node list currently pointing at this
    /// descriptor.
    held_by_nodes: u32,
}

impl Microdesc {
    /// Return the digest of this descriptor.
    pub fn digest(&self) -> &MdDigest {
        &self.digest
    }
    /// Return the length of this descriptor's body.
    pub fn bodylen(&self) -> usize {
        self.bodylen
    }
    /// Return the offset of the body in its file.
    pub fn offset(&self) -> usize {
        self.off
    }
    /// Return the last time a consensus listed this descriptor.
    pub fn last_listed(&self) -> Option<SystemTime> {
        self.last_listed
    }
    /// Return where the authoritative copy of the body lives.
    pub fn saved_location(&self) -> SavedLocation {
        self.saved_location
    }
    /// Return how many nodes currently point at this descriptor.
    pub fn held_by_nodes(&self) -> u32 {
        self.held_by_nodes
    }
}

/// Format an `@last-listed` annotation for `when`.
pub fn format_last_listed(when: SystemTime) -> String {
    let dt: DateTime<Utc> = when.into();
    format!("@last-listed {}\n", dt.format("%Y-%m-%d %H:%M:%S"))
}

/// Parse the time out of an `@last-listed` annotation line (without
/// the trailing newline).
pub fn parse_last_listed(line: &str) -> Option<SystemTime> {
    let rest = line.strip_prefix("@last-listed ")?;
    let naive = NaiveDateTime::parse_from_str(rest.trim_end(), "%Y-%m-%d %H:%M:%S").ok()?;
    let dt = DateTime::<Utc>::from_utc(naive, Utc);
    Some(dt.into())
}

/// A hash-indexed store of microdescriptors over an mmap'd cache file
/// and an append journal.
pub(crate) struct MicrodescCache {
    /// Map from digest to descriptor, for every descriptor we hold.
    map: HashMap<MdDigest, Microdesc>,
    /// Path of the cache file.
    cache_fname: PathBuf,
    /// Path of the journal file.
    journal_fname: PathBuf,
    /// Contents of the cache file, if we have loaded it.
    cache_content: Option<InputBytes>,
    /// Number of bytes used in the journal file.
    journal_len: u64,
    /// Number of body bytes in entries that were dropped or
    /// superseded but still occupy file space.
    bytes_dropped: u64,
    /// Total body bytes ever added to this cache.
    total_len_seen: u64,
    /// Total number of descriptors ever added to this cache.
    n_seen: u32,
    /// False if the directory store is read-only, in which case we
    /// never write the journal.
    journaling: bool,
}

impl MicrodescCache {
    /// Create an empty cache using the file locations of `store`.
    pub(crate) fn new(store: &DirStore) -> Self {
        MicrodescCache {
            map: HashMap::new(),
            cache_fname: store.md_cache_fname(),
            journal_fname: store.md_journal_fname(),
            cache_content: None,
            journal_len: 0,
            bytes_dropped: 0,
            total_len_seen: 0,
            n_seen: 0,
            journaling: !store.is_readonly(),
        }
    }

    /// Drop every descriptor and forget the cache file mapping.
    pub(crate) fn clear(&mut self) {
        for (_, md) in self.map.iter_mut() {
            md.held_in_map = false;
            if md.held_by_nodes != 0 {
                warn!(
                    "Dropping microdescriptor that {} node(s) still reference",
                    md.held_by_nodes
                );
            }
        }
        self.map.clear();
        self.cache_content = None;
        self.journal_len = 0;
        self.bytes_dropped = 0;
        self.total_len_seen = 0;
        self.n_seen = 0;
    }

    /// Reload the contents of the cache from disk.  Returns the
    /// number of descriptors found.
    ///
    /// Unreadable or unparseable files are logged and skipped; an
    /// empty cache is a valid result.
    pub(crate) fn reload(&mut self, parser: &dyn DocumentParser) -> usize {
        self.clear();
        let mut total = 0;

        match InputBytes::load(&self.cache_fname) {
            Ok(content) => {
                match parser.parse_microdescs(content.as_ref(), AllowAnnotations::AnnotationsAllowed)
                {
                    Ok(parsed) => {
                        // Bodies of cache-file entries point into the
                        // mapping rather than being copied.
                        let added = self.add_parsed(
                            content.as_ref(),
                            parsed,
                            SavedLocation::InCache,
                            false,
                            None,
                            None,
                        );
                        self.cache_content = Some(content);
                        total += added.len();
                    }
                    Err(e) => warn!("Unparseable microdescriptor cache file: {}", e),
                }
            }
            Err(crate::Error::Io(ref e)) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Couldn't read microdescriptor cache: {}", e),
        }

        match std::fs::read(&self.journal_fname) {
            Ok(journal) => {
                self.journal_len = journal.len() as u64;
                match parser.parse_microdescs(&journal, AllowAnnotations::AnnotationsAllowed) {
                    Ok(parsed) => {
                        let added = self.add_parsed(
                            &journal,
                            parsed,
                            SavedLocation::InJournal,
                            false,
                            None,
                            None,
                        );
                        total += added.len();
                    }
                    Err(e) => warn!("Unparseable microdescriptor journal: {}", e),
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Couldn't read microdescriptor journal: {}", e),
        }

        info!(
            "Reloaded microdescriptor cache. Found {} descriptors.",
            total
        );
        total
    }

    /// Parse the descriptors in `input` and add them to the cache.
    ///
    /// `where_from` says which file, if any, `input` came from;
    /// freshly downloaded descriptors use [`SavedLocation::Nowhere`]
    /// and get appended to the journal.  If `requested` is supplied,
    /// descriptors we never asked for are rejected, and the digests we
    /// did receive are removed from the set.  Returns the digests of
    /// the descriptors actually added.
    pub(crate) fn add_bytes(
        &mut self,
        input: &[u8],
        where_from: SavedLocation,
        no_save: bool,
        listed_at: Option<SystemTime>,
        requested: Option<&mut HashSet<MdDigest>>,
        parser: &dyn DocumentParser,
    ) -> Result<Vec<MdDigest>> {
        let allow = if where_from == SavedLocation::Nowhere {
            AllowAnnotations::AnnotationsNotAllowed
        } else {
            AllowAnnotations::AnnotationsAllowed
        };
        let parsed = parser.parse_microdescs(input, allow)?;
        Ok(self.add_parsed(input, parsed, where_from, no_save, listed_at, requested))
    }

    /// As [`add_bytes`](Self::add_bytes), but takes already-parsed
    /// descriptors.
    fn add_parsed(
        &mut self,
        input: &[u8],
        parsed: Vec<ParsedMicrodesc>,
        where_from: SavedLocation,
        no_save: bool,
        listed_at: Option<SystemTime>,
        mut requested: Option<&mut HashSet<MdDigest>>,
    ) -> Vec<MdDigest> {
        let mut added = Vec::new();
        let mut journal = None;

        for pd in parsed {
            if let Some(req) = requested.as_deref_mut() {
                if !req.remove(&pd.digest) {
                    warn!("Received non-requested microdescriptor; discarding it.");
                    continue;
                }
            }
            let body = &input[pd.body.clone()];
            let last_listed = listed_at.or(pd.last_listed);

            if let Some(existing) = self.map.get_mut(&pd.digest) {
                // We already had this one: keep the newer listing
                // time and drop the new body.
                if last_listed > existing.last_listed {
                    existing.last_listed = last_listed;
                }
                if where_from != SavedLocation::Nowhere {
                    self.bytes_dropped += body.len() as u64;
                }
                continue;
            }

            let mut md = Microdesc {
                digest: pd.digest,
                body: MdBody::Owned(body.to_vec().into_boxed_slice()),
                bodylen: body.len(),
                off: pd.body.start,
                last_listed,
                saved_location: where_from,
                no_save,
                held_in_map: true,
                held_by_nodes: 0,
            };

            match where_from {
                SavedLocation::InCache => {
                    // The cache file mapping outlives the entry; no
                    // copy is needed.
                    md.body = MdBody::InCacheFile;
                }
                SavedLocation::Nowhere if self.journaling && !no_save => {
                    if journal.is_none() {
                        journal = self.open_journal();
                    }
                    if let Some(f) = journal.as_mut() {
                        match append_to_journal(f, &md) {
                            Ok((off, written)) => {
                                md.off = off;
                                md.saved_location = SavedLocation::InJournal;
                                self.journal_len += written;
                            }
                            Err(e) => {
                                warn!("Couldn't append to microdescriptor journal: {}", e);
                                journal = None;
                            }
                        }
                    }
                }
                _ => {}
            }

            self.n_seen += 1;
            self.total_len_seen += md.bodylen as u64;
            added.push(pd.digest);
            self.map.insert(pd.digest, md);
        }

        added
    }

    /// Open the journal file for appending, returning None (with a
    /// log line) on failure.
    fn open_journal(&self) -> Option<std::fs::File> {
        match std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.journal_fname)
        {
            Ok(f) => Some(f),
            Err(e) => {
                warn!(
                    "Couldn't open microdescriptor journal {:?}: {}",
                    self.journal_fname, e
                );
                None
            }
        }
    }

    /// Remove every descriptor whose last-listed time is before
    /// `cutoff` (by default, a week ago).
    ///
    /// If we have no reasonably live microdesc consensus, do nothing
    /// unless `force` is set: without a consensus we can't tell
    /// listed from unlisted, and cleaning would nuke the whole cache
    /// after any long downtime.
    pub(crate) fn clean(
        &mut self,
        cutoff: Option<SystemTime>,
        force: bool,
        have_live_md_consensus: bool,
        now: SystemTime,
    ) {
        if !force && !have_live_md_consensus {
            return;
        }
        let cutoff = cutoff.unwrap_or(now - TOLERATE_MICRODESC_AGE);

        let victims: Vec<MdDigest> = self
            .map
            .values()
            .filter(|md| md.last_listed.map(|t| t < cutoff).unwrap_or(true))
            .map(|md| md.digest)
            .collect();
        let total = self.map.len();
        let mut bytes_dropped = 0_u64;
        for digest in &victims {
            if let Some(mut md) = self.map.remove(digest) {
                md.held_in_map = false;
                bytes_dropped += md.bodylen as u64;
                if md.held_by_nodes != 0 {
                    // This indicates a bookkeeping bug somewhere; the
                    // node list should drop its handle first.
                    warn!(
                        "Removing microdescriptor that {} node(s) still reference",
                        md.held_by_nodes
                    );
                }
            }
        }
        if !victims.is_empty() {
            info!(
                "Removed {}/{} microdescriptors as old.",
                victims.len(),
                total
            );
            self.bytes_dropped += bytes_dropped;
        }
    }

    /// Return the length of the current cache file contents.
    fn cache_len(&self) -> u64 {
        self.cache_content.as_ref().map(|c| c.len() as u64).unwrap_or(0)
    }

    /// Return true if rebuilding the cache file is worth the trouble.
    fn should_rebuild(&self) -> bool {
        let old_len = self.cache_len();
        let journal_len = self.journal_len;
        let dropped = self.bytes_dropped;

        if journal_len < 16384 {
            return false; // Don't bother, not enough has happened yet.
        }
        if dropped > (journal_len + old_len) / 3 {
            return true; // We could save 1/3 or more of the space in use.
        }
        if journal_len > old_len / 2 {
            return true; // We should fold the journal into the cache file.
        }
        false
    }

    /// Resolve the body bytes of `md` against `content` (the cache
    /// file contents).
    fn resolve_body<'a>(md: &'a Microdesc, content: &'a Option<InputBytes>) -> &'a [u8] {
        match &md.body {
            MdBody::Owned(b) => &b[..],
            MdBody::InCacheFile => {
                let bytes = content
                    .as_ref()
                    .map(|c| c.as_ref())
                    .unwrap_or(&[]);
                &bytes[md.off..md.off + md.bodylen]
            }
        }
    }

    /// Return the body of the descriptor with `digest`, if we have it.
    pub(crate) fn body_by_digest(&self, digest: &MdDigest) -> Option<&[u8]> {
        let md = self.map.get(digest)?;
        Some(Self::resolve_body(md, &self.cache_content))
    }

    /// Return the descriptor with `digest`, if we have it.
    pub(crate) fn lookup(&self, digest: &MdDigest) -> Option<&Microdesc> {
        self.map.get(digest)
    }

    /// Regenerate the cache file, clear the journal, and rebind every
    /// entry to its new location.
    ///
    /// If `force` is false, do this only when
    /// [`should_rebuild`](Self::should_rebuild) says it will save
    /// space.  Returns true if a rebuild happened.
    pub(crate) fn rebuild(
        &mut self,
        force: bool,
        have_live_md_consensus: bool,
        now: SystemTime,
    ) -> Result<bool> {
        // Remove dead descriptors first.
        self.clean(None, false, have_live_md_consensus, now);

        if !force && !self.should_rebuild() {
            return Ok(false);
        }
        if !self.journaling {
            // A read-only cache never rewrites its files.
            return Ok(false);
        }

        info!("Rebuilding the microdescriptor cache...");
        let orig_size = self.cache_len() + self.journal_len;

        let old_content = self.cache_content.take();

        // Write every savable entry to a replacement cache file,
        // remembering where each one lands.
        let mut wrote: Vec<(MdDigest, usize)> = Vec::new();
        let tmp_fname = self.cache_fname.with_extension("tmp");
        let write_result: Result<()> = (|| {
            let mut f = std::fs::File::create(&tmp_fname)?;
            let mut off = 0_usize;
            for md in self.map.values() {
                if md.no_save {
                    continue;
                }
                let mut annotation_len = 0;
                if let Some(t) = md.last_listed {
                    let annotation = format_last_listed(t);
                    f.write_all(annotation.as_bytes())?;
                    annotation_len = annotation.len();
                }
                f.write_all(Self::resolve_body(md, &old_content))?;
                wrote.push((md.digest, off + annotation_len));
                off += annotation_len + md.bodylen;
            }
            f.sync_data()?;
            std::fs::rename(&tmp_fname, &self.cache_fname)?;
            Ok(())
        })();
        if let Err(e) = write_result {
            // The old file is still in place; keep using it.
            self.cache_content = old_content;
            return Err(e);
        }

        let new_content = match InputBytes::load(&self.cache_fname) {
            Ok(c) => c,
            Err(e) => {
                error!(
                    "Couldn't map the cache file we just wrote to {:?}!",
                    self.cache_fname
                );
                // Keep every body in memory so that nothing dangles.
                for (_, md) in self.map.iter_mut() {
                    if matches!(md.body, MdBody::InCacheFile) {
                        let body = Self::resolve_body(md, &old_content).to_vec();
                        md.body = MdBody::Owned(body.into_boxed_slice());
                        md.saved_location = SavedLocation::Nowhere;
                    }
                }
                return Err(e);
            }
        };

        for (digest, new_off) in wrote {
            if let Some(md) = self.map.get_mut(&digest) {
                let new_bytes = new_content.as_ref();
                let end = new_off + md.bodylen;
                let matches = {
                    let old_body = Self::resolve_body(md, &old_content);
                    end <= new_bytes.len() && &new_bytes[new_off..end] == old_body
                };
                if !matches {
                    // Offsets seem wrong; keep an owned copy rather
                    // than point entries at the wrong bytes.
                    error!(
                        "After rebuilding the microdesc cache, offsets seem wrong at {}",
                        new_off
                    );
                    debug_assert!(false, "microdesc cache rebuild produced bad offsets");
                    let owned = Self::resolve_body(md, &old_content).to_vec().into_boxed_slice();
                    md.body = MdBody::Owned(owned);
                    md.saved_location = SavedLocation::Nowhere;
                    continue;
                }
                md.off = new_off;
                md.body = MdBody::InCacheFile;
                md.saved_location = SavedLocation::InCache;
            }
        }

        self.cache_content = Some(new_content);

        if let Err(e) = write_replacing(&self.journal_fname, b"") {
            warn!("Couldn't truncate microdescriptor journal: {}", e);
        }
        self.journal_len = 0;
        self.bytes_dropped = 0;

        let new_size = self.cache_len();
        info!(
            "Done rebuilding microdesc cache. Saved {} bytes; {} still used.",
            orig_size.saturating_sub(new_size),
            new_size
        );
        Ok(true)
    }

    /// List the digests in `consensus` that we should try to
    /// download: absent from the cache, not suppressed by their
    /// download status (when `downloadable_only`), not in `skip`, and
    /// not all-zero.
    pub(crate) fn list_missing(
        &self,
        consensus: &Consensus,
        now: SystemTime,
        downloadable_only: bool,
        skip: Option<&HashSet<MdDigest>>,
    ) -> Vec<MdDigest> {
        debug_assert_eq!(consensus.flavor(), ConsensusFlavor::Microdesc);
        let mut result = Vec::new();
        for rs in consensus.relays() {
            let digest = match rs.desc_digest().as_sha256() {
                Some(d) => d,
                None => continue,
            };
            if self.map.contains_key(digest) {
                continue;
            }
            if downloadable_only
                && !rs.dl_status().is_ready(now, MAX_MICRODESC_DOWNLOAD_TRIES)
            {
                continue;
            }
            if let Some(skip) = skip {
                if skip.contains(digest) {
                    continue;
                }
            }
            if rs.desc_digest().is_zero() {
                info!(
                    "Found an entry in networkstatus with no microdescriptor digest. (Router {}={})",
                    rs.nickname(),
                    rs.identity()
                );
                continue;
            }
            result.push(*digest);
        }
        result
    }

    /// For every descriptor listed in `consensus`, bump its
    /// last-listed time up to the consensus valid-after time.
    pub(crate) fn update_listed_from_consensus(&mut self, consensus: &Consensus) {
        debug_assert_eq!(consensus.flavor(), ConsensusFlavor::Microdesc);
        let valid_after = consensus.lifetime().valid_after();
        for rs in consensus.relays() {
            if let Some(digest) = rs.desc_digest().as_sha256() {
                if let Some(md) = self.map.get_mut(digest) {
                    if md.last_listed.map(|t| valid_after > t).unwrap_or(true) {
                        md.last_listed = Some(valid_after);
                    }
                }
            }
        }
    }

    /// Note that one more node now points at the descriptor with
    /// `digest`.
    pub(crate) fn note_held_by_node(&mut self, digest: &MdDigest) {
        if let Some(md) = self.map.get_mut(digest) {
            md.held_by_nodes += 1;
        }
    }

    /// Note that one fewer node points at the descriptor with
    /// `digest`.
    pub(crate) fn note_dropped_by_node(&mut self, digest: &MdDigest) {
        if let Some(md) = self.map.get_mut(digest) {
            if md.held_by_nodes == 0 {
                warn!("Node dropped a microdescriptor that nothing referenced");
            } else {
                md.held_by_nodes -= 1;
            }
        }
    }

    /// Make sure the node reference count of every descriptor matches
    /// the node list's own accounting, repairing any mismatch.
    pub(crate) fn check_counts(&mut self, digests_in_use: &[MdDigest]) {
        let mut counts: HashMap<MdDigest, u32> = HashMap::new();
        for d in digests_in_use {
            *counts.entry(*d).or_insert(0) += 1;
        }
        for (digest, md) in self.map.iter_mut() {
            let expected = counts.get(digest).copied().unwrap_or(0);
            if md.held_by_nodes != expected {
                warn!(
                    "Microdescriptor reference count was {}, but {} node(s) use it",
                    md.held_by_nodes, expected
                );
                debug_assert_eq!(md.held_by_nodes, expected);
                md.held_by_nodes = expected;
            }
        }
    }

    /// Return the mean size of the descriptors added to this cache,
    /// for download size estimation.
    pub(crate) fn average_size(&self) -> usize {
        if self.n_seen == 0 {
            return 512;
        }
        (self.total_len_seen / u64::from(self.n_seen)) as usize
    }

    /// Return the number of descriptors in the cache.
    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }
    /// Return the number of bytes in the journal.
    pub(crate) fn journal_len(&self) -> u64 {
        self.journal_len
    }
    /// Return the number of dead bytes occupying cache files.
    pub(crate) fn bytes_dropped(&self) -> u64 {
        self.bytes_dropped
    }
}

/// Append `md`'s annotation and body to the journal file `f`.
/// Returns the offset at which the body landed, and the total number
/// of bytes written.
fn append_to_journal(f: &mut std::fs::File, md: &Microdesc) -> std::io::Result<(usize, u64)> {
    let start = f.seek(SeekFrom::End(0))? as usize;
    let mut annotation_len = 0;
    if let Some(t) = md.last_listed {
        let annotation = format_last_listed(t);
        f.write_all(annotation.as_bytes())?;
        annotation_len = annotation.len();
    }
    let body = match &md.body {
        MdBody::Owned(b) => &b[..],
        // Entries headed for the journal always own their bodies.
        MdBody::InCacheFile => unreachable!("journaling a mapped microdescriptor"),
    };
    f.write_all(body)?;
    Ok((start + annotation_len, (annotation_len + body.len()) as u64))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{md_digest, md_entry, TestParser};
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn t(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn new_cache(dir: &std::path::Path) -> MicrodescCache {
        let store = DirStore::unlocked(dir);
        MicrodescCache::new(&store)
    }

    #[test]
    fn annotation_roundtrip() {
        let when = t(1_600_000_000);
        let line = format_last_listed(when);
        assert!(line.starts_with("@last-listed "));
        assert!(line.ends_with('\n'));
        assert_eq!(parse_last_listed(line.trim_end()), Some(when));
        assert_eq!(parse_last_listed("not an annotation"), None);
    }

    #[test]
    fn add_and_lookup() {
        let td = tempdir().unwrap();
        let mut cache = new_cache(td.path());
        let parser = TestParser::default();

        let input = [md_entry(1, None), md_entry(2, None)].concat();
        let added = cache
            .add_bytes(
                &input,
                SavedLocation::Nowhere,
                false,
                Some(t(5000)),
                None,
                &parser,
            )
            .unwrap();
        assert_eq!(added.len(), 2);
        assert_eq!(cache.len(), 2);

        let md = cache.lookup(&md_digest(1)).unwrap();
        assert_eq!(md.saved_location(), SavedLocation::InJournal);
        assert_eq!(md.last_listed(), Some(t(5000)));
        assert!(cache.journal_len() > 0);

        let body = cache.body_by_digest(&md_digest(1)).unwrap();
        assert!(body.starts_with(b"desc "));
        assert!(cache.body_by_digest(&md_digest(9)).is_none());
    }

    #[test]
    fn double_add_updates_last_listed_only() {
        let td = tempdir().unwrap();
        let mut cache = new_cache(td.path());
        let parser = TestParser::default();

        let input = md_entry(1, None);
        cache
            .add_bytes(&input, SavedLocation::Nowhere, false, Some(t(1000)), None, &parser)
            .unwrap();
        let journal_before = cache.journal_len();

        // Second add: no new entry, newer last_listed wins.
        let added = cache
            .add_bytes(&input, SavedLocation::Nowhere, false, Some(t(2000)), None, &parser)
            .unwrap();
        assert!(added.is_empty());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.journal_len(), journal_before);
        assert_eq!(cache.lookup(&md_digest(1)).unwrap().last_listed(), Some(t(2000)));

        // An older listing time does not regress the entry.
        cache
            .add_bytes(&input, SavedLocation::Nowhere, false, Some(t(500)), None, &parser)
            .unwrap();
        assert_eq!(cache.lookup(&md_digest(1)).unwrap().last_listed(), Some(t(2000)));
    }

    #[test]
    fn unrequested_descriptors_rejected() {
        let td = tempdir().unwrap();
        let mut cache = new_cache(td.path());
        let parser = TestParser::default();

        // We asked for descriptors 1 and 2, but received 1 and 3.
        let mut requested: HashSet<MdDigest> =
            [md_digest(1), md_digest(2)].iter().copied().collect();
        let input = [md_entry(1, None), md_entry(3, None)].concat();
        let added = cache
            .add_bytes(
                &input,
                SavedLocation::Nowhere,
                false,
                Some(t(1000)),
                Some(&mut requested),
                &parser,
            )
            .unwrap();

        assert_eq!(added, vec![md_digest(1)]);
        assert!(cache.lookup(&md_digest(3)).is_none());
        // Only the digest we never received remains requested.
        assert_eq!(requested.len(), 1);
        assert!(requested.contains(&md_digest(2)));
    }

    #[test]
    fn clean_needs_live_consensus() {
        let td = tempdir().unwrap();
        let mut cache = new_cache(td.path());
        let parser = TestParser::default();
        let input = md_entry(1, None);
        cache
            .add_bytes(&input, SavedLocation::Nowhere, false, Some(t(1000)), None, &parser)
            .unwrap();

        let long_after = t(1000) + TOLERATE_MICRODESC_AGE * 2;
        // Without a live microdesc consensus, cleaning is a no-op.
        cache.clean(None, false, false, long_after);
        assert_eq!(cache.len(), 1);
        // With one (or with force), the stale entry goes away.
        cache.clean(None, false, true, long_after);
        assert_eq!(cache.len(), 0);
        assert!(cache.bytes_dropped() > 0);
    }

    #[test]
    fn reload_roundtrip() {
        let td = tempdir().unwrap();
        let parser = TestParser::default();
        let listed = t(1_600_000_000);

        {
            let mut cache = new_cache(td.path());
            let input = [md_entry(1, None), md_entry(2, None)].concat();
            cache
                .add_bytes(&input, SavedLocation::Nowhere, false, Some(listed), None, &parser)
                .unwrap();
        }

        // A fresh cache object finds both entries in the journal,
        // with their annotations intact.
        let mut cache = new_cache(td.path());
        assert_eq!(cache.reload(&parser), 2);
        let md = cache.lookup(&md_digest(2)).unwrap();
        assert_eq!(md.saved_location(), SavedLocation::InJournal);
        assert_eq!(md.last_listed(), Some(listed));
    }

    #[test]
    fn rebuild_moves_entries_to_cache_file() {
        let td = tempdir().unwrap();
        let parser = TestParser::default();
        let mut cache = new_cache(td.path());
        let listed = t(1_600_000_000);

        let input: Vec<u8> = (1..=10).flat_map(|i| md_entry(i, None)).collect();
        cache
            .add_bytes(&input, SavedLocation::Nowhere, false, Some(listed), None, &parser)
            .unwrap();
        let bodies_before: Vec<Vec<u8>> = (1..=10)
            .map(|i| cache.body_by_digest(&md_digest(i)).unwrap().to_vec())
            .collect();

        assert!(cache.rebuild(true, true, listed).unwrap());

        assert_eq!(cache.journal_len(), 0);
        assert_eq!(cache.bytes_dropped(), 0);
        assert_eq!(std::fs::read(td.path().join("cached-microdescs.new")).unwrap(), b"");
        for i in 1..=10 {
            let md = cache.lookup(&md_digest(i)).unwrap();
            assert_eq!(md.saved_location(), SavedLocation::InCache);
            assert_eq!(
                cache.body_by_digest(&md_digest(i)).unwrap(),
                &bodies_before[(i - 1) as usize][..]
            );
        }
    }

    #[test]
    fn compaction_after_shrink() {
        // Fill the cache, rebuild, drop most entries, and make sure
        // the space-saving heuristics fire a second rebuild.
        let td = tempdir().unwrap();
        let parser = TestParser::default();
        let mut cache = new_cache(td.path());
        let listed = t(1_600_000_000);

        // 100 entries with fat bodies so the journal crosses the
        // 16 KiB threshold.
        let input: Vec<u8> = (1..=100).flat_map(|i| md_entry(i, Some(400))).collect();
        cache
            .add_bytes(&input, SavedLocation::Nowhere, false, Some(listed), None, &parser)
            .unwrap();
        assert!(cache.journal_len() >= 16384);
        assert!(cache.rebuild(false, true, listed).unwrap());
        assert_eq!(cache.len(), 100);

        // Now only 10 survive the cleaning cutoff.
        let newer = listed + Duration::from_secs(1000);
        let refresh: Vec<u8> = (1..=10).flat_map(|i| md_entry(i, Some(400))).collect();
        cache
            .add_bytes(&refresh, SavedLocation::Nowhere, false, Some(newer), None, &parser)
            .unwrap();
        let bodies_before: Vec<Vec<u8>> = (1..=10)
            .map(|i| cache.body_by_digest(&md_digest(i)).unwrap().to_vec())
            .collect();

        cache.clean(Some(listed + Duration::from_secs(1)), false, true, newer);
        assert_eq!(cache.len(), 10);
        assert!(cache.bytes_dropped() > 0);

        // Force a rebuild (the journal is empty, so the 16 KiB gate
        // would not fire on its own) and check the survivors.
        assert!(cache.rebuild(true, true, newer).unwrap());
        assert_eq!(cache.journal_len(), 0);
        assert_eq!(cache.bytes_dropped(), 0);
        for i in 1..=10 {
            let md = cache.lookup(&md_digest(i)).unwrap();
            assert_eq!(md.saved_location(), SavedLocation::InCache);
            assert_eq!(
                cache.body_by_digest(&md_digest(i)).unwrap(),
                &bodies_before[(i - 1) as usize][..]
            );
        }

        // Reload from the rebuilt file: same contents.
        let mut reloaded = new_cache(td.path());
        assert_eq!(reloaded.reload(&parser), 10);
        for i in 1..=10 {
            assert_eq!(
                reloaded.body_by_digest(&md_digest(i)).unwrap(),
                &bodies_before[(i - 1) as usize][..]
            );
        }
    }

    #[test]
    fn reference_counts() {
        let td = tempdir().unwrap();
        let parser = TestParser::default();
        let mut cache = new_cache(td.path());
        cache
            .add_bytes(&md_entry(1, None), SavedLocation::Nowhere, false, Some(t(1)), None, &parser)
            .unwrap();

        cache.note_held_by_node(&md_digest(1));
        cache.note_held_by_node(&md_digest(1));
        assert_eq!(cache.lookup(&md_digest(1)).unwrap().held_by_nodes(), 2);
        cache.note_dropped_by_node(&md_digest(1));
        assert_eq!(cache.lookup(&md_digest(1)).unwrap().held_by_nodes(), 1);

        // Reconciliation repairs a drifted count.
        cache.check_counts(&[md_digest(1)]);
        assert_eq!(cache.lookup(&md_digest(1)).unwrap().held_by_nodes(), 1);
    }

    #[test]
    fn average_size_estimate() {
        let td = tempdir().unwrap();
        let parser = TestParser::default();
        let mut cache = new_cache(td.path());
        assert_eq!(cache.average_size(), 512);
        cache
            .add_bytes(&md_entry(1, Some(100)), SavedLocation::Nowhere, false, None, None, &parser)
            .unwrap();
        assert!(cache.average_size() > 0);
    }
}
