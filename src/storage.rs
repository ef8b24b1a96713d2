//! Methods for storing and loading directory information from disk.
//!
//! Everything lives under a single data directory: one file per
//! cached consensus, one per parked ("unverified") consensus, the
//! microdescriptor cache file and its journal, and a subdirectory of
//! legacy v2 status documents.  A lockfile guards the directory
//! against concurrent writers from other processes; if we can't get
//! the lock, we fall back to running read-only and skip persistence.

use crate::doc::ConsensusFlavor;
use crate::ids::RsaIdentity;
use crate::Result;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[cfg(target_family = "unix")]
use std::os::unix::fs::DirBuilderExt;

/// The bytes of a document we've loaded or mapped from disk.
///
/// Where possible we memory-map cache files rather than reading them
/// in, since the microdescriptor cache keeps referring to the mapped
/// bytes for as long as the file is current.
#[derive(Debug)]
pub(crate) enum InputBytes {
    /// Bytes we read into memory.
    Owned(Vec<u8>),
    /// Bytes mapped from a file.
    #[cfg(feature = "mmap")]
    Mapped(memmap2::Mmap),
}

impl InputBytes {
    /// Load the file at `path`, mapping it if possible.
    pub(crate) fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let f = fs::File::open(path)?;
        #[cfg(feature = "mmap")]
        {
            let mapping = unsafe {
                // I'd rather have a safe option, but that's not
                // possible with mmap, since other processes could in
                // theory replace the contents of the file while we're
                // using it.
                memmap2::Mmap::map(&f)
            };
            if let Ok(m) = mapping {
                return Ok(InputBytes::Mapped(m));
            }
        }
        use std::io::{BufReader, Read};
        let mut f = BufReader::new(f);
        let mut result = Vec::new();
        f.read_to_end(&mut result)?;
        Ok(InputBytes::Owned(result))
    }

    /// Return the length of the loaded bytes.
    pub(crate) fn len(&self) -> usize {
        self.as_ref().len()
    }
}

impl AsRef<[u8]> for InputBytes {
    fn as_ref(&self) -> &[u8] {
        match self {
            InputBytes::Owned(v) => &v[..],
            #[cfg(feature = "mmap")]
            InputBytes::Mapped(m) => &m[..],
        }
    }
}

/// Handle to the on-disk state of the networkstatus subsystem.
pub(crate) struct DirStore {
    /// The data directory under which every file lives.
    datadir: PathBuf,
    /// Lockfile preventing concurrent write attempts from different
    /// processes.
    ///
    /// If this is None we aren't using a lockfile.  Watch out!
    lockfile: Option<fslock::LockFile>,
    /// True if we failed to get the lock and must not write.
    readonly: bool,
}

impl DirStore {
    /// Open (creating if necessary) the data directory at `path` and
    /// try to take out its lock.
    ///
    /// If another process holds the lock, the store still opens, but
    /// in read-only mode.
    pub(crate) fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let datadir = path.as_ref().to_path_buf();

        #[cfg(target_family = "unix")]
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&datadir)?;
        #[cfg(not(target_family = "unix"))]
        fs::DirBuilder::new().recursive(true).create(&datadir)?;

        let lockpath = datadir.join("netstatus.lock");
        /// Flatten a lockfile error into our io error kind.
        fn lock_err(e: fslock::Error) -> crate::Error {
            std::io::Error::new(std::io::ErrorKind::Other, e.to_string()).into()
        }
        let mut lockfile = fslock::LockFile::open(&lockpath).map_err(lock_err)?;
        let readonly = !lockfile.try_lock().map_err(lock_err)?;
        if readonly {
            warn!(
                "Another process holds the lock on {:?}; running with a read-only directory cache.",
                datadir
            );
        }
        Ok(DirStore {
            datadir,
            lockfile: Some(lockfile),
            readonly,
        })
    }

    /// Construct a store with no lockfile.  (Testing helper.)
    #[cfg(test)]
    pub(crate) fn unlocked<P: AsRef<Path>>(path: P) -> Self {
        DirStore {
            datadir: path.as_ref().to_path_buf(),
            lockfile: None,
            readonly: false,
        }
    }

    /// Return true if this store must not write to disk.
    pub(crate) fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Return the path for the installed consensus of `flavor`.
    pub(crate) fn consensus_fname(&self, flavor: ConsensusFlavor) -> PathBuf {
        match flavor {
            ConsensusFlavor::Ns => self.datadir.join("cached-consensus"),
            ConsensusFlavor::Microdesc => self.datadir.join("cached-microdesc-consensus"),
        }
    }

    /// Return the path for the parked, not-yet-verified consensus of
    /// `flavor`.
    pub(crate) fn unverified_fname(&self, flavor: ConsensusFlavor) -> PathBuf {
        match flavor {
            ConsensusFlavor::Ns => self.datadir.join("unverified-consensus"),
            ConsensusFlavor::Microdesc => self.datadir.join("unverified-microdesc-consensus"),
        }
    }

    /// Return the path of the microdescriptor cache file.
    pub(crate) fn md_cache_fname(&self) -> PathBuf {
        self.datadir.join("cached-microdescs")
    }

    /// Return the path of the microdescriptor journal.
    pub(crate) fn md_journal_fname(&self) -> PathBuf {
        self.datadir.join("cached-microdescs.new")
    }

    /// Return the directory holding legacy v2 status documents.
    pub(crate) fn v2_status_dir(&self) -> PathBuf {
        self.datadir.join("cached-status")
    }

    /// Return the path at which to cache the v2 status document from
    /// the authority with `identity`.
    pub(crate) fn v2_status_fname(&self, identity: &RsaIdentity) -> PathBuf {
        self.v2_status_dir()
            .join(hex::encode(identity.as_bytes()).to_uppercase())
    }

    /// Write `contents` to `path`, atomically replacing any previous
    /// file.
    ///
    /// Failures are logged but not propagated: the in-memory state
    /// stays authoritative whether or not the disk cooperates.
    pub(crate) fn write_doc(&self, path: &Path, contents: &[u8]) {
        if self.readonly {
            info!("Skipping write to {:?}: directory cache is read-only", path);
            return;
        }
        if let Err(e) = write_replacing(path, contents) {
            warn!("Couldn't write to {:?}: {}", path, e);
        }
    }

    /// Remove the file at `path` if it exists.
    pub(crate) fn remove_doc(&self, path: &Path) {
        if self.readonly {
            return;
        }
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Couldn't remove {:?}: {}", path, e);
            }
        }
    }

    /// Load the file at `path`, or return None if it doesn't exist.
    pub(crate) fn load_doc(&self, path: &Path) -> Result<Option<InputBytes>> {
        match InputBytes::load(path) {
            Ok(b) => Ok(Some(b)),
            Err(crate::Error::Io(ref e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Return the modification time of `path`, if the file exists.
    pub(crate) fn mtime(&self, path: &Path) -> Option<std::time::SystemTime> {
        fs::metadata(path).and_then(|m| m.modified()).ok()
    }

    /// List the v2 status files currently cached, as (hex filename,
    /// full path, mtime) tuples.
    pub(crate) fn list_v2_status_files(
        &self,
    ) -> Result<Vec<(String, PathBuf, Option<std::time::SystemTime>)>> {
        let dir = self.v2_status_dir();
        let mut found = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(n) => n,
                Err(_) => continue,
            };
            let path = entry.path();
            let mtime = self.mtime(&path);
            found.push((name, path, mtime));
        }
        Ok(found)
    }

    /// Make sure the v2 status directory exists before writing into
    /// it.
    pub(crate) fn ensure_v2_status_dir(&self) -> Result<()> {
        if self.readonly {
            return Ok(());
        }
        #[cfg(target_family = "unix")]
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(self.v2_status_dir())?;
        #[cfg(not(target_family = "unix"))]
        fs::DirBuilder::new()
            .recursive(true)
            .create(self.v2_status_dir())?;
        Ok(())
    }
}

/// Write `contents` to a temporary file beside `path` and rename it
/// into place, so that a crash can't leave a half-written document.
pub(crate) fn write_replacing(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(contents)?;
        f.sync_data()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_bytes() {
        let td = tempdir().unwrap();

        let absent = td.path().join("absent");
        assert!(InputBytes::load(&absent).is_err());

        let goodfile = td.path().join("goodfile");
        fs::write(&goodfile, b"This is a reasonable file.\n").unwrap();
        let b = InputBytes::load(&goodfile).unwrap();
        assert_eq!(b.as_ref(), b"This is a reasonable file.\n");
        assert_eq!(b.len(), 27);
    }

    #[test]
    fn atomic_replace() {
        let td = tempdir().unwrap();
        let p = td.path().join("doc");
        write_replacing(&p, b"first").unwrap();
        assert_eq!(fs::read(&p).unwrap(), b"first");
        write_replacing(&p, b"second").unwrap();
        assert_eq!(fs::read(&p).unwrap(), b"second");
        // No temporary file is left behind.
        assert!(!td.path().join("doc.tmp").exists());
    }

    #[test]
    fn store_paths() {
        let td = tempdir().unwrap();
        let store = DirStore::unlocked(td.path());
        assert!(store
            .consensus_fname(ConsensusFlavor::Ns)
            .ends_with("cached-consensus"));
        assert!(store
            .consensus_fname(ConsensusFlavor::Microdesc)
            .ends_with("cached-microdesc-consensus"));
        assert!(store
            .unverified_fname(ConsensusFlavor::Microdesc)
            .ends_with("unverified-microdesc-consensus"));
        let id = RsaIdentity::from_bytes(&[0xab; 20]).unwrap();
        let p = store.v2_status_fname(&id);
        assert!(p
            .to_string_lossy()
            .ends_with("cached-status/ABABABABABABABABABABABABABABABABABABABAB"));
    }

    #[test]
    fn store_roundtrip() {
        let td = tempdir().unwrap();
        let store = DirStore::open(td.path()).unwrap();
        assert!(!store.is_readonly());

        let p = store.consensus_fname(ConsensusFlavor::Ns);
        store.write_doc(&p, b"pretend consensus");
        let loaded = store.load_doc(&p).unwrap().unwrap();
        assert_eq!(loaded.as_ref(), b"pretend consensus");

        store.remove_doc(&p);
        assert!(store.load_doc(&p).unwrap().is_none());
        // Removing twice is fine.
        store.remove_doc(&p);
    }

    #[test]
    fn v2_listing() {
        let td = tempdir().unwrap();
        let store = DirStore::open(td.path()).unwrap();
        assert!(store.list_v2_status_files().unwrap().is_empty());
        store.ensure_v2_status_dir().unwrap();
        let id = RsaIdentity::from_bytes(&[1; 20]).unwrap();
        store.write_doc(&store.v2_status_fname(&id), b"v2 doc");
        let listed = store.list_v2_status_files().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0.len(), 40);
    }
}
