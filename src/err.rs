//! Declare an error type for the tor-netstatus crate.

use thiserror::Error;

/// An error originated by the networkstatus code.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A document could not be parsed at all.
    #[error("unparseable document: {0}")]
    BadParse(&'static str),
    /// We got a consensus of one flavor when we insisted on another.
    #[error("consensus had flavor {got}, but we required {expected}")]
    WrongFlavor {
        /// The flavor we insisted on.
        expected: &'static str,
        /// The flavor the document actually had.
        got: &'static str,
    },
    /// We received a document that we already have.
    #[error("duplicate document")]
    Duplicate,
    /// We received a document no newer than the one we already have.
    #[error("document is older than the one we have")]
    Stale,
    /// A document was published too far in the future for our clock to
    /// be right.
    #[error("document is from {0} seconds in the future; clock skew?")]
    ClockSkew(i64),
    /// A cached document was too old to be worth loading.
    #[error("document is obsolete")]
    Obsolete,
    /// A consensus did not have enough good signatures from recognized
    /// authorities, and fetching more certificates cannot fix that.
    #[error("not enough good signatures on consensus")]
    InsufficientSignatures,
    /// A directory server sent us something we never asked for.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    /// We received a document we didn't want at all.
    #[error("unwanted object: {0}")]
    Unwanted(&'static str),
    /// A document's lifetime was internally inconsistent.
    #[error("invalid consensus lifetime")]
    InvalidLifetime,
    /// We couldn't read something from disk that we should have been
    /// able to read.
    #[error("corrupt cache: {0}")]
    CacheCorruption(&'static str),
    /// A bad argument was provided to some function.
    #[error("bad argument: {0}")]
    BadArgument(&'static str),
    /// An IO error occurred while manipulating our on-disk cache.
    #[error("io error: {0}")]
    Io(std::sync::Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Io(std::sync::Arc::new(e))
    }
}

impl Error {
    /// Return true if a download that failed with this error should
    /// count against the download status for its resource.
    ///
    /// Mild failures (duplicates, stale documents, things we simply
    /// don't want) don't advance the retry schedule; hard failures do.
    pub fn bumps_failure_count(&self) -> bool {
        matches!(self, Error::BadParse(_) | Error::InsufficientSignatures)
    }
}

/// A Result using the Error type from the tor-netstatus crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn failure_severity() {
        assert!(Error::BadParse("no header").bumps_failure_count());
        assert!(Error::InsufficientSignatures.bumps_failure_count());
        assert!(!Error::Duplicate.bumps_failure_count());
        assert!(!Error::Stale.bumps_failure_count());
        assert!(!Error::Obsolete.bumps_failure_count());
        assert!(!Error::Unwanted("flavor not in use").bumps_failure_count());
    }
}
