use std::sync::Arc;

use thiserror::Error;

/// Result type used throughout the service crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the charm store core.
///
/// The type is `Clone` (sources are `Arc`-wrapped) so the entity cache can
/// store a failure once and replay the identical error to every waiter.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A blob name, upload id, or entity URL could not be resolved.
    #[error("{0} not found")]
    NotFound(String),

    /// Content disagrees with its declared hash, or a part was re-uploaded
    /// with a different hash.
    #[error("hash mismatch{}", fmt_context(.0))]
    HashMismatch(String),

    /// A multipart upload cannot be finished with the given parts.
    #[error("invalid upload: {0}")]
    InvalidUpload(String),

    /// A part exceeds the maximum size representable in a multipart index.
    #[error("part {part} too large ({size} bytes)")]
    PartTooLarge {
        /// The offending part number.
        part: u32,
        /// The size of the part in bytes.
        size: u64,
    },

    /// The executed-migrations list names a migration this binary does not
    /// know, meaning the database was written by newer code.
    #[error("found unknown migration {name:?}; running old code on a newer database?")]
    UnknownMigration {
        /// The unrecognized migration name.
        name: String,
    },

    /// A migration function failed; nothing after it was run.
    #[error("error executing migration {name:?}")]
    MigrationFailed {
        /// The name of the failed migration.
        name: String,
        /// The underlying failure.
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    /// The operation raced with, or was issued after, a cache close.
    #[error("entity cache is closed")]
    Closed,

    /// An insert collided with an existing document id.
    #[error("duplicate key {0:?}")]
    DuplicateKey(String),

    /// The document store failed.
    #[error("database error: {0}")]
    Database(String),

    /// A malformed argument, such as an out-of-range part number.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// An I/O error from the object backend or a payload stream.
    #[error("i/o error")]
    Io(#[source] Arc<std::io::Error>),

    /// A document failed to round-trip through serialization.
    #[error("document error")]
    Serde(#[source] Arc<serde_json::Error>),
}

fn fmt_context(context: &str) -> String {
    if context.is_empty() {
        String::new()
    } else {
        format!(" for {context}")
    }
}

impl Error {
    /// Shorthand for a [`Error::NotFound`] describing the given resource.
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    /// Returns `true` for [`Error::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages() {
        assert_eq!(
            Error::not_found("blob \"x\"").to_string(),
            "blob \"x\" not found"
        );
        assert_eq!(Error::HashMismatch(String::new()).to_string(), "hash mismatch");
        assert_eq!(
            Error::HashMismatch("part 3".into()).to_string(),
            "hash mismatch for part 3"
        );
        assert_eq!(
            Error::UnknownMigration { name: "migr-1".into() }.to_string(),
            "found unknown migration \"migr-1\"; running old code on a newer database?"
        );
    }

    #[test]
    fn errors_are_cloneable() {
        let err: Error = std::io::Error::other("boom").into();
        let clone = err.clone();
        assert_eq!(err.to_string(), clone.to_string());
    }
}
