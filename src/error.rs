//! Error types for the storage engine.
//!
//! Structural corruption and I/O failures are represented here and are
//! fatal to the enclosing operation. Expected misses (a slot past the end
//! of an index, a closed object, a non-matching range) are *not* errors:
//! they are represented as `None`/`false` at the call site, per the
//! sentinel convention documented on each operation.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by partitions, indexes, storage, and consumers.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem I/O failed. Fatal to the partition/index that hit it.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The first six bytes of the 8-byte magic did not match.
    #[error("invalid file header at {path}: expected {expected:?}, found {found:?}")]
    InvalidFileHeader {
        path: PathBuf,
        expected: &'static [u8; 6],
        found: Vec<u8>,
    },

    /// The two-byte version suffix of the magic did not match.
    #[error("unsupported file version at {path}: expected {expected:?}, found {found:?}")]
    InvalidFileVersion {
        path: PathBuf,
        expected: &'static [u8; 2],
        found: Vec<u8>,
    },

    /// The declared metadata length does not fit within the file.
    #[error("declared metadata length {declared} exceeds file size {file_size} at {path}")]
    InvalidMetadataSize {
        path: PathBuf,
        declared: u32,
        file_size: u64,
    },

    /// The metadata block is not valid UTF-8, or does not end in `\n`.
    #[error("malformed metadata block at {path}: {reason}")]
    InvalidMetadata { path: PathBuf, reason: String },

    /// The metadata blob on disk does not bit-exactly match the one supplied at open.
    #[error("index metadata at {path} does not match metadata supplied at open")]
    IndexMetadataMismatch { path: PathBuf },

    /// The entry region's length is not a whole multiple of the entry size.
    #[error("index body at {path} is corrupt: {len} bytes is not a multiple of {entry_size}")]
    IndexFileCorrupt {
        path: PathBuf,
        len: u64,
        entry_size: usize,
    },

    /// `readFrom` was given an `expected_size` that didn't match the on-disk length.
    #[error("data size mismatch at {path}: expected {expected}, found {found}")]
    InvalidDataSize {
        path: PathBuf,
        expected: u32,
        found: u32,
    },

    /// A record's framing (length prefix + trailer, or sentinel) is torn or malformed.
    #[error("corrupt file at {path}: {reason}")]
    CorruptFile { path: PathBuf, reason: String },

    /// `truncate` was given a position that is not a valid record boundary.
    #[error("invalid truncation boundary {position} in {path}")]
    InvalidBoundary { path: PathBuf, position: i64 },

    /// An operation that requires an open partition/index/storage was attempted on a
    /// closed or destroyed one.
    #[error("operation attempted on a closed object at {path}")]
    NotOpen { path: PathBuf },

    /// A matcher predicate failed while evaluating whether a document belongs in an index.
    #[error("matcher for index {index} failed: {reason}")]
    MatcherFailed { index: String, reason: String },

    /// Document encode/decode failed at the `DocumentCodec` boundary.
    #[error("codec error: {0}")]
    Codec(String),

    /// Reserved for the external event-stream layer's optimistic-concurrency checks;
    /// the storage core never returns this itself.
    #[error("optimistic concurrency conflict")]
    OptimisticConcurrency,
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
