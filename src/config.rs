//! Storage configuration.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::partition::DEFAULT_WRITE_BUFFER_SIZE;

/// Configuration for a [`crate::Storage`] instance.
///
/// Loadable from a TOML file with [`StorageConfig::load_from_file`]; any
/// field absent from the file falls back to its default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the partition file and its secondary indexes.
    pub storage_directory: PathBuf,
    /// Capacity of the in-memory write buffer, in bytes. Records larger than
    /// this bypass the buffer entirely.
    pub write_buffer_size: usize,
    /// Whether reads may observe buffered-but-unflushed bytes.
    pub dirty_reads: bool,
    /// Interval, in milliseconds, at which an embedding application should
    /// call [`crate::Storage::tick`] to drive time-based flushing. `0` means
    /// "flush only on buffer-full or explicit close", since this crate has
    /// no background timer of its own.
    pub flush_delay_ms: u64,
    /// Opaque fingerprint recorded in each index's header and compared
    /// bit-exact on reopen.
    pub metadata: BTreeMap<String, String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_directory: PathBuf::from("./data"),
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            dirty_reads: true,
            flush_delay_ms: 0,
            metadata: BTreeMap::new(),
        }
    }
}

impl StorageConfig {
    /// Loads configuration from a TOML file, falling back to defaults for
    /// any field the file does not set.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| StorageError::io(path, e))?;
        toml::from_str(&text).map_err(|e| StorageError::InvalidMetadata {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}
