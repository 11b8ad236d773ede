//! Append-only fixed-record index mapping entry numbers to partition
//! locations.
//!
//! On-disk layout: `magic="nesidx01"` | `metadataLength: u32 BE` | metadata
//! JSON (UTF-8, `metadataLength` bytes, ending in `\n`) | packed [`Entry`]
//! records. New entries are batched in memory and flushed to a side `.wal`
//! file every [`WAL_FLUSH_THRESHOLD`] additions, with a full rewrite
//! (compaction) happening on explicit [`Index::flush`]/[`Index::close`].

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write as IoWrite};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::entry::{Entry, ENTRY_SIZE};
use crate::error::StorageError;

const MAGIC_PREFIX: &[u8; 6] = b"nesidx";
const MAGIC_VERSION: &[u8; 2] = b"01";

/// Number of additions batched in the in-memory/WAL tail before a full
/// index-file rewrite is warranted. Mirrors the amortization strategy that
/// spec.md's "buffered appends" language implies but leaves unspecified.
pub const WAL_FLUSH_THRESHOLD: usize = 100;

pub type IndexMetadata = BTreeMap<String, String>;

/// A single named secondary index.
pub struct Index {
    path: PathBuf,
    file: Option<File>,
    header_len: u64,
    metadata: IndexMetadata,
    entries: Vec<Entry>,
    /// How many of `entries` are durably on disk.
    flushed: usize,
    pending_callbacks: Vec<(usize, u64, Box<dyn FnOnce(u64)>)>,
}

impl Index {
    /// Opens (creating if necessary) the index file at `path`.
    ///
    /// If the file exists, its stored metadata must bit-exactly match
    /// `metadata`, or [`StorageError::IndexMetadataMismatch`] is returned.
    pub fn open(path: impl AsRef<Path>, metadata: IndexMetadata) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let wal_path = wal_path_for(&path);

        if path.exists() {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| StorageError::io(&path, e))?;
            let mut header = [0u8; 8];
            file.read_exact(&mut header).map_err(|e| StorageError::io(&path, e))?;
            crate::partition::validate_magic_with(&path, &header, MAGIC_PREFIX, MAGIC_VERSION)?;

            let mut len_buf = [0u8; 4];
            file.read_exact(&mut len_buf).map_err(|e| StorageError::io(&path, e))?;
            let metadata_len = u32::from_be_bytes(len_buf);

            let file_size = file.metadata().map_err(|e| StorageError::io(&path, e))?.len();
            let header_len = 8 + 4 + metadata_len as u64;
            if header_len > file_size {
                return Err(StorageError::InvalidMetadataSize {
                    path: path.clone(),
                    declared: metadata_len,
                    file_size,
                });
            }

            let mut metadata_buf = vec![0u8; metadata_len as usize];
            file.read_exact(&mut metadata_buf)
                .map_err(|e| StorageError::io(&path, e))?;
            let on_disk_metadata = parse_metadata(&path, &metadata_buf)?;
            if on_disk_metadata != metadata {
                return Err(StorageError::IndexMetadataMismatch { path: path.clone() });
            }

            let body_len = file_size - header_len;
            if body_len % ENTRY_SIZE as u64 != 0 {
                return Err(StorageError::IndexFileCorrupt {
                    path: path.clone(),
                    len: body_len,
                    entry_size: ENTRY_SIZE,
                });
            }

            let mut body = vec![0u8; body_len as usize];
            file.read_exact(&mut body).map_err(|e| StorageError::io(&path, e))?;
            let mut entries: Vec<Entry> = body
                .chunks_exact(ENTRY_SIZE)
                .map(|chunk| Entry::decode(chunk.try_into().expect("ENTRY_SIZE chunk")))
                .collect();

            if wal_path.exists() {
                let wal_entries = read_wal(&wal_path)?;
                entries.extend(wal_entries);
            }

            let flushed = entries.len();
            debug!(path = %path.display(), entries = flushed, "index opened");

            Ok(Self {
                path,
                file: Some(file),
                header_len,
                metadata,
                entries,
                flushed,
                pending_callbacks: Vec::new(),
            })
        } else {
            let mut metadata_buf = serde_json::to_vec(&metadata).map_err(|e| {
                StorageError::InvalidMetadata {
                    path: path.clone(),
                    reason: e.to_string(),
                }
            })?;
            metadata_buf.push(b'\n');

            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .map_err(|e| StorageError::io(&path, e))?;
            let mut header = [0u8; 8];
            header[0..6].copy_from_slice(MAGIC_PREFIX);
            header[6..8].copy_from_slice(MAGIC_VERSION);
            file.write_all(&header).map_err(|e| StorageError::io(&path, e))?;
            file.write_all(&(metadata_buf.len() as u32).to_be_bytes())
                .map_err(|e| StorageError::io(&path, e))?;
            file.write_all(&metadata_buf).map_err(|e| StorageError::io(&path, e))?;
            file.sync_all().map_err(|e| StorageError::io(&path, e))?;

            let header_len = 8 + 4 + metadata_buf.len() as u64;
            debug!(path = %path.display(), "index created");

            Ok(Self {
                path,
                file: Some(file),
                header_len,
                metadata,
                entries: Vec::new(),
                flushed: 0,
                pending_callbacks: Vec::new(),
            })
        }
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    /// Number of entries currently known (flushed + buffered).
    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a new entry, returning its byte position in the index file.
    /// `callback`, if given, fires with that position once the entry is
    /// durable. Returns `None` if the index is closed.
    pub fn add(
        &mut self,
        entry: Entry,
        callback: Option<Box<dyn FnOnce(u64)>>,
    ) -> Result<Option<u64>, StorageError> {
        if self.file.is_none() {
            return Ok(None);
        }
        let slot = self.entries.len() + 1;
        let position = self.header_len + (slot as u64 - 1) * ENTRY_SIZE as u64;
        self.entries.push(entry);
        if let Some(cb) = callback {
            self.pending_callbacks.push((slot, position, cb));
        }
        if self.entries.len() - self.flushed >= WAL_FLUSH_THRESHOLD {
            self.flush()?;
        } else {
            self.append_wal(entry)?;
        }
        Ok(Some(position))
    }

    /// Fetches the entry at 1-based slot `n`. Negative `n` counts from the
    /// end (`-1` is the last entry). Returns `None` for a closed index or an
    /// out-of-range slot.
    pub fn get(&self, n: i64) -> Option<Entry> {
        if self.file.is_none() || n == 0 {
            return None;
        }
        let len = self.entries.len() as i64;
        let idx = if n > 0 { n } else { len + n + 1 };
        if idx < 1 || idx > len {
            return None;
        }
        Some(self.entries[(idx - 1) as usize])
    }

    /// Fetches the inclusive slot range `[from, to]` (1-based, negative
    /// counts from the end; `to = None` means "through the last entry").
    /// Returns `None` if the index is closed or the range is invalid.
    pub fn range(&self, from: i64, to: Option<i64>) -> Option<Vec<Entry>> {
        if self.file.is_none() {
            return None;
        }
        let len = self.entries.len() as i64;
        let norm = |n: i64| if n > 0 { n } else { len + n + 1 };
        let from = norm(from);
        let to = to.map(norm).unwrap_or(len);
        if from < 1 || to > len || from > to {
            return None;
        }
        Some(self.entries[(from - 1) as usize..to as usize].to_vec())
    }

    /// All entries currently known.
    pub fn all(&self) -> Option<Vec<Entry>> {
        self.range(1, None)
    }

    pub fn last_entry(&self) -> Option<Entry> {
        self.get(-1)
    }

    /// Binary search over the monotonically non-decreasing `number` field.
    ///
    /// With `min = false` (default), returns the largest slot whose number is
    /// `<= target` (0 if none). With `min = true`, returns the smallest slot
    /// whose number is `>= target` (0 if none).
    pub fn find(&self, target: u32, min: bool) -> u32 {
        if min {
            let idx = self.entries.partition_point(|e| e.number < target);
            if idx == self.entries.len() {
                0
            } else {
                (idx + 1) as u32
            }
        } else {
            let count = self.entries.partition_point(|e| e.number <= target);
            count as u32
        }
    }

    /// Drops entries after 1-based slot `after`. Negative clears the index
    /// entirely. Values `>=` the current length are no-ops.
    pub fn truncate(&mut self, after: i64) -> Result<(), StorageError> {
        if self.file.is_none() {
            return Err(StorageError::NotOpen {
                path: self.path.clone(),
            });
        }

        let keep = if after < 0 {
            0
        } else if after as usize >= self.entries.len() {
            return Ok(());
        } else {
            after as usize
        };

        self.entries.truncate(keep);
        self.pending_callbacks.clear();
        // Always force a full rewrite from `self.entries`, never a blind
        // `set_len`: `self.flushed` may lag behind `keep` (entries only
        // batched into the WAL tail), and growing a file with `set_len`
        // zero-fills the new region instead of writing real entry bytes.
        self.rewrite_body()
    }

    /// Flushes buffered entries to the index file (compacting away any WAL
    /// tail) and fsyncs.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        if self.entries.len() == self.flushed {
            remove_wal(&self.path);
            return Ok(());
        }
        self.rewrite_body()
    }

    /// Rewrites the whole entry body from `self.entries`, unconditionally.
    /// Used directly by `truncate`, which cannot rely on the `flush` early
    /// return (the file may need shrinking even when `entries.len()` happens
    /// to equal `self.flushed`).
    fn rewrite_body(&mut self) -> Result<(), StorageError> {
        let file = self.file.as_mut().ok_or_else(|| StorageError::NotOpen {
            path: self.path.clone(),
        })?;
        let mut body = Vec::with_capacity(self.entries.len() * ENTRY_SIZE);
        for e in &self.entries {
            body.extend_from_slice(&e.encode());
        }
        use std::io::{Seek, SeekFrom};
        file.seek(SeekFrom::Start(self.header_len))
            .map_err(|e| StorageError::io(&self.path, e))?;
        file.write_all(&body).map_err(|e| StorageError::io(&self.path, e))?;
        file.set_len(self.header_len + body.len() as u64)
            .map_err(|e| StorageError::io(&self.path, e))?;
        file.sync_all().map_err(|e| StorageError::io(&self.path, e))?;
        self.flushed = self.entries.len();
        remove_wal(&self.path);

        for (slot, position, cb) in std::mem::take(&mut self.pending_callbacks) {
            if slot <= self.flushed {
                cb(position);
            }
        }
        Ok(())
    }

    /// Flushes and releases the file handle.
    pub fn close(&mut self) -> Result<(), StorageError> {
        self.flush()?;
        self.file = None;
        Ok(())
    }

    /// Closes and removes the index file (and any WAL tail) from disk.
    pub fn destroy(mut self) -> Result<(), StorageError> {
        self.file = None;
        remove_wal(&self.path);
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|e| StorageError::io(&self.path, e))?;
        }
        Ok(())
    }

    /// Rebuilds an index from scratch by replaying a partition's records
    /// through `assign`, which maps each `(position, payload)` pair to the
    /// `number` it should be assigned. Overwrites any existing in-memory
    /// entries; callers typically pair this with a fresh [`Index::open`].
    pub fn rebuild(
        &mut self,
        records: &[(u64, usize)],
        partition_id: u32,
        mut assign: impl FnMut(usize) -> u32,
    ) -> Result<(), StorageError> {
        self.entries.clear();
        self.flushed = 0;
        remove_wal(&self.path);
        for (i, (position, size)) in records.iter().enumerate() {
            let number = assign(i);
            self.entries
                .push(Entry::new(number, *position, *size as u32, partition_id));
        }
        self.flush()
    }

    fn append_wal(&mut self, entry: Entry) -> Result<(), StorageError> {
        let wal_path = wal_path_for(&self.path);
        let mut wal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&wal_path)
            .map_err(|e| StorageError::io(&wal_path, e))?;
        wal.write_all(&entry.encode())
            .map_err(|e| StorageError::io(&wal_path, e))?;
        wal.sync_all().map_err(|e| StorageError::io(&wal_path, e))?;
        Ok(())
    }
}

impl Drop for Index {
    fn drop(&mut self) {
        if self.file.is_some() {
            if let Err(err) = self.flush() {
                warn!(path = %self.path.display(), %err, "failed to flush index on drop");
            }
        }
    }
}

fn parse_metadata(path: &Path, bytes: &[u8]) -> Result<IndexMetadata, StorageError> {
    let text = std::str::from_utf8(bytes).map_err(|e| StorageError::InvalidMetadata {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !text.ends_with('\n') {
        return Err(StorageError::InvalidMetadata {
            path: path.to_path_buf(),
            reason: "metadata block does not end in newline".to_string(),
        });
    }
    serde_json::from_str(text.trim_end()).map_err(|e| StorageError::InvalidMetadata {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn wal_path_for(path: &Path) -> PathBuf {
    let mut wal = path.as_os_str().to_owned();
    wal.push(".wal");
    PathBuf::from(wal)
}

fn read_wal(wal_path: &Path) -> Result<Vec<Entry>, StorageError> {
    let bytes = fs::read(wal_path).map_err(|e| StorageError::io(wal_path, e))?;
    if bytes.len() % ENTRY_SIZE != 0 {
        return Err(StorageError::IndexFileCorrupt {
            path: wal_path.to_path_buf(),
            len: bytes.len() as u64,
            entry_size: ENTRY_SIZE,
        });
    }
    Ok(bytes
        .chunks_exact(ENTRY_SIZE)
        .map(|c| Entry::decode(c.try_into().expect("ENTRY_SIZE chunk")))
        .collect())
}

fn remove_wal(path: &Path) {
    let wal_path = wal_path_for(path);
    if wal_path.exists() {
        let _ = fs::remove_file(wal_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use test_case::test_case;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn meta() -> IndexMetadata {
        let mut m = BTreeMap::new();
        m.insert("version".to_string(), "1".to_string());
        m
    }

    #[test]
    fn add_and_get_roundtrip() {
        let dir = tempdir().unwrap();
        let mut idx = Index::open(dir.path().join("i"), meta()).unwrap();
        idx.add(Entry::new(1, 8, 10, 0), None).unwrap();
        idx.add(Entry::new(2, 22, 5, 0), None).unwrap();
        assert_eq!(idx.get(1).unwrap().number, 1);
        assert_eq!(idx.get(-1).unwrap().number, 2);
        assert!(idx.get(3).is_none());
        assert!(idx.get(0).is_none());
    }

    #[test]
    fn metadata_mismatch_on_reopen_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("i");
        Index::open(&path, meta()).unwrap();
        let mut other = BTreeMap::new();
        other.insert("version".to_string(), "2".to_string());
        let result = Index::open(&path, other);
        assert!(matches!(result, Err(StorageError::IndexMetadataMismatch { .. })));
    }

    #[test_case(7, false => 3; "below an even number rounds down")]
    #[test_case(7, true => 4; "below an even number rounds up")]
    #[test_case(0, false => 0; "before the first entry")]
    #[test_case(100, true => 0; "past the last entry")]
    #[test_case(20, false => 10; "exact match on the last entry")]
    fn find_with_mapped_numbers(target: u32, min: bool) -> u32 {
        let dir = tempdir().unwrap();
        let mut idx = Index::open(dir.path().join("i"), meta()).unwrap();
        for i in 1..=10u32 {
            idx.add(Entry::new(i * 2, 0, 0, 0), None).unwrap();
        }
        idx.find(target, min)
    }

    #[test]
    fn twenty_five_entries_survive_close_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("i");
        {
            let mut idx = Index::open(&path, meta()).unwrap();
            for i in 1..=25u32 {
                idx.add(Entry::new(i, (i as u64) * 10, 4, 0), None).unwrap();
            }
            idx.close().unwrap();
        }
        let idx = Index::open(&path, meta()).unwrap();
        assert_eq!(idx.len(), 25);
        assert_eq!(idx.all().unwrap().len(), 25);
        assert_eq!(idx.get(-1).unwrap().number, 25);
    }

    #[test]
    fn truncate_then_reopen_negative_get() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("i");
        {
            let mut idx = Index::open(&path, meta()).unwrap();
            for i in 1..=5u32 {
                idx.add(Entry::new(i, 0, 0, 0), None).unwrap();
            }
            idx.truncate(2).unwrap();
            idx.close().unwrap();
        }
        let idx = Index::open(&path, meta()).unwrap();
        assert_eq!(idx.len(), 2);
        assert_eq!(idx.get(-1).unwrap().number, 2);
    }

    #[test]
    fn truncate_before_wal_threshold_keeps_real_entry_bytes() {
        init_tracing();
        let dir = tempdir().unwrap();
        let path = dir.path().join("i");
        {
            let mut idx = Index::open(&path, meta()).unwrap();
            for i in 1..=10u32 {
                // Each entry gets a distinct, non-zero position/size so a
                // zero-filled record would be trivially distinguishable.
                idx.add(Entry::new(i, (i as u64) * 100, i * 7, 0), None)
                    .unwrap();
            }
            idx.truncate(7).unwrap();
            // No explicit close(): Drop must see a file already holding the
            // real entry bytes, not rely on a later flush to fix them up.
        }
        let idx = Index::open(&path, meta()).unwrap();
        assert_eq!(idx.len(), 7);
        for i in 1..=7u32 {
            let entry = idx.get(i as i64).unwrap();
            assert_eq!(entry.number, i);
            assert_eq!(entry.position, (i as u64) * 100);
            assert_eq!(entry.size, i * 7);
        }
    }

    #[test]
    fn corrupted_tail_bytes_are_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("i");
        {
            let mut idx = Index::open(&path, meta()).unwrap();
            idx.add(Entry::new(1, 0, 0, 0), None).unwrap();
            idx.close().unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[1, 2, 3]).unwrap();
        }
        let result = Index::open(&path, meta());
        assert!(matches!(result, Err(StorageError::IndexFileCorrupt { .. })));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn find_matches_a_linear_scan(
                numbers in prop::collection::vec(1u32..1000, 1..50),
                target in 0u32..1000,
            ) {
                let mut numbers = numbers;
                numbers.sort_unstable();
                let dir = tempdir().unwrap();
                let mut idx = Index::open(dir.path().join("i"), meta()).unwrap();
                for n in &numbers {
                    idx.add(Entry::new(*n, 0, 0, 0), None).unwrap();
                }

                let expected_max = numbers.iter().rposition(|&n| n <= target).map(|i| i as u32 + 1).unwrap_or(0);
                prop_assert_eq!(idx.find(target, false), expected_max);

                let expected_min = numbers.iter().position(|&n| n >= target).map(|i| i as u32 + 1).unwrap_or(0);
                prop_assert_eq!(idx.find(target, true), expected_min);
            }

            #[test]
            fn range_length_matches_from_to_formula(
                count in 1i64..30,
                from in 1i64..30,
                to in 1i64..30,
            ) {
                let dir = tempdir().unwrap();
                let mut idx = Index::open(dir.path().join("i"), meta()).unwrap();
                for i in 1..=count as u32 {
                    idx.add(Entry::new(i, 0, 0, 0), None).unwrap();
                }
                let result = idx.range(from, Some(to));
                if from <= count && to <= count && from <= to {
                    prop_assert_eq!(result.unwrap().len() as i64, to - from + 1);
                } else {
                    prop_assert!(result.is_none());
                }
            }
        }
    }
}
