//! Append-only byte log of self-delimited documents.
//!
//! Records are framed as `[length: u32 BE][payload][0x0A]`. Writes accumulate
//! in an in-memory buffer and are flushed (written + `fsync`'d) once the
//! buffer would overflow, on an explicit [`Partition::flush`], or on close.
//! Records larger than the buffer bypass it entirely (direct flush), as
//! documented on [`Partition::write`].

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write as IoWrite};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::StorageError;

pub(crate) const MAGIC_PREFIX: &[u8; 6] = b"nesprt";
pub(crate) const MAGIC_VERSION: &[u8; 2] = b"01";
const HEADER_LEN: u64 = 8;
const TRAILER: u8 = 0x0A;

/// Default capacity of the in-memory write buffer, in bytes.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 16 * 1024;

/// A single append-only partition file.
pub struct Partition {
    path: PathBuf,
    file: Option<File>,
    /// Durable length of the file (bytes flushed and fsync'd).
    file_size: u64,
    /// Bytes written but not yet flushed.
    write_buffer: Vec<u8>,
    buffer_capacity: usize,
    dirty_reads: bool,
    pending_callbacks: Vec<Box<dyn FnOnce()>>,
}

impl Partition {
    /// Opens (creating if necessary) the partition file at `path`.
    pub fn open(
        path: impl AsRef<Path>,
        buffer_capacity: usize,
        dirty_reads: bool,
    ) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let existed = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StorageError::io(&path, e))?;

        let file_size = if existed {
            let mut header = [0u8; HEADER_LEN as usize];
            file.read_exact(&mut header)
                .map_err(|e| StorageError::io(&path, e))?;
            validate_magic(&path, &header)?;
            file.metadata().map_err(|e| StorageError::io(&path, e))?.len()
        } else {
            let mut header = [0u8; HEADER_LEN as usize];
            header[0..6].copy_from_slice(MAGIC_PREFIX);
            header[6..8].copy_from_slice(MAGIC_VERSION);
            file.write_all(&header).map_err(|e| StorageError::io(&path, e))?;
            file.sync_all().map_err(|e| StorageError::io(&path, e))?;
            HEADER_LEN
        };

        debug!(path = %path.display(), file_size, "partition opened");

        Ok(Self {
            path,
            file: Some(file),
            file_size,
            write_buffer: Vec::new(),
            buffer_capacity,
            dirty_reads,
            pending_callbacks: Vec::new(),
        })
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Total length of the partition visible to a dirty reader: durable bytes
    /// plus whatever is still sitting in the write buffer.
    pub fn len(&self) -> u64 {
        self.file_size + self.write_buffer.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == HEADER_LEN
    }

    /// Appends `payload` as a new record, returning its byte position, or
    /// `None` if the partition is not open. `on_flush` fires once the bytes
    /// containing this record have been durably flushed (immediately, for a
    /// record large enough to force a direct flush).
    pub fn write(
        &mut self,
        payload: &[u8],
        on_flush: Option<Box<dyn FnOnce()>>,
    ) -> Result<Option<u64>, StorageError> {
        if self.file.is_none() {
            return Ok(None);
        }
        let record_len = 4 + payload.len() + 1;

        if record_len > self.buffer_capacity {
            // Too big to buffer: flush what's pending, then write directly.
            self.flush_buffer()?;
            let position = self.file_size;
            let mut record = Vec::with_capacity(record_len);
            record.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            record.extend_from_slice(payload);
            record.push(TRAILER);
            self.write_direct(&record)?;
            if let Some(cb) = on_flush {
                cb();
            }
            return Ok(Some(position));
        }

        if self.write_buffer.len() + record_len > self.buffer_capacity {
            self.flush_buffer()?;
        }

        let position = self.file_size + self.write_buffer.len() as u64;
        self.write_buffer
            .extend_from_slice(&(payload.len() as u32).to_be_bytes());
        self.write_buffer.extend_from_slice(payload);
        self.write_buffer.push(TRAILER);
        if let Some(cb) = on_flush {
            self.pending_callbacks.push(cb);
        }
        Ok(Some(position))
    }

    /// Reads the payload starting at `position`. Returns `None` if `position`
    /// is at or past the end of known data, or if it falls in the
    /// not-yet-flushed buffer and `dirty_reads` is disabled.
    ///
    /// If `expected_size` is given and mismatches the on-disk length, returns
    /// [`StorageError::InvalidDataSize`].
    pub fn read_from(
        &mut self,
        position: u64,
        expected_size: Option<u32>,
    ) -> Result<Option<Bytes>, StorageError> {
        if self.file.is_none() {
            return Ok(None);
        }
        let total = self.len();
        if position >= total {
            return Ok(None);
        }

        let record: Vec<u8>;
        if position < self.file_size {
            let file = self.file.as_mut().expect("checked above");
            file.seek(SeekFrom::Start(position))
                .map_err(|e| StorageError::io(&self.path, e))?;
            let mut len_buf = [0u8; 4];
            file.read_exact(&mut len_buf)
                .map_err(|_| self.torn_write(position))?;
            let len = u32::from_be_bytes(len_buf);
            let mut body = vec![0u8; len as usize + 1];
            file.read_exact(&mut body).map_err(|_| self.torn_write(position))?;
            if *body.last().expect("non-empty") != TRAILER {
                return Err(self.torn_write(position));
            }
            record = body[..len as usize].to_vec();
        } else {
            if !self.dirty_reads {
                return Ok(None);
            }
            let offset = (position - self.file_size) as usize;
            let buf = &self.write_buffer[offset..];
            if buf.len() < 4 {
                return Err(self.torn_write(position));
            }
            let len = u32::from_be_bytes(buf[0..4].try_into().expect("4 bytes"));
            let end = 4 + len as usize;
            if buf.len() < end + 1 || buf[end] != TRAILER {
                return Err(self.torn_write(position));
            }
            record = buf[4..end].to_vec();
        }

        if let Some(expected) = expected_size {
            if expected as usize != record.len() {
                return Err(StorageError::InvalidDataSize {
                    path: self.path.clone(),
                    expected,
                    found: record.len() as u32,
                });
            }
        }
        Ok(Some(Bytes::from(record)))
    }

    /// Returns every record from the start of the durable (flushed) region,
    /// in write order, as `(position, payload)` pairs. Freshly computed on
    /// each call.
    pub fn read_all(&mut self) -> Result<Vec<(u64, Bytes)>, StorageError> {
        let mut out = Vec::new();
        let mut position = HEADER_LEN;
        while position < self.file_size {
            let payload = self
                .read_from(position, None)?
                .ok_or_else(|| self.torn_write(position))?;
            let record_len = 4 + payload.len() as u64 + 1;
            out.push((position, payload));
            position += record_len;
        }
        Ok(out)
    }

    /// Truncates the partition so that only records starting strictly before
    /// `position` survive. A negative `position` truncates all content
    /// (preserving the header). Must land exactly on a record boundary (or
    /// at/after the current end, which is a no-op); otherwise returns
    /// [`StorageError::InvalidBoundary`].
    pub fn truncate(&mut self, position: i64) -> Result<(), StorageError> {
        if self.file.is_none() {
            return Err(StorageError::NotOpen {
                path: self.path.clone(),
            });
        }

        if position < 0 {
            self.file
                .as_mut()
                .expect("checked above")
                .set_len(HEADER_LEN)
                .map_err(|e| StorageError::io(&self.path, e))?;
            self.file_size = HEADER_LEN;
            self.write_buffer.clear();
            self.pending_callbacks.clear();
            return Ok(());
        }

        let position = position as u64;
        let total = self.len();
        if position >= total {
            return Ok(());
        }

        let mut cursor = HEADER_LEN;
        let mut found = false;
        while cursor < total {
            if cursor == position {
                found = true;
                break;
            }
            let payload = self
                .read_from(cursor, None)?
                .ok_or_else(|| self.torn_write(cursor))?;
            cursor += 4 + payload.len() as u64 + 1;
        }
        if !found {
            return Err(StorageError::InvalidBoundary {
                path: self.path.clone(),
                position: position as i64,
            });
        }

        if position < self.file_size {
            self.file
                .as_mut()
                .expect("checked above")
                .set_len(position)
                .map_err(|e| StorageError::io(&self.path, e))?;
            self.file_size = position;
            self.write_buffer.clear();
        } else {
            let keep = (position - self.file_size) as usize;
            self.write_buffer.truncate(keep);
        }
        self.pending_callbacks.clear();
        Ok(())
    }

    /// Flushes any buffered writes and fsyncs them.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        self.flush_buffer()
    }

    /// Flushes, fsyncs, and releases the underlying file handle.
    pub fn close(&mut self) -> Result<(), StorageError> {
        self.flush_buffer()?;
        self.file = None;
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<(), StorageError> {
        if self.write_buffer.is_empty() {
            return Ok(());
        }
        let buf = std::mem::take(&mut self.write_buffer);
        self.write_direct(&buf)?;
        for cb in std::mem::take(&mut self.pending_callbacks) {
            cb();
        }
        Ok(())
    }

    fn write_direct(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        let file = self.file.as_mut().ok_or_else(|| StorageError::NotOpen {
            path: self.path.clone(),
        })?;
        file.seek(SeekFrom::Start(self.file_size))
            .map_err(|e| StorageError::io(&self.path, e))?;
        file.write_all(bytes).map_err(|e| StorageError::io(&self.path, e))?;
        file.sync_all().map_err(|e| StorageError::io(&self.path, e))?;
        self.file_size += bytes.len() as u64;
        Ok(())
    }

    fn torn_write(&self, position: u64) -> StorageError {
        warn!(path = %self.path.display(), position, "torn or malformed record framing");
        StorageError::CorruptFile {
            path: self.path.clone(),
            reason: format!("torn record at position {position}"),
        }
    }
}

impl Drop for Partition {
    fn drop(&mut self) {
        if self.file.is_some() {
            if let Err(err) = self.flush_buffer() {
                warn!(path = %self.path.display(), %err, "failed to flush partition on drop");
            }
        }
    }
}

pub(crate) fn validate_magic(path: &Path, header: &[u8]) -> Result<(), StorageError> {
    validate_magic_with(path, header, MAGIC_PREFIX, MAGIC_VERSION)
}

/// Validates an 8-byte file header against a 6-byte prefix and a 2-byte
/// version suffix, shared between [`Partition`] and `Index` (which use
/// distinct magic constants but the same header shape).
pub(crate) fn validate_magic_with(
    path: &Path,
    header: &[u8],
    prefix: &'static [u8; 6],
    version: &'static [u8; 2],
) -> Result<(), StorageError> {
    if &header[0..6] != prefix {
        return Err(StorageError::InvalidFileHeader {
            path: path.to_path_buf(),
            expected: prefix,
            found: header[0..6].to_vec(),
        });
    }
    if &header[6..8] != version {
        return Err(StorageError::InvalidFileVersion {
            path: path.to_path_buf(),
            expected: version,
            found: header[6..8].to_vec(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_and_read_back() {
        let dir = tempdir().unwrap();
        let mut p = Partition::open(dir.path().join("p"), DEFAULT_WRITE_BUFFER_SIZE, true).unwrap();
        let pos = p.write(b"hello", None).unwrap().unwrap();
        let got = p.read_from(pos, Some(5)).unwrap().unwrap();
        assert_eq!(&got[..], b"hello");
    }

    #[test]
    fn dirty_reads_disabled_hides_buffered_writes() {
        let dir = tempdir().unwrap();
        let mut p = Partition::open(dir.path().join("p"), DEFAULT_WRITE_BUFFER_SIZE, false).unwrap();
        let pos = p.write(b"hello", None).unwrap().unwrap();
        assert!(p.read_from(pos, None).unwrap().is_none());
        p.flush().unwrap();
        assert!(p.read_from(pos, None).unwrap().is_some());
    }

    #[test]
    fn oversized_record_bypasses_buffer() {
        let dir = tempdir().unwrap();
        let mut p = Partition::open(dir.path().join("p"), 64, true).unwrap();
        let payload = vec![7u8; 600_000];
        let pos = p.write(&payload, None).unwrap().unwrap();
        let got = p.read_from(pos, Some(600_000)).unwrap().unwrap();
        assert_eq!(got.len(), 600_000);
    }

    #[test]
    fn reopen_preserves_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p");
        {
            let mut p = Partition::open(&path, DEFAULT_WRITE_BUFFER_SIZE, true).unwrap();
            p.write(b"foo-\xc3\xbc\xc3\xb6\xc3\xa4l\xc3\x9f", None).unwrap();
            p.close().unwrap();
        }
        let mut p = Partition::open(&path, DEFAULT_WRITE_BUFFER_SIZE, true).unwrap();
        let all = p.read_all().unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn truncate_to_negative_clears_everything() {
        let dir = tempdir().unwrap();
        let mut p = Partition::open(dir.path().join("p"), DEFAULT_WRITE_BUFFER_SIZE, true).unwrap();
        p.write(b"a", None).unwrap();
        p.write(b"b", None).unwrap();
        p.flush().unwrap();
        p.truncate(-1).unwrap();
        assert!(p.is_empty());
    }

    #[test]
    fn truncate_on_non_boundary_is_an_error() {
        let dir = tempdir().unwrap();
        let mut p = Partition::open(dir.path().join("p"), DEFAULT_WRITE_BUFFER_SIZE, true).unwrap();
        p.write(b"hello", None).unwrap();
        p.flush().unwrap();
        let result = p.truncate(9);
        assert!(matches!(result, Err(StorageError::InvalidBoundary { .. })));
    }

    #[test]
    fn appended_garbage_after_close_is_detected_as_corrupt() {
        use std::io::Write as _;
        let dir = tempdir().unwrap();
        let path = dir.path().join("p");
        {
            let mut p = Partition::open(&path, DEFAULT_WRITE_BUFFER_SIZE, true).unwrap();
            p.write(b"hello", None).unwrap();
            p.close().unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0, 0, 0, 9]).unwrap();
        }
        let mut p = Partition::open(&path, DEFAULT_WRITE_BUFFER_SIZE, true).unwrap();
        let result = p.read_all();
        assert!(matches!(result, Err(StorageError::CorruptFile { .. })));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn write_then_read_from_returns_the_original_payload(
                payload in prop::collection::vec(any::<u8>(), 0..2048),
                buffer_capacity in 16usize..4096,
            ) {
                let dir = tempdir().unwrap();
                let mut p = Partition::open(dir.path().join("p"), buffer_capacity, true).unwrap();
                let pos = p.write(&payload, None).unwrap().unwrap();
                let got = p.read_from(pos, Some(payload.len() as u32)).unwrap().unwrap();
                prop_assert_eq!(got.as_ref(), payload.as_slice());
            }

            #[test]
            fn sequential_writes_are_each_independently_readable(
                payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..256), 1..20),
            ) {
                let dir = tempdir().unwrap();
                let mut p = Partition::open(dir.path().join("p"), 128, true).unwrap();
                let mut positions = Vec::new();
                for payload in &payloads {
                    positions.push(p.write(payload, None).unwrap().unwrap());
                }
                for (pos, payload) in positions.iter().zip(&payloads) {
                    let got = p.read_from(*pos, Some(payload.len() as u32)).unwrap().unwrap();
                    prop_assert_eq!(got.as_ref(), payload.as_slice());
                }
            }
        }
    }
}
