//! The façade binding one partition to its named secondary indexes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::{debug, error, warn};

use crate::config::StorageConfig;
use crate::entry::Entry;
use crate::error::StorageError;
use crate::index::{Index, IndexMetadata};
use crate::partition::Partition;
use crate::stream::RangeStream;

/// Converts between an opaque document type and the bytes a [`Partition`]
/// stores. Kept as an external collaborator, as in the storage core's data
/// model: `Storage` never dictates a wire format of its own.
pub trait DocumentCodec {
    type Doc;

    fn encode(&self, doc: &Self::Doc) -> Result<Vec<u8>, StorageError>;
    fn decode(&self, bytes: &[u8]) -> Result<Self::Doc, StorageError>;
}

/// A `serde_json`-backed [`DocumentCodec`] for any `Serialize + DeserializeOwned` type.
#[derive(Debug, Clone, Copy)]
pub struct JsonCodec<T>(std::marker::PhantomData<T>);

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self(std::marker::PhantomData)
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DocumentCodec for JsonCodec<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    type Doc = T;

    fn encode(&self, doc: &T) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec(doc).map_err(|e| StorageError::Codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, StorageError> {
        serde_json::from_slice(bytes).map_err(|e| StorageError::Codec(e.to_string()))
    }
}

type Matcher<D> = Box<dyn Fn(&D) -> Result<bool, StorageError>>;

/// Result of a successful [`Storage::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    pub position: u64,
    pub size: u32,
}

/// Owns one partition plus zero or more named secondary indexes over it.
pub struct Storage<C: DocumentCodec> {
    dir: PathBuf,
    name: String,
    config: StorageConfig,
    partition: Partition,
    partition_id: u32,
    indexes: HashMap<String, Rc<RefCell<Index>>>,
    matchers: HashMap<String, Matcher<C::Doc>>,
    next_number: HashMap<String, u32>,
    codec: C,
}

impl<C: DocumentCodec> Storage<C> {
    /// Opens a storage instance named `name` under `config.storage_directory`.
    pub fn open(name: impl Into<String>, config: StorageConfig, codec: C) -> Result<Self, StorageError> {
        let name = name.into();
        let dir = config.storage_directory.clone();
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;
        let partition = Partition::open(
            dir.join(&name),
            config.write_buffer_size,
            config.dirty_reads,
        )?;
        debug!(storage = %name, dir = %dir.display(), "storage opened");
        Ok(Self {
            dir,
            name,
            config,
            partition,
            partition_id: 0,
            indexes: HashMap::new(),
            matchers: HashMap::new(),
            next_number: HashMap::new(),
            codec,
        })
    }

    fn index_path(&self, index_name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}.index", self.name, index_name))
    }

    /// Opens (creating if necessary) a named index, optionally restricting
    /// which documents get appended to it via `matcher`.
    ///
    /// Calling this again for an already-open index with the same metadata
    /// returns the existing handle; differing metadata is an error (the
    /// mismatch already surfaces from [`Index::open`]).
    pub fn ensure_index(
        &mut self,
        index_name: impl Into<String>,
        metadata: IndexMetadata,
        matcher: Option<Matcher<C::Doc>>,
    ) -> Result<Rc<RefCell<Index>>, StorageError> {
        let index_name = index_name.into();
        if let Some(existing) = self.indexes.get(&index_name) {
            return Ok(Rc::clone(existing));
        }
        let index = Index::open(self.index_path(&index_name), metadata)?;
        let next = index.last_entry().map(|e| e.number + 1).unwrap_or(1);
        self.next_number.insert(index_name.clone(), next);
        let handle = Rc::new(RefCell::new(index));
        self.indexes.insert(index_name.clone(), Rc::clone(&handle));
        if let Some(m) = matcher {
            self.matchers.insert(index_name, m);
        }
        Ok(handle)
    }

    pub fn index(&self, index_name: &str) -> Option<Rc<RefCell<Index>>> {
        self.indexes.get(index_name).cloned()
    }

    /// Appends `doc` to the partition, then to every index whose matcher
    /// accepts it (an index with no matcher accepts everything).
    ///
    /// A matcher failure skips that index's append but is still surfaced:
    /// every other index is processed normally, and the first matcher error
    /// encountered is returned after all indexes have been tried.
    pub fn write(&mut self, doc: &C::Doc) -> Result<WriteResult, StorageError> {
        let bytes = self.codec.encode(doc)?;
        let size = bytes.len() as u32;
        let position = self
            .partition
            .write(&bytes, None)?
            .ok_or_else(|| StorageError::NotOpen {
                path: self.dir.join(&self.name),
            })?;

        let mut first_error = None;
        for (index_name, index) in &self.indexes {
            let accepted = match self.matchers.get(index_name) {
                Some(matcher) => match matcher(doc) {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(index = %index_name, %err, "matcher failed, skipping append to this index");
                        if first_error.is_none() {
                            first_error = Some(StorageError::MatcherFailed {
                                index: index_name.clone(),
                                reason: err.to_string(),
                            });
                        }
                        continue;
                    }
                },
                None => true,
            };
            if !accepted {
                continue;
            }
            let number = self.next_number.entry(index_name.clone()).or_insert(1);
            let entry = Entry::new(*number, position, size, self.partition_id);
            *number += 1;
            if let Err(err) = index.borrow_mut().add(entry, None) {
                error!(index = %index_name, %err, "failed to append to index");
                return Err(err);
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        Ok(WriteResult { position, size })
    }

    /// Reads a single document back by its partition byte position.
    pub fn read_from(&mut self, position: u64, size: u32) -> Result<Option<C::Doc>, StorageError> {
        match self.partition.read_from(position, Some(size))? {
            Some(bytes) => Ok(Some(self.codec.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Resolves the `[from, to]` slot range of `index_name` into a restartable
    /// sequence of decoded documents.
    pub fn read_range(
        &mut self,
        index_name: &str,
        from: i64,
        to: Option<i64>,
    ) -> Result<Option<RangeStream<C::Doc>>, StorageError>
    where
        C::Doc: Clone,
    {
        let Some(index) = self.indexes.get(index_name) else {
            return Ok(None);
        };
        let Some(entries) = index.borrow().range(from, to) else {
            return Ok(None);
        };
        let mut docs = Vec::with_capacity(entries.len());
        for entry in entries {
            let bytes = self
                .partition
                .read_from(entry.position, Some(entry.size))?
                .ok_or_else(|| StorageError::CorruptFile {
                    path: self.dir.join(&self.name),
                    reason: format!("index entry {} points past partition end", entry.number),
                })?;
            docs.push(self.codec.decode(&bytes)?);
        }
        Ok(Some(RangeStream::new(docs)))
    }

    /// Rebuilds a named index from scratch by replaying the partition.
    /// Not invoked automatically on corruption; the caller decides.
    pub fn rebuild_index(&mut self, index_name: &str) -> Result<(), StorageError> {
        let Some(index) = self.indexes.get(index_name) else {
            return Err(StorageError::NotOpen {
                path: self.index_path(index_name),
            });
        };
        let records = self.partition.read_all()?;
        let specs: Vec<(u64, usize)> = records.iter().map(|(pos, b)| (*pos, b.len())).collect();
        let partition_id = self.partition_id;
        index
            .borrow_mut()
            .rebuild(&specs, partition_id, |i| i as u32 + 1)?;
        self.next_number.insert(index_name.to_string(), specs.len() as u32 + 1);
        Ok(())
    }

    /// Drives time-based flushing. A no-op placeholder since this crate has
    /// no background timer; embedding applications call it on their own
    /// schedule (see `flush_delay_ms` in [`StorageConfig`]).
    pub fn tick(&mut self) -> Result<(), StorageError> {
        self.partition.flush()?;
        for index in self.indexes.values() {
            index.borrow_mut().flush()?;
        }
        Ok(())
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn close(&mut self) -> Result<(), StorageError> {
        self.partition.close()?;
        for index in self.indexes.values() {
            index.borrow_mut().close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &Path) -> StorageConfig {
        StorageConfig {
            storage_directory: dir.to_path_buf(),
            ..StorageConfig::default()
        }
    }

    #[test]
    fn write_and_read_through_an_index() {
        let dir = tempdir().unwrap();
        let mut storage =
            Storage::open("events", config(dir.path()), JsonCodec::<String>::new()).unwrap();
        storage.ensure_index("all", IndexMetadata::new(), None).unwrap();

        let r1 = storage.write(&"foo-üöälß".to_string()).unwrap();
        let r2 = storage.write(&"bar-日本語".to_string()).unwrap();

        let doc1 = storage.read_from(r1.position, r1.size).unwrap().unwrap();
        let doc2 = storage.read_from(r2.position, r2.size).unwrap().unwrap();
        assert_eq!(doc1, "foo-üöälß");
        assert_eq!(doc2, "bar-日本語");

        let stream = storage.read_range("all", 1, None).unwrap().unwrap();
        let docs: Vec<_> = stream.iter().cloned().collect();
        assert_eq!(docs, vec!["foo-üöälß".to_string(), "bar-日本語".to_string()]);
    }

    #[test]
    fn matcher_filters_which_entries_land_in_an_index() {
        let dir = tempdir().unwrap();
        let mut storage =
            Storage::open("events", config(dir.path()), JsonCodec::<i32>::new()).unwrap();
        storage
            .ensure_index(
                "evens",
                IndexMetadata::new(),
                Some(Box::new(|doc: &i32| Ok(doc % 2 == 0))),
            )
            .unwrap();

        for i in 1..=10 {
            storage.write(&i).unwrap();
        }

        let index = storage.index("evens").unwrap();
        assert_eq!(index.borrow().len(), 5);
    }

    #[test]
    fn read_range_restarts_from_the_beginning() {
        let dir = tempdir().unwrap();
        let mut storage =
            Storage::open("events", config(dir.path()), JsonCodec::<i32>::new()).unwrap();
        storage.ensure_index("all", IndexMetadata::new(), None).unwrap();
        for i in 0..5 {
            storage.write(&i).unwrap();
        }
        let stream = storage.read_range("all", 1, None).unwrap().unwrap();
        let first: Vec<_> = stream.iter().cloned().collect();
        let second: Vec<_> = stream.iter().cloned().collect();
        assert_eq!(first, second);
    }
}
