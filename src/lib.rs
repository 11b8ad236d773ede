//! Embedded, append-only event storage.
//!
//! Documents are appended to a [`Partition`] (a byte log) and indexed by
//! sequential entry number through one or more secondary [`Index`]es, all
//! orchestrated by a [`Storage`] façade. [`Consumer`] layers a durable
//! tailing cursor on top of an index, and [`RangeStream`] is the restartable
//! sequence a range query resolves into.
//!
//! The engine is single-writer, single-threaded, and synchronous: there is
//! no background flush timer or I/O runtime. Callers drive flushing and
//! consumer delivery explicitly (see [`Storage::tick`] and
//! [`Consumer::tick`]).

mod config;
mod consumer;
mod entry;
mod error;
mod index;
mod partition;
mod storage;
mod stream;

pub use config::StorageConfig;
pub use consumer::Consumer;
pub use entry::{Entry, ENTRY_SIZE};
pub use error::StorageError;
pub use index::{Index, IndexMetadata, WAL_FLUSH_THRESHOLD};
pub use partition::{Partition, DEFAULT_WRITE_BUFFER_SIZE};
pub use storage::{DocumentCodec, JsonCodec, Storage, WriteResult};
pub use stream::RangeStream;
