//! Durable tailing cursor over one index.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::entry::Entry;
use crate::error::StorageError;
use crate::index::Index;

#[derive(Debug, Serialize, Deserialize)]
struct ConsumerState {
    /// Last 1-based index slot this consumer has emitted, not the entry's
    /// `number` field — the two only coincide when an index's numbering is
    /// the identity mapping.
    position: u32,
}

/// A durable, at-least-once tailing cursor over an [`Index`].
///
/// Tracks the last 1-based *slot* drained, not the `number` field of the
/// entry found there — an index's `number` mapping need not be the identity
/// (see [`Index::rebuild`]'s `assign` closure), so slot and number can
/// diverge. Position is persisted to a small JSON sidecar file next to the
/// index, and only written once per catch-up/tick batch (not per entry),
/// matching the write-coalescing behavior of the partition and index
/// buffers.
///
/// This rewrite makes the catch-up → live transition explicit rather than an
/// implicit "first listener attached" event: call [`Consumer::start`] once,
/// then call [`Consumer::tick`] whenever the owning storage signals a new
/// write. `tick` auto-starts a consumer that hasn't been started yet, so a
/// caller that only ever ticks still gets correct at-least-once delivery.
pub struct Consumer {
    index: Rc<RefCell<Index>>,
    state_path: PathBuf,
    position: u32,
    started: bool,
    running: bool,
}

impl Consumer {
    /// Opens a consumer named `consumer_name` over `index`, with its
    /// position sidecar stored at `state_dir`.
    pub fn open(
        index: Rc<RefCell<Index>>,
        state_dir: impl AsRef<Path>,
        consumer_name: &str,
    ) -> Result<Self, StorageError> {
        let state_path = state_dir.as_ref().join(format!("{consumer_name}.consumer"));
        let position = if state_path.exists() {
            let text = fs::read_to_string(&state_path).map_err(|e| StorageError::io(&state_path, e))?;
            let state: ConsumerState =
                serde_json::from_str(&text).map_err(|e| StorageError::InvalidMetadata {
                    path: state_path.clone(),
                    reason: e.to_string(),
                })?;
            state.position
        } else {
            0
        };
        Ok(Self {
            index,
            state_path,
            position,
            started: false,
            running: false,
        })
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Replays everything from the last persisted position through the
    /// current end of the index (the "catch-up" phase), calling `on_entry`
    /// for each. Calling `start` again after the first call is a no-op.
    pub fn start(&mut self, on_entry: impl FnMut(&Entry)) -> Result<(), StorageError> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        self.running = true;
        self.drain(on_entry)
    }

    /// Emits any entries appended since the last `start`/`tick`. If the
    /// consumer hasn't been started yet, starts it first (this is the
    /// explicit analogue of "subscribing a listener auto-starts the
    /// consumer").
    pub fn tick(&mut self, on_entry: impl FnMut(&Entry)) -> Result<usize, StorageError> {
        if !self.started {
            self.started = true;
            self.running = true;
        }
        if !self.running {
            return Ok(0);
        }
        self.drain(on_entry)
    }

    /// Suspends delivery without losing position; a subsequent `tick` resumes
    /// from where it left off.
    pub fn stop(&mut self) {
        self.running = false;
    }

    fn drain(&mut self, mut on_entry: impl FnMut(&Entry)) -> Result<usize, StorageError> {
        let len = self.index.borrow().len();
        if self.position >= len {
            return Ok(0);
        }
        let Some(entries) = self
            .index
            .borrow()
            .range(self.position as i64 + 1, None)
        else {
            return Ok(0);
        };
        let count = entries.len();
        for entry in &entries {
            on_entry(entry);
        }
        if count > 0 {
            self.position += count as u32;
            self.persist()?;
        }
        debug!(position = self.position, emitted = count, "consumer drained");
        Ok(count)
    }

    fn persist(&self) -> Result<(), StorageError> {
        let state = ConsumerState {
            position: self.position,
        };
        let text = serde_json::to_string(&state).map_err(|e| StorageError::InvalidMetadata {
            path: self.state_path.clone(),
            reason: e.to_string(),
        })?;
        fs::write(&self.state_path, text).map_err(|e| StorageError::io(&self.state_path, e))
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Err(err) = self.persist() {
            warn!(path = %self.state_path.display(), %err, "failed to persist consumer state on drop");
        }
    }
}
