//! Shared Record Store
//!
//! Single source of truth for the record being collected. Readers only ever
//! see whole snapshots; every mutation is a full replace.

use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

/// Replay-latest holder for a record snapshot. Clones share the same value.
#[derive(Debug)]
pub struct RecordStore<R> {
    tx: Arc<watch::Sender<R>>,
}

impl<R> Clone for RecordStore<R> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<R: Default> Default for RecordStore<R> {
    fn default() -> Self {
        Self::new(R::default())
    }
}

impl<R> RecordStore<R> {
    pub fn new(initial: R) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Atomically swaps in `next`; subscribers are notified afterwards.
    pub fn replace(&self, next: R) {
        self.tx.send_replace(next);
    }

    /// A receiver positioned at the current value.
    pub fn watch(&self) -> watch::Receiver<R> {
        self.tx.subscribe()
    }
}

impl<R: Clone> RecordStore<R> {
    /// Synchronous snapshot of the current record.
    pub fn get(&self) -> R {
        self.tx.borrow().clone()
    }
}

impl<R: Clone + Send + Sync + 'static> RecordStore<R> {
    /// Stream that yields the current record immediately, then every replacement.
    pub fn subscribe(&self) -> WatchStream<R> {
        WatchStream::new(self.tx.subscribe())
    }
}
