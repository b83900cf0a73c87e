//! Single-slot "latest value" cells.
//!
//! Producers overwrite, readers take a snapshot or await the next change.
//! Neither side ever waits for the other.

use std::sync::Arc;
use tokio::sync::watch;

/// Latest published value of type `T`, shared between one writer and any
/// number of readers.
#[derive(Debug)]
pub struct LatestCell<T> {
    tx: Arc<watch::Sender<Option<T>>>,
}

impl<T> Clone for LatestCell<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Clone> Default for LatestCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> LatestCell<T> {
    /// Create an empty cell.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Replace the current value.
    pub fn publish(&self, value: T) {
        self.tx.send_replace(Some(value));
    }

    /// Drop the current value.
    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    /// Snapshot of the current value.
    pub fn latest(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Receiver notified on every publish.
    pub fn subscribe(&self) -> watch::Receiver<Option<T>> {
        self.tx.subscribe()
    }
}
