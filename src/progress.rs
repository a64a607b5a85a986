//! Progress reporting over a coalescing channel
//!
//! The scheduler publishes a [`ProgressSnapshot`] after every chunk settles.
//! Consumers subscribe to a watch channel: a slow consumer never blocks the
//! scheduler, it just observes the latest snapshot when it next looks.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

/// Read-only view of how far a batch has come
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub processed: usize,
    pub total: usize,
    /// Rounded percentage; an empty batch counts as fully done
    pub percent: u8,
}

impl ProgressSnapshot {
    pub fn new(processed: usize, total: usize) -> Self {
        let percent = if total == 0 {
            100
        } else {
            ((processed as f64 / total as f64) * 100.0).round() as u8
        };
        Self {
            processed,
            total,
            percent,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.processed >= self.total
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({}%)", self.processed, self.total, self.percent)
    }
}

/// Publishing side of the progress channel, shared by scheduler and driver.
#[derive(Debug)]
pub struct ProgressSender {
    tx: watch::Sender<ProgressSnapshot>,
}

impl Default for ProgressSender {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSender {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ProgressSnapshot::default());
        Self { tx }
    }

    /// Publish the latest snapshot, replacing whatever was unread.
    pub fn publish(&self, snapshot: ProgressSnapshot) {
        self.tx.send_replace(snapshot);
    }

    pub fn subscribe(&self) -> ProgressWatch {
        ProgressWatch {
            rx: self.tx.subscribe(),
        }
    }

    /// Snapshot most recently published.
    pub fn current(&self) -> ProgressSnapshot {
        *self.tx.borrow()
    }
}

/// Shared handle used when several components publish into one channel.
pub type SharedProgress = Arc<ProgressSender>;

/// Consuming side of the progress channel.
#[derive(Debug, Clone)]
pub struct ProgressWatch {
    rx: watch::Receiver<ProgressSnapshot>,
}

impl ProgressWatch {
    /// Latest published snapshot without waiting.
    pub fn current(&self) -> ProgressSnapshot {
        *self.rx.borrow()
    }

    /// Wait for the next published snapshot. Returns `None` once the
    /// publishing side is gone.
    pub async fn changed(&mut self) -> Option<ProgressSnapshot> {
        match self.rx.changed().await {
            Ok(()) => Some(*self.rx.borrow_and_update()),
            Err(_) => None,
        }
    }

    /// Adapt the subscription into a `Stream` of snapshots.
    pub fn into_stream(self) -> WatchStream<ProgressSnapshot> {
        WatchStream::new(self.rx)
    }
}
