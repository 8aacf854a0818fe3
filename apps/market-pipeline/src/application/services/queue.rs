//! Drop-Oldest Queue
//!
//! Bounded single-consumer queue where the producer never waits. When the
//! queue is full the oldest queued item is overwritten and the consumer
//! learns how many it missed on its next receive.
//!
//! Built on a tokio broadcast channel with exactly one receiver; the
//! channel's lag semantics are precisely drop-oldest. Tokio rounds the
//! capacity up to the next power of two.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

type DropHook = Arc<dyn Fn(u64) + Send + Sync>;

/// Create a drop-oldest queue holding at least `capacity` items.
#[must_use]
pub fn drop_oldest<T: Clone>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = broadcast::channel(capacity.max(1));
    (
        QueueSender { tx },
        QueueReceiver {
            rx,
            dropped: Arc::new(AtomicU64::new(0)),
            on_drop: None,
        },
    )
}

/// Producer side. Cloneable; pushes never block.
pub struct QueueSender<T> {
    tx: broadcast::Sender<T>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> fmt::Debug for QueueSender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueSender")
            .field("queued", &self.tx.len())
            .finish()
    }
}

impl<T> QueueSender<T> {
    /// Enqueue an item, evicting the oldest one if full.
    ///
    /// Returns `false` if the receiver has been dropped.
    pub fn push(&self, item: T) -> bool {
        self.tx.send(item).is_ok()
    }

    /// Whether the receiver has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.receiver_count() == 0
    }

    /// Number of items currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

/// Consumer side.
pub struct QueueReceiver<T> {
    rx: broadcast::Receiver<T>,
    dropped: Arc<AtomicU64>,
    on_drop: Option<DropHook>,
}

impl<T> fmt::Debug for QueueReceiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueReceiver")
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T: Clone> QueueReceiver<T> {
    /// Call `hook` with the number of items lost each time an overflow is
    /// observed.
    #[must_use]
    pub fn on_drop(mut self, hook: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.on_drop = Some(Arc::new(hook));
        self
    }

    /// Wait for the next item.
    ///
    /// Returns `None` once every sender is dropped and the queue is drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(item) => return Some(item),
                Err(RecvError::Lagged(n)) => self.count_dropped(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next item if one is queued.
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.rx.try_recv() {
                Ok(item) => return Some(item),
                Err(TryRecvError::Lagged(n)) => self.count_dropped(n),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Total items dropped for this receiver so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn count_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
        if let Some(hook) = &self.on_drop {
            hook(n);
        }
    }
}
