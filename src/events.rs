//! Outward notifications.
//!
//! Each subscriber owns an unbounded channel, so a slow or failing listener
//! never holds up delivery to the others. Events for one publisher arrive in
//! the order they were published.

use crate::stream::StreamState;
use crate::torrent::{TorrentId, TorrentState, TorrentStatus};
use parking_lot::Mutex;
use std::error::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub enum TorrentEvent {
    StateChanged {
        id: TorrentId,
        old: TorrentState,
        new: TorrentState,
    },
    MetadataResolved {
        id: TorrentId,
    },
    PieceCompleted {
        id: TorrentId,
        piece: u32,
    },
    /// Periodic while downloading.
    Progress {
        id: TorrentId,
        status: TorrentStatus,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    StateChanged {
        old: StreamState,
        new: StreamState,
    },
    /// The preparation buffer is available for the first time.
    Ready,
    Error(String),
    Stopped,
}

pub type Subscription<E> = mpsc::UnboundedReceiver<E>;

pub struct EventBus<E> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<E>>>,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Runs `listener` on its own task on `runtime` for every event. A
    /// listener error is logged and delivery continues.
    pub fn subscribe_fn<F>(&self, runtime: &Handle, listener: F)
    where
        F: Fn(E) -> Result<(), Box<dyn Error + Send + Sync>> + Send + 'static,
    {
        let mut rx = self.subscribe();
        runtime.spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = listener(event) {
                    warn!(error = %e, "event listener failed");
                }
            }
        });
    }

    pub fn publish(&self, event: E) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        for i in 0..5u32 {
            bus.publish(i);
        }
        for i in 0..5u32 {
            assert_eq!(rx.recv().await, Some(i));
        }
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_block_others() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        bus.subscribe_fn(&Handle::current(), |_: u32| Err("listener broke".into()));
        let counter = seen.clone();
        bus.subscribe_fn(&Handle::current(), move |_: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let mut rx = bus.subscribe();

        bus.publish(1);
        bus.publish(2);
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));

        for _ in 0..100 {
            if seen.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let _kept = bus.subscribe();
        drop(rx);
        bus.publish(1u32);
        assert_eq!(bus.subscriber_count(), 1);
    }
}
