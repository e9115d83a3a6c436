//! Fan-out of events to every live subscriber.
//!
//! Each subscriber owns a bounded queue.  `broadcast` only ever uses
//! `try_send`: a subscriber whose queue is full is removed on the spot so
//! one slow client cannot hold up the cycle or the other clients.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::config::BroadcastConfig;

use super::event::BroadcastEvent;

pub type SubscriberId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BroadcastError {
    /// The subscriber's queue was full; it has been unregistered.
    #[error("subscriber {0} overflowed its queue and was dropped")]
    SubscriberOverflow(SubscriberId),

    /// The subscriber's receiving side is gone.
    #[error("subscriber {0} disconnected")]
    SubscriberGone(SubscriberId),
}

/// Result of one `broadcast` call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    pub dropped: Vec<BroadcastError>,
}

/// The receiving end handed to a connection handler.
pub struct Subscription {
    id: SubscriberId,
    events: mpsc::Receiver<Arc<BroadcastEvent>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` once the hub has dropped this subscriber.
    pub async fn recv(&mut self) -> Option<Arc<BroadcastEvent>> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<BroadcastEvent>> {
        self.events.try_recv().ok()
    }
}

pub struct BroadcastHub {
    capacity: usize,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<Arc<BroadcastEvent>>>>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &BroadcastConfig) -> Self {
        Self::new(config.subscriber_queue_capacity)
    }

    pub fn register(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        self.lock().insert(id, tx);
        log::info!("broadcast: subscriber {id} registered");
        Subscription { id, events: rx }
    }

    /// Returns `false` if `id` was not registered (already dropped).
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            log::info!("broadcast: subscriber {id} unregistered");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Offer `event` to every subscriber without waiting.
    pub fn broadcast(&self, event: BroadcastEvent) -> BroadcastOutcome {
        let event = Arc::new(event);
        let mut outcome = BroadcastOutcome::default();

        self.lock().retain(|&id, tx| match tx.try_send(Arc::clone(&event)) {
            Ok(()) => {
                outcome.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                let err = BroadcastError::SubscriberOverflow(id);
                log::warn!("broadcast: {err}");
                outcome.dropped.push(err);
                false
            }
            Err(TrySendError::Closed(_)) => {
                let err = BroadcastError::SubscriberGone(id);
                log::debug!("broadcast: {err}");
                outcome.dropped.push(err);
                false
            }
        });

        outcome
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<SubscriberId, mpsc::Sender<Arc<BroadcastEvent>>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
