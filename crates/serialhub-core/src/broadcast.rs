//! Broadcaster implementation.
//!
//! Fans outbound messages out to every subscribed client. Async consumers
//! take a [`tokio::sync::broadcast::Receiver`]; synchronous handlers are
//! called inline on the publishing task and should return quickly.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::message::OutboundMessage;

/// Anything that can push a message to subscribed clients
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, msg: OutboundMessage);
}

/// Subscription handle for removing a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sub({})", &self.0.to_string()[..8])
    }
}

type MessageHandler = Box<dyn Fn(&OutboundMessage) + Send + Sync>;

/// Default broadcaster backed by a tokio broadcast channel
pub struct BroadcastHub {
    sender: broadcast::Sender<OutboundMessage>,
    handlers: Arc<RwLock<HashMap<SubscriptionId, MessageHandler>>>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get a receiver for async consumption
    ///
    /// A receiver that falls more than `capacity` messages behind observes
    /// `RecvError::Lagged` and skips ahead.
    pub fn subscribe(&self) -> broadcast::Receiver<OutboundMessage> {
        self.sender.subscribe()
    }

    /// Register a synchronous handler
    pub fn add_handler<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&OutboundMessage) + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();
        self.handlers.write().insert(id, Box::new(handler));
        tracing::debug!("Subscription {} added", id);
        id
    }

    /// Returns true if the handler was found and removed.
    pub fn remove_handler(&self, id: SubscriptionId) -> bool {
        let removed = self.handlers.write().remove(&id).is_some();
        if removed {
            tracing::debug!("Subscription {} removed", id);
        }
        removed
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl Broadcaster for BroadcastHub {
    fn broadcast(&self, msg: OutboundMessage) {
        tracing::trace!("broadcast {}", msg);
        for handler in self.handlers.read().values() {
            handler(&msg);
        }
        // No receivers is not an error; clients come and go.
        let _ = self.sender.send(msg);
    }
}

impl<T: Broadcaster + ?Sized> Broadcaster for Arc<T> {
    fn broadcast(&self, msg: OutboundMessage) {
        (**self).broadcast(msg)
    }
}
