//! Event system for the UI boundary
//!
//! The session core never renders anything; it delivers chat, presence and
//! failure notifications through registered callbacks, and the UI layer
//! decides what to do with them.

use crate::protocol::{PresenceStatus, Username};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Events delivered to application handlers
#[derive(Debug, Clone)]
pub enum Event {
    /// A chat message arrived from a peer
    ChatReceived {
        /// Username of the author
        from: Username,
        /// Message text
        body: String,
        /// Author's send time, milliseconds since the Unix epoch
        timestamp: i64,
    },

    /// A peer's presence changed
    ///
    /// Delivered once per actual transition; repeated observations of the
    /// same status are suppressed.
    PresenceChanged {
        /// Peer whose status changed
        username: Username,
        /// New status
        status: PresenceStatus,
    },

    /// A peer's connection failed
    ///
    /// Always followed by the corresponding Offline presence event; exposed
    /// separately so the UI can show the reason.
    ConnectionFailed {
        /// Peer whose connection failed
        username: Username,
        /// Human-readable failure description
        reason: String,
    },

    /// The session started and is accepting connections
    SessionStarted {
        /// Address peers can connect to
        local_addr: SocketAddr,
    },

    /// The session stopped
    SessionStopped,
}

/// Handle for unsubscribing from events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

/// Type alias for event handler callbacks
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync + 'static>;

/// Manages event subscriptions and delivery
///
/// Cheaply cloneable; clones share the same handler list.
pub struct EventHandlers {
    handlers: Arc<RwLock<Vec<(SubscriptionHandle, EventCallback)>>>,
    next_id: Arc<AtomicU64>,
}

impl EventHandlers {
    /// Create a new event handler registry
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a new event handler
    ///
    /// The handler will be called for all future events until unsubscribed.
    ///
    /// # Returns
    ///
    /// A `SubscriptionHandle` that can be used to unsubscribe later.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let handle = SubscriptionHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((handle, Arc::new(callback)));
        handle
    }

    /// Unsubscribe an event handler
    ///
    /// No-op if the handle is not found.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.handlers.write().retain(|(h, _)| *h != handle);
    }

    /// Dispatch an event to all registered handlers
    ///
    /// Handlers run in subscription order. A panicking handler is isolated
    /// and logged; the remaining handlers still run.
    pub fn dispatch(&self, event: Event) {
        let handlers = self.handlers.read();

        for (handle, callback) in handlers.iter() {
            let event_clone = event.clone();
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(event_clone);
            }))
            .is_err()
            {
                tracing::error!(?handle, "event handler panicked");
            }
        }
    }

    /// Get the number of registered handlers
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }
}

impl Default for EventHandlers {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventHandlers {
    fn clone(&self) -> Self {
        Self {
            handlers: Arc::clone(&self.handlers),
            next_id: Arc::clone(&self.next_id),
        }
    }
}
