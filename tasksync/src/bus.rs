//! Synchronous typed publish/subscribe.
//!
//! [`EventBus::publish`] runs every handler inline, in subscription order,
//! with a shared reference to the same event. The handler list is
//! snapshotted before dispatch, so subscribing or unsubscribing from inside a
//! handler only affects later publishes. A panicking handler is caught and
//! logged; the remaining handlers still run.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

struct Registry<E> {
    handlers: Vec<(SubscriptionToken, Handler<E>)>,
    closed: bool,
}

/// A typed event bus with synchronous fan-out.
pub struct EventBus<E> {
    registry: Mutex<Registry<E>>,
    next_token: AtomicU64,
}

impl<E> EventBus<E> {
    /// Creates an empty, open bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                handlers: Vec::new(),
                closed: false,
            }),
            next_token: AtomicU64::new(0),
        }
    }

    /// Registers a handler and returns its token.
    ///
    /// Subscribing to a closed bus returns a token that is never invoked.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionToken
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut registry = self.registry.lock();
        if registry.closed {
            tracing::debug!("subscribe on closed event bus ignored");
        } else {
            registry.handlers.push((token, Arc::new(handler)));
        }
        token
    }

    /// Removes a handler. Returns `false` if the token was not registered.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut registry = self.registry.lock();
        let before = registry.handlers.len();
        registry.handlers.retain(|(t, _)| *t != token);
        registry.handlers.len() != before
    }

    /// Delivers `event` to every handler subscribed at the time of the call.
    ///
    /// Returns the number of handlers that completed without panicking.
    pub fn publish(&self, event: &E) -> usize {
        let handlers: Vec<Handler<E>> = {
            let registry = self.registry.lock();
            if registry.closed {
                return 0;
            }
            registry.handlers.iter().map(|(_, h)| Arc::clone(h)).collect()
        };

        let mut delivered = 0;
        for handler in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(payload) => {
                    let reason = payload
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    tracing::error!(reason = %reason, "event handler panicked, continuing");
                }
            }
        }
        delivered
    }

    /// Drops every handler but leaves the bus open. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut registry = self.registry.lock();
        let removed = registry.handlers.len();
        registry.handlers.clear();
        removed
    }

    /// Drops every handler and rejects further subscriptions and publishes.
    pub fn close(&self) {
        let mut registry = self.registry.lock();
        registry.closed = true;
        registry.handlers.clear();
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.registry.lock().closed
    }

    /// Number of currently registered handlers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().handlers.len()
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}
