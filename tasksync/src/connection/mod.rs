//! Push-channel connection manager.
//!
//! [`ConnectionManager`] owns at most one open [`Channel`] at a time and a
//! background supervisor task that opens it, reads frames, and reconnects
//! with [`BackoffPolicy`] delays when it drops. Everything it observes is
//! published on an [`EventBus`] as a [`ConnectionEvent`]:
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──open ok──▶ Connected
//!                                 ▲    │                  │
//!                      delay      │    │ open failed      │ closed / error
//!                                 │    ▼                  ▼
//!                            Reconnecting ◀──── attempts < max
//!                                              attempts == max ──▶ Failed
//! ```
//!
//! `disconnect()` returns to `Disconnected` from any state.

pub mod backoff;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use tasksync_proto::task::MutationEvent;

use crate::bus::{EventBus, SubscriptionToken};
use crate::transport::{Channel, Transport, TransportError};

pub use backoff::BackoffPolicy;

/// Lifecycle state of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected and not trying.
    Disconnected,
    /// An open attempt is in flight.
    Connecting,
    /// The channel is open and delivering frames.
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
    /// Automatic retries are exhausted; only `connect()` leaves this state.
    Failed,
}

impl ConnectionState {
    /// Short label for display.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }

    /// Whether a supervisor is active in this state.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded mutation tagged with its arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequenced {
    /// Arrival sequence number, strictly increasing for the manager's lifetime.
    pub seq: u64,
    /// The decoded event.
    pub event: MutationEvent,
}

/// Everything the connection manager publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection state changed.
    State(ConnectionState),
    /// A retry was scheduled after `delay`.
    ReconnectScheduled {
        /// 1-based retry number.
        attempt: u32,
        /// Delay before the retry.
        delay: Duration,
    },
    /// A mutation arrived on the push channel.
    Mutation(Sequenced),
}

struct Inner<T> {
    transport: T,
    policy: BackoffPolicy,
    bus: EventBus<ConnectionEvent>,
    state: Mutex<ConnectionState>,
    last_seq: AtomicU64,
}

struct Supervisor {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Why the read loop ended.
enum ReadEnd {
    Shutdown,
    Lost(TransportError),
}

/// Owns one logical push channel and its reconnect loop.
pub struct ConnectionManager<T: Transport> {
    inner: Arc<Inner<T>>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl<T: Transport> ConnectionManager<T> {
    /// Creates a manager in the `Disconnected` state.
    #[must_use]
    pub fn new(transport: T, policy: BackoffPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                policy,
                bus: EventBus::new(),
                state: Mutex::new(ConnectionState::Disconnected),
                last_seq: AtomicU64::new(0),
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Starts connecting.
    ///
    /// From `Disconnected` or `Failed` this moves to `Connecting` and spawns
    /// the supervisor task (so it must be called inside a Tokio runtime).
    /// While `Connecting`, `Connected` or `Reconnecting` it does nothing.
    ///
    /// The `Connecting` event is published by the supervisor, never under
    /// the slot lock, so handlers may call back into the manager.
    pub fn connect(&self) {
        let mut slot = self.supervisor.lock();
        let current = self.state();
        if current.is_active() {
            tracing::debug!(state = %current, "connect ignored, already active");
            return;
        }

        // A supervisor that ended in Failed has already returned.
        if let Some(stale) = slot.take() {
            stale.handle.abort();
        }

        self.inner.store_state(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(supervise(inner, shutdown_rx));
        *slot = Some(Supervisor {
            shutdown: shutdown_tx,
            handle,
        });
    }

    /// Stops the supervisor, closes the channel, and moves to `Disconnected`.
    ///
    /// Cancels any pending reconnect delay. When this returns no further
    /// events will be published by the old supervisor.
    pub async fn disconnect(&self) {
        let supervisor = self.supervisor.lock().take();
        if let Some(Supervisor { shutdown, handle }) = supervisor {
            let _ = shutdown.send(true);
            if let Err(e) = handle.await
                && e.is_panic()
            {
                tracing::error!(error = %e, "push supervisor panicked");
            }
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Registers a handler for connection events.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionToken
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(handler)
    }

    /// Removes a handler registered with [`subscribe`](Self::subscribe).
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.inner.bus.unsubscribe(token)
    }

    /// The reconnect policy.
    #[must_use]
    pub fn policy(&self) -> BackoffPolicy {
        self.inner.policy
    }

    /// Sequence number of the most recent mutation published (0 if none).
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.inner.last_seq.load(Ordering::SeqCst)
    }

    /// The underlying transport.
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.inner.transport
    }
}

impl<T: Transport> Inner<T> {
    /// Records `next` without publishing; returns whether it changed.
    fn store_state(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock();
        let changed = *state != next;
        *state = next;
        changed
    }

    /// Records `next` and publishes it if it differs from the current state.
    fn set_state(&self, next: ConnectionState) {
        if self.store_state(next) {
            self.announce(next);
        }
    }

    fn announce(&self, state: ConnectionState) {
        tracing::debug!(state = %state, "push connection state");
        self.bus.publish(&ConnectionEvent::State(state));
    }

    async fn read_until_closed(
        &self,
        channel: &mut T::Channel,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ReadEnd {
        loop {
            let frame = tokio::select! {
                biased;
                _ = shutdown.changed() => return ReadEnd::Shutdown,
                frame = channel.recv() => frame,
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => return ReadEnd::Lost(e),
            };
            match frame.decode() {
                Ok(event) => {
                    let seq = self.last_seq.fetch_add(1, Ordering::SeqCst) + 1;
                    tracing::trace!(seq, task_id = %event.task_id(), kind = event.kind(), "push mutation");
                    self.bus
                        .publish(&ConnectionEvent::Mutation(Sequenced { seq, event }));
                }
                Err(e) => {
                    tracing::warn!(error = %e, bytes = frame.len(), "dropping malformed push frame");
                }
            }
        }
    }
}

/// Supervisor task: open, read, back off, repeat.
async fn supervise<T: Transport>(inner: Arc<Inner<T>>, mut shutdown: watch::Receiver<bool>) {
    let endpoint = inner.transport.endpoint();
    let mut attempts: u32 = 0;
    // connect() stored Connecting without publishing it.
    inner.announce(ConnectionState::Connecting);

    loop {
        inner.set_state(ConnectionState::Connecting);
        let opened = tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            result = inner.transport.open() => result,
        };

        match opened {
            Ok(mut channel) => {
                attempts = 0;
                inner.set_state(ConnectionState::Connected);
                tracing::info!(endpoint = %endpoint, "push channel connected");
                match inner.read_until_closed(&mut channel, &mut shutdown).await {
                    ReadEnd::Shutdown => {
                        channel.close().await;
                        return;
                    }
                    ReadEnd::Lost(e) => {
                        tracing::warn!(endpoint = %endpoint, error = %e, "push channel lost");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(endpoint = %endpoint, attempt = attempts, error = %e, "push channel open failed");
            }
        }

        if !inner.policy.allows_retry(attempts) {
            tracing::error!(
                endpoint = %endpoint,
                attempts,
                "push channel retries exhausted, giving up"
            );
            inner.set_state(ConnectionState::Failed);
            return;
        }

        attempts += 1;
        let delay = inner.policy.delay_for(attempts);
        inner.set_state(ConnectionState::Reconnecting);
        tracing::info!(
            attempt = attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "push reconnect scheduled"
        );
        inner.bus.publish(&ConnectionEvent::ReconnectScheduled {
            attempt: attempts,
            delay,
        });

        tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}
