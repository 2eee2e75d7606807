//! Push relay core: shared state, WebSocket handler, and fan-out.
//!
//! Every client connects on `/ws`. A valid mutation frame received from one
//! client is rebroadcast, unchanged, to every other client. `POST /events`
//! injects a JSON push frame from the server side and reaches every client.
//! Invalid or oversized frames are dropped with a warning.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tasksync_proto::push::{self, CodecError};
use tasksync_proto::task::MutationEvent;
use tokio::sync::{RwLock, broadcast, mpsc};

/// Default maximum accepted frame size in bytes (64 KB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Default number of frames buffered per slow client before it lags.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// Largest `max_frame_size` accepted; axum refuses bigger WebSocket
/// messages before they reach the relay.
pub const FRAME_SIZE_CEILING: usize = 64 * 1024 * 1024;

/// Resource limits for one relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayLimits {
    /// Largest accepted frame, in bytes.
    pub max_frame_size: usize,
    /// Frames buffered per client before a slow one starts skipping.
    pub broadcast_capacity: NonZeroUsize,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            broadcast_capacity: NonZeroUsize::new(DEFAULT_BROADCAST_CAPACITY)
                .unwrap_or(NonZeroUsize::MIN),
        }
    }
}

/// Errors produced by the relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A frame did not decode to a valid mutation.
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] CodecError),

    /// A frame exceeded the configured size limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Received size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// Only text and binary frames carry mutations.
    #[error("unsupported frame kind")]
    UnsupportedFrame,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Bind { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::FrameTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidFrame(_) | Self::UnsupportedFrame => StatusCode::BAD_REQUEST,
        };
        (status, self.to_string()).into_response()
    }
}

/// A frame on its way to every client except its sender.
#[derive(Debug, Clone)]
struct Relayed {
    /// Connection that sent it (`None` for server-side injections).
    from: Option<u64>,
    message: Message,
}

/// Shared relay state: the client registry and the fan-out channel.
pub struct RelayState {
    /// Per-client control channel, used for close frames.
    connections: RwLock<HashMap<u64, mpsc::UnboundedSender<Message>>>,
    fanout: broadcast::Sender<Relayed>,
    next_id: AtomicU64,
    relayed: AtomicU64,
    max_frame_size: usize,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates relay state with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(RelayLimits::default())
    }

    /// Creates relay state with the given limits.
    #[must_use]
    pub fn with_limits(limits: RelayLimits) -> Self {
        let (fanout, _) = broadcast::channel(limits.broadcast_capacity.get());
        Self {
            connections: RwLock::new(HashMap::new()),
            fanout,
            next_id: AtomicU64::new(1),
            relayed: AtomicU64::new(0),
            max_frame_size: limits.max_frame_size,
        }
    }

    /// Number of connected clients.
    pub async fn client_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Number of frames accepted for fan-out so far.
    #[must_use]
    pub fn relayed_count(&self) -> u64 {
        self.relayed.load(Ordering::Relaxed)
    }

    /// Broadcasts `event` to every client as a JSON text frame.
    ///
    /// Returns the number of clients it was queued for.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidFrame`] if the event cannot be encoded.
    pub fn publish(&self, event: &MutationEvent) -> Result<usize, RelayError> {
        let text = push::encode_json(event)?;
        Ok(self.broadcast(None, Message::Text(text.into())))
    }

    /// Validates a JSON push frame and broadcasts it to every client.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError`] if the frame is oversized or malformed.
    pub fn inject_json(&self, text: &str) -> Result<usize, RelayError> {
        let message = Message::Text(text.to_owned().into());
        let event = self.check_frame(&message)?;
        tracing::info!(task_id = %event.task_id(), kind = event.kind(), "injecting mutation");
        Ok(self.broadcast(None, message))
    }

    /// Sends a WebSocket Close frame to every connected client.
    ///
    /// Each client's writer sends the close frame and ends, which the client
    /// observes as a dropped push channel.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (client, sender) in conns.iter() {
            tracing::info!(client, "sending close frame to client");
            let _ = sender.send(Message::Close(None));
        }
    }

    async fn register(&self, client: u64, sender: mpsc::UnboundedSender<Message>) {
        self.connections.write().await.insert(client, sender);
    }

    async fn unregister(&self, client: u64) {
        self.connections.write().await.remove(&client);
    }

    /// Decodes a frame to check it carries a valid mutation.
    fn check_frame(&self, message: &Message) -> Result<MutationEvent, RelayError> {
        let size = match message {
            Message::Text(text) => text.len(),
            Message::Binary(data) => data.len(),
            _ => return Err(RelayError::UnsupportedFrame),
        };
        if size > self.max_frame_size {
            return Err(RelayError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        let event = match message {
            Message::Text(text) => push::decode_json(text.as_str())?,
            Message::Binary(data) => push::decode_binary(data)?,
            _ => return Err(RelayError::UnsupportedFrame),
        };
        Ok(event)
    }

    fn relay_from(&self, client: u64, message: Message) {
        match self.check_frame(&message) {
            Ok(event) => {
                tracing::debug!(client, task_id = %event.task_id(), kind = event.kind(), "relaying mutation");
                self.broadcast(Some(client), message);
            }
            Err(e) => tracing::warn!(client, error = %e, "dropping frame"),
        }
    }

    fn broadcast(&self, from: Option<u64>, message: Message) -> usize {
        self.relayed.fetch_add(1, Ordering::Relaxed);
        // No receivers just means no clients are connected.
        self.fanout.send(Relayed { from, message }).unwrap_or(0)
    }
}

/// Handles an upgraded WebSocket connection for a single client.
///
/// The connection lifecycle:
/// 1. Subscribe to the fan-out and register the control channel.
/// 2. Forward fan-out frames from other clients to this socket.
/// 3. Validate and broadcast every frame this client sends.
/// 4. On disconnect, unregister.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let client = state.next_id.fetch_add(1, Ordering::Relaxed);
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let mut fanout = state.fanout.subscribe();
    let (tx, mut control) = mpsc::unbounded_channel::<Message>();
    state.register(client, tx).await;
    tracing::info!(client, "client connected");

    let mut write_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                Some(msg) = control.recv() => msg,
                relayed = fanout.recv() => match relayed {
                    Ok(Relayed { from, .. }) if from == Some(client) => continue,
                    Ok(Relayed { message, .. }) => message,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(client, skipped, "client lagging, frames skipped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(client, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(_) | Message::Binary(_) => reader_state.relay_from(client, msg),
                Message::Close(_) => {
                    tracing::info!(client, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    state.unregister(client).await;
    tracing::info!(client, "client disconnected");
}

/// Starts the relay server on `addr` with default limits.
///
/// Returns the bound address (useful with port `0`) and the server task.
///
/// # Errors
///
/// Returns [`RelayError::Bind`] if the TCP listener cannot bind.
pub async fn start_server(
    addr: &str,
) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>), RelayError> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with a pre-configured [`RelayState`].
///
/// # Errors
///
/// Returns [`RelayError::Bind`] if the TCP listener cannot bind.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>), RelayError> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .route("/events", axum::routing::post(inject_handler))
        .with_state(state);

    let bind_err = |source| RelayError::Bind {
        addr: addr.to_string(),
        source,
    };
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(bind_err)?;
    let bound_addr = listener.local_addr().map_err(bind_err)?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

/// Axum handler for WebSocket upgrade requests.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Axum handler for `POST /events`: body is one JSON push frame.
async fn inject_handler(
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
    body: String,
) -> Result<StatusCode, RelayError> {
    state.inject_json(&body).map(|_| StatusCode::ACCEPTED)
}
