//! Push-channel transport abstraction.
//!
//! A [`Transport`] knows how to open a fresh [`Channel`]; a channel yields
//! inbound [`Frame`]s until the remote end closes or errors. Concrete
//! implementations:
//! - [`websocket::WebSocketTransport`]: WebSocket client over `tokio-tungstenite`
//! - [`loopback::LoopbackTransport`]: in-process transport driven by a
//!   [`loopback::LoopbackHandle`], for tests and demos

pub mod loopback;
pub mod websocket;

use std::future::Future;

use tasksync_proto::push::{self, CodecError};
use tasksync_proto::task::MutationEvent;

/// A raw inbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 payload, JSON push format.
    Text(String),
    /// Binary payload, postcard encoding.
    Binary(Vec<u8>),
}

impl Frame {
    /// Decodes the frame into a mutation event using the encoding implied by
    /// the frame kind.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the payload is malformed.
    pub fn decode(&self) -> Result<MutationEvent, CodecError> {
        match self {
            Self::Text(text) => push::decode_json(text),
            Self::Binary(bytes) => push::decode_binary(bytes),
        }
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Errors that can occur while opening or reading a channel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The channel was closed by the remote end or locally.
    #[error("connection closed")]
    ConnectionClosed,

    /// The open attempt timed out.
    #[error("transport operation timed out")]
    Timeout,

    /// The endpoint refused or could not be reached.
    #[error("endpoint refused connection: {0}")]
    Refused(String),

    /// An underlying I/O or protocol error.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opens push channels to one endpoint.
pub trait Transport: Send + Sync + 'static {
    /// The channel type produced by [`open`](Self::open).
    type Channel: Channel;

    /// Opens a new channel.
    ///
    /// Resolves once the channel is ready to deliver frames.
    fn open(&self) -> impl Future<Output = Result<Self::Channel, TransportError>> + Send;

    /// Human-readable endpoint description for log fields.
    fn endpoint(&self) -> String;
}

/// One open push channel.
pub trait Channel: Send + 'static {
    /// Waits for the next inbound frame.
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the channel has
    /// ended; any error means the channel is no longer usable.
    fn recv(&mut self) -> impl Future<Output = Result<Frame, TransportError>> + Send;

    /// Closes the channel.
    fn close(self) -> impl Future<Output = ()> + Send;
}
