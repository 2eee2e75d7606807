//! In-process transport for tests.
//!
//! [`LoopbackTransport::new`] returns the transport plus a
//! [`LoopbackHandle`] that plays the server: it can refuse opens, push frames
//! into the live channel, and sever it.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use tasksync_proto::push;
use tasksync_proto::task::MutationEvent;

use super::{Channel, Frame, Transport, TransportError};

struct Shared {
    refuse_next: u32,
    refuse_all: bool,
    live: Option<mpsc::UnboundedSender<Frame>>,
}

/// Transport side, handed to the connection manager.
pub struct LoopbackTransport {
    shared: Arc<Mutex<Shared>>,
    opens: watch::Sender<u32>,
}

/// Server side, kept by the test.
#[derive(Clone)]
pub struct LoopbackHandle {
    shared: Arc<Mutex<Shared>>,
    opens: watch::Receiver<u32>,
}

/// Channel produced by [`LoopbackTransport`].
pub struct LoopbackChannel {
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl LoopbackTransport {
    /// Creates a connected transport/handle pair.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use tasksync::transport::loopback::LoopbackTransport;
    /// use tasksync::transport::{Channel, Frame, Transport};
    ///
    /// # async fn example() {
    /// let (transport, handle) = LoopbackTransport::new();
    /// let mut channel = transport.open().await.unwrap();
    /// handle.push(Frame::Text("{}".to_string()));
    /// let frame = channel.recv().await.unwrap();
    /// assert_eq!(frame, Frame::Text("{}".to_string()));
    /// # }
    /// ```
    #[must_use]
    pub fn new() -> (Self, LoopbackHandle) {
        let shared = Arc::new(Mutex::new(Shared {
            refuse_next: 0,
            refuse_all: false,
            live: None,
        }));
        let (opens_tx, opens_rx) = watch::channel(0);
        (
            Self {
                shared: Arc::clone(&shared),
                opens: opens_tx,
            },
            LoopbackHandle {
                shared,
                opens: opens_rx,
            },
        )
    }
}

impl Transport for LoopbackTransport {
    type Channel = LoopbackChannel;

    async fn open(&self) -> Result<LoopbackChannel, TransportError> {
        let result = {
            let mut shared = self.shared.lock();
            if shared.refuse_all || shared.refuse_next > 0 {
                shared.refuse_next = shared.refuse_next.saturating_sub(1);
                Err(TransportError::Refused("loopback endpoint refused".to_string()))
            } else {
                let (tx, rx) = mpsc::unbounded_channel();
                // Replacing the sender ends any previous channel.
                shared.live = Some(tx);
                Ok(LoopbackChannel { rx })
            }
        };
        self.opens.send_modify(|n| *n += 1);
        result
    }

    fn endpoint(&self) -> String {
        "loopback".to_string()
    }
}

impl Channel for LoopbackChannel {
    async fn recv(&mut self) -> Result<Frame, TransportError> {
        self.rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    async fn close(mut self) {
        self.rx.close();
    }
}

impl LoopbackHandle {
    /// Makes the next `n` open attempts fail.
    pub fn refuse_next(&self, n: u32) {
        self.shared.lock().refuse_next = n;
    }

    /// Makes every open attempt fail until called again with `false`.
    pub fn refuse_all(&self, refuse: bool) {
        self.shared.lock().refuse_all = refuse;
    }

    /// Delivers a frame to the live channel. Returns `false` if there is none.
    pub fn push(&self, frame: Frame) -> bool {
        self.shared
            .lock()
            .live
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok())
    }

    /// Encodes `event` as a JSON text frame and delivers it.
    pub fn push_event(&self, event: &MutationEvent) -> bool {
        match push::encode_json(event) {
            Ok(text) => self.push(Frame::Text(text)),
            Err(e) => {
                tracing::warn!(error = %e, "loopback failed to encode event");
                false
            }
        }
    }

    /// Severs the live channel; the reader sees `ConnectionClosed`.
    pub fn drop_connection(&self) {
        self.shared.lock().live = None;
    }

    /// Whether a channel is currently open and its reader still alive.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared
            .lock()
            .live
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Number of open attempts so far (successful or refused).
    #[must_use]
    pub fn open_count(&self) -> u32 {
        *self.opens.borrow()
    }

    /// Waits until at least `n` open attempts have been made.
    pub async fn wait_for_opens(&mut self, n: u32) {
        // The sender lives in the transport; if it is gone no more opens come.
        let _ = self.opens.wait_for(|count| *count >= n).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasksync_proto::task::TaskId;

    #[tokio::test]
    async fn pushed_frames_arrive_in_order() {
        let (transport, handle) = LoopbackTransport::new();
        let mut channel = transport.open().await.unwrap();
        for i in 0..5 {
            assert!(handle.push(Frame::Binary(vec![i])));
        }
        for i in 0..5 {
            assert_eq!(channel.recv().await.unwrap(), Frame::Binary(vec![i]));
        }
    }

    #[tokio::test]
    async fn push_without_channel_returns_false() {
        let (_transport, handle) = LoopbackTransport::new();
        assert!(!handle.push(Frame::Text("x".to_string())));
    }

    #[tokio::test]
    async fn refused_opens_are_counted() {
        let (transport, handle) = LoopbackTransport::new();
        handle.refuse_next(2);
        assert!(matches!(transport.open().await, Err(TransportError::Refused(_))));
        assert!(matches!(transport.open().await, Err(TransportError::Refused(_))));
        assert!(transport.open().await.is_ok());
        assert_eq!(handle.open_count(), 3);
    }

    #[tokio::test]
    async fn drop_connection_closes_reader() {
        let (transport, handle) = LoopbackTransport::new();
        let mut channel = transport.open().await.unwrap();
        assert!(handle.is_connected());
        handle.drop_connection();
        assert!(!handle.is_connected());
        assert!(matches!(
            channel.recv().await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn reopening_replaces_previous_channel() {
        let (transport, handle) = LoopbackTransport::new();
        let mut first = transport.open().await.unwrap();
        let mut second = transport.open().await.unwrap();
        assert!(matches!(first.recv().await, Err(TransportError::ConnectionClosed)));
        handle.push_event(&MutationEvent::Deleted(TaskId::new("1")));
        let frame = second.recv().await.unwrap();
        assert_eq!(
            frame.decode().unwrap(),
            MutationEvent::Deleted(TaskId::new("1"))
        );
    }

    #[tokio::test]
    async fn closing_channel_is_observed_by_handle() {
        let (transport, handle) = LoopbackTransport::new();
        let channel = transport.open().await.unwrap();
        channel.close().await;
        assert!(!handle.is_connected());
    }
}
