//! Transport abstraction.
//!
//! The client only needs an ordered message channel to the store: a way to
//! send text frames, and a stream of inbound frames interleaved with
//! connection lifecycle events. Socket and reconnect plumbing live behind
//! this seam.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use unigraph_core::protocol::{ClientMessage, ServerMessage};

/// Errors raised by a transport when sending.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Transport is disconnected")]
    Disconnected,

    #[error("Transport is closed")]
    Closed,

    #[error("Transport I/O error: {0}")]
    Io(String),
}

/// Inbound traffic from the store, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The channel (re)connected.
    Connected,
    /// The channel dropped. Not an error; live queries go stale until the
    /// next `Connected`.
    Disconnected,
    /// One text frame.
    Frame(String),
}

/// Outbound half of a message channel to the store.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one text frame.
    async fn send(&self, frame: String) -> Result<(), TransportError>;
}

/// In-memory transport. The store side is a [`StoreEnd`].
pub struct ChannelTransport {
    outbound: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }
}

/// Store side of an in-memory channel.
pub struct StoreEnd {
    inbound: Mutex<mpsc::UnboundedReceiver<String>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    connected: Arc<AtomicBool>,
}

impl StoreEnd {
    /// Next frame sent by the client, decoded. `None` once the client side
    /// is gone.
    pub async fn recv(&self) -> Option<ClientMessage> {
        let mut inbound = self.inbound.lock().await;
        loop {
            let frame = inbound.recv().await?;
            match serde_json::from_str(&frame) {
                Ok(msg) => return Some(msg),
                Err(e) => tracing::warn!(error = %e, "Store side dropped undecodable frame"),
            }
        }
    }

    /// Push a message to the client.
    pub fn push(&self, message: &ServerMessage) -> Result<(), TransportError> {
        let frame = serde_json::to_string(message).map_err(|e| TransportError::Io(e.to_string()))?;
        self.push_raw(frame)
    }

    /// Push an arbitrary text frame to the client.
    pub fn push_raw(&self, frame: String) -> Result<(), TransportError> {
        self.events
            .send(TransportEvent::Frame(frame))
            .map_err(|_| TransportError::Closed)
    }

    /// Simulate the channel dropping.
    pub fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.events
            .send(TransportEvent::Disconnected)
            .map_err(|_| TransportError::Closed)
    }

    /// Simulate the channel coming back.
    pub fn reconnect(&self) -> Result<(), TransportError> {
        self.connected.store(true, Ordering::SeqCst);
        self.events
            .send(TransportEvent::Connected)
            .map_err(|_| TransportError::Closed)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Build a connected in-memory channel.
///
/// Returns the client-side transport, the client-side event receiver, and
/// the store side.
pub fn channel_transport() -> (
    ChannelTransport,
    mpsc::UnboundedReceiver<TransportEvent>,
    StoreEnd,
) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (ev_tx, ev_rx) = mpsc::unbounded_channel();
    let connected = Arc::new(AtomicBool::new(true));

    let transport = ChannelTransport {
        outbound: out_tx,
        connected: connected.clone(),
    };
    let store = StoreEnd {
        inbound: Mutex::new(out_rx),
        events: ev_tx,
        connected,
    };
    (transport, ev_rx, store)
}
