//! Transport contract and an in-memory implementation

use std::sync::Mutex;
use tokio::sync::mpsc;

use super::error::TransportError;
use super::lock;

/// The physical channel between two endpoints.
///
/// A transport transmits opaque bodies and hands out exactly one inbound
/// listener; whoever takes it receives every body that arrives.
pub trait Transport: Send + Sync + 'static {
    /// Transmit one body
    fn send(&self, body: String) -> Result<(), TransportError>;

    /// Take the inbound listener. Returns `None` once it has been taken.
    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<String>>;
}

/// Transport backed by in-process channels
pub struct MemoryTransport {
    outbound: mpsc::UnboundedSender<String>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl MemoryTransport {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self {
            outbound,
            inbound: Mutex::new(Some(inbound)),
        }
    }

    /// Two transports wired back to back
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (left_tx, right_rx) = mpsc::unbounded_channel();
        let (right_tx, left_rx) = mpsc::unbounded_channel();
        (
            MemoryTransport::new(left_tx, left_rx),
            MemoryTransport::new(right_tx, right_rx),
        )
    }
}

impl Transport for MemoryTransport {
    fn send(&self, body: String) -> Result<(), TransportError> {
        self.outbound
            .send(body)
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        lock(&self.inbound).take()
    }
}
