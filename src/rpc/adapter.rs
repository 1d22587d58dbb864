//! Channel adapter between a [`Transport`] and the engine

use log::{debug, trace, warn};
use std::sync::{Arc, Mutex, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::envelope::Envelope;
use super::error::MessengerError;
use super::lock;
use super::transport::Transport;

/// Entry point that receives raw inbound bodies
pub trait Dispatch: Send + Sync + 'static {
    fn dispatch(&self, body: &str);
}

/// Cloneable sending half of the adapter
#[derive(Clone)]
pub struct Outbound {
    transport: Arc<dyn Transport>,
}

impl Outbound {
    /// Encode and push an envelope onto the transport. Failures are logged
    /// and the envelope is dropped.
    pub fn transmit(&self, envelope: &Envelope) {
        let body = match envelope.encode() {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to encode envelope '{}': {}", envelope.name, e);
                return;
            }
        };

        trace!("Sending: {}", body);

        if let Err(e) = self.transport.send(body) {
            warn!("Dropping envelope '{}': {}", envelope.name, e);
        }
    }
}

/// Wraps the transport: forwards every inbound body to a [`Dispatch`]
/// target and pushes outbound envelopes onto the wire.
pub struct ChannelAdapter {
    outbound: Outbound,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelAdapter {
    /// Subscribe to the transport's inbound listener
    pub fn new(transport: Arc<dyn Transport>) -> Result<Self, MessengerError> {
        let inbound = transport
            .take_inbound()
            .ok_or(MessengerError::ListenerAttached)?;

        Ok(Self {
            outbound: Outbound { transport },
            inbound: Mutex::new(Some(inbound)),
            listener: Mutex::new(None),
        })
    }

    /// Start forwarding inbound bodies to `target` on `runtime`. Only the
    /// first call has an effect.
    pub fn start(&self, target: Weak<dyn Dispatch>, runtime: &Handle) {
        let Some(inbound) = lock(&self.inbound).take() else {
            return;
        };
        let handle = runtime.spawn(Self::forward_loop(inbound, target));
        *lock(&self.listener) = Some(handle);
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    async fn forward_loop(mut inbound: mpsc::UnboundedReceiver<String>, target: Weak<dyn Dispatch>) {
        debug!("Channel adapter listening");

        while let Some(body) = inbound.recv().await {
            trace!("Received: {}", body);
            match target.upgrade() {
                Some(target) => target.dispatch(&body),
                None => {
                    debug!("Dispatch target dropped");
                    break;
                }
            }
        }

        debug!("Channel adapter stopped");
    }
}

impl Drop for ChannelAdapter {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.listener).take() {
            handle.abort();
        }
    }
}
