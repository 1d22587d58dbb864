//! The RPC engine
//!
//! [`Messenger`] owns the method registry and the outstanding call table
//! of one endpoint. Outbound calls are tracked by correlation key
//! (`name$sequence`) until the matching callback arrives; inbound calls are
//! executed against the registry and answered with a callback carrying the
//! same key.

use log::{debug, warn};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use super::adapter::{ChannelAdapter, Dispatch, Outbound};
use super::config::{duration_millis, MessengerConfig};
use super::envelope::{correlation_key, split_correlation_key, Envelope, EnvelopeKind, StructuredError};
use super::error::{CallError, DispatchError, MessengerError, RawFailure};
use super::handler::{CallInfo, MethodHandler};
use super::lock;
use super::transport::Transport;

type Completion = oneshot::Sender<Result<Value, CallError>>;

/// One endpoint of the channel. Cloning yields another handle to the same
/// endpoint.
#[derive(Clone)]
pub struct Messenger {
    inner: Arc<Inner>,
}

struct Inner {
    adapter: ChannelAdapter,
    methods: Mutex<HashMap<String, MethodHandler>>,
    pending: Mutex<HashMap<String, Completion>>,
    sequence: AtomicU64,
    config: MessengerConfig,
    runtime: Handle,
}

impl Messenger {
    /// Create an endpoint on top of `transport`.
    ///
    /// Must be called from within a tokio runtime. Background work is
    /// spawned onto that runtime, so the returned handle may be used from
    /// any thread afterwards.
    pub fn new<T: Transport>(transport: T, config: MessengerConfig) -> Result<Self, MessengerError> {
        Self::with_transport(Arc::new(transport), config)
    }

    pub fn with_transport(
        transport: Arc<dyn Transport>,
        config: MessengerConfig,
    ) -> Result<Self, MessengerError> {
        let runtime = Handle::try_current().map_err(|_| MessengerError::NoRuntime)?;
        let adapter = ChannelAdapter::new(transport)?;
        let inner = Arc::new(Inner {
            adapter,
            methods: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(1),
            config,
            runtime,
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let target: Weak<dyn Dispatch> = weak;
        inner.adapter.start(target, &inner.runtime);

        debug!("Messenger created");
        Ok(Self { inner })
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.inner.config
    }

    /// Add `handler` under `name`. Fails if the name is taken.
    pub fn register(&self, name: impl Into<String>, handler: MethodHandler) -> Result<(), MessengerError> {
        let name = name.into();
        let mut methods = lock(&self.inner.methods);
        if methods.contains_key(&name) {
            return Err(MessengerError::DuplicateMethod(name));
        }
        debug!("Registering method '{}' ({:?})", name, handler);
        methods.insert(name, handler);
        Ok(())
    }

    pub fn register_sync<F>(&self, name: impl Into<String>, handler: F) -> Result<(), MessengerError>
    where
        F: Fn(Value, &CallInfo) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register(name, MethodHandler::sync(handler))
    }

    pub fn register_async<F, Fut>(&self, name: impl Into<String>, handler: F) -> Result<(), MessengerError>
    where
        F: Fn(Value, CallInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(name, MethodHandler::from_async(handler))
    }

    pub fn register_fn<P, R, F>(&self, name: impl Into<String>, handler: F) -> Result<(), MessengerError>
    where
        P: DeserializeOwned,
        R: Serialize,
        F: Fn(P) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        self.register(name, MethodHandler::typed(handler))
    }

    /// Remove the method registered under `name`. Returns whether one existed.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = lock(&self.inner.methods).remove(name).is_some();
        if removed {
            debug!("Unregistered method '{}'", name);
        }
        removed
    }

    pub fn is_registered(&self, name: &str) -> bool {
        lock(&self.inner.methods).contains_key(name)
    }

    /// Number of issued calls still waiting for a response
    pub fn outstanding_calls(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Call `name` on the far side. The envelope is sent immediately; the
    /// returned [`PendingCall`] settles when the matching callback arrives
    /// or the configured timeout expires.
    pub fn call(&self, name: &str, args: Value) -> PendingCall {
        self.issue(name, args, self.inner.config.call_timeout())
    }

    pub fn call_with_timeout(&self, name: &str, args: Value, timeout: Duration) -> PendingCall {
        self.issue(name, args, Some(timeout))
    }

    /// Typed variant of [`Messenger::call`]
    pub async fn call_as<R: DeserializeOwned>(
        &self,
        name: &str,
        args: impl Serialize,
    ) -> Result<R, CallError> {
        let args = serde_json::to_value(args)?;
        let value = self.call(name, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Handle one raw inbound body
    pub fn dispatch(&self, body: &str) {
        Dispatch::dispatch(self.inner.as_ref(), body);
    }

    /// Handle one decoded inbound envelope
    pub fn dispatch_envelope(&self, envelope: Envelope) {
        self.inner.dispatch_envelope(envelope);
    }

    fn issue(&self, name: &str, args: Value, timeout: Option<Duration>) -> PendingCall {
        let sequence_number = self.inner.sequence.fetch_add(1, Ordering::SeqCst);
        let key = correlation_key(name, sequence_number);
        let (completion, receiver) = oneshot::channel();

        lock(&self.inner.pending).insert(key.clone(), completion);
        debug!("Calling '{}' (sequence {})", name, sequence_number);

        self.inner
            .adapter
            .outbound()
            .transmit(&Envelope::execute(name, args, sequence_number));

        if let Some(timeout) = timeout {
            self.arm_timeout(name.to_string(), key.clone(), timeout);
        }

        PendingCall {
            method: name.to_string(),
            key,
            sequence_number,
            receiver,
        }
    }

    fn arm_timeout(&self, method: String, key: String, timeout: Duration) {
        let inner = Arc::downgrade(&self.inner);
        self.inner.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let expired = lock(&inner.pending).remove(&key);
            if let Some(completion) = expired {
                warn!("Call '{}' timed out", key);
                let _ = completion.send(Err(CallError::Timeout {
                    method,
                    timeout_ms: duration_millis(timeout),
                }));
            }
        });
    }
}

impl std::fmt::Debug for Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("methods", &lock(&self.inner.methods).len())
            .field("outstanding_calls", &self.outstanding_calls())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Dispatch for Inner {
    fn dispatch(&self, body: &str) {
        match Envelope::decode(body) {
            Ok(envelope) => self.dispatch_envelope(envelope),
            Err(e) => warn!("Dropping undecodable message: {}", e),
        }
    }
}

impl Inner {
    fn dispatch_envelope(&self, envelope: Envelope) {
        match envelope.kind {
            EnvelopeKind::Execute => self.execute(envelope),
            EnvelopeKind::Callback => self.settle(envelope),
        }
    }

    fn execute(&self, envelope: Envelope) {
        let info = CallInfo {
            method: envelope.name,
            sequence_number: envelope.sequence_number,
        };
        let args = envelope.payload;
        let handler = lock(&self.methods).get(&info.method).cloned();
        let outbound = self.adapter.outbound();

        match handler {
            None => {
                let error = DispatchError::UnknownMethod(info.method.clone());
                warn!("{}", error);
                let failure = StructuredError::from_error(&error);
                outbound.transmit(&Envelope::rejected(
                    &info.method,
                    info.sequence_number,
                    failure.to_value(),
                ));
            }
            Some(MethodHandler::Sync(method)) => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| method.invoke(args, &info)))
                    .map_err(panic_message);
                outbound.transmit(&response(&info, outcome));
            }
            Some(MethodHandler::Async(method)) => {
                let outbound = outbound.clone();
                let task_info = info.clone();
                let task = self.runtime.spawn(async move { method.invoke(args, task_info).await });
                self.runtime.spawn(respond_when_settled(outbound, info, task));
            }
        }
    }

    fn settle(&self, envelope: Envelope) {
        let completion = lock(&self.pending).remove(&envelope.name);
        let Some(completion) = completion else {
            match split_correlation_key(&envelope.name) {
                Some((method, sequence_number)) => debug!(
                    "Dropping callback for '{}' (sequence {}) with no outstanding call",
                    method, sequence_number
                ),
                None => warn!("Dropping callback with malformed key '{}'", envelope.name),
            }
            return;
        };

        debug!(
            "Call '{}' settled ({})",
            envelope.name,
            if envelope.succeeded { "fulfilled" } else { "rejected" }
        );

        let result = if envelope.succeeded {
            Ok(envelope.payload)
        } else {
            Err(CallError::Remote(StructuredError::classify(envelope.payload)))
        };
        let _ = completion.send(result);
    }
}

async fn respond_when_settled(
    outbound: Outbound,
    info: CallInfo,
    task: tokio::task::JoinHandle<anyhow::Result<Value>>,
) {
    let outcome = match task.await {
        Ok(result) => Ok(result),
        Err(join_error) => match join_error.try_into_panic() {
            Ok(payload) => Err(panic_message(payload)),
            Err(join_error) => Err(join_error.to_string()),
        },
    };
    outbound.transmit(&response(&info, outcome));
}

/// Build the callback for a finished invocation. `Err` on the outer result
/// carries a panic message.
fn response(info: &CallInfo, outcome: Result<anyhow::Result<Value>, String>) -> Envelope {
    match outcome {
        Ok(Ok(value)) => Envelope::fulfilled(&info.method, info.sequence_number, value),
        Ok(Err(error)) => {
            warn!("Handler for '{}' failed: {:#}", info.method, error);
            Envelope::rejected(&info.method, info.sequence_number, failure_payload(&error))
        }
        Err(message) => {
            let error = DispatchError::HandlerPanicked {
                method: info.method.clone(),
                message,
            };
            warn!("{}", error);
            Envelope::rejected(
                &info.method,
                info.sequence_number,
                StructuredError::from_error(&error).to_value(),
            )
        }
    }
}

fn failure_payload(error: &anyhow::Error) -> Value {
    match error.downcast_ref::<RawFailure>() {
        Some(RawFailure(value)) => value.clone(),
        None => StructuredError::from_anyhow(error).to_value(),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Deferred result of an outbound call
#[derive(Debug)]
pub struct PendingCall {
    method: String,
    key: String,
    sequence_number: u64,
    receiver: oneshot::Receiver<Result<Value, CallError>>,
}

impl PendingCall {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn correlation_key(&self) -> &str {
        &self.key
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }
}

impl Future for PendingCall {
    type Output = Result<Value, CallError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(CallError::Abandoned(self.method.clone()))),
            Poll::Pending => Poll::Pending,
        }
    }
}
