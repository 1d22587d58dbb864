//! Bidirectional RPC over a single message channel
//!
//! Two endpoints, each owning a [`Messenger`], register named methods and
//! call each other's methods over one transport. Every outbound call gets a
//! correlation key (`name$sequence`); the far side answers with a callback
//! carrying the same key, which settles the caller's [`PendingCall`].
//!
//! ## Components
//!
//! - [`transport`]: the [`Transport`] contract and an in-memory pair
//! - [`stdio`]: Content-Length framed transport over byte streams
//! - [`adapter`]: forwards inbound bodies to the engine and envelopes out
//! - [`engine`]: method registry, outstanding call table, dispatch
//! - [`envelope`]: wire envelope and structured errors
//!
//! ## Example
//!
//! ```rust,no_run
//! use messenger_rpc::{MemoryTransport, Messenger, MessengerConfig};
//! use serde_json::json;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let (left, right) = MemoryTransport::pair();
//! let server = Messenger::new(left, MessengerConfig::default())?;
//! let client = Messenger::new(right, MessengerConfig::default())?;
//!
//! server.register_sync("echo", |args, _info| Ok(args))?;
//! let reply = client.call("echo", json!("hi")).await?;
//! assert_eq!(reply, json!("hi"));
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod stdio;
pub mod transport;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use adapter::{ChannelAdapter, Dispatch, Outbound};
pub use config::{FrameConfig, MessengerConfig};
pub use engine::{Messenger, PendingCall};
pub use envelope::{correlation_key, Envelope, EnvelopeKind, StructuredError};
pub use error::{CallError, DispatchError, MessengerError, RawFailure, RemoteFailure, TransportError};
pub use handler::{AsyncMethod, CallInfo, MethodHandler, SyncMethod};
pub use stdio::FramedTransport;
pub use transport::{MemoryTransport, Transport};

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
