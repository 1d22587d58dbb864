//! Handler abstraction for registered methods
//!
//! A handler states its synchronicity through its type: [`SyncMethod`]
//! produces the result inline, [`AsyncMethod`] produces it later and is
//! driven on its own task so the engine never waits for it.

use anyhow::Context;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Metadata handed to a handler alongside its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    /// Name the method was invoked under
    pub method: String,
    /// Sequence number the caller assigned to this call
    pub sequence_number: u64,
}

/// A handler that returns its result immediately
pub trait SyncMethod: Send + Sync {
    fn invoke(&self, args: Value, info: &CallInfo) -> anyhow::Result<Value>;
}

impl<F> SyncMethod for F
where
    F: Fn(Value, &CallInfo) -> anyhow::Result<Value> + Send + Sync,
{
    fn invoke(&self, args: Value, info: &CallInfo) -> anyhow::Result<Value> {
        self(args, info)
    }
}

/// A handler whose result settles later
#[async_trait]
pub trait AsyncMethod: Send + Sync {
    async fn invoke(&self, args: Value, info: CallInfo) -> anyhow::Result<Value>;
}

/// Adapts an async closure to [`AsyncMethod`]
pub struct AsyncFn<F>(pub F);

#[async_trait]
impl<F, Fut> AsyncMethod for AsyncFn<F>
where
    F: Fn(Value, CallInfo) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn invoke(&self, args: Value, info: CallInfo) -> anyhow::Result<Value> {
        (self.0)(args, info).await
    }
}

/// Entry of the method registry
#[derive(Clone)]
pub enum MethodHandler {
    Sync(Arc<dyn SyncMethod>),
    Async(Arc<dyn AsyncMethod>),
}

impl MethodHandler {
    pub fn sync<F>(handler: F) -> Self
    where
        F: Fn(Value, &CallInfo) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        MethodHandler::Sync(Arc::new(handler))
    }

    pub fn from_async<F, Fut>(handler: F) -> Self
    where
        F: Fn(Value, CallInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        MethodHandler::Async(Arc::new(AsyncFn(handler)))
    }

    /// Wrap a strongly typed function. Arguments that fail to deserialize
    /// into `P` are reported as a handler failure.
    pub fn typed<P, R, F>(handler: F) -> Self
    where
        P: DeserializeOwned,
        R: Serialize,
        F: Fn(P) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        MethodHandler::sync(move |args: Value, info: &CallInfo| {
            let params: P = serde_json::from_value(args)
                .with_context(|| format!("invalid arguments for '{}'", info.method))?;
            let result = handler(params)?;
            Ok(serde_json::to_value(result)?)
        })
    }

    pub fn is_async(&self) -> bool {
        matches!(self, MethodHandler::Async(_))
    }
}

impl std::fmt::Debug for MethodHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MethodHandler::Sync(_) => write!(f, "MethodHandler::Sync"),
            MethodHandler::Async(_) => write!(f, "MethodHandler::Async"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn info(method: &str) -> CallInfo {
        CallInfo {
            method: method.to_string(),
            sequence_number: 1,
        }
    }

    #[test]
    fn test_sync_handler_receives_call_info() {
        let handler = MethodHandler::sync(|args, info| {
            Ok(json!({"method": info.method, "args": args}))
        });
        assert!(!handler.is_async());

        match handler {
            MethodHandler::Sync(method) => {
                let result = method.invoke(json!(3), &info("whoami")).unwrap();
                assert_eq!(result, json!({"method": "whoami", "args": 3}));
            }
            MethodHandler::Async(_) => panic!("Expected sync handler"),
        }
    }

    #[tokio::test]
    async fn test_async_handler() {
        let handler = MethodHandler::from_async(|args: Value, _info: CallInfo| async move {
            tokio::task::yield_now().await;
            Ok(json!(args.as_i64().unwrap_or_default() * 2))
        });
        assert!(handler.is_async());

        match handler {
            MethodHandler::Async(method) => {
                let result = method.invoke(json!(21), info("double")).await.unwrap();
                assert_eq!(result, json!(42));
            }
            MethodHandler::Sync(_) => panic!("Expected async handler"),
        }
    }

    #[derive(Deserialize)]
    struct AddParams {
        a: i64,
        b: i64,
    }

    #[test]
    fn test_typed_handler() {
        let handler = MethodHandler::typed(|params: AddParams| Ok(params.a + params.b));
        let MethodHandler::Sync(method) = handler else {
            panic!("Expected sync handler");
        };

        let sum = method.invoke(json!({"a": 2, "b": 3}), &info("add")).unwrap();
        assert_eq!(sum, json!(5));

        let error = method.invoke(json!("oops"), &info("add")).unwrap_err();
        assert_eq!(error.to_string(), "invalid arguments for 'add'");
    }
}
