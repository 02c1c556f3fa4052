use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use tracing::instrument;

use crate::error::{ClusterError, RpcError};

/// Server-side handler for one `module/method` pair.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    fn module(&self) -> &str;

    fn method(&self) -> &str;

    /// Handle one call. An `Err` reaches the caller as `{error: {code, message}}`.
    async fn process(&self, args: Value) -> Result<Value, RpcError>;
}

type HandlerFn = dyn Fn(Value) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync;

struct FnHandler {
    module: String,
    method: String,
    f: Box<HandlerFn>,
}

#[async_trait]
impl RpcHandler for FnHandler {
    fn module(&self) -> &str {
        &self.module
    }

    fn method(&self) -> &str {
        &self.method
    }

    async fn process(&self, args: Value) -> Result<Value, RpcError> {
        (self.f)(args).await
    }
}

/// Build a handler from an async closure.
pub fn handler_fn<F, Fut>(
    module: impl Into<String>,
    method: impl Into<String>,
    f: F,
) -> Arc<dyn RpcHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    Arc::new(FnHandler {
        module: module.into(),
        method: method.into(),
        f: Box::new(move |args| Box::pin(f(args))),
    })
}

/// `commons/time`: the server's clock as `{"now": <epoch millis>}`.
pub struct TimeHandler;

#[async_trait]
impl RpcHandler for TimeHandler {
    fn module(&self) -> &str {
        "commons"
    }

    fn method(&self) -> &str {
        "time"
    }

    async fn process(&self, _args: Value) -> Result<Value, RpcError> {
        Ok(json!({ "now": chrono::Utc::now().timestamp_millis() }))
    }
}

/// Immutable `module/method` dispatch table, built once at boot.
pub struct HandlerRegistry {
    handlers: HashMap<(String, String), Arc<dyn RpcHandler>>,
}

impl HandlerRegistry {
    /// Fails with `DuplicateHandler` if two handlers share a key.
    pub fn new(
        handlers: impl IntoIterator<Item = Arc<dyn RpcHandler>>,
    ) -> Result<Self, ClusterError> {
        let mut table = HashMap::new();
        for handler in handlers {
            let key = (handler.module().to_string(), handler.method().to_string());
            if table.contains_key(&key) {
                return Err(ClusterError::DuplicateHandler {
                    key: format!("{}/{}", key.0, key.1),
                });
            }
            table.insert(key, handler);
        }
        Ok(Self { handlers: table })
    }

    /// Like [`HandlerRegistry::new`], with the built-in `commons/time` handler added.
    pub fn with_builtins(
        handlers: impl IntoIterator<Item = Arc<dyn RpcHandler>>,
    ) -> Result<Self, ClusterError> {
        let builtins: [Arc<dyn RpcHandler>; 1] = [Arc::new(TimeHandler)];
        Self::new(builtins.into_iter().chain(handlers))
    }

    /// Run the handler for `module/method`. Handler errors come back as
    /// [`ClusterError::Remote`] with the handler's code and message; a panic
    /// becomes [`ClusterError::HandlerPanicked`].
    #[instrument(skip(self, args))]
    pub async fn dispatch(
        &self,
        module: &str,
        method: &str,
        args: Value,
    ) -> Result<Value, ClusterError> {
        let handler = self
            .handlers
            .get(&(module.to_string(), method.to_string()))
            .ok_or_else(|| ClusterError::NoHandler {
                module: module.to_string(),
                method: method.to_string(),
            })?;

        // The handler is shared and stateless from our side, so nothing
        // observes it half-updated after a panic.
        match AssertUnwindSafe(handler.process(args)).catch_unwind().await {
            Ok(result) => Ok(result?),
            Err(panic_payload) => {
                let info = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                tracing::error!(module, method, panic = %info, "rpc handler panicked");
                Err(ClusterError::HandlerPanicked {
                    module: module.to_string(),
                    method: method.to_string(),
                    info,
                })
            }
        }
    }

    /// Registered keys as `module/method`, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .handlers
            .keys()
            .map(|(module, method)| format!("{module}/{method}"))
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> Arc<dyn RpcHandler> {
        handler_fn("test", "echo", |args| async move { Ok(args) })
    }

    #[tokio::test]
    async fn dispatches_to_registered_handler() {
        let registry = HandlerRegistry::new([echo()]).unwrap();
        let out = registry
            .dispatch("test", "echo", json!({"a": 1}))
            .await
            .unwrap();
        assert_eq!(out, json!({"a": 1}));
    }

    #[tokio::test]
    async fn unknown_key_is_no_handler() {
        let registry = HandlerRegistry::new([echo()]).unwrap();
        let err = registry
            .dispatch("test", "missing", Value::Null)
            .await
            .unwrap_err();
        assert!(
            matches!(err, ClusterError::NoHandler { ref module, ref method } if module == "test" && method == "missing")
        );
    }

    #[tokio::test]
    async fn handler_errors_pass_through_unchanged() {
        let failing = handler_fn("test", "fail", |_| async { Err(RpcError::new("998", "x")) });
        let registry = HandlerRegistry::new([failing]).unwrap();
        let err = registry
            .dispatch("test", "fail", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "998");
        assert_eq!(err.message().as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn panicking_handler_becomes_an_error() {
        let boom = handler_fn("test", "boom", |_| async {
            let empty: Vec<Value> = Vec::new();
            Ok(empty[0].clone())
        });
        let registry = HandlerRegistry::new([boom]).unwrap();
        let err = registry
            .dispatch("test", "boom", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::HandlerPanicked { ref module, ref method, .. } if module == "test" && method == "boom"));
        assert_eq!(err.code(), "Internal");

        // The registry stays usable afterwards.
        let err = registry
            .dispatch("test", "boom", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "Internal");
    }

    #[test]
    fn duplicate_keys_fail_the_build() {
        let err = HandlerRegistry::new([echo(), echo()]).err().unwrap();
        assert!(matches!(err, ClusterError::DuplicateHandler { ref key } if key == "test/echo"));

        let shadowing = handler_fn("commons", "time", |_| async { Ok(Value::Null) });
        let err = HandlerRegistry::with_builtins([shadowing]).err().unwrap();
        assert!(matches!(err, ClusterError::DuplicateHandler { ref key } if key == "commons/time"));
    }

    #[tokio::test]
    async fn time_handler_reports_epoch_millis() {
        let registry = HandlerRegistry::with_builtins([echo()]).unwrap();
        assert_eq!(registry.keys(), vec!["commons/time", "test/echo"]);

        let before = chrono::Utc::now().timestamp_millis();
        let out = registry
            .dispatch("commons", "time", Value::Null)
            .await
            .unwrap();
        let now = out["now"].as_i64().unwrap();
        assert!(now >= before);
    }
}
