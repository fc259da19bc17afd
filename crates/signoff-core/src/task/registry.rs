//! Process-local registry of task handlers.
//!
//! Maps a handler name to a `(input: JSON) -> JSON` function. Registration
//! happens at startup; the executor treats an unregistered name as a
//! permanent step failure. Handlers MUST be deterministic and idempotent
//! within the scope of one workflow advancement: under crash recovery a
//! step whose outcome was not yet persisted may be re-executed.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;

use signoff_types::error::TaskError;

/// Type-erased task handler: every handler shares one signature.
pub type TaskHandler = Arc<
    dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value, TaskError>>
        + Send
        + Sync,
>;

/// Thread-safe name -> handler map.
pub struct TaskRegistry {
    handlers: DashMap<String, TaskHandler>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Register a handler under a name. An existing handler under the same
    /// name is replaced.
    pub fn register<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, TaskError>> + Send + 'static,
    {
        let erased: TaskHandler = Arc::new(move |input| Box::pin(handler(input)));
        tracing::debug!(handler = name, "task handler registered");
        self.handlers.insert(name.to_string(), erased);
    }

    /// Look up a handler by name.
    pub fn get(&self, name: &str) -> Option<TaskHandler> {
        self.handlers.get(name).map(|h| Arc::clone(h.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered handler names, unordered.
    pub fn names(&self) -> Vec<String> {
        self.handlers.iter().map(|h| h.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("handlers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn registered_handler_is_invocable() {
        let registry = TaskRegistry::new();
        registry.register("echo", |input| async move { Ok(input) });

        let handler = registry.get("echo").unwrap();
        let output = handler(json!({"k": "v"})).await.unwrap();
        assert_eq!(output, json!({"k": "v"}));
    }

    #[tokio::test]
    async fn handler_errors_propagate() {
        let registry = TaskRegistry::new();
        registry.register("broken", |_| async {
            Err(TaskError::Failed("deliberate".to_string()))
        });

        let handler = registry.get("broken").unwrap();
        let err = handler(json!(null)).await.unwrap_err();
        assert!(err.to_string().contains("deliberate"));
    }

    #[test]
    fn unknown_name_returns_none() {
        let registry = TaskRegistry::new();
        assert!(registry.get("nope").is_none());
        assert!(!registry.contains("nope"));
        assert!(registry.is_empty());
    }

    #[test]
    fn re_registering_replaces() {
        let registry = TaskRegistry::new();
        registry.register("dup", |_| async { Ok(json!(1)) });
        registry.register("dup", |_| async { Ok(json!(2)) });
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn names_lists_all() {
        let registry = TaskRegistry::new();
        registry.register("a", |_| async { Ok(json!(null)) });
        registry.register("b", |_| async { Ok(json!(null)) });
        let mut names = registry.names();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }
}
