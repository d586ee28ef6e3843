//! Method name to handler table consumed by the router.
//!
//! Handlers are plain closures so that each one can capture exactly the
//! state it needs (see [`crate::methods`]). The same table also carries the
//! teardown hooks of handlers that own background threads.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::dispatch::WorkItem;
use crate::protocol::{ErrorCode, RequestId, Response};
use crate::router::{Router, Work};

/// Result of a request handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Send the response as left by the handler (`result: null` if unset).
    Success,
    /// The handler took the response with [`Response::take`] and will send
    /// it itself. The router sends nothing.
    Async,
    /// Reply with this error.
    Error(ErrorCode),
}

pub type RequestHandler = Arc<dyn Fn(&Call<'_>, &mut Response) -> Outcome + Send + Sync>;
pub type NotificationHandler = Arc<dyn Fn(&Call<'_>) + Send + Sync>;

type TeardownHook = Box<dyn FnOnce() + Send>;

#[derive(Clone)]
pub enum Handler {
    Request(RequestHandler),
    Notification(NotificationHandler),
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Request(_) => f.write_str("Handler::Request"),
            Handler::Notification(_) => f.write_str("Handler::Notification"),
        }
    }
}

/// Registered methods plus their teardown hooks.
#[derive(Default)]
pub struct MethodRegistry {
    handlers: HashMap<String, Handler>,
    teardown: Mutex<Vec<(String, TeardownHook)>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request handler, replacing any previous entry.
    pub fn request<F>(&mut self, method: &str, handler: F) -> &mut Self
    where
        F: Fn(&Call<'_>, &mut Response) -> Outcome + Send + Sync + 'static,
    {
        self.handlers
            .insert(method.to_string(), Handler::Request(Arc::new(handler)));
        self
    }

    /// Register a notification handler, replacing any previous entry.
    pub fn notification<F>(&mut self, method: &str, handler: F) -> &mut Self
    where
        F: Fn(&Call<'_>) + Send + Sync + 'static,
    {
        self.handlers
            .insert(method.to_string(), Handler::Notification(Arc::new(handler)));
        self
    }

    /// Attach a hook run once when the engine tears down.
    pub fn on_teardown<F>(&mut self, method: &str, hook: F) -> &mut Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.teardown
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .push((method.to_string(), Box::new(hook)));
        self
    }

    pub fn lookup(&self, method: &str) -> Option<&Handler> {
        self.handlers.get(method)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run every teardown hook. Hooks run at most once.
    pub fn run_teardown(&self) {
        let hooks = std::mem::take(&mut *self.teardown.lock().unwrap_or_else(PoisonError::into_inner));
        for (method, hook) in hooks {
            debug!("Running teardown hook for {}", method);
            hook();
        }
    }
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<_> = self.handlers.keys().collect();
        methods.sort();
        f.debug_struct("MethodRegistry").field("methods", &methods).finish()
    }
}

/// Everything a handler can see about the message it is running for.
pub struct Call<'a> {
    router: &'a Arc<Router>,
    item: &'a WorkItem<Work>,
}

impl<'a> Call<'a> {
    pub(crate) fn new(router: &'a Arc<Router>, item: &'a WorkItem<Work>) -> Self {
        Self { router, item }
    }

    pub fn router(&self) -> &Arc<Router> {
        self.router
    }

    /// Method name, or the task name for internal tasks.
    pub fn method(&self) -> &str {
        self.item.payload().name()
    }

    pub fn id(&self) -> Option<&RequestId> {
        self.item.payload().request_id()
    }

    pub fn params(&self) -> Option<&Value> {
        self.item.payload().params()
    }

    /// Deserialize the params, treating absent params as `null`.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(self.params().unwrap_or(&Value::Null))
    }

    /// Cooperative cancellation flag. Long-running handlers should poll it.
    pub fn is_cancelled(&self) -> bool {
        self.item.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_lookup_distinguishes_kinds() {
        let mut registry = MethodRegistry::new();
        registry
            .request("shutdown", |_, _| Outcome::Success)
            .notification("exit", |_| {});

        assert!(matches!(registry.lookup("shutdown"), Some(Handler::Request(_))));
        assert!(matches!(registry.lookup("exit"), Some(Handler::Notification(_))));
        assert!(registry.lookup("missing").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_later_registration_replaces() {
        let mut registry = MethodRegistry::new();
        registry
            .request("m", |_, _| Outcome::Success)
            .notification("m", |_| {});

        assert!(matches!(registry.lookup("m"), Some(Handler::Notification(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_teardown_hooks_run_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut registry = MethodRegistry::new();

        for name in ["a", "b"] {
            let counter = Arc::clone(&counter);
            registry.on_teardown(name, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        registry.run_teardown();
        registry.run_teardown();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_debug_lists_sorted_methods() {
        let mut registry = MethodRegistry::new();
        registry
            .notification("initialized", |_| {})
            .request("initialize", |_, _| Outcome::Success);

        assert_eq!(
            format!("{:?}", registry),
            r#"MethodRegistry { methods: ["initialize", "initialized"] }"#
        );
    }
}
