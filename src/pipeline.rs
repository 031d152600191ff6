//! Middleware pipeline and its per-request traversal.
//!
//! # Traversal
//!
//! The pipeline is an append-only list of entries. A request walks it with a
//! [`Next`] value that carries the cursor:
//!
//! ```text
//! Next { cursor: i }.handle(req)
//!    i == len  →  terminal.handle(req)                  (dispatcher)
//!    i <  len  →  entry[i].process(req, Next { cursor: i + 1 })
//! ```
//!
//! The cursor moves *before* the entry runs, so an entry that continues the
//! chain reaches the next entry, never itself. `Next` is consumed by
//! `handle`, so each entry is entered at most once per request. The cursor
//! lives in the `Next` value, not in the pipeline: any number of requests can
//! walk the same pipeline at once.

use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::debug;

use crate::config::validate_key;
use crate::error::{Error, ResolveError};
use crate::handler::BoxFuture;
use crate::middleware::Middleware;
use crate::registry::Registry;
use crate::request::Request;
use crate::response::Response;

/// Anything that turns a request into a response.
///
/// Implemented by [`Application`](crate::Application), which always starts a
/// fresh walk of its pipeline, and by the [`Dispatcher`](crate::Dispatcher),
/// which ends it.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, req: Request) -> BoxFuture<'_, Result<Response, Error>>;
}

/// One pipeline position.
pub enum MiddlewareEntry {
    /// A ready-to-use handler.
    Resolved(Arc<dyn Middleware>),
    /// A registry key, resolved to an `Arc<dyn Middleware>` the first time a
    /// request reaches it.
    Deferred(String),
}

impl MiddlewareEntry {
    pub fn handler(middleware: impl Middleware) -> Self {
        Self::Resolved(Arc::new(middleware))
    }

    pub fn service(key: impl Into<String>) -> Self {
        Self::Deferred(key.into())
    }
}

impl fmt::Debug for MiddlewareEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolved(m) => f.debug_tuple("Resolved").field(&m.name()).finish(),
            Self::Deferred(key) => f.debug_tuple("Deferred").field(key).finish(),
        }
    }
}

struct Slot {
    entry: MiddlewareEntry,
    resolved: OnceCell<Arc<dyn Middleware>>,
}

impl Slot {
    fn resolve(&self, registry: &Registry) -> Result<&Arc<dyn Middleware>, ResolveError> {
        match &self.entry {
            MiddlewareEntry::Resolved(middleware) => Ok(middleware),
            MiddlewareEntry::Deferred(key) => self
                .resolved
                .get_or_try_init(|| registry.get_cloned::<Arc<dyn Middleware>>(key)),
        }
    }
}

/// Ordered middleware list. Entries are only ever appended.
#[derive(Default)]
pub struct Pipeline {
    slots: Vec<Slot>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidMiddleware`] when a deferred key could never name a
    /// service (empty, or containing whitespace or control characters).
    pub fn append(&mut self, entry: MiddlewareEntry) -> Result<&mut Self, Error> {
        if let MiddlewareEntry::Deferred(key) = &entry {
            validate_key(key).map_err(|_| Error::InvalidMiddleware {
                reason: format!("{key:?} is not a valid service key"),
            })?;
        }
        debug!(position = self.slots.len(), entry = ?entry, "middleware appended");
        self.slots.push(Slot { entry, resolved: OnceCell::new() });
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Starts a walk at the first entry. `terminal` answers once every entry
    /// has continued the chain.
    pub fn start<'a>(&'a self, registry: &'a Registry, terminal: &'a dyn RequestHandler) -> Next<'a> {
        Next { pipeline: self, registry, terminal, cursor: 0 }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.slots.iter().map(|s| &s.entry)).finish()
    }
}

/// The rest of the chain, as seen from one middleware.
pub struct Next<'a> {
    pipeline: &'a Pipeline,
    registry: &'a Registry,
    terminal: &'a dyn RequestHandler,
    cursor: usize,
}

impl<'a> Next<'a> {
    /// Runs the rest of the chain with `req`.
    ///
    /// # Errors
    ///
    /// [`Error::ServiceResolution`] when a deferred entry cannot be resolved,
    /// plus whatever the remaining entries or the terminal handler return.
    pub fn handle(self, req: Request) -> BoxFuture<'a, Result<Response, Error>> {
        Box::pin(async move {
            let Some(slot) = self.pipeline.slots.get(self.cursor) else {
                debug!(path = req.path(), "pipeline exhausted, dispatching");
                return self.terminal.handle(req).await;
            };

            let middleware = slot.resolve(self.registry)?;
            debug!(position = self.cursor, middleware = middleware.name(), "entering middleware");

            let next = Next { cursor: self.cursor + 1, ..self };
            middleware.process(req, next).await
        })
    }

    /// Entries left before the terminal handler.
    pub fn remaining(&self) -> usize {
        self.pipeline.len() - self.cursor
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use http::{Method, StatusCode};

    use super::*;
    use crate::registry::Definitions;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Terminal(Log);

    impl RequestHandler for Terminal {
        fn handle(&self, req: Request) -> BoxFuture<'_, Result<Response, Error>> {
            Box::pin(async move {
                self.0.lock().unwrap().push("dispatch".into());
                Ok(Response::text(req.path().to_owned()))
            })
        }
    }

    struct Layer {
        name: &'static str,
        log: Log,
    }

    impl Middleware for Layer {
        fn process<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, Result<Response, Error>> {
            Box::pin(async move {
                self.log.lock().unwrap().push(format!("in-{}", self.name));
                let res = next.handle(req).await?;
                self.log.lock().unwrap().push(format!("out-{}", self.name));
                Ok(res)
            })
        }
    }

    struct Deny;

    impl Middleware for Deny {
        fn process<'a>(&'a self, _req: Request, _next: Next<'a>) -> BoxFuture<'a, Result<Response, Error>> {
            Box::pin(async { Ok(Response::status(StatusCode::FORBIDDEN)) })
        }
    }

    struct Rewrite;

    impl Middleware for Rewrite {
        fn process<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, Result<Response, Error>> {
            Box::pin(async move { next.handle(req.with_path("/rewritten")).await })
        }
    }

    fn layer(name: &'static str, log: &Log) -> MiddlewareEntry {
        MiddlewareEntry::handler(Layer { name, log: Arc::clone(log) })
    }

    fn log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn onion_order() {
        let log = log();
        let mut pipeline = Pipeline::new();
        pipeline.append(layer("A", &log)).unwrap();
        pipeline.append(layer("B", &log)).unwrap();
        pipeline.append(layer("C", &log)).unwrap();

        let registry = Registry::builder().build();
        let terminal = Terminal(Arc::clone(&log));
        pipeline
            .start(&registry, &terminal)
            .handle(Request::new(Method::GET, "/"))
            .await
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            ["in-A", "in-B", "in-C", "dispatch", "out-C", "out-B", "out-A"]
        );
    }

    #[tokio::test]
    async fn empty_pipeline_dispatches_directly() {
        let log = log();
        let registry = Registry::builder().build();
        let terminal = Terminal(Arc::clone(&log));
        let res = Pipeline::new()
            .start(&registry, &terminal)
            .handle(Request::new(Method::GET, "/home"))
            .await
            .unwrap();

        assert_eq!(res.body(), b"/home");
        assert_eq!(*log.lock().unwrap(), ["dispatch"]);
    }

    #[tokio::test]
    async fn short_circuit_skips_the_rest() {
        let log = log();
        let mut pipeline = Pipeline::new();
        pipeline.append(layer("A", &log)).unwrap();
        pipeline.append(MiddlewareEntry::handler(Deny)).unwrap();
        pipeline.append(layer("C", &log)).unwrap();

        let registry = Registry::builder().build();
        let terminal = Terminal(Arc::clone(&log));
        let res = pipeline
            .start(&registry, &terminal)
            .handle(Request::new(Method::GET, "/"))
            .await
            .unwrap();

        assert_eq!(res.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(*log.lock().unwrap(), ["in-A", "out-A"]);
    }

    #[tokio::test]
    async fn downstream_sees_the_changed_request() {
        let log = log();
        let mut pipeline = Pipeline::new();
        pipeline.append(MiddlewareEntry::handler(Rewrite)).unwrap();

        let registry = Registry::builder().build();
        let terminal = Terminal(log);
        let res = pipeline
            .start(&registry, &terminal)
            .handle(Request::new(Method::GET, "/original"))
            .await
            .unwrap();

        assert_eq!(res.body(), b"/rewritten");
    }

    #[tokio::test]
    async fn deferred_entries_resolve_through_the_registry() {
        let log = log();
        let factory_log = Arc::clone(&log);
        let mut builder = Registry::builder();
        builder
            .add_definitions(Definitions::new().middleware("layer.x", move |_| {
                Ok(Layer { name: "X", log: Arc::clone(&factory_log) })
            }))
            .unwrap();
        let registry = builder.build();

        let mut pipeline = Pipeline::new();
        pipeline.append(MiddlewareEntry::service("layer.x")).unwrap();
        let terminal = Terminal(Arc::clone(&log));

        for _ in 0..2 {
            pipeline
                .start(&registry, &terminal)
                .handle(Request::new(Method::GET, "/"))
                .await
                .unwrap();
        }

        assert_eq!(log.lock().unwrap().len(), 6);
        assert!(pipeline.slots[0].resolved.get().is_some());
    }

    #[tokio::test]
    async fn unknown_deferred_key_fails_the_request() {
        let mut pipeline = Pipeline::new();
        pipeline.append(MiddlewareEntry::service("missing")).unwrap();

        let registry = Registry::builder().build();
        let terminal = Terminal(log());
        let err = pipeline
            .start(&registry, &terminal)
            .handle(Request::new(Method::GET, "/"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ServiceResolution(ResolveError::Unknown { .. })));
    }

    #[tokio::test]
    async fn deferred_key_of_the_wrong_type_fails_the_request() {
        let mut builder = Registry::builder();
        builder.add_definitions(Definitions::new().parameter("not.middleware", 3)).unwrap();
        let registry = builder.build();

        let mut pipeline = Pipeline::new();
        pipeline.append(MiddlewareEntry::service("not.middleware")).unwrap();
        let terminal = Terminal(log());
        let err = pipeline
            .start(&registry, &terminal)
            .handle(Request::new(Method::GET, "/"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ServiceResolution(ResolveError::TypeMismatch { .. })));
    }

    #[test]
    fn malformed_keys_are_rejected_at_append() {
        let mut pipeline = Pipeline::new();
        for key in ["", "two words", "tab\there"] {
            let err = pipeline.append(MiddlewareEntry::service(key)).map(|_| ()).unwrap_err();
            assert!(matches!(err, Error::InvalidMiddleware { .. }));
        }
        assert!(pipeline.is_empty());
    }

    #[test]
    fn remaining_counts_down() {
        let log = log();
        let mut pipeline = Pipeline::new();
        pipeline.append(layer("A", &log)).unwrap();
        pipeline.append(layer("B", &log)).unwrap();

        let registry = Registry::builder().build();
        let terminal = Terminal(log);
        assert_eq!(pipeline.start(&registry, &terminal).remaining(), 2);
    }
}
