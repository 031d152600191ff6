//! Radix-tree request router.
//!
//! One matchit tree per HTTP method, O(path-length) lookup. The router is a
//! registry service: modules add their routes to it while the application
//! boots, after the registry itself has been built, so registration goes
//! through `&self`.

use std::collections::HashMap;
use std::sync::Arc;

use http::Method;
use matchit::Router as MatchitRouter;
use parking_lot::RwLock;
use thiserror::Error;

use crate::handler::{BoxedHandler, Handler};

/// Why a route could not be registered.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum RouteError {
    /// The path is malformed or conflicts with an existing route.
    #[error("invalid route `{method} {path}`: {source}")]
    Insert {
        method: Method,
        path: String,
        #[source]
        source: matchit::InsertError,
    },

    /// Another route already uses this name.
    #[error("route name `{name}` is already taken")]
    DuplicateName { name: String },
}

/// Outcome of matching a method and path.
pub(crate) enum Lookup {
    Found(BoxedHandler, HashMap<String, String>),
    /// The path exists, but not for this method.
    MethodNotAllowed,
    NotFound,
}

/// The application router.
///
/// Path parameters use `{name}` syntax, catch-alls `{*rest}`.
///
/// ```rust,no_run
/// # use fram::{Request, Response, Router};
/// # async fn index(_: Request) -> Response { Response::text("") }
/// # async fn show(_: Request) -> Response { Response::text("") }
/// let router = Router::new();
/// router.get("/posts", index)?
///       .named("posts.show", fram::Method::GET, "/posts/{slug}", show)?;
/// assert_eq!(router.path_for("posts.show", &[("slug", "hello")]).as_deref(), Some("/posts/hello"));
/// # Ok::<(), fram::RouteError>(())
/// ```
#[derive(Default)]
pub struct Router {
    routes: RwLock<HashMap<Method, MatchitRouter<BoxedHandler>>>,
    names: RwLock<HashMap<String, String>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for a method + path pair. Returns `self` for chaining.
    pub fn on(&self, method: Method, path: &str, handler: impl Handler) -> Result<&Self, RouteError> {
        self.routes
            .write()
            .entry(method.clone())
            .or_default()
            .insert(path, handler.into_boxed_handler())
            .map_err(|source| RouteError::Insert { method, path: path.to_owned(), source })?;
        Ok(self)
    }

    pub fn get(&self, path: &str, handler: impl Handler) -> Result<&Self, RouteError> {
        self.on(Method::GET, path, handler)
    }

    pub fn post(&self, path: &str, handler: impl Handler) -> Result<&Self, RouteError> {
        self.on(Method::POST, path, handler)
    }

    /// Registers a route under a name that templates and handlers can link to
    /// with [`Router::path_for`].
    pub fn named(
        &self,
        name: &str,
        method: Method,
        path: &str,
        handler: impl Handler,
    ) -> Result<&Self, RouteError> {
        let mut names = self.names.write();
        if names.contains_key(name) {
            return Err(RouteError::DuplicateName { name: name.to_owned() });
        }
        self.on(method, path, handler)?;
        names.insert(name.to_owned(), path.to_owned());
        Ok(self)
    }

    /// Builds the path of a named route, filling `{param}` segments from
    /// `params`. `None` when the name is unknown or a parameter is missing.
    pub fn path_for(&self, name: &str, params: &[(&str, &str)]) -> Option<String> {
        let names = self.names.read();
        let pattern = names.get(name)?;

        let mut out = String::with_capacity(pattern.len());
        let mut rest = pattern.as_str();
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let close = open + rest[open..].find('}')?;
            let key = rest[open + 1..close].trim_start_matches('*');
            let (_, value) = params.iter().find(|(k, _)| *k == key)?;
            out.push_str(value);
            rest = &rest[close + 1..];
        }
        out.push_str(rest);
        Some(out)
    }

    pub(crate) fn lookup(&self, method: &Method, path: &str) -> Lookup {
        let routes = self.routes.read();

        if let Some(matched) = routes.get(method).and_then(|tree| tree.at(path).ok()) {
            let handler = Arc::clone(matched.value);
            let params = matched.params.iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect();
            return Lookup::Found(handler, params);
        }

        let elsewhere = routes.iter()
            .any(|(m, tree)| m != method && tree.at(path).is_ok());
        if elsewhere { Lookup::MethodNotAllowed } else { Lookup::NotFound }
    }
}
