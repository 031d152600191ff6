//! Terminal request handler.
//!
//! Once every middleware has passed the request on, the dispatcher matches
//! it against the router and calls the route handler. Handlers reach shared
//! services through request extensions:
//!
//! ```rust,ignore
//! async fn show(req: Request) -> Response {
//!     let renderer = req.extension::<Arc<dyn Renderer>>().unwrap();
//!     let registry = req.extension::<Registry>().unwrap();
//!     …
//! }
//! ```

use std::sync::Arc;

use http::StatusCode;
use tracing::debug;

use crate::error::Error;
use crate::handler::BoxFuture;
use crate::pipeline::RequestHandler;
use crate::registry::Registry;
use crate::renderer::{RenderError, Renderer};
use crate::request::Request;
use crate::response::{ContentType, Response};
use crate::router::{Lookup, Router};

/// View rendered for unmatched paths, when the renderer has one.
pub const NOT_FOUND_VIEW: &str = "errors/404";

/// Routes requests to handlers.
pub struct Dispatcher {
    registry: Registry,
    router: Arc<Router>,
    renderer: Arc<dyn Renderer>,
}

impl Dispatcher {
    pub fn new(registry: Registry, router: Arc<Router>, renderer: Arc<dyn Renderer>) -> Self {
        Self { registry, router, renderer }
    }

    /// Matches `req` and runs its handler.
    ///
    /// An unmatched path answers `404`, rendered from [`NOT_FOUND_VIEW`] when
    /// that view exists; a path registered only under other methods answers
    /// `405`.
    pub async fn dispatch(&self, mut req: Request) -> Result<Response, Error> {
        match self.router.lookup(req.method(), req.path()) {
            Lookup::Found(handler, params) => {
                req.set_params(params);
                let extensions = req.extensions_mut();
                extensions.insert(self.registry.clone());
                extensions.insert(Arc::clone(&self.router));
                extensions.insert(Arc::clone(&self.renderer));
                Ok(handler.call(req).await)
            }
            Lookup::MethodNotAllowed => {
                debug!(method = %req.method(), path = req.path(), "method not allowed");
                Ok(Response::status(StatusCode::METHOD_NOT_ALLOWED))
            }
            Lookup::NotFound => {
                debug!(method = %req.method(), path = req.path(), "no route");
                self.not_found()
            }
        }
    }

    fn not_found(&self) -> Result<Response, Error> {
        match self.renderer.render(NOT_FOUND_VIEW, &[]) {
            Ok(html) => Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .bytes(ContentType::Html, html.into_bytes())),
            Err(RenderError::UnknownView(_)) => Ok(Response::status(StatusCode::NOT_FOUND)),
            Err(e) => Err(e.into()),
        }
    }
}

impl RequestHandler for Dispatcher {
    fn handle(&self, req: Request) -> BoxFuture<'_, Result<Response, Error>> {
        Box::pin(self.dispatch(req))
    }
}
