//! Middleware layer.
//!
//! Middleware intercepts requests and responses and is the right place for
//! cross-cutting concerns: structured tracing, redirects, authentication.
//!
//! A middleware receives the request and [`Next`], the rest of the chain. It
//! either answers on its own, skipping everything after it, or hands a
//! (possibly changed) request to `next.handle(req)` and works on the
//! response that comes back:
//!
//! ```rust
//! use fram::middleware::{Middleware, Next};
//! use fram::{BoxFuture, Error, Request, Response};
//!
//! struct PoweredBy;
//!
//! impl Middleware for PoweredBy {
//!     fn process<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, Result<Response, Error>> {
//!         Box::pin(async move {
//!             let res = next.handle(req).await?;
//!             Ok(res.with_header("x-powered-by", "fram"))
//!         })
//!     }
//! }
//! ```
//!
//! Code before `next.handle` runs outside-in, in registration order; code
//! after it runs inside-out.
//!
//! Built-in middleware:
//! - [`Trace`]: one log line per request with method, path, status, latency
//! - [`TrailingSlash`]: permanent redirect from `/posts/` to `/posts`

mod trace;
mod trailing_slash;

pub use crate::pipeline::{MiddlewareEntry, Next};
pub use trace::Trace;
pub use trailing_slash::TrailingSlash;

use crate::error::Error;
use crate::handler::BoxFuture;
use crate::request::Request;
use crate::response::Response;

/// A request handler that receives the rest of the chain.
pub trait Middleware: Send + Sync + 'static {
    fn process<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, Result<Response, Error>>;

    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}
