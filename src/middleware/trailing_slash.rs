//! Canonical paths without a trailing slash.

use http::StatusCode;

use super::{Middleware, Next};
use crate::error::Error;
use crate::handler::BoxFuture;
use crate::request::Request;
use crate::response::Response;

/// Answers `/posts/` with a `301` to `/posts`, keeping the query string.
/// The root path `/` is left alone.
///
/// Leading slashes are collapsed so the location is always a path on this
/// host: `//evil.example/` redirects to `/evil.example`, never to a
/// protocol-relative URL.
pub struct TrailingSlash;

impl Middleware for TrailingSlash {
    fn process<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, Result<Response, Error>> {
        Box::pin(async move {
            let path = req.path();
            if path.len() > 1 && path.ends_with('/') {
                let trimmed = path.trim_matches('/');
                let mut location = format!("/{trimmed}");
                if let Some(query) = req.query() {
                    location.push('?');
                    location.push_str(query);
                }
                return Ok(Response::redirect(StatusCode::MOVED_PERMANENTLY, &location));
            }
            next.handle(req).await
        })
    }

    fn name(&self) -> &str {
        "trailing_slash"
    }
}
