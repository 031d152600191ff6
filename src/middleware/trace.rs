//! Per-request log line.

use std::time::Instant;

use tracing::{error, info};

use super::{Middleware, Next};
use crate::error::Error;
use crate::handler::BoxFuture;
use crate::request::Request;
use crate::response::Response;

/// Logs method, path, status and latency once the rest of the chain answers.
///
/// Pipe it first so its latency covers every other middleware.
pub struct Trace;

impl Middleware for Trace {
    fn process<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, Result<Response, Error>> {
        Box::pin(async move {
            let method = req.method().clone();
            let path = req.path().to_owned();
            let started = Instant::now();

            let result = next.handle(req).await;
            let elapsed_us = started.elapsed().as_micros() as u64;
            match &result {
                Ok(res) => info!(
                    %method,
                    %path,
                    status = res.status_code().as_u16(),
                    elapsed_us,
                    "request"
                ),
                Err(e) => error!(%method, %path, kind = e.as_label(), elapsed_us, "request failed: {e}"),
            }
            result
        })
    }

    fn name(&self) -> &str {
        "trace"
    }
}
