//! HTTP server and graceful shutdown.
//!
//! On SIGTERM or Ctrl-C the server stops accepting, lets every in-flight
//! connection finish, and only then returns from [`Server::serve`].

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::application::Application;
use crate::error::{BoxError, Error, ResolveError};
use crate::request::Request;
use crate::response::Response;

/// Parameter holding the largest request body, in bytes, the server buffers.
pub const MAX_BODY_KEY: &str = "server.max_body";

/// Body limit when [`MAX_BODY_KEY`] is not configured: 2 MiB.
pub const DEFAULT_MAX_BODY: usize = 2 * 1024 * 1024;

/// The HTTP server.
pub struct Server {
    addr: SocketAddr,
}

impl Server {
    /// Configures the server to bind to `addr` when [`serve`](Server::serve)
    /// is called.
    pub fn bind(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Boots `app`, then accepts connections and runs every request through
    /// it.
    ///
    /// Returns only after a full graceful shutdown. Boot failures are
    /// returned before the listener is opened.
    ///
    /// Request bodies larger than the `server.max_body` parameter (default
    /// [`DEFAULT_MAX_BODY`]) are answered with `413 Payload Too Large`.
    pub async fn serve(self, app: Application) -> Result<(), Error> {
        app.boot()?;
        let max_body = body_limit(&app)?;
        let listener = TcpListener::bind(self.addr).await?;
        let app = Arc::new(app);

        info!(addr = %self.addr, max_body, "fram listening");

        let mut tasks = tokio::task::JoinSet::new();

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // Check shutdown first so a SIGTERM stops accepting at once,
                // even with connections queued.
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let app = Arc::clone(&app);
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        // Called once per request on the connection.
                        let svc = service_fn(move |req| {
                            let app = Arc::clone(&app);
                            async move { handle(app, req, remote_addr, max_body).await }
                        });

                        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                            .serve_connection(io, svc)
                            .await
                        {
                            error!(peer = %remote_addr, "connection error: {e}");
                        }
                    });
                }

                // Reap finished connection tasks so the set stays bounded.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        while tasks.join_next().await.is_some() {}

        info!("fram stopped");
        Ok(())
    }
}

/// Reads the body limit from the registry, falling back to the default.
fn body_limit(app: &Application) -> Result<usize, Error> {
    match app.registry()?.param::<usize>(MAX_BODY_KEY) {
        Ok(limit) => Ok(limit),
        Err(ResolveError::Unknown { .. }) => Ok(DEFAULT_MAX_BODY),
        Err(e) => Err(e.into()),
    }
}

/// Buffers the body, runs the application, converts back.
///
/// An error from the application is returned to hyper, which aborts the
/// connection: there is no default error page.
async fn handle(
    app: Arc<Application>,
    req: hyper::Request<hyper::body::Incoming>,
    remote_addr: SocketAddr,
    max_body: usize,
) -> Result<http::Response<Full<Bytes>>, Error> {
    let (parts, body) = req.into_parts();
    let Some(body) = buffer(body, max_body).await.map_err(|source| Error::Body { source })? else {
        debug!(peer = %remote_addr, path = parts.uri.path(), max_body, "request body too large");
        return Ok(Response::status(StatusCode::PAYLOAD_TOO_LARGE).into_inner());
    };
    let req = Request::from_http(http::Request::from_parts(parts, body)).with_extension(remote_addr);

    match app.run(req).await {
        Ok(res) => Ok(res.into_inner()),
        Err(e) => {
            error!(peer = %remote_addr, kind = e.as_label(), "unhandled error: {e}");
            Err(e)
        }
    }
}

/// Collects at most `limit` bytes. `None` when the body is larger.
async fn buffer<B>(body: B, limit: usize) -> Result<Option<Bytes>, BoxError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(Some(collected.to_bytes())),
        Err(e) if e.is::<LengthLimitError>() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Resolves on the first SIGTERM or SIGINT (Ctrl-C). On Windows only Ctrl-C
/// is available. A handler that cannot be installed never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
