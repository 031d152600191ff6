//! # fram
//!
//! The request-handling kernel of a small web application runtime.
//!
//! A request goes through three things, in this order:
//!
//! - a **service registry**, built once from a base configuration and the
//!   definitions each module contributes
//! - **modules**, each built once with the registry to do its setup, such
//!   as registering routes
//! - a **middleware pipeline**, walked once per request, ending in a
//!   **dispatcher** that matches the route and calls its handler
//!
//! ```text
//! run(req) ─► boot (once) ─► mw[0] ─► mw[1] ─► … ─► dispatcher ─► handler
//!                              ◄──────◄───────◄──────── response
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use fram::middleware::Trace;
//! use fram::{Application, BoxError, ConfigSource, Module, Registry, Request, Response, Router, keys};
//!
//! struct Blog;
//!
//! impl Module for Blog {
//!     fn init(registry: &Registry) -> Result<Self, BoxError> {
//!         let router: Arc<Router> = registry.get(keys::ROUTER)?;
//!         router.get("/posts/{slug}", show)?;
//!         Ok(Blog)
//!     }
//! }
//!
//! async fn show(req: Request) -> Response {
//!     Response::text(format!("post {}", req.param("slug").unwrap_or("?")))
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), fram::Error> {
//!     let mut app = Application::new(ConfigSource::toml("[server]\naddr = \"0.0.0.0:3000\""));
//!     app.add_module::<Blog>()?.pipe(Trace)?;
//!
//!     let addr = app.registry()?.param("server.addr")?;
//!     fram::Server::bind(addr).serve(app).await
//! }
//! ```

mod application;
mod config;
mod dispatcher;
mod error;
mod handler;
mod health;
mod module;
mod pipeline;
mod registry;
mod renderer;
mod request;
mod response;
mod router;
mod server;

pub mod middleware;

pub use application::Application;
pub use config::ConfigSource;
pub use dispatcher::{Dispatcher, NOT_FOUND_VIEW};
pub use error::{BoxError, ConfigError, Error, ResolveError};
pub use handler::{BoxFuture, Handler};
pub use health::HealthModule;
pub use http::{Method, StatusCode};
pub use module::Module;
pub use pipeline::{Pipeline, RequestHandler};
pub use registry::{Definitions, Registry, RegistryBuilder, Service, keys};
pub use renderer::{Global, RenderError, Renderer, TemplateRenderer};
pub use request::{Request, RequestBuilder};
pub use response::{ContentType, IntoResponse, Response, ResponseBuilder};
pub use router::{RouteError, Router};
pub use server::Server;
