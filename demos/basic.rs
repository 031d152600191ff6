//! Minimal fram application: a blog module, built-in health checks, and a
//! small middleware stack.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/posts/hello
//!   curl -i http://localhost:3000/posts/
//!   curl -i http://localhost:3000/admin
//!   curl -i -H 'authorization: Bearer admin' http://localhost:3000/admin
//!   curl http://localhost:3000/healthz

use std::net::SocketAddr;
use std::sync::Arc;

use fram::middleware::{Middleware, Next, Trace, TrailingSlash};
use fram::{
    Application, BoxError, BoxFuture, ConfigSource, Definitions, Error, HealthModule, Module,
    Registry, Renderer, Request, Response, Router, Server, StatusCode, TemplateRenderer, keys,
};
use tracing_subscriber::EnvFilter;

const CONFIG: &str = r#"
[server]
addr = "0.0.0.0:3000"

[admin]
token = "admin"
"#;

struct Blog;

impl Module for Blog {
    fn definitions() -> Definitions {
        Definitions::new()
            .factory(keys::RENDERER, |_| {
                let renderer = TemplateRenderer::new();
                renderer
                    .add_template("post", "<h1>{{ slug }}</h1><a href=\"{{ path posts.index }}\">all posts</a>")
                    .add_template("index", "<h1>Posts</h1><a href=\"{{ path posts.show slug=hello }}\">hello</a>")
                    .add_template("errors/404", "<h1>Not here</h1>");
                Ok(Arc::new(renderer) as Arc<dyn Renderer>)
            })
            .middleware("admin.guard", |registry| {
                Ok(AdminGuard { token: registry.param("admin.token")? })
            })
    }

    fn init(registry: &Registry) -> Result<Self, BoxError> {
        let router: Arc<Router> = registry.get(keys::ROUTER)?;
        router
            .named("posts.index", fram::Method::GET, "/posts", index)?
            .named("posts.show", fram::Method::GET, "/posts/{slug}", show)?
            .get("/admin", admin)?;
        Ok(Blog)
    }
}

async fn index(req: Request) -> Response {
    render(&req, "index", &[])
}

async fn show(req: Request) -> Response {
    let slug = req.param("slug").unwrap_or_default().to_owned();
    render(&req, "post", &[("slug", slug.as_str())])
}

async fn admin(_req: Request) -> Response {
    Response::text("welcome back")
}

fn render(req: &Request, view: &str, vars: &[(&str, &str)]) -> Response {
    let rendered = req
        .extension::<Arc<dyn Renderer>>()
        .map(|renderer| renderer.render(view, vars));
    match rendered {
        Some(Ok(html)) => Response::html(html),
        _ => Response::status(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// Only lets `/admin` through with the configured bearer token.
struct AdminGuard {
    token: String,
}

impl Middleware for AdminGuard {
    fn process<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, Result<Response, Error>> {
        Box::pin(async move {
            let expected = format!("Bearer {}", self.token);
            if req.path().starts_with("/admin") && req.header("authorization") != Some(expected.as_str()) {
                return Ok(Response::status(StatusCode::UNAUTHORIZED));
            }
            next.handle(req).await
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut app = Application::new(ConfigSource::toml(CONFIG));
    app.add_module::<HealthModule>()?
        .add_module::<Blog>()?
        .pipe(Trace)?
        .pipe(TrailingSlash)?
        .pipe_service("admin.guard")?;

    let addr: SocketAddr = app.registry()?.param("server.addr")?;
    Server::bind(addr).serve(app).await
}
