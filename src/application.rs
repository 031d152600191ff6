//! The application: modules, middleware, and the entry point tying them to
//! the registry and the dispatcher.
//!
//! # Lifecycle
//!
//! ```text
//! assembly      add_module / pipe / pipe_service        (&mut self)
//!    ↓
//! boot          registry built → modules initialized →  (once, &self)
//!               router + renderer wired into a Dispatcher
//!    ↓
//! requests      run(req) → pipeline walk → dispatcher    (&self, concurrent)
//! ```
//!
//! Boot happens on the first call to [`Application::boot`] or
//! [`Application::run`] and never again. Assembly after the registry exists
//! is rejected with [`ConfigError::LateRegistration`].

use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{debug, info};

use crate::config::ConfigSource;
use crate::dispatcher::Dispatcher;
use crate::error::{ConfigError, Error};
use crate::handler::BoxFuture;
use crate::middleware::Middleware;
use crate::module::{Module, ModuleSet};
use crate::pipeline::{MiddlewareEntry, Pipeline, RequestHandler};
use crate::registry::{Definitions, Registry, keys};
use crate::renderer::{Renderer, TemplateRenderer};
use crate::request::Request;
use crate::response::Response;
use crate::router::Router;

/// A web application.
///
/// ```rust,no_run
/// use fram::{Application, ConfigSource, HealthModule, Server};
/// use fram::middleware::{Trace, TrailingSlash};
///
/// # async fn run() -> Result<(), fram::Error> {
/// let mut app = Application::new(ConfigSource::file("config.toml"));
/// app.add_module::<HealthModule>()?
///    .pipe(Trace)?
///    .pipe(TrailingSlash)?;
///
/// let addr = app.registry()?.param("server.addr")?;
/// Server::bind(addr).serve(app).await
/// # }
/// ```
pub struct Application {
    config: ConfigSource,
    modules: ModuleSet,
    pipeline: Pipeline,
    registry: OnceCell<Registry>,
    dispatcher: OnceCell<Dispatcher>,
}

impl Application {
    pub fn new(config: ConfigSource) -> Self {
        Self {
            config,
            modules: ModuleSet::default(),
            pipeline: Pipeline::new(),
            registry: OnceCell::new(),
            dispatcher: OnceCell::new(),
        }
    }

    /// Registers a module. Modules are initialized in registration order and
    /// later modules' definitions replace earlier ones.
    pub fn add_module<M: Module>(&mut self) -> Result<&mut Self, Error> {
        self.assembling("add a module")?;
        self.modules.add::<M>()?;
        Ok(self)
    }

    /// Appends a middleware instance.
    pub fn pipe(&mut self, middleware: impl Middleware) -> Result<&mut Self, Error> {
        self.append(MiddlewareEntry::handler(middleware))
    }

    /// Appends a middleware resolved from the registry by `key` when the
    /// first request reaches it.
    pub fn pipe_service(&mut self, key: impl Into<String>) -> Result<&mut Self, Error> {
        self.append(MiddlewareEntry::service(key))
    }

    pub fn append(&mut self, entry: MiddlewareEntry) -> Result<&mut Self, Error> {
        self.assembling("pipe middleware")?;
        self.pipeline.append(entry)?;
        Ok(self)
    }

    fn assembling(&self, what: &'static str) -> Result<(), ConfigError> {
        match self.registry.get() {
            Some(_) => Err(ConfigError::LateRegistration { what }),
            None => Ok(()),
        }
    }

    /// Returns the service registry, building it on first call.
    ///
    /// Definitions are merged in this order, later keys winning: framework
    /// defaults ([`keys::ROUTER`], [`keys::RENDERER`]), the base
    /// configuration, then each module's definitions in registration order.
    /// A failed build caches nothing.
    pub fn registry(&self) -> Result<&Registry, Error> {
        self.registry.get_or_try_init(|| -> Result<Registry, Error> {
            let mut builder = Registry::builder();
            builder.add_definitions(framework_defaults())?;
            builder.add_parameters(self.config.load()?)?;
            self.modules.contribute(&mut builder)?;

            let registry = builder.build();
            info!(services = registry.len(), modules = self.modules.len(), "registry built");
            Ok(registry)
        })
    }

    /// Builds the registry, initializes every module and wires the
    /// dispatcher. Idempotent; the server calls it before accepting
    /// connections so that a broken setup fails at startup.
    pub fn boot(&self) -> Result<(), Error> {
        self.dispatcher().map(|_| ())
    }

    fn dispatcher(&self) -> Result<&Dispatcher, Error> {
        self.dispatcher.get_or_try_init(|| -> Result<Dispatcher, Error> {
            let registry = self.registry()?;
            self.modules.initialize(registry)?;

            let router: Arc<Router> = registry.get(keys::ROUTER)?;
            let renderer: Arc<dyn Renderer> = registry.get_cloned(keys::RENDERER)?;
            renderer.add_global("router", router.clone());
            renderer.add_global("registry", Arc::new(registry.clone()));

            info!(middleware = self.pipeline.len(), "application booted");
            Ok(Dispatcher::new(registry.clone(), router, renderer))
        })
    }

    /// Handles one request: boots if needed, then walks the pipeline from
    /// its first entry and ends in the dispatcher.
    ///
    /// # Errors
    ///
    /// Boot failures ([`Error::Configuration`], [`Error::ModuleInit`],
    /// [`Error::ServiceResolution`]) and anything the pipeline returns. No
    /// error is turned into a response here.
    pub async fn run(&self, req: Request) -> Result<Response, Error> {
        let dispatcher = self.dispatcher()?;
        let registry = self.registry()?;
        debug!(method = %req.method(), path = req.path(), "handling request");
        self.pipeline.start(registry, dispatcher).handle(req).await
    }
}

impl RequestHandler for Application {
    fn handle(&self, req: Request) -> BoxFuture<'_, Result<Response, Error>> {
        Box::pin(self.run(req))
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("config", &self.config)
            .field("modules", &self.modules.len())
            .field("pipeline", &self.pipeline)
            .field("booted", &self.dispatcher.get().is_some())
            .finish()
    }
}

fn framework_defaults() -> Definitions {
    Definitions::new()
        .factory(keys::ROUTER, |_| Ok(Router::new()))
        .factory(keys::RENDERER, |_| {
            Ok(Arc::new(TemplateRenderer::new()) as Arc<dyn Renderer>)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_built_once() {
        let app = Application::new(ConfigSource::toml("name = \"blog\""));
        let a = app.registry().unwrap();
        let b = app.registry().unwrap();
        assert!(Registry::ptr_eq(a, b));
        assert!(a.contains(keys::ROUTER));
        assert!(a.contains(keys::RENDERER));
        assert_eq!(a.param::<String>("name").unwrap(), "blog");
    }

    #[test]
    fn bad_config_caches_nothing() {
        let app = Application::new(ConfigSource::toml("name = "));
        assert!(matches!(app.registry(), Err(Error::Configuration(ConfigError::Parse { .. }))));
        assert!(app.registry.get().is_none());
    }

    #[test]
    fn renderer_gets_router_and_registry_globals() {
        let app = Application::new(ConfigSource::Empty);
        app.boot().unwrap();

        let registry = app.registry().unwrap();
        let renderer: Arc<dyn Renderer> = registry.get_cloned(keys::RENDERER).unwrap();
        let router: Arc<Router> = registry.get(keys::ROUTER).unwrap();

        let global = renderer.global("router").unwrap().downcast::<Router>().unwrap();
        assert!(Arc::ptr_eq(&global, &router));
        let global = renderer.global("registry").unwrap().downcast::<Registry>().unwrap();
        assert!(Registry::ptr_eq(&global, registry));
    }

    #[test]
    fn late_registration_is_rejected() {
        let mut app = Application::new(ConfigSource::Empty);
        app.registry().unwrap();

        let err = app.pipe_service("auth").map(|_| ()).unwrap_err();
        assert!(matches!(err, Error::Configuration(ConfigError::LateRegistration { .. })));
        let err = app.add_module::<crate::HealthModule>().map(|_| ()).unwrap_err();
        assert!(matches!(err, Error::Configuration(ConfigError::LateRegistration { .. })));
    }
}
