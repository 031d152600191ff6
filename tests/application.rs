use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use fram::middleware::{Middleware, Next};
use fram::{
    Application, BoxError, BoxFuture, ConfigError, ConfigSource, Definitions, Error, Method,
    Module, Registry, Request, ResolveError, Response, Router, StatusCode, keys,
};

type Log = Arc<Mutex<Vec<String>>>;

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
            Ok(res.with_header("x-layer", self.name))
        })
    }
}

struct Gate {
    log: Log,
}

impl Middleware for Gate {
    fn process<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, Result<Response, Error>> {
        Box::pin(async move {
            self.log.lock().unwrap().push("gate".into());
            if req.header("authorization").is_none() {
                return Ok(Response::status(StatusCode::UNAUTHORIZED));
            }
            next.handle(req).await
        })
    }
}

fn layer(name: &'static str, log: &Log) -> Layer {
    Layer { name, log: Arc::clone(log) }
}

fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn app_with_route() -> Application {
    let mut app = Application::new(ConfigSource::Empty);
    app.add_module::<Routes>().unwrap();
    app
}

struct Routes;

impl Module for Routes {
    fn init(registry: &Registry) -> Result<Self, BoxError> {
        let router: Arc<Router> = registry.get(keys::ROUTER)?;
        router.get("/", |_req: Request| async { Response::text("home") })?;
        Ok(Routes)
    }
}

#[tokio::test]
async fn pass_through_pipeline_reaches_the_dispatcher() {
    let log = log();
    let mut app = app_with_route();
    app.pipe(layer("A", &log)).unwrap()
        .pipe(layer("B", &log)).unwrap()
        .pipe(layer("C", &log)).unwrap();

    let res = app.run(Request::new(Method::GET, "/")).await.unwrap();

    assert_eq!(res.body(), b"home");
    assert_eq!(
        *log.lock().unwrap(),
        ["in-A", "in-B", "in-C", "out-C", "out-B", "out-A"]
    );
    let layers: Vec<&str> = res.headers().iter()
        .filter(|(k, _)| k == "x-layer")
        .map(|(_, v)| v.as_str())
        .collect();
    assert_eq!(layers, ["C", "B", "A"]);
}

#[tokio::test]
async fn empty_pipeline_dispatches_on_first_run() {
    let app = app_with_route();
    let res = app.run(Request::new(Method::GET, "/")).await.unwrap();
    assert_eq!(res.body(), b"home");

    let res = app.run(Request::new(Method::GET, "/nowhere")).await.unwrap();
    assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn short_circuit_skips_later_middleware_and_dispatch() {
    let log = log();
    let mut app = app_with_route();
    app.pipe(layer("A", &log)).unwrap()
        .pipe(Gate { log: Arc::clone(&log) }).unwrap()
        .pipe(layer("C", &log)).unwrap();

    let res = app.run(Request::new(Method::GET, "/")).await.unwrap();
    assert_eq!(res.status_code(), StatusCode::UNAUTHORIZED);
    assert_eq!(*log.lock().unwrap(), ["in-A", "gate", "out-A"]);

    log.lock().unwrap().clear();
    let req = Request::builder().uri("/").header("authorization", "Bearer t").build();
    let res = app.run(req).await.unwrap();
    assert_eq!(res.body(), b"home");
    assert_eq!(*log.lock().unwrap(), ["in-A", "gate", "in-C", "out-C", "out-A"]);
}

// ── Modules ───────────────────────────────────────────────────────────────────

static FIRST_INITS: AtomicUsize = AtomicUsize::new(0);

struct First;

impl Module for First {
    fn definitions() -> Definitions {
        Definitions::new().parameter("x", "first").parameter("only.first", true)
    }

    fn init(registry: &Registry) -> Result<Self, BoxError> {
        FIRST_INITS.fetch_add(1, Ordering::SeqCst);
        let router: Arc<Router> = registry.get(keys::ROUTER)?;
        router.named("first", Method::GET, "/first", |_req: Request| async { "first" })?;
        Ok(First)
    }
}

struct Second;

impl Module for Second {
    fn definitions() -> Definitions {
        Definitions::new().parameter("x", "second")
    }

    fn init(registry: &Registry) -> Result<Self, BoxError> {
        // Sees what First left behind.
        let router: Arc<Router> = registry.get(keys::ROUTER)?;
        let first = router.path_for("first", &[]).ok_or("first module did not run")?;
        router.get("/second", move |_req: Request| {
            let first = first.clone();
            async move { format!("after {first}") }
        })?;
        Ok(Second)
    }
}

#[tokio::test]
async fn later_modules_win_and_see_earlier_setup() {
    let mut app = Application::new(ConfigSource::toml("x = \"config\""));
    app.add_module::<First>().unwrap().add_module::<Second>().unwrap();

    let registry = app.registry().unwrap();
    assert_eq!(registry.param::<String>("x").unwrap(), "second");
    assert!(registry.param::<bool>("only.first").unwrap());

    let before = FIRST_INITS.load(Ordering::SeqCst);
    for _ in 0..3 {
        let res = app.run(Request::new(Method::GET, "/second")).await.unwrap();
        assert_eq!(res.body(), b"after /first");
    }
    assert_eq!(FIRST_INITS.load(Ordering::SeqCst), before + 1);
    assert!(Registry::ptr_eq(registry, app.registry().unwrap()));
}

#[test]
fn duplicate_module_is_a_configuration_error() {
    let mut app = Application::new(ConfigSource::Empty);
    app.add_module::<Second>().unwrap();
    let err = app.add_module::<Second>().map(|_| ()).unwrap_err();
    assert!(matches!(err, Error::Configuration(ConfigError::DuplicateModule { .. })));
}

struct NeedsDatabase;

impl Module for NeedsDatabase {
    fn init(registry: &Registry) -> Result<Self, BoxError> {
        let _: String = registry.param("database.url")?;
        Ok(NeedsDatabase)
    }
}

#[tokio::test]
async fn failing_module_aborts_the_run() {
    let log = log();
    let mut app = Application::new(ConfigSource::Empty);
    app.add_module::<NeedsDatabase>().unwrap().pipe(layer("A", &log)).unwrap();

    let err = app.run(Request::new(Method::GET, "/")).await.unwrap_err();
    match err {
        Error::ModuleInit { module, source: ResolveError::Factory { .. } } => {
            assert!(module.ends_with("NeedsDatabase"));
        }
        other => panic!("expected module init error, got {other}"),
    }
    assert!(log.lock().unwrap().is_empty());
}

struct Malformed;

impl Module for Malformed {
    fn definitions() -> Definitions {
        Definitions::new().parameter("page size", 10)
    }

    fn init(_: &Registry) -> Result<Self, BoxError> {
        Ok(Malformed)
    }
}

#[tokio::test]
async fn malformed_module_definitions_fail_the_bootstrap() {
    let log = log();
    let mut app = app_with_route();
    app.add_module::<Malformed>().unwrap().pipe(layer("A", &log)).unwrap();

    for _ in 0..2 {
        let err = app.run(Request::new(Method::GET, "/")).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(ConfigError::InvalidKey { key }) if key == "page size"));
    }
    assert!(log.lock().unwrap().is_empty());

    // Nothing was cached, so assembly is still open.
    app.pipe_service("audit").unwrap();
}

#[tokio::test]
async fn unreadable_config_is_fatal() {
    let app = Application::new(ConfigSource::file("/nonexistent/fram/config.toml"));
    let err = app.run(Request::new(Method::GET, "/")).await.unwrap_err();
    assert!(matches!(err, Error::Configuration(ConfigError::ReadFile { .. })));
}

#[tokio::test]
async fn config_file_parameters_reach_the_registry() {
    let path = std::env::temp_dir().join(format!("fram-config-{}.toml", std::process::id()));
    std::fs::write(&path, "[app]\nname = \"blog\"\nposts_per_page = 10\n").unwrap();

    let app = Application::new(ConfigSource::file(&path));
    let registry = app.registry().unwrap();
    assert_eq!(registry.param::<String>("app.name").unwrap(), "blog");
    assert_eq!(registry.param::<u32>("app.posts_per_page").unwrap(), 10);

    std::fs::remove_file(path).unwrap();
}

// ── Deferred middleware ───────────────────────────────────────────────────────

static AUDIT_BUILDS: AtomicUsize = AtomicUsize::new(0);

struct Audit;

impl Middleware for Audit {
    fn process<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, Result<Response, Error>> {
        Box::pin(async move {
            let res = next.handle(req).await?;
            Ok(res.with_header("x-audited", "yes"))
        })
    }
}

struct AuditModule;

impl Module for AuditModule {
    fn definitions() -> Definitions {
        Definitions::new().middleware("audit", |_| {
            AUDIT_BUILDS.fetch_add(1, Ordering::SeqCst);
            Ok(Audit)
        })
    }

    fn init(_: &Registry) -> Result<Self, BoxError> {
        Ok(AuditModule)
    }
}

#[tokio::test]
async fn deferred_middleware_is_resolved_once() {
    let mut app = app_with_route();
    app.add_module::<AuditModule>().unwrap().pipe_service("audit").unwrap();

    let before = AUDIT_BUILDS.load(Ordering::SeqCst);
    for _ in 0..3 {
        let res = app.run(Request::new(Method::GET, "/")).await.unwrap();
        assert_eq!(res.header("x-audited"), Some("yes"));
    }
    assert_eq!(AUDIT_BUILDS.load(Ordering::SeqCst), before + 1);
}

#[tokio::test]
async fn unresolvable_middleware_fails_the_request() {
    let mut app = app_with_route();
    app.pipe_service("csrf").unwrap();

    let err = app.run(Request::new(Method::GET, "/")).await.unwrap_err();
    assert!(matches!(err, Error::ServiceResolution(ResolveError::Unknown { key }) if key == "csrf"));
}

#[test]
fn invalid_middleware_is_rejected_at_assembly() {
    let mut app = Application::new(ConfigSource::Empty);
    let err = app.pipe_service("not a key").map(|_| ()).unwrap_err();
    assert!(matches!(err, Error::InvalidMiddleware { .. }));
}

// ── Concurrency ───────────────────────────────────────────────────────────────

struct Slow;

impl Middleware for Slow {
    fn process<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, Result<Response, Error>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            next.handle(req).await
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_walk_independently() {
    let log = log();
    let mut app = app_with_route();
    app.pipe(Slow).unwrap().pipe(layer("A", &log)).unwrap().pipe(Slow).unwrap();
    let app = Arc::new(app);

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..32 {
        let app = Arc::clone(&app);
        tasks.spawn(async move { app.run(Request::new(Method::GET, "/")).await });
    }
    while let Some(res) = tasks.join_next().await {
        assert_eq!(res.unwrap().unwrap().body(), b"home");
    }

    let log = log.lock().unwrap();
    assert_eq!(log.iter().filter(|e| *e == "in-A").count(), 32);
    assert_eq!(log.iter().filter(|e| *e == "out-A").count(), 32);
}
