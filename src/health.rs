//! Built-in health-check module.
//!
//! | Probe | Path | Question |
//! |---|---|---|
//! | **Liveness** | `/healthz` | Is the process alive? |
//! | **Readiness** | `/readyz` | Has the application booted? |
//!
//! ```rust,no_run
//! use fram::{Application, ConfigSource, HealthModule};
//!
//! let mut app = Application::new(ConfigSource::Empty);
//! app.add_module::<HealthModule>().unwrap();
//! ```
//!
//! The paths can be moved with the `health.liveness` and `health.readiness`
//! parameters.

use std::sync::Arc;

use crate::error::BoxError;
use crate::module::Module;
use crate::registry::{Definitions, Registry, keys};
use crate::router::Router;
use crate::{Request, Response};

/// Registers the liveness and readiness routes.
pub struct HealthModule;

impl Module for HealthModule {
    fn definitions() -> Definitions {
        Definitions::new()
            .parameter("health.liveness", "/healthz")
            .parameter("health.readiness", "/readyz")
    }

    fn init(registry: &Registry) -> Result<Self, BoxError> {
        let router: Arc<Router> = registry.get(keys::ROUTER)?;
        let liveness_path: String = registry.param("health.liveness")?;
        let readiness_path: String = registry.param("health.readiness")?;
        router.get(&liveness_path, liveness)?.get(&readiness_path, readiness)?;
        Ok(HealthModule)
    }
}

/// Always `200 OK` with body `"ok"`. If the process can answer HTTP at all,
/// it is alive.
pub async fn liveness(_req: Request) -> Response {
    Response::text("ok")
}

/// `200 OK` with body `"ready"`. Routes only exist once every module has
/// initialized, so reaching this handler means boot completed.
pub async fn readiness(_req: Request) -> Response {
    Response::text("ready")
}
