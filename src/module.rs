//! Application modules.
//!
//! A module is a unit of wiring: it may contribute service definitions, and
//! it is built once per application, with the registry, to do its setup
//! (typically adding routes to the router).
//!
//! ```rust,ignore
//! struct BlogModule;
//!
//! impl Module for BlogModule {
//!     fn definitions() -> Definitions {
//!         Definitions::new().parameter("blog.prefix", "/blog")
//!     }
//!
//!     fn init(registry: &Registry) -> Result<Self, BoxError> {
//!         let router: Arc<Router> = registry.get(keys::ROUTER)?;
//!         router.get("/blog", index)?;
//!         Ok(BlogModule)
//!     }
//! }
//! ```
//!
//! Modules are identified by type. Each one is registered in the registry
//! under its type name with a factory calling [`Module::init`], so building
//! it goes through the same single-initialization path as every service.

use std::any::{Any, type_name};
use std::sync::Arc;

use tracing::debug;

use crate::error::{BoxError, ConfigError, Error};
use crate::registry::{Definitions, Registry, RegistryBuilder, Service};

/// A unit of application wiring.
pub trait Module: Any + Send + Sync + Sized {
    /// Definitions merged into the registry after the base configuration and
    /// after every module registered before this one.
    fn definitions() -> Definitions {
        Definitions::new()
    }

    /// Builds the module. Runs once per application, in registration order,
    /// before any request reaches the pipeline.
    fn init(registry: &Registry) -> Result<Self, BoxError>;
}

struct Entry {
    key: &'static str,
    definitions: fn() -> Definitions,
    init: fn(&Registry) -> Result<Service, BoxError>,
}

fn init_erased<M: Module>(registry: &Registry) -> Result<Service, BoxError> {
    Ok(Arc::new(M::init(registry)?) as Service)
}

/// Ordered, duplicate-free list of modules.
#[derive(Default)]
pub(crate) struct ModuleSet {
    entries: Vec<Entry>,
}

impl ModuleSet {
    pub(crate) fn add<M: Module>(&mut self) -> Result<(), ConfigError> {
        let key = type_name::<M>();
        if self.entries.iter().any(|e| e.key == key) {
            return Err(ConfigError::DuplicateModule { module: key.to_owned() });
        }
        self.entries.push(Entry { key, definitions: M::definitions, init: init_erased::<M> });
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Merges every module's definitions, then one factory per module.
    pub(crate) fn contribute(&self, builder: &mut RegistryBuilder) -> Result<(), ConfigError> {
        for entry in &self.entries {
            let definitions = (entry.definitions)();
            if !definitions.is_empty() {
                debug!(module = entry.key, definitions = definitions.len(), "merging module definitions");
                builder.add_definitions(definitions)?;
            }
        }
        for entry in &self.entries {
            builder.add_definitions(Definitions::new().raw_factory(entry.key, entry.init))?;
        }
        Ok(())
    }

    /// Builds every module through the registry, in registration order.
    pub(crate) fn initialize(&self, registry: &Registry) -> Result<(), Error> {
        for entry in &self.entries {
            registry
                .resolve(entry.key)
                .map_err(|source| Error::ModuleInit { module: entry.key.to_owned(), source })?;
            debug!(module = entry.key, "module initialized");
        }
        Ok(())
    }
}
