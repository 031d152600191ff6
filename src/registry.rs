//! Service registry.
//!
//! # How services are stored
//!
//! The registry maps string keys to *definitions*. A definition is one of:
//!
//! ```text
//! Parameter(toml::Value)   ← a value from the base config (or a module)
//! Instance(Arc<dyn Any>)   ← a ready-made service
//! Factory(Fn(&Registry))   ← built on first lookup, then cached
//! ```
//!
//! Definitions are merged by [`RegistryBuilder`] in order, later keys
//! replacing earlier ones, and are fixed once [`RegistryBuilder::build`]
//! returns. Every definition owns a single-initialization cell, so a factory
//! runs at most once per registry even when several requests hit the same
//! key for the first time concurrently.
//!
//! Lookups are typed at the call site:
//!
//! ```rust,ignore
//! let router: Arc<Router> = registry.get(keys::ROUTER)?;
//! let renderer: Arc<dyn Renderer> = registry.get_cloned(keys::RENDERER)?;
//! let addr: SocketAddr = registry.param("server.addr")?;
//! ```

use std::any::{Any, type_name};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::validate_key;
use crate::error::{BoxError, ConfigError, ResolveError};
use crate::middleware::Middleware;

/// Well-known keys the kernel looks up when it boots.
pub mod keys {
    /// The [`Router`](crate::Router) the dispatcher matches against.
    pub const ROUTER: &str = "router";
    /// The `Arc<dyn Renderer>` given to the dispatcher and to handlers.
    pub const RENDERER: &str = "renderer";
}

/// A resolved, type-erased service.
pub type Service = Arc<dyn Any + Send + Sync>;

type Factory = Arc<dyn Fn(&Registry) -> Result<Service, BoxError> + Send + Sync>;

#[derive(Clone)]
enum Definition {
    Parameter(toml::Value),
    Instance(Service),
    Factory(Factory),
}

impl Definition {
    fn kind(&self) -> &'static str {
        match self {
            Self::Parameter(_) => "parameter",
            Self::Instance(_) => "instance",
            Self::Factory(_) => "factory",
        }
    }
}

// ── Definitions ───────────────────────────────────────────────────────────────

/// An ordered batch of service definitions, as contributed by a module.
///
/// Keys are checked when the batch is merged into a [`RegistryBuilder`], not
/// when it is assembled, so a module with a malformed key fails the bootstrap
/// as a whole.
#[derive(Clone, Default)]
pub struct Definitions {
    entries: Vec<(String, Definition)>,
}

impl Definitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// A plain configuration value, read back with [`Registry::param`].
    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<toml::Value>) -> Self {
        self.entries.push((key.into(), Definition::Parameter(value.into())));
        self
    }

    /// A ready-made service.
    pub fn instance<T>(mut self, key: impl Into<String>, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        self.entries.push((key.into(), Definition::Instance(Arc::new(value))));
        self
    }

    /// A service built lazily from the registry on first lookup.
    pub fn factory<T, F>(mut self, key: impl Into<String>, factory: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&Registry) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        let factory: Factory =
            Arc::new(move |registry: &Registry| Ok(Arc::new(factory(registry)?) as Service));
        self.entries.push((key.into(), Definition::Factory(factory)));
        self
    }

    /// A middleware service, addressable from
    /// [`Application::pipe_service`](crate::Application::pipe_service).
    ///
    /// Stored as `Arc<dyn Middleware>`.
    pub fn middleware<M, F>(self, key: impl Into<String>, factory: F) -> Self
    where
        M: Middleware,
        F: Fn(&Registry) -> Result<M, BoxError> + Send + Sync + 'static,
    {
        self.factory(key, move |registry| {
            Ok(Arc::new(factory(registry)?) as Arc<dyn Middleware>)
        })
    }

    pub(crate) fn raw_factory(
        mut self,
        key: impl Into<String>,
        factory: fn(&Registry) -> Result<Service, BoxError>,
    ) -> Self {
        self.entries.push((key.into(), Definition::Factory(Arc::new(factory))));
        self
    }
}

impl fmt::Debug for Definitions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, d)| (k, d.kind())))
            .finish()
    }
}

// ── Builder ───────────────────────────────────────────────────────────────────

/// Merges definition batches, later keys winning, into a [`Registry`].
#[derive(Default)]
pub struct RegistryBuilder {
    definitions: HashMap<String, Definition>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges a batch. Either every key is accepted or none is.
    pub fn add_definitions(&mut self, definitions: Definitions) -> Result<&mut Self, ConfigError> {
        for (key, _) in &definitions.entries {
            validate_key(key)?;
        }
        for (key, definition) in definitions.entries {
            if let Some(previous) = self.definitions.insert(key.clone(), definition) {
                debug!(key = %key, replaced = previous.kind(), "definition overridden");
            }
        }
        Ok(self)
    }

    /// Merges the top-level table of a configuration document as parameters.
    pub fn add_parameters(&mut self, table: toml::Table) -> Result<&mut Self, ConfigError> {
        let definitions = table
            .into_iter()
            .fold(Definitions::new(), |defs, (key, value)| defs.parameter(key, value));
        self.add_definitions(definitions)
    }

    pub fn build(self) -> Registry {
        let slots = self
            .definitions
            .into_iter()
            .map(|(key, definition)| (key, Slot { definition, instance: OnceCell::new() }))
            .collect();
        Registry { inner: Arc::new(Inner { slots }) }
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

struct Slot {
    definition: Definition,
    instance: OnceCell<Service>,
}

struct Inner {
    slots: HashMap<String, Slot>,
}

/// Process-wide lookup of application services.
///
/// Cloning is cheap (one atomic increment) and every clone refers to the same
/// set of definitions and cached instances. Safe for concurrent reads.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// `true` when both handles refer to the same registry.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.slots.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.inner.slots.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.slots.is_empty()
    }

    /// Resolves `key` to its type-erased service, running its factory the
    /// first time.
    pub fn resolve(&self, key: &str) -> Result<Service, ResolveError> {
        let slot = self
            .inner
            .slots
            .get(key)
            .ok_or_else(|| ResolveError::Unknown { key: key.to_owned() })?;

        if let Some(service) = slot.instance.get() {
            return Ok(Arc::clone(service));
        }

        let _guard = Resolving::enter(key)?;
        slot.instance
            .get_or_try_init(|| match &slot.definition {
                Definition::Parameter(value) => Ok(Arc::new(value.clone()) as Service),
                Definition::Instance(service) => Ok(Arc::clone(service)),
                Definition::Factory(factory) => {
                    debug!(key, "building service");
                    factory(self).map_err(|source| ResolveError::Factory {
                        key: key.to_owned(),
                        source,
                    })
                }
            })
            .map(Arc::clone)
    }

    /// Resolves `key` as a shared `T`.
    pub fn get<T>(&self, key: &str) -> Result<Arc<T>, ResolveError>
    where
        T: Any + Send + Sync,
    {
        self.resolve(key)?
            .downcast::<T>()
            .map_err(|_| mismatch::<T>(key))
    }

    /// Resolves `key` and clones the stored `T` out. Meant for services
    /// stored as handles themselves, such as `Arc<dyn Renderer>`.
    pub fn get_cloned<T>(&self, key: &str) -> Result<T, ResolveError>
    where
        T: Any + Send + Sync + Clone,
    {
        self.resolve(key)?
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| mismatch::<T>(key))
    }

    /// Reads a parameter and deserializes it into `T`.
    ///
    /// Dotted keys walk nested tables: `"server.addr"` reads `addr` inside
    /// the `server` table, unless a definition named `"server.addr"` exists.
    pub fn param<T>(&self, key: &str) -> Result<T, ResolveError>
    where
        T: DeserializeOwned,
    {
        self.parameter_value(key)?
            .try_into()
            .map_err(|source| ResolveError::InvalidParameter { key: key.to_owned(), source })
    }

    fn parameter_value(&self, key: &str) -> Result<toml::Value, ResolveError> {
        if self.contains(key) {
            return self.get::<toml::Value>(key).map(|value| (*value).clone());
        }

        let unknown = || ResolveError::Unknown { key: key.to_owned() };
        let mut parts = key.split('.');
        let head = parts.next().filter(|h| *h != key).ok_or_else(unknown)?;
        let root = self.get::<toml::Value>(head).map_err(|e| match e {
            ResolveError::Unknown { .. } => unknown(),
            other => other,
        })?;

        let mut current: &toml::Value = &root;
        for part in parts {
            current = current.get(part).ok_or_else(unknown)?;
        }
        Ok(current.clone())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("services", &self.len()).finish()
    }
}

fn mismatch<T>(key: &str) -> ResolveError {
    ResolveError::TypeMismatch { key: key.to_owned(), expected: type_name::<T>() }
}

// ── Cycle detection ───────────────────────────────────────────────────────────

thread_local! {
    static RESOLVING: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Marks a key as being built on this thread. Factories run synchronously, so
/// meeting the same key again before the guard drops means the factory asked
/// for itself; without this the cell would block on its own initialization.
struct Resolving;

impl Resolving {
    fn enter(key: &str) -> Result<Self, ResolveError> {
        RESOLVING.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.iter().any(|k| k == key) {
                return Err(ResolveError::Cycle { key: key.to_owned() });
            }
            stack.push(key.to_owned());
            Ok(Resolving)
        })
    }
}

impl Drop for Resolving {
    fn drop(&mut self) {
        RESOLVING.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}
