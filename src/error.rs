//! Unified error types.
//!
//! Application-level failures (404, 422, etc.) are expressed as HTTP
//! [`Response`](crate::Response) values, not as errors. [`Error`] surfaces
//! kernel failures: a bad configuration, a module that cannot start, a
//! service that cannot be resolved, or the listener failing to bind.
//!
//! Nothing in the kernel retries or recovers. Errors travel up through
//! [`Application::run`](crate::Application::run) untouched; a middleware may
//! catch one coming back from `next` and turn it into a response, but that is
//! the middleware's decision.

use std::path::PathBuf;

use thiserror::Error;

use crate::renderer::RenderError;

/// Error type returned by user factories, module initializers and handlers
/// that need to fail with an arbitrary cause.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The error type returned by fram's fallible operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// Bad or missing base configuration, malformed module definitions, or
    /// registration attempted at the wrong time.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// A module failed to initialize.
    #[error("module `{module}` failed to initialize: {source}")]
    ModuleInit {
        module: String,
        #[source]
        source: ResolveError,
    },

    /// An appended middleware entry cannot be a handler.
    #[error("invalid middleware: {reason}")]
    InvalidMiddleware { reason: String },

    /// A deferred middleware or a required service could not be resolved.
    #[error("service resolution failed: {0}")]
    ServiceResolution(#[from] ResolveError),

    /// The view renderer failed.
    #[error("render error: {0}")]
    Render(#[from] RenderError),

    /// Binding or accepting on the listener failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// The request body could not be read from the connection.
    #[error("failed to read request body: {source}")]
    Body { source: BoxError },
}

impl Error {
    /// Short stable label (snake_case) for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration",
            Error::ModuleInit { .. } => "module_init",
            Error::InvalidMiddleware { .. } => "invalid_middleware",
            Error::ServiceResolution(_) => "service_resolution",
            Error::Render(_) => "render",
            Error::Io(_) => "io",
            Error::Body { .. } => "body",
        }
    }
}

/// Configuration failures. All of them are fatal to the run.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The base configuration file could not be read.
    #[error("failed to read config file '{}': {source}", .path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The base configuration is not valid TOML.
    #[error("failed to parse config '{origin}': {source}")]
    Parse {
        origin: String,
        #[source]
        source: toml::de::Error,
    },

    /// A definition key is empty or contains whitespace.
    #[error("invalid definition key {key:?}")]
    InvalidKey { key: String },

    /// The same module type was registered twice.
    #[error("module `{module}` is already registered")]
    DuplicateModule { module: String },

    /// Assembly was attempted after the registry had been built.
    #[error("cannot {what} after the application has started")]
    LateRegistration { what: &'static str },
}

/// Why a registry lookup failed.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ResolveError {
    /// No definition exists for the key.
    #[error("unknown service `{key}`")]
    Unknown { key: String },

    /// The definition exists but holds a different type.
    #[error("service `{key}` is not a `{expected}`")]
    TypeMismatch { key: String, expected: &'static str },

    /// The factory for the key returned an error.
    #[error("factory for `{key}` failed: {source}")]
    Factory {
        key: String,
        #[source]
        source: BoxError,
    },

    /// The factory for the key asked for the key itself.
    #[error("circular dependency while resolving `{key}`")]
    Cycle { key: String },

    /// A parameter could not be deserialized into the requested type.
    #[error("parameter `{key}` has the wrong shape: {source}")]
    InvalidParameter {
        key: String,
        #[source]
        source: toml::de::Error,
    },
}
