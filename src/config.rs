//! Base configuration source.
//!
//! The base configuration is a TOML document read exactly once, when the
//! service registry is first built. Every top-level key becomes a parameter
//! definition in the registry:
//!
//! ```toml
//! app_name = "blog"
//!
//! [server]
//! addr = "0.0.0.0:3000"
//! ```
//!
//! Read them back typed with [`Registry::param`](crate::Registry::param):
//! `registry.param::<String>("app_name")`, `registry.param::<SocketAddr>("server.addr")`.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ConfigError;

/// Where the base definitions come from.
#[derive(Clone, Debug, Default)]
pub enum ConfigSource {
    /// A TOML file on disk.
    File(PathBuf),
    /// An inline TOML document.
    Toml(String),
    /// No base definitions; only framework defaults and modules.
    #[default]
    Empty,
}

impl ConfigSource {
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self::File(path.as_ref().to_path_buf())
    }

    pub fn toml(doc: impl Into<String>) -> Self {
        Self::Toml(doc.into())
    }

    /// Reads and parses the source into its top-level table.
    pub(crate) fn load(&self) -> Result<toml::Table, ConfigError> {
        let (origin, content) = match self {
            Self::Empty => return Ok(toml::Table::new()),
            Self::Toml(doc) => ("<inline>".to_owned(), doc.clone()),
            Self::File(path) => {
                let content = std::fs::read_to_string(path).map_err(|source| {
                    ConfigError::ReadFile { path: path.clone(), source }
                })?;
                (path.display().to_string(), content)
            }
        };

        let table: toml::Table = toml::from_str(&content)
            .map_err(|source| ConfigError::Parse { origin: origin.clone(), source })?;

        for key in table.keys() {
            validate_key(key)?;
        }

        debug!(origin = %origin, keys = table.len(), "loaded base configuration");
        Ok(table)
    }
}

/// Definition keys are non-empty and free of whitespace and control characters.
pub(crate) fn validate_key(key: &str) -> Result<(), ConfigError> {
    if key.is_empty() || key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ConfigError::InvalidKey { key: key.to_owned() });
    }
    Ok(())
}
