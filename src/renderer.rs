//! View rendering.
//!
//! The kernel only needs two things from a renderer: somewhere to put
//! globals (the router and the registry are added at boot) and a way to turn
//! a named view into a string. [`TemplateRenderer`] is the default, a small
//! `{{ placeholder }}` engine:
//!
//! ```text
//! <a href="{{ path posts.show slug=hello }}">{{ title }}</a>
//! ```
//!
//! - `{{ name }}`: a variable passed to `render`, else a `String` global.
//!   Variables are HTML-escaped.
//! - `{{ path route key=value … }}`: link to a named route through the
//!   `router` global.
//!
//! Swap it for a real engine by defining [`keys::RENDERER`](crate::keys::RENDERER)
//! in a module.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::router::Router;

/// A value shared with every view.
pub type Global = Arc<dyn Any + Send + Sync>;

/// Why a view could not be rendered.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("unknown view `{0}`")]
    UnknownView(String),

    #[error("view `{view}` uses `{name}`, which is not defined")]
    MissingValue { view: String, name: String },

    #[error("view `{view}` links to `{route}`, which cannot be built")]
    UnknownRoute { view: String, route: String },

    #[error("view `{view}` has an unclosed tag")]
    Unclosed { view: String },
}

/// The view-rendering service the dispatcher and handlers use.
pub trait Renderer: Send + Sync {
    fn add_global(&self, name: &str, value: Global);

    fn global(&self, name: &str) -> Option<Global>;

    fn render(&self, view: &str, vars: &[(&str, &str)]) -> Result<String, RenderError>;
}

/// In-memory templates with `{{ }}` substitution.
#[derive(Default)]
pub struct TemplateRenderer {
    templates: RwLock<HashMap<String, String>>,
    globals: RwLock<HashMap<String, Global>>,
}

impl TemplateRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a view.
    pub fn add_template(&self, name: &str, source: impl Into<String>) -> &Self {
        self.templates.write().insert(name.to_owned(), source.into());
        self
    }

    fn expand(&self, view: &str, expr: &str, vars: &[(&str, &str)]) -> Result<String, RenderError> {
        let mut words = expr.split_whitespace();
        match words.next() {
            Some("path") => {
                let route = words.next().unwrap_or_default();
                let params: Vec<(&str, &str)> = words.filter_map(|w| w.split_once('=')).collect();
                self.global("router")
                    .and_then(|g| g.downcast::<Router>().ok())
                    .and_then(|router| router.path_for(route, &params))
                    .ok_or_else(|| RenderError::UnknownRoute {
                        view: view.to_owned(),
                        route: route.to_owned(),
                    })
            }
            _ => {
                if let Some((_, value)) = vars.iter().find(|(k, _)| *k == expr) {
                    return Ok(escape(value));
                }
                self.global(expr)
                    .and_then(|g| g.downcast_ref::<String>().map(|s| escape(s)))
                    .ok_or_else(|| RenderError::MissingValue {
                        view: view.to_owned(),
                        name: expr.to_owned(),
                    })
            }
        }
    }
}

impl Renderer for TemplateRenderer {
    fn add_global(&self, name: &str, value: Global) {
        self.globals.write().insert(name.to_owned(), value);
    }

    fn global(&self, name: &str) -> Option<Global> {
        self.globals.read().get(name).cloned()
    }

    fn render(&self, view: &str, vars: &[(&str, &str)]) -> Result<String, RenderError> {
        let source = self
            .templates
            .read()
            .get(view)
            .cloned()
            .ok_or_else(|| RenderError::UnknownView(view.to_owned()))?;

        let mut out = String::with_capacity(source.len());
        let mut rest = source.as_str();
        while let Some(open) = rest.find("{{") {
            out.push_str(&rest[..open]);
            let tail = &rest[open + 2..];
            let close = tail
                .find("}}")
                .ok_or_else(|| RenderError::Unclosed { view: view.to_owned() })?;
            out.push_str(&self.expand(view, tail[..close].trim(), vars)?);
            rest = &tail[close + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
