use std::sync::Arc;

use serde_json::Value as JsonValue;

use super::Registration;
use crate::{config::RouteConfig, core::Bind};

const ROOT_NAME: &str = "root";

/// Per-plugin registration context.
///
/// Realms form a tree rooted at the server. A child inherits its parent's
/// route prefix (composed), vhost, listener selection and route defaults.
/// Updates produce a new snapshot with the same id, so routes and bindings
/// registered earlier keep the settings they were registered with.
#[derive(Clone)]
pub struct Realm {
    id: usize,
    plugin: Option<String>,
    pub(crate) version: String,
    pub(crate) prefix: Option<String>,
    pub(crate) vhost: Vec<String>,
    pub(crate) select: Option<Vec<String>>,
    pub(crate) route_defaults: RouteConfig,
    pub(crate) options: JsonValue,
    pub(crate) bind: Option<Bind>,
    pub(crate) parent: Option<Arc<Realm>>,
    pub(crate) dependencies: Vec<String>,
}

impl Realm {
    pub(crate) fn root() -> Self {
        Self {
            id: 0,
            plugin: None,
            version: "0.0.0".to_string(),
            prefix: None,
            vhost: Vec::new(),
            select: None,
            route_defaults: RouteConfig::default(),
            options: JsonValue::Null,
            bind: None,
            parent: None,
            dependencies: Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_plugin(id: usize, name: &str) -> Self {
        Self {
            id,
            plugin: Some(name.to_string()),
            ..Self::root()
        }
    }

    /// A child realm for a plugin registered under `parent`.
    pub(crate) fn child(
        id: usize,
        parent: &Arc<Realm>,
        plugin: &str,
        version: &str,
        registration: &Registration,
    ) -> Self {
        let prefix = match (&parent.prefix, registration.prefix.as_deref().and_then(normalize_prefix)) {
            (Some(outer), Some(inner)) => Some(format!("{outer}{inner}")),
            (outer, inner) => inner.or_else(|| outer.clone()),
        };

        let vhost = if registration.vhost.is_empty() {
            parent.vhost.clone()
        } else {
            registration.vhost.clone()
        };

        Self {
            id,
            plugin: Some(plugin.to_string()),
            version: version.to_string(),
            prefix,
            vhost,
            select: narrow(parent.select.as_deref(), registration.select.as_deref()),
            route_defaults: parent.route_defaults.clone(),
            options: registration.options.clone(),
            bind: parent.bind.clone(),
            parent: Some(parent.clone()),
            dependencies: Vec::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Owning plugin name, `root` for the server itself.
    pub fn name(&self) -> &str {
        self.plugin.as_deref().unwrap_or(ROOT_NAME)
    }

    pub fn plugin(&self) -> Option<&str> {
        self.plugin.as_deref()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn vhost(&self) -> &[String] {
        &self.vhost
    }

    pub fn options(&self) -> &JsonValue {
        &self.options
    }

    pub fn parent(&self) -> Option<&Realm> {
        self.parent.as_deref()
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn route_defaults(&self) -> &RouteConfig {
        &self.route_defaults
    }

    /// Applies the realm prefix to a route path.
    pub fn prefixed(&self, path: &str) -> String {
        match &self.prefix {
            Some(prefix) if path == "/" => prefix.clone(),
            Some(prefix) => format!("{prefix}{path}"),
            None => path.to_string(),
        }
    }

    /// Whether this realm registers on a connection with these labels.
    pub fn selects(&self, labels: &[String]) -> bool {
        self.select
            .as_ref()
            .map_or(true, |wanted| wanted.iter().any(|l| labels.contains(l)))
    }

    pub(crate) fn narrow_select(&mut self, labels: &[String]) {
        self.select = narrow(self.select.as_deref(), Some(labels));
    }
}

/// `None` for prefixes that add nothing, such as `"/"`.
fn normalize_prefix(prefix: &str) -> Option<String> {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(format!("/{trimmed}"))
    }
}

fn narrow(outer: Option<&[String]>, inner: Option<&[String]>) -> Option<Vec<String>> {
    match (outer, inner) {
        (None, None) => None,
        (Some(labels), None) | (None, Some(labels)) => Some(labels.to_vec()),
        (Some(outer), Some(inner)) => Some(
            inner
                .iter()
                .filter(|l| outer.contains(l))
                .cloned()
                .collect(),
        ),
    }
}
