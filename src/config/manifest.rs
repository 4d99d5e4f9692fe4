//! YAML manifests: a server configuration plus the plugins to register.

use std::{collections::HashMap, fs};

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use validator::Validate;

use super::ServerConfig;
use crate::{
    core::{ServerError, ServerResult},
    plugin::{build_plugin, PluginCreateFn, Registration},
    server::Server,
};

#[derive(Clone, Default, Debug, Serialize, Deserialize, Validate)]
pub struct Manifest {
    #[validate(nested)]
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub register: Vec<PluginEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PluginEntry {
    pub plugin: String,
    #[serde(default)]
    pub options: JsonValue,
    #[serde(default)]
    pub routes: RouteOptions,
    #[serde(default)]
    pub select: Option<Vec<String>>,
    #[serde(default)]
    pub once: bool,
}

#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct RouteOptions {
    pub prefix: Option<String>,
    #[serde(default)]
    pub vhost: Vec<String>,
}

impl PluginEntry {
    fn registration(&self) -> Registration {
        Registration {
            options: self.options.clone(),
            prefix: self.routes.prefix.clone(),
            vhost: self.routes.vhost.clone(),
            select: self.select.clone(),
            once: self.once,
        }
    }
}

impl Manifest {
    pub fn load_from_yaml<P>(path: P) -> ServerResult<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path)?;
        debug!("Manifest read from {path}");
        Self::from_yaml(&conf_str)
    }

    pub fn from_yaml(conf_str: &str) -> ServerResult<Self> {
        let manifest: Manifest = serde_yaml::from_str(conf_str)
            .map_err(|e| ServerError::serialization_error("Unable to parse yaml manifest", e))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Builds and initializes a server. Plugin names resolve through
    /// `factories` first, then the built-in plugins.
    ///
    /// # Errors
    /// Unknown plugins and invalid plugin options are `Configuration`
    /// errors; anything else is reported by [`Server::initialize`].
    pub async fn compose(
        self,
        factories: &HashMap<String, PluginCreateFn>,
    ) -> ServerResult<Server> {
        let mut server = Server::new(self.server)?;

        for entry in &self.register {
            let plugin = match factories.get(&entry.plugin) {
                Some(factory) => factory(entry.options.clone())?,
                None => build_plugin(&entry.plugin, entry.options.clone())?,
            };
            debug!("Manifest registers plugin {}", entry.plugin);
            server.register_shared(plugin, entry.registration())?;
        }

        server.initialize().await?;
        Ok(server)
    }
}
