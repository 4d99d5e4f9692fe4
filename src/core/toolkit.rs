//! Per-invocation context handed to every user function.

use std::{any::Any, sync::Arc};

use serde_json::Value as JsonValue;

use super::{response::Response, Boom};
use crate::{config::ServerConfig, events::Event, plugin::Realm, server::Shared};

/// Immutable context bound to a function at registration time
pub type Bind = Arc<dyn Any + Send + Sync>;

/// Explicit context passed alongside the request: the owning realm, the
/// bound context and read access to the composed server.
#[derive(Clone)]
pub struct Toolkit {
    shared: Arc<Shared>,
    realm: Arc<Realm>,
    bind: Option<Bind>,
}

impl Toolkit {
    pub(crate) fn new(shared: Arc<Shared>, realm: Arc<Realm>, bind: Option<Bind>) -> Self {
        Self {
            shared,
            realm,
            bind,
        }
    }

    pub fn realm(&self) -> &Realm {
        &self.realm
    }

    /// The bound context, if one of type `T` was registered.
    pub fn bind<T: Any>(&self) -> Option<&T> {
        self.bind.as_ref().and_then(|b| b.downcast_ref::<T>())
    }

    /// A value exposed by `plugin` under `key`.
    pub fn exposed<T: Any>(&self, plugin: &str, key: &str) -> Option<&T> {
        self.shared
            .exposed
            .get(plugin)
            .and_then(|ns| ns.get(key))
            .and_then(|v| v.downcast_ref::<T>())
    }

    /// Calls a server method.
    pub async fn method(&self, name: &str, args: JsonValue) -> Result<JsonValue, Boom> {
        self.shared.methods.call(name, args).await
    }

    pub fn settings(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn app(&self) -> &JsonValue {
        &self.shared.config.app
    }

    /// Emits a server `log` event.
    pub fn log(&self, tags: &[&str], data: JsonValue) {
        self.shared.events.emit(&Event::Log {
            tags: tags.iter().map(|t| t.to_string()).collect(),
            data,
        });
    }

    pub fn response(&self, value: impl Into<Response>) -> Response {
        value.into()
    }

    pub fn redirect(&self, location: impl Into<String>) -> Response {
        Response::redirect(location)
    }
}
