//! portico: an extensible HTTP request-processing core.
//!
//! It defines the route matcher, the request lifecycle with its extension
//! points, plugin composition and response transmission. Sockets and TLS are
//! left to the embedding transport, which hands requests to
//! [`server::Server::dispatch`].

pub mod cache;
pub mod config;
pub mod core;
pub mod events;
pub mod lifecycle;
pub mod logging;
pub mod methods;
pub mod plugin;
pub mod route;
pub mod router;
pub mod server;
pub(crate) mod utils;
pub mod views;

pub use crate::{
    config::ServerConfig,
    core::{Boom, Request, Response, ServerError, ServerResult, Toolkit},
    plugin::{Plugin, PluginScope, Registration},
    route::RouteDef,
    server::Server,
};
