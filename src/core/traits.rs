//! Core traits for portico
//!
//! These are the seams user code plugs into: route handlers, lifecycle
//! extensions, prerequisites, authentication schemes, server hooks and
//! response encoders. Each function receives a [`Toolkit`] carrying its
//! realm and optional bind context explicitly.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value as JsonValue;

use super::{
    body::PayloadStream, error::ServerResult, request::Request, response::Response,
    toolkit::Toolkit, Boom,
};

/// Outcome of an extension function
#[derive(Debug)]
pub enum Flow {
    /// Proceed with the lifecycle unchanged
    Continue,
    /// Replace the response and jump to onPreResponse
    Respond(Response),
}

/// Route handler
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: &mut Request, h: &Toolkit) -> Result<Response, Boom>;
}

/// Function bound to a lifecycle extension point
#[async_trait]
pub trait Extension: Send + Sync {
    async fn run(&self, req: &mut Request, h: &Toolkit) -> Result<Flow, Boom>;
}

/// Handler-preceding function.
///
/// Prerequisites of one group run concurrently and therefore only get
/// shared access to the request.
#[async_trait]
pub trait Prerequisite: Send + Sync {
    async fn run(&self, req: &Request, h: &Toolkit) -> Result<Response, Boom>;
}

/// Authentication scheme instance (a configured strategy)
#[async_trait]
pub trait AuthScheme: Send + Sync {
    /// Returns the resolved credentials, or a 401 when none are present.
    async fn authenticate(&self, req: &Request, h: &Toolkit) -> Result<JsonValue, Boom>;
}

/// Server lifecycle hook (onPreStart, onPostStart, onPreStop, onPostStop)
#[async_trait]
pub trait ServerHook: Send + Sync {
    async fn run(&self, h: &Toolkit) -> ServerResult<()>;
}

/// Pluggable content encoder
pub trait Encoder: Send + Sync {
    fn encode(&self, input: PayloadStream) -> PayloadStream;
}

pub struct FnHandler<F>(F);

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: for<'a> Fn(&'a mut Request, &'a Toolkit) -> BoxFuture<'a, Result<Response, Boom>>
        + Send
        + Sync,
{
    async fn handle(&self, req: &mut Request, h: &Toolkit) -> Result<Response, Boom> {
        (self.0)(req, h).await
    }
}

/// Wraps an async closure as a [`Handler`].
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: for<'a> Fn(&'a mut Request, &'a Toolkit) -> BoxFuture<'a, Result<Response, Boom>>
        + Send
        + Sync,
{
    FnHandler(f)
}

pub struct FnExtension<F>(F);

#[async_trait]
impl<F> Extension for FnExtension<F>
where
    F: for<'a> Fn(&'a mut Request, &'a Toolkit) -> BoxFuture<'a, Result<Flow, Boom>> + Send + Sync,
{
    async fn run(&self, req: &mut Request, h: &Toolkit) -> Result<Flow, Boom> {
        (self.0)(req, h).await
    }
}

/// Wraps an async closure as an [`Extension`].
pub fn ext_fn<F>(f: F) -> FnExtension<F>
where
    F: for<'a> Fn(&'a mut Request, &'a Toolkit) -> BoxFuture<'a, Result<Flow, Boom>> + Send + Sync,
{
    FnExtension(f)
}

pub struct FnPrerequisite<F>(F);

#[async_trait]
impl<F> Prerequisite for FnPrerequisite<F>
where
    F: for<'a> Fn(&'a Request, &'a Toolkit) -> BoxFuture<'a, Result<Response, Boom>> + Send + Sync,
{
    async fn run(&self, req: &Request, h: &Toolkit) -> Result<Response, Boom> {
        (self.0)(req, h).await
    }
}

/// Wraps an async closure as a [`Prerequisite`].
pub fn pre_fn<F>(f: F) -> FnPrerequisite<F>
where
    F: for<'a> Fn(&'a Request, &'a Toolkit) -> BoxFuture<'a, Result<Response, Boom>> + Send + Sync,
{
    FnPrerequisite(f)
}

pub struct FnScheme<F>(F);

#[async_trait]
impl<F> AuthScheme for FnScheme<F>
where
    F: for<'a> Fn(&'a Request, &'a Toolkit) -> BoxFuture<'a, Result<JsonValue, Boom>> + Send + Sync,
{
    async fn authenticate(&self, req: &Request, h: &Toolkit) -> Result<JsonValue, Boom> {
        (self.0)(req, h).await
    }
}

/// Wraps an async closure as an [`AuthScheme`].
pub fn scheme_fn<F>(f: F) -> FnScheme<F>
where
    F: for<'a> Fn(&'a Request, &'a Toolkit) -> BoxFuture<'a, Result<JsonValue, Boom>> + Send + Sync,
{
    FnScheme(f)
}

pub struct FnHook<F>(F);

#[async_trait]
impl<F> ServerHook for FnHook<F>
where
    F: for<'a> Fn(&'a Toolkit) -> BoxFuture<'a, ServerResult<()>> + Send + Sync,
{
    async fn run(&self, h: &Toolkit) -> ServerResult<()> {
        (self.0)(h).await
    }
}

/// Wraps an async closure as a [`ServerHook`].
pub fn hook_fn<F>(f: F) -> FnHook<F>
where
    F: for<'a> Fn(&'a Toolkit) -> BoxFuture<'a, ServerResult<()>> + Send + Sync,
{
    FnHook(f)
}

impl<F> Encoder for F
where
    F: Fn(PayloadStream) -> PayloadStream + Send + Sync,
{
    fn encode(&self, input: PayloadStream) -> PayloadStream {
        self(input)
    }
}
