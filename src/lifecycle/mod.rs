//! Request lifecycle.
//!
//! A request moves through onRequest, routing, onPreAuth, authentication,
//! onCredentials, access checks, onPostAuth, payload, validation,
//! onPreHandler, prerequisites, the handler and onPostHandler. Any of these
//! may substitute a response or fail, which jumps straight to onPreResponse.
//! The response is then transmitted and onPostResponse runs last.
//!
//! Everything between routing and the response is bounded by the route's
//! server timeout. When it expires the in-flight work is dropped, the
//! request is marked cancelled and a 503 is sent instead.

pub mod auth;
pub mod ext;
pub mod payload;
pub mod prerequisites;
pub mod protect;
pub mod schema;
pub mod transmit;
pub mod validation;

use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use http::{HeaderMap, Method, Uri};
use serde_json::Value as JsonValue;

use crate::{
    core::{Body, Boom, ErrorKind, Flow, Request, Response, Stage, TimeoutKind},
    events::Event,
    route::Route,
    server::{Connection, Shared},
    utils::request::percent_decode,
};

use ext::ExtPoint;
use protect::protect;
use transmit::{Outbound, TransmitOutcome};

/// A request as handed over by the transport (or by injection)
#[derive(Debug)]
pub struct Incoming {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Body,
    pub remote_addr: Option<SocketAddr>,
    /// Pre-resolved credentials, bypassing authentication schemes
    pub credentials: Option<JsonValue>,
}

impl Incoming {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Body::Empty,
            remote_addr: None,
            credentials: None,
        }
    }
}

/// Runs one request to completion. Always transmits exactly one response.
pub(crate) async fn execute(
    shared: &Arc<Shared>,
    conn: &Connection,
    incoming: Incoming,
    out: &mut dyn Outbound,
) -> TransmitOutcome {
    let Incoming {
        method,
        uri,
        headers,
        body,
        remote_addr,
        credentials,
    } = incoming;

    let mut req = Request::new(method, uri, headers);
    req.info.remote_addr = remote_addr;
    if let Some(credentials) = credentials {
        req.auth.is_injected = true;
        req.auth.credentials = Some(credentials);
    }
    let expose = shared.config.debug.expose_errors;

    let response = match conn
        .pipeline
        .run(ExtPoint::OnRequest, &[], &mut req, shared)
        .await
    {
        Ok(Flow::Continue) => route_request(shared, conn, &mut req, body).await,
        Ok(Flow::Respond(response)) => response,
        Err(boom) => Response::from_boom(boom, expose),
    };

    req.info.mark(Stage::PreResponse);
    let route = req.route.clone();
    let route_ext = route.as_ref().map(|r| r.ext.as_slice()).unwrap_or(&[]);

    req.response = Some(response);
    if let Err(boom) = conn
        .pipeline
        .run(ExtPoint::OnPreResponse, route_ext, &mut req, shared)
        .await
    {
        req.response = Some(Response::from_boom(boom, expose));
    }
    let response = req.response.take().unwrap_or_else(Response::empty);
    let boom = response.boom().cloned();

    if !req.mark_finished() {
        log::warn!("request {} already answered, dropping response", req.id);
        return TransmitOutcome {
            status: response.status(),
            bytes: 0,
            error: None,
        };
    }

    req.info.mark(Stage::Transmitting);
    let settings = route.as_ref().map(|r| &r.settings);
    let prepared = shared.transmitter.prepare(response, &req, settings);
    let outcome = shared
        .transmitter
        .send(prepared, out, settings.and_then(|s| s.socket_timeout))
        .await;
    req.info.status = Some(outcome.status);
    req.info.mark(Stage::Done);

    if let Err(boom) = conn
        .pipeline
        .run(ExtPoint::OnPostResponse, route_ext, &mut req, shared)
        .await
    {
        log::warn!("request {} onPostResponse failed: {boom}", req.id);
    }

    report(shared, &req, &outcome, boom.as_ref());
    outcome
}

async fn route_request(
    shared: &Arc<Shared>,
    conn: &Connection,
    req: &mut Request,
    body: Body,
) -> Response {
    let expose = shared.config.debug.expose_errors;

    let matched = conn
        .router
        .route(req.method.as_str(), req.host(), req.path())
        .map(|m| (m.value.clone(), m.params));
    let Some((route, raw_params)) = matched else {
        return Response::from_boom(Boom::not_found(), expose);
    };

    let mut params = BTreeMap::new();
    for (name, raw) in raw_params {
        match percent_decode(&raw) {
            Some(value) => {
                params.insert(name, value);
            }
            None => {
                return Response::from_boom(
                    Boom::bad_request("Invalid path parameter encoding"),
                    expose,
                )
            }
        }
    }
    req.params = params;
    req.route = Some(route.clone());
    req.info.mark(Stage::Routed);

    let lifecycle = run_route(shared, conn, &route, req, body);
    let result = match route.settings.server_timeout {
        None => lifecycle.await,
        Some(limit) => {
            let outcome = tokio::time::timeout(limit, lifecycle).await;
            match outcome {
                Ok(result) => result,
                Err(_) => {
                    req.cancel();
                    log::warn!(
                        "request {} {} {} timed out after {limit:?}",
                        req.id,
                        req.method,
                        req.path()
                    );
                    Err(Boom::server_unavailable("Service Unavailable")
                        .with_kind(ErrorKind::Timeout(TimeoutKind::Server)))
                }
            }
        }
    };

    result.unwrap_or_else(|boom| Response::from_boom(boom, expose))
}

async fn run_route(
    shared: &Arc<Shared>,
    conn: &Connection,
    route: &Arc<Route>,
    req: &mut Request,
    body: Body,
) -> Result<Response, Boom> {
    let h = route.toolkit(shared);
    let ext = route.ext.as_slice();

    macro_rules! ext_point {
        ($point:expr) => {
            if let Flow::Respond(response) = conn.pipeline.run($point, ext, req, shared).await? {
                return Ok(response);
            }
        };
    }

    ext_point!(ExtPoint::OnPreAuth);
    if let Some(auth) = route.auth() {
        auth::authenticate(req, auth, shared).await?;
    }
    req.info.mark(Stage::Authenticated);

    ext_point!(ExtPoint::OnCredentials);
    if let Some(auth) = route.auth() {
        auth::access(req, auth)?;
    }
    ext_point!(ExtPoint::OnPostAuth);

    payload::read(req, body, &route.settings.payload).await?;
    if let Flow::Respond(response) = route.validation.run(req).await? {
        return Ok(response);
    }
    req.info.mark(Stage::Validated);

    ext_point!(ExtPoint::OnPreHandler);

    req.info.mark(Stage::Prerequisites);
    if let Flow::Respond(response) = route.pre.run(req, &h).await? {
        return Ok(response);
    }

    let response = protect("handler", route.handler.handle(req, &h)).await?;
    req.info.mark(Stage::Handled);

    req.response = Some(response);
    ext_point!(ExtPoint::OnPostHandler);

    Ok(req.response.take().unwrap_or_else(Response::empty))
}

fn report(shared: &Shared, req: &Request, outcome: &TransmitOutcome, boom: Option<&Boom>) {
    let elapsed = req.info.received.elapsed();
    let status = outcome.status;

    if status.is_server_error() {
        let message = boom
            .map(|b| b.message().to_string())
            .or_else(|| outcome.error.as_ref().map(|e| e.message().to_string()))
            .unwrap_or_default();
        log::error!("request {} {} {} -> {status}: {message}", req.id, req.method, req.path());
        shared.events.emit(&Event::RequestError {
            id: req.id.clone(),
            status,
            message,
        });
    } else if let Some(boom) = boom {
        log::warn!("request {} {} {} -> {boom}", req.id, req.method, req.path());
    }

    if let Some(error) = &outcome.error {
        log::warn!("request {} transmission failed: {error}", req.id);
    }

    log::debug!(
        "{} {} -> {} ({} bytes) in {elapsed:?}",
        req.method,
        req.path(),
        status.as_u16(),
        outcome.bytes
    );

    shared.events.emit(&Event::Response {
        id: req.id.clone(),
        method: req.method.to_string(),
        path: req.path().to_string(),
        status,
        elapsed,
        failed: outcome.error.is_some(),
    });
}
