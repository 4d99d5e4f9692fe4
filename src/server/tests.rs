//! End-to-end tests composing a server and injecting requests.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use http::{Method, StatusCode};
use serde_json::{json, Value as JsonValue};

use super::*;
use crate::{
    config::{Listener, PayloadConfig, RouteConfig, TimeoutConfig},
    core::{ext_fn, handler_fn, hook_fn, pre_fn, scheme_fn, AuthScheme, Body, Flow, Response},
    events::EventKind,
    lifecycle::{
        auth::RouteAuth,
        Incoming,
        prerequisites::Pre,
        schema::{Field, Schema},
        validation::FailAction,
    },
    methods::{method_fn, MethodOptions},
    plugin::build_plugin,
    views::RenderError,
};

fn get(path: &str, body: &'static str) -> RouteDef {
    RouteDef::get(path).handler(handler_fn(move |_, _| {
        Box::pin(async move { Ok(Response::text(body)) })
    }))
}

async fn server_with(routes: Vec<RouteDef>) -> Server {
    let mut server = Server::new(ServerConfig::default()).unwrap();
    for route in routes {
        server.route(route).unwrap();
    }
    server.initialize().await.unwrap();
    server
}

struct Greeter;

#[async_trait]
impl Plugin for Greeter {
    fn name(&self) -> &str {
        "greeter"
    }

    fn version(&self) -> &str {
        "1.2.0"
    }

    async fn register(&self, scope: &mut PluginScope<'_>, options: JsonValue) -> ServerResult<()> {
        let greeting = options["greeting"].as_str().unwrap_or("hello").to_string();
        scope.expose("greeting", greeting)?;
        scope.route(RouteDef::get("/hello").handler(handler_fn(|_, h| {
            Box::pin(async move {
                let greeting = h
                    .exposed::<String>("greeter", "greeting")
                    .cloned()
                    .unwrap_or_default();
                Ok(Response::text(format!("{greeting} from {}", h.realm().name())))
            })
        })))
    }
}

struct NeedsMissing;

#[async_trait]
impl Plugin for NeedsMissing {
    fn name(&self) -> &str {
        "needs-missing"
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["missing".to_string()]
    }

    async fn register(&self, scope: &mut PluginScope<'_>, _options: JsonValue) -> ServerResult<()> {
        scope.expose("breaking", true)
    }
}

struct Named {
    name: &'static str,
    dependencies: &'static [&'static str],
}

#[async_trait]
impl Plugin for Named {
    fn name(&self) -> &str {
        self.name
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.iter().map(|d| d.to_string()).collect()
    }

    async fn register(&self, _scope: &mut PluginScope<'_>, _options: JsonValue) -> ServerResult<()> {
        Ok(())
    }
}

fn queued(name: &'static str, dependencies: &'static [&'static str]) -> (Arc<dyn Plugin>, Registration) {
    (Arc::new(Named { name, dependencies }), Registration::default())
}

struct Hooks(Arc<Mutex<Vec<&'static str>>>);

#[async_trait]
impl Plugin for Hooks {
    fn name(&self) -> &str {
        "hooks"
    }

    async fn register(&self, scope: &mut PluginScope<'_>, _options: JsonValue) -> ServerResult<()> {
        for (point, label) in [
            (HookPoint::OnPreStart, "pre-start"),
            (HookPoint::OnPostStart, "post-start"),
            (HookPoint::OnPreStop, "pre-stop"),
            (HookPoint::OnPostStop, "post-stop"),
        ] {
            let calls = self.0.clone();
            scope.hook(
                point,
                hook_fn(move |_| {
                    let calls = calls.clone();
                    Box::pin(async move {
                        calls.lock().unwrap().push(label);
                        Ok(())
                    })
                }),
            );
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_most_specific_route_wins() {
    let server = server_with(vec![
        get("/users/me", "literal"),
        get("/users/{id}", "param"),
        get("/users/{rest*}", "wildcard"),
    ])
    .await;

    assert_eq!(server.inject("/users/me").await.unwrap().payload, "literal");
    assert_eq!(server.inject("/users/42").await.unwrap().payload, "param");
    assert_eq!(server.inject("/users/42/posts").await.unwrap().payload, "wildcard");

    let missing = server.inject("/nowhere").await.unwrap();
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert_eq!(missing.json().unwrap()["statusCode"], 404);
}

#[tokio::test]
async fn test_route_conflicts_are_rejected() {
    let mut server = Server::new(ServerConfig::default()).unwrap();
    server.route(get("/a", "a")).unwrap();
    assert!(matches!(
        server.route(get("/a/{p?}", "b")),
        Err(ServerError::RouteConflict(_))
    ));

    server.route(get("/b", "b").id("b")).unwrap();
    assert!(matches!(
        server.route(get("/c", "c").id("b")),
        Err(ServerError::NameConflict(_))
    ));
    assert_eq!(server.lookup("b").map(|r| r.path.as_str()), Some("/b"));
}

#[tokio::test]
async fn test_injection_is_repeatable() {
    let server = server_with(vec![RouteDef::get("/echo/{name}").handler(handler_fn(|req, _| {
        Box::pin(async move { Ok(Response::value(json!({"name": req.params["name"]}))) })
    }))])
    .await;

    let first = server.inject("/echo/ann").await.unwrap();
    let second = server.inject("/echo/ann").await.unwrap();
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.payload, second.payload);
    assert_eq!(first.json().unwrap(), json!({"name": "ann"}));
    assert_eq!(first.header("content-type"), Some("application/json; charset=utf-8"));
}

#[tokio::test(start_paused = true)]
async fn test_server_timeout_sends_single_503() {
    let mut config = ServerConfig::default();
    config.routes.timeout.server = Some(50);
    let mut server = Server::new(config).unwrap();
    server
        .route(RouteDef::get("/slow").handler(handler_fn(|_, _| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(Response::text("late"))
            })
        })))
        .unwrap();
    server.initialize().await.unwrap();

    let started = tokio::time::Instant::now();
    let response = server.inject("/slow").await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(49));
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.json().unwrap()["statusCode"], 503);
    assert!(!response.payload.contains("late"));
}

#[tokio::test(start_paused = true)]
async fn test_prerequisite_groups_run_in_order() {
    let order = Arc::new(Mutex::new(Vec::new()));

    let step = |name: &'static str, delay: u64, order: Arc<Mutex<Vec<&'static str>>>| {
        Pre::new(pre_fn(move |_, _| {
            let order = order.clone();
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                order.lock().unwrap().push(name);
                Ok(Response::value(json!(name)))
            })
        }))
        .assign(name)
    };

    let combine = Pre::new(pre_fn(|req, _| {
        Box::pin(async move {
            Ok(Response::value(json!(format!(
                "{}+{}",
                req.pre["a"].as_str().unwrap_or_default(),
                req.pre["b"].as_str().unwrap_or_default()
            ))))
        })
    }))
    .assign("c");

    let server = server_with(vec![RouteDef::get("/pre")
        .pre(vec![step("a", 20, order.clone()), step("b", 5, order.clone())])
        .pre(vec![combine])
        .handler(handler_fn(|req, _| {
            Box::pin(async move { Ok(Response::value(req.pre["c"].clone())) })
        }))])
    .await;

    let response = server.inject("/pre").await.unwrap();
    assert_eq!(response.json().unwrap(), json!("a+b"));
    assert_eq!(*order.lock().unwrap(), vec!["b", "a"]);
}

#[tokio::test]
async fn test_prerequisite_takeover_skips_handler() {
    let calls = Arc::new(AtomicUsize::new(0));
    let later = Arc::new(AtomicUsize::new(0));

    let route = {
        let calls = calls.clone();
        let later = later.clone();
        RouteDef::get("/cached")
            .pre(vec![Pre::new(pre_fn(|_, _| {
                Box::pin(async move { Ok(Response::text("from cache").takeover()) })
            }))
            .assign("hit")])
            .pre(vec![Pre::new(pre_fn(move |_, _| {
                let later = later.clone();
                Box::pin(async move {
                    later.fetch_add(1, Ordering::SeqCst);
                    Ok(Response::value(json!(null)))
                })
            }))])
            .handler(handler_fn(move |_, _| {
                let calls = calls.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Response::text("fresh"))
                })
            }))
    };
    let server = server_with(vec![route]).await;

    let response = server.inject("/cached").await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.payload, "from cache");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(later.load(Ordering::SeqCst), 0);
}

fn stalled_upload(payload_ms: u64, server_ms: u64) -> RouteDef {
    RouteDef::post("/upload")
        .config(RouteConfig {
            timeout: TimeoutConfig {
                server: Some(server_ms),
                socket: None,
            },
            payload: PayloadConfig {
                timeout: Some(payload_ms),
                ..Default::default()
            },
            ..Default::default()
        })
        .handler(handler_fn(|_, _| {
            Box::pin(async move { Ok(Response::text("stored")) })
        }))
}

fn stalled_request() -> Incoming {
    let mut incoming = Incoming::new(Method::POST, "/upload".parse().unwrap());
    incoming.body = Body::stream(futures::stream::pending::<std::io::Result<Bytes>>());
    incoming
}

#[tokio::test(start_paused = true)]
async fn test_stalled_payload_hits_client_timeout_first() {
    let server = server_with(vec![stalled_upload(20, 50)]).await;

    let response = server.inject_incoming(stalled_request()).await.unwrap();
    assert_eq!(response.status, StatusCode::REQUEST_TIMEOUT);
    assert_eq!(response.json().unwrap()["statusCode"], 408);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_payload_hits_server_timeout_first() {
    let server = server_with(vec![stalled_upload(50, 20)]).await;

    let response = server.inject_incoming(stalled_request()).await.unwrap();
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.json().unwrap()["statusCode"], 503);
}

#[tokio::test]
async fn test_prerequisite_loads_resource() {
    let load_user = || {
        Pre::new(pre_fn(|req, _| {
            Box::pin(async move {
                match req.params["id"].as_str() {
                    "0" => Err(Boom::not_found()),
                    id => Ok(Response::value(json!({"id": id, "name": "Ann"}))),
                }
            })
        }))
        .assign("user")
    };
    let respond = || {
        handler_fn(|req, _| Box::pin(async move { Ok(Response::value(req.pre["user"].clone())) }))
    };

    let server = server_with(vec![
        RouteDef::get("/user/{id}").pre(vec![load_user()]).handler(respond()),
        RouteDef::get("/lenient/{id}")
            .pre(vec![load_user().fail_action(FailAction::Ignore)])
            .handler(respond()),
    ])
    .await;

    let found = server.inject("/user/7").await.unwrap();
    assert_eq!(found.json().unwrap(), json!({"id": "7", "name": "Ann"}));

    let missing = server.inject("/user/0").await.unwrap();
    assert_eq!(missing.status, StatusCode::NOT_FOUND);

    let lenient = server.inject("/lenient/0").await.unwrap();
    assert_eq!(lenient.status, StatusCode::OK);
    assert_eq!(lenient.json().unwrap()["statusCode"], 404);
}

#[tokio::test]
async fn test_invalid_response_header_is_400() {
    let server = server_with(vec![RouteDef::post("/item").handler(handler_fn(|_, _| {
        Box::pin(async move {
            Ok(Response::value(json!({"id": 1})).created("/item/1\r\nx-injected: yes"))
        })
    }))])
    .await;

    let response = server.inject(InjectOptions::new("POST", "/item")).await.unwrap();
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert!(response.header("location").is_none());
    assert!(response.header("x-injected").is_none());
}

#[tokio::test]
async fn test_head_falls_back_to_get_without_body() {
    let server = server_with(vec![get("/page", "content")]).await;

    let response = server
        .inject(InjectOptions::new("HEAD", "/page"))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert!(response.payload.is_empty());
    assert_eq!(response.header("content-length"), Some("7"));
}

#[tokio::test]
async fn test_vhost_routes() {
    let server = server_with(vec![
        get("/", "default"),
        get("/", "example").vhost("example.com"),
    ])
    .await;

    let default = server.inject("/").await.unwrap();
    assert_eq!(default.payload, "default");

    let vhost = server
        .inject(InjectOptions::new("GET", "/").header("host", "Example.com:8080"))
        .await
        .unwrap();
    assert_eq!(vhost.payload, "example");
}

#[tokio::test]
async fn test_validation_failure_is_400() {
    let server = server_with(vec![RouteDef::post("/items")
        .validate_payload(Schema::object().field("name", Field::string().required()))
        .handler(handler_fn(|req, _| {
            Box::pin(async move { Ok(Response::value(req.payload.clone().unwrap_or_default())) })
        }))])
    .await;

    let rejected = server
        .inject(InjectOptions::new("POST", "/items").json(&json!({"size": 1})))
        .await
        .unwrap();
    assert_eq!(rejected.status, StatusCode::BAD_REQUEST);
    assert_eq!(
        rejected.json().unwrap()["validation"],
        json!({"source": "payload", "keys": ["name"]})
    );

    let accepted = server
        .inject(InjectOptions::new("POST", "/items").json(&json!({"name": "lamp"})))
        .await
        .unwrap();
    assert_eq!(accepted.status, StatusCode::OK);
    assert_eq!(accepted.json().unwrap()["name"], "lamp");
}

fn header_scheme(_options: JsonValue) -> ServerResult<Arc<dyn AuthScheme>> {
    Ok(Arc::new(scheme_fn(|req, _| {
        Box::pin(async move {
            match req.header("x-user") {
                Some(user) => Ok(json!({"user": user, "scope": ["read"]})),
                None => Err(Boom::unauthorized("Missing authentication", Some("Custom"))),
            }
        })
    })))
}

fn credentials() -> impl crate::core::Handler {
    handler_fn(|req, _| {
        Box::pin(async move {
            Ok(Response::value(json!({
                "authenticated": req.auth.is_authenticated,
                "credentials": req.auth.credentials.clone(),
            })))
        })
    })
}

#[tokio::test]
async fn test_auth_modes() {
    let mut server = Server::new(ServerConfig::default()).unwrap();
    {
        let mut root = server.root().unwrap();
        root.auth_scheme("custom", header_scheme).unwrap();
        root.auth_strategy("session", "custom", JsonValue::Null).unwrap();
    }
    server
        .route(RouteDef::get("/private").auth(RouteAuth::required("session")).handler(credentials()))
        .unwrap();
    server
        .route(RouteDef::get("/maybe").auth(RouteAuth::optional("session")).handler(credentials()))
        .unwrap();
    server
        .route(RouteDef::get("/public").no_auth().handler(credentials()))
        .unwrap();
    server
        .route(
            RouteDef::get("/admin")
                .auth(RouteAuth::required("session").scope("admin"))
                .handler(credentials()),
        )
        .unwrap();
    server.initialize().await.unwrap();

    let denied = server.inject("/private").await.unwrap();
    assert_eq!(denied.status, StatusCode::UNAUTHORIZED);
    assert!(denied.header("www-authenticate").unwrap().contains("Custom"));

    let allowed = server
        .inject(InjectOptions::new("GET", "/private").header("x-user", "ann"))
        .await
        .unwrap();
    assert_eq!(allowed.status, StatusCode::OK);
    assert_eq!(allowed.json().unwrap()["credentials"]["user"], "ann");

    let anonymous = server.inject("/maybe").await.unwrap();
    assert_eq!(anonymous.status, StatusCode::OK);
    assert_eq!(anonymous.json().unwrap()["authenticated"], false);

    let public = server.inject("/public").await.unwrap();
    assert_eq!(public.status, StatusCode::OK);

    let forbidden = server
        .inject(InjectOptions::new("GET", "/admin").header("x-user", "ann"))
        .await
        .unwrap();
    assert_eq!(forbidden.status, StatusCode::FORBIDDEN);

    let injected = server
        .inject(InjectOptions::new("GET", "/private").credentials(json!({"user": "ci"})))
        .await
        .unwrap();
    assert_eq!(injected.status, StatusCode::OK);
    assert_eq!(injected.json().unwrap()["credentials"]["user"], "ci");
}

#[tokio::test]
async fn test_unknown_strategy_fails_initialize() {
    let mut server = Server::new(ServerConfig::default()).unwrap();
    server
        .route(RouteDef::get("/x").auth(RouteAuth::required("nope")).handler(credentials()))
        .unwrap();
    assert!(matches!(
        server.initialize().await,
        Err(ServerError::InvalidRoute(_))
    ));
}

#[tokio::test]
async fn test_builtin_auth_plugins() {
    let mut server = Server::new(ServerConfig::default()).unwrap();
    let basic = build_plugin(
        "basic-auth",
        json!({"strategy": "simple", "default": true, "users": {"john": {"password": "secret"}}}),
    )
    .unwrap();
    let keys = build_plugin(
        "key-auth",
        json!({"strategy": "keys", "keys": {"k-1": {"user": "ci"}}}),
    )
    .unwrap();
    server.register_shared(basic, Registration::default()).unwrap();
    server.register_shared(keys, Registration::default()).unwrap();
    server.route(RouteDef::get("/me").handler(credentials())).unwrap();
    server
        .route(RouteDef::get("/ci").auth(RouteAuth::required("keys")).handler(credentials()))
        .unwrap();
    server.initialize().await.unwrap();

    let denied = server.inject("/me").await.unwrap();
    assert_eq!(denied.status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        denied.header("www-authenticate"),
        Some("Basic realm=\"portico\"")
    );

    let token = general_purpose::STANDARD.encode("john:secret");
    let me = server
        .inject(InjectOptions::new("GET", "/me").header("authorization", format!("Basic {token}")))
        .await
        .unwrap();
    assert_eq!(me.status, StatusCode::OK);
    assert_eq!(me.json().unwrap()["credentials"]["username"], "john");

    let ci = server.inject("/ci?apikey=k-1").await.unwrap();
    assert_eq!(ci.json().unwrap()["credentials"]["user"], "ci");

    let bad_key = server
        .inject(InjectOptions::new("GET", "/ci").header("apikey", "nope"))
        .await
        .unwrap();
    assert_eq!(bad_key.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_extension_takeover() {
    let mut server = Server::new(ServerConfig::default()).unwrap();
    server
        .ext(
            ExtPoint::OnRequest,
            ext_fn(|req, _| {
                Box::pin(async move {
                    if req.path().starts_with("/blocked") {
                        return Ok(Flow::Respond(
                            Response::text("nope").code(StatusCode::FORBIDDEN).takeover(),
                        ));
                    }
                    Ok(Flow::Continue)
                })
            }),
        )
        .unwrap();
    server
        .ext(
            ExtPoint::OnPreResponse,
            ext_fn(|req, _| {
                Box::pin(async move {
                    if let Some(response) = req.response.as_mut() {
                        response.set_header("x-served-by", "portico");
                    }
                    Ok(Flow::Continue)
                })
            }),
        )
        .unwrap();
    server.route(get("/open", "open")).unwrap();
    server.initialize().await.unwrap();

    let blocked = server.inject("/blocked/anything").await.unwrap();
    assert_eq!(blocked.status, StatusCode::FORBIDDEN);
    assert_eq!(blocked.payload, "nope");
    assert_eq!(blocked.header("x-served-by"), Some("portico"));

    let open = server.inject("/open").await.unwrap();
    assert_eq!(open.payload, "open");
    assert_eq!(open.header("x-served-by"), Some("portico"));
}

#[tokio::test]
async fn test_plugin_routes_and_exposed_values() {
    let mut server = Server::new(ServerConfig::default()).unwrap();
    server
        .register(
            Greeter,
            Registration::default()
                .prefix("/v1")
                .options(json!({"greeting": "hi"})),
        )
        .unwrap();
    server.initialize().await.unwrap();

    assert_eq!(server.exposed::<String>("greeter", "greeting").unwrap(), "hi");
    let response = server.inject("/v1/hello").await.unwrap();
    assert_eq!(response.payload, "hi from greeter");
    assert_eq!(server.inject("/hello").await.unwrap().status, StatusCode::NOT_FOUND);

    let route = server.match_route("GET", "/v1/hello", None).unwrap();
    assert_eq!(route.realm.plugin(), Some("greeter"));
    assert_eq!(route.realm.version(), "1.2.0");
}

#[tokio::test]
async fn test_duplicate_plugin_registration() {
    let mut server = Server::new(ServerConfig::default()).unwrap();
    server.register(Greeter, Registration::default()).unwrap();
    server.register(Greeter, Registration::default()).unwrap();
    assert!(matches!(
        server.initialize().await,
        Err(ServerError::NameConflict(_))
    ));

    let mut server = Server::new(ServerConfig::default()).unwrap();
    server.register(Greeter, Registration::default()).unwrap();
    server.register(Greeter, Registration::default().once()).unwrap();
    server.initialize().await.unwrap();
    assert_eq!(server.table().len(), 1);
}

#[tokio::test]
async fn test_missing_dependency() {
    let mut server = Server::new(ServerConfig::default()).unwrap();
    server.register(NeedsMissing, Registration::default()).unwrap();
    assert!(matches!(
        server.initialize().await,
        Err(ServerError::DependencyUnresolved(_))
    ));
}

#[test]
fn test_plugins_register_after_their_dependencies() {
    let order = registration_order(vec![queued("a", &["b"]), queued("b", &[]), queued("c", &[])])
        .unwrap();
    let names: Vec<&str> = order.iter().map(|(plugin, _)| plugin.name()).collect();
    assert_eq!(names, vec!["b", "a", "c"]);
}

#[test]
fn test_circular_plugin_dependencies() {
    match registration_order(vec![queued("a", &["b"]), queued("b", &["a"])]) {
        Err(ServerError::DependencyUnresolved(message)) => {
            assert!(message.contains("circular"));
            assert!(message.contains("a, b"));
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("cycle was not detected"),
    }
}

#[tokio::test]
async fn test_composition_is_frozen_after_initialize() {
    let mut server = server_with(vec![get("/", "root")]).await;
    assert_eq!(server.phase(), Phase::Initialized);
    assert!(matches!(
        server.route(get("/late", "late")),
        Err(ServerError::Frozen(_))
    ));
    assert!(matches!(
        server.register(Greeter, Registration::default()),
        Err(ServerError::Frozen(_))
    ));
}

#[tokio::test]
async fn test_select_labels() {
    let mut config = ServerConfig::default();
    config.listeners = vec![
        Listener {
            labels: vec!["api".to_string()],
        },
        Listener {
            labels: vec!["admin".to_string()],
        },
    ];
    let mut server = Server::new(config).unwrap();
    server
        .register(Greeter, Registration::default().select(&["admin"]))
        .unwrap();
    server.route(get("/status", "ok")).unwrap();
    server.initialize().await.unwrap();

    let [api, admin] = server.connections() else {
        panic!("expected two connections");
    };
    assert!(api.router.route("GET", None, "/hello").is_none());
    assert!(admin.router.route("GET", None, "/hello").is_some());
    assert!(api.router.route("GET", None, "/status").is_some());
    assert!(admin.router.route("GET", None, "/status").is_some());
}

#[tokio::test]
async fn test_conflict_on_one_listener_registers_nowhere() {
    let mut config = ServerConfig::default();
    config.listeners = vec![
        Listener {
            labels: vec!["api".to_string()],
        },
        Listener {
            labels: vec!["admin".to_string()],
        },
    ];
    let mut server = Server::new(config).unwrap();
    {
        let mut root = server.root().unwrap();
        root.select(&["admin"]);
        root.route(get("/status", "admin")).unwrap();
    }

    assert!(matches!(
        server.route(get("/status", "everywhere").id("status")),
        Err(ServerError::RouteConflict(_))
    ));
    server.route(get("/health", "ok").id("status")).unwrap();
    server.initialize().await.unwrap();

    let [api, admin] = server.connections() else {
        panic!("expected two connections");
    };
    assert!(api.router.route("GET", None, "/status").is_none());
    assert!(admin.router.route("GET", None, "/status").is_some());
    assert_eq!(server.lookup("status").map(|r| r.path.as_str()), Some("/health"));
    assert_eq!(server.table().len(), 2);
}

#[tokio::test]
async fn test_events_and_hooks() {
    let kinds = Arc::new(Mutex::new(Vec::new()));
    let calls = Arc::new(Mutex::new(Vec::new()));

    let mut server = Server::new(ServerConfig::default()).unwrap();
    {
        let kinds = kinds.clone();
        server
            .events()
            .on_any(move |event| kinds.lock().unwrap().push(event.kind()));
    }
    server.register(Hooks(calls.clone()), Registration::default()).unwrap();
    server.route(get("/", "root")).unwrap();
    server.initialize().await.unwrap();
    server.start().await.unwrap();
    server.inject("/").await.unwrap();
    server.stop().await.unwrap();

    assert_eq!(
        *kinds.lock().unwrap(),
        vec![
            EventKind::Route,
            EventKind::Start,
            EventKind::Response,
            EventKind::Stop
        ]
    );
    assert_eq!(
        *calls.lock().unwrap(),
        vec!["pre-start", "post-start", "pre-stop", "post-stop"]
    );
    assert_eq!(server.phase(), Phase::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_inflight_requests() {
    let entered = Arc::new(tokio::sync::Notify::new());

    let mut server = Server::new(ServerConfig::default()).unwrap();
    {
        let entered = entered.clone();
        server
            .route(RouteDef::get("/work").handler(handler_fn(move |_, _| {
                let entered = entered.clone();
                Box::pin(async move {
                    entered.notify_one();
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(Response::text("done"))
                })
            })))
            .unwrap();
    }
    server.initialize().await.unwrap();
    server.start().await.unwrap();

    let server = Arc::new(server);
    let inflight = {
        let server = server.clone();
        tokio::spawn(async move { server.inject("/work").await })
    };
    entered.notified().await;

    server.stop().await.unwrap();
    let response = inflight.await.unwrap().unwrap();
    assert_eq!(response.payload, "done");

    assert!(matches!(
        server.inject("/work").await,
        Err(ServerError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_cached_method_and_views() {
    let calls = Arc::new(AtomicUsize::new(0));

    let mut server = Server::new(ServerConfig::default()).unwrap();
    {
        let mut root = server.root().unwrap();
        let counter = calls.clone();
        root.method(
            "math.double",
            method_fn(move |args: JsonValue| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(json!(args.as_i64().unwrap_or_default() * 2)) }
            }),
            MethodOptions::cached(Duration::from_secs(60)),
        )
        .unwrap();
        root.views(|name: &str, context: &JsonValue| -> Result<String, RenderError> {
            match name {
                "hello" => Ok(format!("<p>Hello {}</p>", context["name"].as_str().unwrap_or(""))),
                _ => Err(RenderError(format!("unknown template {name}"))),
            }
        })
        .unwrap();
    }
    server
        .route(RouteDef::get("/hello/{name}").handler(handler_fn(|req, h| {
            Box::pin(async move {
                let doubled = h.method("math.double", json!(21)).await?;
                Ok(Response::view(
                    "hello",
                    json!({"name": format!("{} {doubled}", req.params["name"])}),
                ))
            })
        })))
        .unwrap();
    server.initialize().await.unwrap();

    assert_eq!(server.method("math.double", json!(21)).await.unwrap(), json!(42));
    let page = server.inject("/hello/ann").await.unwrap();
    assert_eq!(page.payload, "<p>Hello ann 42</p>");
    assert_eq!(page.header("content-type"), Some("text/html; charset=utf-8"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
