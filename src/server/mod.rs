//! Server composition and control.
//!
//! A [`Server`] is composed in three steps: plugins are queued with
//! [`Server::register`], [`Server::initialize`] registers them in dependency
//! order and freezes the result, and [`Server::start`] / [`Server::stop`]
//! control request acceptance. Everything the lifecycle reads at request
//! time lives in the frozen [`Shared`] state.

pub mod inject;

#[cfg(test)]
mod tests;

use std::{
    any::Any,
    cmp::Reverse,
    collections::{BinaryHeap, HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::future::BoxFuture;
use serde_json::Value as JsonValue;
use tokio::sync::Notify;

use crate::{
    cache::MemoryCache,
    config::ServerConfig,
    core::{Boom, Encoder, Extension, ServerError, ServerHook, ServerResult, Toolkit},
    events::{Event, Events},
    lifecycle::{
        self,
        auth::AuthRegistry,
        ext::{ExtBinding, ExtOptions, ExtPoint, ExtensionPipeline, Sandbox},
        transmit::{Outbound, TransmitOutcome, Transmitter},
        Incoming,
    },
    logging::LogSink,
    methods::Methods,
    plugin::{HookPoint, Plugin, PluginScope, Realm, Registration},
    route::{Route, RouteDef},
    router::{Router, RouterSettings},
    views::TemplateEngine,
};

pub use inject::{InjectOptions, InjectResponse};

const METHOD_CACHE_ITEMS: usize = 10_000;

type Exposed = HashMap<String, HashMap<String, Arc<dyn Any + Send + Sync>>>;

struct Hook {
    point: HookPoint,
    func: Arc<dyn ServerHook>,
    realm: Arc<Realm>,
}

struct PendingConnection {
    labels: Vec<String>,
    router: Router<Arc<Route>>,
}

/// Mutable composition state, consumed when the server initializes
pub(crate) struct Composer {
    pub(crate) config: ServerConfig,
    pub(crate) events: Events,
    pub(crate) exposed: Exposed,
    pub(crate) auth: AuthRegistry,
    pub(crate) methods: Methods,
    pub(crate) views: Option<Arc<dyn TemplateEngine>>,
    pub(crate) encoders: Vec<(String, Arc<dyn Encoder>)>,
    root: Arc<Realm>,
    next_realm: usize,
    seq: usize,
    routes: Vec<Arc<Route>>,
    ids: HashSet<String>,
    connections: Vec<PendingConnection>,
    bindings: Vec<Arc<ExtBinding>>,
    hooks: Vec<Hook>,
    registered: HashMap<String, String>,
    required: Vec<(String, String)>,
}

impl Composer {
    fn new(config: ServerConfig, events: Events) -> Self {
        let settings = RouterSettings::from(&config.router);
        let connections = config
            .connection_labels()
            .into_iter()
            .map(|labels| PendingConnection {
                labels,
                router: Router::new(settings),
            })
            .collect();

        Self {
            config,
            events,
            exposed: HashMap::new(),
            auth: AuthRegistry::default(),
            methods: Methods::new(Arc::new(MemoryCache::with_max_items(METHOD_CACHE_ITEMS))),
            views: None,
            encoders: Vec::new(),
            root: Arc::new(Realm::root()),
            next_realm: 0,
            seq: 0,
            routes: Vec::new(),
            ids: HashSet::new(),
            connections,
            bindings: Vec::new(),
            hooks: Vec::new(),
            registered: HashMap::new(),
            required: Vec::new(),
        }
    }

    pub(crate) fn add_route(&mut self, def: RouteDef, realm: &Arc<Realm>) -> ServerResult<()> {
        let route = Arc::new(def.build(realm, &self.config.routes, &mut self.seq)?);

        if let Some(id) = &route.id {
            if self.ids.contains(id) {
                return Err(ServerError::NameConflict(format!(
                    "route id {id} is already used"
                )));
            }
        }

        // Nothing is recorded unless every selected connection accepts it.
        for conn in self.connections.iter().filter(|c| realm.selects(&c.labels)) {
            conn.router.check(&route.method, &route.path, &route.vhost)?;
        }
        if let Some(id) = &route.id {
            self.ids.insert(id.clone());
        }

        let mut selected = 0;
        for conn in self
            .connections
            .iter_mut()
            .filter(|c| realm.selects(&c.labels))
        {
            conn.router
                .add(&route.method, &route.path, &route.vhost, route.clone())?;
            selected += 1;
        }
        if selected == 0 {
            log::warn!("Route {route} of {} selects no listener", realm.name());
        }

        log::info!("Adding route {route} ({})", realm.name());
        self.events.emit(&Event::Route {
            method: route.method.clone(),
            path: route.path.clone(),
            vhost: route.vhost.clone(),
            plugin: realm.plugin().map(str::to_string),
        });
        self.routes.push(route);
        Ok(())
    }

    pub(crate) fn add_ext(
        &mut self,
        point: ExtPoint,
        func: Arc<dyn Extension>,
        options: ExtOptions,
        realm: &Arc<Realm>,
    ) -> ServerResult<()> {
        if point == ExtPoint::OnRequest && options.sandbox == Sandbox::Plugin {
            return Err(ServerError::Configuration(format!(
                "{point} extension of {} cannot be sandboxed, it runs before routing",
                realm.name()
            )));
        }

        log::debug!("Adding {point} extension of {}", realm.name());
        self.bindings.push(Arc::new(ExtBinding {
            point,
            func,
            realm: realm.clone(),
            options,
            seq: self.seq,
        }));
        self.seq += 1;
        Ok(())
    }

    pub(crate) fn add_hook(&mut self, point: HookPoint, func: Arc<dyn ServerHook>, realm: &Arc<Realm>) {
        self.hooks.push(Hook {
            point,
            func,
            realm: realm.clone(),
        });
    }

    pub(crate) fn expose(
        &mut self,
        namespace: &str,
        key: &str,
        value: Arc<dyn Any + Send + Sync>,
    ) -> ServerResult<()> {
        let entries = self.exposed.entry(namespace.to_string()).or_default();
        if entries.contains_key(key) {
            return Err(ServerError::NameConflict(format!(
                "{namespace} already exposes {key}"
            )));
        }
        entries.insert(key.to_string(), value);
        Ok(())
    }

    pub(crate) fn require(&mut self, plugin: String, dependency: String) {
        self.required.push((plugin, dependency));
    }

    /// Registers a plugin under `parent`, recursively for nested plugins.
    pub(crate) fn register_plugin(
        &mut self,
        plugin: Arc<dyn Plugin>,
        registration: Registration,
        parent: Arc<Realm>,
    ) -> BoxFuture<'_, ServerResult<()>> {
        Box::pin(async move {
            let name = plugin.name().to_string();
            let version = plugin.version().to_string();

            if let Some(existing) = self.registered.get(&name) {
                if registration.once {
                    log::debug!("Plugin {name}@{existing} already registered, skipping");
                    return Ok(());
                }
                if !plugin.multiple() {
                    return Err(ServerError::NameConflict(format!(
                        "plugin {name}@{existing} is already registered"
                    )));
                }
            }

            self.next_realm += 1;
            let mut realm = Realm::child(self.next_realm, &parent, &name, &version, &registration);
            for dependency in plugin.dependencies() {
                realm.dependencies.push(dependency.clone());
                self.required.push((name.clone(), dependency));
            }
            self.registered.insert(name.clone(), version.clone());

            log::info!("Registering plugin {name}@{version}");
            let mut scope = PluginScope::new(self, Arc::new(realm));
            plugin
                .register(&mut scope, registration.options)
                .await
                .map_err(|e| {
                    if e.is_composition_error() {
                        e
                    } else {
                        ServerError::Registration(format!("plugin {name}: {e}"))
                    }
                })
        })
    }

    fn check_dependencies(&self) -> ServerResult<()> {
        for (plugin, dependency) in &self.required {
            if !self.registered.contains_key(dependency) {
                return Err(ServerError::DependencyUnresolved(format!(
                    "plugin {plugin} requires {dependency}, which is not registered"
                )));
            }
        }
        Ok(())
    }

    /// Settles route authentication and orders extensions, producing the
    /// immutable request-time state.
    fn freeze(self) -> ServerResult<Shared> {
        for route in &self.routes {
            let auth = self.auth.resolve(route.auth_def());
            if let Some(auth) = &auth {
                self.auth.verify(auth, &route.to_string())?;
            }
            route.settle_auth(auth);
        }

        let mut connections = Vec::with_capacity(self.connections.len());
        for conn in self.connections {
            let bindings = self
                .bindings
                .iter()
                .filter(|b| b.realm.selects(&conn.labels))
                .cloned()
                .collect();
            connections.push(Connection {
                labels: conn.labels,
                router: conn.router,
                pipeline: ExtensionPipeline::build(bindings)?,
            });
        }

        let transmitter = Transmitter::new(
            self.encoders,
            self.views,
            self.config.compression.min_bytes,
            self.config.debug.expose_errors,
        );

        Ok(Shared {
            config: self.config,
            connections,
            exposed: self.exposed,
            methods: self.methods,
            events: self.events,
            transmitter,
            auth: self.auth,
            routes: self.routes,
            hooks: self.hooks,
            inflight: AtomicUsize::new(0),
            drained: Notify::new(),
            accepting: AtomicBool::new(true),
        })
    }
}

/// One composed listener: its routing table and extension pipeline
pub struct Connection {
    pub labels: Vec<String>,
    pub(crate) router: Router<Arc<Route>>,
    pub(crate) pipeline: ExtensionPipeline,
}

/// Frozen server state shared by every request
pub(crate) struct Shared {
    pub(crate) config: ServerConfig,
    pub(crate) connections: Vec<Connection>,
    pub(crate) exposed: Exposed,
    pub(crate) methods: Methods,
    pub(crate) events: Events,
    pub(crate) transmitter: Transmitter,
    pub(crate) auth: AuthRegistry,
    pub(crate) routes: Vec<Arc<Route>>,
    hooks: Vec<Hook>,
    inflight: AtomicUsize,
    drained: Notify,
    accepting: AtomicBool,
}

impl Shared {
    async fn run_hooks(self: &Arc<Self>, point: HookPoint) -> ServerResult<()> {
        for hook in self.hooks.iter().filter(|h| h.point == point) {
            log::debug!("Running {point} hook of {}", hook.realm.name());
            let h = Toolkit::new(self.clone(), hook.realm.clone(), hook.realm.bind.clone());
            hook.func.run(&h).await?;
        }
        Ok(())
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.drained.notified();
            if self.inflight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Tracks one in-flight request.
struct InflightGuard<'a>(&'a Shared);

impl<'a> InflightGuard<'a> {
    fn new(shared: &'a Shared) -> Self {
        shared.inflight.fetch_add(1, Ordering::AcqRel);
        Self(shared)
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if self.0.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Composing,
    Initialized,
    Started,
    Stopped,
}

pub struct Server {
    events: Events,
    composer: Option<Composer>,
    queue: Vec<(Arc<dyn Plugin>, Registration)>,
    shared: Option<Arc<Shared>>,
    phase: Mutex<Phase>,
    log_sink: Mutex<Option<LogSink>>,
}

impl Server {
    /// # Errors
    /// Returns `Configuration` when the configuration fails validation.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        use validator::Validate;
        config.validate()?;

        let events = Events::default();
        Ok(Self {
            composer: Some(Composer::new(config, events.clone())),
            events,
            queue: Vec::new(),
            shared: None,
            phase: Mutex::new(Phase::Composing),
            log_sink: Mutex::new(None),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase.lock().map(|p| *p).unwrap_or(Phase::Stopped)
    }

    fn set_phase(&self, phase: Phase) {
        if let Ok(mut current) = self.phase.lock() {
            *current = phase;
        }
    }

    pub fn events(&self) -> &Events {
        &self.events
    }

    pub fn settings(&self) -> Option<&ServerConfig> {
        match (&self.composer, &self.shared) {
            (_, Some(shared)) => Some(&shared.config),
            (Some(composer), None) => Some(&composer.config),
            (None, None) => None,
        }
    }

    fn composer(&mut self) -> ServerResult<&mut Composer> {
        self.composer
            .as_mut()
            .ok_or_else(|| ServerError::Frozen("server composition is complete".to_string()))
    }

    fn shared(&self) -> ServerResult<&Arc<Shared>> {
        self.shared
            .as_ref()
            .ok_or_else(|| ServerError::Configuration("server is not initialized".to_string()))
    }

    /// Queues a plugin. Plugins register during [`Server::initialize`], in
    /// dependency order.
    pub fn register(&mut self, plugin: impl Plugin + 'static, registration: Registration) -> ServerResult<()> {
        self.register_shared(Arc::new(plugin), registration)
    }

    pub fn register_shared(
        &mut self,
        plugin: Arc<dyn Plugin>,
        registration: Registration,
    ) -> ServerResult<()> {
        self.composer()?;
        self.queue.push((plugin, registration));
        Ok(())
    }

    /// Registration scope of the server itself.
    pub fn root(&mut self) -> ServerResult<PluginScope<'_>> {
        let composer = self.composer()?;
        let realm = composer.root.clone();
        Ok(PluginScope::new(composer, realm))
    }

    pub fn route(&mut self, def: RouteDef) -> ServerResult<()> {
        self.root()?.route(def)
    }

    pub fn ext(&mut self, point: ExtPoint, ext: impl Extension + 'static) -> ServerResult<()> {
        self.root()?.ext(point, ext)
    }

    /// Registers every queued plugin, verifies dependencies, freezes the
    /// server and runs the onPreStart hooks.
    ///
    /// # Errors
    /// Any composition error. A server that failed to initialize cannot be
    /// used.
    pub async fn initialize(&mut self) -> ServerResult<()> {
        let mut composer = self
            .composer
            .take()
            .ok_or_else(|| ServerError::Frozen("server is already initialized".to_string()))?;

        if let Ok(mut sink) = self.log_sink.lock() {
            *sink = LogSink::install(composer.config.log.as_ref());
        }

        for (plugin, registration) in registration_order(std::mem::take(&mut self.queue))? {
            let root = composer.root.clone();
            composer.register_plugin(plugin, registration, root).await?;
        }
        composer.check_dependencies()?;

        let shared = Arc::new(composer.freeze()?);
        self.shared = Some(shared.clone());
        shared.run_hooks(HookPoint::OnPreStart).await?;

        log::info!(
            "Server initialized with {} routes on {} connections",
            shared.routes.len(),
            shared.connections.len()
        );
        self.set_phase(Phase::Initialized);
        Ok(())
    }

    pub async fn start(&self) -> ServerResult<()> {
        let shared = self.shared()?;
        if self.phase() != Phase::Initialized {
            return Err(ServerError::Configuration(format!(
                "cannot start a server in phase {:?}",
                self.phase()
            )));
        }

        shared.run_hooks(HookPoint::OnPostStart).await?;
        self.set_phase(Phase::Started);
        log::info!("Server started");
        self.events.emit(&Event::Start);
        Ok(())
    }

    /// Stops accepting requests and waits for in-flight ones, up to
    /// `load.stop_timeout_ms`.
    pub async fn stop(&self) -> ServerResult<()> {
        let shared = self.shared()?;
        if !matches!(self.phase(), Phase::Initialized | Phase::Started) {
            return Err(ServerError::Configuration(
                "server is not running".to_string(),
            ));
        }

        shared.run_hooks(HookPoint::OnPreStop).await?;
        shared.accepting.store(false, Ordering::Release);

        let limit = Duration::from_millis(shared.config.load.stop_timeout_ms);
        let drained = tokio::time::timeout(limit, shared.wait_idle()).await;
        if drained.is_err() {
            log::warn!(
                "Stopping with {} requests still in flight",
                shared.inflight.load(Ordering::Acquire)
            );
        }

        shared.run_hooks(HookPoint::OnPostStop).await?;
        self.set_phase(Phase::Stopped);
        log::info!("Server stopped");
        self.events.emit(&Event::Stop);

        let sink = self.log_sink.lock().ok().and_then(|mut sink| sink.take());
        if let Some(sink) = sink {
            sink.close().await?;
        }
        Ok(())
    }

    /// Runs a request through the first connection.
    pub async fn dispatch(
        &self,
        incoming: Incoming,
        out: &mut dyn Outbound,
    ) -> ServerResult<TransmitOutcome> {
        self.dispatch_on(0, incoming, out).await
    }

    /// Runs a request through the connection at `index`.
    pub async fn dispatch_on(
        &self,
        index: usize,
        incoming: Incoming,
        out: &mut dyn Outbound,
    ) -> ServerResult<TransmitOutcome> {
        let shared = self.shared()?;
        if !shared.accepting.load(Ordering::Acquire) {
            return Err(ServerError::Configuration(
                "server is not accepting requests".to_string(),
            ));
        }
        let conn = shared.connections.get(index).ok_or_else(|| {
            ServerError::Configuration(format!("no connection at index {index}"))
        })?;

        let _guard = InflightGuard::new(shared);
        Ok(lifecycle::execute(shared, conn, incoming, out).await)
    }

    pub fn connections(&self) -> &[Connection] {
        self.shared
            .as_ref()
            .map(|s| s.connections.as_slice())
            .unwrap_or(&[])
    }

    /// Every composed route in registration order.
    pub fn table(&self) -> &[Arc<Route>] {
        match (&self.shared, &self.composer) {
            (Some(shared), _) => &shared.routes,
            (None, Some(composer)) => &composer.routes,
            (None, None) => &[],
        }
    }

    pub fn lookup(&self, id: &str) -> Option<&Arc<Route>> {
        self.table().iter().find(|r| r.id.as_deref() == Some(id))
    }

    /// Resolves a route on the first connection without running it.
    pub fn match_route(&self, method: &str, path: &str, host: Option<&str>) -> Option<Arc<Route>> {
        let router = match (&self.shared, &self.composer) {
            (Some(shared), _) => shared.connections.first().map(|c| &c.router),
            (None, Some(composer)) => composer.connections.first().map(|c| &c.router),
            (None, None) => None,
        }?;
        router
            .route(method, host.map(str::to_ascii_lowercase).as_deref(), path)
            .map(|m| m.value.clone())
    }

    /// A value exposed by a plugin.
    pub fn exposed<T: Any>(&self, plugin: &str, key: &str) -> Option<&T> {
        let exposed = match (&self.shared, &self.composer) {
            (Some(shared), _) => &shared.exposed,
            (None, Some(composer)) => &composer.exposed,
            (None, None) => return None,
        };
        exposed
            .get(plugin)
            .and_then(|ns| ns.get(key))
            .and_then(|v| v.downcast_ref::<T>())
    }

    /// Calls a server method.
    pub async fn method(&self, name: &str, args: JsonValue) -> Result<JsonValue, Boom> {
        let shared = self
            .shared()
            .map_err(|e| Boom::internal(e.to_string()))?;
        shared.methods.call(name, args).await
    }
}

/// Orders queued plugins so that dependencies register first. Ties keep
/// queue order. Dependencies outside the queue are checked after
/// registration, since nested plugins may provide them.
fn registration_order(
    queue: Vec<(Arc<dyn Plugin>, Registration)>,
) -> ServerResult<Vec<(Arc<dyn Plugin>, Registration)>> {
    let count = queue.len();
    let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, (plugin, _)) in queue.iter().enumerate() {
        by_name.entry(plugin.name().to_string()).or_default().push(idx);
    }

    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); count];
    let mut incoming = vec![0usize; count];
    for (idx, (plugin, _)) in queue.iter().enumerate() {
        for dependency in plugin.dependencies() {
            if dependency == plugin.name() {
                continue;
            }
            for &source in by_name.get(&dependency).into_iter().flatten() {
                edges[source].push(idx);
                incoming[idx] += 1;
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = incoming
        .iter()
        .enumerate()
        .filter(|(_, &n)| n == 0)
        .map(|(idx, _)| Reverse(idx))
        .collect();

    let mut order = Vec::with_capacity(count);
    while let Some(Reverse(idx)) = ready.pop() {
        order.push(idx);
        for &t in &edges[idx] {
            incoming[t] -= 1;
            if incoming[t] == 0 {
                ready.push(Reverse(t));
            }
        }
    }

    if order.len() != count {
        let stuck: Vec<&str> = incoming
            .iter()
            .enumerate()
            .filter(|(_, &n)| n > 0)
            .map(|(idx, _)| queue[idx].0.name())
            .collect();
        return Err(ServerError::DependencyUnresolved(format!(
            "circular plugin dependencies between {}",
            stuck.join(", ")
        )));
    }

    let mut slots: Vec<Option<(Arc<dyn Plugin>, Registration)>> =
        queue.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .filter_map(|idx| slots[idx].take())
        .collect())
}
