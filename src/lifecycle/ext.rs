//! Extension points and their ordering.

use std::{
    any::Any,
    cmp::Reverse,
    collections::{BinaryHeap, HashMap, HashSet},
    fmt,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use crate::{
    core::{Bind, Boom, Extension, Flow, Request, Response, ServerError, ServerResult, Toolkit},
    lifecycle::protect::protect_with_timeout,
    plugin::Realm,
    server::Shared,
};

/// Named interception points, in lifecycle order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExtPoint {
    OnRequest,
    OnPreAuth,
    OnCredentials,
    OnPostAuth,
    OnPreHandler,
    OnPostHandler,
    OnPreResponse,
    OnPostResponse,
}

impl ExtPoint {
    pub const ALL: [ExtPoint; 8] = [
        ExtPoint::OnRequest,
        ExtPoint::OnPreAuth,
        ExtPoint::OnCredentials,
        ExtPoint::OnPostAuth,
        ExtPoint::OnPreHandler,
        ExtPoint::OnPostHandler,
        ExtPoint::OnPreResponse,
        ExtPoint::OnPostResponse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExtPoint::OnRequest => "onRequest",
            ExtPoint::OnPreAuth => "onPreAuth",
            ExtPoint::OnCredentials => "onCredentials",
            ExtPoint::OnPostAuth => "onPostAuth",
            ExtPoint::OnPreHandler => "onPreHandler",
            ExtPoint::OnPostHandler => "onPostHandler",
            ExtPoint::OnPreResponse => "onPreResponse",
            ExtPoint::OnPostResponse => "onPostResponse",
        }
    }

    /// Points that run after routing and can be bound per route.
    pub fn is_route_level(&self) -> bool {
        *self != ExtPoint::OnRequest
    }
}

impl fmt::Display for ExtPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExtPoint {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExtPoint::ALL
            .iter()
            .find(|p| p.as_str() == s)
            .copied()
            .ok_or_else(|| ServerError::Configuration(format!("unknown extension point: {s}")))
    }
}

/// Which routes a plugin extension applies to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Sandbox {
    /// Every route of the server
    #[default]
    Server,
    /// Only routes registered by the same plugin realm
    Plugin,
}

#[derive(Clone, Default)]
pub struct ExtOptions {
    /// Plugins whose extensions must run after this one
    pub before: Vec<String>,
    /// Plugins whose extensions must run before this one
    pub after: Vec<String>,
    pub bind: Option<Bind>,
    pub sandbox: Sandbox,
    pub timeout: Option<Duration>,
}

impl ExtOptions {
    pub fn before(mut self, plugin: impl Into<String>) -> Self {
        self.before.push(plugin.into());
        self
    }

    pub fn after(mut self, plugin: impl Into<String>) -> Self {
        self.after.push(plugin.into());
        self
    }

    pub fn bind<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.bind = Some(Arc::new(value));
        self
    }

    pub fn sandbox(mut self, sandbox: Sandbox) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One function bound to one point
pub struct ExtBinding {
    pub(crate) point: ExtPoint,
    pub(crate) func: Arc<dyn Extension>,
    pub(crate) realm: Arc<Realm>,
    pub(crate) options: ExtOptions,
    /// Registration order, used to break ordering ties
    pub(crate) seq: usize,
}

impl ExtBinding {
    pub fn point(&self) -> ExtPoint {
        self.point
    }

    pub fn plugin(&self) -> &str {
        self.realm.name()
    }

    fn applies_to(&self, route_realm: Option<&Realm>) -> bool {
        match self.options.sandbox {
            Sandbox::Server => true,
            Sandbox::Plugin => route_realm.map_or(false, |r| r.id() == self.realm.id()),
        }
    }

    fn toolkit(&self, shared: &Arc<Shared>) -> Toolkit {
        let bind = self
            .options
            .bind
            .clone()
            .or_else(|| self.realm.bind.clone());
        Toolkit::new(shared.clone(), self.realm.clone(), bind)
    }
}

/// Sorted extension lists, one per point
#[derive(Default)]
pub struct ExtensionPipeline {
    points: HashMap<ExtPoint, Vec<Arc<ExtBinding>>>,
}

impl ExtensionPipeline {
    /// Orders every point's bindings so that `before`/`after` constraints
    /// hold, keeping registration order among unconstrained bindings.
    pub fn build(bindings: Vec<Arc<ExtBinding>>) -> ServerResult<Self> {
        let mut by_point: HashMap<ExtPoint, Vec<Arc<ExtBinding>>> = HashMap::new();
        for binding in bindings {
            by_point.entry(binding.point).or_default().push(binding);
        }

        let mut points = HashMap::new();
        for (point, list) in by_point {
            points.insert(point, sort_point(point, list)?);
        }

        Ok(Self { points })
    }

    pub fn bindings(&self, point: ExtPoint) -> &[Arc<ExtBinding>] {
        self.points.get(&point).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.points.values().all(Vec::is_empty)
    }

    /// Runs the server-level and route-level bindings of a point.
    ///
    /// Before onPreResponse the first substituted response or error ends the
    /// point. onPreResponse replaces `req.response` and keeps going unless
    /// the replacement is a takeover. onPostResponse failures are logged only.
    pub(crate) async fn run(
        &self,
        point: ExtPoint,
        route_ext: &[Arc<ExtBinding>],
        req: &mut Request,
        shared: &Arc<Shared>,
    ) -> Result<Flow, Boom> {
        let route_realm = req.route().map(|r| r.realm.clone());
        let expose = shared.config.debug.expose_errors;

        let bindings = self
            .bindings(point)
            .iter()
            .chain(route_ext.iter().filter(|b| b.point == point));

        for binding in bindings {
            if !binding.applies_to(route_realm.as_deref()) {
                continue;
            }

            let h = binding.toolkit(shared);
            let what = format!("{point} extension of {}", binding.plugin());
            let result =
                protect_with_timeout(&what, binding.options.timeout, binding.func.run(req, &h))
                    .await;

            match point {
                ExtPoint::OnPreResponse => match result {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Respond(response)) => {
                        let takeover = response.is_takeover();
                        req.response = Some(response);
                        if takeover {
                            break;
                        }
                    }
                    Err(boom) => {
                        log::warn!("request {} {what} failed: {boom}", req.id);
                        req.response = Some(Response::from_boom(boom, expose));
                    }
                },
                ExtPoint::OnPostResponse => {
                    if let Err(boom) = result {
                        log::warn!("request {} {what} failed: {boom}", req.id);
                    }
                }
                _ => match result? {
                    Flow::Continue => {}
                    flow @ Flow::Respond(_) => return Ok(flow),
                },
            }
        }

        Ok(Flow::Continue)
    }
}

fn sort_point(point: ExtPoint, list: Vec<Arc<ExtBinding>>) -> ServerResult<Vec<Arc<ExtBinding>>> {
    let count = list.len();
    let mut by_plugin: HashMap<&str, Vec<usize>> = HashMap::new();
    for (idx, binding) in list.iter().enumerate() {
        by_plugin.entry(binding.plugin()).or_default().push(idx);
    }

    // edges[a] contains b when a must run before b
    let mut edges: Vec<HashSet<usize>> = vec![HashSet::new(); count];
    for (idx, binding) in list.iter().enumerate() {
        let own = binding.plugin();
        for other in binding.options.before.iter().filter(|p| p.as_str() != own) {
            for &target in by_plugin.get(other.as_str()).into_iter().flatten() {
                edges[idx].insert(target);
            }
        }
        for other in binding.options.after.iter().filter(|p| p.as_str() != own) {
            for &source in by_plugin.get(other.as_str()).into_iter().flatten() {
                edges[source].insert(idx);
            }
        }
    }

    let mut incoming = vec![0usize; count];
    for targets in &edges {
        for &t in targets {
            incoming[t] += 1;
        }
    }

    let mut ready: BinaryHeap<Reverse<(usize, usize)>> = incoming
        .iter()
        .enumerate()
        .filter(|(_, &n)| n == 0)
        .map(|(idx, _)| Reverse((list[idx].seq, idx)))
        .collect();

    let mut order = Vec::with_capacity(count);
    while let Some(Reverse((_, idx))) = ready.pop() {
        order.push(idx);
        for &t in &edges[idx] {
            incoming[t] -= 1;
            if incoming[t] == 0 {
                ready.push(Reverse((list[t].seq, t)));
            }
        }
    }

    if order.len() != count {
        let stuck: Vec<&str> = incoming
            .iter()
            .enumerate()
            .filter(|(_, &n)| n > 0)
            .map(|(idx, _)| list[idx].plugin())
            .collect();
        return Err(ServerError::ExtensionCycle(format!(
            "{point} ordering between {}",
            stuck.join(", ")
        )));
    }

    Ok(order.into_iter().map(|idx| list[idx].clone()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ext_fn;

    fn binding(plugin: &str, seq: usize, options: ExtOptions) -> Arc<ExtBinding> {
        Arc::new(ExtBinding {
            point: ExtPoint::OnPreHandler,
            func: Arc::new(ext_fn(|_, _| Box::pin(async { Ok(Flow::Continue) }))),
            realm: Arc::new(Realm::for_plugin(seq + 1, plugin)),
            options,
            seq,
        })
    }

    fn order(pipeline: &ExtensionPipeline) -> Vec<&str> {
        pipeline
            .bindings(ExtPoint::OnPreHandler)
            .iter()
            .map(|b| b.plugin())
            .collect()
    }

    #[test]
    fn test_registration_order_is_kept() {
        let pipeline = ExtensionPipeline::build(vec![
            binding("a", 0, ExtOptions::default()),
            binding("b", 1, ExtOptions::default()),
            binding("c", 2, ExtOptions::default()),
        ])
        .unwrap();
        assert_eq!(order(&pipeline), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_before_and_after_constraints() {
        let pipeline = ExtensionPipeline::build(vec![
            binding("a", 0, ExtOptions::default().after("c")),
            binding("b", 1, ExtOptions::default()),
            binding("c", 2, ExtOptions::default().after("b")),
            binding("d", 3, ExtOptions::default().before("b")),
        ])
        .unwrap();
        assert_eq!(order(&pipeline), vec!["d", "b", "c", "a"]);
    }

    #[test]
    fn test_unknown_plugins_are_ignored() {
        let pipeline =
            ExtensionPipeline::build(vec![binding("a", 0, ExtOptions::default().before("zzz"))])
                .unwrap();
        assert_eq!(order(&pipeline), vec!["a"]);
    }

    #[test]
    fn test_cycle_is_fatal() {
        let result = ExtensionPipeline::build(vec![
            binding("a", 0, ExtOptions::default().before("b")),
            binding("b", 1, ExtOptions::default().before("a")),
        ]);
        assert!(matches!(result, Err(ServerError::ExtensionCycle(_))));
    }

    #[test]
    fn test_parse_point_names() {
        assert_eq!("onPreAuth".parse::<ExtPoint>().unwrap(), ExtPoint::OnPreAuth);
        assert!("onNothing".parse::<ExtPoint>().is_err());
        assert!(!ExtPoint::OnRequest.is_route_level());
    }
}
