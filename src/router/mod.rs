//! Route resolution.
//!
//! A [`Router`] keeps one segment tree per (vhost, method). Requests are
//! resolved against the vhost table selected by the `Host` header first and
//! the host-agnostic table second. Within a table the exact method is tried,
//! then `GET` for `HEAD` requests, then the `*` catch-all method.

pub mod template;
mod tree;
mod vhost;

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use crate::{
    config::RouterConfig,
    core::{ServerError, ServerResult},
    route_error,
};

pub use template::{Segment, Template};
use tree::Node;
use vhost::VhostIndex;

pub const ANY_METHOD: &str = "*";

#[derive(Debug, Clone, Copy)]
pub struct RouterSettings {
    pub case_sensitive: bool,
    pub strip_trailing_slash: bool,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            case_sensitive: true,
            strip_trailing_slash: false,
        }
    }
}

impl From<&RouterConfig> for RouterSettings {
    fn from(config: &RouterConfig) -> Self {
        Self {
            case_sensitive: config.is_case_sensitive,
            strip_trailing_slash: config.strip_trailing_slash,
        }
    }
}

struct Table<T> {
    vhost: Option<String>,
    methods: HashMap<String, Node<T>>,
    /// method → fingerprint → registered path
    fingerprints: HashMap<String, HashMap<String, String>>,
}

impl<T> Table<T> {
    fn new(vhost: Option<String>) -> Self {
        Self {
            vhost,
            methods: HashMap::new(),
            fingerprints: HashMap::new(),
        }
    }

    fn conflict(&self, method: &str, prints: &[String]) -> Option<&str> {
        let known = self.fingerprints.get(method)?;
        prints
            .iter()
            .find_map(|fp| known.get(fp))
            .map(String::as_str)
    }
}

/// A resolved route with the raw (still percent-encoded) parameters.
#[derive(Debug)]
pub struct RouteMatch<'a, T> {
    pub value: &'a T,
    pub params: BTreeMap<String, String>,
    pub template: &'a str,
    pub vhost: Option<&'a str>,
}

pub struct Router<T> {
    settings: RouterSettings,
    default: Table<T>,
    vhosts: VhostIndex,
    tables: Vec<Table<T>>,
    entries: Vec<T>,
}

impl<T: Clone> Router<T> {
    pub fn new(settings: RouterSettings) -> Self {
        Self {
            settings,
            default: Table::new(None),
            vhosts: VhostIndex::default(),
            tables: Vec::new(),
            entries: Vec::new(),
        }
    }

    pub fn settings(&self) -> RouterSettings {
        self.settings
    }

    /// Registers `value` under `method` and `path` for each vhost (or the
    /// host-agnostic table when `vhosts` is empty).
    ///
    /// Fails with [`ServerError::RouteConflict`] when the template has the
    /// same specificity as an existing route of the same method and vhost.
    pub fn add(&mut self, method: &str, path: &str, vhosts: &[String], value: T) -> ServerResult<()> {
        let method = normalize_method(method)?;
        let template = Arc::new(Template::parse(path, self.settings.case_sensitive)?);
        let prints = template.fingerprints();
        let targets = targets(vhosts);

        // Check every target before touching any of them.
        self.check_targets(&method, path, &prints, &targets)?;

        for vhost in targets {
            let table = match vhost {
                None => &mut self.default,
                Some(host) => {
                    let idx = match self.vhosts.get(&host) {
                        Some(idx) => idx,
                        None => {
                            let idx = self.tables.len();
                            self.vhosts
                                .insert(&host, idx)
                                .map_err(|e| route_error!("invalid vhost {}: {}", host, e))?;
                            self.tables.push(Table::new(Some(host)));
                            idx
                        }
                    };
                    &mut self.tables[idx]
                }
            };

            let inserted = table
                .methods
                .entry(method.clone())
                .or_default()
                .insert(&template, value.clone());
            if !inserted {
                return Err(ServerError::RouteConflict(format!(
                    "{method} {path} is already registered"
                )));
            }

            let known = table.fingerprints.entry(method.clone()).or_default();
            for fp in &prints {
                known.insert(fp.clone(), path.to_string());
            }
        }

        self.entries.push(value);
        Ok(())
    }

    /// Reports the error [`Router::add`] would return, without registering
    /// anything.
    pub fn check(&self, method: &str, path: &str, vhosts: &[String]) -> ServerResult<()> {
        let method = normalize_method(method)?;
        let template = Template::parse(path, self.settings.case_sensitive)?;
        self.check_targets(&method, path, &template.fingerprints(), &targets(vhosts))
    }

    fn check_targets(
        &self,
        method: &str,
        path: &str,
        prints: &[String],
        targets: &[Option<String>],
    ) -> ServerResult<()> {
        for vhost in targets {
            let table = match vhost {
                None => Some(&self.default),
                Some(host) => self.vhosts.get(host).map(|idx| &self.tables[idx]),
            };
            if let Some(existing) = table.and_then(|t| t.conflict(method, prints)) {
                return Err(ServerError::RouteConflict(format!(
                    "{method} {path} conflicts with {existing}{}",
                    vhost
                        .as_deref()
                        .map(|h| format!(" (vhost {h})"))
                        .unwrap_or_default()
                )));
            }
        }
        Ok(())
    }

    /// Every registered value, in registration order.
    pub fn table(&self) -> &[T] {
        &self.entries
    }
}

impl<T> Router<T> {
    /// Resolves `(method, host, path)` to the most specific route.
    pub fn route(&self, method: &str, host: Option<&str>, path: &str) -> Option<RouteMatch<'_, T>> {
        let path = self.normalize_path(path);
        let segments: Vec<&str> = if path == "/" || path.is_empty() {
            Vec::new()
        } else {
            path.trim_start_matches('/').split('/').collect()
        };

        let method = method.to_ascii_uppercase();
        let mut methods = vec![method.as_str()];
        if method == "HEAD" {
            methods.push("GET");
        }
        methods.push(ANY_METHOD);

        let vhost_table = host
            .filter(|_| !self.vhosts.is_empty())
            .and_then(|h| self.vhosts.find(h))
            .map(|idx| &self.tables[idx]);

        for table in vhost_table.into_iter().chain(std::iter::once(&self.default)) {
            for m in &methods {
                let Some(node) = table.methods.get(*m) else {
                    continue;
                };
                let mut captures = Vec::new();
                if let Some(leaf) = node.find(&segments, self.settings.case_sensitive, &mut captures)
                {
                    let params = leaf
                        .template
                        .param_names()
                        .zip(captures)
                        .map(|(name, value)| (name.to_string(), value))
                        .collect();
                    return Some(RouteMatch {
                        value: &leaf.value,
                        params,
                        template: leaf.template.path(),
                        vhost: table.vhost.as_deref(),
                    });
                }
            }
        }

        None
    }

    fn normalize_path<'a>(&self, path: &'a str) -> &'a str {
        if self.settings.strip_trailing_slash && path.len() > 1 && path.ends_with('/') {
            &path[..path.len() - 1]
        } else {
            path
        }
    }
}

/// Lowercased vhosts without repeats, or the host-agnostic table.
fn targets(vhosts: &[String]) -> Vec<Option<String>> {
    if vhosts.is_empty() {
        return vec![None];
    }
    let mut targets = Vec::with_capacity(vhosts.len());
    for host in vhosts {
        let host = Some(host.to_ascii_lowercase());
        if !targets.contains(&host) {
            targets.push(host);
        }
    }
    targets
}

fn normalize_method(method: &str) -> ServerResult<String> {
    let method = method.trim().to_ascii_uppercase();
    if method == ANY_METHOD {
        return Ok(method);
    }
    http::Method::from_bytes(method.as_bytes())
        .map_err(|_| route_error!("invalid method '{}'", method))?;
    Ok(method)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> Router<&'static str> {
        Router::new(RouterSettings::default())
    }

    #[test]
    fn test_most_specific_route_wins() {
        let mut r = router();
        r.add("GET", "/users/{id}", &[], "param").unwrap();
        r.add("GET", "/users/me", &[], "literal").unwrap();
        r.add("GET", "/users/{rest*}", &[], "wildcard").unwrap();

        let m = r.route("GET", None, "/users/me").unwrap();
        assert_eq!(*m.value, "literal");

        let m = r.route("GET", None, "/users/42").unwrap();
        assert_eq!(*m.value, "param");
        assert_eq!(m.params.get("id").map(String::as_str), Some("42"));

        let m = r.route("GET", None, "/users/42/posts").unwrap();
        assert_eq!(*m.value, "wildcard");
        assert_eq!(m.params.get("rest").map(String::as_str), Some("42/posts"));

        assert!(r.route("POST", None, "/users/me").is_none());
    }

    #[test]
    fn test_optional_tail_conflict() {
        let mut r = router();
        r.add("GET", "/a", &[], "a").unwrap();
        let err = r.add("GET", "/a/{p?}", &[], "b").unwrap_err();
        assert!(matches!(err, ServerError::RouteConflict(_)));

        let mut r = router();
        r.add("GET", "/a/{p?}", &[], "b").unwrap();
        let err = r.add("GET", "/a", &[], "a").unwrap_err();
        assert!(matches!(err, ServerError::RouteConflict(_)));

        // Different methods never conflict.
        r.add("POST", "/a", &[], "post").unwrap();
    }

    #[test]
    fn test_equivalent_params_conflict() {
        let mut r = router();
        r.add("GET", "/a/{x}", &[], "x").unwrap();
        assert!(r.add("GET", "/a/{y}", &[], "y").is_err());
        assert!(r.add("get", "/a/{z}", &[], "z").is_err());
    }

    #[test]
    fn test_repeated_vhost_registers_once() {
        let mut r = router();
        let hosts = vec!["a.com".to_string(), "A.com".to_string()];
        r.add("GET", "/x", &hosts, "x").unwrap();
        assert_eq!(r.table(), &["x"]);
        assert_eq!(*r.route("GET", Some("a.com"), "/x").unwrap().value, "x");

        assert!(r.check("GET", "/x", &hosts).is_err());
        assert!(r.check("GET", "/x", &[]).is_ok());
    }

    #[test]
    fn test_vhost_before_default() {
        let mut r = router();
        r.add("GET", "/", &[], "default").unwrap();
        r.add("GET", "/", &["api.example.com".to_string()], "api").unwrap();
        r.add("GET", "/", &["*.example.com".to_string()], "wild").unwrap();
        r.add("GET", "/only-default", &[], "only").unwrap();

        assert_eq!(*r.route("GET", Some("api.example.com"), "/").unwrap().value, "api");
        assert_eq!(*r.route("GET", Some("x.example.com"), "/").unwrap().value, "wild");
        assert_eq!(*r.route("GET", Some("other.com"), "/").unwrap().value, "default");
        assert_eq!(*r.route("GET", None, "/").unwrap().value, "default");

        let m = r.route("GET", Some("api.example.com"), "/only-default").unwrap();
        assert_eq!(*m.value, "only");
        assert_eq!(m.vhost, None);
    }

    #[test]
    fn test_same_path_in_different_vhosts() {
        let mut r = router();
        r.add("GET", "/x", &["a.com".to_string()], "a").unwrap();
        r.add("GET", "/x", &["b.com".to_string()], "b").unwrap();
        assert!(r.add("GET", "/x", &["a.com".to_string()], "a2").is_err());
        assert_eq!(r.table().len(), 2);
    }

    #[test]
    fn test_head_falls_back_to_get_then_any() {
        let mut r = router();
        r.add("GET", "/page", &[], "get").unwrap();
        r.add("*", "/any", &[], "any").unwrap();

        assert_eq!(*r.route("HEAD", None, "/page").unwrap().value, "get");
        assert_eq!(*r.route("DELETE", None, "/any").unwrap().value, "any");

        r.add("HEAD", "/page", &[], "head").unwrap();
        assert_eq!(*r.route("HEAD", None, "/page").unwrap().value, "head");
    }

    #[test]
    fn test_trailing_slash_and_case() {
        let mut r = Router::new(RouterSettings {
            case_sensitive: false,
            strip_trailing_slash: true,
        });
        r.add("GET", "/Docs", &[], "docs").unwrap();
        assert_eq!(*r.route("GET", None, "/docs/").unwrap().value, "docs");
        assert_eq!(*r.route("GET", None, "/DOCS").unwrap().value, "docs");

        let strict = router();
        assert!(strict.route("GET", None, "/docs").is_none());
    }

    #[test]
    fn test_invalid_method() {
        let mut r = router();
        assert!(r.add("GE T", "/", &[], "x").is_err());
    }
}
