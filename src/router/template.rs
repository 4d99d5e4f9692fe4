//! Path template parsing.
//!
//! A template is split on `/` into segments. Dynamic segments are written in
//! braces: `{name}`, `{name?}` (last segment only), `{name*}` (last segment
//! only, consumes the rest of the path) and `{name*N}` (exactly N segments).

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{core::ServerResult, route_error};

static PARAM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\{(?P<name>\w+)(?:(?P<optional>\?)|\*(?P<count>\d+)?(?P<wild>))?\}$")
        .expect("static regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Param(String),
    Optional(String),
    Multi { name: String, count: usize },
    Wildcard(String),
}

impl Segment {
    pub fn name(&self) -> Option<&str> {
        match self {
            Segment::Literal(_) => None,
            Segment::Param(name)
            | Segment::Optional(name)
            | Segment::Wildcard(name)
            | Segment::Multi { name, .. } => Some(name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Template {
    path: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(path: &str, case_sensitive: bool) -> ServerResult<Self> {
        if !path.starts_with('/') {
            return Err(route_error!("path must start with '/': {}", path));
        }

        let raw: Vec<&str> = if path == "/" {
            Vec::new()
        } else {
            path[1..].split('/').collect()
        };

        let mut segments = Vec::with_capacity(raw.len());
        let mut names: Vec<String> = Vec::new();

        for (i, part) in raw.iter().enumerate() {
            let is_last = i + 1 == raw.len();

            if !part.contains('{') && !part.contains('}') {
                if part.is_empty() && !is_last {
                    return Err(route_error!("empty path segment in {}", path));
                }
                let literal = if case_sensitive {
                    part.to_string()
                } else {
                    part.to_ascii_lowercase()
                };
                segments.push(Segment::Literal(literal));
                continue;
            }

            let caps = PARAM_RE
                .captures(part)
                .ok_or_else(|| route_error!("invalid path segment '{}' in {}", part, path))?;
            let name = caps["name"].to_string();

            if names.contains(&name) {
                return Err(route_error!("duplicate parameter '{}' in {}", name, path));
            }
            names.push(name.clone());

            let segment = if caps.name("optional").is_some() {
                if !is_last {
                    return Err(route_error!(
                        "optional parameter must be the last segment: {}",
                        path
                    ));
                }
                Segment::Optional(name)
            } else if let Some(count) = caps.name("count") {
                let count: usize = count
                    .as_str()
                    .parse()
                    .map_err(|_| route_error!("invalid segment count in {}", path))?;
                if count == 0 {
                    return Err(route_error!("segment count must be positive: {}", path));
                }
                if count == 1 {
                    Segment::Param(name)
                } else {
                    Segment::Multi { name, count }
                }
            } else if caps.name("wild").is_some() {
                if !is_last {
                    return Err(route_error!(
                        "wildcard parameter must be the last segment: {}",
                        path
                    ));
                }
                Segment::Wildcard(name)
            } else {
                Segment::Param(name)
            };
            segments.push(segment);
        }

        Ok(Self {
            path: path.to_string(),
            segments,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Names of the dynamic segments, in order.
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(Segment::name)
    }

    /// Specificity fingerprints used for conflict detection.
    ///
    /// Parameters are reduced to `?`, wildcards to `#`. A template ending with
    /// an optional segment yields two fingerprints: with and without the tail.
    pub fn fingerprints(&self) -> Vec<String> {
        let mut parts: Vec<String> = Vec::with_capacity(self.segments.len());
        let mut without_tail = None;

        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => parts.push(lit.clone()),
                Segment::Param(_) => parts.push("?".to_string()),
                Segment::Optional(_) => {
                    without_tail = Some(join_fingerprint(&parts));
                    parts.push("?".to_string());
                }
                Segment::Multi { count, .. } => {
                    parts.extend(std::iter::repeat("?".to_string()).take(*count))
                }
                Segment::Wildcard(_) => parts.push("#".to_string()),
            }
        }

        let mut prints = vec![join_fingerprint(&parts)];
        prints.extend(without_tail);
        prints
    }
}

fn join_fingerprint(parts: &[String]) -> String {
    format!("/{}", parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_segments() {
        let t = Template::parse("/users/{id}/files/{path*}", true).unwrap();
        assert_eq!(
            t.segments(),
            &[
                Segment::Literal("users".into()),
                Segment::Param("id".into()),
                Segment::Literal("files".into()),
                Segment::Wildcard("path".into()),
            ]
        );

        let t = Template::parse("/a/{pair*2}/b", true).unwrap();
        assert_eq!(
            t.segments()[1],
            Segment::Multi {
                name: "pair".into(),
                count: 2
            }
        );

        let t = Template::parse("/", true).unwrap();
        assert!(t.segments().is_empty());
    }

    #[test]
    fn test_invalid_templates() {
        assert!(Template::parse("users", true).is_err());
        assert!(Template::parse("/a/{p?}/b", true).is_err());
        assert!(Template::parse("/a/{p*}/b", true).is_err());
        assert!(Template::parse("/a/{id}/{id}", true).is_err());
        assert!(Template::parse("/a/{bad-name}", true).is_err());
        assert!(Template::parse("/a//b", true).is_err());
        assert!(Template::parse("/a/{p*0}", true).is_err());
    }

    #[test]
    fn test_fingerprints() {
        let t = Template::parse("/a/{p?}", true).unwrap();
        assert_eq!(t.fingerprints(), vec!["/a/?".to_string(), "/a".to_string()]);

        let t = Template::parse("/a/{x}/{y*2}/{rest*}", true).unwrap();
        assert_eq!(t.fingerprints(), vec!["/a/?/?/?/#".to_string()]);

        let t = Template::parse("/", true).unwrap();
        assert_eq!(t.fingerprints(), vec!["/".to_string()]);
    }

    #[test]
    fn test_case_insensitive_literals() {
        let t = Template::parse("/Users/{Id}", false).unwrap();
        assert_eq!(t.segments()[0], Segment::Literal("users".into()));
        assert_eq!(t.segments()[1], Segment::Param("Id".into()));
    }
}
