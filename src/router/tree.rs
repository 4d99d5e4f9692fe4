//! Segment tree for one (vhost, method) pair.
//!
//! Children are tried in a fixed order: literal, single parameter,
//! multi-segment parameter (by ascending count), then wildcard. The first
//! branch that reaches a terminal wins, so resolution is deterministic.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use super::template::{Segment, Template};

#[derive(Debug)]
pub(crate) struct Leaf<T> {
    pub value: T,
    pub template: Arc<Template>,
}

#[derive(Debug)]
pub(crate) struct Node<T> {
    literals: HashMap<String, Node<T>>,
    param: Option<Box<Node<T>>>,
    multi: BTreeMap<usize, Node<T>>,
    wildcard: Option<Leaf<T>>,
    terminal: Option<Leaf<T>>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            literals: HashMap::new(),
            param: None,
            multi: BTreeMap::new(),
            wildcard: None,
            terminal: None,
        }
    }
}

impl<T: Clone> Node<T> {
    /// Inserts a template. Returns false if a terminal already occupies the
    /// slot the template resolves to.
    pub fn insert(&mut self, template: &Arc<Template>, value: T) -> bool {
        self.insert_at(template, template.segments(), value)
    }

    fn insert_at(&mut self, template: &Arc<Template>, segments: &[Segment], value: T) -> bool {
        let Some((segment, rest)) = segments.split_first() else {
            return Self::place(&mut self.terminal, template, value);
        };

        match segment {
            Segment::Literal(lit) => self
                .literals
                .entry(lit.clone())
                .or_default()
                .insert_at(template, rest, value),
            Segment::Param(_) => self
                .param
                .get_or_insert_with(Box::default)
                .insert_at(template, rest, value),
            Segment::Optional(_) => {
                if self.terminal.is_some() {
                    return false;
                }
                let placed = self
                    .param
                    .get_or_insert_with(Box::default)
                    .insert_at(template, rest, value.clone());
                placed && Self::place(&mut self.terminal, template, value)
            }
            Segment::Multi { count, .. } => self
                .multi
                .entry(*count)
                .or_default()
                .insert_at(template, rest, value),
            Segment::Wildcard(_) => Self::place(&mut self.wildcard, template, value),
        }
    }

    fn place(slot: &mut Option<Leaf<T>>, template: &Arc<Template>, value: T) -> bool {
        if slot.is_some() {
            return false;
        }
        *slot = Some(Leaf {
            value,
            template: template.clone(),
        });
        true
    }
}

impl<T> Node<T> {
    /// Finds the most specific leaf for `segments`, collecting the raw text
    /// captured by each dynamic segment on the way.
    pub fn find<'a>(
        &'a self,
        segments: &[&str],
        case_sensitive: bool,
        captures: &mut Vec<String>,
    ) -> Option<&'a Leaf<T>> {
        let Some((segment, rest)) = segments.split_first() else {
            if let Some(leaf) = &self.terminal {
                return Some(leaf);
            }
            return self.wildcard.as_ref().map(|leaf| {
                captures.push(String::new());
                leaf
            });
        };

        let key = if case_sensitive {
            None
        } else {
            Some(segment.to_ascii_lowercase())
        };
        if let Some(child) = self.literals.get(key.as_deref().unwrap_or(*segment)) {
            if let Some(leaf) = child.find(rest, case_sensitive, captures) {
                return Some(leaf);
            }
        }

        if let Some(child) = &self.param {
            if !segment.is_empty() {
                captures.push(segment.to_string());
                if let Some(leaf) = child.find(rest, case_sensitive, captures) {
                    return Some(leaf);
                }
                captures.pop();
            }
        }

        for (count, child) in &self.multi {
            if *count > segments.len() || segments[..*count].iter().any(|s| s.is_empty()) {
                continue;
            }
            captures.push(segments[..*count].join("/"));
            if let Some(leaf) = child.find(&segments[*count..], case_sensitive, captures) {
                return Some(leaf);
            }
            captures.pop();
        }

        self.wildcard.as_ref().map(|leaf| {
            captures.push(segments.join("/"));
            leaf
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(paths: &[&str]) -> Node<&'static str> {
        let mut root = Node::default();
        for path in paths {
            let template = Arc::new(Template::parse(path, true).unwrap());
            let name: &'static str = Box::leak(path.to_string().into_boxed_str());
            assert!(root.insert(&template, name), "insert {path}");
        }
        root
    }

    fn find(root: &Node<&'static str>, path: &str) -> Option<(&'static str, Vec<String>)> {
        let segments: Vec<&str> = if path == "/" {
            Vec::new()
        } else {
            path[1..].split('/').collect()
        };
        let mut captures = Vec::new();
        root.find(&segments, true, &mut captures)
            .map(|leaf| (leaf.value, captures))
    }

    #[test]
    fn test_literal_beats_param_beats_wildcard() {
        let root = tree(&["/a/b", "/a/{p}", "/a/{rest*}"]);
        assert_eq!(find(&root, "/a/b").unwrap().0, "/a/b");
        assert_eq!(find(&root, "/a/c").unwrap(), ("/a/{p}", vec!["c".into()]));
        assert_eq!(
            find(&root, "/a/c/d").unwrap(),
            ("/a/{rest*}", vec!["c/d".into()])
        );
    }

    #[test]
    fn test_backtracks_into_less_specific_branch() {
        let root = tree(&["/a/b/c", "/a/{p}/d"]);
        assert_eq!(
            find(&root, "/a/b/d").unwrap(),
            ("/a/{p}/d", vec!["b".into()])
        );
        assert!(find(&root, "/a/b/e").is_none());
    }

    #[test]
    fn test_multi_and_optional() {
        let root = tree(&["/m/{pair*2}", "/o/{p?}"]);
        assert_eq!(
            find(&root, "/m/x/y").unwrap(),
            ("/m/{pair*2}", vec!["x/y".into()])
        );
        assert!(find(&root, "/m/x").is_none());
        assert_eq!(find(&root, "/o").unwrap(), ("/o/{p?}", vec![]));
        assert_eq!(find(&root, "/o/v").unwrap(), ("/o/{p?}", vec!["v".into()]));
    }

    #[test]
    fn test_wildcard_matches_empty_rest() {
        let root = tree(&["/files/{path*}"]);
        assert_eq!(
            find(&root, "/files").unwrap(),
            ("/files/{path*}", vec!["".into()])
        );
    }

    #[test]
    fn test_occupied_slot_is_rejected() {
        let mut root = tree(&["/a"]);
        let template = Arc::new(Template::parse("/a/{p?}", true).unwrap());
        assert!(!root.insert(&template, "dup"));
    }
}
