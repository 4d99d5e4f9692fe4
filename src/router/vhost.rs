use std::collections::HashMap;

use matchit::{InsertError, Router as MatchRouter};

/// Host index mapping vhost patterns to route tables.
///
/// Hosts are stored reversed so that matchit's prefix matching does suffix
/// matching on domain names:
/// - exact hosts: "example.com" → "moc.elpmaxe"
/// - wildcard hosts: "*.example.com" → "moc.elpmaxe.{*subdomain}"
#[derive(Default)]
pub(crate) struct VhostIndex {
    hosts: MatchRouter<usize>,
    patterns: HashMap<String, usize>,
}

impl VhostIndex {
    fn reversed_pattern(host: &str) -> String {
        if let Some(domain_part) = host.strip_prefix('*') {
            let reversed_domain: String = domain_part.chars().rev().collect();
            format!("{reversed_domain}{{*subdomain}}")
        } else {
            host.chars().rev().collect()
        }
    }

    /// Table index registered for exactly this pattern.
    pub fn get(&self, host: &str) -> Option<usize> {
        self.patterns.get(&host.to_ascii_lowercase()).copied()
    }

    pub fn insert(&mut self, host: &str, table: usize) -> Result<(), InsertError> {
        let host = host.to_ascii_lowercase();
        self.hosts.insert(Self::reversed_pattern(&host), table)?;
        self.patterns.insert(host, table);
        Ok(())
    }

    /// Resolves a request host to a table index.
    pub fn find(&self, host: &str) -> Option<usize> {
        if host.is_empty() {
            return None;
        }
        let reversed_host: String = host.to_ascii_lowercase().chars().rev().collect();
        self.hosts.at(&reversed_host).ok().map(|m| *m.value)
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
