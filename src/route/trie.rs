//! Wildcard-capable host trie.
//!
//! Edge labels are the dot-separated components of a host name, stored
//! left-to-right in the order they appear in the pattern (`www.example.com`
//! descends `www` → `example` → `com`). A component of `*` (or `:name`,
//! kept as a reserved alias) becomes a wildcard edge instead of a literal
//! one; at lookup time the wildcard branch is tried before the literal
//! branch at every node, so wildcards win ties.

use std::collections::HashMap;
use std::sync::Arc;

use crate::route::Route;

#[derive(Default)]
struct Node {
    wild: Option<Box<Node>>,
    named: HashMap<String, Node>,
    route: Option<Arc<Route>>,
}

impl Node {
    fn add(&mut self, labels: &[&str], route: Arc<Route>) -> Result<(), ()> {
        match labels.split_first() {
            None => {
                if self.route.is_some() {
                    return Err(());
                }
                self.route = Some(route);
                Ok(())
            }
            Some((&first, rest)) => {
                if first == "*" || first.starts_with(':') {
                    self.wild
                        .get_or_insert_with(|| Box::new(Node::default()))
                        .add(rest, route)
                } else {
                    self.named.entry(first.to_string()).or_default().add(rest, route)
                }
            }
        }
    }

    fn find<'a>(&'a self, labels: &[&str]) -> Option<&'a Arc<Route>> {
        match labels.split_first() {
            None => self.route.as_ref(),
            Some((&first, rest)) => {
                if let Some(wild) = &self.wild
                    && let Some(route) = wild.find(rest)
                {
                    return Some(route);
                }
                self.named.get(first).and_then(|child| child.find(rest))
            }
        }
    }
}

/// A host trie mapping dot-separated patterns to [`Route`]s.
///
/// `*` is only meaningful as the leading label of a pattern (the only shape
/// the route engine ever inserts); this trie imposes no such restriction
/// itself since a wildcard edge is equally valid at any depth.
#[derive(Default)]
pub struct HostTrie {
    root: Node,
}

/// Error returned by [`HostTrie::add`] when a pattern is malformed or
/// already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrieInsertError {
    /// The pattern was empty, or split into an empty label (leading,
    /// trailing, or consecutive dots).
    EmptyLabel,
    /// A route already terminates at this exact pattern.
    Duplicate,
}

impl HostTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `route` under `pattern`, splitting on `.`.
    pub fn add(&mut self, pattern: &str, route: Arc<Route>) -> Result<(), TrieInsertError> {
        if pattern.is_empty() {
            return Err(TrieInsertError::EmptyLabel);
        }
        let labels: Vec<&str> = pattern.split('.').collect();
        if labels.iter().any(|l| l.is_empty()) {
            return Err(TrieInsertError::EmptyLabel);
        }
        self.root
            .add(&labels, route)
            .map_err(|_| TrieInsertError::Duplicate)
    }

    /// Look up `host`, trying the wildcard branch before the literal branch
    /// at every node. Returns `None` for an empty host or no match.
    pub fn find(&self, host: &str) -> Option<&Arc<Route>> {
        if host.is_empty() {
            return None;
        }
        let labels: Vec<&str> = host.split('.').collect();
        self.root.find(&labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{AuthConfig, EgressMode, RouteSpec, WsConfig};

    fn route(domain: &str) -> Arc<Route> {
        Arc::new(
            Route::build(RouteSpec {
                domain: domain.to_string(),
                egress_mode: EgressMode::Http,
                out_address: "127.0.0.1:9092".to_string(),
                load_balancer_targets: vec![],
                cert_file: None,
                key_file: None,
                autocert: false,
                ws_config: WsConfig::default(),
                auth: AuthConfig::default(),
                force_https: false,
                flush_interval: 0,
            })
            .unwrap(),
        )
    }

    #[test]
    fn literal_lookup_after_any_insertion_order() {
        let mut trie = HostTrie::new();
        trie.add("example.com", route("example.com")).unwrap();
        trie.add("example.net", route("example.net")).unwrap();
        assert_eq!(trie.find("example.com").unwrap().domain, "example.com");
        assert_eq!(trie.find("example.net").unwrap().domain, "example.net");
        assert!(trie.find("notfound.net").is_none());
    }

    #[test]
    fn wildcard_matches_any_single_label() {
        let mut trie = HostTrie::new();
        trie.add("*.x.com", route("*.x.com")).unwrap();
        assert_eq!(trie.find("a.x.com").unwrap().domain, "*.x.com");
        assert_eq!(trie.find("b.x.com").unwrap().domain, "*.x.com");
        assert!(trie.find("a.b.x.com").is_none());
    }

    #[test]
    fn wildcard_wins_tie_regardless_of_insertion_order() {
        let mut a = HostTrie::new();
        a.add("*.x.com", route("*.x.com")).unwrap();
        a.add("a.x.com", route("a.x.com")).unwrap();
        assert_eq!(a.find("a.x.com").unwrap().domain, "*.x.com");

        let mut b = HostTrie::new();
        b.add("a.x.com", route("a.x.com")).unwrap();
        b.add("*.x.com", route("*.x.com")).unwrap();
        assert_eq!(b.find("a.x.com").unwrap().domain, "*.x.com");
    }

    #[test]
    fn duplicate_pattern_rejected() {
        let mut trie = HostTrie::new();
        trie.add("example.com", route("example.com")).unwrap();
        assert_eq!(
            trie.add("example.com", route("example.com")),
            Err(TrieInsertError::Duplicate)
        );
    }

    #[test]
    fn empty_and_malformed_patterns_rejected() {
        let mut trie = HostTrie::new();
        assert_eq!(trie.add("", route("x")), Err(TrieInsertError::EmptyLabel));
        assert_eq!(
            trie.add(".example.com", route("x")),
            Err(TrieInsertError::EmptyLabel)
        );
        assert_eq!(
            trie.add("example.com.", route("x")),
            Err(TrieInsertError::EmptyLabel)
        );
    }

    #[test]
    fn empty_host_has_no_match() {
        let mut trie = HostTrie::new();
        trie.add("example.com", route("example.com")).unwrap();
        assert!(trie.find("").is_none());
    }
}
