//! Normalized, immutable view of the patch graph at one poll instant.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Separator between client and port in an entity name.
pub const SEPARATOR: char = ':';

/// Raw topology as returned by a backend poll: `(entity, is_sink) -> neighbors`.
pub type Topology = HashMap<(String, bool), Vec<String>>;

/// Key of one snapshot entry.
///
/// The same name may appear both as a source and as a sink (loopback or
/// bridge clients); both entries are kept.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityKey {
    pub name: String,
    pub is_sink: bool,
}

/// Client part of an entity name: everything before the last separator.
///
/// The client segment may itself contain separators, so this is a best
/// guess and is never used to normalize names.
pub fn client_of(name: &str) -> Option<&str> {
    name.rsplit_once(SEPARATOR).map(|(client, _)| client)
}

/// Immutable normalized connectivity map.
///
/// Keys and neighbor lists are sorted and deduplicated, so two snapshots
/// with identical connectivity compare equal regardless of poll order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphSnapshot {
    entries: BTreeMap<EntityKey, Vec<String>>,
}

impl GraphSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from a raw poll, dropping keys without a separator.
    pub fn from_topology(topology: Topology) -> Self {
        let mut entries = BTreeMap::new();
        for ((name, is_sink), neighbors) in topology {
            if !name.contains(SEPARATOR) {
                debug!(entity = %name, "dropping malformed entity name from topology");
                continue;
            }
            let key = EntityKey { name, is_sink };
            let merged: &mut Vec<String> = entries.entry(key).or_default();
            merged.extend(neighbors);
        }
        Self::normalize(entries)
    }

    fn normalize(mut entries: BTreeMap<EntityKey, Vec<String>>) -> Self {
        for neighbors in entries.values_mut() {
            neighbors.sort();
            neighbors.dedup();
        }
        Self { entries }
    }

    /// Normalized copy. `a.normalized().normalized() == a.normalized()`.
    pub fn normalized(&self) -> Self {
        Self::normalize(self.entries.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_entity(&self, name: &str) -> bool {
        self.is_source(name) || self.is_sink(name)
    }

    pub fn is_source(&self, name: &str) -> bool {
        self.entries.contains_key(&key(name, false))
    }

    pub fn is_sink(&self, name: &str) -> bool {
        self.entries.contains_key(&key(name, true))
    }

    /// Everything `entity` is connected to, across both roles, sorted.
    pub fn neighbors(&self, entity: &str) -> Vec<String> {
        let mut all: BTreeSet<&String> = BTreeSet::new();
        for is_sink in [false, true] {
            if let Some(list) = self.entries.get(&key(entity, is_sink)) {
                all.extend(list);
            }
        }
        all.into_iter().cloned().collect()
    }

    /// True when `b` is listed among `a`'s neighbors in either role.
    pub fn is_connected_to(&self, a: &str, b: &str) -> bool {
        [false, true].iter().any(|&is_sink| {
            self.entries
                .get(&key(a, is_sink))
                .is_some_and(|list| list.binary_search_by(|n| n.as_str().cmp(b)).is_ok())
        })
    }

    /// Entity names belonging to `client`, sorted and unique.
    pub fn entries_of(&self, client: &str) -> Vec<String> {
        let prefix = format!("{}{}", client, SEPARATOR);
        let names: BTreeSet<&String> = self
            .entries
            .keys()
            .filter(|k| k.name.starts_with(&prefix))
            .map(|k| &k.name)
            .collect();
        names.into_iter().cloned().collect()
    }

    /// `(entity, neighbor)` pairs for every entity of `client`.
    pub fn connections_of(&self, client: &str) -> Vec<(String, String)> {
        let prefix = format!("{}{}", client, SEPARATOR);
        let pairs: BTreeSet<(String, String)> = self
            .entries
            .iter()
            .filter(|(k, _)| k.name.starts_with(&prefix))
            .flat_map(|(k, list)| list.iter().map(move |n| (k.name.clone(), n.clone())))
            .collect();
        pairs.into_iter().collect()
    }

    /// Serializable per-role view, for printing.
    pub fn view(&self) -> SnapshotView {
        let mut view = SnapshotView::default();
        for (k, list) in &self.entries {
            let side = if k.is_sink {
                &mut view.sinks
            } else {
                &mut view.sources
            };
            side.insert(k.name.clone(), list.clone());
        }
        view
    }
}

fn key(name: &str, is_sink: bool) -> EntityKey {
    EntityKey {
        name: name.to_string(),
        is_sink,
    }
}

/// JSON-friendly rendering of a [`GraphSnapshot`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotView {
    pub sources: BTreeMap<String, Vec<String>>,
    pub sinks: BTreeMap<String, Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn topo(entries: &[(&str, bool, &[&str])]) -> Topology {
        entries
            .iter()
            .map(|(name, is_sink, neighbors)| {
                (
                    (name.to_string(), *is_sink),
                    neighbors.iter().map(|s| s.to_string()).collect(),
                )
            })
            .collect()
    }

    fn sample() -> GraphSnapshot {
        GraphSnapshot::from_topology(topo(&[
            ("system:capture_1", false, &["rec:in_1", "monitor:in"]),
            ("system:capture_2", false, &[]),
            ("rec:in_1", true, &["system:capture_1"]),
            ("monitor:in", true, &["system:capture_1"]),
            ("system:playback_1", true, &[]),
        ]))
    }

    #[test]
    fn test_membership() {
        let snap = sample();
        assert!(snap.is_entity("system:capture_1"));
        assert!(snap.is_source("system:capture_1"));
        assert!(!snap.is_sink("system:capture_1"));
        assert!(snap.is_sink("system:playback_1"));
        assert!(!snap.is_entity("nope:nothing"));
        assert!(!snap.is_entity(""));
    }

    #[test]
    fn test_neighbors_sorted() {
        let snap = sample();
        assert_eq!(
            snap.neighbors("system:capture_1"),
            vec!["monitor:in".to_string(), "rec:in_1".to_string()]
        );
        assert!(snap.neighbors("unknown:port").is_empty());
    }

    #[test]
    fn test_is_connected_to() {
        let snap = sample();
        assert!(snap.is_connected_to("system:capture_1", "rec:in_1"));
        assert!(snap.is_connected_to("rec:in_1", "system:capture_1"));
        assert!(!snap.is_connected_to("system:capture_2", "rec:in_1"));
        assert!(!snap.is_connected_to("unknown:a", "unknown:b"));
    }

    #[test]
    fn test_connection_appears_after_next_snapshot() {
        let before = GraphSnapshot::from_topology(topo(&[
            ("a:out", false, &[]),
            ("b:in", true, &[]),
        ]));
        assert!(!before.is_connected_to("a:out", "b:in"));

        let after = GraphSnapshot::from_topology(topo(&[
            ("a:out", false, &["b:in"]),
            ("b:in", true, &["a:out"]),
        ]));
        assert!(after.is_connected_to("a:out", "b:in"));
    }

    #[test]
    fn test_order_independent_equality() {
        let a = GraphSnapshot::from_topology(topo(&[
            ("x:out", false, &["z:in", "y:in"]),
            ("y:in", true, &["x:out"]),
        ]));
        let b = GraphSnapshot::from_topology(topo(&[
            ("y:in", true, &["x:out", "x:out"]),
            ("x:out", false, &["y:in", "z:in"]),
        ]));
        assert_eq!(a, b);
    }

    #[test]
    fn test_normalized_is_idempotent() {
        let snap = sample();
        let once = snap.normalized();
        assert_eq!(once.normalized(), once);
        assert_eq!(once, snap);
    }

    #[test]
    fn test_malformed_keys_dropped() {
        let snap = GraphSnapshot::from_topology(topo(&[
            ("nocolon", false, &["a:in"]),
            ("a:in", true, &[]),
        ]));
        assert_eq!(snap.len(), 1);
        assert!(!snap.is_entity("nocolon"));
    }

    #[test]
    fn test_same_name_as_source_and_sink() {
        let snap = GraphSnapshot::from_topology(topo(&[
            ("loop:bridge", false, &["b:in"]),
            ("loop:bridge", true, &["a:out"]),
        ]));
        assert!(snap.is_source("loop:bridge"));
        assert!(snap.is_sink("loop:bridge"));
        assert_eq!(snap.len(), 2);
        assert_eq!(
            snap.neighbors("loop:bridge"),
            vec!["a:out".to_string(), "b:in".to_string()]
        );
    }

    #[test]
    fn test_entries_and_connections_of_client() {
        let snap = sample();
        assert_eq!(
            snap.entries_of("system"),
            vec![
                "system:capture_1".to_string(),
                "system:capture_2".to_string(),
                "system:playback_1".to_string(),
            ]
        );
        assert_eq!(
            snap.connections_of("rec"),
            vec![("rec:in_1".to_string(), "system:capture_1".to_string())]
        );
        assert!(snap.entries_of("ghost").is_empty());
    }

    #[test]
    fn test_client_with_separator() {
        let snap = GraphSnapshot::from_topology(topo(&[(
            "a2j:Midi Through:port",
            false,
            &[],
        )]));
        assert_eq!(snap.entries_of("a2j:Midi Through").len(), 1);
        assert_eq!(snap.entries_of("a2j").len(), 1);
        assert_eq!(client_of("a2j:Midi Through:port"), Some("a2j:Midi Through"));
        assert_eq!(client_of("plain"), None);
    }

    #[test]
    fn test_view() {
        let view = sample().view();
        assert_eq!(view.sources.len(), 2);
        assert_eq!(view.sinks.len(), 3);
        let json = serde_json::to_value(&view).unwrap();
        assert!(json["sinks"]["rec:in_1"].is_array());
    }
}
