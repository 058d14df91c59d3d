//! Fan-out policies: how a source endpoint's points map onto a sink's.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::endpoint::{ConnectablePoint, Endpoint, HasName};
use crate::error::{PolicyViolation, UnknownPolicy};
use crate::path::{path_name, Connector, SignalPath};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionPolicy {
    /// First source point to first sink point.
    Mono,
    /// Two channels; a single source point feeds both.
    #[default]
    Dual,
    /// Index for index, counts must match.
    Line,
    /// One source point to every sink point.
    Bcast,
    /// Every source point into one sink point.
    Merge,
    /// Index for index, excess points dropped.
    Trunc,
    /// Same as [`ConnectionPolicy::Dual`].
    Default,
}

impl ConnectionPolicy {
    pub const ALL: [ConnectionPolicy; 7] = [
        Self::Mono,
        Self::Dual,
        Self::Line,
        Self::Bcast,
        Self::Merge,
        Self::Trunc,
        Self::Default,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mono => "mono",
            Self::Dual => "dual",
            Self::Line => "line",
            Self::Bcast => "bcast",
            Self::Merge => "merge",
            Self::Trunc => "trunc",
            Self::Default => "default",
        }
    }

    /// The concrete rule this policy dispatches to.
    pub fn resolved(self) -> Self {
        match self {
            Self::Default => Self::Dual,
            other => other,
        }
    }
}

impl fmt::Display for ConnectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConnectionPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == lower)
            .ok_or_else(|| UnknownPolicy(s.to_string()))
    }
}

/// Points an endpoint resolved to, and whether it was handed over as a set.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub points: Vec<Arc<ConnectablePoint>>,
    pub is_set: bool,
}

impl Resolved {
    pub fn new(points: Vec<Arc<ConnectablePoint>>, is_set: bool) -> Self {
        Self { points, is_set }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

impl From<&Endpoint> for Resolved {
    fn from(endpoint: &Endpoint) -> Self {
        Self::new(endpoint.points(), endpoint.is_set())
    }
}

/// Index pairs `(source, sink)` required by `policy`.
pub fn plan(
    policy: ConnectionPolicy,
    source: &Resolved,
    sink: &Resolved,
) -> Result<Vec<(usize, usize)>, PolicyViolation> {
    let violation = |reason: String| Err(PolicyViolation::new(policy, reason));
    let (n_source, n_sink) = (source.len(), sink.len());

    if n_source == 0 {
        return violation("source resolves to no points".to_string());
    }
    if n_sink == 0 {
        return violation("sink resolves to no points".to_string());
    }

    match policy.resolved() {
        ConnectionPolicy::Mono => Ok(vec![(0, 0)]),
        ConnectionPolicy::Dual | ConnectionPolicy::Default => {
            if n_sink < 2 {
                return violation(format!("sink resolves to {} point, needs 2", n_sink));
            }
            if n_source == 1 {
                Ok(vec![(0, 0), (0, 1)])
            } else {
                Ok(vec![(0, 0), (1, 1)])
            }
        }
        ConnectionPolicy::Line => {
            if n_source != n_sink {
                return violation(format!(
                    "source has {} points, sink has {}",
                    n_source, n_sink
                ));
            }
            Ok((0..n_source).map(|i| (i, i)).collect())
        }
        ConnectionPolicy::Bcast => {
            if source.is_set {
                return violation("source is a set, needs a single point".to_string());
            }
            Ok((0..n_sink).map(|j| (0, j)).collect())
        }
        ConnectionPolicy::Merge => Ok((0..n_source).map(|i| (i, 0)).collect()),
        ConnectionPolicy::Trunc => Ok((0..n_source.min(n_sink)).map(|i| (i, i)).collect()),
    }
}

/// Expands a routing request into signal paths.
///
/// Pairs already present in `registry` come back as the registered path,
/// so the same request always yields the same identities.
pub struct PolicyEngine<'a> {
    registry: &'a BTreeMap<String, Arc<SignalPath>>,
    connector: &'a Connector,
}

impl<'a> PolicyEngine<'a> {
    pub fn new(registry: &'a BTreeMap<String, Arc<SignalPath>>, connector: &'a Connector) -> Self {
        Self {
            registry,
            connector,
        }
    }

    pub fn expand(
        &self,
        policy: ConnectionPolicy,
        source: &Resolved,
        sink: &Resolved,
    ) -> Result<Vec<Arc<SignalPath>>, PolicyViolation> {
        let pairs = plan(policy, source, sink)?;

        let mut paths: Vec<Arc<SignalPath>> = Vec::with_capacity(pairs.len());
        for (i, j) in pairs {
            let (src, snk) = (&source.points[i], &sink.points[j]);
            let name = path_name(src.name(), snk.name());
            if paths.iter().any(|p| p.name() == name) {
                continue;
            }
            let path = match self.registry.get(&name) {
                Some(existing) => Arc::clone(existing),
                None => SignalPath::new(Arc::clone(src), Arc::clone(snk), self.connector.clone()),
            };
            paths.push(path);
        }
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::endpoint::{ConnectableSet, Role};
    use crate::events::EventBus;
    use crate::pool::WorkerPool;
    use crate::retry::RetryPolicy;
    use pretty_assertions::assert_eq;

    fn connector() -> Connector {
        Connector::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(EventBus::new()),
            WorkerPool::new(1),
            RetryPolicy::default(),
        )
    }

    fn point(name: &str, role: Role) -> Endpoint {
        Endpoint::Point(Arc::new(ConnectablePoint::new(name, role)))
    }

    fn set(prefix: &str, role: Role, n: usize) -> Endpoint {
        let names: Vec<String> = (1..=n).map(|i| format!("{}:{}", prefix, i)).collect();
        Endpoint::Set(ConnectableSet::with_points(prefix, role, names))
    }

    fn names(policy: ConnectionPolicy, source: &Endpoint, sink: &Endpoint) -> Option<Vec<String>> {
        let registry = BTreeMap::new();
        let connector = connector();
        PolicyEngine::new(&registry, &connector)
            .expand(policy, &source.into(), &sink.into())
            .ok()
            .map(|paths| paths.iter().map(|p| p.name().to_string()).collect())
    }

    fn count(policy: ConnectionPolicy, source: &Endpoint, sink: &Endpoint) -> Option<usize> {
        names(policy, source, sink).map(|n| n.len())
    }

    #[test]
    fn test_parse_policy_names() {
        for policy in ConnectionPolicy::ALL {
            assert_eq!(policy.as_str().parse::<ConnectionPolicy>(), Ok(policy));
        }
        assert_eq!("BCAST".parse::<ConnectionPolicy>(), Ok(ConnectionPolicy::Bcast));
        assert_eq!(
            "stereo".parse::<ConnectionPolicy>(),
            Err(UnknownPolicy("stereo".to_string()))
        );
        assert_eq!(ConnectionPolicy::Default.resolved(), ConnectionPolicy::Dual);
    }

    #[test]
    fn test_policy_table() {
        use ConnectionPolicy::*;
        let src_point = point("a:out", Role::Source);
        let snk_point = point("b:in", Role::Sink);
        let src_set1 = set("a", Role::Source, 1);
        let src_set2 = set("a", Role::Source, 2);
        let src_set3 = set("a", Role::Source, 3);
        let snk_set2 = set("b", Role::Sink, 2);
        let snk_set3 = set("b", Role::Sink, 3);

        let cases: Vec<(ConnectionPolicy, &Endpoint, &Endpoint, Option<usize>)> = vec![
            (Mono, &src_point, &snk_point, Some(1)),
            (Mono, &src_point, &snk_set3, Some(1)),
            (Mono, &src_set3, &snk_point, Some(1)),
            (Mono, &src_set3, &snk_set2, Some(1)),
            (Dual, &src_point, &snk_point, None),
            (Dual, &src_point, &snk_set2, Some(2)),
            (Dual, &src_set3, &snk_point, None),
            (Dual, &src_set1, &snk_set2, Some(2)),
            (Dual, &src_set2, &snk_set3, Some(2)),
            (Line, &src_point, &snk_point, Some(1)),
            (Line, &src_point, &snk_set2, None),
            (Line, &src_set2, &snk_point, None),
            (Line, &src_set3, &snk_set3, Some(3)),
            (Line, &src_set2, &snk_set3, None),
            (Bcast, &src_point, &snk_point, Some(1)),
            (Bcast, &src_point, &snk_set3, Some(3)),
            (Bcast, &src_set1, &snk_point, None),
            (Bcast, &src_set2, &snk_set2, None),
            (Merge, &src_point, &snk_point, Some(1)),
            (Merge, &src_point, &snk_set2, Some(1)),
            (Merge, &src_set3, &snk_point, Some(3)),
            (Merge, &src_set2, &snk_set3, Some(2)),
            (Trunc, &src_point, &snk_point, Some(1)),
            (Trunc, &src_point, &snk_set3, Some(1)),
            (Trunc, &src_set3, &snk_point, Some(1)),
            (Trunc, &src_set2, &snk_set3, Some(2)),
            (Default, &src_point, &snk_point, None),
            (Default, &src_set2, &snk_set2, Some(2)),
        ];

        for (policy, source, sink, expected) in cases {
            assert_eq!(
                count(policy, source, sink),
                expected,
                "{} {} -> {}",
                policy,
                source.name(),
                sink.name()
            );
        }
    }

    #[test]
    fn test_empty_sets_violate_every_policy() {
        let empty_src = set("a", Role::Source, 0);
        let empty_snk = set("b", Role::Sink, 0);
        let src = point("a:out", Role::Source);
        let snk = point("b:in", Role::Sink);
        for policy in ConnectionPolicy::ALL {
            assert_eq!(count(policy, &empty_src, &snk), None, "{}", policy);
            assert_eq!(count(policy, &src, &empty_snk), None, "{}", policy);
        }
    }

    #[test]
    fn test_dual_pairs_index_for_index() {
        let source = set("a", Role::Source, 2);
        let sink = set("b", Role::Sink, 2);
        assert_eq!(
            names(ConnectionPolicy::Dual, &source, &sink),
            Some(vec!["a:1->b:1".to_string(), "a:2->b:2".to_string()])
        );
    }

    #[test]
    fn test_dual_broadcasts_single_point() {
        let source = point("a:out", Role::Source);
        let sink = set("b", Role::Sink, 3);
        assert_eq!(
            names(ConnectionPolicy::Dual, &source, &sink),
            Some(vec!["a:out->b:1".to_string(), "a:out->b:2".to_string()])
        );
    }

    #[test]
    fn test_merge_into_one_sink() {
        let source = set("a", Role::Source, 3);
        let sink = point("b:in", Role::Sink);
        assert_eq!(
            names(ConnectionPolicy::Merge, &source, &sink),
            Some(vec![
                "a:1->b:in".to_string(),
                "a:2->b:in".to_string(),
                "a:3->b:in".to_string()
            ])
        );
    }

    #[test]
    fn test_bcast_from_one_source() {
        let source = point("a:out", Role::Source);
        let sink = set("b", Role::Sink, 3);
        let result = names(ConnectionPolicy::Bcast, &source, &sink).unwrap_or_default();
        assert_eq!(result.len(), 3);
        assert!(result.iter().all(|n| n.starts_with("a:out->")));
    }

    #[test]
    fn test_violation_message() {
        let source = point("a:out", Role::Source);
        let sink = point("b:in", Role::Sink);
        let err = plan(ConnectionPolicy::Dual, &(&source).into(), &(&sink).into())
            .expect_err("dual needs two sink points");
        assert_eq!(err.policy, ConnectionPolicy::Dual);
        assert_eq!(err.to_string(), "dual policy violated: sink resolves to 1 point, needs 2");
    }

    #[test]
    fn test_existing_paths_are_reused() {
        let connector = connector();
        let source = point("a:out", Role::Source);
        let sink = point("b:in", Role::Sink);

        let mut registry = BTreeMap::new();
        let first = PolicyEngine::new(&registry, &connector)
            .expand(ConnectionPolicy::Mono, &(&source).into(), &(&sink).into())
            .expect("mono expands");
        for path in &first {
            registry.insert(path.name().to_string(), Arc::clone(path));
        }

        let second = PolicyEngine::new(&registry, &connector)
            .expand(ConnectionPolicy::Mono, &(&source).into(), &(&sink).into())
            .expect("mono expands");
        assert_eq!(second.len(), 1);
        assert!(Arc::ptr_eq(&first[0], &second[0]));
    }
}
