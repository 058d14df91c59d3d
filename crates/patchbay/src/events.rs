//! Lifecycle notifications and the in-process bus that carries them.
//!
//! Dispatch is keyed by [`EventKind`]; handlers never inspect types at
//! runtime. Each handler invocation is isolated: an error or a panic in one
//! subscriber is logged and the remaining subscribers still run.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, trace, warn};

/// Closed set of notifications emitted by the reconciliation core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    // Manager
    TopologyChanged,
    SnapshotFailed,
    ManagerStarted,
    ManagerStopped,
    PolicyViolated,
    PassFailed,

    // Points and sets
    PointAdded,
    PointLost,
    PointFound,
    PointZombie,
    PointAcquired,
    PointReleased,
    SetAcquired,
    SetReleased,

    // Paths
    PathRegistered,
    PathAdded,
    PathLost,
    PathFound,
    PathZombie,
    PathAcquired,
    PathReleased,
    PathConnecting,
    PathConnected,
    PathConnectFailed,
    PathGaveUp,
    PathDisconnecting,
    PathDisconnected,
    PathSinkUnreachable,
}

impl EventKind {
    pub const ALL: [EventKind; 28] = [
        Self::TopologyChanged,
        Self::SnapshotFailed,
        Self::ManagerStarted,
        Self::ManagerStopped,
        Self::PolicyViolated,
        Self::PassFailed,
        Self::PointAdded,
        Self::PointLost,
        Self::PointFound,
        Self::PointZombie,
        Self::PointAcquired,
        Self::PointReleased,
        Self::SetAcquired,
        Self::SetReleased,
        Self::PathRegistered,
        Self::PathAdded,
        Self::PathLost,
        Self::PathFound,
        Self::PathZombie,
        Self::PathAcquired,
        Self::PathReleased,
        Self::PathConnecting,
        Self::PathConnected,
        Self::PathConnectFailed,
        Self::PathGaveUp,
        Self::PathDisconnecting,
        Self::PathDisconnected,
        Self::PathSinkUnreachable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TopologyChanged => "topology_changed",
            Self::SnapshotFailed => "snapshot_failed",
            Self::ManagerStarted => "manager_started",
            Self::ManagerStopped => "manager_stopped",
            Self::PolicyViolated => "policy_violated",
            Self::PassFailed => "pass_failed",
            Self::PointAdded => "point_added",
            Self::PointLost => "point_lost",
            Self::PointFound => "point_found",
            Self::PointZombie => "point_zombie",
            Self::PointAcquired => "point_acquired",
            Self::PointReleased => "point_released",
            Self::SetAcquired => "set_acquired",
            Self::SetReleased => "set_released",
            Self::PathRegistered => "path_registered",
            Self::PathAdded => "path_added",
            Self::PathLost => "path_lost",
            Self::PathFound => "path_found",
            Self::PathZombie => "path_zombie",
            Self::PathAcquired => "path_acquired",
            Self::PathReleased => "path_released",
            Self::PathConnecting => "path_connecting",
            Self::PathConnected => "path_connected",
            Self::PathConnectFailed => "path_connect_failed",
            Self::PathGaveUp => "path_gave_up",
            Self::PathDisconnecting => "path_disconnecting",
            Self::PathDisconnected => "path_disconnected",
            Self::PathSinkUnreachable => "path_sink_unreachable",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One notification: what happened, and to which point, set or path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchEvent {
    pub kind: EventKind,
    /// Name of the point, set or path concerned; empty for manager-wide events.
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl PatchEvent {
    pub fn new(kind: EventKind, subject: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for PatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} {} ({})", self.kind, self.subject, detail),
            None => write!(f, "{} {}", self.kind, self.subject),
        }
    }
}

/// Identifies a registration so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

pub type Handler = Arc<dyn Fn(&PatchEvent) -> anyhow::Result<()> + Send + Sync>;
pub type Predicate = Box<dyn Fn(&PatchEvent) -> bool + Send + Sync>;

/// Contract of the publish/subscribe bus the core talks to.
pub trait MessageBus: Send + Sync {
    /// Fire-and-forget, synchronous per subscriber.
    fn publish(&self, event: PatchEvent);

    /// Subscribe `handler` to `kind`, filtered by `predicate`.
    fn register(&self, kind: EventKind, predicate: Predicate, handler: Handler) -> HandlerId;

    /// Subscribe `handler` to every kind.
    fn register_all(&self, handler: Handler) -> HandlerId;

    /// Returns false when `id` was not registered.
    fn unregister(&self, id: HandlerId) -> bool;
}

struct Subscriber {
    id: HandlerId,
    predicate: Option<Predicate>,
    handler: Handler,
}

#[derive(Default)]
struct HandlerTable {
    by_kind: HashMap<EventKind, Vec<Arc<Subscriber>>>,
    wildcard: Vec<Arc<Subscriber>>,
}

/// In-process [`MessageBus`] with a handler table keyed by kind.
pub struct EventBus {
    next_id: AtomicU64,
    table: RwLock<HandlerTable>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            table: RwLock::new(HandlerTable::default()),
        }
    }

    fn allocate(&self) -> HandlerId {
        HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn subscriber_count(&self) -> usize {
        let table = self.table.read();
        table.wildcard.len() + table.by_kind.values().map(Vec::len).sum::<usize>()
    }

    fn dispatch(subscriber: &Subscriber, event: &PatchEvent) {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            if let Some(predicate) = &subscriber.predicate {
                if !predicate(event) {
                    return Ok(());
                }
            }
            (subscriber.handler)(event)
        }));

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                handler = subscriber.id.0,
                event = %event,
                "event handler failed: {:#}",
                e
            ),
            Err(_) => error!(
                handler = subscriber.id.0,
                event = %event,
                "event handler panicked"
            ),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus for EventBus {
    fn publish(&self, event: PatchEvent) {
        // Snapshot the subscribers so handlers may (un)register while running
        let mut subscribers: Vec<Arc<Subscriber>> = {
            let table = self.table.read();
            table
                .by_kind
                .get(&event.kind)
                .into_iter()
                .flatten()
                .chain(table.wildcard.iter())
                .cloned()
                .collect()
        };
        subscribers.sort_by_key(|s| s.id);

        trace!(event = %event, subscribers = subscribers.len(), "publish");
        for subscriber in &subscribers {
            Self::dispatch(subscriber, &event);
        }
    }

    fn register(&self, kind: EventKind, predicate: Predicate, handler: Handler) -> HandlerId {
        let id = self.allocate();
        let subscriber = Arc::new(Subscriber {
            id,
            predicate: Some(predicate),
            handler,
        });
        self.table
            .write()
            .by_kind
            .entry(kind)
            .or_default()
            .push(subscriber);
        id
    }

    fn register_all(&self, handler: Handler) -> HandlerId {
        let id = self.allocate();
        self.table.write().wildcard.push(Arc::new(Subscriber {
            id,
            predicate: None,
            handler,
        }));
        id
    }

    fn unregister(&self, id: HandlerId) -> bool {
        let mut table = self.table.write();
        let before = table.wildcard.len();
        table.wildcard.retain(|s| s.id != id);
        let mut removed = table.wildcard.len() != before;

        for list in table.by_kind.values_mut() {
            let before = list.len();
            list.retain(|s| s.id != id);
            removed |= list.len() != before;
        }
        removed
    }
}
