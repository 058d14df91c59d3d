//! Reconciliation manager: registries, routing entry point and the
//! poll, diff and notify loop.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use patchconf::ReconcileConfig;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::backend::GraphBackend;
use crate::endpoint::{Acquirable, ConnectablePoint, ConnectableSet, Endpoint, HasName, Role};
use crate::error::PolicyViolation;
use crate::events::{EventKind, MessageBus, PatchEvent};
use crate::lifecycle::{Lifecycle, Transition};
use crate::path::{path_name, Connector, SignalPath};
use crate::policy::{ConnectionPolicy, PolicyEngine, Resolved};
use crate::pool::WorkerPool;
use crate::retry::RetryPolicy;
use crate::snapshot::{client_of, EntityKey, GraphSnapshot};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Default)]
struct Registries {
    /// Keyed by name and role: a name may legally be both a source and a sink.
    points: BTreeMap<EntityKey, Arc<ConnectablePoint>>,
    paths: BTreeMap<String, Arc<SignalPath>>,
    last: Option<GraphSnapshot>,
    /// Connector generation the last pass evaluated.
    settled: u64,
}

impl Registries {
    /// The registered instance for `point`'s name and role, registering
    /// `point` itself when there is none. Returns whether it was new.
    fn intern(&mut self, point: &Arc<ConnectablePoint>) -> (Arc<ConnectablePoint>, bool) {
        let key = EntityKey {
            name: point.name().to_string(),
            is_sink: point.role().is_sink(),
        };
        match self.points.entry(key) {
            Entry::Occupied(existing) => (Arc::clone(existing.get()), false),
            Entry::Vacant(slot) => (Arc::clone(slot.insert(Arc::clone(point))), true),
        }
    }

    /// Resolve against registered instances without registering anything.
    fn resolve(&self, endpoint: &Endpoint) -> Resolved {
        let points = endpoint
            .points()
            .iter()
            .map(|p| {
                let key = EntityKey {
                    name: p.name().to_string(),
                    is_sink: p.role().is_sink(),
                };
                self.points.get(&key).cloned().unwrap_or_else(|| Arc::clone(p))
            })
            .collect();
        Resolved::new(points, endpoint.is_set())
    }
}

/// Owns the point and path registries and keeps them in step with the
/// live graph.
///
/// [`ReconciliationManager::get_signal_paths`] records routing intent; the
/// background loop started by [`ReconciliationManager::start`] polls the
/// backend, skips unchanged snapshots, and walks every acquired point and
/// then every path through the lifecycle transition table. Nothing here
/// returns an error to the caller: failures become log lines and events.
pub struct ReconciliationManager {
    connector: Connector,
    poll_interval: Duration,
    registries: Mutex<Registries>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ReconciliationManager {
    /// `poll_interval` is clamped to at least a millisecond.
    pub fn new(connector: Connector, poll_interval: Duration) -> Self {
        Self {
            connector,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            registries: Mutex::new(Registries::default()),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    /// Build a manager, worker pool and retry policy from configuration.
    pub fn from_config(
        config: &ReconcileConfig,
        backend: Arc<dyn GraphBackend>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        let connector = Connector::new(
            backend,
            bus,
            WorkerPool::new(config.workers),
            RetryPolicy::from(config),
        );
        Self::new(connector, Duration::from_millis(config.poll_interval_ms))
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.connector.bus
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn publish(&self, event: PatchEvent) {
        self.connector.bus.publish(event);
    }

    // --- Registries ---

    /// Register `point`, or return the instance already registered under
    /// its name and role.
    pub fn register_point(&self, point: Arc<ConnectablePoint>) -> Arc<ConnectablePoint> {
        let (point, new) = self.registries.lock().intern(&point);
        if new {
            self.connector.touch();
            debug!(point = point.name(), role = %point.role(), "registered point");
        }
        point
    }

    /// Register every member of `set`. Returns how many were new.
    ///
    /// A member whose name is already registered is tracked through the
    /// registered instance, not the set's.
    pub fn register_set(&self, set: &ConnectableSet) -> usize {
        let added = {
            let mut registries = self.registries.lock();
            set.points()
                .iter()
                .filter(|p| registries.intern(p).1)
                .count()
        };
        if added > 0 {
            self.connector.touch();
        }
        added
    }

    /// Registered point for `name` and `role`, created on first use.
    pub fn point(&self, name: &str, role: Role) -> Arc<ConnectablePoint> {
        self.register_point(Arc::new(ConnectablePoint::new(name, role)))
    }

    /// Endpoint built from registered points: one name is a point, several
    /// names are a set named after the first member's client.
    pub fn endpoint(&self, names: &[String], role: Role) -> Option<Endpoint> {
        match names {
            [] => None,
            [single] => Some(Endpoint::Point(self.point(single, role))),
            many => {
                let set_name = client_of(&many[0]).unwrap_or(&many[0]);
                let set = ConnectableSet::new(set_name, role);
                for name in many {
                    set.push(self.point(name, role));
                }
                Some(Endpoint::Set(Arc::new(set)))
            }
        }
    }

    pub fn points(&self) -> Vec<Arc<ConnectablePoint>> {
        self.registries.lock().points.values().cloned().collect()
    }

    pub fn paths(&self) -> Vec<Arc<SignalPath>> {
        self.registries.lock().paths.values().cloned().collect()
    }

    pub fn path(&self, source: &str, sink: &str) -> Option<Arc<SignalPath>> {
        self.registries
            .lock()
            .paths
            .get(&path_name(source, sink))
            .cloned()
    }

    pub fn last_snapshot(&self) -> Option<GraphSnapshot> {
        self.registries.lock().last.clone()
    }

    /// Acquire an endpoint and announce it.
    pub fn acquire(&self, endpoint: &Endpoint) -> bool {
        let changed = endpoint.acquirable().acquire();
        if changed {
            self.connector.touch();
            let kind = if endpoint.is_set() {
                EventKind::SetAcquired
            } else {
                EventKind::PointAcquired
            };
            self.publish(PatchEvent::new(kind, endpoint.name()));
        }
        changed
    }

    /// Release an endpoint and announce it. Paths through it stop being
    /// reconciled but stay connected.
    pub fn release(&self, endpoint: &Endpoint) -> bool {
        let changed = endpoint.acquirable().release();
        if changed {
            self.connector.touch();
            let kind = if endpoint.is_set() {
                EventKind::SetReleased
            } else {
                EventKind::PointReleased
            };
            self.publish(PatchEvent::new(kind, endpoint.name()));
        }
        changed
    }

    // --- Routing intent ---

    /// Expand `source -> sink` under `policy` into signal paths, registering
    /// any that are new. Same arguments, same path identities.
    ///
    /// Never fails: a policy violation or an unexpected fault is logged and
    /// yields an empty list.
    pub fn get_signal_paths(
        &self,
        source: &Endpoint,
        sink: &Endpoint,
        policy: ConnectionPolicy,
    ) -> Vec<Arc<SignalPath>> {
        let route = path_name(source.name(), sink.name());

        match catch_unwind(AssertUnwindSafe(|| self.expand(source, sink, policy))) {
            Ok(Ok((paths, registered))) => {
                debug!(
                    route = %route,
                    %policy,
                    paths = paths.len(),
                    new = registered.len(),
                    "resolved signal paths"
                );
                for name in registered {
                    self.publish(PatchEvent::new(EventKind::PathRegistered, name));
                }
                paths
            }
            Ok(Err(violation)) => {
                warn!(route = %route, "{}", violation);
                self.publish(
                    PatchEvent::new(EventKind::PolicyViolated, route)
                        .with_detail(violation.reason),
                );
                Vec::new()
            }
            Err(_) => {
                error!(route = %route, %policy, "policy dispatch panicked");
                Vec::new()
            }
        }
    }

    fn expand(
        &self,
        source: &Endpoint,
        sink: &Endpoint,
        policy: ConnectionPolicy,
    ) -> Result<(Vec<Arc<SignalPath>>, Vec<String>), PolicyViolation> {
        if source.role() != Role::Source {
            return Err(PolicyViolation::new(
                policy,
                format!("{} is not a source", source.name()),
            ));
        }
        if sink.role() != Role::Sink {
            return Err(PolicyViolation::new(
                policy,
                format!("{} is not a sink", sink.name()),
            ));
        }

        let mut registries = self.registries.lock();
        let source = registries.resolve(source);
        let sink = registries.resolve(sink);
        let paths =
            PolicyEngine::new(&registries.paths, &self.connector).expand(policy, &source, &sink)?;

        // Only a successful expansion registers anything.
        let mut new_points = 0;
        for point in source.points.iter().chain(&sink.points) {
            if registries.intern(point).1 {
                new_points += 1;
            }
        }
        let mut registered = Vec::new();
        for path in &paths {
            if let Entry::Vacant(slot) = registries.paths.entry(path.name().to_string()) {
                registered.push(slot.key().clone());
                slot.insert(Arc::clone(path));
            }
        }
        drop(registries);

        if new_points > 0 || !registered.is_empty() {
            self.connector.touch();
        }
        Ok((paths, registered))
    }

    // --- Reconciliation ---

    /// Run one poll, diff and notify pass. Returns whether the topology
    /// changed since the previous pass.
    ///
    /// An unchanged snapshot is a no-op unless points or paths were
    /// registered, acquired or released since the last evaluation.
    pub async fn reconcile_once(&self) -> bool {
        let topology = match self.connector.backend.poll_topology().await {
            Ok(topology) => topology,
            Err(e) => {
                warn!("topology poll failed: {}", e);
                self.publish(
                    PatchEvent::new(EventKind::SnapshotFailed, "").with_detail(e.to_string()),
                );
                return false;
            }
        };
        let snapshot = GraphSnapshot::from_topology(topology);

        let (changed, points, paths) = {
            let mut registries = self.registries.lock();
            let generation = self.connector.generation();
            let changed = registries.last.as_ref() != Some(&snapshot);
            if !changed && registries.settled == generation {
                trace!("topology unchanged");
                return false;
            }
            registries.settled = generation;
            if changed {
                registries.last = Some(snapshot.clone());
            }
            (
                changed,
                registries.points.values().cloned().collect::<Vec<_>>(),
                registries.paths.values().cloned().collect::<Vec<_>>(),
            )
        };

        if changed {
            debug!(entities = snapshot.len(), "topology changed");
            self.publish(
                PatchEvent::new(EventKind::TopologyChanged, "")
                    .with_detail(format!("{} entities", snapshot.len())),
            );
        } else {
            debug!("routing intent changed, re-evaluating");
        }

        let pass = catch_unwind(AssertUnwindSafe(|| {
            self.update_points(&snapshot, &points);
            self.update_paths(&snapshot, &paths);
        }));
        if pass.is_err() {
            error!("reconciliation pass panicked");
            self.publish(PatchEvent::new(EventKind::PassFailed, ""));
        }
        changed
    }

    fn update_points(&self, snapshot: &GraphSnapshot, points: &[Arc<ConnectablePoint>]) {
        for point in points {
            let Some(transition) = point.state().observe(snapshot.is_entity(point.name())) else {
                continue;
            };
            let kind = match transition {
                Transition::Added => EventKind::PointAdded,
                Transition::Lost => EventKind::PointLost,
                Transition::Found => EventKind::PointFound,
                Transition::Zombie => EventKind::PointZombie,
            };
            log_transition(kind, point.name());
            self.publish(PatchEvent::new(kind, point.name()));
        }
    }

    fn update_paths(&self, snapshot: &GraphSnapshot, paths: &[Arc<SignalPath>]) {
        for path in paths {
            let removed = path.state().lifecycle() == Lifecycle::Removed;
            if !removed && !path.endpoints_acquired() {
                continue;
            }

            let (source, sink) = (path.source().name(), path.sink().name());
            let connected = snapshot.is_connected_to(source, sink);
            if let Some(transition) = path.state().observe(connected) {
                let kind = match transition {
                    Transition::Added => EventKind::PathAdded,
                    Transition::Lost => EventKind::PathLost,
                    Transition::Found => EventKind::PathFound,
                    Transition::Zombie => EventKind::PathZombie,
                };
                log_transition(kind, path.name());
                self.publish(PatchEvent::new(kind, path.name()));

                if transition == Transition::Lost {
                    self.publish(PatchEvent::new(EventKind::PathSinkUnreachable, path.name()));
                }
            }

            // A path that gave up, or was acquired before its endpoints,
            // gets another bounded routine once both ports are present.
            let stalled = path.is_acquired()
                && !connected
                && !path.is_connecting()
                && snapshot.is_entity(source)
                && snapshot.is_entity(sink);
            if stalled && path.schedule_connect() {
                debug!(path = path.name(), "endpoints present, reconnecting");
            }
        }
    }

    // --- Background loop ---

    pub fn is_running(&self) -> bool {
        let worker = self.worker.lock();
        worker.as_ref().is_some_and(|w| !w.is_finished()) && !self.cancel.is_cancelled()
    }

    /// Spawn the background loop on the current runtime.
    ///
    /// Returns false when it is already running, was shut down, or there is
    /// no runtime to spawn on.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut worker = self.worker.lock();
        if worker.is_some() || self.cancel.is_cancelled() {
            return false;
        }
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!("cannot start reconciliation loop: {}", e);
                return false;
            }
        };

        let manager = Arc::clone(self);
        let cancel = self.cancel.clone();
        *worker = Some(handle.spawn(async move { manager.run(cancel).await }));
        drop(worker);

        info!(
            interval_ms = self.poll_interval.as_millis() as u64,
            "reconciliation loop started"
        );
        self.publish(PatchEvent::new(EventKind::ManagerStarted, ""));
        true
    }

    async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.reconcile_once().await;
                }
                _ = cancel.cancelled() => {
                    debug!("reconciliation loop shutting down");
                    break;
                }
            }
        }
    }

    /// Stop the loop, cancel outstanding connect routines and wait for both.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.connector.pool.shutdown().await;

        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                warn!("reconciliation loop ended abnormally: {}", e);
            }
        }

        info!("reconciliation manager stopped");
        self.publish(PatchEvent::new(EventKind::ManagerStopped, ""));
    }
}

fn log_transition(kind: EventKind, subject: &str) {
    match kind {
        EventKind::PointLost | EventKind::PathLost => warn!(subject, "{}", kind),
        EventKind::PointZombie | EventKind::PathZombie => debug!(subject, "{}", kind),
        _ => info!(subject, "{}", kind),
    }
}
