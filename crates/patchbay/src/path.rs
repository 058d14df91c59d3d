//! Point-to-point signal paths and their connect/retry routine.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::backend::GraphBackend;
use crate::endpoint::{Acquirable, ConnectablePoint, HasName};
use crate::events::{EventKind, Handler, HandlerId, MessageBus, PatchEvent, Predicate};
use crate::lifecycle::LifecycleState;
use crate::pool::WorkerPool;
use crate::retry::{retry, Attempt, RetryOutcome, RetryPolicy};

/// Deterministic path name for a `(source, sink)` pair.
pub fn path_name(source: &str, sink: &str) -> String {
    format!("{}->{}", source, sink)
}

/// Services a path needs to connect itself.
#[derive(Clone)]
pub struct Connector {
    pub backend: Arc<dyn GraphBackend>,
    pub bus: Arc<dyn MessageBus>,
    pub pool: WorkerPool,
    pub retry: RetryPolicy,
    /// Bumped whenever routing intent changes; shared by every clone.
    generation: Arc<AtomicU64>,
}

impl Connector {
    pub fn new(
        backend: Arc<dyn GraphBackend>,
        bus: Arc<dyn MessageBus>,
        pool: WorkerPool,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            bus,
            pool,
            retry,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record that something was registered, acquired or released.
    pub fn touch(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn publish(&self, kind: EventKind, subject: &str) {
        self.bus.publish(PatchEvent::new(kind, subject));
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("pool", &self.pool)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// One tracked connection from a source point to a sink point.
///
/// Acquiring a path starts a bounded connect attempt on the worker pool and
/// subscribes it to sink-unreachable notifications, which restart the same
/// routine. Releasing is passive: the backend connection is left alone.
/// Use [`SignalPath::disconnect`] to break it explicitly.
pub struct SignalPath {
    name: String,
    source: Arc<ConnectablePoint>,
    sink: Arc<ConnectablePoint>,
    state: LifecycleState,
    connector: Connector,
    this: Weak<SignalPath>,
    watch: Mutex<Option<HandlerId>>,
    connecting: AtomicBool,
}

impl SignalPath {
    pub fn new(
        source: Arc<ConnectablePoint>,
        sink: Arc<ConnectablePoint>,
        connector: Connector,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name: path_name(source.name(), sink.name()),
            source,
            sink,
            state: LifecycleState::new(),
            connector,
            this: this.clone(),
            watch: Mutex::new(None),
            connecting: AtomicBool::new(false),
        })
    }

    pub fn source(&self) -> &Arc<ConnectablePoint> {
        &self.source
    }

    pub fn sink(&self) -> &Arc<ConnectablePoint> {
        &self.sink
    }

    pub fn endpoints_acquired(&self) -> bool {
        self.source.is_acquired() && self.sink.is_acquired()
    }

    /// True while a connect routine is queued or running.
    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::Acquire)
    }

    /// Queue the bounded connect routine unless one is already in flight.
    pub fn schedule_connect(&self) -> bool {
        let Some(path) = self.this.upgrade() else {
            return false;
        };
        if self
            .connecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(path = %self.name, "connect already in flight");
            return false;
        }

        let queued = self
            .connector
            .pool
            .spawn(&self.name, async move { path.connect_with_retry().await });
        if !queued {
            self.connecting.store(false, Ordering::Release);
        }
        queued
    }

    async fn connect_with_retry(self: Arc<Self>) {
        let _in_flight = InFlight(&self.connecting);
        let policy = self.connector.retry;

        match retry(&policy, |attempt| self.try_connect(attempt)).await {
            RetryOutcome::Succeeded { attempts } => {
                info!(path = %self.name, attempts, "path connected");
            }
            RetryOutcome::Abandoned { attempts } => {
                debug!(path = %self.name, attempts, "connect abandoned");
            }
            RetryOutcome::GaveUp { attempts } => {
                warn!(path = %self.name, attempts, "giving up on connect");
                self.connector.bus.publish(
                    PatchEvent::new(EventKind::PathGaveUp, &self.name)
                        .with_detail(format!("{} attempts", attempts)),
                );
            }
        }
    }

    async fn try_connect(&self, attempt: u32) -> Attempt {
        if !self.state.is_acquired() || !self.endpoints_acquired() {
            return Attempt::Abandoned;
        }

        let backend = &self.connector.backend;
        let (source, sink) = (self.source.name(), self.sink.name());
        for port in [source, sink] {
            if !backend.exists(port).await {
                return Attempt::Failed(format!("{} not present", port));
            }
        }

        self.connector.bus.publish(
            PatchEvent::new(EventKind::PathConnecting, &self.name).with_detail(format!(
                "attempt {}/{}",
                attempt, self.connector.retry.max_attempts
            )),
        );

        match backend.connect(source, sink).await {
            Ok(()) => {
                self.connector.publish(EventKind::PathConnected, &self.name);
                Attempt::Succeeded
            }
            Err(e) => {
                self.connector.bus.publish(
                    PatchEvent::new(EventKind::PathConnectFailed, &self.name)
                        .with_detail(e.to_string()),
                );
                Attempt::Failed(e.to_string())
            }
        }
    }

    /// Actively break the connection in the backend.
    pub async fn disconnect(&self) -> bool {
        self.connector
            .publish(EventKind::PathDisconnecting, &self.name);

        let done = self
            .connector
            .backend
            .disconnect(self.source.name(), self.sink.name())
            .await;

        if done {
            self.connector.publish(EventKind::PathDisconnected, &self.name);
        } else {
            warn!(path = %self.name, "backend refused disconnect");
        }
        done
    }

    fn watch_sink(&self) {
        let mut watch = self.watch.lock();
        if watch.is_some() {
            return;
        }

        let name = self.name.clone();
        let predicate: Predicate = Box::new(move |event: &PatchEvent| event.subject == name);
        let this = self.this.clone();
        let handler: Handler = Arc::new(move |event: &PatchEvent| -> anyhow::Result<()> {
            if let Some(path) = this.upgrade() {
                debug!(path = %event.subject, "sink unreachable, reconnecting");
                path.schedule_connect();
            }
            Ok(())
        });

        *watch = Some(
            self.connector
                .bus
                .register(EventKind::PathSinkUnreachable, predicate, handler),
        );
    }

    fn unwatch_sink(&self) {
        if let Some(id) = self.watch.lock().take() {
            self.connector.bus.unregister(id);
        }
    }
}

impl HasName for SignalPath {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Acquirable for SignalPath {
    fn state(&self) -> &LifecycleState {
        &self.state
    }

    fn acquire(&self) -> bool {
        if !self.state.acquire() {
            return false;
        }
        self.connector.touch();
        self.connector.publish(EventKind::PathAcquired, &self.name);

        if self.endpoints_acquired() {
            self.schedule_connect();
        } else {
            debug!(path = %self.name, "endpoints not acquired yet, not connecting");
        }
        self.watch_sink();
        true
    }

    fn release(&self) -> bool {
        let changed = self.state.release();
        self.unwatch_sink();
        if changed {
            self.connector.touch();
            self.connector.publish(EventKind::PathReleased, &self.name);
        }
        changed
    }
}

impl Drop for SignalPath {
    fn drop(&mut self) {
        self.unwatch_sink();
    }
}

impl fmt::Debug for SignalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalPath")
            .field("name", &self.name)
            .field("state", &self.state.flags())
            .finish()
    }
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
