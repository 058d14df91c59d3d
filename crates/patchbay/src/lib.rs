//! Patchbay: keeps a live audio patch graph in step with declared routing.
//!
//! Callers state intent as "connect this source to that sink under a fan-out
//! policy". The manager expands that into point-to-point signal paths, each
//! of which connects itself through a [`GraphBackend`] with bounded retries.
//! A background loop polls the graph, skips unchanged snapshots, and walks
//! every tracked point and path through its lifecycle:
//!
//! - **INITIAL** → **OK** when first observed
//! - **OK** → **STALE** when it disappears
//! - **STALE** → **OK** when it comes back
//! - **REMOVED** only by explicit release
//!
//! Every transition is published on a [`MessageBus`].

pub mod backend;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod jack;
pub mod lifecycle;
pub mod manager;
pub mod path;
pub mod policy;
pub mod pool;
pub mod retry;
pub mod snapshot;

pub use backend::{BackendCall, GraphBackend, MemoryBackend};
pub use endpoint::{Acquirable, ConnectablePoint, ConnectableSet, Endpoint, HasName, Role};
pub use error::{BackendError, PolicyViolation, UnknownPolicy};
pub use events::{EventBus, EventKind, Handler, HandlerId, MessageBus, PatchEvent, Predicate};
pub use jack::JackCliBackend;
pub use lifecycle::{Lifecycle, LifecycleState, StateFlags, Transition};
pub use manager::ReconciliationManager;
pub use path::{path_name, Connector, SignalPath};
pub use policy::{ConnectionPolicy, PolicyEngine, Resolved};
pub use pool::WorkerPool;
pub use retry::{RetryOutcome, RetryPolicy};
pub use snapshot::{GraphSnapshot, SnapshotView, Topology};
