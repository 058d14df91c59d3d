//! Connectable endpoints: single points and ordered sets of points.
//!
//! Capabilities are composed rather than inherited: everything has a name
//! ([`HasName`]), everything can be acquired and released ([`Acquirable`]),
//! and [`Endpoint`] tags whether a caller handed us a point or a set.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::lifecycle::{Lifecycle, LifecycleState};

/// Fixed direction of a point in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Source,
    Sink,
}

impl Role {
    pub fn is_sink(&self) -> bool {
        matches!(self, Self::Sink)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Sink => "sink",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub trait HasName {
    fn name(&self) -> &str;
}

/// Explicit acquire/release over a [`LifecycleState`].
pub trait Acquirable {
    fn state(&self) -> &LifecycleState;

    /// INITIAL + ACQUIRED. Returns false when already acquired.
    fn acquire(&self) -> bool {
        self.state().acquire()
    }

    /// REMOVED, not acquired. Returns false when already released.
    fn release(&self) -> bool {
        self.state().release()
    }

    fn is_acquired(&self) -> bool {
        self.state().is_acquired()
    }

    /// True only while the lifecycle is OK.
    fn is_active(&self) -> bool {
        self.state().lifecycle() == Lifecycle::Ok
    }
}

/// A single named endpoint with a fixed role.
#[derive(Debug)]
pub struct ConnectablePoint {
    name: String,
    role: Role,
    state: LifecycleState,
}

impl ConnectablePoint {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
            state: LifecycleState::new(),
        }
    }

    pub fn source(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(name, Role::Source))
    }

    pub fn sink(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(name, Role::Sink))
    }

    pub fn role(&self) -> Role {
        self.role
    }
}

impl HasName for ConnectablePoint {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Acquirable for ConnectablePoint {
    fn state(&self) -> &LifecycleState {
        &self.state
    }
}

/// Ordered group of points sharing one device lifecycle.
///
/// Acquiring or releasing the set acquires or releases every member.
#[derive(Debug)]
pub struct ConnectableSet {
    name: String,
    role: Role,
    state: LifecycleState,
    points: RwLock<Vec<Arc<ConnectablePoint>>>,
}

impl ConnectableSet {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
            state: LifecycleState::new(),
            points: RwLock::new(Vec::new()),
        }
    }

    /// Build a set whose members are created from `names`, in order.
    pub fn with_points<I, S>(name: impl Into<String>, role: Role, names: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set = Self::new(name, role);
        {
            let mut points = set.points.write();
            points.extend(
                names
                    .into_iter()
                    .map(|n| Arc::new(ConnectablePoint::new(n, role))),
            );
        }
        Arc::new(set)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Append a point. Points with the wrong role are refused.
    pub fn push(&self, point: Arc<ConnectablePoint>) -> bool {
        if point.role() != self.role {
            return false;
        }
        if self.is_acquired() {
            point.acquire();
        }
        self.points.write().push(point);
        true
    }

    /// Remove a point by name, returning it.
    pub fn remove(&self, name: &str) -> Option<Arc<ConnectablePoint>> {
        let mut points = self.points.write();
        let index = points.iter().position(|p| p.name() == name)?;
        Some(points.remove(index))
    }

    /// Ordered copy of the current members.
    pub fn points(&self) -> Vec<Arc<ConnectablePoint>> {
        self.points.read().clone()
    }

    pub fn len(&self) -> usize {
        self.points.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.read().is_empty()
    }
}

impl HasName for ConnectableSet {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Acquirable for ConnectableSet {
    fn state(&self) -> &LifecycleState {
        &self.state
    }

    fn acquire(&self) -> bool {
        let changed = self.state.acquire();
        for point in self.points.read().iter() {
            point.acquire();
        }
        changed
    }

    fn release(&self) -> bool {
        let changed = self.state.release();
        for point in self.points.read().iter() {
            point.release();
        }
        changed
    }
}

/// What a caller hands to the policy engine on either side of a route.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Point(Arc<ConnectablePoint>),
    Set(Arc<ConnectableSet>),
}

impl Endpoint {
    /// A single name becomes a point, several names become a set named after
    /// the first member's client.
    pub fn from_names(names: &[String], role: Role) -> Option<Self> {
        match names {
            [] => None,
            [single] => Some(Self::Point(Arc::new(ConnectablePoint::new(
                single.clone(),
                role,
            )))),
            many => {
                let set_name = crate::snapshot::client_of(&many[0])
                    .unwrap_or(&many[0])
                    .to_string();
                Some(Self::Set(ConnectableSet::with_points(
                    set_name,
                    role,
                    many.iter().cloned(),
                )))
            }
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Self::Point(p) => p.role(),
            Self::Set(s) => s.role(),
        }
    }

    pub fn is_set(&self) -> bool {
        matches!(self, Self::Set(_))
    }

    /// Resolved points, in order. A point resolves to itself.
    pub fn points(&self) -> Vec<Arc<ConnectablePoint>> {
        match self {
            Self::Point(p) => vec![Arc::clone(p)],
            Self::Set(s) => s.points(),
        }
    }

    pub fn acquirable(&self) -> &dyn Acquirable {
        match self {
            Self::Point(p) => p.as_ref(),
            Self::Set(s) => s.as_ref(),
        }
    }
}

impl HasName for Endpoint {
    fn name(&self) -> &str {
        match self {
            Self::Point(p) => p.name(),
            Self::Set(s) => s.name(),
        }
    }
}

impl From<Arc<ConnectablePoint>> for Endpoint {
    fn from(point: Arc<ConnectablePoint>) -> Self {
        Self::Point(point)
    }
}

impl From<Arc<ConnectableSet>> for Endpoint {
    fn from(set: Arc<ConnectableSet>) -> Self {
        Self::Set(set)
    }
}
