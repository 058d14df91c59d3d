//! Lifecycle state shared by points, sets and paths.
//!
//! One of INITIAL, OK, STALE, REMOVED plus an orthogonal ACQUIRED bit,
//! packed into a single atomic byte so readers never observe a torn value.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Raw flag layout of a [`LifecycleState`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StateFlags: u8 {
        const INITIAL = 1 << 0;
        const OK = 1 << 1;
        const STALE = 1 << 2;
        const REMOVED = 1 << 3;
        const ACQUIRED = 1 << 4;

        /// Mask covering the mutually exclusive lifecycle bits.
        const LIFECYCLE = Self::INITIAL.bits()
            | Self::OK.bits()
            | Self::STALE.bits()
            | Self::REMOVED.bits();
    }
}

/// The mutually exclusive part of a lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    Initial,
    Ok,
    Stale,
    Removed,
}

impl Lifecycle {
    pub fn flag(self) -> StateFlags {
        match self {
            Self::Initial => StateFlags::INITIAL,
            Self::Ok => StateFlags::OK,
            Self::Stale => StateFlags::STALE,
            Self::Removed => StateFlags::REMOVED,
        }
    }

    fn from_flags(flags: StateFlags) -> Self {
        let lifecycle = flags & StateFlags::LIFECYCLE;
        if lifecycle == StateFlags::OK {
            Self::Ok
        } else if lifecycle == StateFlags::STALE {
            Self::Stale
        } else if lifecycle == StateFlags::REMOVED {
            Self::Removed
        } else {
            Self::Initial
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Ok => "ok",
            Self::Stale => "stale",
            Self::Removed => "removed",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a reconciliation pass observed for one tracked item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// INITIAL -> OK
    Added,
    /// OK -> STALE
    Lost,
    /// STALE -> OK
    Found,
    /// Released but still present in the graph.
    Zombie,
}

/// Self-synchronized lifecycle value.
///
/// Setting the lifecycle never touches ACQUIRED and vice versa.
#[derive(Debug)]
pub struct LifecycleState {
    bits: AtomicU8,
}

impl LifecycleState {
    /// INITIAL, not acquired.
    pub fn new() -> Self {
        Self {
            bits: AtomicU8::new(StateFlags::INITIAL.bits()),
        }
    }

    pub fn flags(&self) -> StateFlags {
        StateFlags::from_bits_truncate(self.bits.load(Ordering::Acquire))
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_flags(self.flags())
    }

    pub fn is_acquired(&self) -> bool {
        self.flags().contains(StateFlags::ACQUIRED)
    }

    pub fn is_ok(&self) -> bool {
        self.lifecycle() == Lifecycle::Ok
    }

    /// Replace the lifecycle, preserving ACQUIRED. Returns the previous lifecycle.
    pub fn set_lifecycle(&self, lifecycle: Lifecycle) -> Lifecycle {
        let prev = self.update(|flags| (flags - StateFlags::LIFECYCLE) | lifecycle.flag());
        Lifecycle::from_flags(prev)
    }

    /// Toggle ACQUIRED, preserving the lifecycle. Returns the previous value.
    pub fn set_acquired(&self, acquired: bool) -> bool {
        let prev = self.update(|mut flags| {
            flags.set(StateFlags::ACQUIRED, acquired);
            flags
        });
        prev.contains(StateFlags::ACQUIRED)
    }

    /// Atomically set both halves. Returns the previous flags.
    pub fn set(&self, lifecycle: Lifecycle, acquired: bool) -> StateFlags {
        self.update(|_| {
            let mut flags = lifecycle.flag();
            flags.set(StateFlags::ACQUIRED, acquired);
            flags
        })
    }

    /// Mark acquired and reset to INITIAL. Returns false if it was already acquired.
    pub fn acquire(&self) -> bool {
        let mut changed = false;
        self.update(|flags| {
            if flags.contains(StateFlags::ACQUIRED) {
                changed = false;
                flags
            } else {
                changed = true;
                StateFlags::INITIAL | StateFlags::ACQUIRED
            }
        });
        changed
    }

    /// Mark REMOVED and not acquired. Returns false if it was already released.
    pub fn release(&self) -> bool {
        let prev = self.set(Lifecycle::Removed, false);
        prev != StateFlags::REMOVED
    }

    /// Apply the presence transition table.
    ///
    /// Only acquired items move; REMOVED is terminal and reports a zombie
    /// while still present.
    pub fn observe(&self, present: bool) -> Option<Transition> {
        let flags = self.flags();
        let lifecycle = Lifecycle::from_flags(flags);

        if lifecycle == Lifecycle::Removed {
            return present.then_some(Transition::Zombie);
        }
        if !flags.contains(StateFlags::ACQUIRED) {
            return None;
        }

        let (next, transition) = match (lifecycle, present) {
            (Lifecycle::Initial, true) => (Lifecycle::Ok, Transition::Added),
            (Lifecycle::Ok, false) => (Lifecycle::Stale, Transition::Lost),
            (Lifecycle::Stale, true) => (Lifecycle::Ok, Transition::Found),
            _ => return None,
        };

        // A concurrent release wins over the pass
        let mut applied = false;
        self.update(|current| {
            if current == flags {
                applied = true;
                (current - StateFlags::LIFECYCLE) | next.flag()
            } else {
                applied = false;
                current
            }
        });
        applied.then_some(transition)
    }

    fn update(&self, mut f: impl FnMut(StateFlags) -> StateFlags) -> StateFlags {
        let prev = self
            .bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some(f(StateFlags::from_bits_truncate(bits)).bits())
            })
            .unwrap_or_else(|bits| bits);
        StateFlags::from_bits_truncate(prev)
    }
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_acquired() {
            write!(f, "{}+acquired", self.lifecycle())
        } else {
            write!(f, "{}", self.lifecycle())
        }
    }
}
