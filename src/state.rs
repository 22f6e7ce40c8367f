//! Predecessor-table state machines.
//!
//! A state type lists, for every state, the states it may be entered from.
//! [`StateCell`] checks that table on every transition. Types that declare
//! an illegal state are moved into it when a transition is rejected, so a
//! protocol violation is never silently absorbed.
//!
//! Used for [`ConnectionState`] (connections and clients) and for stream
//! channel states.

use std::fmt;

use parking_lot::Mutex;

/// A state enum with a legal-predecessor table.
pub trait StateTable: Copy + Eq + fmt::Debug + Send + 'static {
    /// States this state may be entered from.
    fn predecessors(self) -> &'static [Self];

    /// Sink state for rejected transitions, if the machine has one.
    fn illegal_state() -> Option<Self> {
        None
    }

    /// Check `from -> to` against the table.
    fn can_transition(from: Self, to: Self) -> bool {
        to.predecessors().contains(&from)
    }
}

/// A transition rejected by the predecessor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalTransition<S> {
    /// State before the attempt.
    pub from: S,
    /// Requested state.
    pub to: S,
}

impl<S: fmt::Debug> fmt::Display for IllegalTransition<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal transition {:?} -> {:?}", self.from, self.to)
    }
}

/// A thread-safe cell holding one state of `S`.
#[derive(Debug)]
pub struct StateCell<S: StateTable> {
    current: Mutex<S>,
}

impl<S: StateTable> StateCell<S> {
    /// Create a cell in `initial`.
    pub fn new(initial: S) -> Self {
        Self {
            current: Mutex::new(initial),
        }
    }

    /// Current state.
    pub fn get(&self) -> S {
        *self.current.lock()
    }

    /// Move to `to`, returning the previous state.
    ///
    /// On a rejected transition the cell moves to `S::illegal_state()` when
    /// the machine defines one, and stays put otherwise.
    pub fn transition(&self, to: S) -> Result<S, IllegalTransition<S>> {
        let mut current = self.current.lock();
        let from = *current;
        if S::can_transition(from, to) {
            *current = to;
            return Ok(from);
        }
        if let Some(illegal) = S::illegal_state() {
            *current = illegal;
        }
        Err(IllegalTransition { from, to })
    }

    /// Move to `to` only if the table allows it; never marks the cell
    /// illegal. Used where a refused transition is an expected race
    /// (e.g. a second close).
    pub fn try_transition(&self, to: S) -> Option<S> {
        let mut current = self.current.lock();
        let from = *current;
        if S::can_transition(from, to) {
            *current = to;
            Some(from)
        } else {
            None
        }
    }
}

/// Lifecycle of a connection or client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, not yet usable.
    New,
    /// Socket established and handshake done.
    Connected,
    /// Client waiting for the background reconnect loop.
    Reconnecting,
    /// Terminal.
    Closed,
}

impl StateTable for ConnectionState {
    fn predecessors(self) -> &'static [Self] {
        use ConnectionState::*;
        match self {
            New => &[],
            Connected => &[New, Reconnecting],
            Reconnecting => &[New, Connected],
            Closed => &[New, Connected, Reconnecting],
        }
    }
}
