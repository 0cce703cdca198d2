use std::fmt;

use tracing::debug;

/// Where a single run currently is.
///
/// A run only ever moves forward through
/// `Idle -> Mapping -> Shuffling -> Reducing -> Collecting -> Done`,
/// or drops straight to `Failed` from whichever phase went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    Mapping,
    Shuffling,
    Reducing,
    Collecting,
    Done,
    Failed,
}

impl Phase {
    /// The phase that follows this one on the success path.
    pub fn successor(self) -> Option<Phase> {
        match self {
            Phase::Idle => Some(Phase::Mapping),
            Phase::Mapping => Some(Phase::Shuffling),
            Phase::Shuffling => Some(Phase::Reducing),
            Phase::Reducing => Some(Phase::Collecting),
            Phase::Collecting => Some(Phase::Done),
            Phase::Done | Phase::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Mapping => "map",
            Phase::Shuffling => "shuffle",
            Phase::Reducing => "reduce",
            Phase::Collecting => "collect",
            Phase::Done => "done",
            Phase::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the phase of one run and logs every transition.
#[derive(Debug)]
pub(crate) struct PhaseTracker {
    current: Phase,
}

impl PhaseTracker {
    pub(crate) fn new() -> Self {
        Self {
            current: Phase::Idle,
        }
    }

    pub(crate) fn current(&self) -> Phase {
        self.current
    }

    /// Moves to the next phase on the success path and returns it.
    pub(crate) fn advance(&mut self) -> Phase {
        let next = self.current.successor().unwrap_or(self.current);
        debug_assert_ne!(next, self.current, "advanced past a terminal phase");
        debug!(from = %self.current, to = %next, "phase transition");
        self.current = next;
        next
    }

    pub(crate) fn fail(&mut self) {
        debug!(from = %self.current, "phase transition to failed");
        self.current = Phase::Failed;
    }
}
