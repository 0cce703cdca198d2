//! Failure taxonomy for a run.
//!
//! User code reports failures through [`anyhow::Error`]; the engine turns each
//! one into a [`TaskFailure`] naming the record or key it belongs to, and a run
//! that saw any of them fails as a whole.

use std::fmt::{self, Debug};

use thiserror::Error;
use tokio::task::JoinError;

use crate::standalone::phase::Phase;

pub type MapReduceResult<T> = Result<T, MapReduceError>;

#[derive(Debug, Error)]
pub enum MapReduceError {
    #[error(
        "{phase} stage failed: {} task(s) could not be processed ({})",
        failures.len(),
        summarize(failures)
    )]
    TaskFailures {
        phase: Phase,
        failures: Vec<TaskFailure>,
    },

    #[error("run cancelled during {phase} stage")]
    Cancelled { phase: Phase },

    #[error("a {phase} worker exited without reporting completion")]
    WorkerLost {
        phase: Phase,
        #[source]
        source: JoinError,
    },

    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),
}

impl MapReduceError {
    /// The phase the run was in when it failed.
    pub fn phase(&self) -> Phase {
        match self {
            MapReduceError::TaskFailures { phase, .. }
            | MapReduceError::Cancelled { phase }
            | MapReduceError::WorkerLost { phase, .. } => *phase,
            MapReduceError::InvalidConfig(_) => Phase::Idle,
        }
    }

    pub fn failures(&self) -> &[TaskFailure] {
        match self {
            MapReduceError::TaskFailures { failures, .. } => failures,
            _ => &[],
        }
    }

    /// Indices of the input records that could not be read or mapped.
    pub fn failed_records(&self) -> Vec<usize> {
        let mut records: Vec<usize> = self
            .failures()
            .iter()
            .filter_map(|failure| match failure.task {
                TaskId::Input(index) | TaskId::Record(index) => Some(index),
                TaskId::Key(_) => None,
            })
            .collect();
        records.sort_unstable();
        records
    }

    /// Keys whose reduction failed, as rendered in the failure report.
    pub fn failed_keys(&self) -> Vec<&str> {
        self.failures()
            .iter()
            .filter_map(|failure| match &failure.task {
                TaskId::Key(key) => Some(key.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, MapReduceError::Cancelled { .. })
    }
}

fn summarize(failures: &[TaskFailure]) -> String {
    const SHOWN: usize = 3;
    let mut parts: Vec<String> = failures
        .iter()
        .take(SHOWN)
        .map(ToString::to_string)
        .collect();
    if failures.len() > SHOWN {
        parts.push(format!("and {} more", failures.len() - SHOWN));
    }
    parts.join("; ")
}

/// Identifies the unit of work a failure belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskId {
    /// An input record that was malformed before it could be dispatched.
    Input(usize),
    /// A map invocation over the record at this index.
    Record(usize),
    /// A reduce invocation over this key.
    Key(String),
}

impl TaskId {
    pub fn key<K: Debug + ?Sized>(key: &K) -> Self {
        TaskId::Key(format!("{key:?}"))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskId::Input(index) => write!(f, "input record #{index}"),
            TaskId::Record(index) => write!(f, "record #{index}"),
            TaskId::Key(key) => write!(f, "key {key}"),
        }
    }
}

/// A single map or reduce invocation that did not produce output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{task}: {reason}")]
pub struct TaskFailure {
    pub task: TaskId,
    pub reason: String,
}

impl TaskFailure {
    pub fn new(task: TaskId, reason: impl Into<String>) -> Self {
        Self {
            task,
            reason: reason.into(),
        }
    }

    /// Builds a failure from an error returned by user code, keeping its
    /// whole context chain.
    pub fn from_error(task: TaskId, err: &anyhow::Error) -> Self {
        Self::new(task, format!("{err:#}"))
    }
}
