use serde::{Deserialize, Serialize};

use crate::common::data::Value;
use crate::common::{Map, Set};
use crate::protocol::key::DaskKey;
use crate::worker::loader::Callable;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    Waiting,
    Ready,
    Constrained,
    Executing,
    /// Reserved; no transition currently produces it.
    LongRunning,
    Memory,
    Error,
}

impl TaskState {
    /// States for which a release must be reported to the scheduler.
    #[inline]
    pub fn is_processing(&self) -> bool {
        matches!(
            self,
            TaskState::Waiting | TaskState::Ready | TaskState::Constrained | TaskState::Executing
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            TaskState::Waiting => "waiting",
            TaskState::Ready => "ready",
            TaskState::Constrained => "constrained",
            TaskState::Executing => "executing",
            TaskState::LongRunning => "long-running",
            TaskState::Memory => "memory",
            TaskState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Admission order: lexicographically lower tuples run earlier. The second
/// element is the worker-local assignment counter, so equal scheduler
/// priorities admit in submission order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority(pub Vec<i64>);

impl Priority {
    pub fn new(external: Vec<i64>, counter: i64) -> Self {
        let mut elements = external;
        let position = elements.len().min(1);
        elements.insert(position, counter);
        Priority(elements)
    }
}

#[derive(Debug)]
pub struct Task {
    pub key: DaskKey,
    pub state: TaskState,
    pub priority: Priority,
    /// Estimated compute cost in seconds, as hinted by the scheduler.
    pub duration: f64,
    pub resource_restrictions: Option<Map<String, f64>>,
    pub callable: Option<Callable>,
    pub args: Vec<Value>,
    pub kwargs: Map<DaskKey, Value>,
    pub future_handle: Option<Value>,
    pub dependencies: Set<DaskKey>,
    pub waiting_for_data: Set<DaskKey>,
}

impl Task {
    #[inline]
    pub fn is_waiting(&self) -> bool {
        self.state == TaskState::Waiting
    }

    #[inline]
    pub fn is_in_memory(&self) -> bool {
        self.state == TaskState::Memory
    }
}

/// Entry of the ready queue. Ordered so that a max-heap pops the lowest
/// priority first; ties fall back to the key for determinism.
#[derive(Debug)]
pub struct ReadyEntry {
    pub priority: Priority,
    pub key: DaskKey,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.key.cmp(&self.key))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for ReadyEntry {}
