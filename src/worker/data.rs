use crate::common::Set;
use crate::protocol::key::{DaskKey, WorkerAddress};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DepState {
    Waiting,
    Flight,
    Memory,
}

impl std::fmt::Display for DepState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            DepState::Waiting => "waiting",
            DepState::Flight => "flight",
            DepState::Memory => "memory",
        };
        f.write_str(name)
    }
}

/// A key this worker needs (or holds) on behalf of its assigned tasks,
/// created lazily when the first dependent task arrives and destroyed by
/// `release_dep`.
#[derive(Debug)]
pub struct DepInfo {
    pub state: DepState,
    /// Peers advertising this key. Kept bidirectionally consistent with
    /// the store's `has_what`.
    pub who_has: Set<WorkerAddress>,
    /// Task keys on this worker that read this key.
    pub dependents: Set<DaskKey>,
    /// Consecutive failed holder lookups; six failures poison the dep.
    pub suspicious_count: u32,
}

impl DepInfo {
    pub fn new(state: DepState) -> Self {
        Self {
            state,
            who_has: Default::default(),
            dependents: Default::default(),
            suspicious_count: 0,
        }
    }
}
