use crate::protocol::key::DaskKeyRef;
use crate::worker::data::DepState;
use crate::worker::state::WorkerState;
use crate::worker::task::TaskState;

/// Invariant checks over a single task record. Violations are programming
/// errors, never runtime conditions, and abort the worker.
pub fn validate_key(state: &WorkerState, key: &DaskKeyRef) {
    let task = match state.tasks.get(key) {
        Some(task) => task,
        None => panic!("validating unknown task {}", key),
    };
    match task.state {
        TaskState::Waiting => {
            for dep in &task.waiting_for_data {
                assert!(
                    state.deps.contains_key(dep)
                        || state.in_flight_tasks.contains_key(dep)
                        || state.missing_dep_flight.contains(dep),
                    "task {} waits for untracked dependency {}",
                    key,
                    dep
                );
            }
        }
        TaskState::Ready | TaskState::Constrained => {
            assert!(
                task.waiting_for_data.is_empty(),
                "ready task {} still waits for data",
                key
            );
            for dep in &task.dependencies {
                assert!(
                    state.data.contains_key(dep),
                    "ready task {} misses dependency {}",
                    key,
                    dep
                );
            }
        }
        TaskState::Executing => {
            assert!(
                state.executing.contains(key),
                "executing task {} is not in the executing set",
                key
            );
            assert!(
                !state.data.contains_key(key),
                "executing task {} already has a value",
                key
            );
        }
        TaskState::Memory => {
            assert!(state.data.contains_key(key), "task {} has no value", key);
            assert!(state.nbytes.contains_key(key), "task {} has no size", key);
            assert!(state.types.contains_key(key), "task {} has no type", key);
            assert!(task.waiting_for_data.is_empty());
            assert!(!state.executing.contains(key));
            assert!(
                !state.ready.iter().any(|entry| entry.key == key),
                "finished task {} is still enqueued as ready",
                key
            );
        }
        TaskState::Error => {
            assert!(
                state.exceptions.contains_key(key),
                "failed task {} has no exception",
                key
            );
        }
        TaskState::LongRunning => {}
    }
}

/// Invariant checks over a single dependency record, including the
/// bidirectional `who_has`/`has_what` consistency for this dep.
pub fn validate_dep(state: &WorkerState, dep: &DaskKeyRef) {
    let info = match state.deps.get(dep) {
        Some(info) => info,
        None => panic!("validating unknown dependency {}", dep),
    };
    for worker in &info.who_has {
        assert!(
            state
                .has_what
                .get(worker)
                .map(|advertised| advertised.contains(dep))
                .unwrap_or(false),
            "who_has/has_what mismatch for {} at {}",
            dep,
            worker
        );
    }
    match info.state {
        DepState::Waiting => {
            assert!(
                !info.dependents.is_empty(),
                "waiting dependency {} has no dependents",
                dep
            );
            assert!(
                state.nbytes.contains_key(dep),
                "waiting dependency {} has no size hint",
                dep
            );
        }
        DepState::Flight => {
            let worker = state
                .in_flight_tasks
                .get(dep)
                .unwrap_or_else(|| panic!("dependency {} in flight from nowhere", dep));
            assert!(
                state
                    .in_flight_workers
                    .get(worker)
                    .map(|batch| batch.contains(dep))
                    .unwrap_or(false),
                "dependency {} is not in the batch of {}",
                dep,
                worker
            );
        }
        DepState::Memory => {
            assert!(
                state.data.contains_key(dep),
                "dependency {} in memory has no value",
                dep
            );
        }
    }
}

/// Whole-store sweep: every task, every dep, the reverse `has_what`
/// direction and the connection budget.
pub fn validate_state(state: &WorkerState) {
    for key in state.tasks.keys() {
        validate_key(state, key);
    }
    for dep in state.deps.keys() {
        validate_dep(state, dep);
    }
    for (worker, advertised) in &state.has_what {
        for dep in advertised {
            assert!(
                state
                    .deps
                    .get(dep)
                    .map(|info| info.who_has.contains(worker))
                    .unwrap_or(false),
                "has_what/who_has mismatch for {} at {}",
                dep,
                worker
            );
        }
    }
    assert!(
        state.in_flight_workers.len() <= state.config.total_connections,
        "connection budget exceeded"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::reactor::add_task;
    use crate::worker::test_util::{compute_msg_with_dep, test_state_ref};
    use crate::worker::transitions::release_dep;

    #[test]
    fn test_who_has_symmetry_holds_through_lifecycle() {
        let (state_ref, _rx) = test_state_ref(1);
        let mut state = state_ref.get_mut();
        let peer = "tcp://10.0.0.2:4000";
        add_task(
            &mut state,
            compute_msg_with_dep("c", vec![0], "incr", "b", peer, 8),
        );
        validate_state(&state);

        let mut extra = crate::common::Map::default();
        extra.insert(
            "b".to_owned(),
            vec![peer.to_owned(), "tcp://10.0.0.3:4000".to_owned()],
        );
        state.update_who_has(extra);
        validate_state(&state);

        release_dep(&mut state, "b");
        assert!(state
            .has_what
            .values()
            .all(|advertised| !advertised.contains("b")));
        validate_state(&state);
    }

    #[test]
    #[should_panic(expected = "mismatch")]
    fn test_broken_symmetry_is_caught() {
        let (state_ref, _rx) = test_state_ref(1);
        let mut state = state_ref.get_mut();
        add_task(
            &mut state,
            compute_msg_with_dep("c", vec![0], "incr", "b", "tcp://10.0.0.2:4000", 8),
        );
        // sever one direction only
        state.has_what.clear();
        validate_state(&state);
    }
}
