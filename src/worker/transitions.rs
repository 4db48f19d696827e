use crate::common::data::{value_nbytes, value_type_name, Value};
use crate::protocol::key::{DaskKeyRef, WorkerAddress};
use crate::protocol::workermsg::{ReleaseMsg, ToSchedulerMessage};
use crate::worker::data::DepState;
use crate::worker::state::WorkerState;
use crate::worker::task::{ReadyEntry, TaskState};
use crate::worker::validate::{validate_dep, validate_key};

/// Target of a task transition. Payload-carrying edges are explicit: the
/// memory edge distinguishes "result provided" from "result already
/// installed through another path" with an option, never a sentinel value.
#[derive(Debug)]
pub enum TaskTarget {
    Ready,
    Executing,
    Memory(Option<Value>),
    Error {
        exception: String,
        traceback: String,
    },
}

impl TaskTarget {
    fn state(&self) -> TaskState {
        match self {
            TaskTarget::Ready => TaskState::Ready,
            TaskTarget::Executing => TaskState::Executing,
            TaskTarget::Memory(_) => TaskState::Memory,
            TaskTarget::Error { .. } => TaskState::Error,
        }
    }
}

#[derive(Debug)]
pub enum DepTarget {
    Flight { worker: WorkerAddress },
    Waiting,
    Memory(Option<Value>),
}

impl DepTarget {
    fn state(&self) -> DepState {
        match self {
            DepTarget::Flight { .. } => DepState::Flight,
            DepTarget::Waiting => DepState::Waiting,
            DepTarget::Memory(_) => DepState::Memory,
        }
    }
}

/// Dispatches a task transition. Illegal edges are programming errors and
/// abort; a transition onto the current state is a warned no-op.
pub fn transition(state: &mut WorkerState, key: &DaskKeyRef, target: TaskTarget) {
    let from = match state.task_state(key) {
        Some(from) => from,
        None => {
            log::warn!("transition of unknown task {}", key);
            return;
        }
    };
    if from == target.state() {
        log::warn!("no-op transition of task {} ({})", key, from);
        return;
    }
    log::debug!("task {}: {} -> {}", key, from, target.state());
    match (from, target) {
        (TaskState::Waiting, TaskTarget::Ready) => transition_waiting_ready(state, key),
        (TaskState::Waiting, TaskTarget::Memory(value)) => {
            transition_waiting_memory(state, key, value)
        }
        (TaskState::Waiting, TaskTarget::Error {
            exception,
            traceback,
        }) => transition_waiting_error(state, key, exception, traceback),
        (TaskState::Ready, TaskTarget::Executing) => transition_ready_executing(state, key),
        (TaskState::Ready, TaskTarget::Memory(value)) => transition_ready_memory(state, key, value),
        (TaskState::Constrained, TaskTarget::Executing) => {
            transition_constrained_executing(state, key)
        }
        (TaskState::Executing, TaskTarget::Memory(value)) => {
            transition_executing_memory(state, key, value)
        }
        (TaskState::Executing, TaskTarget::Error {
            exception,
            traceback,
        }) => transition_executing_error(state, key, exception, traceback),
        (from, target) => panic!(
            "invalid transition of task {}: {} -> {}",
            key,
            from,
            target.state()
        ),
    }
    if state.config.validate {
        validate_key(state, key);
    }
}

fn transition_waiting_ready(state: &mut WorkerState, key: &DaskKeyRef) {
    let task = state.tasks.get_mut(key).unwrap();
    task.waiting_for_data.clear();
    if task.resource_restrictions.is_some() {
        task.state = TaskState::Constrained;
        state.constrained.push_back(key.to_owned());
    } else {
        task.state = TaskState::Ready;
        let entry = ReadyEntry {
            priority: task.priority.clone(),
            key: key.to_owned(),
        };
        state.ready.push(entry);
    }
}

fn transition_waiting_memory(state: &mut WorkerState, key: &DaskKeyRef, value: Option<Value>) {
    let task = state.tasks.get_mut(key).unwrap();
    task.waiting_for_data.clear();
    task.state = TaskState::Memory;
    if let Some(value) = value {
        put_key_in_memory(state, key, value);
    } else if !state.data.contains_key(key) {
        log::error!("task {} moved to memory without a value", key);
    }
    state.send_task_state_to_scheduler(key);
}

fn transition_waiting_error(
    state: &mut WorkerState,
    key: &DaskKeyRef,
    exception: String,
    traceback: String,
) {
    let task = state.tasks.get_mut(key).unwrap();
    task.waiting_for_data.clear();
    task.state = TaskState::Error;
    state.exceptions.insert(key.to_owned(), exception);
    state.tracebacks.insert(key.to_owned(), traceback);
    state.send_task_state_to_scheduler(key);
}

fn transition_ready_executing(state: &mut WorkerState, key: &DaskKeyRef) {
    let task = state.tasks.get_mut(key).unwrap();
    task.state = TaskState::Executing;
    state.executing.insert(key.to_owned());
}

fn transition_ready_memory(state: &mut WorkerState, key: &DaskKeyRef, value: Option<Value>) {
    // A peer delivered the computed result before we ran the task.
    state.ready.retain(|entry| entry.key != key);
    let task = state.tasks.get_mut(key).unwrap();
    task.state = TaskState::Memory;
    if let Some(value) = value {
        put_key_in_memory(state, key, value);
    }
    state.send_task_state_to_scheduler(key);
}

fn transition_constrained_executing(state: &mut WorkerState, key: &DaskKeyRef) {
    let restrictions = state
        .tasks
        .get(key)
        .and_then(|task| task.resource_restrictions.clone())
        .unwrap_or_default();
    state.deduct_resources(&restrictions);
    let task = state.tasks.get_mut(key).unwrap();
    task.state = TaskState::Executing;
    state.executing.insert(key.to_owned());
}

fn transition_executing_memory(state: &mut WorkerState, key: &DaskKeyRef, value: Option<Value>) {
    let restrictions = state
        .tasks
        .get(key)
        .and_then(|task| task.resource_restrictions.clone());
    if let Some(restrictions) = &restrictions {
        state.refund_resources(restrictions);
    }
    state.executing.remove(key);
    state.executed_count += 1;
    state.tasks.get_mut(key).unwrap().state = TaskState::Memory;
    match value {
        Some(value) => put_key_in_memory(state, key, value),
        None => {
            if !state.data.contains_key(key) {
                log::error!("task {} finished executing without a value", key);
            }
        }
    }
    if state.deps.contains_key(key) {
        dep_transition(state, key, DepTarget::Memory(None));
    }
    state.send_task_state_to_scheduler(key);
}

fn transition_executing_error(
    state: &mut WorkerState,
    key: &DaskKeyRef,
    exception: String,
    traceback: String,
) {
    let restrictions = state
        .tasks
        .get(key)
        .and_then(|task| task.resource_restrictions.clone());
    if let Some(restrictions) = &restrictions {
        state.refund_resources(restrictions);
    }
    state.executing.remove(key);
    let task = state.tasks.get_mut(key).unwrap();
    task.state = TaskState::Error;
    state.exceptions.insert(key.to_owned(), exception);
    state.tracebacks.insert(key.to_owned(), traceback);
    state.send_task_state_to_scheduler(key);
}

/// Dispatches a dependency transition, mirroring the task dispatcher.
pub fn dep_transition(state: &mut WorkerState, dep: &DaskKeyRef, target: DepTarget) {
    let from = match state.dep_state(dep) {
        Some(from) => from,
        None => {
            log::debug!("transition of unknown dependency {}", dep);
            return;
        }
    };
    if from == target.state() {
        log::warn!("no-op transition of dependency {} ({})", dep, from);
        return;
    }
    log::debug!("dep {}: {} -> {}", dep, from, target.state());
    match (from, target) {
        (DepState::Waiting, DepTarget::Flight { worker }) => {
            state.in_flight_tasks.insert(dep.to_owned(), worker);
            state.deps.get_mut(dep).unwrap().state = DepState::Flight;
        }
        (DepState::Flight, DepTarget::Waiting) => transition_dep_flight_waiting(state, dep),
        (DepState::Flight, DepTarget::Memory(value)) => {
            state.in_flight_tasks.remove(dep);
            state.deps.get_mut(dep).unwrap().state = DepState::Memory;
            if let Some(value) = value {
                put_key_in_memory(state, dep, value);
            }
        }
        (DepState::Waiting, DepTarget::Memory(value)) => {
            // The result arrived through the compute path already.
            state.deps.get_mut(dep).unwrap().state = DepState::Memory;
            debug_assert!(value.is_none() || state.data.contains_key(dep));
            log::debug!("dependency {} resolved locally", dep);
        }
        (from, target) => panic!(
            "invalid transition of dependency {}: {} -> {}",
            dep,
            from,
            target.state()
        ),
    }
    if state.config.validate && state.deps.contains_key(dep) {
        validate_dep(state, dep);
    }
}

fn transition_dep_flight_waiting(state: &mut WorkerState, dep: &DaskKeyRef) {
    let worker = state.in_flight_tasks.remove(dep);
    let info = state.deps.get_mut(dep).unwrap();
    info.state = DepState::Waiting;
    if let Some(worker) = worker {
        info.who_has.remove(&worker);
        if let Some(advertised) = state.has_what.get_mut(&worker) {
            advertised.remove(dep);
        }
    }

    let info = state.deps.get(dep).unwrap();
    if info.who_has.is_empty() && !state.missing_dep_flight.contains(dep) {
        state.missing_dep_flight.insert(dep.to_owned());
        state.pending_missing.push(dep.to_owned());
    }
    let dependents: Vec<_> = info.dependents.iter().cloned().collect();
    for key in &dependents {
        if state.task_state(key) == Some(TaskState::Waiting) {
            state.data_needed.push_front(key.clone());
        }
    }
    if dependents.is_empty() {
        release_dep(state, dep);
    }
}

/// The single writer of `data`. Installing a key that is already resident
/// is a no-op; otherwise the value is recorded together with its size and
/// runtime type, every dependent stops waiting for it, and a local task
/// record of the same key is promoted to memory.
pub fn put_key_in_memory(state: &mut WorkerState, key: &DaskKeyRef, value: Value) {
    if state.data.contains_key(key) {
        log::debug!("key {} is already in memory", key);
    } else {
        state.nbytes.insert(key.to_owned(), value_nbytes(&value));
        state
            .types
            .insert(key.to_owned(), value_type_name(&value).to_owned());
        state.data.insert(key.to_owned(), value);
    }

    let dependents: Vec<_> = state
        .deps
        .get(key)
        .map(|info| info.dependents.iter().cloned().collect())
        .unwrap_or_default();
    for dependent in dependents {
        let became_ready = match state.tasks.get_mut(&dependent) {
            Some(task) => {
                task.waiting_for_data.remove(key);
                task.is_waiting() && task.waiting_for_data.is_empty()
            }
            None => false,
        };
        if became_ready {
            transition(state, &dependent, TaskTarget::Ready);
        }
    }

    match state.task_state(key) {
        Some(TaskState::Waiting) | Some(TaskState::Ready) => {
            transition(state, key, TaskTarget::Memory(None));
        }
        _ => {}
    }
}

/// Removes a task record and everything it owns. A `stolen` release is
/// refused for finished or running work; releasing a still-processing task
/// notifies the scheduler.
pub fn release_key(
    state: &mut WorkerState,
    key: &DaskKeyRef,
    cause: Option<&DaskKeyRef>,
    reason: Option<&str>,
) {
    let task_state = match state.task_state(key) {
        Some(task_state) => task_state,
        None => return,
    };
    if reason == Some("stolen")
        && matches!(task_state, TaskState::Executing | TaskState::Memory)
    {
        log::debug!("refusing to release stolen key {} in state {}", key, task_state);
        return;
    }
    log::debug!("releasing key {} (cause: {:?})", key, cause);
    let task = state.tasks.remove(key).unwrap();

    for dep in &task.dependencies {
        let orphaned = match state.deps.get_mut(dep) {
            Some(info) => {
                info.dependents.remove(key);
                info.dependents.is_empty() && info.state == DepState::Waiting
            }
            None => false,
        };
        if orphaned {
            release_dep(state, dep);
        }
    }

    if !state.deps.contains_key(key) {
        state.data.remove(key);
        state.types.remove(key);
        state.nbytes.remove(key);
    }
    state.exceptions.remove(key);
    state.tracebacks.remove(key);
    state.startstops.remove(key);
    state.executing.remove(key);

    if task_state.is_processing() {
        state.send_to_scheduler(ToSchedulerMessage::Release(ReleaseMsg {
            key: key.to_owned(),
            cause: cause.map(|c| c.to_owned()),
        }));
    }
}

/// Removes a dependency record; dependents that are not finished are
/// cascaded through `release_key` with this dep as the cause.
pub fn release_dep(state: &mut WorkerState, dep: &DaskKeyRef) {
    let info = match state.deps.remove(dep) {
        Some(info) => info,
        None => return,
    };
    log::debug!("releasing dependency {}", dep);
    state.in_flight_tasks.remove(dep);
    state.missing_dep_flight.remove(dep);
    for worker in &info.who_has {
        if let Some(advertised) = state.has_what.get_mut(worker) {
            advertised.remove(dep);
        }
    }

    if !state.tasks.contains_key(dep) {
        state.data.remove(dep);
        state.types.remove(dep);
        state.nbytes.remove(dep);
    }

    for key in &info.dependents {
        let finished = match state.tasks.get_mut(key) {
            Some(task) => {
                task.dependencies.remove(dep);
                task.waiting_for_data.remove(dep);
                task.is_in_memory()
            }
            None => continue,
        };
        if !finished {
            release_key(state, key, Some(dep), None);
        }
    }
}

/// Poisons a dependency whose holders could not be found: every dependent
/// task fails with an error naming the dep, then the dep is released.
pub fn bad_dep(state: &mut WorkerState, dep: &DaskKeyRef) {
    log::warn!("no holders found for dependency {}, failing its dependents", dep);
    let dependents: Vec<_> = state
        .deps
        .get(dep)
        .map(|info| info.dependents.iter().cloned().collect())
        .unwrap_or_default();
    for key in dependents {
        match state.task_state(&key) {
            Some(TaskState::Waiting) => {
                let message = format!("Could not find dependent {}", dep);
                transition(
                    state,
                    &key,
                    TaskTarget::Error {
                        exception: message.clone(),
                        traceback: message,
                    },
                );
            }
            other => log::warn!("dependent {} of bad dep {} is in state {:?}", key, dep, other),
        }
    }
    release_dep(state, dep);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::data::Value;
    use crate::protocol::workermsg::ToSchedulerMessage;
    use crate::worker::reactor::{add_task, admit_tasks};
    use crate::worker::task::TaskState;
    use crate::worker::test_util::{compute_msg, compute_msg_with_dep, drain_messages, test_state_ref};

    #[test]
    fn test_data_is_written_once() {
        let (state_ref, _rx) = test_state_ref(1);
        let mut state = state_ref.get_mut();
        put_key_in_memory(&mut state, "x", Value::from(1));
        put_key_in_memory(&mut state, "x", Value::from(2));
        assert_eq!(state.data["x"], Value::from(1));
        assert_eq!(state.nbytes["x"], 8);
        assert_eq!(state.types["x"], "Int64");
    }

    #[test]
    fn test_arriving_dep_readies_waiting_task() {
        let (state_ref, _rx) = test_state_ref(1);
        let mut state = state_ref.get_mut();
        add_task(
            &mut state,
            compute_msg_with_dep("c", vec![0], "incr", "b", "tcp://10.0.0.2:4000", 8),
        );
        assert_eq!(state.task_state("c"), Some(TaskState::Waiting));

        state
            .in_flight_workers
            .entry("tcp://10.0.0.2:4000".to_owned())
            .or_default()
            .insert("b".to_owned());
        dep_transition(&mut state, "b", DepTarget::Flight {
            worker: "tcp://10.0.0.2:4000".to_owned(),
        });
        state.in_flight_workers.remove("tcp://10.0.0.2:4000");
        dep_transition(&mut state, "b", DepTarget::Memory(Some(Value::from(7))));

        assert_eq!(state.task_state("c"), Some(TaskState::Ready));
        assert!(state.tasks["c"].waiting_for_data.is_empty());
    }

    #[test]
    fn test_fetch_failure_returns_dep_to_waiting() {
        let (state_ref, _rx) = test_state_ref(1);
        let mut state = state_ref.get_mut();
        let peer = "tcp://10.0.0.2:4000";
        add_task(
            &mut state,
            compute_msg_with_dep("c", vec![0], "incr", "b", peer, 8),
        );
        // second holder so the dep does not become missing
        state
            .deps
            .get_mut("b")
            .unwrap()
            .who_has
            .insert("tcp://10.0.0.3:4000".to_owned());
        state
            .has_what
            .entry("tcp://10.0.0.3:4000".to_owned())
            .or_default()
            .insert("b".to_owned());
        state.data_needed.clear();

        state
            .in_flight_workers
            .entry(peer.to_owned())
            .or_default()
            .insert("b".to_owned());
        dep_transition(&mut state, "b", DepTarget::Flight {
            worker: peer.to_owned(),
        });
        state.in_flight_workers.remove(peer);
        dep_transition(&mut state, "b", DepTarget::Waiting);

        let info = &state.deps["b"];
        assert_eq!(info.state, DepState::Waiting);
        assert!(!info.who_has.contains(peer));
        assert!(!state.has_what.get(peer).map(|s| s.contains("b")).unwrap_or(false));
        // the dependent is re-headed for another fetch round
        assert_eq!(state.data_needed.front().map(|k| k.as_str()), Some("c"));
        assert!(state.missing_dep_flight.is_empty());
    }

    #[test]
    fn test_resources_are_conserved() {
        let (state_ref, _rx) = test_state_ref(4);
        let mut state = state_ref.get_mut();
        state.config.resources.insert("GPU".to_owned(), 2.0);
        state.available_resources.insert("GPU".to_owned(), 2.0);
        let mut msg = compute_msg("t", vec![0], "const42");
        msg.resource_restrictions = Some([("GPU".to_owned(), 2.0)].into_iter().collect());
        add_task(&mut state, msg);

        let admitted = admit_tasks(&mut state);
        assert_eq!(admitted, vec!["t".to_owned()]);
        assert_eq!(state.available_resources["GPU"], 0.0);

        transition(&mut state, "t", TaskTarget::Error {
            exception: "boom".to_owned(),
            traceback: "boom".to_owned(),
        });
        assert_eq!(state.available_resources["GPU"], 2.0);
    }

    #[test]
    #[should_panic(expected = "invalid transition")]
    fn test_illegal_edge_is_rejected() {
        let (state_ref, _rx) = test_state_ref(1);
        let mut state = state_ref.get_mut();
        add_task(
            &mut state,
            compute_msg_with_dep("c", vec![0], "incr", "b", "tcp://10.0.0.2:4000", 8),
        );
        // waiting -> executing is not an edge
        transition(&mut state, "c", TaskTarget::Executing);
    }

    #[test]
    fn test_same_state_transition_is_noop() {
        let (state_ref, _rx) = test_state_ref(1);
        let mut state = state_ref.get_mut();
        add_task(&mut state, compute_msg("a", vec![0], "const42"));
        transition(&mut state, "a", TaskTarget::Ready);
        assert_eq!(state.task_state("a"), Some(TaskState::Ready));
    }

    #[test]
    fn test_bad_dep_fails_dependents() {
        let (state_ref, mut rx) = test_state_ref(1);
        let mut state = state_ref.get_mut();
        add_task(
            &mut state,
            compute_msg_with_dep("d", vec![0], "identity", "e", "tcp://10.0.0.2:4000", 8),
        );
        drain_messages(&mut rx);

        bad_dep(&mut state, "e");

        assert!(!state.deps.contains_key("e"));
        assert!(state.task_state("d").is_none());
        let messages = drain_messages(&mut rx);
        assert!(messages.iter().any(|message| matches!(
            message,
            ToSchedulerMessage::TaskErred(m)
                if m.key == "d" && m.traceback.contains("Could not find dependent e")
        )));
    }

    #[test]
    fn test_release_dep_keeps_data_owned_by_task() {
        let (state_ref, _rx) = test_state_ref(1);
        let mut state = state_ref.get_mut();
        add_task(&mut state, compute_msg("a", vec![0], "const42"));
        let admitted = admit_tasks(&mut state);
        assert_eq!(admitted, vec!["a".to_owned()]);
        transition(&mut state, "a", TaskTarget::Memory(Some(Value::from(42))));

        // another worker announced "a" as its dependency source
        state
            .deps
            .insert("a".to_owned(), crate::worker::data::DepInfo::new(DepState::Memory));
        release_dep(&mut state, "a");
        // the task still owns its result
        assert_eq!(state.data["a"], Value::from(42));

        release_key(&mut state, "a", None, None);
        assert!(!state.data.contains_key("a"));
    }
}
