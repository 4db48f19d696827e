use crate::common::data::Value;
use crate::common::{unix_time, Map};
use crate::protocol::key::DaskKey;
use crate::protocol::workermsg::{ComputeTaskMsg, RemoveKeysMsg, ToSchedulerMessage};
use crate::worker::data::{DepInfo, DepState};
use crate::worker::gather::ensure_communicating;
use crate::worker::state::{WorkerState, WorkerStateRef};
use crate::worker::task::{Priority, Task, TaskState};
use crate::worker::transitions::{
    release_dep, release_key, transition, TaskTarget,
};
use crate::worker::validate::validate_dep;

/// Promotes ready and constrained tasks into execution. Admission per
/// invocation is bounded by `ncores`; every execution completion invokes
/// the loop again, so a long ready queue cannot starve other activities.
pub fn ensure_computing(state_ref: &WorkerStateRef) {
    let admitted = {
        let mut state = state_ref.get_mut();
        admit_tasks(&mut state)
    };
    for key in admitted {
        let state_ref = state_ref.clone();
        tokio::task::spawn_local(async move {
            execute(state_ref, key).await;
        });
    }
}

pub(crate) fn admit_tasks(state: &mut WorkerState) -> Vec<DaskKey> {
    let mut admitted = Vec::new();
    let ncores = state.config.ncores as usize;

    // Constrained queue first; the head blocks until its resources free up.
    while state.executing.len() < ncores {
        let key = match state.constrained.front() {
            Some(key) => key.clone(),
            None => break,
        };
        if state.task_state(&key) != Some(TaskState::Constrained) {
            state.constrained.pop_front();
            continue;
        }
        let restrictions = state
            .tasks
            .get(&key)
            .and_then(|task| task.resource_restrictions.clone())
            .unwrap_or_default();
        if !state.resources_available(&restrictions) {
            break;
        }
        state.constrained.pop_front();
        transition(state, &key, TaskTarget::Executing);
        admitted.push(key);
    }

    while state.executing.len() < ncores {
        let entry = match state.ready.pop() {
            Some(entry) => entry,
            None => break,
        };
        match state.task_state(&entry.key) {
            Some(TaskState::Ready) => {
                transition(state, &entry.key, TaskTarget::Executing);
                admitted.push(entry.key);
            }
            Some(TaskState::Constrained) => {
                // Still queued in `constrained`; admit out of band only if
                // its resources are free right now.
                let restrictions = state
                    .tasks
                    .get(&entry.key)
                    .and_then(|task| task.resource_restrictions.clone())
                    .unwrap_or_default();
                if state.resources_available(&restrictions) {
                    transition(state, &entry.key, TaskTarget::Executing);
                    admitted.push(entry.key);
                }
            }
            _ => {} // stale queue entry
        }
    }
    admitted
}

/// Substitutes top-level arguments that name locally resident keys with
/// their values.
fn pack_data(state: &WorkerState, args: Vec<Value>) -> Vec<Value> {
    args.into_iter()
        .map(|arg| match arg {
            Value::String(name) => match name.as_str().and_then(|key| state.data.get(key)) {
                Some(value) => value.clone(),
                None => Value::String(name),
            },
            other => other,
        })
        .collect()
}

fn pack_kwargs(
    state: &WorkerState,
    kwargs: Map<DaskKey, Value>,
) -> Map<DaskKey, Value> {
    kwargs
        .into_iter()
        .map(|(name, value)| {
            let value = match value {
                Value::String(key_name) => {
                    match key_name.as_str().and_then(|key| state.data.get(key)) {
                        Some(resident) => resident.clone(),
                        None => Value::String(key_name),
                    }
                }
                other => other,
            };
            (name, value)
        })
        .collect()
}

/// Runs one task through the code loader. The recorded state is re-read
/// after the user code returns; if it changed underneath us (a concurrent
/// release), the result is discarded silently.
pub async fn execute(state_ref: WorkerStateRef, key: DaskKey) {
    let invocation = {
        let state = state_ref.get();
        let task = match state.tasks.get(&key) {
            Some(task) if task.state == TaskState::Executing => task,
            _ => {
                log::debug!("task {} disappeared before execution", key);
                return;
            }
        };
        let callable = match &task.callable {
            Some(callable) => callable,
            None => {
                log::error!("task {} has no callable", key);
                return;
            }
        };
        let args = pack_data(&state, task.args.clone());
        let kwargs = pack_kwargs(&state, task.kwargs.clone());
        state.loader.invoke(callable, args, kwargs)
    };

    let start = unix_time();
    let result = invocation.await;
    let stop = unix_time();

    {
        let mut state = state_ref.get_mut();
        if state.task_state(&key) != Some(TaskState::Executing) {
            log::debug!("task {} was released during execution, discarding result", key);
        } else {
            state
                .startstops
                .entry(key.clone())
                .or_default()
                .push(("compute".to_owned(), start, stop));
            match result {
                Ok(value) => transition(&mut state, &key, TaskTarget::Memory(Some(value))),
                Err(error) => transition(
                    &mut state,
                    &key,
                    TaskTarget::Error {
                        exception: error.exception,
                        traceback: error.traceback,
                    },
                ),
            }
        }
    }
    ensure_computing(&state_ref);
    ensure_communicating(&state_ref);
}

/// Ingests one `compute-task` assignment. Builds the dependency-graph
/// fragment for the key and routes it to `data_needed` or straight to
/// ready.
pub fn add_task(state: &mut WorkerState, msg: ComputeTaskMsg) {
    let ComputeTaskMsg {
        key,
        priority,
        duration,
        who_has,
        nbytes,
        resource_restrictions,
        func,
        args,
        kwargs,
        future,
    } = msg;

    if key.is_empty() || priority.is_empty() {
        log::warn!("rejecting assignment with empty key or priority");
        return;
    }
    let priority = Priority::new(priority, state.priority_counter);

    if let Some(task_state) = state.task_state(&key) {
        match task_state {
            TaskState::Memory | TaskState::Error => {
                state.send_task_state_to_scheduler(&key);
            }
            _ => log::debug!("task {} already assigned, ignoring", key),
        }
        return;
    }

    if state.dep_state(&key) == Some(DepState::Memory) {
        // The value is already resident as somebody's dependency; promote
        // it to a finished task.
        state.tasks.insert(
            key.clone(),
            Task {
                key: key.clone(),
                state: TaskState::Memory,
                priority,
                duration,
                resource_restrictions: None,
                callable: None,
                args: Vec::new(),
                kwargs: Map::default(),
                future_handle: future,
                dependencies: Default::default(),
                waiting_for_data: Default::default(),
            },
        );
        state.send_task_state_to_scheduler(&key);
        return;
    }

    let loader = state.loader.clone();
    let decoded = loader.decode_callable(&func).and_then(|callable| {
        let args = loader.decode_args(&args)?;
        let kwargs = loader.decode_kwargs(&kwargs)?;
        Ok((callable, args, kwargs))
    });
    let (callable, args, kwargs) = match decoded {
        Ok(decoded) => decoded,
        Err(error) => {
            let message = format!("could not deserialize task {}: {}", key, error);
            log::warn!("{}", message);
            state.exceptions.insert(key.clone(), message.clone());
            state.tracebacks.insert(key.clone(), message);
            state.tasks.insert(
                key.clone(),
                Task {
                    key: key.clone(),
                    state: TaskState::Error,
                    priority,
                    duration,
                    resource_restrictions: None,
                    callable: None,
                    args: Vec::new(),
                    kwargs: Map::default(),
                    future_handle: future,
                    dependencies: Default::default(),
                    waiting_for_data: Default::default(),
                },
            );
            state.send_task_state_to_scheduler(&key);
            return;
        }
    };

    log::debug!("assigned task {} with {} dependencies", key, who_has.len());
    let mut task = Task {
        key: key.clone(),
        state: TaskState::Waiting,
        priority,
        duration,
        resource_restrictions,
        callable: Some(callable),
        args,
        kwargs,
        future_handle: future,
        dependencies: who_has.keys().cloned().collect(),
        waiting_for_data: Default::default(),
    };

    for (dep, size) in nbytes {
        state.nbytes.insert(dep, size);
    }

    for dep in who_has.keys() {
        let resident = state.task_state(dep) == Some(TaskState::Memory);
        let info = state.deps.entry(dep.clone()).or_insert_with(|| {
            DepInfo::new(if resident {
                DepState::Memory
            } else {
                DepState::Waiting
            })
        });
        info.dependents.insert(key.clone());
        if info.state != DepState::Memory {
            task.waiting_for_data.insert(dep.clone());
        }
        state.nbytes.entry(dep.clone()).or_insert(0);
    }

    for (dep, workers) in &who_has {
        if workers.is_empty() {
            log::warn!("dependency {} of {} advertised with no holders", dep, key);
            continue;
        }
        let in_memory = state.dep_state(dep) == Some(DepState::Memory);
        for worker in workers {
            if let Some(info) = state.deps.get_mut(dep) {
                info.who_has.insert(worker.clone());
            }
            state
                .has_what
                .entry(worker.clone())
                .or_default()
                .insert(dep.clone());
            if !in_memory {
                state
                    .pending_data_per_worker
                    .entry(worker.clone())
                    .or_default()
                    .push_back(dep.clone());
            }
        }
    }

    let has_waiting_data = !task.waiting_for_data.is_empty();
    state.tasks.insert(key.clone(), task);
    if has_waiting_data {
        state.data_needed.push_back(key.clone());
    } else {
        transition(state, &key, TaskTarget::Ready);
    }

    if state.config.validate {
        for dep in who_has.keys() {
            assert!(state.deps.contains_key(dep) && state.nbytes.contains_key(dep));
            validate_dep(state, dep);
        }
        crate::worker::validate::validate_key(state, &key);
    }
}

/// Drops local knowledge of the given keys; optionally reports the removal
/// back to the scheduler.
pub fn delete_data(state: &mut WorkerState, keys: Vec<DaskKey>, report: bool) {
    for key in &keys {
        log::debug!("deleting key {}", key);
        if state.tasks.contains_key(key.as_str()) {
            release_key(state, key, None, None);
        }
        if state.deps.contains_key(key.as_str()) {
            release_dep(state, key);
        }
    }
    if report {
        let address = state.address.clone();
        state.send_to_scheduler(ToSchedulerMessage::RemoveKeys(RemoveKeysMsg {
            address,
            keys,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::test_util::{compute_msg, drain_messages, test_state_ref};

    #[test]
    fn test_priority_admission_order() {
        let (state_ref, _rx) = test_state_ref(2);
        let mut state = state_ref.get_mut();
        add_task(&mut state, compute_msg("low", vec![5], "const42"));
        state.priority_counter += 1;
        add_task(&mut state, compute_msg("high", vec![1], "const42"));
        state.priority_counter += 1;

        let admitted = admit_tasks(&mut state);
        assert_eq!(admitted, vec!["high".to_owned(), "low".to_owned()]);
    }

    #[test]
    fn test_equal_priority_fifo() {
        let (state_ref, _rx) = test_state_ref(2);
        let mut state = state_ref.get_mut();
        add_task(&mut state, compute_msg("first", vec![3], "const42"));
        state.priority_counter += 1;
        add_task(&mut state, compute_msg("second", vec![3], "const42"));
        state.priority_counter += 1;

        let admitted = admit_tasks(&mut state);
        assert_eq!(admitted, vec!["first".to_owned(), "second".to_owned()]);
    }

    #[test]
    fn test_ncores_bounds_admission() {
        let (state_ref, _rx) = test_state_ref(1);
        let mut state = state_ref.get_mut();
        add_task(&mut state, compute_msg("a", vec![0], "const42"));
        add_task(&mut state, compute_msg("b", vec![1], "const42"));

        let admitted = admit_tasks(&mut state);
        assert_eq!(admitted, vec!["a".to_owned()]);
        assert_eq!(state.task_state("b"), Some(TaskState::Ready));
    }

    #[test]
    fn test_constrained_head_blocks() {
        let (state_ref, _rx) = test_state_ref(4);
        let mut state = state_ref.get_mut();
        state.config.resources.insert("GPU".to_owned(), 1.0);
        state.available_resources.insert("GPU".to_owned(), 1.0);

        let mut t1 = compute_msg("t1", vec![0], "const42");
        t1.resource_restrictions = Some([("GPU".to_owned(), 1.0)].into_iter().collect());
        let mut t2 = compute_msg("t2", vec![1], "const42");
        t2.resource_restrictions = Some([("GPU".to_owned(), 1.0)].into_iter().collect());
        add_task(&mut state, t1);
        state.priority_counter += 1;
        add_task(&mut state, t2);
        state.priority_counter += 1;

        let admitted = admit_tasks(&mut state);
        assert_eq!(admitted, vec!["t1".to_owned()]);
        assert_eq!(state.task_state("t2"), Some(TaskState::Constrained));
        assert_eq!(state.available_resources["GPU"], 0.0);

        // resources flow back when the task finishes
        transition(&mut state, "t1", TaskTarget::Memory(Some(Value::from(42))));
        assert_eq!(state.available_resources["GPU"], 1.0);
        let admitted = admit_tasks(&mut state);
        assert_eq!(admitted, vec!["t2".to_owned()]);
    }

    #[test]
    fn test_duplicate_assignment_is_idempotent() {
        let (state_ref, mut rx) = test_state_ref(1);
        let mut state = state_ref.get_mut();
        add_task(&mut state, compute_msg("a", vec![0], "const42"));
        add_task(&mut state, compute_msg("a", vec![0], "const42"));
        assert_eq!(state.tasks.len(), 1);
        assert!(drain_messages(&mut rx).is_empty());
    }

    #[test]
    fn test_undeserializable_task_errs() {
        let (state_ref, mut rx) = test_state_ref(1);
        let mut state = state_ref.get_mut();
        add_task(&mut state, compute_msg("bad", vec![0], "no-such-fn"));
        assert_eq!(state.task_state("bad"), Some(TaskState::Error));
        let messages = drain_messages(&mut rx);
        assert!(matches!(
            messages.as_slice(),
            [ToSchedulerMessage::TaskErred(m)] if m.key == "bad"
        ));
    }

    #[test]
    fn test_delete_data_reports_removed_keys() {
        let (state_ref, mut rx) = test_state_ref(1);
        let mut state = state_ref.get_mut();
        add_task(&mut state, compute_msg("a", vec![0], "const42"));
        drain_messages(&mut rx);

        delete_data(&mut state, vec!["a".to_owned()], true);
        assert!(state.task_state("a").is_none());
        let messages = drain_messages(&mut rx);
        assert!(messages.iter().any(|message| matches!(
            message,
            ToSchedulerMessage::RemoveKeys(m)
                if m.keys == vec!["a".to_owned()] && m.address == "tcp://127.0.0.1:9999"
        )));
    }

    #[test]
    fn test_pack_data_substitutes_resident_keys() {
        let (state_ref, _rx) = test_state_ref(1);
        let mut state = state_ref.get_mut();
        state.data.insert("b".to_owned(), Value::from(7));
        let packed = pack_data(
            &state,
            vec![Value::from("b"), Value::from("missing"), Value::from(1)],
        );
        assert_eq!(
            packed,
            vec![Value::from(7), Value::from("missing"), Value::from(1)]
        );
    }
}
