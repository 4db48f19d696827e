use futures::{SinkExt, StreamExt};
use rand::seq::SliceRandom;

use crate::comm::ConnectionCacheRef;
use crate::common::data::Value;
use crate::common::Map;
use crate::protocol::key::{DaskKey, DaskKeyRef, WorkerAddress};
use crate::protocol::protocol::{
    deserialize_packet, packet_to_value_map, serialize_single_packet,
};
use crate::protocol::workermsg::{
    AddKeysMsg, GetDataMsg, SchedulerRpcMsg, ToSchedulerMessage, WhoHasMsg, WhoHasResponse,
    WorkerMessage,
};
use crate::common::unix_time;
use crate::worker::data::DepState;
use crate::worker::reactor::ensure_computing;
use crate::worker::state::{WorkerState, WorkerStateRef};
use crate::worker::task::TaskState;
use crate::worker::transitions::{bad_dep, dep_transition, DepTarget};

/// How many failed holder lookups a dep survives before it is poisoned.
const SUSPICIOUS_LIMIT: u32 = 5;

/// Walks `data_needed` and fans fetches out to peers, within the
/// connection budget. Deps with no known holders are handed to the
/// missing-dep recovery activity.
pub fn ensure_communicating(state_ref: &WorkerStateRef) {
    let fetches = {
        let mut state = state_ref.get_mut();
        plan_fetches(&mut state)
    };
    for (worker, to_gather) in fetches {
        let state_ref = state_ref.clone();
        tokio::task::spawn_local(async move {
            gather_dep(state_ref, worker, to_gather).await;
        });
    }
    schedule_missing_dep_recovery(state_ref);
}

/// Spawns one recovery round for every dep enlisted since the last drain.
pub fn schedule_missing_dep_recovery(state_ref: &WorkerStateRef) {
    let missing = {
        let mut state = state_ref.get_mut();
        std::mem::take(&mut state.pending_missing)
    };
    if !missing.is_empty() {
        let state_ref = state_ref.clone();
        tokio::task::spawn_local(async move {
            handle_missing_dep(state_ref, missing).await;
        });
    }
}

fn plan_fetches(state: &mut WorkerState) -> Vec<(WorkerAddress, Vec<DaskKey>)> {
    let mut fetches = Vec::new();
    let mut rng = rand::thread_rng();
    let mut changed = true;
    while changed
        && !state.data_needed.is_empty()
        && state.in_flight_workers.len() < state.config.total_connections
    {
        changed = false;
        let key = state.data_needed.front().unwrap().clone();
        match state.task_state(&key) {
            Some(TaskState::Waiting) => {}
            _ => {
                state.data_needed.pop_front();
                changed = true;
                continue;
            }
        }

        let waiting_deps: Vec<DaskKey> = state
            .tasks
            .get(key.as_str())
            .unwrap()
            .dependencies
            .iter()
            .filter(|dep| state.dep_state(dep) == Some(DepState::Waiting))
            .cloned()
            .collect();

        let mut deps = Vec::with_capacity(waiting_deps.len());
        for dep in waiting_deps {
            let missing = state
                .deps
                .get(dep.as_str())
                .map(|info| info.who_has.is_empty())
                .unwrap_or(false);
            if missing {
                log::info!("can't find dependency {} for key {}", dep, key);
                if !state.missing_dep_flight.contains(dep.as_str()) {
                    state.missing_dep_flight.insert(dep.clone());
                    state.pending_missing.push(dep);
                }
            } else {
                deps.push(dep);
            }
        }

        let mut in_flight = false;
        while let Some(dep) = deps.pop() {
            if state.in_flight_workers.len() >= state.config.total_connections {
                in_flight = true;
                break;
            }
            if state.dep_state(&dep) != Some(DepState::Waiting) {
                // picked up by an earlier batch in this pass
                continue;
            }
            let candidates: Vec<WorkerAddress> = state.deps[dep.as_str()]
                .who_has
                .iter()
                .filter(|worker| !state.in_flight_workers.contains_key(*worker))
                .cloned()
                .collect();
            let worker = match candidates.choose(&mut rng) {
                Some(worker) => worker.clone(),
                None => {
                    in_flight = true;
                    continue;
                }
            };
            let to_gather = select_keys_for_gather(state, &worker, &dep);
            log::debug!("requesting {} key(s) from {}", to_gather.len(), worker);
            state
                .in_flight_workers
                .insert(worker.clone(), to_gather.iter().cloned().collect());
            for gathered in &to_gather {
                dep_transition(
                    state,
                    gathered,
                    DepTarget::Flight {
                        worker: worker.clone(),
                    },
                );
            }
            fetches.push((worker, to_gather));
            changed = true;
        }
        if deps.is_empty() && !in_flight {
            state.data_needed.pop_front();
            changed = true;
        }
    }
    fetches
}

/// Extends a batch headed to `worker` with other deps pending for that
/// peer, up to the message size budget. Stops at the first candidate that
/// is no longer waiting or would overflow the budget.
fn select_keys_for_gather(
    state: &mut WorkerState,
    worker: &DaskKeyRef,
    dep: &DaskKeyRef,
) -> Vec<DaskKey> {
    let mut deps = vec![dep.to_owned()];
    let mut total_bytes = state.nbytes.get(dep).copied().unwrap_or(0);
    loop {
        let candidate = match state
            .pending_data_per_worker
            .get_mut(worker)
            .and_then(|pending| pending.pop_front())
        {
            Some(candidate) => candidate,
            None => break,
        };
        if deps.contains(&candidate) {
            continue;
        }
        if state.dep_state(&candidate) != Some(DepState::Waiting) {
            break;
        }
        let bytes = state.nbytes.get(candidate.as_str()).copied().unwrap_or(0);
        if total_bytes + bytes > state.config.target_message_size {
            break;
        }
        total_bytes += bytes;
        deps.push(candidate);
    }
    deps
}

/// One outstanding `get_data` exchange with a peer. Applies the per-dep
/// transitions when the reply (or the failure) lands.
pub async fn gather_dep(
    state_ref: WorkerStateRef,
    worker: WorkerAddress,
    to_gather: Vec<DaskKey>,
) {
    let (connections, request) = {
        let state = state_ref.get();
        let request = GetDataMsg {
            keys: to_gather.clone(),
            who: Some(state.address.clone()),
        };
        (state.connections.clone(), request)
    };

    let start = unix_time();
    let response = fetch_data(&connections, &worker, request).await;
    let stop = unix_time();

    {
        let mut state = state_ref.get_mut();
        state.in_flight_workers.remove(&worker);
        match response {
            Ok(mut found) => {
                if !found.is_empty() {
                    let keys = found.keys().cloned().collect();
                    state.send_to_scheduler(ToSchedulerMessage::AddKeys(AddKeysMsg { keys }));
                }
                for dep in &to_gather {
                    if state.dep_state(dep) != Some(DepState::Flight) {
                        continue; // released while in flight
                    }
                    match found.remove(dep.as_str()) {
                        Some(value) => {
                            state
                                .startstops
                                .entry(dep.clone())
                                .or_default()
                                .push(("transfer".to_owned(), start, stop));
                            dep_transition(&mut state, dep, DepTarget::Memory(Some(value)));
                        }
                        None => dep_transition(&mut state, dep, DepTarget::Waiting),
                    }
                }
            }
            Err(error) => {
                log::warn!("fetch from worker {} failed: {}", worker, error);
                // The peer is gone; forget everything it advertised.
                if let Some(advertised) = state.has_what.remove(&worker) {
                    for dep in advertised {
                        if let Some(info) = state.deps.get_mut(&dep) {
                            info.who_has.remove(&worker);
                        }
                    }
                }
                state.pending_data_per_worker.remove(&worker);
                for dep in &to_gather {
                    if state.dep_state(dep) == Some(DepState::Flight) {
                        dep_transition(&mut state, dep, DepTarget::Waiting);
                    }
                }
            }
        }
    }
    ensure_computing(&state_ref);
    ensure_communicating(&state_ref);
}

async fn fetch_data(
    connections: &ConnectionCacheRef,
    worker: &DaskKeyRef,
    request: GetDataMsg,
) -> crate::Result<Map<DaskKey, Value>> {
    let mut connection = connections.get_connection(worker).await?;
    let packet = serialize_single_packet(&WorkerMessage::GetData(request))?;
    connection.send(packet).await?;
    let packet = connection
        .next()
        .await
        .ok_or_else(|| crate::DsError::from("connection closed by peer"))??;
    let data = packet_to_value_map(&packet)?;
    connections.return_connection(worker, connection);
    Ok(data)
}

/// Asks the scheduler who holds the given deps and feeds the answer back
/// into the gather loop. A dep that fails six rounds is poisoned through
/// `bad_dep`.
pub async fn handle_missing_dep(state_ref: WorkerStateRef, deps: Vec<DaskKey>) {
    let original = deps.clone();
    let (to_query, scheduler_address, connections) = {
        let mut state = state_ref.get_mut();
        let mut to_query = Vec::new();
        for dep in deps {
            let suspicious = match state.deps.get(dep.as_str()) {
                Some(info) if !info.dependents.is_empty() => info.suspicious_count,
                _ => continue, // nobody needs it any more
            };
            if suspicious > SUSPICIOUS_LIMIT {
                bad_dep(&mut state, &dep);
            } else {
                state.deps.get_mut(dep.as_str()).unwrap().suspicious_count += 1;
                to_query.push(dep);
            }
        }
        (
            to_query,
            state.config.scheduler_address.clone(),
            state.connections.clone(),
        )
    };

    if !to_query.is_empty() {
        log::info!("dependencies not found locally, asking scheduler: {:?}", to_query);
        let response = who_has(&connections, &scheduler_address, to_query.clone()).await;
        let mut state = state_ref.get_mut();
        match response {
            Ok(mut holders) => {
                holders.retain(|_, workers| !workers.is_empty());
                state.update_who_has(holders.clone());
                for dep in &to_query {
                    if holders.contains_key(dep.as_str()) {
                        log::debug!("found new holders of {}", dep);
                    } else {
                        log::debug!("still no holders of {}", dep);
                    }
                    let dependents: Vec<DaskKey> = state
                        .deps
                        .get(dep.as_str())
                        .map(|info| info.dependents.iter().cloned().collect())
                        .unwrap_or_default();
                    // Wake the dependents either way: the gather loop will
                    // fetch from the new holders, or re-enter recovery and
                    // eventually poison the dep.
                    for key in dependents {
                        if state.task_state(&key) == Some(TaskState::Waiting) {
                            state.data_needed.push_front(key);
                        }
                    }
                }
            }
            Err(error) => {
                log::warn!("who_has request to scheduler failed: {}", error);
            }
        }
    }

    {
        let mut state = state_ref.get_mut();
        for dep in &original {
            state.missing_dep_flight.remove(dep.as_str());
        }
    }
    ensure_communicating(&state_ref);
}

async fn who_has(
    connections: &ConnectionCacheRef,
    scheduler: &DaskKeyRef,
    keys: Vec<DaskKey>,
) -> crate::Result<WhoHasResponse> {
    let mut connection = connections.get_connection(scheduler).await?;
    let packet = serialize_single_packet(&SchedulerRpcMsg::WhoHas(WhoHasMsg { keys }))?;
    connection.send(packet).await?;
    let packet = connection
        .next()
        .await
        .ok_or_else(|| crate::DsError::from("scheduler closed the connection"))??;
    let response = deserialize_packet(&packet)?;
    connections.return_connection(scheduler, connection);
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::reactor::add_task;
    use crate::worker::test_util::{compute_msg_with_dep, test_state_ref};

    #[test]
    fn test_connection_budget_is_respected() {
        let (state_ref, _rx) = test_state_ref(1);
        let mut state = state_ref.get_mut();
        state.config.total_connections = 2;
        for i in 0..5 {
            let key = format!("task{}", i);
            let dep = format!("dep{}", i);
            let peer = format!("tcp://10.0.0.{}:4000", i);
            add_task(
                &mut state,
                compute_msg_with_dep(&key, vec![i as i64], "identity", &dep, &peer, 8),
            );
            state.priority_counter += 1;
        }

        let fetches = plan_fetches(&mut state);
        assert_eq!(fetches.len(), 2);
        assert_eq!(state.in_flight_workers.len(), 2);
        assert!(state.in_flight_workers.len() <= state.config.total_connections);
    }

    #[test]
    fn test_batched_deps_share_one_connection() {
        let (state_ref, _rx) = test_state_ref(1);
        let mut state = state_ref.get_mut();
        let peer = "tcp://10.0.0.9:4000";
        for i in 0..3 {
            let key = format!("task{}", i);
            let dep = format!("dep{}", i);
            add_task(
                &mut state,
                compute_msg_with_dep(&key, vec![i as i64], "identity", &dep, peer, 8),
            );
            state.priority_counter += 1;
        }

        let fetches = plan_fetches(&mut state);
        assert_eq!(fetches.len(), 1);
        let (worker, batch) = &fetches[0];
        assert_eq!(worker, peer);
        assert_eq!(batch.len(), 3);
        for dep in batch {
            assert_eq!(state.dep_state(dep), Some(DepState::Flight));
            assert_eq!(state.in_flight_tasks[dep.as_str()], peer.to_owned());
        }
        assert!(state.data_needed.is_empty());
    }

    #[test]
    fn test_size_budget_splits_batches() {
        let (state_ref, _rx) = test_state_ref(1);
        let mut state = state_ref.get_mut();
        state.config.target_message_size = 10;
        let peer = "tcp://10.0.0.9:4000";
        add_task(
            &mut state,
            compute_msg_with_dep("t0", vec![0], "identity", "big0", peer, 8),
        );
        state.priority_counter += 1;
        add_task(
            &mut state,
            compute_msg_with_dep("t1", vec![1], "identity", "big1", peer, 8),
        );
        state.priority_counter += 1;

        let fetches = plan_fetches(&mut state);
        // 8 + 8 > 10: the second dep must not ride along
        assert_eq!(fetches[0].1.len(), 1);
    }

    #[test]
    fn test_missing_dep_is_enlisted() {
        let (state_ref, _rx) = test_state_ref(1);
        let mut state = state_ref.get_mut();
        let peer = "tcp://10.0.0.9:4000";
        add_task(
            &mut state,
            compute_msg_with_dep("t", vec![0], "identity", "lost", peer, 8),
        );
        // the peer vanished before we could fetch
        state.deps.get_mut("lost").unwrap().who_has.clear();
        state.has_what.clear();

        let fetches = plan_fetches(&mut state);
        assert!(fetches.is_empty());
        assert!(state.missing_dep_flight.contains("lost"));
        assert_eq!(state.pending_missing, vec!["lost".to_owned()]);
    }
}
