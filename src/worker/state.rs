use std::collections::{BinaryHeap, VecDeque};
use std::rc::Rc;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;

use crate::comm::ConnectionCacheRef;
use crate::common::data::Value;
use crate::common::{unix_time, Map, Set, WrappedRcRefCell};
use crate::protocol::key::{DaskKey, DaskKeyRef, WorkerAddress};
use crate::protocol::workermsg::{
    RegisterWorkerMsg, StartStop, TaskErredMsg, TaskFinishedMsg, ToSchedulerMessage,
};
use crate::worker::data::{DepInfo, DepState};
use crate::worker::loader::CodeLoader;
use crate::worker::task::{ReadyEntry, Task, TaskState};

pub struct WorkerConfig {
    pub scheduler_address: String,
    /// Local interface the listener binds to.
    pub listen_address: String,
    /// Inclusive range of ports to try for the listener.
    pub listen_port_range: (u16, u16),
    pub ncores: u32,
    /// Upper bound on distinct peers with an outstanding fetch.
    pub total_connections: usize,
    /// Byte budget of a single `get_data` batch.
    pub target_message_size: u64,
    pub validate: bool,
    pub resources: Map<String, f64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scheduler_address: "tcp://127.0.0.1:8786".to_owned(),
            listen_address: "127.0.0.1".to_owned(),
            listen_port_range: (30000, 40000),
            ncores: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
            total_connections: 50,
            target_message_size: 50_000_000,
            validate: true,
            resources: Map::default(),
        }
    }
}

pub struct WorkerState {
    pub config: WorkerConfig,
    /// Public address of this worker (`tcp://<ip>:<port>`).
    pub address: WorkerAddress,
    pub loader: Rc<dyn CodeLoader>,
    pub connections: ConnectionCacheRef,
    pub shutdown: Rc<Notify>,

    /// Writer side of the batched scheduler stream; attached once the
    /// scheduler opens its compute stream.
    pub sender: Option<UnboundedSender<ToSchedulerMessage>>,
    pub is_computing: bool,

    pub tasks: Map<DaskKey, Task>,
    pub deps: Map<DaskKey, DepInfo>,
    pub has_what: Map<WorkerAddress, Set<DaskKey>>,
    pub pending_data_per_worker: Map<WorkerAddress, VecDeque<DaskKey>>,

    pub ready: BinaryHeap<ReadyEntry>,
    pub constrained: VecDeque<DaskKey>,
    pub data_needed: VecDeque<DaskKey>,
    pub executing: Set<DaskKey>,
    pub in_flight_tasks: Map<DaskKey, WorkerAddress>,
    pub in_flight_workers: Map<WorkerAddress, Set<DaskKey>>,
    pub missing_dep_flight: Set<DaskKey>,
    /// Deps enlisted for recovery whose recovery activity has not been
    /// spawned yet; drained after the current mutation ends.
    pub pending_missing: Vec<DaskKey>,

    pub data: Map<DaskKey, Value>,
    pub types: Map<DaskKey, String>,
    pub nbytes: Map<DaskKey, u64>,
    pub exceptions: Map<DaskKey, String>,
    pub tracebacks: Map<DaskKey, String>,
    pub startstops: Map<DaskKey, Vec<StartStop>>,

    pub priority_counter: i64,
    pub executed_count: u64,
    pub available_resources: Map<String, f64>,
}

pub type WorkerStateRef = WrappedRcRefCell<WorkerState>;

impl WorkerStateRef {
    pub fn new(config: WorkerConfig, address: WorkerAddress, loader: Rc<dyn CodeLoader>) -> Self {
        let available_resources = config.resources.clone();
        Self::wrap(WorkerState {
            config,
            address,
            loader,
            connections: Default::default(),
            shutdown: Rc::new(Notify::new()),
            sender: None,
            is_computing: false,
            tasks: Default::default(),
            deps: Default::default(),
            has_what: Default::default(),
            pending_data_per_worker: Default::default(),
            ready: Default::default(),
            constrained: Default::default(),
            data_needed: Default::default(),
            executing: Default::default(),
            in_flight_tasks: Default::default(),
            in_flight_workers: Default::default(),
            missing_dep_flight: Default::default(),
            pending_missing: Default::default(),
            data: Default::default(),
            types: Default::default(),
            nbytes: Default::default(),
            exceptions: Default::default(),
            tracebacks: Default::default(),
            startstops: Default::default(),
            priority_counter: 0,
            executed_count: 0,
            available_resources,
        })
    }
}

impl WorkerState {
    #[inline]
    pub fn task_state(&self, key: &DaskKeyRef) -> Option<TaskState> {
        self.tasks.get(key).map(|task| task.state)
    }

    #[inline]
    pub fn dep_state(&self, dep: &DaskKeyRef) -> Option<DepState> {
        self.deps.get(dep).map(|info| info.state)
    }

    pub fn send_to_scheduler(&self, message: ToSchedulerMessage) {
        match &self.sender {
            Some(sender) => {
                if sender.send(message).is_err() {
                    log::warn!("scheduler stream is gone, dropping message");
                }
            }
            None => log::debug!("no scheduler stream attached, dropping message"),
        }
    }

    /// Reports the terminal state of a key, selecting the message shape by
    /// where the key's outcome lives.
    pub fn send_task_state_to_scheduler(&self, key: &DaskKeyRef) {
        let startstops = self.startstops.get(key).cloned();
        if self.data.contains_key(key) {
            self.send_to_scheduler(ToSchedulerMessage::TaskFinished(TaskFinishedMsg {
                status: "OK".to_owned(),
                key: key.to_owned(),
                nbytes: self.nbytes.get(key).copied().unwrap_or(0),
                type_name: self.types.get(key).cloned().unwrap_or_default(),
                startstops,
            }));
        } else if let Some(exception) = self.exceptions.get(key) {
            self.send_to_scheduler(ToSchedulerMessage::TaskErred(TaskErredMsg {
                status: "error".to_owned(),
                key: key.to_owned(),
                exception: exception.clone(),
                traceback: self.tracebacks.get(key).cloned().unwrap_or_default(),
                startstops,
            }));
        } else {
            log::error!("key {} has neither a value nor an exception to report", key);
        }
    }

    /// Merges holder advertisements into `who_has`/`has_what`, keeping the
    /// two directions consistent.
    pub fn update_who_has<I>(&mut self, who_has: I)
    where
        I: IntoIterator<Item = (DaskKey, Vec<WorkerAddress>)>,
    {
        for (dep, workers) in who_has {
            if workers.is_empty() {
                continue;
            }
            if let Some(info) = self.deps.get_mut(&dep) {
                for worker in workers {
                    info.who_has.insert(worker.clone());
                    self.has_what.entry(worker).or_default().insert(dep.clone());
                }
            }
        }
    }

    pub fn resources_available(&self, restrictions: &Map<String, f64>) -> bool {
        restrictions.iter().all(|(resource, &amount)| {
            self.available_resources
                .get(resource)
                .map(|&available| available >= amount)
                .unwrap_or(false)
        })
    }

    pub fn deduct_resources(&mut self, restrictions: &Map<String, f64>) {
        for (resource, &amount) in restrictions {
            let available = self
                .available_resources
                .get_mut(resource)
                .unwrap_or_else(|| panic!("unknown resource {}", resource));
            *available -= amount;
            assert!(*available >= 0.0);
        }
    }

    pub fn refund_resources(&mut self, restrictions: &Map<String, f64>) {
        for (resource, &amount) in restrictions {
            if let Some(available) = self.available_resources.get_mut(resource) {
                *available += amount;
            }
        }
    }

    pub fn registration_message(&self) -> RegisterWorkerMsg {
        RegisterWorkerMsg {
            address: self.address.clone(),
            ncores: self.config.ncores,
            keys: self.data.keys().cloned().collect(),
            nbytes: self
                .data
                .keys()
                .map(|key| (key.clone(), self.nbytes.get(key).copied().unwrap_or(0)))
                .collect(),
            now: unix_time(),
            executing: self.executing.len() as u64,
            in_memory: self.data.len() as u64,
            ready: self.ready.len() as u64,
            in_flight: self.in_flight_tasks.len() as u64,
        }
    }
}
