use serde::{Deserialize, Serialize};

use crate::common::data::Value;
use crate::common::Map;
use crate::protocol::key::{DaskKey, WorkerAddress};

/// One `(phase, start, stop)` timing record attached to task reports.
pub type StartStop = (String, f64, f64);

#[derive(Serialize, Deserialize, Debug)]
pub struct ComputeTaskMsg {
    pub key: DaskKey,
    pub priority: Vec<i64>,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub who_has: Map<DaskKey, Vec<WorkerAddress>>,
    #[serde(default)]
    pub nbytes: Map<DaskKey, u64>,
    #[serde(default)]
    pub resource_restrictions: Option<Map<String, f64>>,
    #[serde(default, with = "serde_bytes")]
    pub func: Vec<u8>,
    #[serde(default, with = "serde_bytes")]
    pub args: Vec<u8>,
    #[serde(default, with = "serde_bytes")]
    pub kwargs: Vec<u8>,
    #[serde(default)]
    pub future: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ReleaseTaskMsg {
    pub key: DaskKey,
    #[serde(default)]
    pub cause: Option<DaskKey>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct DeleteDataMsg {
    pub keys: Vec<DaskKey>,
    #[serde(default)]
    pub report: bool,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct GetDataMsg {
    pub keys: Vec<DaskKey>,
    #[serde(default)]
    pub who: Option<WorkerAddress>,
}

/// Every operation a worker accepts, over the public listener or the
/// compute stream. `gather` and `terminate` are reserved hooks.
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "op")]
pub enum WorkerMessage {
    #[serde(rename = "compute-stream")]
    ComputeStream,
    #[serde(rename = "compute-task")]
    ComputeTask(ComputeTaskMsg),
    #[serde(rename = "release-task")]
    ReleaseTask(ReleaseTaskMsg),
    #[serde(rename = "delete-data")]
    DeleteData(DeleteDataMsg),
    #[serde(rename = "delete_data")]
    DeleteDataRpc(DeleteDataMsg),
    #[serde(rename = "get_data")]
    GetData(GetDataMsg),
    #[serde(rename = "keys")]
    Keys,
    #[serde(rename = "gather")]
    Gather,
    #[serde(rename = "terminate")]
    Terminate,
    #[serde(rename = "close")]
    Close,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TaskFinishedMsg {
    pub status: String,
    pub key: DaskKey,
    pub nbytes: u64,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startstops: Option<Vec<StartStop>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TaskErredMsg {
    pub status: String,
    pub key: DaskKey,
    pub exception: String,
    pub traceback: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startstops: Option<Vec<StartStop>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AddKeysMsg {
    pub keys: Vec<DaskKey>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RemoveKeysMsg {
    pub address: WorkerAddress,
    pub keys: Vec<DaskKey>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReleaseMsg {
    pub key: DaskKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<DaskKey>,
}

/// Traffic flowing to the scheduler over the batched compute stream.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "op")]
pub enum ToSchedulerMessage {
    #[serde(rename = "task-finished")]
    TaskFinished(TaskFinishedMsg),
    #[serde(rename = "task-erred")]
    TaskErred(TaskErredMsg),
    #[serde(rename = "add-keys")]
    AddKeys(AddKeysMsg),
    #[serde(rename = "remove-keys")]
    RemoveKeys(RemoveKeysMsg),
    #[serde(rename = "release")]
    Release(ReleaseMsg),
}

#[derive(Serialize, Deserialize, Debug)]
pub struct RegisterWorkerMsg {
    pub address: WorkerAddress,
    pub ncores: u32,
    pub keys: Vec<DaskKey>,
    pub nbytes: Map<DaskKey, u64>,
    pub now: f64,
    pub executing: u64,
    pub in_memory: u64,
    pub ready: u64,
    pub in_flight: u64,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct WhoHasMsg {
    pub keys: Vec<DaskKey>,
}

/// Request/reply operations addressed directly to the scheduler, outside
/// the compute stream.
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "op")]
pub enum SchedulerRpcMsg {
    #[serde(rename = "register")]
    Register(RegisterWorkerMsg),
    #[serde(rename = "who_has")]
    WhoHas(WhoHasMsg),
}

pub type WhoHasResponse = Map<DaskKey, Vec<WorkerAddress>>;
