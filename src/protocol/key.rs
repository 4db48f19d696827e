/// Opaque task/data identifier assigned by the scheduler.
pub type DaskKey = String;
pub type DaskKeyRef = str;

/// Peer endpoints are carried in the same opaque string form as keys
/// (`tcp://<host>:<port>`).
pub type WorkerAddress = String;
