use std::rc::Rc;

use futures::future::LocalBoxFuture;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::comm::batched::batched_channel;
use crate::common::data::Value;
use crate::common::Map;
use crate::protocol::key::DaskKey;
use crate::protocol::workermsg::{ComputeTaskMsg, ToSchedulerMessage};
use crate::worker::loader::{Callable, CodeLoader, UserError};
use crate::worker::state::{WorkerConfig, WorkerStateRef};

type TaskFn = Rc<
    dyn Fn(Vec<Value>, Map<DaskKey, Value>) -> LocalBoxFuture<'static, Result<Value, UserError>>,
>;

/// In-process code loader backed by a table of pre-registered callables.
/// `func` payloads are just the UTF-8 name of the registered function.
pub struct RegistryLoader {
    fns: Map<String, TaskFn>,
}

impl RegistryLoader {
    pub fn new() -> Self {
        let mut loader = Self { fns: Map::default() };
        loader.register("const42", |_, _| Box::pin(async { Ok(Value::from(42)) }));
        loader.register("identity", |mut args, _| {
            Box::pin(async move {
                if args.is_empty() {
                    Err(UserError::new("identity expects one argument"))
                } else {
                    Ok(args.remove(0))
                }
            })
        });
        loader.register("incr", |args, _| {
            Box::pin(async move {
                match args.first().and_then(|value| value.as_i64()) {
                    Some(x) => Ok(Value::from(x + 1)),
                    None => Err(UserError::new("incr expects an integer argument")),
                }
            })
        });
        loader.register("slow42", |_, _| {
            Box::pin(async {
                tokio::time::sleep(std::time::Duration::from_millis(300)).await;
                Ok(Value::from(42))
            })
        });
        loader.register("boom", |_, _| {
            Box::pin(async { Err(UserError::new("boom")) })
        });
        loader
    }

    pub fn register<F>(&mut self, name: &str, f: F)
    where
        F: Fn(Vec<Value>, Map<DaskKey, Value>) -> LocalBoxFuture<'static, Result<Value, UserError>>
            + 'static,
    {
        self.fns.insert(name.to_owned(), Rc::new(f));
    }
}

impl CodeLoader for RegistryLoader {
    fn decode_callable(&self, payload: &[u8]) -> crate::Result<Callable> {
        let name = std::str::from_utf8(payload)
            .map_err(|_| crate::DsError::from("callable payload is not UTF-8"))?;
        if !self.fns.contains_key(name) {
            return Err(format!("unknown function {}", name).into());
        }
        Ok(Callable::new(name.to_owned()))
    }

    fn invoke(
        &self,
        callable: &Callable,
        args: Vec<Value>,
        kwargs: Map<DaskKey, Value>,
    ) -> LocalBoxFuture<'static, Result<Value, UserError>> {
        let func = callable
            .downcast_ref::<String>()
            .and_then(|name| self.fns.get(name).cloned());
        match func {
            Some(func) => func(args, kwargs),
            None => Box::pin(async { Err(UserError::new("unknown callable")) }),
        }
    }
}

/// A worker state with an attached (captured) scheduler stream, ready for
/// driving the state machine without any I/O.
pub fn test_state_ref(ncores: u32) -> (WorkerStateRef, UnboundedReceiver<ToSchedulerMessage>) {
    let _ = env_logger::try_init();
    let config = WorkerConfig {
        ncores,
        scheduler_address: "tcp://127.0.0.1:1".to_owned(),
        ..Default::default()
    };
    let state_ref = WorkerStateRef::new(
        config,
        "tcp://127.0.0.1:9999".to_owned(),
        Rc::new(RegistryLoader::new()),
    );
    let (tx, rx) = batched_channel();
    {
        let mut state = state_ref.get_mut();
        state.sender = Some(tx);
        state.is_computing = true;
    }
    (state_ref, rx)
}

pub fn compute_msg(key: &str, priority: Vec<i64>, func: &str) -> ComputeTaskMsg {
    ComputeTaskMsg {
        key: key.to_owned(),
        priority,
        duration: 0.0,
        who_has: Map::default(),
        nbytes: Map::default(),
        resource_restrictions: None,
        func: func.as_bytes().to_vec(),
        args: Vec::new(),
        kwargs: Vec::new(),
        future: None,
    }
}

/// Assignment whose single argument names `dep`, advertised at `peer`.
pub fn compute_msg_with_dep(
    key: &str,
    priority: Vec<i64>,
    func: &str,
    dep: &str,
    peer: &str,
    nbytes: u64,
) -> ComputeTaskMsg {
    let mut msg = compute_msg(key, priority, func);
    msg.who_has.insert(dep.to_owned(), vec![peer.to_owned()]);
    msg.nbytes.insert(dep.to_owned(), nbytes);
    msg.args = encode_args(&[Value::from(dep)]);
    msg
}

pub fn encode_args(args: &[Value]) -> Vec<u8> {
    let mut buffer = Vec::new();
    rmpv::encode::write_value(&mut buffer, &Value::Array(args.to_vec())).unwrap();
    buffer
}

pub fn drain_messages(rx: &mut UnboundedReceiver<ToSchedulerMessage>) -> Vec<ToSchedulerMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}
