use std::any::Any;
use std::rc::Rc;

use futures::future::LocalBoxFuture;

use crate::common::data::Value;
use crate::common::Map;
use crate::protocol::key::DaskKey;

/// Handle produced by [`CodeLoader::decode_callable`]; opaque to the worker,
/// meaningful only to the loader that decoded it.
#[derive(Clone)]
pub struct Callable {
    token: Rc<dyn Any>,
}

impl Callable {
    pub fn new<T: Any>(token: T) -> Self {
        Self {
            token: Rc::new(token),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.token.downcast_ref()
    }
}

impl std::fmt::Debug for Callable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("Callable(..)")
    }
}

/// Failure raised by user code, reported back as `task-erred`.
#[derive(Debug, Clone)]
pub struct UserError {
    pub exception: String,
    pub traceback: String,
}

impl UserError {
    pub fn new<T: Into<String>>(exception: T) -> Self {
        let exception = exception.into();
        let traceback = exception.clone();
        Self {
            exception,
            traceback,
        }
    }
}

/// The worker never embeds an evaluator for task payloads. Deserialization
/// and invocation of user code are injected at construction through this
/// capability; `invoke` returns a future because the user code is opaque
/// and may block.
pub trait CodeLoader {
    fn decode_callable(&self, payload: &[u8]) -> crate::Result<Callable>;

    fn invoke(
        &self,
        callable: &Callable,
        args: Vec<Value>,
        kwargs: Map<DaskKey, Value>,
    ) -> LocalBoxFuture<'static, Result<Value, UserError>>;

    /// Positional arguments arrive as a MsgPack list.
    fn decode_args(&self, payload: &[u8]) -> crate::Result<Vec<Value>> {
        if payload.is_empty() {
            return Ok(Vec::new());
        }
        let value = rmpv::decode::read_value(&mut &payload[..])?;
        match value {
            Value::Nil => Ok(Vec::new()),
            Value::Array(items) => Ok(items),
            other => Ok(vec![other]),
        }
    }

    /// Keyword arguments arrive as a MsgPack map with string keys.
    fn decode_kwargs(&self, payload: &[u8]) -> crate::Result<Map<DaskKey, Value>> {
        if payload.is_empty() {
            return Ok(Map::default());
        }
        let value = rmpv::decode::read_value(&mut &payload[..])?;
        match value {
            Value::Nil => Ok(Map::default()),
            Value::Map(pairs) => {
                let mut kwargs = Map::with_capacity(pairs.len());
                for (key, value) in pairs {
                    match key {
                        Value::String(s) => match s.into_str() {
                            Some(key) => {
                                kwargs.insert(key, value);
                            }
                            None => return Err("kwarg key is not valid UTF-8".into()),
                        },
                        _ => return Err("kwarg key is not a string".into()),
                    }
                }
                Ok(kwargs)
            }
            _ => Err("kwargs payload is not a map".into()),
        }
    }
}
