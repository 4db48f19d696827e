pub use rmpv::Value;

/// Runtime type description of a task value, as reported to the scheduler
/// in `task-finished` messages.
pub fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Nil => "Nothing",
        Value::Boolean(_) => "Bool",
        Value::Integer(_) => "Int64",
        Value::F32(_) => "Float32",
        Value::F64(_) => "Float64",
        Value::String(_) => "Str",
        Value::Binary(_) => "Bytes",
        Value::Array(_) => "List",
        Value::Map(_) => "Dict",
        Value::Ext(_, _) => "Ext",
    }
}

/// Logical in-memory size of a value. Scalar sizes follow the machine
/// representation, not the MsgPack encoding (42 occupies 8 bytes, not 1).
pub fn value_nbytes(value: &Value) -> u64 {
    match value {
        Value::Nil => 0,
        Value::Boolean(_) => 1,
        Value::Integer(_) => 8,
        Value::F32(_) => 4,
        Value::F64(_) => 8,
        Value::String(s) => s.as_bytes().len() as u64,
        Value::Binary(b) => b.len() as u64,
        Value::Array(items) => items.iter().map(value_nbytes).sum(),
        Value::Map(pairs) => pairs
            .iter()
            .map(|(k, v)| value_nbytes(k) + value_nbytes(v))
            .sum(),
        Value::Ext(_, data) => data.len() as u64,
    }
}
