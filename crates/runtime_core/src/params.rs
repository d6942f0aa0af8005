use serde_json::{Map, Value};

use crate::error::{BoxError, ErrorKind};

/// Ordered name -> JSON value bag handed to scripts.
pub type Params = Map<String, Value>;

/// Accepts an absent/null field as empty and rejects anything but an object.
pub fn params_from_value(value: Option<Value>, field: &str) -> Result<Params, BoxError> {
    match value {
        None | Some(Value::Null) => Ok(Params::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(other) => Err(BoxError::new(
            ErrorKind::ParamsInvalid,
            format!("`{}` must be an object, got {}", field, type_name(&other)),
        )),
    }
}

/// Later keys win; insertion order of first appearance is kept.
pub fn overlay(base: &mut Params, top: Params) {
    for (key, value) in top {
        base.insert(key, value);
    }
}

pub fn serialized_len(params: &Params) -> usize {
    serde_json::to_vec(params).map(|bytes| bytes.len()).unwrap_or(usize::MAX)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
