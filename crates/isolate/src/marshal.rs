use runtime_core::{RunError, SandboxLimits};
use serde_json::Value;

/// Turn the JSON text a script produced into the value returned to the caller.
pub fn marshal_result(json: &str, limits: &SandboxLimits) -> Result<Value, RunError> {
    if json.len() > limits.max_result_bytes {
        return Err(RunError::ResultRejected("Result too large".to_string()));
    }
    let value: Value = serde_json::from_str(json).map_err(|_| {
        RunError::ResultRejected("Result copy failed (too large or non-serializable)".to_string())
    })?;
    if depth(&value) > limits.max_result_depth {
        return Err(RunError::ResultRejected(
            "Result depth exceeds limit".to_string(),
        ));
    }
    Ok(value)
}

/// Depth of the deepest value, with the root at zero.
fn depth(value: &Value) -> usize {
    let children: Box<dyn Iterator<Item = &Value>> = match value {
        Value::Array(items) => Box::new(items.iter()),
        Value::Object(map) => Box::new(map.values()),
        _ => return 0,
    };
    children.map(|child| depth(child) + 1).max().unwrap_or(0)
}
