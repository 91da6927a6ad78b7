use crate::error::AppError;
use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

pub fn fail(id: &str, e: AppError) -> serde_json::Value {
    err(id, e.code(), e.public_message(), e.details())
}

/// Wraps a handler outcome in the response envelope.
pub fn respond(id: &str, outcome: Result<serde_json::Value, AppError>) -> serde_json::Value {
    match outcome {
        Ok(result) => ok(id, result),
        Err(e) => fail(id, e),
    }
}
