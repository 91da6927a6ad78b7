use crate::error::{AppError, AppResult};
use rusqlite::Connection;
use serde_json::Value;

use super::types::AppState;

pub fn db(state: &AppState) -> AppResult<&Connection> {
    state.db.as_ref().ok_or(AppError::NoWorkspace)
}

pub fn required_str(params: &Value, key: &str) -> AppResult<String> {
    optional_str(params, key).ok_or_else(|| AppError::bad_params(format!("missing {key}")))
}

/// Trimmed string param; blank reads as absent.
pub fn optional_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Integer param, also accepting numeric strings as form fields send them.
pub fn optional_i64(params: &Value, key: &str) -> AppResult<Option<i64>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => value_as_i64(v)
            .map(Some)
            .ok_or_else(|| AppError::bad_params(format!("{key} must be an integer"))),
    }
}

pub fn required_i64(params: &Value, key: &str) -> AppResult<i64> {
    optional_i64(params, key)?.ok_or_else(|| AppError::bad_params(format!("missing {key}")))
}

pub fn value_as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn required_bool(params: &Value, key: &str) -> AppResult<bool> {
    params
        .get(key)
        .and_then(|v| v.as_bool())
        .ok_or_else(|| AppError::bad_params(format!("missing {key}")))
}

pub fn required_array<'a>(params: &'a Value, key: &str) -> AppResult<&'a Vec<Value>> {
    params
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| AppError::bad_params(format!("missing {key}")))
}
