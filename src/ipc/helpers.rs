use rusqlite::Connection;
use serde_json::Value;

use crate::authz::{self, Caller};
use crate::grading::EngineError;
use crate::ipc::types::AppState;

pub fn str_param(params: &Value, key: &str) -> Result<String, EngineError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| EngineError::validation("bad_params", format!("missing params.{}", key)))
}

pub fn opt_str_param(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

pub fn i64_param(params: &Value, key: &str) -> Result<i64, EngineError> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| EngineError::validation("bad_params", format!("missing params.{}", key)))
}

pub fn opt_i64_param(params: &Value, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

/// A score value may be a number or an explicit null (clearing the slot).
pub fn nullable_f64_param(params: &Value, key: &str) -> Result<Option<f64>, EngineError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| EngineError::validation("bad_params", format!("params.{} must be a number", key))),
    }
}

pub fn db_ref(state: &AppState) -> Result<&Connection, EngineError> {
    state
        .db
        .as_ref()
        .ok_or_else(|| EngineError::configuration("no_workspace", "no workspace selected"))
}

pub fn caller(conn: &Connection, params: &Value) -> Result<Caller, EngineError> {
    let staff_id = str_param(params, "callerId")?;
    authz::resolve_caller(conn, &staff_id)
}

pub fn admin_caller(conn: &Connection, params: &Value) -> Result<Caller, EngineError> {
    let caller = caller(conn, params)?;
    if !caller.role.is_report_admin() {
        return Err(EngineError::forbidden("administrative role required"));
    }
    Ok(caller)
}
