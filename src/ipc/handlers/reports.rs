use serde_json::{json, Value};

use crate::authz::DbAccessPolicy;
use crate::grading::EngineError;
use crate::ipc::error::{fail, ok};
use crate::ipc::helpers::{caller, db_ref, i64_param, str_param};
use crate::ipc::types::{AppState, Request};
use crate::reports;

fn subject_register(state: &AppState, params: &Value) -> Result<Value, EngineError> {
    let conn = db_ref(state)?;
    let caller = caller(conn, params)?;
    let policy = DbAccessPolicy { conn };
    let register = reports::subject_register(
        conn,
        &policy,
        &caller,
        &str_param(params, "sectionId")?,
        &str_param(params, "subjectId")?,
        i64_param(params, "schoolYear")?,
        i64_param(params, "trimester")?,
    )?;
    Ok(json!({ "register": register }))
}

fn trimester_roster(state: &AppState, params: &Value) -> Result<Value, EngineError> {
    let conn = db_ref(state)?;
    let caller = caller(conn, params)?;
    let policy = DbAccessPolicy { conn };
    let roster = reports::trimester_roster(
        conn,
        &policy,
        &caller,
        &str_param(params, "sectionId")?,
        i64_param(params, "schoolYear")?,
        i64_param(params, "trimester")?,
    )?;
    Ok(json!({ "roster": roster }))
}

fn student_transcript(state: &AppState, params: &Value) -> Result<Value, EngineError> {
    let conn = db_ref(state)?;
    let caller = caller(conn, params)?;
    let policy = DbAccessPolicy { conn };
    let transcript = reports::student_transcript(
        conn,
        &policy,
        &caller,
        &str_param(params, "studentId")?,
        i64_param(params, "schoolYear")?,
    )?;
    Ok(json!({ "transcript": transcript }))
}

fn pass_fail_roster(state: &AppState, params: &Value) -> Result<Value, EngineError> {
    let conn = db_ref(state)?;
    let caller = caller(conn, params)?;
    let policy = DbAccessPolicy { conn };
    let roster = reports::pass_fail_roster(
        conn,
        &policy,
        &caller,
        &str_param(params, "sectionId")?,
        i64_param(params, "schoolYear")?,
    )?;
    Ok(json!({ "roster": roster }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run = |f: fn(&AppState, &Value) -> Result<Value, EngineError>| {
        Some(match f(state, &req.params) {
            Ok(v) => ok(&req.id, v),
            Err(e) => fail(&req.id, e),
        })
    };
    match req.method.as_str() {
        "reports.subjectRegister" => run(subject_register),
        "reports.trimesterRoster" => run(trimester_roster),
        "reports.studentTranscript" => run(student_transcript),
        "reports.passFailRoster" => run(pass_fail_roster),
        _ => None,
    }
}
