use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::authz::{self, AccessPolicy};
use crate::grading::{self, EngineError, SummaryKey, SCORE_KINDS, SCORE_MAX, SCORE_MIN};
use crate::ipc::error::{fail, ok};
use crate::ipc::helpers::{caller, db_ref, i64_param, nullable_f64_param, str_param};
use crate::ipc::types::{AppState, Request};

fn key_from_params(params: &Value) -> Result<SummaryKey, EngineError> {
    Ok(SummaryKey {
        school_id: str_param(params, "schoolId")?,
        student_id: str_param(params, "studentId")?,
        section_id: str_param(params, "sectionId")?,
        subject_id: str_param(params, "subjectId")?,
        school_year: i64_param(params, "schoolYear")?,
        trimester: i64_param(params, "trimester")?,
    })
}

/// Write one score slot and recompute its summary in the same transaction.
fn scores_upsert(state: &mut AppState, params: &Value) -> Result<Value, EngineError> {
    let conn = state
        .db
        .as_mut()
        .ok_or_else(|| EngineError::configuration("no_workspace", "no workspace selected"))?;

    let key = key_from_params(params)?;
    let kind = str_param(params, "kind")?;
    if !SCORE_KINDS.contains(&kind.as_str()) {
        return Err(EngineError::validation("invalid_input", "unknown score kind")
            .with_details(json!({ "kind": kind, "allowed": SCORE_KINDS })));
    }
    let value = nullable_f64_param(params, "value")?;
    if let Some(v) = value {
        if !(SCORE_MIN..=SCORE_MAX).contains(&v) {
            return Err(EngineError::validation("invalid_input", "score out of range")
                .with_details(json!({ "value": v, "min": SCORE_MIN, "max": SCORE_MAX })));
        }
    }
    if !(1..=3).contains(&key.trimester) {
        return Err(EngineError::validation("invalid_input", "trimester must be 1..3"));
    }

    let caller = caller(conn, params)?;
    if caller.school_id != key.school_id {
        return Err(EngineError::forbidden("wrong school"));
    }
    if !authz::can_edit_scores(conn, &caller, &key.section_id, &key.subject_id)? {
        return Err(EngineError::forbidden("not allowed to edit these scores"));
    }
    authz::enforce_current_period(conn, &key.school_id, key.school_year, key.trimester)?;

    let tx = conn.transaction().map_err(EngineError::db)?;
    tx.execute(
        "INSERT INTO scores(id, school_id, student_id, section_id, subject_id,
                            school_year, trimester, kind, value, recorded_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(school_id, student_id, section_id, subject_id, school_year, trimester, kind)
         DO UPDATE SET value = excluded.value, recorded_at = excluded.recorded_at",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            &key.school_id,
            &key.student_id,
            &key.section_id,
            &key.subject_id,
            key.school_year,
            key.trimester,
            &kind,
            value,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(EngineError::db)?;
    let summary = grading::recompute_summary(&tx, &key)?;
    let year_average = grading::year_discipline_average(
        &tx,
        &key.school_id,
        &key.student_id,
        &key.subject_id,
        key.school_year,
    )?;
    tx.commit().map_err(EngineError::db)?;

    Ok(json!({ "summary": summary, "yearAverage": year_average }))
}

fn scores_get(state: &AppState, params: &Value) -> Result<Value, EngineError> {
    let conn = db_ref(state)?;
    let key = key_from_params(params)?;
    let caller = caller(conn, params)?;
    let policy = authz::DbAccessPolicy { conn };
    if !policy.can_view(
        &caller,
        &key.section_id,
        Some(&key.subject_id),
        Some(&key.student_id),
    )? {
        return Err(EngineError::forbidden("not allowed to view these scores"));
    }

    let slots = grading::load_slots(conn, &key)?;
    let summary = grading::load_summary(conn, &key)?;
    let year_average = grading::year_discipline_average(
        conn,
        &key.school_id,
        &key.student_id,
        &key.subject_id,
        key.school_year,
    )?;
    Ok(json!({ "slots": slots, "summary": summary, "yearAverage": year_average }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scores.upsert" => Some(match scores_upsert(state, &req.params) {
            Ok(v) => ok(&req.id, v),
            Err(e) => fail(&req.id, e),
        }),
        "scores.get" => Some(match scores_get(state, &req.params) {
            Ok(v) => ok(&req.id, v),
            Err(e) => fail(&req.id, e),
        }),
        _ => None,
    }
}
