use serde_json::{json, Value};
use uuid::Uuid;

use crate::grading::EngineError;
use crate::ipc::error::{fail, ok};
use crate::ipc::helpers::{admin_caller, caller, db_ref, i64_param, opt_str_param, str_param};
use crate::ipc::types::{AppState, Request};
use crate::sheet::Workbook;
use crate::templates::{self, Mapping, BRACKETS};

/// Store a new template: the sheet model and its mapping are both
/// validated before anything is written.
fn templates_save(state: &mut AppState, params: &Value) -> Result<Value, EngineError> {
    let workspace = state
        .workspace
        .clone()
        .ok_or_else(|| EngineError::configuration("no_workspace", "no workspace selected"))?;
    let conn = db_ref(state)?;
    let caller = admin_caller(conn, params)?;
    let school_id = str_param(params, "schoolId")?;
    if caller.school_id != school_id {
        return Err(EngineError::forbidden("wrong school"));
    }

    let doc_type = str_param(params, "docType")?;
    let bracket = i64_param(params, "bracket")?;
    if !BRACKETS.contains(&bracket) {
        return Err(EngineError::validation("invalid_input", "unsupported bracket")
            .with_details(json!({ "bracket": bracket, "allowed": BRACKETS })));
    }
    let version = opt_str_param(params, "version").unwrap_or_else(|| "1".to_string());

    let sheet_model = params
        .get("sheet")
        .ok_or_else(|| EngineError::validation("bad_params", "missing params.sheet"))?;
    // Parse eagerly so a broken model is rejected at save time, not when
    // a register is generated from it.
    Workbook::from_json(sheet_model)
        .map_err(|e| EngineError::validation("invalid_input", e.to_string()))?;

    let mapping_value = params
        .get("mapping")
        .ok_or_else(|| EngineError::validation("bad_params", "missing params.mapping"))?;
    let mapping: Mapping = serde_json::from_value(mapping_value.clone())
        .map_err(|e| EngineError::validation("bad_params", e.to_string()))?;
    templates::validate_mapping(&mapping, bracket)?;

    let dir = workspace.join("templates");
    std::fs::create_dir_all(&dir).map_err(EngineError::io)?;
    let file_path = dir.join(format!("{}.sheet.json", Uuid::new_v4()));
    let text = serde_json::to_string_pretty(sheet_model)
        .map_err(|e| EngineError::internal("io_failed", e.to_string()))?;
    std::fs::write(&file_path, text).map_err(EngineError::io)?;

    let template_id = templates::insert_template(
        conn,
        &school_id,
        &doc_type,
        bracket,
        &file_path.to_string_lossy(),
        &version,
        &mapping,
    )?;

    Ok(json!({
        "templateId": template_id,
        "filePath": file_path.to_string_lossy(),
    }))
}

fn templates_activate(state: &mut AppState, params: &Value) -> Result<Value, EngineError> {
    let conn = state
        .db
        .as_mut()
        .ok_or_else(|| EngineError::configuration("no_workspace", "no workspace selected"))?;
    let _caller = admin_caller(conn, params)?;
    let template_id = str_param(params, "templateId")?;
    templates::activate_template(conn, &template_id)?;
    Ok(json!({ "templateId": template_id, "active": true }))
}

fn templates_list(state: &AppState, params: &Value) -> Result<Value, EngineError> {
    let conn = db_ref(state)?;
    let caller = caller(conn, params)?;
    let school_id = str_param(params, "schoolId")?;
    if caller.school_id != school_id {
        return Err(EngineError::forbidden("wrong school"));
    }
    let doc_type = opt_str_param(params, "docType");
    let templates = templates::list_templates(conn, &school_id, doc_type.as_deref())?;
    Ok(json!({ "templates": templates }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "templates.save" => Some(match templates_save(state, &req.params) {
            Ok(v) => ok(&req.id, v),
            Err(e) => fail(&req.id, e),
        }),
        "templates.activate" => Some(match templates_activate(state, &req.params) {
            Ok(v) => ok(&req.id, v),
            Err(e) => fail(&req.id, e),
        }),
        "templates.list" => Some(match templates_list(state, &req.params) {
            Ok(v) => ok(&req.id, v),
            Err(e) => fail(&req.id, e),
        }),
        _ => None,
    }
}
