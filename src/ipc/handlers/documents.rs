use serde_json::{json, Value};

use crate::authz::{AccessPolicy, DbAccessPolicy};
use crate::docgen::{self, GenerationResult};
use crate::grading::EngineError;
use crate::ipc::error::{fail, ok};
use crate::ipc::helpers::{caller, db_ref, i64_param, opt_str_param, str_param};
use crate::ipc::types::{AppState, Request};

fn generate(state: &AppState, params: &Value) -> Result<GenerationResult, EngineError> {
    let workspace = state
        .workspace
        .as_deref()
        .ok_or_else(|| EngineError::configuration("no_workspace", "no workspace selected"))?;
    let conn = db_ref(state)?;
    let caller = caller(conn, params)?;
    let policy = DbAccessPolicy { conn };
    docgen::generate_register(
        conn,
        workspace,
        &policy,
        &caller,
        &str_param(params, "sectionId")?,
        &str_param(params, "subjectId")?,
        i64_param(params, "schoolYear")?,
        i64_param(params, "trimester")?,
    )
}

fn documents_generate(state: &AppState, params: &Value) -> Result<Value, EngineError> {
    let result = generate(state, params)?;
    Ok(json!({ "document": result }))
}

/// Generate and park the result for later pickup by token.
fn documents_generate_async(state: &mut AppState, params: &Value) -> Result<Value, EngineError> {
    let result = generate(state, params)?;
    let parts_total = result.parts.len();
    let token = state.doc_cache.put(result);
    Ok(json!({ "token": token, "partsTotal": parts_total }))
}

fn documents_fetch(state: &mut AppState, params: &Value) -> Result<Value, EngineError> {
    let token = str_param(params, "token")?;
    let Some(result) = state.doc_cache.get(&token) else {
        return Err(EngineError::validation(
            "token_expired",
            "no pending document for this token",
        ));
    };
    Ok(json!({ "document": result }))
}

fn documents_download(state: &AppState, params: &Value) -> Result<Value, EngineError> {
    let conn = db_ref(state)?;
    let caller = caller(conn, params)?;
    let document_id = str_param(params, "documentId")?;
    let Some(record) = docgen::load_document(conn, &document_id)? else {
        return Err(EngineError::validation("not_found", "document not found"));
    };
    let policy = DbAccessPolicy { conn };
    if !policy.can_view(&caller, &record.section_id, Some(&record.subject_id), None)? {
        return Err(EngineError::forbidden("not allowed to download this document"));
    }

    let bytes = std::fs::read(&record.file_path)
        .map_err(|e| EngineError::internal("artifact_missing", e.to_string()))?;
    // Refuse to hand out an artifact that no longer matches its record.
    if docgen::sha256_hex(&bytes) != record.sha256 {
        return Err(EngineError::conflict("artifact checksum mismatch; regenerate"));
    }

    Ok(json!({
        "filePath": record.file_path,
        "sha256": record.sha256,
        "sizeBytes": bytes.len(),
        "partNumber": record.part_number,
        "partsTotal": record.parts_total,
    }))
}

fn documents_list(state: &AppState, params: &Value) -> Result<Value, EngineError> {
    let conn = db_ref(state)?;
    let caller = caller(conn, params)?;
    let section_id = str_param(params, "sectionId")?;
    let subject_id = opt_str_param(params, "subjectId");
    let policy = DbAccessPolicy { conn };
    if !policy.can_view(&caller, &section_id, subject_id.as_deref(), None)? {
        return Err(EngineError::forbidden("not allowed to view this section"));
    }
    let documents = docgen::list_documents(conn, &section_id, subject_id.as_deref())?;
    Ok(json!({ "documents": documents }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "documents.generate" => Some(match documents_generate(state, &req.params) {
            Ok(v) => ok(&req.id, v),
            Err(e) => fail(&req.id, e),
        }),
        "documents.generateAsync" => Some(match documents_generate_async(state, &req.params) {
            Ok(v) => ok(&req.id, v),
            Err(e) => fail(&req.id, e),
        }),
        "documents.fetch" => Some(match documents_fetch(state, &req.params) {
            Ok(v) => ok(&req.id, v),
            Err(e) => fail(&req.id, e),
        }),
        "documents.download" => Some(match documents_download(state, &req.params) {
            Ok(v) => ok(&req.id, v),
            Err(e) => fail(&req.id, e),
        }),
        "documents.list" => Some(match documents_list(state, &req.params) {
            Ok(v) => ok(&req.id, v),
            Err(e) => fail(&req.id, e),
        }),
        _ => None,
    }
}
