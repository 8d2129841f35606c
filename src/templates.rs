use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::grading::EngineError;
use crate::sheet;

pub const DOC_TYPE_CADERNETA: &str = "CADERNETA";
pub const DOC_TYPE_PAUTA: &str = "PAUTA";

/// Student-capacity tiers the registry templates are printed for.
pub const BRACKETS: [i64; 4] = [50, 65, 75, 100];

pub const REQUIRED_HEADER_KEYS: [&str; 9] = [
    "teacherName",
    "academicLevel",
    "trainingArea",
    "contact",
    "subject",
    "gradeLabel",
    "sectionName",
    "schoolYear",
    "totalStudents",
];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRecord {
    pub id: String,
    pub school_id: String,
    pub doc_type: String,
    pub bracket: i64,
    pub file_path: String,
    pub version: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    #[serde(default)]
    pub sheet_name: String,
    pub header_cells: BTreeMap<String, String>,
    pub start_row: u32,
    pub max_student_rows: i64,
    #[serde(default)]
    pub grade_columns: BTreeMap<String, String>,
    #[serde(default)]
    pub student_columns: BTreeMap<String, String>,
    #[serde(default)]
    pub continuation_cell: Option<String>,
}

/// Eager save-time validation: cell/column syntax, required header keys,
/// capacity must equal the template's bracket.
pub fn validate_mapping(mapping: &Mapping, bracket: i64) -> Result<(), EngineError> {
    let mut missing: Vec<&str> = Vec::new();
    for key in REQUIRED_HEADER_KEYS {
        if !mapping.header_cells.contains_key(key) {
            missing.push(key);
        }
    }
    if !missing.is_empty() {
        return Err(EngineError::validation(
            "invalid_input",
            format!("headerCells missing required keys: {}", missing.join(", ")),
        )
        .with_details(json!({ "missing": missing })));
    }

    for (key, cell) in &mapping.header_cells {
        if !sheet::is_cell_ref(cell) {
            return Err(EngineError::validation(
                "invalid_input",
                format!("invalid header cell for {}: {}", key, cell),
            ));
        }
    }

    if let Some(cell) = mapping.continuation_cell.as_deref() {
        if !cell.is_empty() && !sheet::is_cell_ref(cell) {
            return Err(EngineError::validation(
                "invalid_input",
                format!("invalid continuation cell: {}", cell),
            ));
        }
    }

    for (name, map) in [
        ("gradeColumns", &mapping.grade_columns),
        ("studentColumns", &mapping.student_columns),
    ] {
        for (key, coord) in map {
            if !sheet::is_cell_ref(coord) && !sheet::is_col_ref(coord) {
                return Err(EngineError::validation(
                    "invalid_input",
                    format!("invalid {} coordinate for {}: {}", name, key, coord),
                ));
            }
        }
    }

    if mapping.start_row == 0 {
        return Err(EngineError::validation("invalid_input", "startRow must be >= 1"));
    }

    if mapping.max_student_rows != bracket {
        return Err(EngineError::validation(
            "invalid_input",
            "maxStudentRows must equal the template bracket",
        )
        .with_details(json!({
            "maxStudentRows": mapping.max_student_rows,
            "bracket": bracket,
        })));
    }

    Ok(())
}

/// Header coordinates used when a filesystem default template has no
/// administrator-provided mapping.
pub fn default_header_mapping() -> BTreeMap<String, String> {
    let pairs = [
        ("teacherName", "A9"),
        ("academicLevel", "E9"),
        ("trainingArea", "N9"),
        ("contact", "U9"),
        ("subject", "A10"),
        ("gradeLabel", "E10"),
        ("sectionName", "J10"),
        ("room", "O10"),
        ("shift", "S10"),
        ("schoolYear", "W10"),
        ("totalStudents", "A11"),
        ("femaleCount", "C11"),
        ("maleCount", "E11"),
        ("homeroomTeacher", "S11"),
    ];
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn default_mapping(bracket: i64) -> Mapping {
    let student_columns = [("rollNumber", "A"), ("fullName", "B"), ("sex", "C")]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Mapping {
        sheet_name: String::new(),
        header_cells: default_header_mapping(),
        start_row: 15,
        max_student_rows: bracket,
        grade_columns: BTreeMap::new(),
        student_columns,
        continuation_cell: None,
    }
}

pub fn insert_template(
    conn: &Connection,
    school_id: &str,
    doc_type: &str,
    bracket: i64,
    file_path: &str,
    version: &str,
    mapping: &Mapping,
) -> Result<String, EngineError> {
    validate_mapping(mapping, bracket)?;

    let template_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO document_templates(
             id, school_id, doc_type, bracket, file_path, version, is_active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, 0, ?)",
        (
            &template_id,
            school_id,
            doc_type,
            bracket,
            file_path,
            version,
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(EngineError::db)?;

    let header_cells = serde_json::to_string(&mapping.header_cells)
        .map_err(|e| EngineError::validation("invalid_input", e.to_string()))?;
    let grade_columns = serde_json::to_string(&mapping.grade_columns)
        .map_err(|e| EngineError::validation("invalid_input", e.to_string()))?;
    let student_columns = serde_json::to_string(&mapping.student_columns)
        .map_err(|e| EngineError::validation("invalid_input", e.to_string()))?;
    conn.execute(
        "INSERT INTO template_mappings(
             template_id, sheet_name, header_cells, start_row, max_student_rows,
             grade_columns, student_columns, continuation_cell)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &template_id,
            &mapping.sheet_name,
            header_cells,
            mapping.start_row,
            mapping.max_student_rows,
            grade_columns,
            student_columns,
            mapping.continuation_cell.as_deref().unwrap_or(""),
        ),
    )
    .map_err(EngineError::db)?;

    Ok(template_id)
}

/// Make a template the active one for its (school, doc type, bracket)
/// scope; the previous active template of the same scope is retired in
/// the same transaction.
pub fn activate_template(conn: &mut Connection, template_id: &str) -> Result<(), EngineError> {
    let tx = conn.transaction().map_err(EngineError::db)?;
    let scope: Option<(String, String, i64)> = tx
        .query_row(
            "SELECT school_id, doc_type, bracket FROM document_templates WHERE id = ?",
            [template_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(EngineError::db)?;
    let Some((school_id, doc_type, bracket)) = scope else {
        return Err(EngineError::validation("not_found", "template not found"));
    };
    tx.execute(
        "UPDATE document_templates SET is_active = 0
         WHERE school_id = ? AND doc_type = ? AND bracket = ? AND is_active = 1",
        (&school_id, &doc_type, bracket),
    )
    .map_err(EngineError::db)?;
    tx.execute(
        "UPDATE document_templates SET is_active = 1 WHERE id = ?",
        [template_id],
    )
    .map_err(EngineError::db)?;
    tx.commit().map_err(EngineError::db)?;
    Ok(())
}

/// Best-fit active template: ascending bracket walk, first bracket that
/// holds the whole roster; an oversized roster falls back to the largest
/// bracket (the generator paginates).
pub fn select_template(
    conn: &Connection,
    school_id: &str,
    doc_type: &str,
    student_count: i64,
) -> Result<Option<TemplateRecord>, EngineError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, school_id, doc_type, bracket, file_path, version, is_active
             FROM document_templates
             WHERE school_id = ? AND doc_type = ? AND is_active = 1
             ORDER BY bracket",
        )
        .map_err(EngineError::db)?;
    let templates = stmt
        .query_map((school_id, doc_type), |r| {
            Ok(TemplateRecord {
                id: r.get(0)?,
                school_id: r.get(1)?,
                doc_type: r.get(2)?,
                bracket: r.get(3)?,
                file_path: r.get(4)?,
                version: r.get(5)?,
                is_active: r.get::<_, i64>(6)? != 0,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(EngineError::db)?;

    if templates.is_empty() {
        return Ok(None);
    }
    for t in &templates {
        if t.bracket >= student_count {
            return Ok(Some(t.clone()));
        }
    }
    Ok(templates.last().cloned())
}

pub fn load_mapping(conn: &Connection, template_id: &str) -> Result<Option<Mapping>, EngineError> {
    let row: Option<(String, String, u32, i64, String, String, String)> = conn
        .query_row(
            "SELECT sheet_name, header_cells, start_row, max_student_rows,
                    grade_columns, student_columns, continuation_cell
             FROM template_mappings WHERE template_id = ?",
            [template_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                ))
            },
        )
        .optional()
        .map_err(EngineError::db)?;
    let Some((sheet_name, header, start_row, max_rows, grades, students, continuation)) = row
    else {
        return Ok(None);
    };

    let parse_map = |text: &str| -> Result<BTreeMap<String, String>, EngineError> {
        serde_json::from_str(text)
            .map_err(|e| EngineError::internal("db_query_failed", e.to_string()))
    };

    Ok(Some(Mapping {
        sheet_name,
        header_cells: parse_map(&header)?,
        start_row,
        max_student_rows: max_rows,
        grade_columns: parse_map(&grades)?,
        student_columns: parse_map(&students)?,
        continuation_cell: if continuation.is_empty() {
            None
        } else {
            Some(continuation)
        },
    }))
}

pub fn list_templates(
    conn: &Connection,
    school_id: &str,
    doc_type: Option<&str>,
) -> Result<Vec<TemplateRecord>, EngineError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, school_id, doc_type, bracket, file_path, version, is_active
             FROM document_templates
             WHERE school_id = ? AND (?2 IS NULL OR doc_type = ?2)
             ORDER BY doc_type, bracket, version",
        )
        .map_err(EngineError::db)?;
    stmt.query_map((school_id, doc_type), |r| {
        Ok(TemplateRecord {
            id: r.get(0)?,
            school_id: r.get(1)?,
            doc_type: r.get(2)?,
            bracket: r.get(3)?,
            file_path: r.get(4)?,
            version: r.get(5)?,
            is_active: r.get::<_, i64>(6)? != 0,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(EngineError::db)
}

/// Secondary template source: workspace-provided default sheet models
/// keyed by the same bracket values.
pub fn default_template_path(workspace: &Path, bracket: i64) -> Option<PathBuf> {
    if !BRACKETS.contains(&bracket) {
        return None;
    }
    let path = workspace
        .join("templates")
        .join("defaults")
        .join(format!("caderneta_ate_{}.sheet.json", bracket));
    if path.is_file() {
        Some(path)
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedTemplate {
    pub path: PathBuf,
    pub record: Option<TemplateRecord>,
    pub mapping: Mapping,
    pub bracket: i64,
}

/// Template resolution for the generator: active DB template first, then
/// the filesystem default set with its stock mapping.
pub fn resolve_template(
    conn: &Connection,
    workspace: &Path,
    school_id: &str,
    doc_type: &str,
    student_count: i64,
) -> Result<Option<ResolvedTemplate>, EngineError> {
    if let Some(record) = select_template(conn, school_id, doc_type, student_count)? {
        let mapping = load_mapping(conn, &record.id)?
            .unwrap_or_else(|| default_mapping(record.bracket));
        let bracket = record.bracket;
        return Ok(Some(ResolvedTemplate {
            path: PathBuf::from(&record.file_path),
            record: Some(record),
            mapping,
            bracket,
        }));
    }

    let available: Vec<i64> = BRACKETS
        .iter()
        .copied()
        .filter(|b| default_template_path(workspace, *b).is_some())
        .collect();
    let chosen = available
        .iter()
        .copied()
        .find(|b| *b >= student_count)
        .or_else(|| available.last().copied());
    let Some(bracket) = chosen else {
        return Ok(None);
    };
    let Some(path) = default_template_path(workspace, bracket) else {
        return Ok(None);
    };
    Ok(Some(ResolvedTemplate {
        path,
        record: None,
        mapping: default_mapping(bracket),
        bracket,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_workspace(prefix: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    fn seeded_conn() -> Connection {
        let ws = temp_workspace("salamandra-templates");
        let conn = db::open_db(&ws).expect("open db");
        conn.execute(
            "INSERT INTO schools(id, name, current_school_year, current_trimester)
             VALUES('sch', 'Escola Teste', 2026, 1)",
            [],
        )
        .expect("school");
        conn
    }

    fn mapping_for(bracket: i64) -> Mapping {
        default_mapping(bracket)
    }

    #[test]
    fn mapping_requires_header_keys() {
        let mut m = mapping_for(50);
        m.header_cells.remove("contact");
        let err = validate_mapping(&m, 50).unwrap_err();
        assert_eq!(err.code, "invalid_input");
        assert!(err.message.contains("contact"));
    }

    #[test]
    fn mapping_rejects_bad_coordinates() {
        let mut m = mapping_for(50);
        m.header_cells.insert("subject".to_string(), "10A".to_string());
        assert!(validate_mapping(&m, 50).is_err());

        let mut m = mapping_for(50);
        m.student_columns.insert("fullName".to_string(), "b".to_string());
        assert!(validate_mapping(&m, 50).is_err());

        let mut m = mapping_for(50);
        m.continuation_cell = Some("A0".to_string());
        assert!(validate_mapping(&m, 50).is_err());
    }

    #[test]
    fn mapping_capacity_must_match_bracket() {
        let m = mapping_for(50);
        assert!(validate_mapping(&m, 50).is_ok());
        assert!(validate_mapping(&m, 65).is_err());
    }

    #[test]
    fn selector_prefers_first_fitting_bracket() {
        let mut conn = seeded_conn();
        let t50 = insert_template(
            &conn,
            "sch",
            DOC_TYPE_CADERNETA,
            50,
            "/tmp/t50.sheet.json",
            "1",
            &mapping_for(50),
        )
        .expect("insert 50");
        let t75 = insert_template(
            &conn,
            "sch",
            DOC_TYPE_CADERNETA,
            75,
            "/tmp/t75.sheet.json",
            "1",
            &mapping_for(75),
        )
        .expect("insert 75");
        activate_template(&mut conn, &t50).expect("activate 50");
        activate_template(&mut conn, &t75).expect("activate 75");

        let chosen = select_template(&conn, "sch", DOC_TYPE_CADERNETA, 60)
            .expect("select")
            .expect("some");
        assert_eq!(chosen.bracket, 75);

        let chosen = select_template(&conn, "sch", DOC_TYPE_CADERNETA, 40)
            .expect("select")
            .expect("some");
        assert_eq!(chosen.bracket, 50);

        // Roster beyond every bracket: best effort, largest wins.
        let chosen = select_template(&conn, "sch", DOC_TYPE_CADERNETA, 150)
            .expect("select")
            .expect("some");
        assert_eq!(chosen.bracket, 75);
    }

    #[test]
    fn selector_ignores_inactive_templates() {
        let conn = seeded_conn();
        insert_template(
            &conn,
            "sch",
            DOC_TYPE_CADERNETA,
            50,
            "/tmp/t50.sheet.json",
            "1",
            &mapping_for(50),
        )
        .expect("insert");
        let chosen = select_template(&conn, "sch", DOC_TYPE_CADERNETA, 10).expect("select");
        assert!(chosen.is_none());
    }

    #[test]
    fn activation_retires_previous_active_in_scope() {
        let mut conn = seeded_conn();
        let a = insert_template(
            &conn,
            "sch",
            DOC_TYPE_CADERNETA,
            50,
            "/tmp/a.sheet.json",
            "1",
            &mapping_for(50),
        )
        .expect("insert a");
        let b = insert_template(
            &conn,
            "sch",
            DOC_TYPE_CADERNETA,
            50,
            "/tmp/b.sheet.json",
            "2",
            &mapping_for(50),
        )
        .expect("insert b");
        activate_template(&mut conn, &a).expect("activate a");
        activate_template(&mut conn, &b).expect("activate b");

        let templates = list_templates(&conn, "sch", Some(DOC_TYPE_CADERNETA)).expect("list");
        let active: Vec<&TemplateRecord> = templates.iter().filter(|t| t.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, b);
    }

    #[test]
    fn filesystem_defaults_are_secondary() {
        let ws = temp_workspace("salamandra-template-defaults");
        let conn = db::open_db(&ws).expect("open db");
        conn.execute(
            "INSERT INTO schools(id, name, current_school_year, current_trimester)
             VALUES('sch', 'Escola', 2026, 1)",
            [],
        )
        .expect("school");

        assert!(
            resolve_template(&conn, &ws, "sch", DOC_TYPE_CADERNETA, 30)
                .expect("resolve")
                .is_none()
        );

        let defaults = ws.join("templates").join("defaults");
        std::fs::create_dir_all(&defaults).expect("mkdir");
        std::fs::write(
            defaults.join("caderneta_ate_65.sheet.json"),
            serde_json::to_string(&serde_json::json!({ "sheetName": "Caderneta", "cells": {} }))
                .expect("json"),
        )
        .expect("write default");

        let resolved = resolve_template(&conn, &ws, "sch", DOC_TYPE_CADERNETA, 30)
            .expect("resolve")
            .expect("some");
        assert!(resolved.record.is_none());
        assert_eq!(resolved.bracket, 65);
        assert_eq!(resolved.mapping.max_student_rows, 65);
    }
}
