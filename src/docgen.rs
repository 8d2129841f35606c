use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::authz::{AccessPolicy, Caller};
use crate::grading::{self, EngineError, SummaryKey};
use crate::reports::{self, RosterStudent};
use crate::sheet::{self, CellValue, Workbook};
use crate::templates::{self, Mapping, ResolvedTemplate, DOC_TYPE_CADERNETA};

const OFFLOAD_TTL_MINUTES: i64 = 60;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedPart {
    pub id: String,
    pub part_number: i64,
    pub parts_total: i64,
    pub file_name: String,
    pub file_path: String,
    pub sha256: String,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    pub doc_type: String,
    pub section_id: String,
    pub subject_id: String,
    pub school_year: i64,
    pub trimester: i64,
    pub template_version: String,
    pub parts: Vec<GeneratedPart>,
}

/// Holds finished artifacts for pickup by token. Entries expire after an
/// hour; expired entries are dropped on every access.
pub struct OffloadCache {
    entries: HashMap<String, OffloadEntry>,
}

struct OffloadEntry {
    expires_at: DateTime<Utc>,
    result: GenerationResult,
}

impl OffloadCache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn put(&mut self, result: GenerationResult) -> String {
        self.prune();
        let token = Uuid::new_v4().to_string();
        self.entries.insert(
            token.clone(),
            OffloadEntry {
                expires_at: Utc::now() + Duration::minutes(OFFLOAD_TTL_MINUTES),
                result,
            },
        );
        token
    }

    pub fn get(&mut self, token: &str) -> Option<&GenerationResult> {
        self.prune();
        self.entries.get(token).map(|e| &e.result)
    }

    fn prune(&mut self) {
        let now = Utc::now();
        self.entries.retain(|_, e| e.expires_at > now);
    }

    #[cfg(test)]
    fn expire(&mut self, token: &str) {
        if let Some(e) = self.entries.get_mut(token) {
            e.expires_at = Utc::now() - Duration::minutes(1);
        }
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn part_count(students: usize, capacity: i64) -> i64 {
    if students == 0 || capacity <= 0 {
        return 1;
    }
    ((students as i64) + capacity - 1) / capacity
}

struct TeacherHeader {
    name: String,
    academic_level: String,
    training_area: String,
    contact: String,
}

/// The register carries the requesting teacher's qualification block;
/// generation is refused until the caller's own profile is filled in.
fn load_teacher_header(conn: &Connection, caller: &Caller) -> Result<TeacherHeader, EngineError> {
    let (name, academic_level, training_area, contact): (
        String,
        Option<String>,
        Option<String>,
        Option<String>,
    ) = conn
        .query_row(
            "SELECT st.full_name, tp.academic_level, tp.training_area, tp.contact
             FROM staff st
             LEFT JOIN teacher_profiles tp ON tp.staff_id = st.id
             WHERE st.id = ?",
            [&caller.staff_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .map_err(EngineError::db)?;

    let academic_level = academic_level.unwrap_or_default();
    let training_area = training_area.unwrap_or_default();
    let contact = contact.unwrap_or_default();
    let mut missing = Vec::new();
    for (field, value) in [
        ("academicLevel", &academic_level),
        ("trainingArea", &training_area),
        ("contact", &contact),
    ] {
        if value.trim().is_empty() {
            missing.push(field);
        }
    }
    if !missing.is_empty() {
        return Err(EngineError::configuration(
            "incomplete_teacher_profile",
            "complete your teacher profile before generating documents",
        )
        .with_details(serde_json::json!({ "staffId": caller.staff_id, "missing": missing })));
    }

    Ok(TeacherHeader {
        name,
        academic_level,
        training_area,
        contact,
    })
}

fn homeroom_teacher_name(
    conn: &Connection,
    section_id: &str,
) -> Result<Option<String>, EngineError> {
    conn.query_row(
        "SELECT st.full_name FROM homeroom_assignments ha
         JOIN staff st ON st.id = ha.staff_id
         WHERE ha.section_id = ?",
        [section_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(EngineError::db)
}

fn set_header(wb: &mut Workbook, mapping: &Mapping, key: &str, value: CellValue) {
    if let Some(coord) = mapping.header_cells.get(key) {
        if let Some(cell) = sheet::CellRef::parse(coord) {
            wb.set_cell(cell, value);
        }
    }
}

fn grade_cell_value(
    conn: &Connection,
    key: &SummaryKey,
    column: &str,
) -> Result<Option<CellValue>, EngineError> {
    if grading::SCORE_KINDS.contains(&column) {
        let slots = grading::load_slots(conn, key)?;
        return Ok(slots.get(column).map(CellValue::Number));
    }
    match column {
        "MACS" => Ok(grading::load_summary(conn, key)?
            .and_then(|s| s.macs)
            .map(CellValue::Number)),
        "MT" => Ok(grading::load_summary(conn, key)?
            .and_then(|s| s.mt)
            .map(|mt| CellValue::Number(mt as f64))),
        "COM" => Ok(grading::load_summary(conn, key)?
            .and_then(|s| s.com)
            .map(CellValue::Text)),
        "MFD" => Ok(grading::year_discipline_average(
            conn,
            &key.school_id,
            &key.student_id,
            &key.subject_id,
            key.school_year,
        )?
        .map(CellValue::Number)),
        _ => Ok(None),
    }
}

/// Headcounts for the header block. Always taken over the whole roster,
/// so every part of a split register shows the same totals.
struct RosterCounts {
    total: usize,
    females: usize,
    males: usize,
}

impl RosterCounts {
    fn of(roster: &[RosterStudent]) -> Self {
        let females = roster
            .iter()
            .filter(|s| s.sex.eq_ignore_ascii_case("f"))
            .count();
        Self {
            total: roster.len(),
            females,
            males: roster.len() - females,
        }
    }
}

fn render_part(
    conn: &Connection,
    template: &ResolvedTemplate,
    section: &reports::SectionInfo,
    subject_name: &str,
    teacher: &TeacherHeader,
    homeroom: Option<&str>,
    slice: &[RosterStudent],
    counts: &RosterCounts,
    subject_id: &str,
    school_year: i64,
    trimester: i64,
    part_number: i64,
    parts_total: i64,
) -> Result<Vec<u8>, EngineError> {
    let mut wb = Workbook::open(&template.path)
        .map_err(|e| EngineError::configuration("template_unreadable", e.to_string()))?;
    let mapping = &template.mapping;

    set_header(&mut wb, mapping, "teacherName", CellValue::Text(teacher.name.clone()));
    set_header(
        &mut wb,
        mapping,
        "academicLevel",
        CellValue::Text(teacher.academic_level.clone()),
    );
    set_header(
        &mut wb,
        mapping,
        "trainingArea",
        CellValue::Text(teacher.training_area.clone()),
    );
    set_header(&mut wb, mapping, "contact", CellValue::Text(teacher.contact.clone()));
    set_header(&mut wb, mapping, "subject", CellValue::Text(subject_name.to_string()));
    set_header(
        &mut wb,
        mapping,
        "gradeLabel",
        CellValue::Text(section.grade_label.clone()),
    );
    set_header(&mut wb, mapping, "sectionName", CellValue::Text(section.name.clone()));
    set_header(
        &mut wb,
        mapping,
        "schoolYear",
        CellValue::Number(school_year as f64),
    );
    set_header(
        &mut wb,
        mapping,
        "totalStudents",
        CellValue::Number(counts.total as f64),
    );
    set_header(
        &mut wb,
        mapping,
        "femaleCount",
        CellValue::Number(counts.females as f64),
    );
    set_header(
        &mut wb,
        mapping,
        "maleCount",
        CellValue::Number(counts.males as f64),
    );
    if let Some(room) = section.room.as_deref() {
        set_header(&mut wb, mapping, "room", CellValue::Text(room.to_string()));
    }
    if let Some(shift) = section.shift.as_deref() {
        set_header(&mut wb, mapping, "shift", CellValue::Text(shift.to_string()));
    }
    if let Some(homeroom) = homeroom {
        set_header(
            &mut wb,
            mapping,
            "homeroomTeacher",
            CellValue::Text(homeroom.to_string()),
        );
    }

    if parts_total > 1 {
        if let Some(coord) = mapping.continuation_cell.as_deref() {
            if let Some(cell) = sheet::CellRef::parse(coord) {
                wb.set_cell(
                    cell,
                    CellValue::Text(format!("Parte {} de {}", part_number, parts_total)),
                );
            }
        }
    }

    for (offset, student) in slice.iter().enumerate() {
        let row = mapping.start_row + offset as u32;
        for (field, coord) in &mapping.student_columns {
            let Some(cell) = sheet::resolve_cell(coord, row) else {
                continue;
            };
            let value = match field.as_str() {
                "rollNumber" => student.roll_number.map(|n| CellValue::Number(n as f64)),
                "fullName" => Some(CellValue::Text(student.full_name.clone())),
                "sex" => Some(CellValue::Text(student.sex.to_uppercase())),
                _ => None,
            };
            if let Some(value) = value {
                wb.set_cell(cell, value);
            }
        }

        let key = SummaryKey {
            school_id: section.school_id.clone(),
            student_id: student.id.clone(),
            section_id: section.id.clone(),
            subject_id: subject_id.to_string(),
            school_year,
            trimester,
        };
        for (column, coord) in &mapping.grade_columns {
            let Some(cell) = sheet::resolve_cell(coord, row) else {
                continue;
            };
            if let Some(value) = grade_cell_value(conn, &key, column)? {
                wb.set_cell(cell, value);
            }
        }
    }

    // Surplus capacity rows stay in the sheet but print hidden.
    let used = slice.len() as u32;
    let capacity = mapping.max_student_rows as u32;
    for offset in used..capacity {
        wb.hide_row(mapping.start_row + offset);
    }

    wb.save_bytes()
        .map_err(|e| EngineError::internal("render_failed", e.to_string()))
}

/// Generate the subject register book set for one (section, subject,
/// trimester). All parts render before anything is persisted; a failure
/// while persisting removes every file already written in the batch.
pub fn generate_register(
    conn: &Connection,
    workspace: &Path,
    policy: &dyn AccessPolicy,
    caller: &Caller,
    section_id: &str,
    subject_id: &str,
    school_year: i64,
    trimester: i64,
) -> Result<GenerationResult, EngineError> {
    if !policy.can_view(caller, section_id, Some(subject_id), None)? {
        return Err(EngineError::forbidden("not allowed to generate for this section"));
    }

    let section = reports::load_section(conn, section_id)?;
    let subject_name: String = conn
        .query_row("SELECT name FROM subjects WHERE id = ?", [subject_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(EngineError::db)?
        .ok_or_else(|| EngineError::validation("not_found", "subject not found"))?;

    let teacher = load_teacher_header(conn, caller)?;
    let homeroom = homeroom_teacher_name(conn, section_id)?;
    let roster = reports::roster_students(conn, section_id, true)?;
    let counts = RosterCounts::of(&roster);

    let template = templates::resolve_template(
        conn,
        workspace,
        &section.school_id,
        DOC_TYPE_CADERNETA,
        roster.len() as i64,
    )?
    .ok_or_else(|| {
        EngineError::configuration(
            "template_not_found",
            "no register template is available for this school",
        )
    })?;

    let capacity = template.mapping.max_student_rows;
    let parts_total = part_count(roster.len(), capacity);

    let mut parts = Vec::with_capacity(parts_total as usize);
    for part_number in 1..=parts_total {
        let start = ((part_number - 1) * capacity) as usize;
        let end = (start + capacity as usize).min(roster.len());
        let slice = &roster[start..end];
        let bytes = render_part(
            conn,
            &template,
            &section,
            &subject_name,
            &teacher,
            homeroom.as_deref(),
            slice,
            &counts,
            subject_id,
            school_year,
            trimester,
            part_number,
            parts_total,
        )?;
        let sha256 = sha256_hex(&bytes);
        let file_name = format!(
            "caderneta_{}_{}_{}_t{}_parte_{}_de_{}.xlsx",
            section.name.to_lowercase().replace(' ', "_"),
            subject_id,
            school_year,
            trimester,
            part_number,
            parts_total
        );
        parts.push(GeneratedPart {
            id: Uuid::new_v4().to_string(),
            part_number,
            parts_total,
            file_name,
            file_path: String::new(),
            sha256,
            bytes,
        });
    }

    let template_version = template
        .record
        .as_ref()
        .map(|r| r.version.clone())
        .unwrap_or_else(|| "default".to_string());
    let template_id = template.record.as_ref().map(|r| r.id.clone());

    persist_parts(
        conn,
        workspace,
        caller,
        &section,
        subject_id,
        school_year,
        trimester,
        template_id.as_deref(),
        &template_version,
        &mut parts,
    )?;

    Ok(GenerationResult {
        doc_type: DOC_TYPE_CADERNETA.to_string(),
        section_id: section_id.to_string(),
        subject_id: subject_id.to_string(),
        school_year,
        trimester,
        template_version,
        parts,
    })
}

fn persist_parts(
    conn: &Connection,
    workspace: &Path,
    caller: &Caller,
    section: &reports::SectionInfo,
    subject_id: &str,
    school_year: i64,
    trimester: i64,
    template_id: Option<&str>,
    template_version: &str,
    parts: &mut [GeneratedPart],
) -> Result<(), EngineError> {
    let out_dir = workspace.join("documents");
    let mut written: Vec<PathBuf> = Vec::new();

    let result = (|| -> Result<(), EngineError> {
        std::fs::create_dir_all(&out_dir).map_err(EngineError::io)?;
        for part in parts.iter_mut() {
            let path = out_dir.join(&part.file_name);
            std::fs::write(&path, &part.bytes).map_err(EngineError::io)?;
            written.push(path.clone());
            part.file_path = path.to_string_lossy().into_owned();

            conn.execute(
                "INSERT INTO generated_documents(
                     id, school_id, doc_type, section_id, subject_id, trimester,
                     school_year, generated_by, file_path, sha256,
                     part_number, parts_total, template_id, template_version, created_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    &part.id,
                    &section.school_id,
                    DOC_TYPE_CADERNETA,
                    &section.id,
                    subject_id,
                    trimester,
                    school_year,
                    &caller.staff_id,
                    &part.file_path,
                    &part.sha256,
                    part.part_number,
                    part.parts_total,
                    template_id,
                    template_version,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(EngineError::db)?;
        }
        Ok(())
    })();

    if result.is_err() {
        for path in written {
            let _ = std::fs::remove_file(path);
        }
    }
    result
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub id: String,
    pub doc_type: String,
    pub section_id: String,
    pub subject_id: String,
    pub trimester: i64,
    pub school_year: i64,
    pub generated_by: Option<String>,
    pub file_path: String,
    pub sha256: String,
    pub part_number: i64,
    pub parts_total: i64,
    pub template_version: String,
    pub created_at: Option<String>,
}

pub fn list_documents(
    conn: &Connection,
    section_id: &str,
    subject_id: Option<&str>,
) -> Result<Vec<DocumentRecord>, EngineError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, doc_type, section_id, subject_id, trimester, school_year,
                    generated_by, file_path, sha256, part_number, parts_total,
                    template_version, created_at
             FROM generated_documents
             WHERE section_id = ? AND (?2 IS NULL OR subject_id = ?2)
             ORDER BY created_at, part_number",
        )
        .map_err(EngineError::db)?;
    stmt.query_map((section_id, subject_id), |r| {
        Ok(DocumentRecord {
            id: r.get(0)?,
            doc_type: r.get(1)?,
            section_id: r.get(2)?,
            subject_id: r.get(3)?,
            trimester: r.get(4)?,
            school_year: r.get(5)?,
            generated_by: r.get(6)?,
            file_path: r.get(7)?,
            sha256: r.get(8)?,
            part_number: r.get(9)?,
            parts_total: r.get(10)?,
            template_version: r.get(11)?,
            created_at: r.get(12)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(EngineError::db)
}

pub fn load_document(
    conn: &Connection,
    document_id: &str,
) -> Result<Option<DocumentRecord>, EngineError> {
    conn.query_row(
        "SELECT id, doc_type, section_id, subject_id, trimester, school_year,
                generated_by, file_path, sha256, part_number, parts_total,
                template_version, created_at
         FROM generated_documents WHERE id = ?",
        [document_id],
        |r| {
            Ok(DocumentRecord {
                id: r.get(0)?,
                doc_type: r.get(1)?,
                section_id: r.get(2)?,
                subject_id: r.get(3)?,
                trimester: r.get(4)?,
                school_year: r.get(5)?,
                generated_by: r.get(6)?,
                file_path: r.get(7)?,
                sha256: r.get(8)?,
                part_number: r.get(9)?,
                parts_total: r.get(10)?,
                template_version: r.get(11)?,
                created_at: r.get(12)?,
            })
        },
    )
    .optional()
    .map_err(EngineError::db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::{resolve_caller, DbAccessPolicy};
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

    fn write_default_template(ws: &Path, bracket: i64) {
        let dir = ws.join("templates").join("defaults");
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(
            dir.join(format!("caderneta_ate_{}.sheet.json", bracket)),
            serde_json::to_string(&serde_json::json!({
                "sheetName": "Caderneta",
                "cells": { "A1": "CADERNETA DA DISCIPLINA" },
                "merged": ["A1:F1"]
            }))
            .expect("json"),
        )
        .expect("write template");
    }

    fn seed(ws: &Path, students: usize) -> Connection {
        let conn = db::open_db(ws).expect("open db");
        conn.execute(
            "INSERT INTO schools(id, name, current_school_year, current_trimester)
             VALUES('sch', 'Escola Teste', 2026, 1)",
            [],
        )
        .expect("school");
        conn.execute(
            "INSERT INTO class_sections(id, school_id, name, grade_label, room, shift, school_year)
             VALUES('sec', 'sch', 'A', '10a', 'Sala 4', 'manha', 2026)",
            [],
        )
        .expect("section");
        conn.execute(
            "INSERT INTO subjects(id, school_id, name, sort_order)
             VALUES('mat', 'sch', 'Matematica', 1)",
            [],
        )
        .expect("subject");
        conn.execute(
            "INSERT INTO staff(id, school_id, full_name, role)
             VALUES('admin', 'sch', 'Admin', 'school_admin')",
            [],
        )
        .expect("staff");
        conn.execute(
            "INSERT INTO staff(id, school_id, full_name, role)
             VALUES('prof', 'sch', 'Carlos Nhaca', 'teacher')",
            [],
        )
        .expect("staff");
        conn.execute(
            "INSERT INTO teaching_assignments(school_id, staff_id, section_id, subject_id)
             VALUES('sch', 'prof', 'sec', 'mat')",
            [],
        )
        .expect("assignment");
        conn.execute(
            "INSERT INTO teacher_profiles(staff_id, academic_level, training_area, contact)
             VALUES('prof', 'Licenciatura', 'Matematica', '84 000 0000')",
            [],
        )
        .expect("profile");
        for i in 0..students {
            conn.execute(
                "INSERT INTO students(id, school_id, section_id, full_name, sex, roll_number, status)
                 VALUES(?, 'sch', 'sec', ?, ?, ?, 'active')",
                (
                    format!("stu{:03}", i),
                    format!("Aluno {:03}", i),
                    if i % 2 == 0 { "F" } else { "M" },
                    (i + 1) as i64,
                ),
            )
            .expect("student");
        }
        conn
    }

    fn generate(conn: &Connection, ws: &Path) -> Result<GenerationResult, EngineError> {
        let caller = resolve_caller(conn, "prof").expect("caller");
        let policy = DbAccessPolicy { conn };
        generate_register(conn, ws, &policy, &caller, "sec", "mat", 2026, 1)
    }

    fn sheet_xml(bytes: &[u8]) -> String {
        use std::io::Read;
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).expect("zip");
        let mut xml = String::new();
        archive
            .by_name("xl/worksheets/sheet1.xml")
            .expect("worksheet entry")
            .read_to_string(&mut xml)
            .expect("read worksheet");
        xml
    }

    #[test]
    fn pagination_splits_the_roster_at_capacity() {
        let ws = temp_workspace("salamandra-docgen-parts");
        let conn = seed(&ws, 101);
        write_default_template(&ws, 50);

        let result = generate(&conn, &ws).expect("generate");
        assert_eq!(result.parts.len(), 3);
        assert_eq!(result.parts[0].parts_total, 3);
        assert_eq!(result.parts[2].part_number, 3);

        // Every part landed on disk with its recorded checksum.
        for part in &result.parts {
            let bytes = std::fs::read(&part.file_path).expect("read artifact");
            assert_eq!(sha256_hex(&bytes), part.sha256);
            assert_eq!(bytes[..4], [0x50, 0x4B, 0x03, 0x04]);
        }

        let docs = list_documents(&conn, "sec", Some("mat")).expect("list");
        assert_eq!(docs.len(), 3);
        assert!(docs.iter().all(|d| d.parts_total == 3));
    }

    #[test]
    fn single_part_when_roster_fits() {
        let ws = temp_workspace("salamandra-docgen-single");
        let conn = seed(&ws, 20);
        write_default_template(&ws, 50);

        let result = generate(&conn, &ws).expect("generate");
        assert_eq!(result.parts.len(), 1);
        assert_eq!(result.parts[0].parts_total, 1);
    }

    #[test]
    fn empty_roster_still_yields_one_part() {
        let ws = temp_workspace("salamandra-docgen-empty");
        let conn = seed(&ws, 0);
        write_default_template(&ws, 50);

        let result = generate(&conn, &ws).expect("generate");
        assert_eq!(result.parts.len(), 1);
    }

    #[test]
    fn incomplete_profile_blocks_generation() {
        let ws = temp_workspace("salamandra-docgen-profile");
        let conn = seed(&ws, 5);
        write_default_template(&ws, 50);
        conn.execute(
            "UPDATE teacher_profiles SET contact = '' WHERE staff_id = 'prof'",
            [],
        )
        .expect("blank contact");

        let err = generate(&conn, &ws).unwrap_err();
        assert_eq!(err.code, "incomplete_teacher_profile");
        let details = err.details.expect("details");
        assert_eq!(details["missing"][0], "contact");
    }

    #[test]
    fn caller_without_a_profile_cannot_generate() {
        let ws = temp_workspace("salamandra-docgen-noprofile");
        let conn = seed(&ws, 5);
        write_default_template(&ws, 50);

        // The admin has view rights but never filled in a teacher profile.
        let caller = resolve_caller(&conn, "admin").expect("caller");
        let policy = DbAccessPolicy { conn: &conn };
        let err = generate_register(&conn, &ws, &policy, &caller, "sec", "mat", 2026, 1)
            .unwrap_err();
        assert_eq!(err.code, "incomplete_teacher_profile");
        let details = err.details.expect("details");
        assert_eq!(details["staffId"], "admin");
    }

    #[test]
    fn header_counts_cover_the_full_roster_on_every_part() {
        let ws = temp_workspace("salamandra-docgen-counts");
        let conn = seed(&ws, 55);
        write_default_template(&ws, 50);

        let result = generate(&conn, &ws).expect("generate");
        assert_eq!(result.parts.len(), 2);
        // Both parts show the roster-wide headcounts, not their own slice.
        for part in &result.parts {
            let xml = sheet_xml(&std::fs::read(&part.file_path).expect("read artifact"));
            assert!(
                xml.contains(r#"<c r="A11"><v>55</v></c>"#),
                "part {} totalStudents: {}",
                part.part_number,
                xml
            );
            assert!(xml.contains(r#"<c r="C11"><v>28</v></c>"#));
            assert!(xml.contains(r#"<c r="E11"><v>27</v></c>"#));
        }
    }

    #[test]
    fn missing_template_is_a_configuration_error() {
        let ws = temp_workspace("salamandra-docgen-notemplate");
        let conn = seed(&ws, 5);
        let err = generate(&conn, &ws).unwrap_err();
        assert_eq!(err.code, "template_not_found");
    }

    #[test]
    fn surplus_rows_are_hidden_and_continuation_is_labelled() {
        let ws = temp_workspace("salamandra-docgen-render");
        let conn = seed(&ws, 3);
        write_default_template(&ws, 50);

        let section = reports::load_section(&conn, "sec").expect("section");
        let caller = resolve_caller(&conn, "prof").expect("caller");
        let teacher = load_teacher_header(&conn, &caller).expect("teacher");
        let roster = reports::roster_students(&conn, "sec", true).expect("roster");
        let mut template = templates::resolve_template(&conn, &ws, "sch", DOC_TYPE_CADERNETA, 3)
            .expect("resolve")
            .expect("some");
        template.mapping.continuation_cell = Some("F2".to_string());
        let counts = RosterCounts::of(&roster);

        let bytes = render_part(
            &conn, &template, &section, "Matematica", &teacher, None, &roster, &counts, "mat",
            2026, 1, 2, 3,
        )
        .expect("render");

        // Read the label and the row states out of the artifact itself.
        let xml = sheet_xml(&bytes);
        assert!(
            xml.contains(r#"<t xml:space="preserve">Parte 2 de 3</t>"#),
            "continuation label missing: {}",
            xml
        );
        // 3 students from row 15; rows 18..=64 are surplus and print hidden.
        assert!(xml.contains(r#"<row r="17">"#));
        assert!(xml.contains(r#"<row r="18" hidden="1">"#));
        assert!(xml.contains(r#"<row r="64" hidden="1">"#));
        assert!(!xml.contains(r#"<row r="65""#));
    }

    #[test]
    fn part_count_edges() {
        assert_eq!(part_count(0, 50), 1);
        assert_eq!(part_count(50, 50), 1);
        assert_eq!(part_count(51, 50), 2);
        assert_eq!(part_count(101, 50), 3);
        assert_eq!(part_count(150, 50), 3);
    }

    #[test]
    fn offload_cache_round_trip_and_expiry() {
        let mut cache = OffloadCache::new();
        let result = GenerationResult {
            doc_type: DOC_TYPE_CADERNETA.to_string(),
            section_id: "sec".to_string(),
            subject_id: "mat".to_string(),
            school_year: 2026,
            trimester: 1,
            template_version: "1".to_string(),
            parts: vec![],
        };
        let token = cache.put(result);
        assert!(cache.get(&token).is_some());
        assert!(cache.get("no-such-token").is_none());

        cache.expire(&token);
        assert!(cache.get(&token).is_none());
    }

    #[test]
    fn generation_is_deterministic_for_identical_inputs() {
        let ws = temp_workspace("salamandra-docgen-determinism");
        let conn = seed(&ws, 10);
        write_default_template(&ws, 50);

        let a = generate(&conn, &ws).expect("first");
        let b = generate(&conn, &ws).expect("second");
        assert_eq!(a.parts[0].sha256, b.parts[0].sha256);
    }
}
