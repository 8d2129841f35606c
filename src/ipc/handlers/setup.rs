use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::authz::Role;
use crate::grading::{EngineError, StudentStatus};
use crate::ipc::error::{fail, ok};
use crate::ipc::helpers::{
    admin_caller, caller, db_ref, i64_param, opt_i64_param, opt_str_param, str_param,
};
use crate::ipc::types::{AppState, Request};

fn new_id(params: &Value) -> String {
    opt_str_param(params, "id").unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn schools_create(state: &AppState, params: &Value) -> Result<Value, EngineError> {
    let conn = db_ref(state)?;
    let id = new_id(params);
    let name = str_param(params, "name")?;
    conn.execute(
        "INSERT INTO schools(id, name, current_school_year, current_trimester)
         VALUES(?, ?, ?, ?)",
        (
            &id,
            &name,
            opt_i64_param(params, "currentSchoolYear"),
            opt_i64_param(params, "currentTrimester"),
        ),
    )
    .map_err(EngineError::db)?;
    Ok(json!({ "schoolId": id }))
}

fn schools_set_period(state: &AppState, params: &Value) -> Result<Value, EngineError> {
    let conn = db_ref(state)?;
    let caller = admin_caller(conn, params)?;
    let school_id = str_param(params, "schoolId")?;
    if caller.school_id != school_id {
        return Err(EngineError::forbidden("wrong school"));
    }
    let school_year = i64_param(params, "schoolYear")?;
    let trimester = i64_param(params, "trimester")?;
    if !(1..=3).contains(&trimester) {
        return Err(EngineError::validation("invalid_input", "trimester must be 1..3"));
    }
    let n = conn
        .execute(
            "UPDATE schools SET current_school_year = ?, current_trimester = ? WHERE id = ?",
            (school_year, trimester, &school_id),
        )
        .map_err(EngineError::db)?;
    if n == 0 {
        return Err(EngineError::validation("not_found", "school not found"));
    }
    Ok(json!({ "schoolId": school_id, "schoolYear": school_year, "trimester": trimester }))
}

fn sections_create(state: &AppState, params: &Value) -> Result<Value, EngineError> {
    let conn = db_ref(state)?;
    let caller = admin_caller(conn, params)?;
    let school_id = str_param(params, "schoolId")?;
    if caller.school_id != school_id {
        return Err(EngineError::forbidden("wrong school"));
    }
    let id = new_id(params);
    conn.execute(
        "INSERT INTO class_sections(id, school_id, name, grade_label, room, shift, school_year)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &school_id,
            str_param(params, "name")?,
            str_param(params, "gradeLabel")?,
            opt_str_param(params, "room"),
            opt_str_param(params, "shift"),
            i64_param(params, "schoolYear")?,
        ),
    )
    .map_err(EngineError::db)?;
    Ok(json!({ "sectionId": id }))
}

fn subjects_create(state: &AppState, params: &Value) -> Result<Value, EngineError> {
    let conn = db_ref(state)?;
    let caller = admin_caller(conn, params)?;
    let school_id = str_param(params, "schoolId")?;
    if caller.school_id != school_id {
        return Err(EngineError::forbidden("wrong school"));
    }
    let id = new_id(params);
    conn.execute(
        "INSERT INTO subjects(id, school_id, name, sort_order) VALUES(?, ?, ?, ?)",
        (
            &id,
            &school_id,
            str_param(params, "name")?,
            opt_i64_param(params, "sortOrder").unwrap_or(0),
        ),
    )
    .map_err(EngineError::db)?;
    Ok(json!({ "subjectId": id }))
}

fn students_create(state: &AppState, params: &Value) -> Result<Value, EngineError> {
    let conn = db_ref(state)?;
    let caller = admin_caller(conn, params)?;
    let school_id = str_param(params, "schoolId")?;
    if caller.school_id != school_id {
        return Err(EngineError::forbidden("wrong school"));
    }
    let sex = str_param(params, "sex")?;
    if !matches!(sex.as_str(), "F" | "M" | "f" | "m") {
        return Err(EngineError::validation("invalid_input", "sex must be F or M"));
    }
    let id = new_id(params);
    conn.execute(
        "INSERT INTO students(id, school_id, section_id, full_name, sex, roll_number, status)
         VALUES(?, ?, ?, ?, ?, ?, 'active')",
        (
            &id,
            &school_id,
            opt_str_param(params, "sectionId"),
            str_param(params, "fullName")?,
            sex.to_uppercase(),
            opt_i64_param(params, "rollNumber"),
        ),
    )
    .map_err(EngineError::db)?;
    Ok(json!({ "studentId": id }))
}

fn students_set_status(state: &AppState, params: &Value) -> Result<Value, EngineError> {
    let conn = db_ref(state)?;
    let _caller = admin_caller(conn, params)?;
    let student_id = str_param(params, "studentId")?;
    let status_text = str_param(params, "status")?;
    let Some(status) = StudentStatus::parse(&status_text) else {
        return Err(EngineError::validation("invalid_input", "unknown status"));
    };
    let n = conn
        .execute(
            "UPDATE students SET status = ? WHERE id = ?",
            (status.as_str(), &student_id),
        )
        .map_err(EngineError::db)?;
    if n == 0 {
        return Err(EngineError::validation("not_found", "student not found"));
    }
    Ok(json!({ "studentId": student_id, "status": status }))
}

fn staff_create(state: &AppState, params: &Value) -> Result<Value, EngineError> {
    let conn = db_ref(state)?;
    let school_id = str_param(params, "schoolId")?;
    let role_text = str_param(params, "role")?;
    let Some(role) = Role::parse(&role_text) else {
        return Err(EngineError::validation("invalid_input", "unknown role"));
    };

    // Bootstrap: the first staff member of a school needs no caller.
    let existing: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM staff WHERE school_id = ?",
            [&school_id],
            |r| r.get(0),
        )
        .map_err(EngineError::db)?;
    if existing > 0 {
        let caller = admin_caller(conn, params)?;
        if caller.school_id != school_id {
            return Err(EngineError::forbidden("wrong school"));
        }
    }

    let id = new_id(params);
    conn.execute(
        "INSERT INTO staff(id, school_id, full_name, role) VALUES(?, ?, ?, ?)",
        (&id, &school_id, str_param(params, "fullName")?, role.as_str()),
    )
    .map_err(EngineError::db)?;
    Ok(json!({ "staffId": id }))
}

fn staff_assign_teaching(state: &AppState, params: &Value) -> Result<Value, EngineError> {
    let conn = db_ref(state)?;
    let caller = admin_caller(conn, params)?;
    let school_id = str_param(params, "schoolId")?;
    if caller.school_id != school_id {
        return Err(EngineError::forbidden("wrong school"));
    }
    conn.execute(
        "INSERT OR IGNORE INTO teaching_assignments(school_id, staff_id, section_id, subject_id)
         VALUES(?, ?, ?, ?)",
        (
            &school_id,
            str_param(params, "staffId")?,
            str_param(params, "sectionId")?,
            str_param(params, "subjectId")?,
        ),
    )
    .map_err(EngineError::db)?;
    Ok(json!({ "assigned": true }))
}

fn staff_set_homeroom(state: &AppState, params: &Value) -> Result<Value, EngineError> {
    let conn = db_ref(state)?;
    let caller = admin_caller(conn, params)?;
    let school_id = str_param(params, "schoolId")?;
    if caller.school_id != school_id {
        return Err(EngineError::forbidden("wrong school"));
    }
    conn.execute(
        "INSERT INTO homeroom_assignments(section_id, school_id, staff_id)
         VALUES(?, ?, ?)
         ON CONFLICT(section_id) DO UPDATE SET staff_id = excluded.staff_id",
        (
            str_param(params, "sectionId")?,
            &school_id,
            str_param(params, "staffId")?,
        ),
    )
    .map_err(EngineError::db)?;
    Ok(json!({ "assigned": true }))
}

fn staff_set_coordinator(state: &AppState, params: &Value) -> Result<Value, EngineError> {
    let conn = db_ref(state)?;
    let caller = admin_caller(conn, params)?;
    let school_id = str_param(params, "schoolId")?;
    if caller.school_id != school_id {
        return Err(EngineError::forbidden("wrong school"));
    }
    conn.execute(
        "INSERT INTO grade_coordinators(school_id, grade_label, staff_id)
         VALUES(?, ?, ?)
         ON CONFLICT(school_id, grade_label) DO UPDATE SET staff_id = excluded.staff_id",
        (
            &school_id,
            str_param(params, "gradeLabel")?,
            str_param(params, "staffId")?,
        ),
    )
    .map_err(EngineError::db)?;
    Ok(json!({ "assigned": true }))
}

fn profiles_upsert(state: &AppState, params: &Value) -> Result<Value, EngineError> {
    let conn = db_ref(state)?;
    let caller = caller(conn, params)?;
    let staff_id = str_param(params, "staffId")?;
    if caller.staff_id != staff_id && !caller.role.is_report_admin() {
        return Err(EngineError::forbidden("can only edit your own profile"));
    }
    conn.execute(
        "INSERT INTO teacher_profiles(staff_id, academic_level, training_area, contact, updated_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(staff_id) DO UPDATE SET
           academic_level = excluded.academic_level,
           training_area = excluded.training_area,
           contact = excluded.contact,
           updated_at = excluded.updated_at",
        (
            &staff_id,
            opt_str_param(params, "academicLevel").unwrap_or_default(),
            opt_str_param(params, "trainingArea").unwrap_or_default(),
            opt_str_param(params, "contact").unwrap_or_default(),
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(EngineError::db)?;
    Ok(json!({ "staffId": staff_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run = |f: fn(&AppState, &Value) -> Result<Value, EngineError>| {
        Some(match f(state, &req.params) {
            Ok(v) => ok(&req.id, v),
            Err(e) => fail(&req.id, e),
        })
    };
    match req.method.as_str() {
        "schools.create" => run(schools_create),
        "schools.setPeriod" => run(schools_set_period),
        "sections.create" => run(sections_create),
        "subjects.create" => run(subjects_create),
        "students.create" => run(students_create),
        "students.setStatus" => run(students_set_status),
        "staff.create" => run(staff_create),
        "staff.assignTeaching" => run(staff_assign_teaching),
        "staff.setHomeroom" => run(staff_set_homeroom),
        "staff.setCoordinator" => run(staff_set_coordinator),
        "profiles.upsert" => run(profiles_upsert),
        _ => None,
    }
}
