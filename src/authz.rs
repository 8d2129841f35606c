use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

use crate::grading::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SchoolAdmin,
    Dap,
    Clerk,
    Teacher,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "school_admin" => Some(Role::SchoolAdmin),
            "dap" => Some(Role::Dap),
            "clerk" => Some(Role::Clerk),
            "teacher" => Some(Role::Teacher),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::SchoolAdmin => "school_admin",
            Role::Dap => "dap",
            Role::Clerk => "clerk",
            Role::Teacher => "teacher",
        }
    }

    /// Administrative roles see every report in their school.
    pub fn is_report_admin(self) -> bool {
        matches!(self, Role::SchoolAdmin | Role::Dap | Role::Clerk)
    }
}

#[derive(Debug, Clone)]
pub struct Caller {
    pub staff_id: String,
    pub school_id: String,
    pub role: Role,
}

/// Resolve the caller from the staff table; role comes from the row,
/// never from the wire.
pub fn resolve_caller(conn: &Connection, staff_id: &str) -> Result<Caller, EngineError> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT school_id, role FROM staff WHERE id = ?",
            [staff_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(EngineError::db)?;
    let Some((school_id, role_text)) = row else {
        return Err(EngineError::forbidden("unknown caller"));
    };
    let Some(role) = Role::parse(&role_text) else {
        return Err(EngineError::forbidden("caller role not recognised"));
    };
    Ok(Caller {
        staff_id: staff_id.to_string(),
        school_id,
        role,
    })
}

/// The one visibility decision point. The reporting and document code only
/// enforces the boolean; no role logic lives outside this trait.
pub trait AccessPolicy {
    fn can_view(
        &self,
        caller: &Caller,
        section_id: &str,
        subject_id: Option<&str>,
        student_id: Option<&str>,
    ) -> Result<bool, EngineError>;
}

pub struct DbAccessPolicy<'a> {
    pub conn: &'a Connection,
}

impl<'a> DbAccessPolicy<'a> {
    fn section_school_and_grade(
        &self,
        section_id: &str,
    ) -> Result<Option<(String, String)>, EngineError> {
        self.conn
            .query_row(
                "SELECT school_id, grade_label FROM class_sections WHERE id = ?",
                [section_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(EngineError::db)
    }

    fn is_homeroom_teacher(&self, staff_id: &str, section_id: &str) -> Result<bool, EngineError> {
        let n: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM homeroom_assignments WHERE section_id = ? AND staff_id = ?",
                (section_id, staff_id),
                |r| r.get(0),
            )
            .map_err(EngineError::db)?;
        Ok(n > 0)
    }

    fn is_grade_coordinator(
        &self,
        staff_id: &str,
        school_id: &str,
        grade_label: &str,
    ) -> Result<bool, EngineError> {
        let n: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM grade_coordinators
                 WHERE school_id = ? AND grade_label = ? AND staff_id = ?",
                (school_id, grade_label, staff_id),
                |r| r.get(0),
            )
            .map_err(EngineError::db)?;
        Ok(n > 0)
    }

    fn has_teaching_assignment(
        &self,
        staff_id: &str,
        section_id: &str,
        subject_id: &str,
    ) -> Result<bool, EngineError> {
        let n: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM teaching_assignments
                 WHERE staff_id = ? AND section_id = ? AND subject_id = ?",
                (staff_id, section_id, subject_id),
                |r| r.get(0),
            )
            .map_err(EngineError::db)?;
        Ok(n > 0)
    }
}

impl<'a> AccessPolicy for DbAccessPolicy<'a> {
    fn can_view(
        &self,
        caller: &Caller,
        section_id: &str,
        subject_id: Option<&str>,
        _student_id: Option<&str>,
    ) -> Result<bool, EngineError> {
        let Some((school_id, grade_label)) = self.section_school_and_grade(section_id)? else {
            return Ok(false);
        };
        if school_id != caller.school_id {
            return Ok(false);
        }
        if caller.role.is_report_admin() {
            return Ok(true);
        }
        if caller.role != Role::Teacher {
            return Ok(false);
        }
        if self.is_homeroom_teacher(&caller.staff_id, section_id)? {
            return Ok(true);
        }
        if self.is_grade_coordinator(&caller.staff_id, &school_id, &grade_label)? {
            return Ok(true);
        }
        if let Some(subject_id) = subject_id {
            return self.has_teaching_assignment(&caller.staff_id, section_id, subject_id);
        }
        Ok(false)
    }
}

/// Score-entry rights: report admins, or the assigned subject teacher.
pub fn can_edit_scores(
    conn: &Connection,
    caller: &Caller,
    section_id: &str,
    subject_id: &str,
) -> Result<bool, EngineError> {
    if caller.role.is_report_admin() {
        return Ok(true);
    }
    if caller.role != Role::Teacher {
        return Ok(false);
    }
    DbAccessPolicy { conn }.has_teaching_assignment(&caller.staff_id, section_id, subject_id)
}

/// Score writes are limited to the school's current period.
pub fn enforce_current_period(
    conn: &Connection,
    school_id: &str,
    school_year: i64,
    trimester: i64,
) -> Result<(), EngineError> {
    let period: Option<(Option<i64>, Option<i64>)> = conn
        .query_row(
            "SELECT current_school_year, current_trimester FROM schools WHERE id = ?",
            [school_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(EngineError::db)?;
    let Some((Some(current_year), Some(current_trimester))) = period else {
        return Err(EngineError::forbidden("school period not configured"));
    };
    if school_year != current_year || trimester != current_trimester {
        return Err(EngineError::forbidden("period not editable"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::path::PathBuf;
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

    struct Fixture {
        conn: Connection,
        section_id: String,
        subject_id: String,
        other_subject_id: String,
    }

    fn seed() -> Fixture {
        let ws = temp_workspace("salamandra-authz");
        let conn = db::open_db(&ws).expect("open db");
        conn.execute(
            "INSERT INTO schools(id, name, current_school_year, current_trimester)
             VALUES('sch', 'Escola Teste', 2026, 1)",
            [],
        )
        .expect("school");
        conn.execute(
            "INSERT INTO class_sections(id, school_id, name, grade_label, school_year)
             VALUES('sec', 'sch', 'A', '10a', 2026)",
            [],
        )
        .expect("section");
        conn.execute(
            "INSERT INTO subjects(id, school_id, name, sort_order) VALUES('mat', 'sch', 'Matematica', 1)",
            [],
        )
        .expect("subject");
        conn.execute(
            "INSERT INTO subjects(id, school_id, name, sort_order) VALUES('fis', 'sch', 'Fisica', 2)",
            [],
        )
        .expect("subject");
        for (id, role) in [
            ("admin", "school_admin"),
            ("dap", "dap"),
            ("clerk", "clerk"),
            ("prof", "teacher"),
            ("dt", "teacher"),
            ("coord", "teacher"),
            ("outsider", "teacher"),
        ] {
            conn.execute(
                "INSERT INTO staff(id, school_id, full_name, role) VALUES(?, 'sch', ?, ?)",
                (id, format!("Staff {}", id), role),
            )
            .expect("staff");
        }
        conn.execute(
            "INSERT INTO teaching_assignments(school_id, staff_id, section_id, subject_id)
             VALUES('sch', 'prof', 'sec', 'mat')",
            [],
        )
        .expect("assignment");
        conn.execute(
            "INSERT INTO homeroom_assignments(section_id, school_id, staff_id)
             VALUES('sec', 'sch', 'dt')",
            [],
        )
        .expect("homeroom");
        conn.execute(
            "INSERT INTO grade_coordinators(school_id, grade_label, staff_id)
             VALUES('sch', '10a', 'coord')",
            [],
        )
        .expect("coordinator");
        Fixture {
            conn,
            section_id: "sec".to_string(),
            subject_id: "mat".to_string(),
            other_subject_id: "fis".to_string(),
        }
    }

    #[test]
    fn visibility_fixture_table() {
        let fx = seed();
        let policy = DbAccessPolicy { conn: &fx.conn };

        // (staff, subject scope, expected decision)
        let cases: Vec<(&str, Option<&str>, bool)> = vec![
            ("admin", Some(fx.subject_id.as_str()), true),
            ("admin", None, true),
            ("dap", Some(fx.subject_id.as_str()), true),
            ("clerk", None, true),
            ("dt", None, true),
            ("dt", Some(fx.other_subject_id.as_str()), true),
            ("coord", None, true),
            ("prof", Some(fx.subject_id.as_str()), true),
            ("prof", Some(fx.other_subject_id.as_str()), false),
            ("prof", None, false),
            ("outsider", Some(fx.subject_id.as_str()), false),
            ("outsider", None, false),
        ];
        for (staff, subject, expected) in cases {
            let caller = resolve_caller(&fx.conn, staff).expect("caller");
            let got = policy
                .can_view(&caller, &fx.section_id, subject, None)
                .expect("decision");
            assert_eq!(got, expected, "staff={} subject={:?}", staff, subject);
        }
    }

    #[test]
    fn score_edit_rights() {
        let fx = seed();
        let admin = resolve_caller(&fx.conn, "admin").expect("caller");
        let prof = resolve_caller(&fx.conn, "prof").expect("caller");
        let outsider = resolve_caller(&fx.conn, "outsider").expect("caller");

        assert!(can_edit_scores(&fx.conn, &admin, &fx.section_id, &fx.subject_id).expect("admin"));
        assert!(can_edit_scores(&fx.conn, &prof, &fx.section_id, &fx.subject_id).expect("prof"));
        assert!(
            !can_edit_scores(&fx.conn, &prof, &fx.section_id, &fx.other_subject_id)
                .expect("prof other")
        );
        assert!(
            !can_edit_scores(&fx.conn, &outsider, &fx.section_id, &fx.subject_id)
                .expect("outsider")
        );
    }

    #[test]
    fn period_gate() {
        let fx = seed();
        assert!(enforce_current_period(&fx.conn, "sch", 2026, 1).is_ok());
        let err = enforce_current_period(&fx.conn, "sch", 2026, 2).unwrap_err();
        assert_eq!(err.code, "forbidden");
        let err = enforce_current_period(&fx.conn, "sch", 2025, 1).unwrap_err();
        assert_eq!(err.code, "forbidden");
    }

    #[test]
    fn unknown_caller_is_rejected() {
        let fx = seed();
        assert!(resolve_caller(&fx.conn, "ghost").is_err());
    }
}
