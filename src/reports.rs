use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

use crate::authz::{AccessPolicy, Caller};
use crate::grading::{
    self, EngineError, ScoreSlots, Standing, StudentStatus, SummaryKey,
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionInfo {
    pub id: String,
    pub school_id: String,
    pub name: String,
    pub grade_label: String,
    pub room: Option<String>,
    pub shift: Option<String>,
    pub school_year: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterStudent {
    pub id: String,
    pub full_name: String,
    pub sex: String,
    pub roll_number: Option<i64>,
    pub status: StudentStatus,
}

pub fn load_section(conn: &Connection, section_id: &str) -> Result<SectionInfo, EngineError> {
    conn.query_row(
        "SELECT id, school_id, name, grade_label, room, shift, school_year
         FROM class_sections WHERE id = ?",
        [section_id],
        |r| {
            Ok(SectionInfo {
                id: r.get(0)?,
                school_id: r.get(1)?,
                name: r.get(2)?,
                grade_label: r.get(3)?,
                room: r.get(4)?,
                shift: r.get(5)?,
                school_year: r.get(6)?,
            })
        },
    )
    .optional()
    .map_err(EngineError::db)?
    .ok_or_else(|| EngineError::validation("not_found", "section not found"))
}

/// Section roster in registry order: roll number ascending with the
/// unnumbered at the end, then name. `active_only` is the document view;
/// reports list everyone enrolled.
pub fn roster_students(
    conn: &Connection,
    section_id: &str,
    active_only: bool,
) -> Result<Vec<RosterStudent>, EngineError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, full_name, sex, roll_number, status FROM students
             WHERE section_id = ? AND (?2 = 0 OR status = 'active')
             ORDER BY roll_number IS NULL, roll_number, full_name",
        )
        .map_err(EngineError::db)?;
    stmt.query_map((section_id, active_only as i64), |r| {
        let status: String = r.get(4)?;
        Ok((
            RosterStudent {
                id: r.get(0)?,
                full_name: r.get(1)?,
                sex: r.get(2)?,
                roll_number: r.get(3)?,
                status: StudentStatus::Active,
            },
            status,
        ))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(EngineError::db)?
    .into_iter()
    .map(|(mut s, status)| {
        s.status = StudentStatus::parse(&status)
            .ok_or_else(|| EngineError::validation("invalid_input", "unknown student status"))?;
        Ok(s)
    })
    .collect()
}

/// Subjects taught in a section, in the school's configured order.
pub fn section_subjects(
    conn: &Connection,
    section_id: &str,
) -> Result<Vec<(String, String)>, EngineError> {
    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT s.id, s.name, s.sort_order
             FROM teaching_assignments ta JOIN subjects s ON s.id = ta.subject_id
             WHERE ta.section_id = ?
             ORDER BY s.sort_order, s.name",
        )
        .map_err(EngineError::db)?;
    stmt.query_map([section_id], |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(EngineError::db)
}

fn require_view(
    policy: &dyn AccessPolicy,
    caller: &Caller,
    section_id: &str,
    subject_id: Option<&str>,
) -> Result<(), EngineError> {
    if policy.can_view(caller, section_id, subject_id, None)? {
        Ok(())
    } else {
        Err(EngineError::forbidden("not allowed to view this section"))
    }
}

// ---------------------------------------------------------------------------
// Subject register: one section, one subject, one trimester.

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRow {
    pub student_id: String,
    pub roll_number: Option<i64>,
    pub full_name: String,
    pub sex: String,
    pub status: StudentStatus,
    #[serde(flatten)]
    pub slots: ScoreSlots,
    pub macs: Option<f64>,
    pub mt: Option<i64>,
    pub com: Option<String>,
    pub year_average: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRegister {
    pub section: SectionInfo,
    pub subject_id: String,
    pub subject_name: String,
    pub school_year: i64,
    pub trimester: i64,
    pub rows: Vec<RegisterRow>,
}

pub fn subject_register(
    conn: &Connection,
    policy: &dyn AccessPolicy,
    caller: &Caller,
    section_id: &str,
    subject_id: &str,
    school_year: i64,
    trimester: i64,
) -> Result<SubjectRegister, EngineError> {
    require_view(policy, caller, section_id, Some(subject_id))?;
    let section = load_section(conn, section_id)?;
    let subject_name: String = conn
        .query_row("SELECT name FROM subjects WHERE id = ?", [subject_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(EngineError::db)?
        .ok_or_else(|| EngineError::validation("not_found", "subject not found"))?;

    let mut rows = Vec::new();
    for student in roster_students(conn, section_id, false)? {
        let key = SummaryKey {
            school_id: section.school_id.clone(),
            student_id: student.id.clone(),
            section_id: section_id.to_string(),
            subject_id: subject_id.to_string(),
            school_year,
            trimester,
        };
        let slots = grading::load_slots(conn, &key)?;
        let summary = grading::load_summary(conn, &key)?;
        let (macs, mt, com) = match summary {
            Some(s) => (s.macs, s.mt, s.com),
            None => {
                let v = grading::summarize(&slots);
                (v.macs, v.mt, v.com.map(|s| s.to_string()))
            }
        };
        let year_average = grading::year_discipline_average(
            conn,
            &section.school_id,
            &student.id,
            subject_id,
            school_year,
        )?;
        rows.push(RegisterRow {
            student_id: student.id,
            roll_number: student.roll_number,
            full_name: student.full_name,
            sex: student.sex,
            status: student.status,
            slots,
            macs,
            mt,
            com,
            year_average,
        });
    }

    Ok(SubjectRegister {
        section,
        subject_id: subject_id.to_string(),
        subject_name,
        school_year,
        trimester,
        rows,
    })
}

// ---------------------------------------------------------------------------
// Trimester roster: every subject of the section, side by side.

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterRow {
    pub student_id: String,
    pub roll_number: Option<i64>,
    pub full_name: String,
    pub sex: String,
    pub status: StudentStatus,
    /// One entry per roster subject, in roster subject order.
    pub marks: Vec<Option<i64>>,
    pub average: Option<f64>,
    pub standing: Standing,
    pub standing_label: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SexBreakdown {
    pub female: i64,
    pub male: i64,
    pub total: i64,
}

impl SexBreakdown {
    fn count(&mut self, sex: &str) {
        if sex.eq_ignore_ascii_case("f") {
            self.female += 1;
        } else {
            self.male += 1;
        }
        self.total += 1;
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectStats {
    pub subject_id: String,
    pub subject_name: String,
    pub evaluated: SexBreakdown,
    pub passed: SexBreakdown,
    pub pass_percent: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrimesterRoster {
    pub section: SectionInfo,
    pub school_year: i64,
    pub trimester: i64,
    pub subjects: Vec<SubjectRef>,
    pub rows: Vec<RosterRow>,
    pub enrolled: SexBreakdown,
    pub statistics: Vec<SubjectStats>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRef {
    pub id: String,
    pub name: String,
}

fn empty_breakdown() -> SexBreakdown {
    SexBreakdown {
        female: 0,
        male: 0,
        total: 0,
    }
}

pub fn trimester_roster(
    conn: &Connection,
    policy: &dyn AccessPolicy,
    caller: &Caller,
    section_id: &str,
    school_year: i64,
    trimester: i64,
) -> Result<TrimesterRoster, EngineError> {
    require_view(policy, caller, section_id, None)?;
    let section = load_section(conn, section_id)?;
    let subjects = section_subjects(conn, section_id)?;
    let roster = roster_students(conn, section_id, false)?;

    let mut enrolled = empty_breakdown();
    let mut stats: Vec<(SexBreakdown, SexBreakdown)> =
        subjects.iter().map(|_| (empty_breakdown(), empty_breakdown())).collect();

    let mut rows = Vec::new();
    for student in &roster {
        enrolled.count(&student.sex);
        let mut marks: Vec<Option<i64>> = Vec::with_capacity(subjects.len());
        for (idx, (subject_id, _)) in subjects.iter().enumerate() {
            let key = SummaryKey {
                school_id: section.school_id.clone(),
                student_id: student.id.clone(),
                section_id: section_id.to_string(),
                subject_id: subject_id.clone(),
                school_year,
                trimester,
            };
            let mt = grading::load_summary(conn, &key)?.and_then(|s| s.mt);
            if let Some(mt) = mt {
                stats[idx].0.count(&student.sex);
                if mt >= 10 {
                    stats[idx].1.count(&student.sex);
                }
            }
            marks.push(mt);
        }

        let average = grading::final_discipline_average(&marks);
        let as_averages: Vec<Option<f64>> = marks.iter().map(|mt| mt.map(|v| v as f64)).collect();
        let standing = grading::classify_standing(student.status, &as_averages);
        rows.push(RosterRow {
            student_id: student.id.clone(),
            roll_number: student.roll_number,
            full_name: student.full_name.clone(),
            sex: student.sex.clone(),
            status: student.status,
            marks,
            average,
            standing,
            standing_label: standing.label().to_string(),
        });
    }

    let statistics = subjects
        .iter()
        .zip(stats)
        .map(|((id, name), (evaluated, passed))| {
            let pass_percent = if evaluated.total > 0 {
                Some(grading::round_half_up_2dp(
                    100.0 * passed.total as f64 / evaluated.total as f64,
                ))
            } else {
                None
            };
            SubjectStats {
                subject_id: id.clone(),
                subject_name: name.clone(),
                evaluated,
                passed,
                pass_percent,
            }
        })
        .collect();

    Ok(TrimesterRoster {
        section,
        school_year,
        trimester,
        subjects: subjects
            .into_iter()
            .map(|(id, name)| SubjectRef { id, name })
            .collect(),
        rows,
        enrolled,
        statistics,
    })
}

// ---------------------------------------------------------------------------
// Student transcript: one student across the whole school year.

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptSubject {
    pub subject_id: String,
    pub subject_name: String,
    /// Trimesters 1..=3, in order; `None` where no summary exists yet.
    pub trimester_marks: Vec<Option<i64>>,
    pub trimester_classifications: Vec<Option<String>>,
    pub year_average: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentTranscript {
    pub student_id: String,
    pub full_name: String,
    pub sex: String,
    pub status: StudentStatus,
    pub roll_number: Option<i64>,
    pub section: SectionInfo,
    pub school_year: i64,
    pub subjects: Vec<TranscriptSubject>,
    pub global_average: Option<f64>,
    pub standing: Standing,
    pub standing_label: String,
}

pub fn student_transcript(
    conn: &Connection,
    policy: &dyn AccessPolicy,
    caller: &Caller,
    student_id: &str,
    school_year: i64,
) -> Result<StudentTranscript, EngineError> {
    let row: Option<(String, String, String, Option<i64>, Option<String>)> = conn
        .query_row(
            "SELECT full_name, sex, status, roll_number, section_id
             FROM students WHERE id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()
        .map_err(EngineError::db)?;
    let Some((full_name, sex, status_text, roll_number, section_id)) = row else {
        return Err(EngineError::validation("not_found", "student not found"));
    };
    let Some(section_id) = section_id else {
        return Err(EngineError::validation("not_found", "student has no section"));
    };
    if !policy.can_view(caller, &section_id, None, Some(student_id))? {
        return Err(EngineError::forbidden("not allowed to view this student"));
    }
    let status = StudentStatus::parse(&status_text)
        .ok_or_else(|| EngineError::validation("invalid_input", "unknown student status"))?;

    let section = load_section(conn, &section_id)?;
    let mut subjects = Vec::new();
    let mut year_averages = Vec::new();
    for (subject_id, subject_name) in section_subjects(conn, &section_id)? {
        let mut trimester_marks = Vec::with_capacity(3);
        let mut trimester_classifications = Vec::with_capacity(3);
        for trimester in 1..=3 {
            let key = SummaryKey {
                school_id: section.school_id.clone(),
                student_id: student_id.to_string(),
                section_id: section_id.clone(),
                subject_id: subject_id.clone(),
                school_year,
                trimester,
            };
            let summary = grading::load_summary(conn, &key)?;
            trimester_marks.push(summary.as_ref().and_then(|s| s.mt));
            trimester_classifications.push(summary.and_then(|s| s.com));
        }
        let year_average = grading::final_discipline_average(&trimester_marks);
        year_averages.push(year_average);
        subjects.push(TranscriptSubject {
            subject_id,
            subject_name,
            trimester_marks,
            trimester_classifications,
            year_average,
        });
    }

    let global_average = {
        let present: Vec<f64> = year_averages.iter().flatten().copied().collect();
        if present.is_empty() {
            None
        } else {
            Some(grading::round_half_up_2dp(
                present.iter().sum::<f64>() / present.len() as f64,
            ))
        }
    };
    let standing = grading::classify_standing(status, &year_averages);

    Ok(StudentTranscript {
        student_id: student_id.to_string(),
        full_name,
        sex,
        status,
        roll_number,
        section,
        school_year,
        subjects,
        global_average,
        standing,
        standing_label: standing.label().to_string(),
    })
}

// ---------------------------------------------------------------------------
// Pass/fail roster: year-end standing for a whole section.

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassFailRow {
    pub student_id: String,
    pub roll_number: Option<i64>,
    pub full_name: String,
    pub sex: String,
    pub global_average: Option<f64>,
    pub standing: Standing,
    pub standing_label: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassFailRoster {
    pub section: SectionInfo,
    pub school_year: i64,
    pub rows: Vec<PassFailRow>,
    pub approved: SexBreakdown,
    pub failed: SexBreakdown,
    pub pending: SexBreakdown,
    pub other: SexBreakdown,
}

pub fn pass_fail_roster(
    conn: &Connection,
    policy: &dyn AccessPolicy,
    caller: &Caller,
    section_id: &str,
    school_year: i64,
) -> Result<PassFailRoster, EngineError> {
    require_view(policy, caller, section_id, None)?;
    let section = load_section(conn, section_id)?;
    let subjects = section_subjects(conn, section_id)?;

    let mut approved = empty_breakdown();
    let mut failed = empty_breakdown();
    let mut pending = empty_breakdown();
    let mut other = empty_breakdown();

    let mut rows = Vec::new();
    for student in roster_students(conn, section_id, false)? {
        let mut year_averages = Vec::with_capacity(subjects.len());
        for (subject_id, _) in &subjects {
            year_averages.push(grading::year_discipline_average(
                conn,
                &section.school_id,
                &student.id,
                subject_id,
                school_year,
            )?);
        }
        let global_average = {
            let present: Vec<f64> = year_averages.iter().flatten().copied().collect();
            if present.is_empty() {
                None
            } else {
                Some(grading::round_half_up_2dp(
                    present.iter().sum::<f64>() / present.len() as f64,
                ))
            }
        };
        let standing = grading::classify_standing(student.status, &year_averages);
        match standing {
            Standing::Approved => approved.count(&student.sex),
            Standing::Failed => failed.count(&student.sex),
            Standing::Pending => pending.count(&student.sex),
            _ => other.count(&student.sex),
        }
        rows.push(PassFailRow {
            student_id: student.id,
            roll_number: student.roll_number,
            full_name: student.full_name,
            sex: student.sex,
            global_average,
            standing,
            standing_label: standing.label().to_string(),
        });
    }

    Ok(PassFailRoster {
        section,
        school_year,
        rows,
        approved,
        failed,
        pending,
        other,
    })
}
