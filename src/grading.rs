use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The five assessment kinds a trimester carries. ACS1..ACS3 are the
/// continuous-assessment slots, MAP the practical assessment, ACP the
/// partial-cumulative assessment.
pub const SCORE_KINDS: [&str; 5] = ["ACS1", "ACS2", "ACS3", "MAP", "ACP"];

pub const SCORE_MIN: f64 = 0.0;
pub const SCORE_MAX: f64 = 20.0;

// Approval thresholds (Mozambican secondary grading rules).
pub const APPROVAL_GLOBAL_MEAN_MIN: f64 = 9.5;
pub const APPROVAL_SUBJECT_FLOOR: f64 = 8.0;
pub const APPROVAL_NEAR_FAIL_LIMIT: f64 = 9.5;
pub const APPROVAL_MAX_NEAR_FAILS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Authorization,
    Configuration,
    Conflict,
    Internal,
}

/// Structured engine failure carried verbatim to the IPC layer.
/// `category` tells the caller whether to fix input, request access,
/// fix configuration, or retry.
#[derive(Debug, Clone, Serialize)]
pub struct EngineError {
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl EngineError {
    pub fn new(category: ErrorCategory, code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            category,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn validation(code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, code, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Authorization, "forbidden", message)
    }

    pub fn configuration(code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Configuration, code, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Conflict, "conflict_retry", message)
    }

    pub fn internal(code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, code, message)
    }

    pub fn io(e: std::io::Error) -> Self {
        Self::internal("io_failed", e.to_string())
    }

    pub fn db(e: rusqlite::Error) -> Self {
        if is_busy(&e) {
            return Self::conflict("concurrent write on the same key; retry");
        }
        Self::new(ErrorCategory::Internal, "db_query_failed", e.to_string())
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::DatabaseBusy
                || err.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

/// Half-up rounding to two decimals, as the registry forms expect.
pub fn round_half_up_2dp(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

/// Half-up rounding to the nearest integer; trimester means are whole marks.
pub fn round_half_up_int(x: f64) -> i64 {
    (x + 0.5).floor() as i64
}

/// Classification label for an integer trimester mean.
/// Integer boundaries; `None` outside [0, 20].
pub fn com_label(mt: i64) -> Option<&'static str> {
    if !(0..=20).contains(&mt) {
        return None;
    }
    Some(match mt {
        0..=9 => "NS",
        10..=13 => "S",
        14..=16 => "B",
        17..=18 => "MB",
        _ => "E",
    })
}

/// Raw per-kind values for one (student, subject, trimester) key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreSlots {
    pub acs1: Option<f64>,
    pub acs2: Option<f64>,
    pub acs3: Option<f64>,
    pub map: Option<f64>,
    pub acp: Option<f64>,
}

impl ScoreSlots {
    pub fn set(&mut self, kind: &str, value: Option<f64>) {
        match kind {
            "ACS1" => self.acs1 = value,
            "ACS2" => self.acs2 = value,
            "ACS3" => self.acs3 = value,
            "MAP" => self.map = value,
            "ACP" => self.acp = value,
            _ => {}
        }
    }

    pub fn get(&self, kind: &str) -> Option<f64> {
        match kind {
            "ACS1" => self.acs1,
            "ACS2" => self.acs2,
            "ACS3" => self.acs3,
            "MAP" => self.map,
            "ACP" => self.acp,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryValues {
    pub macs: Option<f64>,
    pub mt: Option<i64>,
    pub com: Option<&'static str>,
}

/// Pure trimester aggregation: MACS over the continuous-style slots
/// (practical included), MT = round((2*MACS + ACP) / 3), COM from MT.
pub fn summarize(slots: &ScoreSlots) -> SummaryValues {
    let continuous = [slots.acs1, slots.acs2, slots.acs3, slots.map];
    let present: Vec<f64> = continuous.iter().flatten().copied().collect();

    let macs = if present.is_empty() {
        None
    } else {
        Some(round_half_up_2dp(
            present.iter().sum::<f64>() / present.len() as f64,
        ))
    };

    let mt = match (macs, slots.acp) {
        (Some(m), Some(acp)) => Some(round_half_up_int((2.0 * m + acp) / 3.0)),
        _ => None,
    };

    let com = mt.and_then(com_label);

    SummaryValues { macs, mt, com }
}

/// Final discipline average: mean of the trimester means that exist.
pub fn final_discipline_average(mts: &[Option<i64>]) -> Option<f64> {
    let present: Vec<i64> = mts.iter().flatten().copied().collect();
    if present.is_empty() {
        return None;
    }
    Some(round_half_up_2dp(
        present.iter().sum::<i64>() as f64 / present.len() as f64,
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Standing {
    Approved,
    Pending,
    Failed,
    Transferred,
    Inactive,
}

impl Standing {
    /// Label used on printed documents.
    pub fn label(self) -> &'static str {
        match self {
            Standing::Approved => "Aprovado",
            Standing::Pending => "Pendente",
            Standing::Failed => "Reprovado",
            Standing::Transferred => "Transferido",
            Standing::Inactive => "Inactivo",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StudentStatus {
    Active,
    Transferred,
    Withdrawn,
    Inactive,
}

impl StudentStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(StudentStatus::Active),
            "transferred" => Some(StudentStatus::Transferred),
            "withdrawn" => Some(StudentStatus::Withdrawn),
            "inactive" => Some(StudentStatus::Inactive),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StudentStatus::Active => "active",
            StudentStatus::Transferred => "transferred",
            StudentStatus::Withdrawn => "withdrawn",
            StudentStatus::Inactive => "inactive",
        }
    }
}

/// Final-standing classification over per-discipline averages.
///
/// Three independent failure nets: the global mean, an absolute
/// per-discipline floor, and a bounded count of near-failing disciplines.
pub fn classify_standing(status: StudentStatus, averages: &[Option<f64>]) -> Standing {
    match status {
        StudentStatus::Transferred => return Standing::Transferred,
        StudentStatus::Active => {}
        _ => return Standing::Inactive,
    }

    if averages.is_empty() || averages.iter().any(|a| a.is_none()) {
        return Standing::Pending;
    }
    let values: Vec<f64> = averages.iter().flatten().copied().collect();

    let global_mean = values.iter().sum::<f64>() / values.len() as f64;
    if global_mean < APPROVAL_GLOBAL_MEAN_MIN {
        return Standing::Failed;
    }

    let mut near_fails = 0usize;
    for v in &values {
        if *v < APPROVAL_SUBJECT_FLOOR {
            return Standing::Failed;
        }
        if *v < APPROVAL_NEAR_FAIL_LIMIT {
            near_fails += 1;
        }
    }
    if near_fails > APPROVAL_MAX_NEAR_FAILS {
        return Standing::Failed;
    }

    Standing::Approved
}

/// Natural key of one trimester aggregation.
#[derive(Debug, Clone)]
pub struct SummaryKey {
    pub school_id: String,
    pub student_id: String,
    pub section_id: String,
    pub subject_id: String,
    pub school_year: i64,
    pub trimester: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrimesterSummary {
    pub student_id: String,
    pub subject_id: String,
    pub school_year: i64,
    pub trimester: i64,
    pub macs: Option<f64>,
    pub mt: Option<i64>,
    pub com: Option<String>,
}

/// Load the raw slots for one aggregation key.
pub fn load_slots(conn: &Connection, key: &SummaryKey) -> Result<ScoreSlots, EngineError> {
    let mut stmt = conn
        .prepare(
            "SELECT kind, value FROM scores
             WHERE school_id = ? AND student_id = ? AND section_id = ?
               AND subject_id = ? AND school_year = ? AND trimester = ?",
        )
        .map_err(EngineError::db)?;
    let rows = stmt
        .query_map(
            (
                &key.school_id,
                &key.student_id,
                &key.section_id,
                &key.subject_id,
                key.school_year,
                key.trimester,
            ),
            |r| {
                let kind: String = r.get(0)?;
                let value: Option<f64> = r.get(1)?;
                Ok((kind, value))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(EngineError::db)?;

    let mut slots = ScoreSlots::default();
    for (kind, value) in rows {
        slots.set(&kind, value);
    }
    Ok(slots)
}

/// Full recompute of the one summary row for `key` from its current scores.
/// Always recalculates from all matching scores (at most five); idempotent.
pub fn recompute_summary(
    conn: &Connection,
    key: &SummaryKey,
) -> Result<TrimesterSummary, EngineError> {
    let slots = load_slots(conn, key)?;
    let values = summarize(&slots);

    let summary_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO trimester_summaries(
             id, school_id, student_id, subject_id, section_id,
             school_year, trimester, macs, mt, com, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(school_id, student_id, subject_id, school_year, trimester)
         DO UPDATE SET
           section_id = excluded.section_id,
           macs = excluded.macs,
           mt = excluded.mt,
           com = excluded.com,
           updated_at = excluded.updated_at",
        (
            &summary_id,
            &key.school_id,
            &key.student_id,
            &key.subject_id,
            &key.section_id,
            key.school_year,
            key.trimester,
            values.macs,
            values.mt,
            values.com,
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(EngineError::db)?;

    Ok(TrimesterSummary {
        student_id: key.student_id.clone(),
        subject_id: key.subject_id.clone(),
        school_year: key.school_year,
        trimester: key.trimester,
        macs: values.macs,
        mt: values.mt,
        com: values.com.map(|s| s.to_string()),
    })
}

/// Year MFD for a student/subject from the persisted summaries.
pub fn year_discipline_average(
    conn: &Connection,
    school_id: &str,
    student_id: &str,
    subject_id: &str,
    school_year: i64,
) -> Result<Option<f64>, EngineError> {
    let mut stmt = conn
        .prepare(
            "SELECT mt FROM trimester_summaries
             WHERE school_id = ? AND student_id = ? AND subject_id = ? AND school_year = ?",
        )
        .map_err(EngineError::db)?;
    let mts = stmt
        .query_map((school_id, student_id, subject_id, school_year), |r| {
            r.get::<_, Option<i64>>(0)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(EngineError::db)?;

    let present: Vec<Option<i64>> = mts.into_iter().filter(|mt| mt.is_some()).collect();
    Ok(final_discipline_average(&present))
}

/// Fetch one summary row, if present.
pub fn load_summary(
    conn: &Connection,
    key: &SummaryKey,
) -> Result<Option<TrimesterSummary>, EngineError> {
    conn.query_row(
        "SELECT macs, mt, com FROM trimester_summaries
         WHERE school_id = ? AND student_id = ? AND subject_id = ?
           AND school_year = ? AND trimester = ?",
        (
            &key.school_id,
            &key.student_id,
            &key.subject_id,
            key.school_year,
            key.trimester,
        ),
        |r| {
            Ok(TrimesterSummary {
                student_id: key.student_id.clone(),
                subject_id: key.subject_id.clone(),
                school_year: key.school_year,
                trimester: key.trimester,
                macs: r.get(0)?,
                mt: r.get(1)?,
                com: r.get(2)?,
            })
        },
    )
    .optional()
    .map_err(EngineError::db)
}
