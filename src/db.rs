use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE: &str = "salamandra.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schools(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            current_school_year INTEGER,
            current_trimester INTEGER
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_sections(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            grade_label TEXT NOT NULL,
            room TEXT,
            shift TEXT,
            school_year INTEGER NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_sections_school ON class_sections(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            sort_order INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_school ON subjects(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            section_id TEXT,
            full_name TEXT NOT NULL,
            sex TEXT NOT NULL,
            roll_number INTEGER,
            status TEXT NOT NULL DEFAULT 'active',
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(section_id) REFERENCES class_sections(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_section ON students(section_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS staff(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            full_name TEXT NOT NULL,
            role TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_staff_school ON staff(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_profiles(
            staff_id TEXT PRIMARY KEY,
            academic_level TEXT NOT NULL DEFAULT '',
            training_area TEXT NOT NULL DEFAULT '',
            contact TEXT NOT NULL DEFAULT '',
            updated_at TEXT,
            FOREIGN KEY(staff_id) REFERENCES staff(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teaching_assignments(
            school_id TEXT NOT NULL,
            staff_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            PRIMARY KEY(staff_id, section_id, subject_id),
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(staff_id) REFERENCES staff(id),
            FOREIGN KEY(section_id) REFERENCES class_sections(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teaching_assignments_section
         ON teaching_assignments(section_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS homeroom_assignments(
            section_id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            staff_id TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(section_id) REFERENCES class_sections(id),
            FOREIGN KEY(staff_id) REFERENCES staff(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_coordinators(
            school_id TEXT NOT NULL,
            grade_label TEXT NOT NULL,
            staff_id TEXT NOT NULL,
            PRIMARY KEY(school_id, grade_label),
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(staff_id) REFERENCES staff(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS scores(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            school_year INTEGER NOT NULL,
            trimester INTEGER NOT NULL,
            kind TEXT NOT NULL,
            value REAL,
            recorded_at TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(section_id) REFERENCES class_sections(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(school_id, student_id, section_id, subject_id, school_year, trimester, kind)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_scores_key
         ON scores(student_id, subject_id, school_year, trimester)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_scores_section_subject
         ON scores(section_id, subject_id, school_year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS trimester_summaries(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            school_year INTEGER NOT NULL,
            trimester INTEGER NOT NULL,
            macs REAL,
            mt INTEGER,
            com TEXT,
            updated_at TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(school_id, student_id, subject_id, school_year, trimester)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_trimester_summaries_section
         ON trimester_summaries(section_id, school_year, trimester)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS document_templates(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            doc_type TEXT NOT NULL,
            bracket INTEGER NOT NULL,
            file_path TEXT NOT NULL,
            version TEXT NOT NULL DEFAULT '1',
            is_active INTEGER NOT NULL DEFAULT 0,
            created_at TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    // At most one active template per (school, doc type, capacity bracket).
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_document_templates_active_scope
         ON document_templates(school_id, doc_type, bracket) WHERE is_active = 1",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS template_mappings(
            template_id TEXT PRIMARY KEY,
            sheet_name TEXT NOT NULL DEFAULT '',
            header_cells TEXT NOT NULL,
            start_row INTEGER NOT NULL,
            max_student_rows INTEGER NOT NULL,
            grade_columns TEXT NOT NULL,
            student_columns TEXT NOT NULL,
            continuation_cell TEXT,
            FOREIGN KEY(template_id) REFERENCES document_templates(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS generated_documents(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            doc_type TEXT NOT NULL,
            section_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            trimester INTEGER NOT NULL,
            school_year INTEGER NOT NULL,
            generated_by TEXT,
            file_path TEXT NOT NULL,
            sha256 TEXT NOT NULL,
            part_number INTEGER NOT NULL DEFAULT 1,
            parts_total INTEGER NOT NULL DEFAULT 1,
            template_id TEXT,
            template_version TEXT NOT NULL DEFAULT '',
            created_at TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(section_id) REFERENCES class_sections(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_generated_documents_section
         ON generated_documents(section_id, subject_id)",
        [],
    )?;

    // Older workspaces may predate the room/shift columns on sections.
    ensure_section_room_shift(&conn)?;

    Ok(conn)
}

fn ensure_section_room_shift(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "class_sections", "room")? {
        conn.execute("ALTER TABLE class_sections ADD COLUMN room TEXT", [])?;
    }
    if !table_has_column(conn, "class_sections", "shift")? {
        conn.execute("ALTER TABLE class_sections ADD COLUMN shift TEXT", [])?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
