use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

use crate::error::EngineError;

pub const DB_FILE: &str = "assessd.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS semesters(
            id TEXT PRIMARY KEY,
            seq INTEGER NOT NULL UNIQUE,
            label TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            department_id TEXT NOT NULL,
            code TEXT NOT NULL,
            name TEXT NOT NULL,
            credits REAL NOT NULL CHECK(credits >= 0),
            internal_exam_max REAL NOT NULL CHECK(internal_exam_max > 0),
            internal_max REAL NOT NULL CHECK(internal_max > 0),
            external_exam_max REAL NOT NULL CHECK(external_exam_max > 0),
            external_max REAL NOT NULL CHECK(external_max > 0),
            total_max REAL NOT NULL CHECK(total_max > 0)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_department ON subjects(department_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_assignments(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            semester_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            class_label TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(semester_id) REFERENCES semesters(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_subject ON subject_assignments(subject_id, semester_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS components(
            id TEXT PRIMARY KEY,
            assignment_id TEXT NOT NULL,
            kind TEXT NOT NULL CHECK(kind IN ('internal_1', 'internal_2', 'external')),
            exam_date TEXT,
            locked INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(assignment_id) REFERENCES subject_assignments(id),
            UNIQUE(assignment_id, kind)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS questions(
            pk INTEGER PRIMARY KEY,
            component_id TEXT NOT NULL,
            question_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            section TEXT NOT NULL DEFAULT '',
            label TEXT NOT NULL DEFAULT '',
            max_marks REAL NOT NULL CHECK(max_marks > 0),
            required_count INTEGER NOT NULL CHECK(required_count >= 1),
            optional_count INTEGER NOT NULL DEFAULT 0 CHECK(optional_count >= 0),
            co_tags TEXT NOT NULL DEFAULT '[]',
            FOREIGN KEY(component_id) REFERENCES components(id) ON DELETE CASCADE,
            UNIQUE(component_id, question_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sub_questions(
            pk INTEGER PRIMARY KEY,
            question_pk INTEGER NOT NULL,
            sub_question_id TEXT NOT NULL,
            label TEXT NOT NULL DEFAULT '',
            max_marks REAL NOT NULL CHECK(max_marks > 0),
            FOREIGN KEY(question_pk) REFERENCES questions(pk) ON DELETE CASCADE,
            UNIQUE(question_pk, sub_question_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS mark_records(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            component_id TEXT NOT NULL,
            state TEXT NOT NULL CHECK(state IN ('draft', 'submitted', 'approved', 'rejected', 'frozen', 'published')),
            computed_total REAL NOT NULL DEFAULT 0,
            max_total REAL NOT NULL DEFAULT 0,
            capped INTEGER NOT NULL DEFAULT 0,
            not_attempted INTEGER NOT NULL DEFAULT 1,
            reject_reason TEXT,
            frozen_at TEXT,
            published_at TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(component_id) REFERENCES components(id),
            UNIQUE(student_id, component_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_mark_records_component ON mark_records(component_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_mark_records_state ON mark_records(state)",
        [],
    )?;

    // Scores die with their record; a sub-question score can never outlive
    // the sub-question it points at.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS raw_scores(
            id TEXT PRIMARY KEY,
            mark_record_id TEXT NOT NULL,
            question_pk INTEGER NOT NULL,
            sub_question_pk INTEGER,
            attempt_no INTEGER NOT NULL CHECK(attempt_no >= 1),
            score REAL NOT NULL CHECK(score >= 0),
            entry_order INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(mark_record_id) REFERENCES mark_records(id) ON DELETE CASCADE,
            FOREIGN KEY(question_pk) REFERENCES questions(pk),
            FOREIGN KEY(sub_question_pk) REFERENCES sub_questions(pk) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_raw_scores_slot
         ON raw_scores(mark_record_id, question_pk, IFNULL(sub_question_pk, 0), attempt_no)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS final_marks(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            semester_id TEXT NOT NULL,
            internal_1 REAL NOT NULL,
            internal_2 REAL NOT NULL,
            best_internal REAL NOT NULL,
            external REAL NOT NULL,
            total REAL NOT NULL,
            percentage REAL NOT NULL,
            grade TEXT NOT NULL,
            grade_point REAL NOT NULL,
            passed INTEGER NOT NULL,
            credits REAL NOT NULL,
            method TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('computed', 'frozen', 'published')),
            backlog_cleared_in TEXT,
            computed_at TEXT NOT NULL,
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(semester_id) REFERENCES semesters(id),
            UNIQUE(student_id, subject_id, semester_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_final_marks_student ON final_marks(student_id, semester_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS semester_results(
            student_id TEXT NOT NULL,
            semester_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            sgpa REAL NOT NULL,
            credits REAL NOT NULL,
            cgpa REAL NOT NULL,
            computed_at TEXT NOT NULL,
            PRIMARY KEY(student_id, semester_id),
            FOREIGN KEY(semester_id) REFERENCES semesters(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_outcomes(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            code TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            target_pct REAL NOT NULL CHECK(target_pct >= 0 AND target_pct <= 100),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(subject_id, code)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS program_outcomes(
            id TEXT PRIMARY KEY,
            department_id TEXT NOT NULL,
            code TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            UNIQUE(department_id, code)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS co_po_mappings(
            co_id TEXT NOT NULL,
            po_id TEXT NOT NULL,
            strength INTEGER NOT NULL CHECK(strength IN (1, 2, 3)),
            PRIMARY KEY(co_id, po_id),
            FOREIGN KEY(co_id) REFERENCES course_outcomes(id) ON DELETE CASCADE,
            FOREIGN KEY(po_id) REFERENCES program_outcomes(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attainment_records(
            id TEXT PRIMARY KEY,
            scope_kind TEXT NOT NULL CHECK(scope_kind IN ('co', 'po')),
            scope_code TEXT NOT NULL,
            cohort TEXT NOT NULL,
            percentage REAL NOT NULL CHECK(percentage >= 0 AND percentage <= 100),
            threshold_met INTEGER NOT NULL,
            cohort_size_used INTEGER NOT NULL,
            cohort_size_total INTEGER NOT NULL,
            computed_at TEXT NOT NULL,
            UNIQUE(scope_kind, scope_code, cohort)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_log(
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            mark_record_id TEXT NOT NULL,
            actor_id TEXT NOT NULL,
            field TEXT NOT NULL,
            old_value TEXT,
            new_value TEXT,
            reason TEXT,
            created_at TEXT NOT NULL,
            prev_hash TEXT NOT NULL,
            hash TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_log_record ON audit_log(mark_record_id)",
        [],
    )?;
    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS audit_log_no_update BEFORE UPDATE ON audit_log
         BEGIN SELECT RAISE(ABORT, 'audit_log is append-only'); END",
        [],
    )?;
    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS audit_log_no_delete BEFORE DELETE ON audit_log
         BEGIN SELECT RAISE(ABORT, 'audit_log is append-only'); END",
        [],
    )?;

    Ok(conn)
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> Result<Option<serde_json::Value>, EngineError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> Result<(), EngineError> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, value.to_string()),
    )?;
    Ok(())
}
