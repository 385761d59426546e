//! Mark records and their raw scores: the write path for score entry and
//! workflow transitions, plus the read-only query surface.
//!
//! Every mutation runs in one transaction together with its audit entry and
//! is guarded by the record's `version` column.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{types::Type, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::{self, AuditLogEntry, NewAuditEntry};
use crate::calc::{self, QuestionTotal, RecordTotal};
use crate::catalog::{self, Component, QuestionSet};
use crate::error::EngineError;
use crate::scoring::{validate_score, Question, RawAnswerScore};
use crate::settings::{self, DepartmentSettings};
use crate::workflow::{self, Actor, EditWindow, ReadScope, RecordContext, WorkflowEvent, WorkflowState};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkRecord {
    pub id: String,
    pub student_id: String,
    pub component_id: String,
    pub state: WorkflowState,
    pub computed_total: f64,
    pub max_total: f64,
    pub capped: bool,
    pub not_attempted: bool,
    pub reject_reason: Option<String>,
    pub frozen_at: Option<String>,
    pub published_at: Option<String>,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

const RECORD_COLUMNS: &str = "id, student_id, component_id, state, computed_total, max_total, capped, not_attempted, \
     reject_reason, frozen_at, published_at, version, created_at, updated_at";

fn row_to_record(r: &rusqlite::Row<'_>) -> rusqlite::Result<MarkRecord> {
    let state: String = r.get(3)?;
    let state = WorkflowState::parse(&state).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(3, Type::Text, format!("unknown state {state}").into())
    })?;
    Ok(MarkRecord {
        id: r.get(0)?,
        student_id: r.get(1)?,
        component_id: r.get(2)?,
        state,
        computed_total: r.get(4)?,
        max_total: r.get(5)?,
        capped: r.get::<_, i64>(6)? != 0,
        not_attempted: r.get::<_, i64>(7)? != 0,
        reject_reason: r.get(8)?,
        frozen_at: r.get(9)?,
        published_at: r.get(10)?,
        version: r.get(11)?,
        created_at: r.get(12)?,
        updated_at: r.get(13)?,
    })
}

fn ts(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn load(conn: &Connection, id: &str) -> Result<MarkRecord, EngineError> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM mark_records WHERE id = ?");
    conn.query_row(&sql, [id], row_to_record)
        .optional()?
        .ok_or_else(|| EngineError::not_found("mark record", id))
}

pub fn find(
    conn: &Connection,
    student_id: &str,
    component_id: &str,
) -> Result<Option<MarkRecord>, EngineError> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM mark_records WHERE student_id = ? AND component_id = ?");
    Ok(conn
        .query_row(&sql, (student_id, component_id), row_to_record)
        .optional()?)
}

pub fn for_component(conn: &Connection, component_id: &str) -> Result<Vec<MarkRecord>, EngineError> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM mark_records WHERE component_id = ? ORDER BY student_id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([component_id], row_to_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Raw scores of one record in entry order, which is the order best-N
/// selection falls back on for equal scores.
pub fn load_scores(
    conn: &Connection,
    record_id: &str,
    student_id: &str,
) -> Result<Vec<RawAnswerScore>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT q.question_id, sq.sub_question_id, rs.attempt_no, rs.score
         FROM raw_scores rs
         JOIN questions q ON q.pk = rs.question_pk
         LEFT JOIN sub_questions sq ON sq.pk = rs.sub_question_pk
         WHERE rs.mark_record_id = ?
         ORDER BY rs.entry_order",
    )?;
    let rows = stmt
        .query_map([record_id], |r| {
            Ok(RawAnswerScore {
                student_id: student_id.to_string(),
                question_id: r.get(0)?,
                sub_question_id: r.get(1)?,
                attempt: r.get(2)?,
                score: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn context(
    record: &MarkRecord,
    component: &Component,
    settings: &DepartmentSettings,
    questions: &[Question],
    scores: &[RawAnswerScore],
) -> RecordContext {
    RecordContext {
        record_id: record.id.clone(),
        state: record.state,
        owner_teacher_id: component.teacher_id.clone(),
        department_id: component.department_id.clone(),
        required_scores_entered: calc::required_scores_entered(questions, scores),
        edit_window: component.exam_date.map(|exam_date| EditWindow {
            exam_date,
            days: settings.edit_window_days,
        }),
    }
}

fn check_version(record: &MarkRecord, expected: Option<i64>) -> Result<(), EngineError> {
    match expected {
        Some(v) if v != record.version => Err(EngineError::ConcurrentModification {
            record_id: record.id.clone(),
            expected: v,
            actual: record.version,
        }),
        _ => Ok(()),
    }
}

/// Zero rows touched means another writer got there first.
fn conflict_after_update(conn: &Connection, record: &MarkRecord) -> EngineError {
    let actual = conn
        .query_row(
            "SELECT version FROM mark_records WHERE id = ?",
            [&record.id],
            |r| r.get::<_, i64>(0),
        )
        .unwrap_or(-1);
    EngineError::ConcurrentModification {
        record_id: record.id.clone(),
        expected: record.version,
        actual,
    }
}

fn create(
    conn: &Connection,
    student_id: &str,
    component: &Component,
    max_total: f64,
    now: DateTime<Utc>,
) -> Result<MarkRecord, EngineError> {
    let id = Uuid::new_v4().to_string();
    let at = ts(now);
    conn.execute(
        "INSERT INTO mark_records(id, student_id, component_id, state, computed_total, max_total, capped, not_attempted, version, created_at, updated_at)
         VALUES(?, ?, ?, 'draft', 0, ?, 0, 1, 1, ?, ?)",
        (&id, student_id, &component.id, max_total, &at, &at),
    )?;
    load(conn, &id)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreInput {
    pub student_id: String,
    pub component_id: String,
    pub question_id: String,
    #[serde(default)]
    pub sub_question_id: Option<String>,
    #[serde(default = "first_attempt")]
    pub attempt: u32,
    pub score: f64,
    #[serde(default)]
    pub expected_version: Option<i64>,
    #[serde(default)]
    pub override_reason: Option<String>,
}

fn first_attempt() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreOutcome {
    pub record: MarkRecord,
    pub changed: bool,
    pub previous_score: Option<f64>,
    pub question: QuestionTotal,
    pub overridden: bool,
    pub audit: Option<AuditLogEntry>,
}

fn score_field(raw: &RawAnswerScore) -> String {
    match &raw.sub_question_id {
        Some(sub) => format!("score:{}.{}", raw.question_id, sub),
        None => format!("score:{}#{}", raw.question_id, raw.attempt),
    }
}

/// Writes the score into its slot and returns what was there before.
fn write_score(
    conn: &Connection,
    record_id: &str,
    question_pk: i64,
    sub_question_pk: Option<i64>,
    attempt: u32,
    score: f64,
    now: DateTime<Utc>,
) -> Result<Option<f64>, EngineError> {
    let existing: Option<(String, f64)> = conn
        .query_row(
            "SELECT id, score FROM raw_scores
             WHERE mark_record_id = ? AND question_pk = ? AND IFNULL(sub_question_pk, 0) = IFNULL(?, 0) AND attempt_no = ?",
            rusqlite::params![record_id, question_pk, sub_question_pk, attempt],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    match existing {
        Some((id, old)) => {
            conn.execute(
                "UPDATE raw_scores SET score = ?, updated_at = ? WHERE id = ?",
                (score, ts(now), &id),
            )?;
            Ok(Some(old))
        }
        None => {
            let next_order: i64 = conn.query_row(
                "SELECT IFNULL(MAX(entry_order), 0) + 1 FROM raw_scores WHERE mark_record_id = ?",
                [record_id],
                |r| r.get(0),
            )?;
            conn.execute(
                "INSERT INTO raw_scores(id, mark_record_id, question_pk, sub_question_pk, attempt_no, score, entry_order, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    Uuid::new_v4().to_string(),
                    record_id,
                    question_pk,
                    sub_question_pk,
                    attempt,
                    score,
                    next_order,
                    ts(now)
                ],
            )?;
            Ok(None)
        }
    }
}

fn store_total(
    conn: &Connection,
    record: &MarkRecord,
    total: &RecordTotal,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    let n = conn.execute(
        "UPDATE mark_records
         SET computed_total = ?, max_total = ?, capped = ?, not_attempted = ?, version = version + 1, updated_at = ?
         WHERE id = ? AND version = ?",
        rusqlite::params![
            total.total,
            total.max,
            total.capped,
            total.not_attempted,
            ts(now),
            record.id,
            record.version
        ],
    )?;
    if n == 0 {
        return Err(conflict_after_update(conn, record));
    }
    Ok(())
}

fn display_score(v: f64) -> String {
    format!("{}", v)
}

/// Enters (or corrects) one raw score. Creates the student's Draft record on
/// first entry. Validation, authorization, and the edit window are all
/// checked before anything is written.
pub fn enter_score(
    conn: &Connection,
    actor: &Actor,
    input: &ScoreInput,
    now: DateTime<Utc>,
) -> Result<ScoreOutcome, EngineError> {
    if input.student_id.trim().is_empty() {
        return Err(EngineError::validation("studentId", "must not be empty"));
    }
    let component = catalog::load_component(conn, &input.component_id)?;
    let settings = settings::load(conn, &component.department_id)?;
    let set: QuestionSet = catalog::load_questions(conn, &component.id)?;
    let question = set.get(&input.question_id).ok_or_else(|| {
        EngineError::validation(
            "questionId",
            format!("question {} is not part of component {}", input.question_id, component.id),
        )
    })?;

    let raw = RawAnswerScore {
        student_id: input.student_id.clone(),
        question_id: input.question_id.clone(),
        sub_question_id: input.sub_question_id.clone(),
        attempt: if input.sub_question_id.is_some() { 1 } else { input.attempt },
        score: input.score,
    };
    validate_score(question, &raw)?;

    let question_pk = set
        .question_keys
        .get(&raw.question_id)
        .copied()
        .ok_or_else(|| EngineError::Storage(format!("question {} has no key", raw.question_id)))?;
    let sub_question_pk = match &raw.sub_question_id {
        Some(sub) => Some(
            set.sub_question_keys
                .get(&(raw.question_id.clone(), sub.clone()))
                .copied()
                .ok_or_else(|| EngineError::Storage(format!("sub-question {sub} has no key")))?,
        ),
        None => None,
    };

    let tx = conn.unchecked_transaction()?;
    let record = match find(&tx, &input.student_id, &component.id)? {
        Some(r) => r,
        None => create(&tx, &input.student_id, &component, set.max_total(), now)?,
    };
    check_version(&record, input.expected_version)?;

    let scores = load_scores(&tx, &record.id, &record.student_id)?;
    let ctx = context(&record, &component, &settings, &set.questions, &scores);
    let mode = workflow::authorize_edit(&ctx, actor, input.override_reason.as_deref(), now)?;

    let previous = write_score(
        &tx,
        &record.id,
        question_pk,
        sub_question_pk,
        raw.attempt,
        raw.score,
        now,
    )?;
    if previous == Some(raw.score) {
        // Same value re-entered: nothing changed, nothing to audit.
        let question = calc::compute_total(question, &scores);
        return Ok(ScoreOutcome {
            record,
            changed: false,
            previous_score: previous,
            question,
            overridden: false,
            audit: None,
        });
    }

    let all = load_scores(&tx, &record.id, &record.student_id)?;
    let total = calc::record_total(&set.questions, &all);
    store_total(&tx, &record, &total, now)?;

    let audit = audit::append(
        &tx,
        &NewAuditEntry {
            mark_record_id: record.id.clone(),
            actor_id: actor.id.clone(),
            field: score_field(&raw),
            old_value: previous.map(display_score),
            new_value: Some(display_score(raw.score)),
            reason: mode.reason().map(str::to_string),
            timestamp: now,
        },
    )?;
    tx.commit()?;

    let question_total = calc::compute_total(question, &all);
    if question_total.capped {
        tracing::info!(
            record_id = %record.id,
            question_id = %question_total.question_id,
            total = question_total.total,
            excluded = ?question_total.excluded,
            "capping applied"
        );
    }
    let overridden = matches!(mode, workflow::EditMode::Override { .. });
    if overridden {
        tracing::info!(record_id = %record.id, actor_id = %actor.id, "override edit recorded");
    }

    Ok(ScoreOutcome {
        record: load(conn, &record.id)?,
        changed: true,
        previous_score: previous,
        question: question_total,
        overridden,
        audit: Some(audit),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionOutcome {
    pub record: MarkRecord,
    pub from: WorkflowState,
    pub to: WorkflowState,
    pub event: WorkflowEvent,
    pub audit: AuditLogEntry,
}

/// Runs one workflow event on a stored record. The state change, its
/// timestamps, and the audit entry commit together or not at all.
pub fn transition(
    conn: &Connection,
    actor: &Actor,
    record_id: &str,
    event: WorkflowEvent,
    reason: Option<&str>,
    expected_version: Option<i64>,
    now: DateTime<Utc>,
) -> Result<(TransitionOutcome, Component), EngineError> {
    let tx = conn.unchecked_transaction()?;
    let record = load(&tx, record_id)?;
    check_version(&record, expected_version)?;

    let component = catalog::load_component(&tx, &record.component_id)?;
    let settings = settings::load(&tx, &component.department_id)?;
    let set = catalog::load_questions(&tx, &component.id)?;
    let scores = load_scores(&tx, &record.id, &record.student_id)?;
    let ctx = context(&record, &component, &settings, &set.questions, &scores);

    let t = workflow::apply(&ctx, actor, event, reason, now)?;

    let at = ts(now);
    let reject_reason = match t.event {
        WorkflowEvent::Reject => t.audit.reason.clone(),
        WorkflowEvent::Approve => None,
        _ => record.reject_reason.clone(),
    };
    let frozen_at = if t.to == WorkflowState::Frozen {
        Some(at.clone())
    } else {
        record.frozen_at.clone()
    };
    let published_at = if t.to == WorkflowState::Published {
        Some(at.clone())
    } else {
        record.published_at.clone()
    };
    let n = tx.execute(
        "UPDATE mark_records
         SET state = ?, reject_reason = ?, frozen_at = ?, published_at = ?, version = version + 1, updated_at = ?
         WHERE id = ? AND version = ?",
        rusqlite::params![
            t.to.as_str(),
            reject_reason,
            frozen_at,
            published_at,
            at,
            record.id,
            record.version
        ],
    )?;
    if n == 0 {
        return Err(conflict_after_update(&tx, &record));
    }
    let audit = audit::append(&tx, &t.audit)?;
    tx.commit()?;

    tracing::info!(
        record_id = %record.id,
        actor_id = %actor.id,
        from = t.from.as_str(),
        to = t.to.as_str(),
        "workflow transition"
    );

    Ok((
        TransitionOutcome {
            record: load(conn, record_id)?,
            from: t.from,
            to: t.to,
            event: t.event,
            audit,
        },
        component,
    ))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordView {
    pub record: MarkRecord,
    pub component: Component,
    pub scores: Vec<RawAnswerScore>,
    pub breakdown: RecordTotal,
}

/// Read-only view of one record, gated by [`workflow::authorize_view`].
pub fn view(conn: &Connection, actor: &Actor, record_id: &str) -> Result<RecordView, EngineError> {
    let record = load(conn, record_id)?;
    let component = catalog::load_component(conn, &record.component_id)?;
    let settings = settings::load(conn, &component.department_id)?;
    let set = catalog::load_questions(conn, &component.id)?;
    let scores = load_scores(conn, &record.id, &record.student_id)?;
    let ctx = context(&record, &component, &settings, &set.questions, &scores);
    workflow::authorize_view(&ctx, &record.student_id, actor)?;
    let breakdown = calc::record_total(&set.questions, &scores);
    Ok(RecordView {
        record,
        component,
        scores,
        breakdown,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordFilter {
    #[serde(default)]
    pub state: Option<WorkflowState>,
    #[serde(default)]
    pub department_id: Option<String>,
    #[serde(default)]
    pub class_label: Option<String>,
    #[serde(default)]
    pub component_id: Option<String>,
    #[serde(default)]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub semester_id: Option<String>,
    #[serde(default)]
    pub student_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordRow {
    pub id: String,
    pub student_id: String,
    pub component_id: String,
    pub kind: String,
    pub subject_id: String,
    pub semester_id: String,
    pub department_id: String,
    pub class_label: String,
    pub teacher_id: String,
    pub state: WorkflowState,
    pub computed_total: f64,
    pub max_total: f64,
    pub capped: bool,
    pub not_attempted: bool,
    pub version: i64,
    pub updated_at: String,
}

/// Approval-dashboard query: records by workflow state and department/class,
/// narrowed to what `scope` may see.
pub fn list(conn: &Connection, scope: &ReadScope, filter: &RecordFilter) -> Result<Vec<RecordRow>, EngineError> {
    let mut sql = String::from(
        "SELECT m.id, m.student_id, m.component_id, c.kind, a.subject_id, a.semester_id, s.department_id,
                a.class_label, a.teacher_id, m.state, m.computed_total, m.max_total, m.capped, m.not_attempted,
                m.version, m.updated_at
         FROM mark_records m
         JOIN components c ON c.id = m.component_id
         JOIN subject_assignments a ON a.id = c.assignment_id
         JOIN subjects s ON s.id = a.subject_id
         WHERE 1 = 1",
    );
    let mut args: Vec<String> = Vec::new();
    let mut push = |clause: &str, v: &Option<String>| {
        if let Some(v) = v {
            sql.push_str(clause);
            args.push(v.clone());
        }
    };
    push(" AND m.state = ?", &filter.state.map(|s| s.as_str().to_string()));
    push(" AND s.department_id = ?", &filter.department_id);
    push(" AND a.class_label = ?", &filter.class_label);
    push(" AND m.component_id = ?", &filter.component_id);
    push(" AND a.subject_id = ?", &filter.subject_id);
    push(" AND a.semester_id = ?", &filter.semester_id);
    push(" AND m.student_id = ?", &filter.student_id);
    match scope {
        ReadScope::Everything => {}
        ReadScope::Department(dept) => push(" AND s.department_id = ?", &Some(dept.clone())),
        ReadScope::Teacher(id) => push(" AND a.teacher_id = ?", &Some(id.clone())),
        ReadScope::OwnPublished(id) => {
            push(" AND m.student_id = ?", &Some(id.clone()));
            push(" AND m.state = ?", &Some(WorkflowState::Published.as_str().to_string()));
        }
    }
    sql.push_str(" ORDER BY a.class_label, m.component_id, m.student_id");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), |r| {
            let state: String = r.get(9)?;
            let state = WorkflowState::parse(&state).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(9, Type::Text, format!("unknown state {state}").into())
            })?;
            Ok(RecordRow {
                id: r.get(0)?,
                student_id: r.get(1)?,
                component_id: r.get(2)?,
                kind: r.get(3)?,
                subject_id: r.get(4)?,
                semester_id: r.get(5)?,
                department_id: r.get(6)?,
                class_label: r.get(7)?,
                teacher_id: r.get(8)?,
                state,
                computed_total: r.get(10)?,
                max_total: r.get(11)?,
                capped: r.get::<_, i64>(12)? != 0,
                not_attempted: r.get::<_, i64>(13)? != 0,
                version: r.get(14)?,
                updated_at: r.get(15)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
