//! Derived results: per-subject final marks, per-semester SGPA/CGPA rows,
//! and backlog clearance.
//!
//! Everything here is recomputed from stored inputs and is safe to re-run;
//! a recompute over unchanged inputs writes nothing.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{types::Type, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::aggregate::{aggregate, FinalMarkResult};
use crate::audit::{self, NewAuditEntry};
use crate::catalog::{self, ComponentKind};
use crate::error::EngineError;
use crate::gpa::{self, RollupRow, SemesterHistory, SubjectGrade};
use crate::records::{self, MarkRecord};
use crate::settings;
use crate::workflow::{self, Actor, ReadScope, Role, FREEZERS, REVIEWERS};

const EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Computed,
    Frozen,
    Published,
}

impl FinalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Computed => "computed",
            Self::Frozen => "frozen",
            Self::Published => "published",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "computed" => Some(Self::Computed),
            "frozen" => Some(Self::Frozen),
            "published" => Some(Self::Published),
            _ => None,
        }
    }

    /// Frozen and published rows are snapshots; only backlog clearance
    /// rewrites them.
    pub fn is_snapshot(self) -> bool {
        !matches!(self, Self::Computed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalMark {
    pub id: String,
    pub student_id: String,
    pub subject_id: String,
    pub semester_id: String,
    pub internal_1: f64,
    pub internal_2: f64,
    pub best_internal: f64,
    pub external: f64,
    pub total: f64,
    pub percentage: f64,
    pub grade: String,
    pub grade_point: f64,
    pub passed: bool,
    pub credits: f64,
    pub method: String,
    pub status: FinalStatus,
    pub backlog_cleared_in: Option<String>,
    pub computed_at: String,
}

const FINAL_COLUMNS: &str = "id, student_id, subject_id, semester_id, internal_1, internal_2, best_internal, external, \
     total, percentage, grade, grade_point, passed, credits, method, status, backlog_cleared_in, computed_at";

fn row_to_final(r: &rusqlite::Row<'_>) -> rusqlite::Result<FinalMark> {
    let status: String = r.get(15)?;
    let status = FinalStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(15, Type::Text, format!("unknown status {status}").into())
    })?;
    Ok(FinalMark {
        id: r.get(0)?,
        student_id: r.get(1)?,
        subject_id: r.get(2)?,
        semester_id: r.get(3)?,
        internal_1: r.get(4)?,
        internal_2: r.get(5)?,
        best_internal: r.get(6)?,
        external: r.get(7)?,
        total: r.get(8)?,
        percentage: r.get(9)?,
        grade: r.get(10)?,
        grade_point: r.get(11)?,
        passed: r.get::<_, i64>(12)? != 0,
        credits: r.get(13)?,
        method: r.get(14)?,
        status,
        backlog_cleared_in: r.get(16)?,
        computed_at: r.get(17)?,
    })
}

fn ts(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn find_final(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
    semester_id: &str,
) -> Result<Option<FinalMark>, EngineError> {
    let sql = format!(
        "SELECT {FINAL_COLUMNS} FROM final_marks WHERE student_id = ? AND subject_id = ? AND semester_id = ?"
    );
    Ok(conn
        .query_row(&sql, (student_id, subject_id, semester_id), row_to_final)
        .optional()?)
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalMarkFilter {
    #[serde(default)]
    pub student_id: Option<String>,
    #[serde(default)]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub semester_id: Option<String>,
}

/// FinalMarks matching `filter`, narrowed to what `scope` may see. Students
/// only ever see published rows of their own.
pub fn list_final_marks(
    conn: &Connection,
    scope: &ReadScope,
    filter: &FinalMarkFilter,
) -> Result<Vec<FinalMark>, EngineError> {
    let mut sql = format!("SELECT {FINAL_COLUMNS} FROM final_marks WHERE 1 = 1");
    let mut args: Vec<String> = Vec::new();
    for (clause, v) in [
        (" AND final_marks.student_id = ?", &filter.student_id),
        (" AND final_marks.subject_id = ?", &filter.subject_id),
        (" AND final_marks.semester_id = ?", &filter.semester_id),
    ] {
        if let Some(v) = v {
            sql.push_str(clause);
            args.push(v.clone());
        }
    }
    match scope {
        ReadScope::Everything => {}
        ReadScope::Department(dept) => {
            sql.push_str(" AND final_marks.subject_id IN (SELECT id FROM subjects WHERE department_id = ?)");
            args.push(dept.clone());
        }
        ReadScope::Teacher(id) => {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM subject_assignments a
                     WHERE a.subject_id = final_marks.subject_id
                       AND a.semester_id = final_marks.semester_id
                       AND a.teacher_id = ?)",
            );
            args.push(id.clone());
        }
        ReadScope::OwnPublished(id) => {
            sql.push_str(" AND final_marks.student_id = ? AND final_marks.status = ?");
            args.push(id.clone());
            args.push(FinalStatus::Published.as_str().to_string());
        }
    }
    sql.push_str(" ORDER BY semester_id, subject_id, student_id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), row_to_final)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingStudent {
    pub student_id: String,
    /// `kind: state` for every component that is not yet Approved.
    pub waiting_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecomputeSummary {
    pub subject_id: String,
    pub semester_id: String,
    pub updated: Vec<String>,
    pub unchanged: usize,
    pub snapshots_skipped: usize,
    pub pending: Vec<PendingStudent>,
}

fn same_result(existing: &FinalMark, r: &FinalMarkResult, method: &str, credits: f64) -> bool {
    (existing.internal_1 - r.internal_1).abs() < EPS
        && (existing.internal_2 - r.internal_2).abs() < EPS
        && (existing.external - r.external).abs() < EPS
        && (existing.total - r.total).abs() < EPS
        && (existing.credits - credits).abs() < EPS
        && existing.grade == r.grade
        && existing.method == method
}

/// Recomputes the FinalMark of every student in one subject/semester whose
/// three component records are all Approved or later. Students still waiting
/// on a component are reported, not failed.
pub fn recompute_final_marks(
    conn: &Connection,
    subject_id: &str,
    semester_id: &str,
    now: DateTime<Utc>,
) -> Result<RecomputeSummary, EngineError> {
    let subject = catalog::load_subject(conn, subject_id)?;
    let settings = settings::load(conn, &subject.department_id)?;
    let method = settings.method()?;
    let grades = settings.grades()?;

    let components = catalog::components_for_subject(conn, subject_id, semester_id)?;
    if components.is_empty() {
        return Err(EngineError::insufficient(
            "final_marks",
            format!("subject {} has no components in semester {}", subject.code, semester_id),
        ));
    }

    let mut by_student: BTreeMap<String, BTreeMap<ComponentKind, MarkRecord>> = BTreeMap::new();
    for (component_id, kind) in &components {
        for rec in records::for_component(conn, component_id)? {
            by_student
                .entry(rec.student_id.clone())
                .or_default()
                .entry(*kind)
                .or_insert(rec);
        }
    }

    let mut summary = RecomputeSummary {
        subject_id: subject_id.to_string(),
        semester_id: semester_id.to_string(),
        updated: Vec::new(),
        unchanged: 0,
        snapshots_skipped: 0,
        pending: Vec::new(),
    };

    let tx = conn.unchecked_transaction()?;
    for (student_id, recs) in &by_student {
        let existing = find_final(&tx, student_id, subject_id, semester_id)?;
        if existing.as_ref().is_some_and(|f| f.status.is_snapshot()) {
            summary.snapshots_skipped += 1;
            continue;
        }

        let mut waiting_on = Vec::new();
        for kind in [ComponentKind::Internal1, ComponentKind::Internal2, ComponentKind::External] {
            match recs.get(&kind) {
                Some(r) if r.state.is_finalized() => {}
                Some(r) => waiting_on.push(format!("{}: {}", kind.as_str(), r.state.as_str())),
                None => waiting_on.push(format!("{}: no record", kind.as_str())),
            }
        }
        if !waiting_on.is_empty() {
            summary.pending.push(PendingStudent {
                student_id: student_id.clone(),
                waiting_on,
            });
            continue;
        }
        let total_of = |k: ComponentKind| recs.get(&k).map(|r| r.computed_total).unwrap_or(0.0);

        let result = aggregate(
            total_of(ComponentKind::Internal1),
            total_of(ComponentKind::Internal2),
            total_of(ComponentKind::External),
            method,
            &subject.scheme,
            &grades,
        )?;

        if let Some(f) = &existing {
            if same_result(f, &result, &settings.internal_method, subject.credits) {
                summary.unchanged += 1;
                continue;
            }
        }
        let id = existing
            .as_ref()
            .map(|f| f.id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        tx.execute(
            "INSERT INTO final_marks(id, student_id, subject_id, semester_id, internal_1, internal_2, best_internal, external,
                                     total, percentage, grade, grade_point, passed, credits, method, status, computed_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'computed', ?)
             ON CONFLICT(student_id, subject_id, semester_id) DO UPDATE SET
               internal_1 = excluded.internal_1,
               internal_2 = excluded.internal_2,
               best_internal = excluded.best_internal,
               external = excluded.external,
               total = excluded.total,
               percentage = excluded.percentage,
               grade = excluded.grade,
               grade_point = excluded.grade_point,
               passed = excluded.passed,
               credits = excluded.credits,
               method = excluded.method,
               computed_at = excluded.computed_at",
            rusqlite::params![
                id,
                student_id,
                subject_id,
                semester_id,
                result.internal_1,
                result.internal_2,
                result.best_internal,
                result.external,
                result.total,
                result.percentage,
                result.grade,
                result.grade_point,
                result.passed,
                subject.credits,
                settings.internal_method,
                ts(now)
            ],
        )?;
        summary.updated.push(student_id.clone());
    }
    tx.commit()?;

    tracing::info!(
        subject_id,
        semester_id,
        updated = summary.updated.len(),
        unchanged = summary.unchanged,
        pending = summary.pending.len(),
        "final marks recomputed"
    );
    Ok(summary)
}

/// Re-derives final marks for the subject a component belongs to. Called
/// after transitions; the caller reports the outcome instead of failing.
pub fn refresh_for_component(
    conn: &Connection,
    component_id: &str,
    now: DateTime<Utc>,
) -> Result<RecomputeSummary, EngineError> {
    let component = catalog::load_component(conn, component_id)?;
    recompute_final_marks(conn, &component.subject_id, &component.semester_id, now)
}

fn set_status(
    conn: &Connection,
    actor: &Actor,
    subject_id: &str,
    semester_id: &str,
    from: FinalStatus,
    to: FinalStatus,
    now: DateTime<Utc>,
) -> Result<Vec<String>, EngineError> {
    let tx = conn.unchecked_transaction()?;
    let rows: Vec<FinalMark> = list_final_marks(
        &tx,
        &ReadScope::Everything,
        &FinalMarkFilter {
            student_id: None,
            subject_id: Some(subject_id.to_string()),
            semester_id: Some(semester_id.to_string()),
        },
    )?
    .into_iter()
    .filter(|f| f.status == from)
    .collect();

    let mut changed = Vec::with_capacity(rows.len());
    for f in rows {
        tx.execute(
            "UPDATE final_marks SET status = ? WHERE id = ? AND status = ?",
            (to.as_str(), &f.id, from.as_str()),
        )?;
        audit::append(
            &tx,
            &NewAuditEntry {
                mark_record_id: audit::final_mark_subject(&f.id),
                actor_id: actor.id.clone(),
                field: "final_mark.status".to_string(),
                old_value: Some(from.as_str().to_string()),
                new_value: Some(to.as_str().to_string()),
                reason: None,
                timestamp: now,
            },
        )?;
        changed.push(f.student_id);
    }
    tx.commit()?;
    Ok(changed)
}

/// Snapshots every computed FinalMark of a subject/semester.
pub fn freeze_final_marks(
    conn: &Connection,
    actor: &Actor,
    subject_id: &str,
    semester_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<String>, EngineError> {
    let subject = catalog::load_subject(conn, subject_id)?;
    workflow::authorize_action(
        actor,
        FREEZERS,
        &subject.department_id,
        &format!("freeze final marks of {}", subject.code),
    )?;
    let frozen = set_status(conn, actor, subject_id, semester_id, FinalStatus::Computed, FinalStatus::Frozen, now)?;
    tracing::info!(subject_id, semester_id, count = frozen.len(), "final marks frozen");
    Ok(frozen)
}

pub fn publish_final_marks(
    conn: &Connection,
    actor: &Actor,
    subject_id: &str,
    semester_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<String>, EngineError> {
    let subject = catalog::load_subject(conn, subject_id)?;
    workflow::authorize_action(
        actor,
        REVIEWERS,
        &subject.department_id,
        &format!("publish final marks of {}", subject.code),
    )?;
    let published =
        set_status(conn, actor, subject_id, semester_id, FinalStatus::Frozen, FinalStatus::Published, now)?;
    tracing::info!(subject_id, semester_id, count = published.len(), "final marks published");
    Ok(published)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRollup {
    pub student_id: String,
    pub semesters: Vec<RollupRow>,
    /// Semesters skipped because some FinalMark there is not yet frozen.
    pub pending_semesters: Vec<String>,
}

fn build_history(conn: &Connection, student_id: &str) -> Result<(Vec<SemesterHistory>, Vec<String>), EngineError> {
    let mut stmt = conn.prepare(
        "SELECT f.semester_id, s.seq, f.subject_id, f.credits, f.grade_point, f.grade, f.status
         FROM final_marks f
         JOIN semesters s ON s.id = f.semester_id
         WHERE f.student_id = ?
         ORDER BY s.seq, f.subject_id",
    )?;
    let rows = stmt
        .query_map([student_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                SubjectGrade {
                    subject_id: r.get(2)?,
                    credits: r.get(3)?,
                    grade_point: r.get(4)?,
                    grade: r.get(5)?,
                },
                r.get::<_, String>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut by_semester: BTreeMap<i64, SemesterHistory> = BTreeMap::new();
    let mut pending: BTreeSet<String> = BTreeSet::new();
    for (semester_id, seq, grade, status) in rows {
        if FinalStatus::parse(&status) == Some(FinalStatus::Computed) {
            pending.insert(semester_id.clone());
        }
        by_semester
            .entry(seq)
            .or_insert_with(|| SemesterHistory {
                semester_id: semester_id.clone(),
                seq,
                subjects: Vec::new(),
            })
            .subjects
            .push(grade);
    }
    let history = by_semester
        .into_values()
        .filter(|h| !pending.contains(&h.semester_id))
        .collect();
    Ok((history, pending.into_iter().collect()))
}

fn write_rollup(conn: &Connection, student_id: &str, now: DateTime<Utc>) -> Result<StudentRollup, EngineError> {
    let (history, pending_semesters) = build_history(conn, student_id)?;
    if history.is_empty() {
        return Err(EngineError::insufficient(
            "semester_results",
            format!("student {student_id} has no semester with every FinalMark frozen"),
        ));
    }
    let semesters = gpa::rollup(&history)?;

    conn.execute("DELETE FROM semester_results WHERE student_id = ?", [student_id])?;
    let at = ts(now);
    for row in &semesters {
        conn.execute(
            "INSERT INTO semester_results(student_id, semester_id, seq, sgpa, credits, cgpa, computed_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![student_id, row.semester_id, row.seq, row.sgpa, row.credits, row.cgpa, at],
        )?;
    }
    Ok(StudentRollup {
        student_id: student_id.to_string(),
        semesters,
        pending_semesters,
    })
}

/// Rebuilds every SemesterResult of one student from the full FinalMark
/// history, in semester order.
pub fn recompute_semester_results(
    conn: &Connection,
    student_id: &str,
    now: DateTime<Utc>,
) -> Result<StudentRollup, EngineError> {
    let tx = conn.unchecked_transaction()?;
    let rollup = write_rollup(&tx, student_id, now)?;
    tx.commit()?;
    tracing::info!(
        student_id,
        semesters = rollup.semesters.len(),
        cgpa = rollup.semesters.last().map(|r| r.cgpa),
        "semester results recomputed"
    );
    Ok(rollup)
}

pub fn students_with_final_marks(conn: &Connection) -> Result<Vec<String>, EngineError> {
    let mut stmt = conn.prepare("SELECT DISTINCT student_id FROM final_marks ORDER BY student_id")?;
    let rows = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SemesterResult {
    pub semester_id: String,
    pub seq: i64,
    pub sgpa: f64,
    pub credits: f64,
    pub cgpa: f64,
    pub computed_at: String,
}

/// A student's stored rollup. Staff see it when the semester holds a
/// FinalMark in their department or taught by them; a student sees only their
/// own semesters whose FinalMarks are all published.
pub fn semester_results(
    conn: &Connection,
    scope: &ReadScope,
    student_id: &str,
) -> Result<Vec<SemesterResult>, EngineError> {
    let mut sql = String::from(
        "SELECT semester_id, seq, sgpa, credits, cgpa, computed_at
         FROM semester_results WHERE student_id = ?",
    );
    let mut args: Vec<String> = vec![student_id.to_string()];
    match scope {
        ReadScope::Everything => {}
        ReadScope::Department(dept) => {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM final_marks f JOIN subjects s ON s.id = f.subject_id
                     WHERE f.student_id = semester_results.student_id
                       AND f.semester_id = semester_results.semester_id
                       AND s.department_id = ?)",
            );
            args.push(dept.clone());
        }
        ReadScope::Teacher(id) => {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM final_marks f
                     JOIN subject_assignments a ON a.subject_id = f.subject_id AND a.semester_id = f.semester_id
                     WHERE f.student_id = semester_results.student_id
                       AND f.semester_id = semester_results.semester_id
                       AND a.teacher_id = ?)",
            );
            args.push(id.clone());
        }
        ReadScope::OwnPublished(id) => {
            if id != student_id {
                return Err(EngineError::Authorization {
                    actor_id: id.clone(),
                    role: Role::Student,
                    action: format!("view semester results of {student_id}"),
                    allowed: vec![Role::Teacher, Role::Hod, Role::Principal, Role::Admin],
                });
            }
            sql.push_str(
                " AND NOT EXISTS (SELECT 1 FROM final_marks f
                     WHERE f.student_id = semester_results.student_id
                       AND f.semester_id = semester_results.semester_id
                       AND f.status <> ?)",
            );
            args.push(FinalStatus::Published.as_str().to_string());
        }
    }
    sql.push_str(" ORDER BY seq");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), |r| {
            Ok(SemesterResult {
                semester_id: r.get(0)?,
                seq: r.get(1)?,
                sgpa: r.get(2)?,
                credits: r.get(3)?,
                cgpa: r.get(4)?,
                computed_at: r.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Re-examination marks for a failed subject.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacklogClearance {
    pub student_id: String,
    pub subject_id: String,
    /// Semester the subject was originally failed in.
    pub semester_id: String,
    pub cleared_in_semester_id: String,
    pub internal_1: f64,
    pub internal_2: f64,
    pub external: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BacklogOutcome {
    pub final_mark: FinalMark,
    pub previous_grade: String,
    pub rollup: StudentRollup,
}

fn semester_seq(conn: &Connection, id: &str) -> Result<i64, EngineError> {
    conn.query_row("SELECT seq FROM semesters WHERE id = ?", [id], |r| r.get(0))
        .optional()?
        .ok_or_else(|| EngineError::not_found("semester", id))
}

/// Overwrites the original semester's failed FinalMark with the cleared
/// result, then re-derives SGPA/CGPA from the full history. One unit of work.
pub fn clear_backlog(
    conn: &Connection,
    actor: &Actor,
    input: &BacklogClearance,
    now: DateTime<Utc>,
) -> Result<BacklogOutcome, EngineError> {
    let subject = catalog::load_subject(conn, &input.subject_id)?;
    workflow::authorize_action(
        actor,
        FREEZERS,
        &subject.department_id,
        &format!("clear backlog in {}", subject.code),
    )?;
    let original_seq = semester_seq(conn, &input.semester_id)?;
    let cleared_seq = semester_seq(conn, &input.cleared_in_semester_id)?;
    if cleared_seq <= original_seq {
        return Err(EngineError::validation(
            "clearedInSemesterId",
            "a backlog is cleared in a later semester than it was failed in",
        ));
    }

    let tx = conn.unchecked_transaction()?;
    let Some(existing) = find_final(&tx, &input.student_id, &input.subject_id, &input.semester_id)? else {
        return Err(EngineError::not_found(
            "final mark",
            format!("{}/{}/{}", input.student_id, input.subject_id, input.semester_id),
        ));
    };
    if !existing.status.is_snapshot() {
        return Err(EngineError::validation(
            "semesterId",
            "only a frozen or published FinalMark can carry a backlog",
        ));
    }
    if existing.passed {
        return Err(EngineError::validation(
            "subjectId",
            format!("{} was passed with grade {}; there is no backlog", subject.code, existing.grade),
        ));
    }

    let settings = settings::load(&tx, &subject.department_id)?;
    let result = aggregate(
        input.internal_1,
        input.internal_2,
        input.external,
        settings.method()?,
        &subject.scheme,
        &settings.grades()?,
    )?;
    tx.execute(
        "UPDATE final_marks SET internal_1 = ?, internal_2 = ?, best_internal = ?, external = ?, total = ?, percentage = ?,
                grade = ?, grade_point = ?, passed = ?, method = ?, backlog_cleared_in = ?, computed_at = ?
         WHERE id = ?",
        rusqlite::params![
            result.internal_1,
            result.internal_2,
            result.best_internal,
            result.external,
            result.total,
            result.percentage,
            result.grade,
            result.grade_point,
            result.passed,
            settings.internal_method,
            input.cleared_in_semester_id,
            ts(now),
            existing.id
        ],
    )?;
    audit::append(
        &tx,
        &NewAuditEntry {
            mark_record_id: audit::final_mark_subject(&existing.id),
            actor_id: actor.id.clone(),
            field: "final_mark.grade".to_string(),
            old_value: Some(existing.grade.clone()),
            new_value: Some(result.grade.clone()),
            reason: Some(format!("backlog cleared in {}", input.cleared_in_semester_id)),
            timestamp: now,
        },
    )?;
    let rollup = write_rollup(&tx, &input.student_id, now)?;
    let final_mark = find_final(&tx, &input.student_id, &input.subject_id, &input.semester_id)?
        .ok_or_else(|| EngineError::Storage("final mark vanished during backlog clearance".into()))?;
    tx.commit()?;

    tracing::info!(
        student_id = %input.student_id,
        subject_id = %input.subject_id,
        from = %existing.grade,
        to = %final_mark.grade,
        "backlog cleared"
    );
    Ok(BacklogOutcome {
        final_mark,
        previous_grade: existing.grade,
        rollup,
    })
}
