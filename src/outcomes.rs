//! Course/program outcome definitions, the CO→PO edge list, and the
//! attainment report with its cached `attainment_records` rows.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::attainment::{self, CoPoMapping, CoReport, CohortRecord, CourseOutcome, PoAttainment};
use crate::catalog;
use crate::error::EngineError;
use crate::records;
use crate::settings;
use crate::workflow::{self, Actor, REVIEWERS};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoDefinition {
    pub subject_id: String,
    pub code: String,
    #[serde(default)]
    pub description: String,
    pub target_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoDefinition {
    pub department_id: String,
    pub code: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingInput {
    pub subject_id: String,
    pub co_code: String,
    pub po_code: String,
    pub strength: u8,
}

fn require_code(code: &str) -> Result<(), EngineError> {
    if code.trim().is_empty() {
        return Err(EngineError::validation("code", "must not be empty"));
    }
    Ok(())
}

pub fn define_co(conn: &Connection, def: &CoDefinition) -> Result<String, EngineError> {
    require_code(&def.code)?;
    if !def.target_pct.is_finite() || !(0.0..=100.0).contains(&def.target_pct) {
        return Err(EngineError::validation("targetPct", "must be in 0..=100"));
    }
    catalog::load_subject(conn, &def.subject_id)?;
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM course_outcomes WHERE subject_id = ? AND code = ?",
            (&def.subject_id, &def.code),
            |r| r.get(0),
        )
        .optional()?;
    let id = existing.unwrap_or_else(|| Uuid::new_v4().to_string());
    conn.execute(
        "INSERT INTO course_outcomes(id, subject_id, code, description, target_pct) VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET description = excluded.description, target_pct = excluded.target_pct",
        (&id, &def.subject_id, &def.code, &def.description, def.target_pct),
    )?;
    Ok(id)
}

pub fn define_po(conn: &Connection, def: &PoDefinition) -> Result<String, EngineError> {
    require_code(&def.code)?;
    if def.department_id.trim().is_empty() {
        return Err(EngineError::validation("departmentId", "must not be empty"));
    }
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM program_outcomes WHERE department_id = ? AND code = ?",
            (&def.department_id, &def.code),
            |r| r.get(0),
        )
        .optional()?;
    let id = existing.unwrap_or_else(|| Uuid::new_v4().to_string());
    conn.execute(
        "INSERT INTO program_outcomes(id, department_id, code, description) VALUES(?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET description = excluded.description",
        (&id, &def.department_id, &def.code, &def.description),
    )?;
    Ok(id)
}

/// Adds or re-weights one CO→PO edge. Authored by HOD (own department),
/// Principal or Admin.
pub fn map_co_po(conn: &Connection, actor: &Actor, input: &MappingInput) -> Result<(), EngineError> {
    if !(1..=3).contains(&input.strength) {
        return Err(EngineError::validation("strength", "must be 1, 2 or 3"));
    }
    let subject = catalog::load_subject(conn, &input.subject_id)?;
    workflow::authorize_action(
        actor,
        REVIEWERS,
        &subject.department_id,
        &format!("map {} to {}", input.co_code, input.po_code),
    )?;
    let co_id: String = conn
        .query_row(
            "SELECT id FROM course_outcomes WHERE subject_id = ? AND code = ?",
            (&input.subject_id, &input.co_code),
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| EngineError::not_found("course outcome", input.co_code.clone()))?;
    let po_id: String = conn
        .query_row(
            "SELECT id FROM program_outcomes WHERE department_id = ? AND code = ?",
            (&subject.department_id, &input.po_code),
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| EngineError::not_found("program outcome", input.po_code.clone()))?;
    conn.execute(
        "INSERT INTO co_po_mappings(co_id, po_id, strength) VALUES(?, ?, ?)
         ON CONFLICT(co_id, po_id) DO UPDATE SET strength = excluded.strength",
        (&co_id, &po_id, input.strength),
    )?;
    Ok(())
}

fn course_outcomes(conn: &Connection, subject_id: &str) -> Result<Vec<CourseOutcome>, EngineError> {
    let mut stmt =
        conn.prepare("SELECT code, target_pct FROM course_outcomes WHERE subject_id = ? ORDER BY code")?;
    let rows = stmt
        .query_map([subject_id], |r| {
            Ok(CourseOutcome {
                code: r.get(0)?,
                target_pct: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn mappings(conn: &Connection, subject_id: &str) -> Result<Vec<CoPoMapping>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT co.code, po.code, m.strength
         FROM co_po_mappings m
         JOIN course_outcomes co ON co.id = m.co_id
         JOIN program_outcomes po ON po.id = m.po_id
         WHERE co.subject_id = ?
         ORDER BY po.code, co.code",
    )?;
    let rows = stmt
        .query_map([subject_id], |r| {
            Ok(CoPoMapping {
                co_code: r.get(0)?,
                po_code: r.get(1)?,
                strength: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Every student record on every component of one teaching assignment.
fn cohort(conn: &Connection, assignment_id: &str) -> Result<Vec<CohortRecord>, EngineError> {
    let mut stmt = conn.prepare("SELECT id FROM components WHERE assignment_id = ? ORDER BY id")?;
    let component_ids = stmt
        .query_map([assignment_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::new();
    for component_id in component_ids {
        let questions = catalog::load_questions(conn, &component_id)?.questions;
        for rec in records::for_component(conn, &component_id)? {
            let scores = records::load_scores(conn, &rec.id, &rec.student_id)?;
            out.push(CohortRecord {
                student_id: rec.student_id,
                state: rec.state,
                questions: questions.clone(),
                scores,
            });
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttainmentReport {
    pub assignment_id: String,
    pub subject_id: String,
    pub cohort: String,
    pub co: CoReport,
    pub po: Vec<PoAttainment>,
    pub po_target_pct: f64,
}

fn cohort_key(assignment_id: &str) -> String {
    format!("assignment:{assignment_id}")
}

/// CO and PO attainment for one subject taught to one class, over the
/// records that are Approved or later. The cached rows for the cohort are
/// dropped and rebuilt on every call.
pub fn attainment_report(
    conn: &Connection,
    assignment_id: &str,
    now: DateTime<Utc>,
) -> Result<AttainmentReport, EngineError> {
    let assignment = catalog::load_assignment(conn, assignment_id)?;
    let subject = catalog::load_subject(conn, &assignment.subject_id)?;
    let settings = settings::load(conn, &subject.department_id)?;
    let outcomes = course_outcomes(conn, &subject.id)?;
    if outcomes.is_empty() {
        return Err(EngineError::insufficient(
            "co_attainment",
            format!("subject {} has no course outcomes defined", subject.code),
        ));
    }

    let records = cohort(conn, assignment_id)?;
    let co = attainment::co_attainment(&outcomes, &records)?;
    let po = attainment::po_attainment(&co.outcomes, &mappings(conn, &subject.id)?, settings.po_target_pct)?;

    let cohort_name = cohort_key(assignment_id);
    let at = now.to_rfc3339_opts(SecondsFormat::Millis, true);
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM attainment_records WHERE cohort = ?", [&cohort_name])?;
    let rows = co
        .outcomes
        .iter()
        .map(|c| ("co", c.co_code.as_str(), c.percentage, c.threshold_met))
        .chain(po.iter().map(|p| ("po", p.po_code.as_str(), p.percentage, p.threshold_met)));
    for (kind, code, percentage, met) in rows {
        tx.execute(
            "INSERT INTO attainment_records(id, scope_kind, scope_code, cohort, percentage, threshold_met, cohort_size_used, cohort_size_total, computed_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                kind,
                code,
                cohort_name,
                percentage,
                met,
                co.cohort_size_used as i64,
                co.cohort_size_total as i64,
                at
            ],
        )?;
    }
    tx.commit()?;

    tracing::info!(
        assignment_id,
        used = co.cohort_size_used,
        total = co.cohort_size_total,
        unmeasured = co.unmeasured.len(),
        "attainment recomputed"
    );

    Ok(AttainmentReport {
        assignment_id: assignment_id.to_string(),
        subject_id: subject.id,
        cohort: cohort_name,
        co,
        po,
        po_target_pct: settings.po_target_pct,
    })
}
