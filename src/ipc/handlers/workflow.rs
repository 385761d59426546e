use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::catalog::Component;
use crate::error::EngineError;
use crate::ipc::error::{err, error_object};
use crate::ipc::helpers::{actor, db, fail, field, optional_field, respond, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::outcomes;
use crate::records;
use crate::results;
use crate::workflow::{WorkflowEvent, WorkflowState};

fn parse_event(req: &Request) -> Result<WorkflowEvent, Value> {
    let raw: String = field(req, "event")?;
    WorkflowEvent::parse(&raw).ok_or_else(|| {
        err(&req.id, "bad_params", format!("unknown event: {raw}"), None)
    })
}

fn feeds_results(to: WorkflowState) -> bool {
    matches!(
        to,
        WorkflowState::Approved | WorkflowState::Frozen | WorkflowState::Published
    )
}

/// Re-derives what depends on a component's finalized records. Failures are
/// returned as data so the transition that triggered them still succeeds.
pub(super) fn refresh_derived(conn: &Connection, component: &Component, now: DateTime<Utc>) -> Value {
    let final_marks = match results::refresh_for_component(conn, &component.id, now) {
        Ok(summary) => json!({ "ok": true, "summary": summary }),
        Err(e) => {
            tracing::warn!(component_id = %component.id, error = %e, "final mark refresh failed");
            json!({ "ok": false, "error": error_object(&e) })
        }
    };
    let attainment = match outcomes::attainment_report(conn, &component.assignment_id, now) {
        Ok(report) => json!({ "ok": true, "report": report }),
        Err(e @ EngineError::InsufficientData { .. }) => {
            tracing::debug!(assignment_id = %component.assignment_id, error = %e, "attainment not ready");
            json!({ "ok": false, "error": error_object(&e) })
        }
        Err(e) => {
            tracing::warn!(assignment_id = %component.assignment_id, error = %e, "attainment refresh failed");
            json!({ "ok": false, "error": error_object(&e) })
        }
    };
    json!({ "finalMarks": final_marks, "attainment": attainment })
}

fn workflow_transition(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db(state, req)?;
    let actor = actor(req)?;
    let record_id: String = field(req, "markRecordId")?;
    let event = parse_event(req)?;
    let reason: Option<String> = optional_field(req, "reason")?;
    let expected_version: Option<i64> = optional_field(req, "expectedVersion")?;
    let now = Utc::now();

    let (outcome, component) = records::transition(
        conn,
        &actor,
        &record_id,
        event,
        reason.as_deref(),
        expected_version,
        now,
    )
    .map_err(fail(req))?;

    let derived = if feeds_results(outcome.to) {
        Some(refresh_derived(conn, &component, now))
    } else {
        None
    };
    let mut out = json!(outcome);
    out["derived"] = json!(derived);
    Ok(out)
}

fn workflow_bulk_transition(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db(state, req)?;
    let actor = actor(req)?;
    let event = parse_event(req)?;
    let reason: Option<String> = optional_field(req, "reason")?;
    let record_ids: Vec<String> = field(req, "markRecordIds")?;
    let now = Utc::now();

    let mut rows = Vec::with_capacity(record_ids.len());
    let mut touched: BTreeMap<String, Component> = BTreeMap::new();
    for (i, record_id) in record_ids.iter().enumerate() {
        match records::transition(conn, &actor, record_id, event, reason.as_deref(), None, now) {
            Ok((outcome, component)) => {
                if feeds_results(outcome.to) {
                    touched.entry(component.id.clone()).or_insert(component);
                }
                rows.push(json!({
                    "row": i,
                    "ok": true,
                    "recordId": record_id,
                    "state": outcome.to,
                    "version": outcome.record.version,
                }));
            }
            Err(e) => {
                tracing::warn!(row = i, record_id = %record_id, code = e.code(), error = %e, "bulk transition row rejected");
                rows.push(json!({
                    "row": i,
                    "ok": false,
                    "recordId": record_id,
                    "error": error_object(&e),
                }));
            }
        }
    }

    let derived: Vec<Value> = touched
        .values()
        .map(|c| {
            let mut d = refresh_derived(conn, c, now);
            d["componentId"] = json!(c.id);
            d
        })
        .collect();
    Ok(json!({ "rows": rows, "derived": derived }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "workflow.transition" => workflow_transition(state, req),
        "workflow.bulkTransition" => workflow_bulk_transition(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
