use serde_json::{json, Value};

use crate::catalog::{self, Assignment, ComponentInput, Semester, Subject};
use crate::ipc::helpers::{db, fail, field, params, respond, HandlerResult};
use crate::ipc::types::{AppState, Request};

fn semesters_upsert(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db(state, req)?;
    let s: Semester = params(req)?;
    catalog::upsert_semester(conn, &s).map_err(fail(req))?;
    Ok(json!({ "semesterId": s.id }))
}

fn subjects_upsert(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db(state, req)?;
    let s: Subject = params(req)?;
    catalog::upsert_subject(conn, &s).map_err(fail(req))?;
    Ok(json!({ "subjectId": s.id }))
}

fn assignments_upsert(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db(state, req)?;
    let a: Assignment = params(req)?;
    catalog::upsert_assignment(conn, &a).map_err(fail(req))?;
    Ok(json!({ "subjectAssignmentId": a.id }))
}

fn components_upsert(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db(state, req)?;
    let input: ComponentInput = params(req)?;
    let summary = catalog::upsert_component(conn, &input).map_err(fail(req))?;
    tracing::info!(
        component_id = %summary.id,
        kind = summary.kind.as_str(),
        questions = summary.question_count,
        "question paper saved"
    );
    Ok(json!(summary))
}

fn components_lock(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db(state, req)?;
    let component_id: String = field(req, "componentId")?;
    let changed = catalog::lock_component(conn, &component_id).map_err(fail(req))?;
    Ok(json!({ "componentId": component_id, "locked": true, "changed": changed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "semesters.upsert" => semesters_upsert(state, req),
        "subjects.upsert" => subjects_upsert(state, req),
        "assignments.upsert" => assignments_upsert(state, req),
        "components.upsert" => components_upsert(state, req),
        "components.lock" => components_lock(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
