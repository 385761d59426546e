use chrono::Utc;
use serde_json::{json, Value};

use crate::ipc::error::error_object;
use crate::ipc::helpers::{actor, db, fail, field, optional_field, params, respond, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::results::{self, BacklogClearance, FinalMarkFilter};
use crate::workflow;

fn final_marks_recompute(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db(state, req)?;
    let subject_id: String = field(req, "subjectId")?;
    let semester_id: String = field(req, "semesterId")?;
    let summary =
        results::recompute_final_marks(conn, &subject_id, &semester_id, Utc::now()).map_err(fail(req))?;
    Ok(json!(summary))
}

fn final_marks_freeze(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db(state, req)?;
    let actor = actor(req)?;
    let subject_id: String = field(req, "subjectId")?;
    let semester_id: String = field(req, "semesterId")?;
    let frozen = results::freeze_final_marks(conn, &actor, &subject_id, &semester_id, Utc::now())
        .map_err(fail(req))?;
    Ok(json!({ "frozen": frozen }))
}

fn final_marks_publish(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db(state, req)?;
    let actor = actor(req)?;
    let subject_id: String = field(req, "subjectId")?;
    let semester_id: String = field(req, "semesterId")?;
    let published = results::publish_final_marks(conn, &actor, &subject_id, &semester_id, Utc::now())
        .map_err(fail(req))?;
    Ok(json!({ "published": published }))
}

fn final_marks_get(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db(state, req)?;
    let scope = workflow::read_scope(&actor(req)?).map_err(fail(req))?;
    let filter: FinalMarkFilter = params(req)?;
    let rows = results::list_final_marks(conn, &scope, &filter).map_err(fail(req))?;
    Ok(json!({ "finalMarks": rows }))
}

/// One student when `studentId` is given, otherwise everyone with a
/// FinalMark; per-student failures are reported alongside the successes.
fn semester_results_recompute(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db(state, req)?;
    let now = Utc::now();
    if let Some(student_id) = optional_field::<String>(req, "studentId")? {
        let rollup = results::recompute_semester_results(conn, &student_id, now).map_err(fail(req))?;
        return Ok(json!(rollup));
    }

    let students = results::students_with_final_marks(conn).map_err(fail(req))?;
    let mut out = Vec::with_capacity(students.len());
    for student_id in students {
        match results::recompute_semester_results(conn, &student_id, now) {
            Ok(rollup) => out.push(json!({ "studentId": student_id, "ok": true, "rollup": rollup })),
            Err(e) => {
                tracing::warn!(student_id = %student_id, error = %e, "semester rollup failed");
                out.push(json!({ "studentId": student_id, "ok": false, "error": error_object(&e) }));
            }
        }
    }
    Ok(json!({ "students": out }))
}

fn semester_results_get(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db(state, req)?;
    let scope = workflow::read_scope(&actor(req)?).map_err(fail(req))?;
    let student_id: String = field(req, "studentId")?;
    let rows = results::semester_results(conn, &scope, &student_id).map_err(fail(req))?;
    Ok(json!({ "studentId": student_id, "semesters": rows }))
}

fn backlogs_clear(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db(state, req)?;
    let actor = actor(req)?;
    let input: BacklogClearance = params(req)?;
    let outcome = results::clear_backlog(conn, &actor, &input, Utc::now()).map_err(fail(req))?;
    Ok(json!(outcome))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "finalMarks.recompute" => final_marks_recompute(state, req),
        "finalMarks.freeze" => final_marks_freeze(state, req),
        "finalMarks.publish" => final_marks_publish(state, req),
        "finalMarks.get" => final_marks_get(state, req),
        "semesterResults.recompute" => semester_results_recompute(state, req),
        "semesterResults.get" => semester_results_get(state, req),
        "backlogs.clear" => backlogs_clear(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
