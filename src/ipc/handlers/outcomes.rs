use chrono::Utc;
use serde_json::{json, Value};

use crate::ipc::helpers::{actor, db, fail, field, params, respond, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::outcomes::{self, CoDefinition, MappingInput, PoDefinition};

fn define_co(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db(state, req)?;
    let def: CoDefinition = params(req)?;
    let id = outcomes::define_co(conn, &def).map_err(fail(req))?;
    Ok(json!({ "coId": id, "code": def.code }))
}

fn define_po(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db(state, req)?;
    let def: PoDefinition = params(req)?;
    let id = outcomes::define_po(conn, &def).map_err(fail(req))?;
    Ok(json!({ "poId": id, "code": def.code }))
}

fn map(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db(state, req)?;
    let actor = actor(req)?;
    let input: MappingInput = params(req)?;
    outcomes::map_co_po(conn, &actor, &input).map_err(fail(req))?;
    Ok(json!({
        "coCode": input.co_code,
        "poCode": input.po_code,
        "strength": input.strength,
    }))
}

fn report(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db(state, req)?;
    let assignment_id: String = field(req, "subjectAssignmentId")?;
    let report = outcomes::attainment_report(conn, &assignment_id, Utc::now()).map_err(fail(req))?;
    Ok(json!(report))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "outcomes.defineCo" => define_co(state, req),
        "outcomes.definePo" => define_po(state, req),
        "outcomes.map" => map(state, req),
        "attainment.report" => report(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
