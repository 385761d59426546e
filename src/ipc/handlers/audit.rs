use serde_json::{json, Value};

use crate::audit;
use crate::ipc::helpers::{db, fail, field, respond, HandlerResult};
use crate::ipc::types::{AppState, Request};

fn audit_list(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db(state, req)?;
    let record_id: String = field(req, "markRecordId")?;
    let entries = audit::list_for_record(conn, &record_id).map_err(fail(req))?;
    Ok(json!({ "markRecordId": record_id, "entries": entries }))
}

fn audit_verify(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db(state, req)?;
    let report = audit::verify_chain(conn).map_err(fail(req))?;
    if !report.intact {
        tracing::error!(first_broken_seq = ?report.first_broken_seq, "audit chain broken");
    }
    Ok(json!(report))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "audit.list" => audit_list(state, req),
        "audit.verify" => audit_verify(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
