use serde_json::{json, Map, Value};

use crate::ipc::helpers::{db, fail, field, respond, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::settings;

fn setup_get(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db(state, req)?;
    let department_id: String = field(req, "departmentId")?;
    let current = settings::load(conn, &department_id).map_err(fail(req))?;
    Ok(json!({ "departmentId": department_id, "settings": current }))
}

fn setup_update(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db(state, req)?;
    let department_id: String = field(req, "departmentId")?;
    let patch: Map<String, Value> = field(req, "patch")?;
    let next = settings::update(conn, &department_id, &patch).map_err(fail(req))?;
    tracing::info!(department_id = %department_id, keys = patch.len(), "department settings updated");
    Ok(json!({ "departmentId": department_id, "settings": next }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "setup.get" => setup_get(state, req),
        "setup.update" => setup_update(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
