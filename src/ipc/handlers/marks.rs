use chrono::Utc;
use serde_json::{json, Value};
use std::collections::BTreeSet;

use super::workflow::refresh_derived;
use crate::catalog;
use crate::error::EngineError;
use crate::ipc::error::error_object;
use crate::ipc::helpers::{actor, db, fail, field, params, respond, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::records::{self, RecordFilter, ScoreInput};
use crate::workflow;

fn marks_enter(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db(state, req)?;
    let actor = actor(req)?;
    let input: ScoreInput = params(req)?;
    let now = Utc::now();
    let outcome = records::enter_score(conn, &actor, &input, now).map_err(fail(req))?;
    // Overrides on finalized records move the totals FinalMark was built from.
    let derived = if outcome.changed && outcome.record.state.is_finalized() {
        let component = catalog::load_component(conn, &outcome.record.component_id).map_err(fail(req))?;
        Some(refresh_derived(conn, &component, now))
    } else {
        None
    };
    let mut out = json!(outcome);
    out["derived"] = json!(derived);
    Ok(out)
}

/// Each row commits or fails on its own; one bad score never blocks the rest
/// of the sheet.
fn marks_bulk_enter(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db(state, req)?;
    let actor = actor(req)?;
    let rows: Vec<Value> = field(req, "rows")?;
    let now = Utc::now();

    let mut results = Vec::with_capacity(rows.len());
    let mut failed = 0usize;
    let mut touched: BTreeSet<String> = BTreeSet::new();
    for (i, row) in rows.into_iter().enumerate() {
        let outcome = serde_json::from_value::<ScoreInput>(row)
            .map_err(|e| EngineError::validation("row", e.to_string()))
            .and_then(|input| records::enter_score(conn, &actor, &input, now));
        match outcome {
            Ok(o) => {
                if o.changed && o.record.state.is_finalized() {
                    touched.insert(o.record.component_id.clone());
                }
                results.push(json!({
                    "row": i,
                    "ok": true,
                    "recordId": o.record.id,
                    "changed": o.changed,
                    "version": o.record.version,
                    "total": o.record.computed_total,
                }));
            }
            Err(e) => {
                failed += 1;
                tracing::warn!(row = i, code = e.code(), error = %e, "bulk score row rejected");
                results.push(json!({ "row": i, "ok": false, "error": error_object(&e) }));
            }
        }
    }

    let mut derived = Vec::with_capacity(touched.len());
    for component_id in &touched {
        let component = catalog::load_component(conn, component_id).map_err(fail(req))?;
        let mut d = refresh_derived(conn, &component, now);
        d["componentId"] = json!(component.id);
        derived.push(d);
    }
    Ok(json!({
        "rows": results,
        "accepted": results.len() - failed,
        "rejected": failed,
        "derived": derived,
    }))
}

fn marks_get(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db(state, req)?;
    let actor = actor(req)?;
    let record_id: String = field(req, "markRecordId")?;
    let view = records::view(conn, &actor, &record_id).map_err(fail(req))?;
    Ok(json!(view))
}

fn marks_list(state: &AppState, req: &Request) -> HandlerResult {
    let conn = db(state, req)?;
    let scope = workflow::read_scope(&actor(req)?).map_err(fail(req))?;
    let filter: RecordFilter = params(req)?;
    let rows = records::list(conn, &scope, &filter).map_err(fail(req))?;
    Ok(json!({ "records": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "marks.enter" => marks_enter(state, req),
        "marks.bulkEnter" => marks_bulk_enter(state, req),
        "marks.get" => marks_get(state, req),
        "marks.list" => marks_list(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
