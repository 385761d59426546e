use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::error::{engine_err, err, ok};
use super::types::{AppState, Request};
use crate::error::EngineError;
use crate::workflow::Actor;

/// Handler bodies return `Err(response)` for early exits so they can use `?`.
pub type HandlerResult = Result<Value, Value>;

pub fn respond(req: &Request, result: HandlerResult) -> Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(resp) => resp,
    }
}

pub fn db<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn params<T: DeserializeOwned>(req: &Request) -> Result<T, Value> {
    serde_json::from_value(req.params.clone())
        .map_err(|e| err(&req.id, "bad_params", format!("invalid params: {e}"), None))
}

pub fn field<T: DeserializeOwned>(req: &Request, key: &str) -> Result<T, Value> {
    let Some(v) = req.params.get(key) else {
        return Err(err(&req.id, "bad_params", format!("missing params.{key}"), None));
    };
    serde_json::from_value(v.clone())
        .map_err(|e| err(&req.id, "bad_params", format!("invalid params.{key}: {e}"), None))
}

pub fn optional_field<T: DeserializeOwned>(req: &Request, key: &str) -> Result<Option<T>, Value> {
    match req.params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => field(req, key).map(Some),
    }
}

pub fn actor(req: &Request) -> Result<Actor, Value> {
    field(req, "actor")
}

/// Maps an engine failure onto the response envelope: `.map_err(fail(req))?`.
pub fn fail(req: &Request) -> impl Fn(EngineError) -> Value + '_ {
    move |e| engine_err(&req.id, &e)
}
