//! Stateless calculators. None of these need a workspace except when
//! `results.aggregate` reads a department's grade table.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::aggregate::{self, GradeTable, InternalMethod, SubjectScheme};
use crate::calc;
use crate::gpa::{self, SemesterGpa, SubjectGrade};
use crate::ipc::helpers::{fail, field, params, respond, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{self, Question, RawAnswerScore};
use crate::settings;

/// Same bounds as score entry: every attempt must lie within `maxMarks`, so an
/// over-max sheet is a `validation_error` here rather than a capped total.
/// Capping still applies to in-range attempts beyond `requiredCount`.
fn compute_total(req: &Request) -> HandlerResult {
    let question: Question = field(req, "question")?;
    let scores: Vec<RawAnswerScore> = field(req, "scores")?;
    scoring::validate_question(&question).map_err(fail(req))?;
    for raw in &scores {
        scoring::validate_score(&question, raw).map_err(fail(req))?;
    }
    Ok(json!(calc::compute_total(&question, &scores)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AggregateParams {
    internal1: f64,
    internal2: f64,
    external: f64,
    scheme: SubjectScheme,
    #[serde(default)]
    method: Option<InternalMethod>,
    #[serde(default)]
    department_id: Option<String>,
}

fn results_aggregate(state: &AppState, req: &Request) -> HandlerResult {
    let p: AggregateParams = params(req)?;
    // Department settings are used when the caller names one and a workspace is open.
    let dept = match (&p.department_id, state.db.as_ref()) {
        (Some(d), Some(conn)) => Some(settings::load(conn, d).map_err(fail(req))?),
        _ => None,
    };
    let method = match (p.method, &dept) {
        (Some(m), _) => m,
        (None, Some(s)) => s.method().map_err(fail(req))?,
        (None, None) => InternalMethod::Best,
    };
    let grades = match &dept {
        Some(s) => s.grades().map_err(fail(req))?,
        None => GradeTable::default(),
    };
    let r = aggregate::aggregate(p.internal1, p.internal2, p.external, method, &p.scheme, &grades)
        .map_err(fail(req))?;
    let display = calc::round_off_1_decimal(r.percentage);
    let mut out = json!(r);
    out["percentageDisplay"] = json!(display);
    Ok(out)
}

fn results_sgpa(req: &Request) -> HandlerResult {
    let subjects: Vec<SubjectGrade> = field(req, "subjects")?;
    let sgpa = gpa::sgpa(&subjects).map_err(fail(req))?;
    let credits: f64 = subjects.iter().map(|s| s.credits).sum();
    Ok(json!({ "sgpa": sgpa, "credits": credits }))
}

fn results_cgpa(req: &Request) -> HandlerResult {
    let semesters: Vec<SemesterGpa> = field(req, "semesters")?;
    let cgpa = gpa::cgpa(&semesters).map_err(fail(req))?;
    Ok(json!({ "cgpa": cgpa }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "calc.computeTotal" => compute_total(req),
        "results.aggregate" => results_aggregate(state, req),
        "results.sgpa" => results_sgpa(req),
        "results.cgpa" => results_cgpa(req),
        _ => return None,
    };
    Some(respond(req, result))
}
