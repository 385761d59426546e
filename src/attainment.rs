use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::calc::compute_total;
use crate::error::EngineError;
use crate::scoring::{Question, RawAnswerScore};
use crate::workflow::WorkflowState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseOutcome {
    pub code: String,
    pub target_pct: f64,
}

/// One CO→PO edge with correlation strength 1 (low) to 3 (high).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoPoMapping {
    pub co_code: String,
    pub po_code: String,
    pub strength: u8,
}

/// A student's mark record on one component, as seen by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct CohortRecord {
    pub student_id: String,
    pub state: WorkflowState,
    pub questions: Vec<Question>,
    pub scores: Vec<RawAnswerScore>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoAttainment {
    pub co_code: String,
    pub obtained: f64,
    pub max: f64,
    pub percentage: f64,
    pub target_pct: f64,
    pub threshold_met: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoReport {
    pub outcomes: Vec<CoAttainment>,
    /// COs with no tagged questions in any finalized record.
    pub unmeasured: Vec<String>,
    pub cohort_size_used: usize,
    pub cohort_size_total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoAttainment {
    pub po_code: String,
    pub percentage: f64,
    pub threshold_met: bool,
    pub contributing: Vec<String>,
}

/// CO attainment % = Σ obtained / Σ max over questions tagged with the CO,
/// across students whose record is Approved or later. Records still in
/// Draft/Submitted/Rejected are left out and reflected in the cohort sizes.
pub fn co_attainment(
    outcomes: &[CourseOutcome],
    records: &[CohortRecord],
) -> Result<CoReport, EngineError> {
    let all_students: BTreeSet<&str> = records.iter().map(|r| r.student_id.as_str()).collect();
    let finalized: Vec<&CohortRecord> = records.iter().filter(|r| r.state.is_finalized()).collect();
    let used_students: BTreeSet<&str> = finalized.iter().map(|r| r.student_id.as_str()).collect();

    if used_students.is_empty() {
        return Err(EngineError::insufficient(
            "co_attainment",
            format!(
                "none of {} students have an approved mark record yet",
                all_students.len()
            ),
        ));
    }

    let mut sums: BTreeMap<&str, (f64, f64)> = BTreeMap::new();
    for rec in &finalized {
        for q in &rec.questions {
            if q.co_tags.is_empty() {
                continue;
            }
            let t = compute_total(q, &rec.scores);
            for co in &q.co_tags {
                let entry = sums.entry(co.as_str()).or_insert((0.0, 0.0));
                entry.0 += t.total;
                entry.1 += q.effective_max();
            }
        }
    }

    let mut out = Vec::new();
    let mut unmeasured = Vec::new();
    for co in outcomes {
        match sums.get(co.code.as_str()) {
            Some((obtained, max)) if *max > 0.0 => {
                let percentage = (100.0 * obtained / max).clamp(0.0, 100.0);
                out.push(CoAttainment {
                    co_code: co.code.clone(),
                    obtained: *obtained,
                    max: *max,
                    percentage,
                    target_pct: co.target_pct,
                    threshold_met: percentage >= co.target_pct,
                });
            }
            _ => unmeasured.push(co.code.clone()),
        }
    }

    Ok(CoReport {
        outcomes: out,
        unmeasured,
        cohort_size_used: used_students.len(),
        cohort_size_total: all_students.len(),
    })
}

/// PO % = Σ(strength × CO %) / Σ strength over the mappings into that PO
/// whose CO was measured.
pub fn po_attainment(
    cos: &[CoAttainment],
    mappings: &[CoPoMapping],
    po_target_pct: f64,
) -> Result<Vec<PoAttainment>, EngineError> {
    let by_code: BTreeMap<&str, f64> = cos.iter().map(|c| (c.co_code.as_str(), c.percentage)).collect();

    let mut acc: BTreeMap<&str, (f64, f64, Vec<String>)> = BTreeMap::new();
    for m in mappings {
        if !(1..=3).contains(&m.strength) {
            return Err(EngineError::validation(
                "strength",
                format!("{}→{} strength must be 1, 2 or 3", m.co_code, m.po_code),
            ));
        }
        let Some(pct) = by_code.get(m.co_code.as_str()) else {
            continue;
        };
        let w = f64::from(m.strength);
        let entry = acc.entry(m.po_code.as_str()).or_insert((0.0, 0.0, Vec::new()));
        entry.0 += w * pct;
        entry.1 += w;
        entry.2.push(m.co_code.clone());
    }

    Ok(acc
        .into_iter()
        .map(|(po, (sum, weight, contributing))| {
            let percentage = sum / weight;
            PoAttainment {
                po_code: po.to_string(),
                percentage,
                threshold_met: percentage >= po_target_pct,
                contributing,
            }
        })
        .collect())
}
