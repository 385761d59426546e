use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectGrade {
    pub subject_id: String,
    pub credits: f64,
    pub grade_point: f64,
    #[serde(default)]
    pub grade: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemesterGpa {
    pub semester_id: String,
    pub seq: i64,
    pub sgpa: f64,
    pub credits: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupRow {
    pub semester_id: String,
    pub seq: i64,
    pub sgpa: f64,
    pub credits: f64,
    pub cgpa: f64,
    pub subjects: Vec<SubjectGrade>,
}

fn check_grade(g: &SubjectGrade) -> Result<(), EngineError> {
    if !g.credits.is_finite() || g.credits < 0.0 {
        return Err(EngineError::validation(
            "credits",
            format!("subject {} has invalid credits {}", g.subject_id, g.credits),
        ));
    }
    if !g.grade_point.is_finite() || g.grade_point < 0.0 {
        return Err(EngineError::validation(
            "gradePoint",
            format!("subject {} has invalid grade point {}", g.subject_id, g.grade_point),
        ));
    }
    Ok(())
}

/// Σ(grade_point × credits) / Σ(credits). Failed subjects are included with
/// their fail grade point.
pub fn sgpa(subjects: &[SubjectGrade]) -> Result<f64, EngineError> {
    let mut weighted = 0.0_f64;
    let mut credits = 0.0_f64;
    for g in subjects {
        check_grade(g)?;
        weighted += g.grade_point * g.credits;
        credits += g.credits;
    }
    if credits <= 0.0 {
        return Err(EngineError::insufficient(
            "sgpa",
            "no finalized subjects with credits in this semester",
        ));
    }
    Ok(weighted / credits)
}

/// Credit-weighted mean of semester GPAs (not a plain mean of SGPAs).
pub fn cgpa(semesters: &[SemesterGpa]) -> Result<f64, EngineError> {
    let mut weighted = 0.0_f64;
    let mut credits = 0.0_f64;
    for s in semesters {
        if !s.credits.is_finite() || s.credits < 0.0 || !s.sgpa.is_finite() {
            return Err(EngineError::validation(
                "semesters",
                format!("semester {} has invalid sgpa/credits", s.semester_id),
            ));
        }
        weighted += s.sgpa * s.credits;
        credits += s.credits;
    }
    if credits <= 0.0 {
        return Err(EngineError::insufficient("cgpa", "no semesters with credits"));
    }
    Ok(weighted / credits)
}

/// One semester's subject entries as they currently stand (backlog
/// clearances already written over the original entry).
#[derive(Debug, Clone, PartialEq)]
pub struct SemesterHistory {
    pub semester_id: String,
    pub seq: i64,
    pub subjects: Vec<SubjectGrade>,
}

/// Re-derives every semester's SGPA and running CGPA from the full history,
/// in `seq` order. Pure: the same history always yields the same rows.
pub fn rollup(history: &[SemesterHistory]) -> Result<Vec<RollupRow>, EngineError> {
    let mut by_seq: BTreeMap<i64, &SemesterHistory> = BTreeMap::new();
    for h in history {
        if by_seq.insert(h.seq, h).is_some() {
            return Err(EngineError::validation(
                "semesters",
                format!("duplicate semester sequence {}", h.seq),
            ));
        }
    }

    let mut done: Vec<SemesterGpa> = Vec::with_capacity(by_seq.len());
    let mut rows = Vec::with_capacity(by_seq.len());
    for h in by_seq.values() {
        let semester_sgpa = sgpa(&h.subjects)?;
        let credits: f64 = h.subjects.iter().map(|s| s.credits).sum();
        done.push(SemesterGpa {
            semester_id: h.semester_id.clone(),
            seq: h.seq,
            sgpa: semester_sgpa,
            credits,
        });
        rows.push(RollupRow {
            semester_id: h.semester_id.clone(),
            seq: h.seq,
            sgpa: semester_sgpa,
            credits,
            cgpa: cgpa(&done)?,
            subjects: h.subjects.clone(),
        });
    }
    Ok(rows)
}
