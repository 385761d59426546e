use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::EngineError;

const EPS: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubQuestion {
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub max_marks: f64,
}

/// One exam question, or a group of interchangeable questions when
/// `optional_count > 0` ("answer any 4 of 6"). `max_marks` is the ceiling of
/// a single answered instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: String,
    #[serde(default)]
    pub section: String,
    #[serde(default)]
    pub label: String,
    pub max_marks: f64,
    #[serde(default = "default_required")]
    pub required_count: u32,
    #[serde(default)]
    pub optional_count: u32,
    #[serde(default)]
    pub co_tags: BTreeSet<String>,
    #[serde(default)]
    pub sub_questions: Vec<SubQuestion>,
}

fn default_required() -> u32 {
    1
}

impl Question {
    pub fn has_sub_questions(&self) -> bool {
        !self.sub_questions.is_empty()
    }

    /// Highest total this question can contribute after capping.
    pub fn effective_max(&self) -> f64 {
        if self.has_sub_questions() {
            self.max_marks
        } else {
            self.max_marks * f64::from(self.required_count)
        }
    }

    /// Number of answered instances a student may enter.
    pub fn attempt_slots(&self) -> u32 {
        self.required_count + self.optional_count
    }

    pub fn sub_question(&self, id: &str) -> Option<&SubQuestion> {
        self.sub_questions.iter().find(|s| s.id == id)
    }
}

/// A student's score on one answered instance of a question, or on one
/// sub-question. `attempt` numbers the answered instances from 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAnswerScore {
    #[serde(default)]
    pub student_id: String,
    pub question_id: String,
    #[serde(default)]
    pub sub_question_id: Option<String>,
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    pub score: f64,
}

fn default_attempt() -> u32 {
    1
}

fn check_finite(field: &str, v: f64) -> Result<(), EngineError> {
    if v.is_finite() {
        Ok(())
    } else {
        Err(EngineError::validation(field, "must be a finite number"))
    }
}

/// Authoring-time checks: counts, positive maxima, and sub-question budget.
pub fn validate_question(q: &Question) -> Result<(), EngineError> {
    if q.id.trim().is_empty() {
        return Err(EngineError::validation("question.id", "must not be empty"));
    }
    check_finite("question.maxMarks", q.max_marks)?;
    if q.max_marks <= 0.0 {
        return Err(EngineError::validation(
            "question.maxMarks",
            format!("question {} must have maxMarks > 0", q.id),
        ));
    }
    if q.required_count < 1 {
        return Err(EngineError::validation(
            "question.requiredCount",
            format!("question {} must require at least one answer", q.id),
        ));
    }
    if q.has_sub_questions() && q.optional_count > 0 {
        return Err(EngineError::validation(
            "question.optionalCount",
            format!(
                "question {} cannot combine sub-questions with optional answers",
                q.id
            ),
        ));
    }

    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let mut sub_sum = 0.0_f64;
    for s in &q.sub_questions {
        check_finite("subQuestion.maxMarks", s.max_marks)?;
        if s.max_marks <= 0.0 {
            return Err(EngineError::validation(
                "subQuestion.maxMarks",
                format!("sub-question {} must have maxMarks > 0", s.id),
            ));
        }
        if !seen.insert(s.id.as_str()) {
            return Err(EngineError::validation(
                "subQuestion.id",
                format!("duplicate sub-question id {}", s.id),
            ));
        }
        sub_sum += s.max_marks;
    }
    if sub_sum > q.max_marks + EPS {
        return Err(EngineError::validation(
            "subQuestion.maxMarks",
            format!(
                "sub-question maxima sum to {} which exceeds question {} max {}",
                sub_sum, q.id, q.max_marks
            ),
        ));
    }
    Ok(())
}

/// Entry-time checks for one raw score against the question it targets.
/// Returns the applicable maximum.
pub fn validate_score(q: &Question, raw: &RawAnswerScore) -> Result<f64, EngineError> {
    if raw.question_id != q.id {
        return Err(EngineError::validation(
            "questionId",
            format!("score targets {} but was checked against {}", raw.question_id, q.id),
        ));
    }
    check_finite("score", raw.score)?;

    let max = match (&raw.sub_question_id, q.has_sub_questions()) {
        (Some(sid), true) => match q.sub_question(sid) {
            Some(s) => s.max_marks,
            None => {
                return Err(EngineError::validation(
                    "subQuestionId",
                    format!("sub-question {} does not belong to question {}", sid, q.id),
                ))
            }
        },
        (Some(sid), false) => {
            return Err(EngineError::validation(
                "subQuestionId",
                format!("question {} has no sub-questions (got {})", q.id, sid),
            ))
        }
        (None, true) => {
            return Err(EngineError::validation(
                "subQuestionId",
                format!("question {} is sub-divided; a sub-question id is required", q.id),
            ))
        }
        (None, false) => q.max_marks,
    };

    if raw.sub_question_id.is_none() && (raw.attempt < 1 || raw.attempt > q.attempt_slots()) {
        return Err(EngineError::validation(
            "attempt",
            format!(
                "attempt must be in 1..={} for question {}",
                q.attempt_slots(),
                q.id
            ),
        ));
    }
    if raw.score < 0.0 {
        return Err(EngineError::validation("score", "negative marks are not allowed"));
    }
    if raw.score > max + EPS {
        return Err(EngineError::validation(
            "score",
            format!("score {} exceeds maximum {}", raw.score, max),
        ));
    }
    Ok(max)
}
