use serde::Serialize;
use std::cmp::Ordering;

use crate::scoring::{Question, RawAnswerScore};

/// Whether a student answered anything for a question. A scored zero is
/// `Attempted`; only the absence of any score is `NotAttempted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    NotAttempted,
    Attempted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionTotal {
    pub question_id: String,
    pub total: f64,
    pub capped: bool,
    pub status: AttemptStatus,
    /// Attempt numbers (or sub-question ids) that count toward the total.
    pub counted: Vec<String>,
    /// Attempts dropped by best-N selection.
    pub excluded: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordTotal {
    pub total: f64,
    pub max: f64,
    pub capped: bool,
    pub not_attempted: bool,
    pub per_question: Vec<QuestionTotal>,
}

/// Half-up rounding to one decimal, used for displayed percentages.
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

fn attempt_key(s: &RawAnswerScore) -> String {
    match &s.sub_question_id {
        Some(sid) => sid.clone(),
        None => s.attempt.to_string(),
    }
}

/// Total for one question from the raw scores a student entered for it.
///
/// Scores for other questions are ignored. Best-N selection sorts attempts by
/// score descending with a stable sort, so equal scores keep their entry
/// order and the later entry is the one reported as excluded.
///
/// Scores are not bounds-checked here: attempts above `max_marks` still count
/// toward the best N and the sum is then capped at `required_count ×
/// max_marks`, so `[8, 7, 9, 6, 5, 4]` on a 4-of-6 section of 5 marks totals
/// 20, capped. Callers that store scores reject them first with
/// [`crate::scoring::validate_score`].
pub fn compute_total(question: &Question, raw_scores: &[RawAnswerScore]) -> QuestionTotal {
    let mine: Vec<&RawAnswerScore> = raw_scores
        .iter()
        .filter(|s| s.question_id == question.id)
        .collect();

    if mine.is_empty() {
        return QuestionTotal {
            question_id: question.id.clone(),
            total: 0.0,
            capped: false,
            status: AttemptStatus::NotAttempted,
            counted: vec![],
            excluded: vec![],
        };
    }

    if question.has_sub_questions() {
        let sum: f64 = mine.iter().map(|s| s.score).sum();
        let capped = sum > question.max_marks;
        return QuestionTotal {
            question_id: question.id.clone(),
            total: sum.min(question.max_marks),
            capped,
            status: AttemptStatus::Attempted,
            counted: mine.iter().map(|s| attempt_key(s)).collect(),
            excluded: vec![],
        };
    }

    let required = question.required_count as usize;
    if mine.len() <= required {
        return QuestionTotal {
            question_id: question.id.clone(),
            total: mine.iter().map(|s| s.score).sum(),
            capped: false,
            status: AttemptStatus::Attempted,
            counted: mine.iter().map(|s| attempt_key(s)).collect(),
            excluded: vec![],
        };
    }

    let mut ranked = mine;
    ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    let (best, dropped) = ranked.split_at(required);
    let best_sum: f64 = best.iter().map(|s| s.score).sum();
    let ceiling = f64::from(question.required_count) * question.max_marks;

    QuestionTotal {
        question_id: question.id.clone(),
        total: best_sum.min(ceiling),
        capped: true,
        status: AttemptStatus::Attempted,
        counted: best.iter().map(|s| attempt_key(s)).collect(),
        excluded: dropped.iter().map(|s| attempt_key(s)).collect(),
    }
}

/// Sums [`compute_total`] over every question of a component.
pub fn record_total(questions: &[Question], raw_scores: &[RawAnswerScore]) -> RecordTotal {
    let per_question: Vec<QuestionTotal> = questions
        .iter()
        .map(|q| compute_total(q, raw_scores))
        .collect();
    RecordTotal {
        total: per_question.iter().map(|t| t.total).sum(),
        max: questions.iter().map(Question::effective_max).sum(),
        capped: per_question.iter().any(|t| t.capped),
        not_attempted: per_question
            .iter()
            .all(|t| t.status == AttemptStatus::NotAttempted),
        per_question,
    }
}

/// True when every question has at least its required number of answers
/// (every sub-question, for sub-divided questions). Gate for `submit`.
pub fn required_scores_entered(questions: &[Question], raw_scores: &[RawAnswerScore]) -> bool {
    questions.iter().all(|q| {
        let mine = raw_scores.iter().filter(|s| s.question_id == q.id);
        if q.has_sub_questions() {
            q.sub_questions.iter().all(|sub| {
                raw_scores.iter().any(|s| {
                    s.question_id == q.id && s.sub_question_id.as_deref() == Some(sub.id.as_str())
                })
            })
        } else {
            mine.count() >= q.required_count as usize
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::SubQuestion;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn section(req: u32, opt: u32, max: f64) -> Question {
        Question {
            id: "A".into(),
            section: "A".into(),
            label: "Section A".into(),
            max_marks: max,
            required_count: req,
            optional_count: opt,
            co_tags: BTreeSet::new(),
            sub_questions: vec![],
        }
    }

    fn attempts(qid: &str, scores: &[f64]) -> Vec<RawAnswerScore> {
        scores
            .iter()
            .enumerate()
            .map(|(i, s)| RawAnswerScore {
                student_id: "s1".into(),
                question_id: qid.into(),
                sub_question_id: None,
                attempt: i as u32 + 1,
                score: *s,
            })
            .collect()
    }

    #[test]
    fn optional_section_takes_best_four_then_caps() {
        let q = section(4, 2, 5.0);
        let t = compute_total(&q, &attempts("A", &[8.0, 7.0, 9.0, 6.0, 5.0, 4.0]));
        assert_eq!(t.total, 20.0);
        assert!(t.capped);
        assert_eq!(t.counted, vec!["3", "1", "2", "4"]);
        assert_eq!(t.excluded, vec!["5", "6"]);
    }

    #[test]
    fn within_required_count_sums_without_capping() {
        let q = section(4, 2, 5.0);
        let t = compute_total(&q, &attempts("A", &[5.0, 3.0, 4.0]));
        assert_eq!(t.total, 12.0);
        assert!(!t.capped);
        assert!(t.excluded.is_empty());
    }

    #[test]
    fn no_attempts_is_distinct_from_scored_zero() {
        let q = section(1, 0, 5.0);
        let none = compute_total(&q, &[]);
        assert_eq!(none.total, 0.0);
        assert_eq!(none.status, AttemptStatus::NotAttempted);

        let zero = compute_total(&q, &attempts("A", &[0.0]));
        assert_eq!(zero.total, 0.0);
        assert_eq!(zero.status, AttemptStatus::Attempted);
    }

    #[test]
    fn sub_questions_clip_at_parent_max() {
        let mut q = section(1, 0, 10.0);
        q.sub_questions = vec![
            SubQuestion { id: "a".into(), label: "a".into(), max_marks: 5.0 },
            SubQuestion { id: "b".into(), label: "b".into(), max_marks: 5.0 },
        ];
        let scores = vec![
            RawAnswerScore {
                student_id: "s1".into(),
                question_id: "A".into(),
                sub_question_id: Some("a".into()),
                attempt: 1,
                score: 4.0,
            },
            RawAnswerScore {
                student_id: "s1".into(),
                question_id: "A".into(),
                sub_question_id: Some("b".into()),
                attempt: 1,
                score: 3.5,
            },
        ];
        let t = compute_total(&q, &scores);
        assert_eq!(t.total, 7.5);
        assert!(!t.capped);
        assert_eq!(t.counted, vec!["a", "b"]);
    }

    #[test]
    fn equal_scores_at_boundary_keep_entry_order() {
        let q = section(2, 1, 5.0);
        let t = compute_total(&q, &attempts("A", &[4.0, 5.0, 4.0]));
        assert_eq!(t.total, 9.0);
        assert_eq!(t.counted, vec!["2", "1"]);
        assert_eq!(t.excluded, vec!["3"]);
    }

    #[test]
    fn record_total_flags_capping_and_required_entry() {
        let a = section(2, 1, 5.0);
        let mut b = section(1, 0, 10.0);
        b.id = "B".into();
        let mut scores = attempts("A", &[5.0, 4.0, 3.0]);
        assert!(!required_scores_entered(&[a.clone(), b.clone()], &scores));
        scores.extend(attempts("B", &[6.0]));
        assert!(required_scores_entered(&[a.clone(), b.clone()], &scores));

        let rt = record_total(&[a, b], &scores);
        assert_eq!(rt.total, 15.0);
        assert_eq!(rt.max, 20.0);
        assert!(rt.capped);
        assert!(!rt.not_attempted);
    }

    #[test]
    fn round_off_is_half_up() {
        assert_eq!(round_off_1_decimal(3.54), 3.5);
        assert_eq!(round_off_1_decimal(3.55), 3.6);
    }

    proptest! {
        #[test]
        fn capped_total_never_exceeds_required_times_max(
            req in 1u32..6,
            opt in 0u32..4,
            max in 1u32..20,
            raw in proptest::collection::vec(0u32..=100, 0..10),
        ) {
            let m = f64::from(max);
            let q = section(req, opt, m);
            let n = (req + opt) as usize;
            let scores: Vec<f64> = raw.iter().take(n).map(|r| m * f64::from(*r) / 100.0).collect();
            let t = compute_total(&q, &attempts("A", &scores));
            prop_assert!(t.total <= f64::from(req) * m + 1e-9);

            if scores.len() > req as usize {
                let mut sorted = scores.clone();
                sorted.sort_by(|a, b| b.partial_cmp(a).unwrap());
                let top: f64 = sorted.iter().take(req as usize).sum();
                prop_assert!((t.total - top).abs() < 1e-9);
                prop_assert!(t.capped);
            }

            let again = compute_total(&q, &attempts("A", &scores));
            prop_assert_eq!(t, again);
        }
    }
}
