//! Authoring inputs: semesters, subjects, teaching assignments, exam
//! components and their question papers.

use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::aggregate::SubjectScheme;
use crate::error::EngineError;
use crate::scoring::{validate_question, Question, SubQuestion};

const MAX_EPS: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Semester {
    pub id: String,
    pub seq: i64,
    pub label: String,
}

pub fn upsert_semester(conn: &Connection, s: &Semester) -> Result<(), EngineError> {
    if s.id.trim().is_empty() {
        return Err(EngineError::validation("id", "must not be empty"));
    }
    if s.seq < 1 {
        return Err(EngineError::validation("seq", "must be >= 1"));
    }
    let clash: Option<String> = conn
        .query_row(
            "SELECT id FROM semesters WHERE seq = ? AND id <> ?",
            (s.seq, &s.id),
            |r| r.get(0),
        )
        .optional()?;
    if let Some(other) = clash {
        return Err(EngineError::validation(
            "seq",
            format!("sequence {} already used by semester {}", s.seq, other),
        ));
    }
    conn.execute(
        "INSERT INTO semesters(id, seq, label) VALUES(?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET seq = excluded.seq, label = excluded.label",
        (&s.id, s.seq, &s.label),
    )?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub id: String,
    pub department_id: String,
    pub code: String,
    #[serde(default)]
    pub name: String,
    pub credits: f64,
    #[serde(flatten)]
    pub scheme: SubjectScheme,
}

pub fn upsert_subject(conn: &Connection, s: &Subject) -> Result<(), EngineError> {
    for (field, v) in [("id", &s.id), ("departmentId", &s.department_id), ("code", &s.code)] {
        if v.trim().is_empty() {
            return Err(EngineError::validation(field, "must not be empty"));
        }
    }
    if !s.credits.is_finite() || s.credits < 0.0 {
        return Err(EngineError::validation("credits", "must be >= 0"));
    }
    s.scheme.validate()?;
    conn.execute(
        "INSERT INTO subjects(id, department_id, code, name, credits, internal_exam_max, internal_max, external_exam_max, external_max, total_max)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           department_id = excluded.department_id,
           code = excluded.code,
           name = excluded.name,
           credits = excluded.credits,
           internal_exam_max = excluded.internal_exam_max,
           internal_max = excluded.internal_max,
           external_exam_max = excluded.external_exam_max,
           external_max = excluded.external_max,
           total_max = excluded.total_max",
        rusqlite::params![
            s.id,
            s.department_id,
            s.code,
            s.name,
            s.credits,
            s.scheme.internal_exam_max,
            s.scheme.internal_max,
            s.scheme.external_exam_max,
            s.scheme.external_max,
            s.scheme.total_max
        ],
    )?;
    Ok(())
}

pub fn load_subject(conn: &Connection, id: &str) -> Result<Subject, EngineError> {
    conn.query_row(
        "SELECT id, department_id, code, name, credits, internal_exam_max, internal_max, external_exam_max, external_max, total_max
         FROM subjects WHERE id = ?",
        [id],
        |r| {
            Ok(Subject {
                id: r.get(0)?,
                department_id: r.get(1)?,
                code: r.get(2)?,
                name: r.get(3)?,
                credits: r.get(4)?,
                scheme: SubjectScheme {
                    internal_exam_max: r.get(5)?,
                    internal_max: r.get(6)?,
                    external_exam_max: r.get(7)?,
                    external_max: r.get(8)?,
                    total_max: r.get(9)?,
                },
            })
        },
    )
    .optional()?
    .ok_or_else(|| EngineError::not_found("subject", id))
}

/// Who teaches which subject to which class in which semester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub id: String,
    pub subject_id: String,
    pub semester_id: String,
    pub teacher_id: String,
    #[serde(default)]
    pub class_label: String,
}

pub fn upsert_assignment(conn: &Connection, a: &Assignment) -> Result<(), EngineError> {
    for (field, v) in [("id", &a.id), ("teacherId", &a.teacher_id)] {
        if v.trim().is_empty() {
            return Err(EngineError::validation(field, "must not be empty"));
        }
    }
    load_subject(conn, &a.subject_id)?;
    let semester_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM semesters WHERE id = ?", [&a.semester_id], |r| r.get(0))
        .optional()?;
    if semester_exists.is_none() {
        return Err(EngineError::not_found("semester", a.semester_id.clone()));
    }
    conn.execute(
        "INSERT INTO subject_assignments(id, subject_id, semester_id, teacher_id, class_label)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           subject_id = excluded.subject_id,
           semester_id = excluded.semester_id,
           teacher_id = excluded.teacher_id,
           class_label = excluded.class_label",
        (&a.id, &a.subject_id, &a.semester_id, &a.teacher_id, &a.class_label),
    )?;
    Ok(())
}

pub fn load_assignment(conn: &Connection, id: &str) -> Result<Assignment, EngineError> {
    conn.query_row(
        "SELECT id, subject_id, semester_id, teacher_id, class_label FROM subject_assignments WHERE id = ?",
        [id],
        |r| {
            Ok(Assignment {
                id: r.get(0)?,
                subject_id: r.get(1)?,
                semester_id: r.get(2)?,
                teacher_id: r.get(3)?,
                class_label: r.get(4)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| EngineError::not_found("assignment", id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    #[serde(rename = "internal_1")]
    Internal1,
    #[serde(rename = "internal_2")]
    Internal2,
    External,
}

impl ComponentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Internal1 => "internal_1",
            Self::Internal2 => "internal_2",
            Self::External => "external",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "internal_1" => Some(Self::Internal1),
            "internal_2" => Some(Self::Internal2),
            "external" => Some(Self::External),
            _ => None,
        }
    }

    /// Raw exam maximum the subject expects for this kind of paper.
    pub fn exam_max(self, scheme: &SubjectScheme) -> f64 {
        match self {
            Self::Internal1 | Self::Internal2 => scheme.internal_exam_max,
            Self::External => scheme.external_exam_max,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentInput {
    pub id: String,
    pub assignment_id: String,
    pub kind: ComponentKind,
    #[serde(default)]
    pub exam_date: Option<NaiveDate>,
    pub questions: Vec<Question>,
}

/// A component joined with the assignment and subject it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub id: String,
    pub assignment_id: String,
    pub kind: ComponentKind,
    pub exam_date: Option<NaiveDate>,
    pub locked: bool,
    pub subject_id: String,
    pub semester_id: String,
    pub department_id: String,
    pub teacher_id: String,
    pub class_label: String,
}

pub fn load_component(conn: &Connection, id: &str) -> Result<Component, EngineError> {
    let row = conn
        .query_row(
            "SELECT c.id, c.assignment_id, c.kind, c.exam_date, c.locked,
                    a.subject_id, a.semester_id, s.department_id, a.teacher_id, a.class_label
             FROM components c
             JOIN subject_assignments a ON a.id = c.assignment_id
             JOIN subjects s ON s.id = a.subject_id
             WHERE c.id = ?",
            [id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, String>(6)?,
                    r.get::<_, String>(7)?,
                    r.get::<_, String>(8)?,
                    r.get::<_, String>(9)?,
                ))
            },
        )
        .optional()?;
    let Some((id, assignment_id, kind, exam_date, locked, subject_id, semester_id, department_id, teacher_id, class_label)) =
        row
    else {
        return Err(EngineError::not_found("component", id));
    };
    let kind = ComponentKind::parse(&kind)
        .ok_or_else(|| EngineError::Storage(format!("unknown component kind {kind}")))?;
    let exam_date = match exam_date {
        Some(s) => Some(
            NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .map_err(|e| EngineError::Storage(format!("bad exam_date {s}: {e}")))?,
        ),
        None => None,
    };
    Ok(Component {
        id,
        assignment_id,
        kind,
        exam_date,
        locked: locked != 0,
        subject_id,
        semester_id,
        department_id,
        teacher_id,
        class_label,
    })
}

/// Questions of one component plus the storage keys scores point at.
#[derive(Debug, Clone, Default)]
pub struct QuestionSet {
    pub questions: Vec<Question>,
    pub question_keys: HashMap<String, i64>,
    pub sub_question_keys: HashMap<(String, String), i64>,
}

impl QuestionSet {
    pub fn get(&self, question_id: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == question_id)
    }

    pub fn max_total(&self) -> f64 {
        self.questions.iter().map(Question::effective_max).sum()
    }
}

pub fn load_questions(conn: &Connection, component_id: &str) -> Result<QuestionSet, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT pk, question_id, section, label, max_marks, required_count, optional_count, co_tags
         FROM questions WHERE component_id = ? ORDER BY sort_order",
    )?;
    let rows = stmt
        .query_map([component_id], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, f64>(4)?,
                r.get::<_, u32>(5)?,
                r.get::<_, u32>(6)?,
                r.get::<_, String>(7)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut sub_stmt = conn.prepare(
        "SELECT pk, sub_question_id, label, max_marks FROM sub_questions WHERE question_pk = ? ORDER BY pk",
    )?;

    let mut set = QuestionSet::default();
    for (pk, question_id, section, label, max_marks, required_count, optional_count, co_tags) in rows {
        let co_tags: BTreeSet<String> = serde_json::from_str(&co_tags)?;
        let subs = sub_stmt
            .query_map([pk], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    SubQuestion {
                        id: r.get(1)?,
                        label: r.get(2)?,
                        max_marks: r.get(3)?,
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut sub_questions = Vec::with_capacity(subs.len());
        for (sub_pk, sub) in subs {
            set.sub_question_keys
                .insert((question_id.clone(), sub.id.clone()), sub_pk);
            sub_questions.push(sub);
        }
        set.question_keys.insert(question_id.clone(), pk);
        set.questions.push(Question {
            id: question_id,
            section,
            label,
            max_marks,
            required_count,
            optional_count,
            co_tags,
            sub_questions,
        });
    }
    Ok(set)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSummary {
    pub id: String,
    pub kind: ComponentKind,
    pub question_count: usize,
    pub max_total: f64,
}

/// Creates or replaces a question paper. Refused once the component is
/// locked or any student already has a mark record on it.
pub fn upsert_component(conn: &Connection, input: &ComponentInput) -> Result<ComponentSummary, EngineError> {
    if input.id.trim().is_empty() {
        return Err(EngineError::validation("id", "must not be empty"));
    }
    if input.questions.is_empty() {
        return Err(EngineError::validation("questions", "at least one question is required"));
    }
    let mut ids: BTreeSet<&str> = BTreeSet::new();
    for q in &input.questions {
        validate_question(q)?;
        if !ids.insert(q.id.as_str()) {
            return Err(EngineError::validation(
                "question.id",
                format!("duplicate question id {}", q.id),
            ));
        }
    }

    let assignment = load_assignment(conn, &input.assignment_id)?;
    let subject = load_subject(conn, &assignment.subject_id)?;
    let paper_max: f64 = input.questions.iter().map(Question::effective_max).sum();
    let expected = input.kind.exam_max(&subject.scheme);
    if (paper_max - expected).abs() > MAX_EPS {
        return Err(EngineError::validation(
            "questions",
            format!(
                "{} paper totals {} but subject {} expects {}",
                input.kind.as_str(),
                paper_max,
                subject.code,
                expected
            ),
        ));
    }

    let existing: Option<(String, i64)> = conn
        .query_row(
            "SELECT assignment_id, locked FROM components WHERE id = ?",
            [&input.id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    if let Some((assignment_id, locked)) = &existing {
        if *locked != 0 {
            return Err(EngineError::validation(
                "componentId",
                format!("component {} is locked; questions are immutable", input.id),
            ));
        }
        if assignment_id != &input.assignment_id {
            return Err(EngineError::validation(
                "assignmentId",
                "a component cannot move to another assignment",
            ));
        }
        let records: i64 = conn.query_row(
            "SELECT COUNT(*) FROM mark_records WHERE component_id = ?",
            [&input.id],
            |r| r.get(0),
        )?;
        if records > 0 {
            return Err(EngineError::validation(
                "componentId",
                format!("component {} already has {} mark records", input.id, records),
            ));
        }
    }

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO components(id, assignment_id, kind, exam_date, locked) VALUES(?, ?, ?, ?, 0)
         ON CONFLICT(id) DO UPDATE SET kind = excluded.kind, exam_date = excluded.exam_date",
        (
            &input.id,
            &input.assignment_id,
            input.kind.as_str(),
            input.exam_date.map(|d| d.to_string()),
        ),
    )?;
    tx.execute("DELETE FROM questions WHERE component_id = ?", [&input.id])?;
    for (i, q) in input.questions.iter().enumerate() {
        tx.execute(
            "INSERT INTO questions(component_id, question_id, sort_order, section, label, max_marks, required_count, optional_count, co_tags)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                input.id,
                q.id,
                i as i64,
                q.section,
                q.label,
                q.max_marks,
                q.required_count,
                q.optional_count,
                serde_json::to_string(&q.co_tags)?
            ],
        )?;
        let question_pk = tx.last_insert_rowid();
        for sub in &q.sub_questions {
            tx.execute(
                "INSERT INTO sub_questions(question_pk, sub_question_id, label, max_marks) VALUES(?, ?, ?, ?)",
                (question_pk, &sub.id, &sub.label, sub.max_marks),
            )?;
        }
    }
    tx.commit()?;

    Ok(ComponentSummary {
        id: input.id.clone(),
        kind: input.kind,
        question_count: input.questions.len(),
        max_total: paper_max,
    })
}

pub fn lock_component(conn: &Connection, id: &str) -> Result<bool, EngineError> {
    let component = load_component(conn, id)?;
    if component.locked {
        return Ok(false);
    }
    conn.execute("UPDATE components SET locked = 1 WHERE id = ?", [id])?;
    Ok(true)
}

/// Component ids for one subject in one semester, across every class it is
/// taught to.
pub fn components_for_subject(
    conn: &Connection,
    subject_id: &str,
    semester_id: &str,
) -> Result<Vec<(String, ComponentKind)>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.kind FROM components c
         JOIN subject_assignments a ON a.id = c.assignment_id
         WHERE a.subject_id = ? AND a.semester_id = ?
         ORDER BY c.id",
    )?;
    let rows = stmt
        .query_map((subject_id, semester_id), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(|(id, kind)| {
            ComponentKind::parse(&kind)
                .map(|k| (id, k))
                .ok_or_else(|| EngineError::Storage(format!("unknown component kind {kind}")))
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn scheme() -> SubjectScheme {
        SubjectScheme {
            internal_exam_max: 20.0,
            internal_max: 40.0,
            external_exam_max: 20.0,
            external_max: 60.0,
            total_max: 100.0,
        }
    }

    pub fn question(id: &str, max: f64, required: u32, optional: u32, cos: &[&str]) -> Question {
        Question {
            id: id.into(),
            section: "A".into(),
            label: id.into(),
            max_marks: max,
            required_count: required,
            optional_count: optional,
            co_tags: cos.iter().map(|c| c.to_string()).collect(),
            sub_questions: vec![],
        }
    }

    /// One subject taught by `t1` in semester `sem1` with all three papers
    /// authored: A (4 of 6 × 2.5) + B (sub-questions a/b, 10).
    pub fn seed(conn: &Connection, exam_date: NaiveDate) {
        upsert_semester(conn, &Semester { id: "sem1".into(), seq: 1, label: "Semester 1".into() })
            .expect("semester");
        upsert_subject(
            conn,
            &Subject {
                id: "cs101".into(),
                department_id: "cse".into(),
                code: "CS101".into(),
                name: "Programming".into(),
                credits: 4.0,
                scheme: scheme(),
            },
        )
        .expect("subject");
        upsert_assignment(
            conn,
            &Assignment {
                id: "as1".into(),
                subject_id: "cs101".into(),
                semester_id: "sem1".into(),
                teacher_id: "t1".into(),
                class_label: "CSE-A".into(),
            },
        )
        .expect("assignment");
        for (id, kind) in [
            ("c-i1", ComponentKind::Internal1),
            ("c-i2", ComponentKind::Internal2),
            ("c-ext", ComponentKind::External),
        ] {
            let mut b = question("B", 10.0, 1, 0, &["CO2"]);
            b.sub_questions = vec![
                SubQuestion { id: "a".into(), label: "a".into(), max_marks: 6.0 },
                SubQuestion { id: "b".into(), label: "b".into(), max_marks: 4.0 },
            ];
            upsert_component(
                conn,
                &ComponentInput {
                    id: id.into(),
                    assignment_id: "as1".into(),
                    kind,
                    exam_date: Some(exam_date),
                    questions: vec![question("A", 2.5, 4, 2, &["CO1"]), b],
                },
            )
            .expect("component");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::db;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 10).expect("date")
    }

    #[test]
    fn authored_paper_round_trips_with_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = db::open_db(dir.path()).expect("open");
        seed(&conn, date());

        let c = load_component(&conn, "c-i1").expect("component");
        assert_eq!(c.kind, ComponentKind::Internal1);
        assert_eq!(c.department_id, "cse");
        assert_eq!(c.exam_date, Some(date()));

        let set = load_questions(&conn, "c-i1").expect("questions");
        assert_eq!(set.questions.len(), 2);
        assert_eq!(set.max_total(), 20.0);
        assert!(set.get("A").expect("A").co_tags.contains("CO1"));
        assert!(set.sub_question_keys.contains_key(&("B".to_string(), "b".to_string())));
        assert_eq!(
            components_for_subject(&conn, "cs101", "sem1").expect("components").len(),
            3
        );
    }

    #[test]
    fn paper_total_must_match_subject_scheme() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = db::open_db(dir.path()).expect("open");
        seed(&conn, date());
        let e = upsert_component(
            &conn,
            &ComponentInput {
                id: "c-extra".into(),
                assignment_id: "as1".into(),
                kind: ComponentKind::External,
                exam_date: None,
                questions: vec![question("A", 5.0, 1, 0, &[])],
            },
        )
        .expect_err("wrong total");
        assert_eq!(e.code(), "validation_error");
    }

    #[test]
    fn locked_component_rejects_reauthoring() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = db::open_db(dir.path()).expect("open");
        seed(&conn, date());
        assert!(lock_component(&conn, "c-i1").expect("lock"));
        assert!(!lock_component(&conn, "c-i1").expect("already locked"));

        let e = upsert_component(
            &conn,
            &ComponentInput {
                id: "c-i1".into(),
                assignment_id: "as1".into(),
                kind: ComponentKind::Internal1,
                exam_date: Some(date()),
                questions: vec![question("A", 20.0, 1, 0, &[])],
            },
        )
        .expect_err("locked");
        assert_eq!(e.code(), "validation_error");
        assert_eq!(load_questions(&conn, "c-i1").expect("q").questions.len(), 2);
    }

    #[test]
    fn sub_question_budget_is_checked_at_authoring() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = db::open_db(dir.path()).expect("open");
        seed(&conn, date());
        let mut q = question("A", 20.0, 1, 0, &[]);
        q.sub_questions = vec![
            SubQuestion { id: "a".into(), label: "a".into(), max_marks: 15.0 },
            SubQuestion { id: "b".into(), label: "b".into(), max_marks: 10.0 },
        ];
        let e = upsert_component(
            &conn,
            &ComponentInput {
                id: "c-new".into(),
                assignment_id: "as1".into(),
                kind: ComponentKind::External,
                exam_date: None,
                questions: vec![q],
            },
        )
        .expect_err("sub budget");
        assert_eq!(e.code(), "validation_error");
    }
}
