#![allow(dead_code)]

use chrono::{Duration, NaiveDate, Utc};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_assessd");
    let mut child = Command::new(exe)
        .env_remove("ASSESSD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn assessd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

/// A running sidecar with a fresh workspace already selected.
pub struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
    pub workspace: tempfile::TempDir,
}

impl Sidecar {
    pub fn start() -> Self {
        let (child, stdin, reader) = spawn_sidecar();
        let workspace = tempfile::tempdir().expect("tempdir");
        let mut s = Self {
            child,
            stdin,
            reader,
            next_id: 0,
            workspace,
        };
        let path = s.workspace.path().to_string_lossy().to_string();
        s.ok("workspace.select", json!({ "path": path }));
        s
    }

    pub fn call(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        request(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    pub fn ok(&mut self, method: &str, params: Value) -> Value {
        let resp = self.call(method, params);
        assert_eq!(
            resp.get("ok").and_then(|v| v.as_bool()),
            Some(true),
            "{} failed: {}",
            method,
            resp
        );
        resp.get("result").cloned().unwrap_or(Value::Null)
    }

    /// Expects a failure and returns the `error` object.
    pub fn fail(&mut self, method: &str, params: Value, code: &str) -> Value {
        let resp = self.call(method, params);
        assert_eq!(
            resp.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            resp
        );
        let error = resp.get("error").cloned().expect("error object");
        assert_eq!(error["code"], code, "{} error: {}", method, error);
        error
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn teacher() -> Value {
    json!({ "id": "t1", "role": "teacher", "departmentId": "cse" })
}

pub fn hod() -> Value {
    json!({ "id": "h1", "role": "hod", "departmentId": "cse" })
}

pub fn principal() -> Value {
    json!({ "id": "p1", "role": "principal" })
}

pub fn student(id: &str) -> Value {
    json!({ "id": id, "role": "student" })
}

pub fn days_ago(n: i64) -> NaiveDate {
    Utc::now().date_naive() - Duration::days(n)
}

pub fn paper() -> Value {
    json!([
        {
            "id": "A",
            "section": "A",
            "maxMarks": 2.5,
            "requiredCount": 4,
            "optionalCount": 2,
            "coTags": ["CO1"]
        },
        {
            "id": "B",
            "section": "B",
            "maxMarks": 10.0,
            "coTags": ["CO2"],
            "subQuestions": [
                { "id": "a", "maxMarks": 6.0 },
                { "id": "b", "maxMarks": 4.0 }
            ]
        }
    ])
}

/// Semester `sem1`, subject `cs101` (dept `cse`, 4 credits, 40/60 split of
/// 20-mark papers), assignment `as1` taught by `t1`, and components
/// `c-i1`, `c-i2`, `c-ext` each with paper A (any 4 of 6 × 2.5) + B (a/b).
pub fn seed(s: &mut Sidecar, exam_date: NaiveDate) {
    s.ok("semesters.upsert", json!({ "id": "sem1", "seq": 1, "label": "Semester 1" }));
    s.ok(
        "subjects.upsert",
        json!({
            "id": "cs101",
            "departmentId": "cse",
            "code": "CS101",
            "name": "Programming",
            "credits": 4,
            "internalExamMax": 20,
            "internalMax": 40,
            "externalExamMax": 20,
            "externalMax": 60,
            "totalMax": 100
        }),
    );
    s.ok(
        "assignments.upsert",
        json!({
            "id": "as1",
            "subjectId": "cs101",
            "semesterId": "sem1",
            "teacherId": "t1",
            "classLabel": "CSE-A"
        }),
    );
    for (id, kind) in [("c-i1", "internal_1"), ("c-i2", "internal_2"), ("c-ext", "external")] {
        s.ok(
            "components.upsert",
            json!({
                "id": id,
                "assignmentId": "as1",
                "kind": kind,
                "examDate": exam_date.to_string(),
                "questions": paper()
            }),
        );
    }
}

/// Enters a complete sheet: `a` fills attempts 1.. of question A, `b` the two
/// sub-questions of B. Returns the mark record id.
pub fn enter_sheet(s: &mut Sidecar, student_id: &str, component_id: &str, a: &[f64], b: (f64, f64)) -> String {
    let mut record_id = String::new();
    let rows = a
        .iter()
        .enumerate()
        .map(|(i, score)| json!({ "questionId": "A", "attempt": i + 1, "score": score }))
        .chain([
            json!({ "questionId": "B", "subQuestionId": "a", "score": b.0 }),
            json!({ "questionId": "B", "subQuestionId": "b", "score": b.1 }),
        ]);
    for mut row in rows {
        row["actor"] = teacher();
        row["studentId"] = json!(student_id);
        row["componentId"] = json!(component_id);
        let out = s.ok("marks.enter", row);
        record_id = out["record"]["id"].as_str().expect("record id").to_string();
    }
    record_id
}

pub fn transition(s: &mut Sidecar, actor: Value, record_id: &str, event: &str, reason: Option<&str>) -> Value {
    s.ok(
        "workflow.transition",
        json!({ "actor": actor, "markRecordId": record_id, "event": event, "reason": reason }),
    )
}

/// Draft -> Submitted -> Approved.
pub fn approve(s: &mut Sidecar, record_id: &str) -> Value {
    transition(s, teacher(), record_id, "submit", None);
    transition(s, hod(), record_id, "approve", None)
}

pub fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}
