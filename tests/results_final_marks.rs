mod test_support;

use serde_json::{json, Value};
use test_support::{approve, approx, days_ago, enter_sheet, hod, principal, seed, teacher, Sidecar};

fn as_f64(v: &Value) -> f64 {
    v.as_f64().expect("number")
}

/// Enters and approves all three papers for one student.
fn finalize_student(s: &mut Sidecar, student: &str, sheets: [(&[f64], (f64, f64)); 3]) -> Value {
    let mut last = Value::Null;
    for ((a, b), component) in sheets.into_iter().zip(["c-i1", "c-i2", "c-ext"]) {
        let rec = enter_sheet(s, student, component, a, b);
        last = approve(s, &rec);
    }
    last
}

fn final_mark(s: &mut Sidecar, student: &str) -> Value {
    let out = s.ok("finalMarks.get", json!({ "actor": principal(), "studentId": student }));
    let rows = out["finalMarks"].as_array().expect("rows");
    assert_eq!(rows.len(), 1, "one final mark for {student}");
    rows[0].clone()
}

#[test]
fn approval_of_the_last_paper_derives_the_final_mark() {
    let mut s = Sidecar::start();
    seed(&mut s, days_ago(0));

    let rec = enter_sheet(&mut s, "s1", "c-i1", &[2.5, 2.5, 2.5, 2.5], (6.0, 4.0));
    let first = approve(&mut s, &rec);
    let pending = &first["derived"]["finalMarks"]["summary"]["pending"];
    assert_eq!(pending[0]["studentId"], "s1");
    assert_eq!(pending[0]["waitingOn"], json!(["internal_2: no record", "external: no record"]));

    let rec = enter_sheet(&mut s, "s1", "c-i2", &[2.0, 2.0, 2.0, 2.0], (5.0, 3.0));
    approve(&mut s, &rec);
    let rec = enter_sheet(&mut s, "s1", "c-ext", &[2.5, 2.5, 2.5, 2.5], (6.0, 3.0));
    let last = approve(&mut s, &rec);
    assert_eq!(last["derived"]["finalMarks"]["summary"]["updated"], json!(["s1"]));

    let fm = final_mark(&mut s, "s1");
    assert_eq!(fm["status"], "computed");
    assert!(approx(as_f64(&fm["bestInternal"]), 20.0));
    assert!(approx(as_f64(&fm["total"]), 97.0));
    assert_eq!(fm["grade"], "O");

    // Recompute is idempotent.
    let again = s.ok("finalMarks.recompute", json!({ "subjectId": "cs101", "semesterId": "sem1" }));
    assert_eq!(again["updated"], json!([]));
    assert_eq!(again["unchanged"], 1);
}

#[test]
fn freeze_publish_rollup_and_backlog_clearance() {
    let mut s = Sidecar::start();
    seed(&mut s, days_ago(0));
    s.ok("semesters.upsert", json!({ "id": "sem2", "seq": 2, "label": "Semester 2" }));

    finalize_student(
        &mut s,
        "s1",
        [
            (&[2.5, 2.5, 2.5, 2.5], (6.0, 4.0)),
            (&[2.0, 2.0, 2.0, 2.0], (5.0, 3.0)),
            (&[2.5, 2.5, 2.5, 2.5], (6.0, 3.0)),
        ],
    );
    finalize_student(
        &mut s,
        "s2",
        [
            (&[0.5, 0.5, 0.5, 0.5], (1.0, 1.0)),
            (&[0.5, 0.5, 0.5, 0.5], (1.0, 1.0)),
            (&[0.5, 0.5, 0.5, 0.5], (1.0, 0.0)),
        ],
    );
    assert_eq!(final_mark(&mut s, "s2")["grade"], "F");

    // Nothing is rolled up while marks are still only computed.
    let early = s.ok("semesterResults.recompute", json!({ "studentId": "s1" }));
    assert_eq!(early["semesters"], json!([]));
    assert_eq!(early["pendingSemesters"], json!(["sem1"]));

    let scope = json!({ "subjectId": "cs101", "semesterId": "sem1" });
    let as_actor = |actor: Value| {
        let mut p = scope.clone();
        p["actor"] = actor;
        p
    };
    s.fail("finalMarks.freeze", as_actor(hod()), "authorization_error");
    s.fail("finalMarks.publish", as_actor(teacher()), "authorization_error");
    let frozen = s.ok("finalMarks.freeze", as_actor(principal()));
    assert_eq!(frozen["frozen"].as_array().map(|a| a.len()), Some(2));
    let published = s.ok("finalMarks.publish", as_actor(hod()));
    assert_eq!(published["published"].as_array().map(|a| a.len()), Some(2));

    // Published snapshots are skipped by recompute.
    let skipped = s.ok("finalMarks.recompute", scope.clone());
    assert_eq!(skipped["snapshotsSkipped"], 2);

    let all = s.ok("semesterResults.recompute", json!({}));
    assert_eq!(all["students"].as_array().map(|a| a.len()), Some(2));
    let s1 = s.ok("semesterResults.get", json!({ "actor": principal(), "studentId": "s1" }));
    assert!(approx(as_f64(&s1["semesters"][0]["sgpa"]), 10.0));
    assert!(approx(as_f64(&s1["semesters"][0]["cgpa"]), 10.0));
    let s2 = s.ok("semesterResults.get", json!({ "actor": principal(), "studentId": "s2" }));
    assert!(approx(as_f64(&s2["semesters"][0]["sgpa"]), 0.0));

    let clearance = json!({
        "studentId": "s2",
        "subjectId": "cs101",
        "semesterId": "sem1",
        "clearedInSemesterId": "sem2",
        "internal1": 14,
        "internal2": 12,
        "external": 12
    });
    let mut by_teacher = clearance.clone();
    by_teacher["actor"] = teacher();
    s.fail("backlogs.clear", by_teacher, "authorization_error");

    let mut backwards = clearance.clone();
    backwards["actor"] = principal();
    backwards["clearedInSemesterId"] = json!("sem1");
    s.fail("backlogs.clear", backwards, "validation_error");

    let mut by_principal = clearance.clone();
    by_principal["actor"] = principal();
    let out = s.ok("backlogs.clear", by_principal.clone());
    assert_eq!(out["previousGrade"], "F");
    assert_eq!(out["finalMark"]["grade"], "B+");
    assert_eq!(out["finalMark"]["backlogClearedIn"], "sem2");
    assert_eq!(out["finalMark"]["status"], "published");
    assert!(approx(as_f64(&out["rollup"]["semesters"][0]["sgpa"]), 7.0));

    // FinalMark changes are logged under their own subject id.
    let fm_id = out["finalMark"]["id"].as_str().expect("final mark id").to_string();
    let log = s.ok("audit.list", json!({ "markRecordId": format!("final_mark:{fm_id}") }));
    let fields: Vec<_> = log["entries"]
        .as_array()
        .expect("entries")
        .iter()
        .map(|e| e["field"].as_str().unwrap_or("").to_string())
        .collect();
    assert_eq!(fields, vec!["final_mark.status", "final_mark.status", "final_mark.grade"]);
    let plain = s.ok("audit.list", json!({ "markRecordId": fm_id }));
    assert_eq!(plain["entries"], json!([]));

    let s2 = s.ok("semesterResults.get", json!({ "actor": principal(), "studentId": "s2" }));
    assert!(approx(as_f64(&s2["semesters"][0]["cgpa"]), 7.0));

    // A cleared subject is no longer a backlog.
    s.fail("backlogs.clear", by_principal, "validation_error");
}

#[test]
fn pure_calculators_match_worked_examples() {
    let mut s = Sidecar::start();

    let cgpa = s.ok(
        "results.cgpa",
        json!({
            "semesters": [
                { "semesterId": "sem1", "seq": 1, "sgpa": 7.8, "credits": 24 },
                { "semesterId": "sem2", "seq": 2, "sgpa": 7.5, "credits": 22 }
            ]
        }),
    );
    let expected = (7.8 * 24.0 + 7.5 * 22.0) / 46.0;
    assert!((as_f64(&cgpa["cgpa"]) - expected).abs() < 1e-9);

    let sgpa = s.ok(
        "results.sgpa",
        json!({
            "subjects": [
                { "subjectId": "a", "credits": 4, "gradePoint": 9 },
                { "subjectId": "b", "credits": 3, "gradePoint": 0 }
            ]
        }),
    );
    assert!(approx(as_f64(&sgpa["sgpa"]), 36.0 / 7.0));

    let scheme = json!({
        "internalExamMax": 50, "internalMax": 40,
        "externalExamMax": 100, "externalMax": 60, "totalMax": 100
    });
    let boundary = s.ok(
        "results.aggregate",
        json!({ "internal1": 30, "internal2": 40, "external": 80, "scheme": scheme }),
    );
    assert!(approx(as_f64(&boundary["total"]), 80.0));
    assert_eq!(boundary["grade"], "A+");
    assert_eq!(boundary["percentageDisplay"], 80.0);

    let avg = s.ok(
        "results.aggregate",
        json!({
            "internal1": 30, "internal2": 40, "external": 80,
            "scheme": scheme, "method": { "method": "avg" }
        }),
    );
    assert!(approx(as_f64(&avg["bestInternal"]), 35.0));
    assert!(approx(as_f64(&avg["total"]), 76.0));

    s.fail(
        "results.aggregate",
        json!({ "internal1": 60, "internal2": 40, "external": 80, "scheme": scheme }),
        "validation_error",
    );
}
