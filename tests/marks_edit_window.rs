mod test_support;

use serde_json::{json, Value};
use test_support::{approve, days_ago, enter_sheet, hod, paper, seed, teacher, Sidecar};

fn score(actor: Value, component: &str, attempt: u32, score: f64) -> Value {
    json!({
        "actor": actor,
        "studentId": "s1",
        "componentId": component,
        "questionId": "A",
        "attempt": attempt,
        "score": score
    })
}

fn reschedule(s: &mut Sidecar, component: &str, kind: &str, days: i64) {
    s.ok(
        "components.upsert",
        json!({
            "id": component,
            "assignmentId": "as1",
            "kind": kind,
            "examDate": days_ago(days).to_string(),
            "questions": paper()
        }),
    );
}

#[test]
fn window_is_inclusive_of_the_last_day() {
    let mut s = Sidecar::start();
    seed(&mut s, days_ago(7));
    reschedule(&mut s, "c-i2", "internal_2", 8);

    s.ok("marks.enter", score(teacher(), "c-i1", 1, 2.0));
    let late = s.fail("marks.enter", score(teacher(), "c-i2", 1, 2.0), "edit_window_expired");
    assert_eq!(late["details"]["deadline"], days_ago(1).to_string());

    // The failed first entry must not leave an empty record behind.
    let listed = s.ok("marks.list", json!({ "actor": teacher(), "componentId": "c-i2" }));
    assert_eq!(listed["records"], json!([]));

    s.ok("setup.update", json!({ "departmentId": "cse", "patch": { "editWindowDays": 8 } }));
    s.ok("marks.enter", score(teacher(), "c-i2", 1, 2.0));
}

#[test]
fn privileged_edits_need_a_reason_and_are_marked_as_overrides() {
    let mut s = Sidecar::start();
    seed(&mut s, days_ago(30));

    s.fail("marks.enter", score(teacher(), "c-i1", 1, 2.0), "edit_window_expired");

    let no_reason = s.fail("marks.enter", score(hod(), "c-i1", 1, 2.0), "validation_error");
    assert_eq!(no_reason["details"]["field"], "overrideReason");

    let mut with_reason = score(hod(), "c-i1", 1, 2.0);
    with_reason["overrideReason"] = json!("late answer sheet found");
    let out = s.ok("marks.enter", with_reason);
    assert_eq!(out["overridden"], true);
    assert_eq!(out["audit"]["actorId"], "h1");
    assert_eq!(out["audit"]["reason"], "late answer sheet found");

    let outsider = json!({ "id": "h9", "role": "hod", "departmentId": "mech" });
    let mut foreign = score(outsider, "c-i1", 2, 2.0);
    foreign["overrideReason"] = json!("not my department");
    s.fail("marks.enter", foreign, "authorization_error");
}

#[test]
fn approved_records_take_only_overrides_and_refresh_results() {
    let mut s = Sidecar::start();
    seed(&mut s, days_ago(0));
    let rec = enter_sheet(&mut s, "s1", "c-i1", &[2.0, 2.0, 2.0, 2.0], (5.0, 3.0));
    approve(&mut s, &rec);

    let e = s.fail("marks.enter", score(teacher(), "c-i1", 1, 2.5), "invalid_transition");
    assert_eq!(e["details"]["event"], "edit_score");

    let mut fix = score(hod(), "c-i1", 1, 2.5);
    fix["overrideReason"] = json!("re-evaluation");
    let out = s.ok("marks.enter", fix);
    assert_eq!(out["record"]["state"], "approved");
    assert_eq!(out["record"]["computedTotal"], 16.5);
    assert_eq!(out["derived"]["finalMarks"]["ok"], true);

    let stale = s.fail(
        "marks.enter",
        {
            let mut v = score(hod(), "c-i1", 2, 2.5);
            v["overrideReason"] = json!("second look");
            v["expectedVersion"] = json!(1);
            v
        },
        "concurrent_modification",
    );
    assert_eq!(stale["details"]["expectedVersion"], 1);
}

#[test]
fn stale_version_on_transition_is_rejected() {
    let mut s = Sidecar::start();
    seed(&mut s, days_ago(0));
    let rec = enter_sheet(&mut s, "s1", "c-i1", &[1.0, 1.0, 1.0, 1.0], (1.0, 1.0));

    let current = s.ok("marks.get", json!({ "actor": teacher(), "markRecordId": rec }));
    let version = current["record"]["version"].as_i64().expect("version");

    // Someone else edits in between.
    s.ok("marks.enter", score(teacher(), "c-i1", 5, 2.0));

    let e = s.fail(
        "workflow.transition",
        json!({ "actor": teacher(), "markRecordId": rec, "event": "submit", "expectedVersion": version }),
        "concurrent_modification",
    );
    assert_eq!(e["details"]["actualVersion"], version + 1);

    let out = s.ok(
        "workflow.transition",
        json!({ "actor": teacher(), "markRecordId": rec, "event": "submit", "expectedVersion": version + 1 }),
    );
    assert_eq!(out["to"], "submitted");
}
