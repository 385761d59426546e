use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::aggregate::{FailGrade, GradeBand, GradeTable, InternalMethod};
use crate::db;
use crate::error::EngineError;

pub const DEFAULT_EDIT_WINDOW_DAYS: u32 = 7;
pub const DEFAULT_PO_TARGET_PCT: f64 = 60.0;

/// Per-department knobs that used to be global "current settings". Always
/// loaded explicitly and passed into the pure calculators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepartmentSettings {
    pub grade_table: Vec<GradeBand>,
    pub fail_grade: FailGrade,
    pub internal_method: String,
    pub internal_weights: [f64; 2],
    pub edit_window_days: u32,
    pub po_target_pct: f64,
}

impl Default for DepartmentSettings {
    fn default() -> Self {
        let table = GradeTable::default();
        Self {
            grade_table: table.bands,
            fail_grade: table.fail,
            internal_method: "best".to_string(),
            internal_weights: [0.5, 0.5],
            edit_window_days: DEFAULT_EDIT_WINDOW_DAYS,
            po_target_pct: DEFAULT_PO_TARGET_PCT,
        }
    }
}

impl DepartmentSettings {
    pub fn grades(&self) -> Result<GradeTable, EngineError> {
        GradeTable::new(self.grade_table.clone(), self.fail_grade.clone())
    }

    pub fn method(&self) -> Result<InternalMethod, EngineError> {
        let m = match self.internal_method.as_str() {
            "best" => InternalMethod::Best,
            "avg" => InternalMethod::Avg,
            "weighted" => InternalMethod::Weighted {
                w1: self.internal_weights[0],
                w2: self.internal_weights[1],
            },
            other => {
                return Err(EngineError::validation(
                    "internalMethod",
                    format!("unknown method '{}' (expected best, avg or weighted)", other),
                ))
            }
        };
        m.validate()?;
        Ok(m)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        self.grades()?;
        self.method()?;
        if self.edit_window_days > 365 {
            return Err(EngineError::validation("editWindowDays", "must be in 0..=365"));
        }
        if !(0.0..=100.0).contains(&self.po_target_pct) {
            return Err(EngineError::validation("poTargetPct", "must be in 0..=100"));
        }
        Ok(())
    }
}

fn key(department_id: &str) -> String {
    format!("department.{}", department_id)
}

pub fn load(conn: &Connection, department_id: &str) -> Result<DepartmentSettings, EngineError> {
    match db::settings_get_json(conn, &key(department_id))? {
        Some(v) => Ok(serde_json::from_value(v)?),
        None => Ok(DepartmentSettings::default()),
    }
}

/// Applies a camelCase patch field by field; unknown keys are rejected and the
/// merged result must validate before it is stored.
pub fn update(
    conn: &Connection,
    department_id: &str,
    patch: &Map<String, Value>,
) -> Result<DepartmentSettings, EngineError> {
    let current = load(conn, department_id)?;
    let mut merged = serde_json::to_value(&current)?;
    let Some(obj) = merged.as_object_mut() else {
        return Err(EngineError::Storage("settings must be a JSON object".into()));
    };
    for (k, v) in patch {
        match k.as_str() {
            "gradeTable" | "failGrade" | "internalMethod" | "internalWeights"
            | "editWindowDays" | "poTargetPct" => {
                obj.insert(k.clone(), v.clone());
            }
            _ => {
                return Err(EngineError::validation(
                    k,
                    format!("unknown department setting: {}", k),
                ))
            }
        }
    }
    let next: DepartmentSettings = serde_json::from_value(merged)
        .map_err(|e| EngineError::validation("patch", e.to_string()))?;
    next.validate()?;
    db::settings_set_json(conn, &key(department_id), &serde_json::to_value(&next)?)?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_then_patch_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = db::open_db(dir.path()).expect("open");

        let s = load(&conn, "cse").expect("load");
        assert_eq!(s, DepartmentSettings::default());
        assert_eq!(s.method().expect("method"), InternalMethod::Best);

        let patch = json!({ "internalMethod": "weighted", "internalWeights": [0.4, 0.6], "editWindowDays": 3 });
        let next = update(&conn, "cse", patch.as_object().expect("obj")).expect("update");
        assert_eq!(next.edit_window_days, 3);
        assert_eq!(load(&conn, "cse").expect("reload"), next);
        assert_eq!(load(&conn, "mech").expect("other dept"), DepartmentSettings::default());
    }

    #[test]
    fn invalid_patch_is_not_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = db::open_db(dir.path()).expect("open");
        let bad = json!({ "internalMethod": "weighted", "internalWeights": [0.9, 0.9] });
        assert!(update(&conn, "cse", bad.as_object().expect("obj")).is_err());
        let unknown = json!({ "colour": "blue" });
        assert!(update(&conn, "cse", unknown.as_object().expect("obj")).is_err());
        assert_eq!(load(&conn, "cse").expect("load"), DepartmentSettings::default());
    }
}
