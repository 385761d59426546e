use serde::{Deserialize, Serialize};

use crate::error::EngineError;

const EPS: f64 = 1e-9;

/// How the two internal exams combine into one internal component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum InternalMethod {
    Best,
    Avg,
    Weighted { w1: f64, w2: f64 },
}

impl InternalMethod {
    pub fn validate(&self) -> Result<(), EngineError> {
        if let Self::Weighted { w1, w2 } = *self {
            if !(w1.is_finite() && w2.is_finite()) || w1 < 0.0 || w2 < 0.0 {
                return Err(EngineError::validation(
                    "internalWeights",
                    "weights must be finite and non-negative",
                ));
            }
            if ((w1 + w2) - 1.0).abs() > 1e-6 {
                return Err(EngineError::validation(
                    "internalWeights",
                    format!("weights must sum to 1 (got {})", w1 + w2),
                ));
            }
        }
        Ok(())
    }

    pub fn combine(&self, internal_1: f64, internal_2: f64) -> f64 {
        match *self {
            Self::Best => internal_1.max(internal_2),
            Self::Avg => (internal_1 + internal_2) / 2.0,
            Self::Weighted { w1, w2 } => internal_1 * w1 + internal_2 * w2,
        }
    }
}

/// Maxima for one subject. Raw exam totals are rescaled onto the subject's
/// internal/external weightage before they are added.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectScheme {
    pub internal_exam_max: f64,
    pub internal_max: f64,
    pub external_exam_max: f64,
    pub external_max: f64,
    pub total_max: f64,
}

impl SubjectScheme {
    pub fn validate(&self) -> Result<(), EngineError> {
        for (field, v) in [
            ("internalExamMax", self.internal_exam_max),
            ("internalMax", self.internal_max),
            ("externalExamMax", self.external_exam_max),
            ("externalMax", self.external_max),
            ("totalMax", self.total_max),
        ] {
            if !v.is_finite() || v <= 0.0 {
                return Err(EngineError::validation(field, "must be > 0"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBand {
    pub min_percent: f64,
    pub grade: String,
    pub grade_point: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailGrade {
    pub grade: String,
    pub grade_point: f64,
}

/// Ordered grade bands, highest boundary first. Each boundary is an inclusive
/// lower bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeTable {
    pub bands: Vec<GradeBand>,
    pub fail: FailGrade,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeResult {
    pub grade: String,
    pub grade_point: f64,
    pub passed: bool,
}

impl GradeTable {
    pub fn new(mut bands: Vec<GradeBand>, fail: FailGrade) -> Result<Self, EngineError> {
        bands.sort_by(|a, b| b.min_percent.total_cmp(&a.min_percent));
        let table = Self { bands, fail };
        table.validate()?;
        Ok(table)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.bands.is_empty() {
            return Err(EngineError::validation("gradeTable", "at least one band is required"));
        }
        for pair in self.bands.windows(2) {
            if pair[1].min_percent >= pair[0].min_percent {
                return Err(EngineError::validation(
                    "gradeTable",
                    "bands must have distinct boundaries in descending order",
                ));
            }
        }
        for b in &self.bands {
            if !(0.0..=100.0).contains(&b.min_percent) {
                return Err(EngineError::validation(
                    "gradeTable.minPercent",
                    format!("boundary {} for {} is outside 0..=100", b.min_percent, b.grade),
                ));
            }
            if b.grade.trim().is_empty() || !b.grade_point.is_finite() || b.grade_point < 0.0 {
                return Err(EngineError::validation(
                    "gradeTable",
                    "every band needs a grade name and a non-negative grade point",
                ));
            }
        }
        if self.fail.grade.trim().is_empty() {
            return Err(EngineError::validation("failGrade.grade", "must not be empty"));
        }
        Ok(())
    }

    /// First band whose lower bound the percentage reaches; otherwise fail.
    pub fn lookup(&self, percent: f64) -> GradeResult {
        match self
            .bands
            .iter()
            .find(|b| percent + EPS >= b.min_percent)
        {
            Some(b) => GradeResult {
                grade: b.grade.clone(),
                grade_point: b.grade_point,
                passed: true,
            },
            None => GradeResult {
                grade: self.fail.grade.clone(),
                grade_point: self.fail.grade_point,
                passed: false,
            },
        }
    }
}

impl Default for GradeTable {
    fn default() -> Self {
        let band = |min: f64, grade: &str, gp: f64| GradeBand {
            min_percent: min,
            grade: grade.to_string(),
            grade_point: gp,
        };
        Self {
            bands: vec![
                band(90.0, "O", 10.0),
                band(80.0, "A+", 9.0),
                band(70.0, "A", 8.0),
                band(60.0, "B+", 7.0),
                band(50.0, "B", 6.0),
                band(45.0, "C", 5.0),
                band(40.0, "P", 4.0),
            ],
            fail: FailGrade {
                grade: "F".to_string(),
                grade_point: 0.0,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalMarkResult {
    pub internal_1: f64,
    pub internal_2: f64,
    pub best_internal: f64,
    pub internal_scaled: f64,
    pub external: f64,
    pub external_scaled: f64,
    pub total: f64,
    pub clipped: bool,
    pub percentage: f64,
    pub grade: String,
    pub grade_point: f64,
    pub passed: bool,
}

fn check_mark(field: &str, v: f64, max: f64) -> Result<(), EngineError> {
    if !v.is_finite() || v < 0.0 {
        return Err(EngineError::validation(field, "must be a non-negative number"));
    }
    if v > max + EPS {
        return Err(EngineError::validation(field, format!("{} exceeds maximum {}", v, max)));
    }
    Ok(())
}

/// Combines the internal exams, rescales both components, clips to the
/// subject maximum, and grades the resulting percentage.
pub fn aggregate(
    internal_1: f64,
    internal_2: f64,
    external: f64,
    method: InternalMethod,
    scheme: &SubjectScheme,
    grades: &GradeTable,
) -> Result<FinalMarkResult, EngineError> {
    method.validate()?;
    scheme.validate()?;
    check_mark("internal1", internal_1, scheme.internal_exam_max)?;
    check_mark("internal2", internal_2, scheme.internal_exam_max)?;
    check_mark("external", external, scheme.external_exam_max)?;

    let best_internal = method.combine(internal_1, internal_2);
    let internal_scaled = best_internal / scheme.internal_exam_max * scheme.internal_max;
    let external_scaled = external / scheme.external_exam_max * scheme.external_max;
    let raw_total = internal_scaled + external_scaled;
    let total = raw_total.min(scheme.total_max);
    let percentage = 100.0 * total / scheme.total_max;
    let grade = grades.lookup(percentage);

    Ok(FinalMarkResult {
        internal_1,
        internal_2,
        best_internal,
        internal_scaled,
        external,
        external_scaled,
        total,
        clipped: raw_total > scheme.total_max + EPS,
        percentage,
        grade: grade.grade,
        grade_point: grade.grade_point,
        passed: grade.passed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheme() -> SubjectScheme {
        SubjectScheme {
            internal_exam_max: 50.0,
            internal_max: 40.0,
            external_exam_max: 100.0,
            external_max: 60.0,
            total_max: 100.0,
        }
    }

    #[test]
    fn boundary_percentage_takes_the_higher_grade() {
        let t = GradeTable::default();
        assert_eq!(t.lookup(80.0).grade, "A+");
        assert_eq!(t.lookup(79.999).grade, "A");
        assert_eq!(t.lookup(90.0).grade, "O");
        let f = t.lookup(39.9);
        assert_eq!(f.grade, "F");
        assert!(!f.passed);
        assert_eq!(f.grade_point, 0.0);
    }

    #[test]
    fn methods_combine_internals() {
        assert_eq!(InternalMethod::Best.combine(30.0, 42.0), 42.0);
        assert_eq!(InternalMethod::Avg.combine(30.0, 42.0), 36.0);
        let w = InternalMethod::Weighted { w1: 0.25, w2: 0.75 };
        assert_eq!(w.combine(40.0, 20.0), 25.0);
        assert!(InternalMethod::Weighted { w1: 0.5, w2: 0.6 }.validate().is_err());
    }

    #[test]
    fn aggregate_scales_components_and_grades() {
        let r = aggregate(40.0, 45.0, 80.0, InternalMethod::Best, &scheme(), &GradeTable::default())
            .expect("aggregate");
        assert_eq!(r.best_internal, 45.0);
        assert_eq!(r.internal_scaled, 36.0);
        assert_eq!(r.external_scaled, 48.0);
        assert_eq!(r.total, 84.0);
        assert_eq!(r.grade, "A+");
        assert!(!r.clipped);
    }

    #[test]
    fn total_is_clipped_to_subject_max() {
        let s = SubjectScheme {
            internal_exam_max: 50.0,
            internal_max: 50.0,
            external_exam_max: 100.0,
            external_max: 60.0,
            total_max: 100.0,
        };
        let r = aggregate(50.0, 50.0, 100.0, InternalMethod::Avg, &s, &GradeTable::default())
            .expect("aggregate");
        assert_eq!(r.total, 100.0);
        assert!(r.clipped);
        assert_eq!(r.grade, "O");
    }

    #[test]
    fn out_of_range_inputs_are_validation_errors() {
        let e = aggregate(51.0, 0.0, 0.0, InternalMethod::Best, &scheme(), &GradeTable::default())
            .expect_err("internal over max");
        assert_eq!(e.code(), "validation_error");
        assert!(aggregate(1.0, 1.0, -1.0, InternalMethod::Best, &scheme(), &GradeTable::default()).is_err());
    }

    #[test]
    fn grade_table_rejects_duplicate_boundaries() {
        let fail = FailGrade { grade: "F".into(), grade_point: 0.0 };
        let bands = vec![
            GradeBand { min_percent: 50.0, grade: "B".into(), grade_point: 6.0 },
            GradeBand { min_percent: 50.0, grade: "C".into(), grade_point: 5.0 },
        ];
        assert!(GradeTable::new(bands, fail).is_err());
    }
}
