//! Mark record lifecycle.
//!
//! Who may do what is data: [`TRANSITIONS`] lists every legal
//! `(from, event) -> to` edge with its roles and guard, including the
//! same-state edit edges. [`authorize`] is the only place a rule is
//! evaluated; [`apply`] and [`authorize_edit`] build on it.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::NewAuditEntry;
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Draft,
    Submitted,
    Approved,
    Rejected,
    Frozen,
    Published,
}

impl WorkflowState {
    pub const ALL: [WorkflowState; 6] = [
        Self::Draft,
        Self::Submitted,
        Self::Approved,
        Self::Rejected,
        Self::Frozen,
        Self::Published,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Frozen => "frozen",
            Self::Published => "published",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s.trim()))
    }

    /// Approved or later: counts toward aggregation and attainment.
    pub fn is_finalized(self) -> bool {
        matches!(self, Self::Approved | Self::Frozen | Self::Published)
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Published
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEvent {
    Submit,
    Approve,
    Reject,
    Reopen,
    Resubmit,
    Freeze,
    Publish,
    EditScore,
    OverrideEdit,
}

impl WorkflowEvent {
    pub const ALL: [WorkflowEvent; 9] = [
        Self::Submit,
        Self::Approve,
        Self::Reject,
        Self::Reopen,
        Self::Resubmit,
        Self::Freeze,
        Self::Publish,
        Self::EditScore,
        Self::OverrideEdit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Reopen => "reopen",
            Self::Resubmit => "resubmit",
            Self::Freeze => "freeze",
            Self::Publish => "publish",
            Self::EditScore => "edit_score",
            Self::OverrideEdit => "override_edit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|ev| ev.as_str().eq_ignore_ascii_case(s.trim()))
    }

    pub fn is_edit(self) -> bool {
        matches!(self, Self::EditScore | Self::OverrideEdit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Teacher,
    Hod,
    Principal,
    Admin,
    Student,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Teacher => "teacher",
            Self::Hod => "hod",
            Self::Principal => "principal",
            Self::Admin => "admin",
            Self::Student => "student",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "teacher" => Some(Self::Teacher),
            "hod" => Some(Self::Hod),
            "principal" => Some(Self::Principal),
            "admin" => Some(Self::Admin),
            "student" => Some(Self::Student),
            _ => None,
        }
    }

    pub fn is_privileged(self) -> bool {
        matches!(self, Self::Hod | Self::Principal | Self::Admin)
    }
}

/// Identity as supplied by the authorization collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub department_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    Always,
    RequiredScoresEntered,
    ReasonRequired,
    WithinEditWindow,
}

#[derive(Debug, Clone, Copy)]
pub struct TransitionRule {
    pub from: WorkflowState,
    pub event: WorkflowEvent,
    pub to: WorkflowState,
    pub roles: &'static [Role],
    pub guard: Guard,
}

const TEACHER: &[Role] = &[Role::Teacher];
pub const REVIEWERS: &[Role] = &[Role::Hod, Role::Principal, Role::Admin];
pub const FREEZERS: &[Role] = &[Role::Principal, Role::Admin];

const fn rule(
    from: WorkflowState,
    event: WorkflowEvent,
    to: WorkflowState,
    roles: &'static [Role],
    guard: Guard,
) -> TransitionRule {
    TransitionRule {
        from,
        event,
        to,
        roles,
        guard,
    }
}

use WorkflowEvent as E;
use WorkflowState as S;

pub const TRANSITIONS: &[TransitionRule] = &[
    rule(S::Draft, E::Submit, S::Submitted, TEACHER, Guard::RequiredScoresEntered),
    rule(S::Submitted, E::Approve, S::Approved, REVIEWERS, Guard::Always),
    rule(S::Submitted, E::Reject, S::Rejected, REVIEWERS, Guard::ReasonRequired),
    rule(S::Rejected, E::Reopen, S::Draft, TEACHER, Guard::Always),
    rule(S::Rejected, E::Resubmit, S::Submitted, TEACHER, Guard::RequiredScoresEntered),
    rule(S::Approved, E::Freeze, S::Frozen, FREEZERS, Guard::Always),
    rule(S::Frozen, E::Publish, S::Published, REVIEWERS, Guard::Always),
    rule(S::Draft, E::EditScore, S::Draft, TEACHER, Guard::WithinEditWindow),
    rule(S::Rejected, E::EditScore, S::Rejected, TEACHER, Guard::WithinEditWindow),
    rule(S::Draft, E::OverrideEdit, S::Draft, REVIEWERS, Guard::ReasonRequired),
    rule(S::Submitted, E::OverrideEdit, S::Submitted, REVIEWERS, Guard::ReasonRequired),
    rule(S::Approved, E::OverrideEdit, S::Approved, REVIEWERS, Guard::ReasonRequired),
    rule(S::Rejected, E::OverrideEdit, S::Rejected, REVIEWERS, Guard::ReasonRequired),
    rule(S::Frozen, E::OverrideEdit, S::Frozen, REVIEWERS, Guard::ReasonRequired),
];

pub fn find_rule(from: WorkflowState, event: WorkflowEvent) -> Option<&'static TransitionRule> {
    TRANSITIONS
        .iter()
        .find(|r| r.from == from && r.event == event)
}

/// State-changing events legal from `from` (edit edges excluded).
pub fn allowed_events(from: WorkflowState) -> Vec<WorkflowEvent> {
    TRANSITIONS
        .iter()
        .filter(|r| r.from == from && !r.event.is_edit())
        .map(|r| r.event)
        .collect()
}

/// Free-edit period for teachers: through the end of day
/// `exam_date + days` (UTC calendar date), inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditWindow {
    pub exam_date: NaiveDate,
    pub days: u32,
}

impl EditWindow {
    pub fn deadline(&self) -> NaiveDate {
        self.exam_date + Duration::days(i64::from(self.days))
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        now.date_naive() <= self.deadline()
    }
}

/// Everything a guard or scope check needs to know about one record.
#[derive(Debug, Clone)]
pub struct RecordContext {
    pub record_id: String,
    pub state: WorkflowState,
    pub owner_teacher_id: String,
    pub department_id: String,
    pub required_scores_entered: bool,
    pub edit_window: Option<EditWindow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: WorkflowState,
    pub to: WorkflowState,
    pub event: WorkflowEvent,
    pub audit: NewAuditEntry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditMode {
    Regular { reason: Option<String> },
    Override { reason: String },
}

impl EditMode {
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Regular { reason } => reason.as_deref(),
            Self::Override { reason } => Some(reason.as_str()),
        }
    }
}

fn in_scope(actor: &Actor, ctx: &RecordContext) -> bool {
    match actor.role {
        Role::Teacher => actor.id == ctx.owner_teacher_id,
        Role::Hod => actor.department_id.as_deref() == Some(ctx.department_id.as_str()),
        Role::Principal | Role::Admin => true,
        Role::Student => false,
    }
}

fn non_empty(reason: Option<&str>) -> Option<&str> {
    reason.map(str::trim).filter(|r| !r.is_empty())
}

/// Looks up the rule for `(ctx.state, event)` and checks role, scope, and
/// guard. Nothing is mutated; on error the caller must leave the record as is.
pub fn authorize(
    ctx: &RecordContext,
    actor: &Actor,
    event: WorkflowEvent,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<&'static TransitionRule, EngineError> {
    let Some(rule) = find_rule(ctx.state, event) else {
        return Err(EngineError::InvalidTransition {
            record_id: ctx.record_id.clone(),
            from: ctx.state,
            event,
        });
    };

    if !rule.roles.contains(&actor.role) || !in_scope(actor, ctx) {
        return Err(EngineError::Authorization {
            actor_id: actor.id.clone(),
            role: actor.role,
            action: format!("{} mark record {}", event.as_str(), ctx.record_id),
            allowed: rule.roles.to_vec(),
        });
    }

    match rule.guard {
        Guard::Always => {}
        Guard::RequiredScoresEntered => {
            if !ctx.required_scores_entered {
                return Err(EngineError::validation(
                    "scores",
                    "all required scores must be entered before submitting",
                ));
            }
        }
        Guard::ReasonRequired => {
            if non_empty(reason).is_none() {
                let field = if event == WorkflowEvent::OverrideEdit {
                    "overrideReason"
                } else {
                    "reason"
                };
                return Err(EngineError::validation(field, "a non-empty reason is required"));
            }
        }
        Guard::WithinEditWindow => {
            let Some(window) = ctx.edit_window else {
                return Err(EngineError::validation(
                    "examDate",
                    "component has no exam date; edit window cannot be evaluated",
                ));
            };
            if !window.contains(now) {
                return Err(EngineError::EditWindowExpired {
                    record_id: ctx.record_id.clone(),
                    exam_date: window.exam_date.to_string(),
                    deadline: window.deadline().to_string(),
                    now: now.to_rfc3339(),
                });
            }
        }
    }
    Ok(rule)
}

/// Runs a state-changing event and returns the new state with the audit entry
/// the caller must persist in the same unit of work.
pub fn apply(
    ctx: &RecordContext,
    actor: &Actor,
    event: WorkflowEvent,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Transition, EngineError> {
    if event.is_edit() {
        return Err(EngineError::validation(
            "event",
            "score edits go through authorize_edit",
        ));
    }
    let rule = authorize(ctx, actor, event, reason, now)?;
    let audit_reason = match rule.guard {
        Guard::ReasonRequired => non_empty(reason).map(str::to_string),
        _ => None,
    };
    Ok(Transition {
        from: rule.from,
        to: rule.to,
        event,
        audit: NewAuditEntry {
            mark_record_id: ctx.record_id.clone(),
            actor_id: actor.id.clone(),
            field: "workflow_state".to_string(),
            old_value: Some(rule.from.as_str().to_string()),
            new_value: Some(rule.to.as_str().to_string()),
            reason: audit_reason,
            timestamp: now,
        },
    })
}

/// Role and department scope for actions outside the record table
/// (final mark snapshots, backlog clearing, outcome mappings).
pub fn authorize_action(
    actor: &Actor,
    allowed: &[Role],
    department_id: &str,
    action: &str,
) -> Result<(), EngineError> {
    let scoped = match actor.role {
        Role::Hod => actor.department_id.as_deref() == Some(department_id),
        _ => true,
    };
    if allowed.contains(&actor.role) && scoped {
        return Ok(());
    }
    Err(EngineError::Authorization {
        actor_id: actor.id.clone(),
        role: actor.role,
        action: action.to_string(),
        allowed: allowed.to_vec(),
    })
}

/// Read access to one record. Staff follow the same scope as transitions;
/// a student sees only their own record, and only once it is published.
pub fn authorize_view(ctx: &RecordContext, student_id: &str, actor: &Actor) -> Result<(), EngineError> {
    let visible = match actor.role {
        Role::Student => actor.id == student_id && ctx.state == WorkflowState::Published,
        _ => in_scope(actor, ctx),
    };
    if visible {
        return Ok(());
    }
    Err(EngineError::Authorization {
        actor_id: actor.id.clone(),
        role: actor.role,
        action: format!("view mark record {}", ctx.record_id),
        allowed: vec![Role::Teacher, Role::Hod, Role::Principal, Role::Admin],
    })
}

/// Which rows a list query may return for an actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadScope {
    Everything,
    Department(String),
    /// Assignments taught by this teacher.
    Teacher(String),
    /// One student's own rows, published only.
    OwnPublished(String),
}

/// List-level counterpart of [`authorize_view`].
pub fn read_scope(actor: &Actor) -> Result<ReadScope, EngineError> {
    Ok(match actor.role {
        Role::Principal | Role::Admin => ReadScope::Everything,
        Role::Teacher => ReadScope::Teacher(actor.id.clone()),
        Role::Student => ReadScope::OwnPublished(actor.id.clone()),
        Role::Hod => match &actor.department_id {
            Some(dept) => ReadScope::Department(dept.clone()),
            None => {
                return Err(EngineError::Authorization {
                    actor_id: actor.id.clone(),
                    role: actor.role,
                    action: "list records without a department".to_string(),
                    allowed: vec![Role::Principal, Role::Admin],
                })
            }
        },
    })
}

/// Decides whether `actor` may change a raw score on this record right now.
/// Privileged roles always go through the override edge (reason required);
/// everyone else through the windowed teacher edge.
pub fn authorize_edit(
    ctx: &RecordContext,
    actor: &Actor,
    override_reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<EditMode, EngineError> {
    let event = if actor.role.is_privileged() {
        WorkflowEvent::OverrideEdit
    } else {
        WorkflowEvent::EditScore
    };
    authorize(ctx, actor, event, override_reason, now)?;
    let reason = non_empty(override_reason).map(str::to_string);
    Ok(match (event, reason) {
        (WorkflowEvent::OverrideEdit, Some(reason)) => EditMode::Override { reason },
        (_, reason) => EditMode::Regular { reason },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx(state: WorkflowState) -> RecordContext {
        RecordContext {
            record_id: "rec-1".into(),
            state,
            owner_teacher_id: "t1".into(),
            department_id: "cse".into(),
            required_scores_entered: true,
            edit_window: Some(EditWindow {
                exam_date: NaiveDate::from_ymd_opt(2026, 3, 10).expect("date"),
                days: 7,
            }),
        }
    }

    fn actor(id: &str, role: Role, dept: Option<&str>) -> Actor {
        Actor {
            id: id.into(),
            role,
            department_id: dept.map(str::to_string),
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).single().expect("time")
    }

    fn now() -> DateTime<Utc> {
        at(2026, 3, 12, 9)
    }

    #[test]
    fn unlisted_pairs_are_invalid_transitions() {
        let admin = actor("a1", Role::Admin, None);
        let teacher = actor("t1", Role::Teacher, Some("cse"));
        for state in WorkflowState::ALL {
            for event in WorkflowEvent::ALL {
                if find_rule(state, event).is_some() {
                    continue;
                }
                for who in [&admin, &teacher] {
                    let c = ctx(state);
                    let err = if event.is_edit() {
                        authorize(&c, who, event, Some("why"), now()).expect_err("edit")
                    } else {
                        apply(&c, who, event, Some("why"), now()).expect_err("transition")
                    };
                    assert!(
                        matches!(err, EngineError::InvalidTransition { from, event: ev, .. } if from == state && ev == event),
                        "{:?} + {:?} gave {:?}",
                        state,
                        event,
                        err
                    );
                    assert_eq!(c.state, state);
                }
            }
        }
    }

    #[test]
    fn published_is_terminal() {
        assert!(allowed_events(WorkflowState::Published).is_empty());
        let admin = actor("a1", Role::Admin, None);
        let e = authorize_edit(&ctx(WorkflowState::Published), &admin, Some("late fix"), now())
            .expect_err("no edits after publish");
        assert_eq!(e.code(), "invalid_transition");
    }

    #[test]
    fn reject_requires_reason_and_records_it() {
        let hod = actor("h1", Role::Hod, Some("cse"));
        let e = apply(&ctx(WorkflowState::Submitted), &hod, WorkflowEvent::Reject, Some("  "), now())
            .expect_err("blank reason");
        assert_eq!(e.code(), "validation_error");

        let t = apply(
            &ctx(WorkflowState::Submitted),
            &hod,
            WorkflowEvent::Reject,
            Some("incomplete"),
            now(),
        )
        .expect("reject");
        assert_eq!(t.to, WorkflowState::Rejected);
        assert_eq!(t.audit.reason.as_deref(), Some("incomplete"));
        assert_eq!(t.audit.old_value.as_deref(), Some("submitted"));
        assert_eq!(t.audit.new_value.as_deref(), Some("rejected"));
    }

    #[test]
    fn approve_does_not_carry_a_reason() {
        let hod = actor("h1", Role::Hod, Some("cse"));
        let t = apply(
            &ctx(WorkflowState::Submitted),
            &hod,
            WorkflowEvent::Approve,
            Some("looks fine"),
            now(),
        )
        .expect("approve");
        assert_eq!(t.audit.reason, None);
    }

    #[test]
    fn roles_and_scope_are_enforced() {
        let other_teacher = actor("t2", Role::Teacher, Some("cse"));
        let e = apply(&ctx(WorkflowState::Draft), &other_teacher, WorkflowEvent::Submit, None, now())
            .expect_err("not owner");
        assert_eq!(e.code(), "authorization_error");

        let foreign_hod = actor("h9", Role::Hod, Some("mech"));
        let e = apply(&ctx(WorkflowState::Submitted), &foreign_hod, WorkflowEvent::Approve, None, now())
            .expect_err("other department");
        assert_eq!(e.code(), "authorization_error");

        let hod = actor("h1", Role::Hod, Some("cse"));
        let e = apply(&ctx(WorkflowState::Approved), &hod, WorkflowEvent::Freeze, None, now())
            .expect_err("hod cannot freeze");
        assert_eq!(e.code(), "authorization_error");

        let principal = actor("p1", Role::Principal, None);
        let t = apply(&ctx(WorkflowState::Approved), &principal, WorkflowEvent::Freeze, None, now())
            .expect("principal freezes");
        assert_eq!(t.to, WorkflowState::Frozen);
    }

    #[test]
    fn submit_requires_all_scores() {
        let teacher = actor("t1", Role::Teacher, Some("cse"));
        let mut c = ctx(WorkflowState::Draft);
        c.required_scores_entered = false;
        let e = apply(&c, &teacher, WorkflowEvent::Submit, None, now()).expect_err("missing scores");
        assert_eq!(e.code(), "validation_error");
    }

    #[test]
    fn edit_window_is_inclusive_of_day_n() {
        let teacher = actor("t1", Role::Teacher, Some("cse"));
        let c = ctx(WorkflowState::Draft);

        let last_second = Utc
            .with_ymd_and_hms(2026, 3, 17, 23, 59, 59)
            .single()
            .expect("time");
        assert!(authorize_edit(&c, &teacher, None, at(2026, 3, 17, 0)).is_ok());
        assert!(authorize_edit(&c, &teacher, None, last_second).is_ok());

        let e = authorize_edit(&c, &teacher, None, at(2026, 3, 18, 0)).expect_err("day N+1");
        match e {
            EngineError::EditWindowExpired { deadline, .. } => assert_eq!(deadline, "2026-03-17"),
            other => panic!("unexpected {other:?}"),
        }

        let e = authorize_edit(&c, &teacher, Some("please"), at(2026, 3, 18, 0))
            .expect_err("teachers cannot self-override");
        assert_eq!(e.code(), "edit_window_expired");
    }

    #[test]
    fn override_edit_needs_reason_and_privilege() {
        let hod = actor("h1", Role::Hod, Some("cse"));
        let late = at(2026, 4, 1, 0);
        let e = authorize_edit(&ctx(WorkflowState::Approved), &hod, None, late).expect_err("no reason");
        assert_eq!(e.code(), "validation_error");

        let mode = authorize_edit(&ctx(WorkflowState::Approved), &hod, Some("re-evaluation"), late)
            .expect("override");
        assert_eq!(mode, EditMode::Override { reason: "re-evaluation".into() });

        let teacher = actor("t1", Role::Teacher, Some("cse"));
        let e = authorize_edit(&ctx(WorkflowState::Submitted), &teacher, None, now())
            .expect_err("submitted is locked for teachers");
        assert_eq!(e.code(), "invalid_transition");

        let student = actor("s1", Role::Student, None);
        let e = authorize_edit(&ctx(WorkflowState::Draft), &student, None, now()).expect_err("student");
        assert_eq!(e.code(), "authorization_error");
    }

    #[test]
    fn action_scope_follows_department() {
        let hod = actor("h1", Role::Hod, Some("cse"));
        assert!(authorize_action(&hod, REVIEWERS, "cse", "publish").is_ok());
        assert!(authorize_action(&hod, REVIEWERS, "mech", "publish").is_err());
        assert!(authorize_action(&hod, FREEZERS, "cse", "freeze").is_err());
        let admin = actor("a1", Role::Admin, None);
        assert!(authorize_action(&admin, FREEZERS, "mech", "freeze").is_ok());
    }

    #[test]
    fn students_only_see_their_own_published_record() {
        let owner = actor("s1", Role::Student, None);
        let other = actor("s2", Role::Student, None);
        assert!(authorize_view(&ctx(WorkflowState::Frozen), "s1", &owner).is_err());
        assert!(authorize_view(&ctx(WorkflowState::Published), "s1", &owner).is_ok());
        assert!(authorize_view(&ctx(WorkflowState::Published), "s1", &other).is_err());

        let foreign_hod = actor("h9", Role::Hod, Some("mech"));
        assert!(authorize_view(&ctx(WorkflowState::Draft), "s1", &foreign_hod).is_err());
        let teacher = actor("t1", Role::Teacher, Some("cse"));
        assert!(authorize_view(&ctx(WorkflowState::Draft), "s1", &teacher).is_ok());
    }

    #[test]
    fn read_scope_narrows_by_role() {
        assert_eq!(read_scope(&actor("p1", Role::Principal, None)).expect("p"), ReadScope::Everything);
        assert_eq!(
            read_scope(&actor("h1", Role::Hod, Some("cse"))).expect("h"),
            ReadScope::Department("cse".into())
        );
        assert_eq!(read_scope(&actor("t1", Role::Teacher, Some("cse"))).expect("t"), ReadScope::Teacher("t1".into()));
        assert_eq!(read_scope(&actor("s1", Role::Student, None)).expect("s"), ReadScope::OwnPublished("s1".into()));
        let e = read_scope(&actor("h2", Role::Hod, None)).expect_err("hod without department");
        assert_eq!(e.code(), "authorization_error");
    }

    #[test]
    fn parse_round_trips_names() {
        for s in WorkflowState::ALL {
            assert_eq!(WorkflowState::parse(s.as_str()), Some(s));
        }
        assert_eq!(WorkflowEvent::parse("Reject"), Some(WorkflowEvent::Reject));
        assert_eq!(Role::parse("HOD"), Some(Role::Hod));
        assert_eq!(Role::parse("dean"), None);
    }
}
