use serde_json::json;

use crate::workflow::{Role, WorkflowEvent, WorkflowState};

/// Every recoverable failure the engine can hand back to a caller.
///
/// Each variant carries enough context to render a precise message; the IPC
/// layer turns it into `{code, message, details}` via [`EngineError::code`] and
/// [`EngineError::details`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("{field}: {message}")]
    Validation { field: String, message: String },

    #[error("event '{}' is not allowed from state '{}'", .event.as_str(), .from.as_str())]
    InvalidTransition {
        record_id: String,
        from: WorkflowState,
        event: WorkflowEvent,
    },

    #[error("{} '{actor_id}' may not {action}", .role.as_str())]
    Authorization {
        actor_id: String,
        role: Role,
        action: String,
        allowed: Vec<Role>,
    },

    #[error("edit window closed on {deadline}; an override reason from HOD/Principal/Admin is required")]
    EditWindowExpired {
        record_id: String,
        exam_date: String,
        deadline: String,
        now: String,
    },

    #[error("record {record_id} was modified concurrently (expected version {expected}, found {actual})")]
    ConcurrentModification {
        record_id: String,
        expected: i64,
        actual: i64,
    },

    #[error("insufficient data for {scope}: {reason}")]
    InsufficientData { scope: String, reason: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("storage failure: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn insufficient(scope: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InsufficientData {
            scope: scope.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Authorization { .. } => "authorization_error",
            Self::EditWindowExpired { .. } => "edit_window_expired",
            Self::ConcurrentModification { .. } => "concurrent_modification",
            Self::InsufficientData { .. } => "insufficient_data",
            Self::NotFound { .. } => "not_found",
            Self::Storage(_) => "storage_error",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::Validation { field, .. } => Some(json!({ "field": field })),
            Self::InvalidTransition {
                record_id,
                from,
                event,
            } => Some(json!({
                "markRecordId": record_id,
                "currentState": from.as_str(),
                "event": event.as_str(),
                "terminal": from.is_terminal(),
                "allowedEvents": crate::workflow::allowed_events(*from)
                    .iter()
                    .map(|e| e.as_str())
                    .collect::<Vec<_>>(),
            })),
            Self::Authorization {
                actor_id,
                role,
                action,
                allowed,
            } => Some(json!({
                "actorId": actor_id,
                "role": role.as_str(),
                "action": action,
                "allowedRoles": allowed.iter().map(|r| r.as_str()).collect::<Vec<_>>(),
            })),
            Self::EditWindowExpired {
                record_id,
                exam_date,
                deadline,
                now,
            } => Some(json!({
                "markRecordId": record_id,
                "examDate": exam_date,
                "deadline": deadline,
                "now": now,
            })),
            Self::ConcurrentModification {
                record_id,
                expected,
                actual,
            } => Some(json!({
                "markRecordId": record_id,
                "expectedVersion": expected,
                "actualVersion": actual,
            })),
            Self::InsufficientData { scope, .. } => Some(json!({ "scope": scope })),
            Self::NotFound { entity, id } => Some(json!({ "entity": entity, "id": id })),
            Self::Storage(_) => None,
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("corrupt json column: {e}"))
    }
}
