//! Error types for the rollback engine
//!
//! Provides error handling for:
//! - The public API (approval, conflicts, unknown ids, invalid states)
//! - Collaborator failures (snapshot capture, step and validation runners)
//! - Plan construction, repositories and configuration

use crate::types::{
    Environment, ExecutionId, ExecutionStatus, PlanId, SnapshotComponent,
};
use std::fmt;
use std::path::PathBuf;

/// Result alias used across the crate
pub type RollbackResult<T> = Result<T, RollbackError>;

/// Main rollback error type
#[derive(Debug, thiserror::Error)]
pub enum RollbackError {
    /// Plan needs a named approver
    #[error("plan {plan_id} requires approval before it can execute")]
    ApprovalRequired { plan_id: PlanId },

    /// Another execution holds the environment
    #[error("environment {environment} already has an active execution ({active_execution})")]
    Conflict {
        environment: Environment,
        active_execution: ExecutionId,
    },

    /// A pre/post validation check failed
    #[error("validation '{check}' failed: {reason}")]
    ValidationFailure { check: String, reason: String },

    /// A step failed after exhausting its retries
    #[error("step '{step}' failed after {attempts} attempt(s): {reason}")]
    StepExecutionFailure {
        step: String,
        attempts: u32,
        reason: String,
    },

    /// Point creation aborted by the snapshot collaborator
    #[error("snapshot capture failed: {0}")]
    SnapshotCapture(#[from] SnapshotError),

    /// Every retention slot of the environment is pinned
    #[error("rollback point store for {environment} is full ({capacity} pinned)")]
    StoreFull {
        environment: Environment,
        capacity: usize,
    },

    /// Unknown identifier
    #[error("{entity} not found: {id}")]
    NotFound { entity: Entity, id: String },

    /// Operation not valid in the current state
    #[error("cannot {operation} {entity} {id} while it is {state}")]
    InvalidState {
        entity: Entity,
        id: String,
        state: String,
        operation: &'static str,
    },

    /// Plan construction failed
    #[error("plan construction failed: {0}")]
    Plan(#[from] PlanError),

    /// Backing store failed
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Illegal execution state transition
    #[error("state machine error: {0}")]
    StateMachine(#[from] StateMachineError),
}

impl RollbackError {
    /// Shorthand for [`RollbackError::NotFound`]
    #[inline]
    pub fn not_found(entity: Entity, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Shorthand for [`RollbackError::InvalidState`]
    #[inline]
    pub fn invalid_state(
        entity: Entity,
        id: impl ToString,
        state: impl ToString,
        operation: &'static str,
    ) -> Self {
        Self::InvalidState {
            entity,
            id: id.to_string(),
            state: state.to_string(),
            operation,
        }
    }

    /// A person has to act before this can succeed
    #[inline]
    #[must_use]
    pub fn requires_human(&self) -> bool {
        matches!(self, Self::ApprovalRequired { .. } | Self::StoreFull { .. })
    }

    /// Retrying the same call later may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. }
                | Self::StepExecutionFailure { .. }
                | Self::Repository(RepositoryError::Unavailable(_))
                | Self::SnapshotCapture(SnapshotError::Unavailable(_))
        )
    }
}

/// Entity named in lookup and state errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    /// Rollback point
    RollbackPoint,
    /// Rollback plan
    Plan,
    /// Execution
    Execution,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Entity::RollbackPoint => "rollback point",
            Entity::Plan => "rollback plan",
            Entity::Execution => "execution",
        })
    }
}

/// Snapshot capture failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    /// A component could not be captured
    #[error("{component} capture failed: {reason}")]
    CaptureFailed {
        component: SnapshotComponent,
        reason: String,
    },

    /// The capture backend is unreachable
    #[error("snapshot backend unavailable: {0}")]
    Unavailable(String),
}

/// Step runner failures (one attempt)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    /// Deadline elapsed
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Command or action failed
    #[error("{0}")]
    Failed(String),
}

impl StepError {
    /// Deadline elapsed
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Validation runner failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Deadline elapsed
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The check could not produce a result
    #[error("{0}")]
    CheckFailed(String),

    /// The check returned something other than the expected value
    #[error("expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },
}

/// Plan construction failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// Step dependencies form a cycle
    #[error("dependency cycle through step '{step}'")]
    Cycle { step: String },

    /// A step depends on a step that is not part of the plan
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },
}

/// Repository failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    /// Insert of an id that already exists
    #[error("duplicate record: {0}")]
    Duplicate(String),

    /// Update of an id that does not exist
    #[error("missing record: {0}")]
    Missing(String),

    /// Backend unreachable
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Configuration failures
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file unreadable
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file malformed
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config could not be rendered
    #[error("cannot render TOML: {0}")]
    Render(#[from] toml::ser::Error),

    /// Semantically invalid value
    #[error("{0}")]
    Invalid(String),
}

/// Execution state machine violations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    /// Transition not in the allowed table
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
}

/// Audit trail integrity failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    /// Hash chain broken at a record
    #[error("audit chain broken at record {sequence}")]
    ChainBroken { sequence: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_error_display() {
        let err = RollbackError::ApprovalRequired {
            plan_id: PlanId::new(),
        };
        assert!(err.to_string().contains("requires approval"));

        let err = RollbackError::not_found(Entity::Execution, "abc");
        assert_eq!(err.to_string(), "execution not found: abc");
    }

    #[test]
    fn rollback_error_requires_human() {
        let err = RollbackError::ApprovalRequired {
            plan_id: PlanId::new(),
        };
        assert!(err.requires_human());
        assert!(!RollbackError::not_found(Entity::Plan, "x").requires_human());
    }

    #[test]
    fn rollback_error_is_retryable() {
        let conflict = RollbackError::Conflict {
            environment: Environment::Staging,
            active_execution: ExecutionId::new(),
        };
        assert!(conflict.is_retryable());
        assert!(
            RollbackError::from(SnapshotError::Unavailable("down".into())).is_retryable()
        );
        assert!(!RollbackError::from(SnapshotError::CaptureFailed {
            component: SnapshotComponent::Database,
            reason: "locked".into(),
        })
        .is_retryable());
        assert!(!RollbackError::invalid_state(Entity::Execution, "x", "completed", "cancel")
            .is_retryable());
    }

    #[test]
    fn invalid_state_names_operation() {
        let err = RollbackError::invalid_state(
            Entity::Execution,
            "01H",
            ExecutionStatus::Completed,
            "cancel",
        );
        assert_eq!(
            err.to_string(),
            "cannot cancel execution 01H while it is completed"
        );
    }

    #[test]
    fn step_error_timeout() {
        assert!(StepError::Timeout { secs: 5 }.is_timeout());
        assert!(!StepError::Failed("exit 1".into()).is_timeout());
        assert_eq!(StepError::Timeout { secs: 5 }.to_string(), "timed out after 5s");
    }
}
