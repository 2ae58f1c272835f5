//! Core types for the rollback engine
//!
//! Defines the fundamental records shared by every component:
//! - Identifiers (ULIDs, opaque handles)
//! - Rollback points and their risks
//! - Plans, rollback steps and validation steps
//! - Execution records and per-step outcomes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use ulid::Ulid;

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Ulid);

        impl $name {
            /// Generate a fresh identifier
            #[inline]
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(s).map(Self)
            }
        }
    };
}

ulid_id!(
    /// Unique rollback point identifier
    RollbackPointId
);
ulid_id!(
    /// Unique rollback plan identifier
    PlanId
);
ulid_id!(
    /// Unique step identifier (rollback and validation steps share the space)
    StepId
);
ulid_id!(
    /// Unique execution identifier
    ExecutionId
);

/// Error returned when parsing one of the string-backed enums
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: '{value}'")]
pub struct ParseEnumError {
    /// Which enum was being parsed
    pub kind: &'static str,
    /// The rejected input
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Every variant, in declaration order
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Stable wire name
            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $label,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// The kind of change a rollback point protects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Application deployment
    Deployment,
    /// Configuration change
    Config,
    /// Database migration or data change
    Database,
    /// Feature flag change
    Feature,
    /// Host / system level change
    System,
}

string_enum!(ChangeKind, "change kind", {
    Deployment => "deployment",
    Config => "config",
    Database => "database",
    Feature => "feature",
    System => "system",
});

/// Target environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    /// Developer environment
    Development,
    /// Pre-production
    Staging,
    /// Production
    Production,
}

string_enum!(Environment, "environment", {
    Development => "development",
    Staging => "staging",
    Production => "production",
});

/// Lifecycle of a rollback point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointStatus {
    /// Usable for planning
    Active,
    /// Pushed out by the count bound
    Archived,
    /// Pushed out by the age bound
    Expired,
}

string_enum!(PointStatus, "point status", {
    Active => "active",
    Archived => "archived",
    Expired => "expired",
});

/// Category of risk attached to a point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskKind {
    /// Data may be lost
    DataLoss,
    /// Service may be unavailable
    Downtime,
    /// Service may be degraded
    Performance,
    /// Clients may break
    Compatibility,
}

string_enum!(RiskKind, "risk kind", {
    DataLoss => "data_loss",
    Downtime => "downtime",
    Performance => "performance",
    Compatibility => "compatibility",
});

/// Severity scale shared by risks and execution errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Low
    Low,
    /// Medium
    Medium,
    /// High
    High,
    /// Critical
    Critical,
}

string_enum!(Severity, "severity", {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

/// What a rollback step touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Filesystem restore
    File,
    /// Database restore
    Database,
    /// Configuration restore
    Config,
    /// Service lifecycle
    Service,
    /// Health / sanity check
    Validation,
}

string_enum!(StepKind, "step kind", {
    File => "file",
    Database => "database",
    Config => "config",
    Service => "service",
    Validation => "validation",
});

/// What a validation step checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationKind {
    /// System health
    Health,
    /// Snapshot / data integrity
    Integrity,
    /// End-to-end functional smoke test
    Functional,
}

string_enum!(ValidationKind, "validation kind", {
    Health => "health",
    Integrity => "integrity",
    Functional => "functional",
});

/// Execution state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, not yet started
    Pending,
    /// Steps are running
    InProgress,
    /// Every step processed without a fatal failure
    Completed,
    /// Aborted by a fatal failure
    Failed,
    /// Cancelled by an operator
    Cancelled,
}

string_enum!(ExecutionStatus, "execution status", {
    Pending => "pending",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl ExecutionStatus {
    /// No transition leaves a terminal state
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Holds the environment lease
    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

/// Outcome of one attempted step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not started
    Pending,
    /// Dispatched to a runner
    InProgress,
    /// Succeeded
    Completed,
    /// Failed after exhausting retries
    Failed,
    /// Never dispatched
    Skipped,
}

string_enum!(StepStatus, "step status", {
    Pending => "pending",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
    Skipped => "skipped",
});

/// A risk attached to a rollback point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Risk {
    /// Risk category
    pub kind: RiskKind,
    /// Severity
    pub severity: Severity,
    /// Likelihood in percent (0 - 100)
    pub probability: u8,
    /// Human-readable description
    pub description: String,
    /// Suggested mitigation
    pub mitigation: String,
}

impl Risk {
    /// Create a risk; probability is clamped to 100
    #[inline]
    #[must_use]
    pub fn new(kind: RiskKind, severity: Severity, probability: u8) -> Self {
        Self {
            kind,
            severity,
            probability: probability.min(100),
            description: String::new(),
            mitigation: String::new(),
        }
    }

    /// With description
    #[inline]
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// With mitigation
    #[inline]
    #[must_use]
    pub fn with_mitigation(mut self, mitigation: impl Into<String>) -> Self {
        self.mitigation = mitigation.into();
        self
    }
}

/// Part of the system captured in a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotComponent {
    /// Application files
    Files,
    /// Database state
    Database,
    /// Environment configuration
    Config,
    /// Feature flag states
    FeatureFlags,
    /// Host environment
    Environment,
}

string_enum!(SnapshotComponent, "snapshot component", {
    Files => "files",
    Database => "database",
    Config => "config",
    FeatureFlags => "feature_flags",
    Environment => "environment",
});

/// Opaque reference to captured snapshot content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    /// SHA-256 of the captured content (hex)
    pub digest: String,
    /// Capture time
    pub captured_at: DateTime<Utc>,
    /// Components included in the capture
    pub components: Vec<SnapshotComponent>,
}

/// An immutable, timestamped snapshot reference plus risk assessment
///
/// Everything except `status` is fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackPoint {
    /// Identifier
    pub id: RollbackPointId,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Change kind
    pub kind: ChangeKind,
    /// Description of the change being protected
    pub description: String,
    /// Version the point restores to
    pub version: String,
    /// Environment
    pub environment: Environment,
    /// Lifecycle status
    pub status: PointStatus,
    /// Actor that created the point
    pub created_by: String,
    /// Assessed risks
    pub risks: Vec<Risk>,
    /// Points this one depends on
    pub dependencies: Vec<RollbackPointId>,
    /// Snapshot reference
    pub snapshot: SnapshotRef,
}

impl RollbackPoint {
    /// Usable for planning
    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == PointStatus::Active
    }

    /// Age relative to `now` (zero if created in the future)
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.created_at).max(chrono::Duration::zero())
    }

    /// Highest assessed risk severity
    #[must_use]
    pub fn max_severity(&self) -> Option<Severity> {
        self.risks.iter().map(|r| r.severity).max()
    }
}

/// One ordered step of a rollback plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackStep {
    /// Identifier
    pub id: StepId,
    /// 1-based position in the plan
    pub order: u32,
    /// What the step touches
    pub kind: StepKind,
    /// Action name handed to the step runner
    pub action: String,
    /// Human-readable description
    pub description: String,
    /// Whether the step runs without a human
    pub automated: bool,
    /// Per-attempt deadline
    pub timeout_secs: u64,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Steps that must run first
    pub depends_on: Vec<StepId>,
    /// Exhausted retries abort the whole execution
    pub critical: bool,
}

impl RollbackStep {
    /// Per-attempt deadline
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Total attempts allowed
    #[inline]
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// A pre- or post-execution check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationStep {
    /// Identifier
    pub id: StepId,
    /// What is checked
    pub kind: ValidationKind,
    /// Human-readable description
    pub description: String,
    /// Check name handed to the validation runner
    pub check: String,
    /// Value the check must return
    pub expected_result: serde_json::Value,
    /// Deadline
    pub timeout_secs: u64,
    /// Failure blocks the execution (under blocking gating)
    pub critical: bool,
}

impl ValidationStep {
    /// Deadline
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Ordered, dependency-consistent plan derived from a rollback point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackPlan {
    /// Identifier
    pub id: PlanId,
    /// Source point
    pub point_id: RollbackPointId,
    /// Environment of the source point
    pub environment: Environment,
    /// Change kind of the source point
    pub change_kind: ChangeKind,
    /// Steps in execution order
    pub steps: Vec<RollbackStep>,
    /// Risks copied from the point
    pub risks: Vec<Risk>,
    /// A named approver is required before execution
    pub approval_required: bool,
    /// Checks before any step runs
    pub pre_validation: Vec<ValidationStep>,
    /// Checks after all steps ran
    pub post_validation: Vec<ValidationStep>,
    /// Sum of step timeouts, in minutes (rounded up)
    pub estimated_duration_minutes: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl RollbackPlan {
    /// Find a rollback step
    #[must_use]
    pub fn step(&self, id: StepId) -> Option<&RollbackStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Find a step by action name
    #[must_use]
    pub fn step_by_action(&self, action: &str) -> Option<&RollbackStep> {
        self.steps.iter().find(|s| s.action == action)
    }
}

/// Record of one attempted step (retries update the same record)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutedStep {
    /// Step (rollback or validation)
    pub step_id: StepId,
    /// First dispatch
    pub start_time: DateTime<Utc>,
    /// Final outcome time
    pub end_time: Option<DateTime<Utc>>,
    /// Outcome
    pub status: StepStatus,
    /// Runner output of the last attempt
    pub output: String,
    /// Error of the last attempt
    pub error: Option<String>,
    /// Retries performed
    pub retry_count: u32,
}

impl ExecutedStep {
    /// Freshly dispatched record
    #[inline]
    #[must_use]
    pub fn started(step_id: StepId, at: DateTime<Utc>) -> Self {
        Self {
            step_id,
            start_time: at,
            end_time: None,
            status: StepStatus::InProgress,
            output: String::new(),
            error: None,
            retry_count: 0,
        }
    }
}

/// Append-only error entry of an execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    /// Failing step; `None` for failures outside any step
    pub step_id: Option<StepId>,
    /// When it was recorded
    pub timestamp: DateTime<Utc>,
    /// Description
    pub message: String,
    /// Severity
    pub severity: Severity,
    /// Whether the failure was recovered
    pub recovered: bool,
}

/// One run of a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    /// Identifier
    pub id: ExecutionId,
    /// Plan being executed
    pub plan_id: PlanId,
    /// Point the plan restores
    pub point_id: RollbackPointId,
    /// Environment (denormalised from the point)
    pub environment: Environment,
    /// Creation time
    pub start_time: DateTime<Utc>,
    /// Time the execution became terminal
    pub end_time: Option<DateTime<Utc>>,
    /// State machine state
    pub status: ExecutionStatus,
    /// 0 - 100, non-decreasing; 100 only when completed
    pub progress_percent: u8,
    /// Step currently dispatched
    pub current_step_id: Option<StepId>,
    /// Per-step outcomes
    pub executed_steps: Vec<ExecutedStep>,
    /// Recorded failures
    pub errors: Vec<ExecutionError>,
    /// Approver, when one was given
    pub approved_by: Option<String>,
    /// Actor that started the execution
    pub executed_by: String,
}

impl Execution {
    /// New pending execution
    #[must_use]
    pub fn pending(
        id: ExecutionId,
        plan: &RollbackPlan,
        executed_by: impl Into<String>,
        approved_by: Option<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            plan_id: plan.id,
            point_id: plan.point_id,
            environment: plan.environment,
            start_time: at,
            end_time: None,
            status: ExecutionStatus::Pending,
            progress_percent: 0,
            current_step_id: None,
            executed_steps: Vec::new(),
            errors: Vec::new(),
            approved_by,
            executed_by: executed_by.into(),
        }
    }

    /// Terminal state reached
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Outcome record of a step
    #[must_use]
    pub fn executed_step(&self, step_id: StepId) -> Option<&ExecutedStep> {
        self.executed_steps.iter().find(|s| s.step_id == step_id)
    }

    pub(crate) fn executed_step_mut(&mut self, step_id: StepId) -> Option<&mut ExecutedStep> {
        self.executed_steps.iter_mut().find(|s| s.step_id == step_id)
    }

    /// Errors that were not recovered
    pub fn unrecovered_errors(&self) -> impl Iterator<Item = &ExecutionError> + '_ {
        self.errors.iter().filter(|e| !e.recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_through_display() {
        let id = ExecutionId::new();
        let parsed: ExecutionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn enums_parse_wire_names() {
        assert_eq!("database".parse::<ChangeKind>().unwrap(), ChangeKind::Database);
        assert_eq!("production".parse::<Environment>().unwrap(), Environment::Production);
        assert_eq!(
            "in_progress".parse::<ExecutionStatus>().unwrap(),
            ExecutionStatus::InProgress
        );

        let err = "prod".parse::<Environment>().unwrap_err();
        assert_eq!(err.kind, "environment");
    }

    #[test]
    fn serde_names_match_display() {
        let json = serde_json::to_string(&ExecutionStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let json = serde_json::to_string(&RiskKind::DataLoss).unwrap();
        assert_eq!(json, format!("\"{}\"", RiskKind::DataLoss));
    }

    #[test]
    fn terminal_and_active_partition_statuses() {
        for status in ExecutionStatus::ALL {
            assert_ne!(status.is_terminal(), status.is_active(), "{status}");
        }
    }

    #[test]
    fn risk_probability_is_clamped() {
        let risk = Risk::new(RiskKind::Downtime, Severity::High, 250);
        assert_eq!(risk.probability, 100);
    }

    #[test]
    fn severity_orders_by_impact() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Low < Severity::Medium);
    }
}
