//! Rollback orchestration engine (rollback-core)
//!
//! Captures restorable state before a change, turns it into an ordered
//! plan of rollback steps, and executes plans as supervised background
//! tasks:
//! 1. **Point**: snapshot captured through a [`SnapshotCapture`] backend,
//!    risk-assessed and kept under a per-environment retention policy
//! 2. **Plan**: dependency-ordered steps bracketed by pre/post validation
//! 3. **Execution**: retried, time-bounded steps with an approval gate,
//!    one active execution per environment and observable progress
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use rollback_core::prelude::*;
//!
//! let orchestrator = RollbackOrchestrator::builder(RollbackConfig::default())
//!     .snapshot_capture(capture)
//!     .step_runner(steps)
//!     .validation_runner(checks)
//!     .build()?;
//!
//! let point = orchestrator
//!     .create_rollback_point(ChangeKind::Config, "bump pool size", "1.4.2", Environment::Staging, "alice")
//!     .await?;
//! let plan = orchestrator.create_rollback_plan(point.id)?;
//! let started = orchestrator.execute_rollback(plan.id, "alice", None)?;
//! let finished = orchestrator.wait_for_terminal(started.id).await?;
//! ```

// Records and policies
pub mod approval;
pub mod config;
pub mod error;
pub mod retention;
pub mod risk;
pub mod types;

// Storage
pub mod ledger;
pub mod lease;
pub mod repository;
pub mod store;

// Planning and execution
pub mod executor;
pub mod orchestrator;
pub mod planner;
pub mod state_machine;

// Seams
pub mod audit;
pub mod clock;
pub mod collaborators;

// Simulated backends
pub mod sim;

// Re-exports
pub use collaborators::{SnapshotCapture, StepRunner, ValidationRunner};
pub use config::RollbackConfig;
pub use error::{RollbackError, RollbackResult};
pub use orchestrator::{OrchestratorBuilder, RollbackOrchestrator};
pub use types::*;

/// Commonly used types
pub mod prelude {
    pub use crate::audit::{AuditEvent, AuditLogger, AuditTrail, TracingAuditLogger};
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::collaborators::{
        ConfigSnapshot, DatabaseSnapshot, EnvironmentSnapshot, FeatureSnapshot, FileSnapshot,
        SnapshotBundle, SnapshotCapture, StepRunner, ValidationRunner,
    };
    pub use crate::config::{RollbackConfig, StepPolicy, ValidationGating};
    pub use crate::error::{
        RollbackError, RollbackResult, SnapshotError, StepError, ValidationError,
    };
    pub use crate::ledger::LedgerStats;
    pub use crate::orchestrator::{OrchestratorBuilder, RollbackOrchestrator};
    pub use crate::retention::{RetentionReport, RetirementReason};
    pub use crate::store::NewRollbackPoint;
    pub use crate::types::{
        ChangeKind, Environment, ExecutedStep, Execution, ExecutionError, ExecutionId,
        ExecutionStatus, PlanId, PointStatus, Risk, RiskKind, RollbackPlan, RollbackPoint,
        RollbackPointId, RollbackStep, Severity, StepId, StepKind, StepStatus, ValidationKind,
        ValidationStep,
    };
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
