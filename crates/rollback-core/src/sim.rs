//! Simulated collaborators
//!
//! Seeded stand-ins for the snapshot, step and validation backends, used
//! by the `rollback` binary to drive the engine end to end:
//! - the three reference scenarios (approval gating, free staging rollback,
//!   timing-out file restore)
//! - randomised runs reporting the outcome distribution
//!
//! Given the same seed the collaborators make the same decisions.

use crate::collaborators::{
    ConfigSnapshot, DatabaseSnapshot, EnvironmentSnapshot, FeatureSnapshot, FileSnapshot,
    SnapshotCapture, StepRunner, ValidationRunner,
};
use crate::audit::{AuditTrail, FanoutAuditLogger, TracingAuditLogger};
use crate::config::RollbackConfig;
use crate::error::{RollbackError, RollbackResult, SnapshotError, StepError, ValidationError};
use crate::orchestrator::RollbackOrchestrator;
use crate::types::{
    ChangeKind, Environment, Execution, ExecutionStatus, RollbackPlan, RollbackPoint, RollbackStep,
    Severity, StepStatus, ValidationStep,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Snapshot backend returning fixed synthetic state
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedSnapshotCapture;

#[async_trait]
impl SnapshotCapture for SimulatedSnapshotCapture {
    async fn capture_files(&self) -> Result<Vec<FileSnapshot>, SnapshotError> {
        Ok(["app/server.bin", "app/assets.tar"]
            .iter()
            .enumerate()
            .map(|(i, path)| FileSnapshot {
                path: (*path).to_string(),
                checksum: format!("{:064x}", i + 1),
                size_bytes: 1024 * (i as u64 + 1),
            })
            .collect())
    }

    async fn capture_database(&self) -> Result<DatabaseSnapshot, SnapshotError> {
        Ok(DatabaseSnapshot {
            schema_version: "2024.1".to_string(),
            tables: vec!["accounts".to_string(), "orders".to_string()],
            backup_ref: "sim-dump-0001".to_string(),
        })
    }

    async fn capture_config(
        &self,
        environment: Environment,
    ) -> Result<ConfigSnapshot, SnapshotError> {
        let mut values = BTreeMap::new();
        values.insert("environment".to_string(), environment.to_string());
        values.insert("pool_size".to_string(), "32".to_string());
        Ok(ConfigSnapshot {
            environment,
            values,
        })
    }

    async fn capture_feature_flags(&self) -> Result<Vec<FeatureSnapshot>, SnapshotError> {
        Ok(vec![FeatureSnapshot {
            name: "new-checkout".to_string(),
            enabled: true,
            rollout_percent: 25,
        }])
    }

    async fn capture_environment(&self) -> Result<EnvironmentSnapshot, SnapshotError> {
        Ok(EnvironmentSnapshot {
            runtime_version: env!("CARGO_PKG_VERSION").to_string(),
            variables: BTreeMap::new(),
        })
    }
}

/// Step backend failing at a seeded rate
#[derive(Debug)]
pub struct SimulatedStepRunner {
    rng: Mutex<StdRng>,
    failure_rate: f64,
    timing_out_actions: HashSet<String>,
}

impl SimulatedStepRunner {
    /// Runner failing each attempt with probability `failure_rate`
    #[must_use]
    pub fn new(seed: u64, failure_rate: f64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            failure_rate: failure_rate.clamp(0.0, 1.0),
            timing_out_actions: HashSet::new(),
        }
    }

    /// Runner that always succeeds
    #[must_use]
    pub fn reliable() -> Self {
        Self::new(0, 0.0)
    }

    /// Every attempt of `action` reports its deadline elapsed
    #[must_use]
    pub fn with_timing_out_action(mut self, action: impl Into<String>) -> Self {
        self.timing_out_actions.insert(action.into());
        self
    }
}

#[async_trait]
impl StepRunner for SimulatedStepRunner {
    async fn run(&self, step: &RollbackStep, deadline: Duration) -> Result<String, StepError> {
        if self.timing_out_actions.contains(&step.action) {
            return Err(StepError::Timeout {
                secs: deadline.as_secs(),
            });
        }
        let failed = self.rng.lock().random_bool(self.failure_rate);
        if failed {
            Err(StepError::Failed(format!("{}: simulated failure", step.action)))
        } else {
            Ok(format!("{} ok", step.action))
        }
    }
}

/// Validation backend echoing expectations, failing at a seeded rate
#[derive(Debug)]
pub struct SimulatedValidationRunner {
    rng: Mutex<StdRng>,
    failure_rate: f64,
}

impl SimulatedValidationRunner {
    /// Runner failing each check with probability `failure_rate`
    #[must_use]
    pub fn new(seed: u64, failure_rate: f64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }

    /// Runner whose checks always pass
    #[must_use]
    pub fn passing() -> Self {
        Self::new(0, 0.0)
    }
}

#[async_trait]
impl ValidationRunner for SimulatedValidationRunner {
    async fn check(
        &self,
        step: &ValidationStep,
        _deadline: Duration,
    ) -> Result<serde_json::Value, ValidationError> {
        let failed = self.rng.lock().random_bool(self.failure_rate);
        if failed {
            Ok(serde_json::json!("degraded"))
        } else {
            Ok(step.expected_result.clone())
        }
    }
}

/// Unknown scenario name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown scenario '{0}' (expected a, b or c)")]
pub struct ParseScenarioError(pub String);

/// Reference scenarios
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    /// Production database rollback gated on approval
    A,
    /// Staging config rollback without approval
    B,
    /// Deployment rollback whose file restore always times out
    C,
}

impl Scenario {
    /// Every scenario
    pub const ALL: [Scenario; 3] = [Scenario::A, Scenario::B, Scenario::C];

    /// One-line description
    #[must_use]
    pub fn describe(self) -> &'static str {
        match self {
            Scenario::A => "production database rollback requires an approver",
            Scenario::B => "staging config rollback runs without approval",
            Scenario::C => "deployment rollback with a timing-out file restore",
        }
    }

    fn change(self) -> (ChangeKind, Environment) {
        match self {
            Scenario::A => (ChangeKind::Database, Environment::Production),
            Scenario::B => (ChangeKind::Config, Environment::Staging),
            Scenario::C => (ChangeKind::Deployment, Environment::Staging),
        }
    }
}

impl FromStr for Scenario {
    type Err = ParseScenarioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "a" => Ok(Scenario::A),
            "b" => Ok(Scenario::B),
            "c" => Ok(Scenario::C),
            other => Err(ParseScenarioError(other.to_string())),
        }
    }
}

/// Outcome of one scenario
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    /// Scenario
    pub scenario: Scenario,
    /// Point created
    pub point: RollbackPoint,
    /// Plan built
    pub plan: RollbackPlan,
    /// Error returned by the attempt without an approver, if refused
    pub refused_without_approver: Option<String>,
    /// Final execution record
    pub execution: Execution,
    /// Audit events recorded during the scenario
    pub audit_events: usize,
    /// Hash of the last audit record (hex)
    pub audit_head: Option<String>,
}

impl ScenarioReport {
    /// Generate text report
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== Scenario {:?}: {} ===", self.scenario, self.scenario.describe());
        let _ = writeln!(
            out,
            "point {} ({} / {})",
            self.point.id, self.point.kind, self.point.environment
        );
        let _ = writeln!(
            out,
            "plan {}: {} steps, approval required: {}, ~{} min",
            self.plan.id,
            self.plan.steps.len(),
            self.plan.approval_required,
            self.plan.estimated_duration_minutes
        );
        if let Some(refusal) = &self.refused_without_approver {
            let _ = writeln!(out, "without approver: {refusal}");
        }
        let _ = writeln!(
            out,
            "execution {}: {} ({}%)",
            self.execution.id, self.execution.status, self.execution.progress_percent
        );
        for executed in &self.execution.executed_steps {
            let name = self
                .plan
                .step(executed.step_id)
                .map(|s| s.action.as_str())
                .or_else(|| {
                    self.plan
                        .pre_validation
                        .iter()
                        .chain(&self.plan.post_validation)
                        .find(|v| v.id == executed.step_id)
                        .map(|v| v.check.as_str())
                })
                .unwrap_or("?");
            let _ = writeln!(
                out,
                "  {name:<28} {:<10} retries={}",
                executed.status, executed.retry_count
            );
        }
        for error in &self.execution.errors {
            let _ = writeln!(
                out,
                "  error [{}] recovered={}: {}",
                error.severity, error.recovered, error.message
            );
        }
        let _ = writeln!(
            out,
            "audit: {} events, head {}",
            self.audit_events,
            self.audit_head.as_deref().unwrap_or("-")
        );
        out
    }
}

/// Orchestrator over simulated backends; audit goes to tracing and a chained trail
fn orchestrator(
    config: RollbackConfig,
    steps: SimulatedStepRunner,
    checks: SimulatedValidationRunner,
) -> RollbackResult<(RollbackOrchestrator, Arc<AuditTrail>)> {
    let trail = Arc::new(AuditTrail::new());
    let audit = FanoutAuditLogger::new()
        .with_sink(Arc::new(TracingAuditLogger))
        .with_sink(trail.clone());
    let orchestrator = RollbackOrchestrator::builder(config)
        .snapshot_capture(Arc::new(SimulatedSnapshotCapture))
        .step_runner(Arc::new(steps))
        .validation_runner(Arc::new(checks))
        .audit_logger(Arc::new(audit))
        .build()?;
    Ok((orchestrator, trail))
}

/// Run one reference scenario against simulated collaborators
pub async fn run_scenario(
    scenario: Scenario,
    config: RollbackConfig,
) -> RollbackResult<ScenarioReport> {
    let steps = match scenario {
        Scenario::C => SimulatedStepRunner::reliable().with_timing_out_action("restore-files"),
        Scenario::A | Scenario::B => SimulatedStepRunner::reliable(),
    };
    let (orchestrator, trail) = orchestrator(config, steps, SimulatedValidationRunner::passing())?;
    let (kind, environment) = scenario.change();

    let point = orchestrator
        .create_rollback_point(kind, scenario.describe(), "1.0.0", environment, "alice")
        .await?;
    let plan = orchestrator.create_rollback_plan(point.id)?;

    let (refused_without_approver, approver) = if plan.approval_required {
        match orchestrator.execute_rollback(plan.id, "alice", None) {
            Err(err @ RollbackError::ApprovalRequired { .. }) => (Some(err.to_string()), Some("bob")),
            Err(err) => return Err(err),
            Ok(_) => (None, Some("bob")),
        }
    } else {
        (None, None)
    };

    let started = orchestrator.execute_rollback(plan.id, "alice", approver)?;
    let execution = orchestrator.wait_for_terminal(started.id).await?;

    Ok(ScenarioReport {
        scenario,
        point,
        plan,
        refused_without_approver,
        execution,
        audit_events: trail.len(),
        audit_head: trail.head(),
    })
}

/// Randomised run parameters
#[derive(Debug, Clone, Serialize)]
pub struct SimulationConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Executions to attempt
    pub runs: u64,
    /// Per-attempt step failure probability
    pub failure_rate: f64,
    /// Per-check validation failure probability
    pub validation_failure_rate: f64,
    /// Probability that a gated run is attempted without an approver
    pub missing_approver_rate: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            runs: 100,
            failure_rate: 0.1,
            validation_failure_rate: 0.02,
            missing_approver_rate: 0.1,
        }
    }
}

/// Outcome distribution of a randomised run
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationStats {
    /// Executions attempted
    pub attempted: u64,
    /// Refused for lack of an approver
    pub refused: u64,
    /// Reached completed without errors
    pub completed_clean: u64,
    /// Reached completed with tolerated errors
    pub completed_with_errors: u64,
    /// Reached failed
    pub failed: u64,
    /// Reached cancelled
    pub cancelled: u64,
    /// Step retries performed
    pub retries: u64,
    /// Audit events recorded
    pub audit_events: u64,
}

/// Final report of a randomised run
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    /// Parameters
    pub config: SimulationConfig,
    /// Outcome counts
    pub stats: SimulationStats,
    /// Invariant violations observed
    pub violations: Vec<String>,
}

impl SimulationReport {
    /// No invariant was violated
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Generate text report
    #[must_use]
    pub fn generate_text(&self) -> String {
        let s = &self.stats;
        let mut out = String::new();
        let _ = writeln!(out, "=== Rollback Simulation Report ===");
        let _ = writeln!(out, "Seed: {}", self.config.seed);
        let _ = writeln!(out, "Step failure rate: {:.2}", self.config.failure_rate);
        let _ = writeln!(out, "Attempted: {}", s.attempted);
        let _ = writeln!(out, "Refused (approval): {}", s.refused);
        let _ = writeln!(out, "Completed clean: {}", s.completed_clean);
        let _ = writeln!(out, "Completed with errors: {}", s.completed_with_errors);
        let _ = writeln!(out, "Failed: {}", s.failed);
        let _ = writeln!(out, "Cancelled: {}", s.cancelled);
        let _ = writeln!(out, "Retries: {}", s.retries);
        let _ = writeln!(out, "Audit events: {}", s.audit_events);
        if self.passed() {
            let _ = writeln!(out, "Result: PASSED");
        } else {
            let _ = writeln!(out, "Result: FAILED ({} violations)", self.violations.len());
            for v in &self.violations {
                let _ = writeln!(out, "  - {v}");
            }
        }
        out
    }
}

fn check_invariants(execution: &Execution, plan: &RollbackPlan, violations: &mut Vec<String>) {
    let completed = execution.status == ExecutionStatus::Completed;
    if (execution.progress_percent == 100) != completed {
        violations.push(format!(
            "{}: progress {} with status {}",
            execution.id, execution.progress_percent, execution.status
        ));
    }
    if execution.end_time.is_none() {
        violations.push(format!("{}: terminal without end time", execution.id));
    }
    if plan.approval_required && execution.approved_by.is_none() {
        violations.push(format!("{}: gated plan ran without approver", execution.id));
    }
    if execution.status == ExecutionStatus::Failed {
        let abort = execution
            .errors
            .iter()
            .find(|e| !e.recovered && e.severity == Severity::Critical)
            .and_then(|e| e.step_id)
            .and_then(|id| plan.step(id));
        if let Some(abort) = abort {
            let ran_after = plan.steps.iter().filter(|s| s.order > abort.order).any(|s| {
                execution.executed_step(s.id).is_some_and(|r| {
                    matches!(r.status, StepStatus::Completed | StepStatus::InProgress)
                })
            });
            if ran_after {
                violations.push(format!("{}: step ran after critical abort", execution.id));
            }
        }
    }
}

/// Drive `config.runs` randomised executions
pub async fn run_simulation(
    config: SimulationConfig,
    rollback: RollbackConfig,
) -> RollbackResult<SimulationReport> {
    let (orchestrator, trail) = orchestrator(
        rollback,
        SimulatedStepRunner::new(config.seed, config.failure_rate),
        SimulatedValidationRunner::new(config.seed.wrapping_add(1), config.validation_failure_rate),
    )?;
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(2));
    let mut stats = SimulationStats::default();
    let mut violations = Vec::new();

    for run in 0..config.runs {
        let kind = ChangeKind::ALL[rng.random_range(0..ChangeKind::ALL.len())];
        let environment = Environment::ALL[rng.random_range(0..Environment::ALL.len())];
        let point = orchestrator
            .create_rollback_point(kind, "simulated change", &format!("1.0.{run}"), environment, "sim")
            .await?;
        let plan = orchestrator.create_rollback_plan(point.id)?;

        let omit = plan.approval_required && rng.random_bool(config.missing_approver_rate);
        let approver = if omit { None } else { Some("approver") };
        stats.attempted += 1;

        let started = match orchestrator.execute_rollback(plan.id, "sim", approver) {
            Ok(execution) => execution,
            Err(RollbackError::ApprovalRequired { .. }) => {
                stats.refused += 1;
                continue;
            }
            Err(err) => return Err(err),
        };
        let execution = orchestrator.wait_for_terminal(started.id).await?;

        stats.retries += execution
            .executed_steps
            .iter()
            .map(|s| u64::from(s.retry_count))
            .sum::<u64>();
        match execution.status {
            ExecutionStatus::Completed if execution.errors.is_empty() => stats.completed_clean += 1,
            ExecutionStatus::Completed => stats.completed_with_errors += 1,
            ExecutionStatus::Failed => stats.failed += 1,
            ExecutionStatus::Cancelled => stats.cancelled += 1,
            ExecutionStatus::Pending | ExecutionStatus::InProgress => {
                violations.push(format!("{}: not terminal after wait", execution.id));
            }
        }
        check_invariants(&execution, &plan, &mut violations);
    }

    stats.audit_events = trail.len() as u64;
    if let Err(err) = trail.verify_integrity() {
        violations.push(err.to_string());
    }

    let limit = orchestrator.config().max_rollback_points;
    for environment in Environment::ALL {
        let active = orchestrator
            .list_rollback_points(Some(*environment))?
            .iter()
            .filter(|p| p.is_active())
            .count();
        if active > limit {
            violations.push(format!("{environment}: {active} active points exceed {limit}"));
        }
    }

    Ok(SimulationReport {
        config,
        stats,
        violations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_parses_case_insensitively() {
        assert_eq!("A".parse::<Scenario>().unwrap(), Scenario::A);
        assert_eq!("c".parse::<Scenario>().unwrap(), Scenario::C);
        assert!("d".parse::<Scenario>().is_err());
    }

    #[tokio::test]
    async fn scenario_b_completes_without_approver() {
        let report = run_scenario(Scenario::B, RollbackConfig::default())
            .await
            .unwrap();
        assert!(!report.plan.approval_required);
        assert!(report.refused_without_approver.is_none());
        assert_eq!(report.execution.status, ExecutionStatus::Completed);
        assert!(report.generate_text().contains("completed"));
    }

    #[tokio::test]
    async fn simulation_is_reproducible() {
        let config = SimulationConfig {
            runs: 20,
            ..SimulationConfig::default()
        };
        let first = run_simulation(config.clone(), RollbackConfig::default())
            .await
            .unwrap();
        let second = run_simulation(config, RollbackConfig::default())
            .await
            .unwrap();

        assert!(first.passed(), "{}", first.generate_text());
        assert_eq!(first.stats.attempted, 20);
        assert_eq!(first.stats.failed, second.stats.failed);
        assert_eq!(first.stats.refused, second.stats.refused);
        assert_eq!(first.stats.retries, second.stats.retries);
    }
}
