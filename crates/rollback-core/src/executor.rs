//! Plan executor
//!
//! Runs one execution to a terminal state:
//! 1. `pending -> in_progress` (halts if already cancelled)
//! 2. pre-validation checks; a failed critical check aborts under blocking gating
//! 3. rollback steps in plan order with per-attempt deadline and retries;
//!    an exhausted critical step aborts, a non-critical one is recorded
//! 4. post-validation checks, handled like pre-validation
//! 5. `completed` with progress 100
//!
//! Cancellation is observed between steps only. A step already dispatched
//! runs to its outcome, which is still recorded.

use crate::audit::{AuditEvent, AuditLogger};
use crate::clock::Clock;
use crate::collaborators::{StepRunner, ValidationRunner};
use crate::config::ValidationGating;
use crate::error::{RollbackError, RollbackResult, StepError, ValidationError};
use crate::ledger::ExecutionLedger;
use crate::types::{
    ExecutedStep, ExecutionError, ExecutionId, ExecutionStatus, RollbackPlan, RollbackStep,
    Severity, StepId, StepStatus, ValidationStep,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

/// Outcome of processing one unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    /// Move on to the next unit
    Continue,
    /// This run set the execution to failed
    Aborted,
    /// Someone else made the execution terminal
    Halted,
}

/// Progress after `processed` of `total` units; 100 is reserved for completion
fn progress(processed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    u8::try_from((processed * 100 / total).min(99)).unwrap_or(99)
}

/// Drives executions through the state machine
#[derive(Debug, Clone)]
pub struct Executor {
    step_runner: Arc<dyn StepRunner>,
    validation_runner: Arc<dyn ValidationRunner>,
    ledger: Arc<ExecutionLedger>,
    audit: Arc<dyn AuditLogger>,
    clock: Arc<dyn Clock>,
    gating: ValidationGating,
}

impl Executor {
    /// Create an executor
    #[must_use]
    pub fn new(
        step_runner: Arc<dyn StepRunner>,
        validation_runner: Arc<dyn ValidationRunner>,
        ledger: Arc<ExecutionLedger>,
        audit: Arc<dyn AuditLogger>,
        clock: Arc<dyn Clock>,
        gating: ValidationGating,
    ) -> Self {
        Self {
            step_runner,
            validation_runner,
            ledger,
            audit,
            clock,
            gating,
        }
    }

    /// Run `plan` for the recorded execution `id`; returns its final status
    pub async fn run(&self, plan: &RollbackPlan, id: ExecutionId) -> RollbackResult<ExecutionStatus> {
        let span = tracing::info_span!(
            "rollback_execution",
            execution_id = %id,
            environment = %plan.environment
        );
        self.run_inner(plan, id).instrument(span).await
    }

    async fn run_inner(&self, plan: &RollbackPlan, id: ExecutionId) -> RollbackResult<ExecutionStatus> {
        if !self.begin(id)? {
            return Ok(self.ledger.get(id)?.status);
        }

        let total = plan.pre_validation.len() + plan.steps.len() + plan.post_validation.len();
        let mut processed = 0usize;

        for check in &plan.pre_validation {
            processed += 1;
            if let Some(status) = self.settle(id, self.run_check(id, check, processed, total).await?)? {
                return Ok(status);
            }
        }

        let mut done: HashSet<StepId> = HashSet::new();
        for step in &plan.steps {
            processed += 1;
            let flow = if step.depends_on.iter().all(|d| done.contains(d)) {
                self.run_step(id, step, processed, total).await?
            } else {
                self.skip_step(id, step, processed, total)?
            };
            done.insert(step.id);
            if let Some(status) = self.settle(id, flow)? {
                return Ok(status);
            }
        }

        for check in &plan.post_validation {
            processed += 1;
            if let Some(status) = self.settle(id, self.run_check(id, check, processed, total).await?)? {
                return Ok(status);
            }
        }

        self.complete(id)
    }

    /// Record a failure that happened outside any step (task error or panic)
    ///
    /// Returns `false` if the execution was already terminal.
    pub fn mark_failed(&self, id: ExecutionId, message: &str) -> RollbackResult<bool> {
        let now = self.clock.now();
        let failed = self.ledger.update(id, |e| {
            if e.is_terminal() {
                return Ok(false);
            }
            let current = e.current_step_id.take();
            if let Some(record) = current.and_then(|step| e.executed_step_mut(step)) {
                if record.status == StepStatus::InProgress {
                    record.status = StepStatus::Failed;
                    record.end_time = Some(now);
                    record.error = Some(message.to_string());
                }
            }
            e.errors.push(ExecutionError {
                step_id: current,
                timestamp: now,
                message: message.to_string(),
                severity: Severity::Critical,
                recovered: false,
            });
            e.status = ExecutionStatus::Failed;
            e.end_time = Some(now);
            Ok(true)
        })?;
        if failed {
            error!(execution_id = %id, %message, "rollback execution failed outside a step");
            self.finished(id, ExecutionStatus::Failed)?;
        }
        Ok(failed)
    }

    fn begin(&self, id: ExecutionId) -> RollbackResult<bool> {
        let started = self.ledger.update(id, |e| {
            if e.is_terminal() {
                return Ok(false);
            }
            e.status = ExecutionStatus::InProgress;
            Ok(true)
        })?;
        if started {
            info!("rollback execution started");
        } else {
            info!("execution already terminal before start");
        }
        Ok(started)
    }

    fn settle(&self, id: ExecutionId, flow: Flow) -> RollbackResult<Option<ExecutionStatus>> {
        match flow {
            Flow::Continue => Ok(None),
            Flow::Aborted => {
                self.finished(id, ExecutionStatus::Failed)?;
                Ok(Some(ExecutionStatus::Failed))
            }
            Flow::Halted => {
                let status = self.ledger.get(id)?.status;
                info!(%status, "execution halted at step boundary");
                Ok(Some(status))
            }
        }
    }

    fn complete(&self, id: ExecutionId) -> RollbackResult<ExecutionStatus> {
        let now = self.clock.now();
        let status = self.ledger.update(id, |e| {
            if e.is_terminal() {
                return Ok(e.status);
            }
            e.status = ExecutionStatus::Completed;
            e.progress_percent = 100;
            e.current_step_id = None;
            e.end_time = Some(now);
            Ok(ExecutionStatus::Completed)
        })?;
        if status == ExecutionStatus::Completed {
            self.finished(id, status)?;
        }
        Ok(status)
    }

    fn finished(&self, id: ExecutionId, status: ExecutionStatus) -> RollbackResult<()> {
        let errors = self.ledger.get(id)?.errors.len();
        match status {
            ExecutionStatus::Completed if errors > 0 => {
                warn!(errors, "rollback execution completed with tolerated failures");
            }
            ExecutionStatus::Completed => info!("rollback execution completed"),
            _ => error!(%status, errors, "rollback execution aborted"),
        }
        self.audit.record(AuditEvent::ExecutionFinished {
            execution_id: id,
            status,
            errors,
        });
        Ok(())
    }

    /// Open an `ExecutedStep` record; `false` if the execution is terminal
    fn dispatch(&self, id: ExecutionId, step_id: StepId) -> RollbackResult<bool> {
        let now = self.clock.now();
        self.ledger.update(id, |e| {
            if e.is_terminal() {
                return Ok(false);
            }
            e.current_step_id = Some(step_id);
            e.executed_steps.push(ExecutedStep::started(step_id, now));
            Ok(true)
        })
    }

    async fn attempt(&self, step: &RollbackStep) -> Result<String, StepError> {
        let deadline = step.timeout();
        match tokio::time::timeout(deadline, self.step_runner.run(step, deadline)).await {
            Ok(result) => result,
            Err(_) => Err(StepError::Timeout {
                secs: step.timeout_secs,
            }),
        }
    }

    async fn run_step(
        &self,
        id: ExecutionId,
        step: &RollbackStep,
        processed: usize,
        total: usize,
    ) -> RollbackResult<Flow> {
        if !self.dispatch(id, step.id)? {
            return Ok(Flow::Halted);
        }

        let mut retries = 0u32;
        let outcome = loop {
            debug!(action = %step.action, attempt = retries + 1, "dispatching step");
            match self.attempt(step).await {
                Ok(output) => break Ok(output),
                Err(err) if retries < step.max_retries => {
                    retries += 1;
                    warn!(action = %step.action, attempt = retries, error = %err, "step attempt failed, retrying");
                    let message = err.to_string();
                    self.ledger.update(id, |e| {
                        if let Some(record) = e.executed_step_mut(step.id) {
                            record.retry_count = retries;
                            record.error = Some(message);
                        }
                        Ok(())
                    })?;
                }
                Err(err) => break Err(err),
            }
        };

        let now = self.clock.now();
        let failure = outcome.as_ref().err().map(|err| {
            RollbackError::StepExecutionFailure {
                step: step.action.clone(),
                attempts: retries + 1,
                reason: err.to_string(),
            }
            .to_string()
        });

        let (flow, step_status) = self.ledger.update(id, |e| {
            let step_status = if outcome.is_ok() {
                StepStatus::Completed
            } else {
                StepStatus::Failed
            };
            if let Some(record) = e.executed_step_mut(step.id) {
                record.status = step_status;
                record.end_time = Some(now);
                record.retry_count = retries;
                match &outcome {
                    Ok(output) => {
                        record.output.clone_from(output);
                        record.error = None;
                    }
                    Err(err) => record.error = Some(err.to_string()),
                }
            }
            if e.is_terminal() {
                return Ok((Flow::Halted, step_status));
            }
            e.current_step_id = None;

            if let Some(message) = &failure {
                let fatal = step.critical;
                e.errors.push(ExecutionError {
                    step_id: Some(step.id),
                    timestamp: now,
                    message: message.clone(),
                    severity: if fatal { Severity::Critical } else { Severity::Medium },
                    recovered: false,
                });
                if fatal {
                    e.status = ExecutionStatus::Failed;
                    e.end_time = Some(now);
                    return Ok((Flow::Aborted, step_status));
                }
            }
            e.progress_percent = e.progress_percent.max(progress(processed, total));
            Ok((Flow::Continue, step_status))
        })?;

        match (&failure, flow) {
            (Some(message), Flow::Aborted) => {
                error!(action = %step.action, %message, "critical step failed, aborting");
            }
            (Some(message), _) => {
                warn!(action = %step.action, %message, "non-critical step failed, continuing");
            }
            (None, _) => debug!(action = %step.action, retries, "step completed"),
        }
        self.audit.record(AuditEvent::StepFinished {
            execution_id: id,
            step_id: step.id,
            action: step.action.clone(),
            status: step_status,
            retry_count: retries,
        });
        Ok(flow)
    }

    fn skip_step(
        &self,
        id: ExecutionId,
        step: &RollbackStep,
        processed: usize,
        total: usize,
    ) -> RollbackResult<Flow> {
        let now = self.clock.now();
        let flow = self.ledger.update(id, |e| {
            if e.is_terminal() {
                return Ok(Flow::Halted);
            }
            let mut record = ExecutedStep::started(step.id, now);
            record.status = StepStatus::Skipped;
            record.end_time = Some(now);
            record.error = Some("dependencies not processed".to_string());
            e.executed_steps.push(record);
            e.progress_percent = e.progress_percent.max(progress(processed, total));
            Ok(Flow::Continue)
        })?;
        if flow == Flow::Continue {
            warn!(action = %step.action, "step skipped: dependencies not processed");
            self.audit.record(AuditEvent::StepFinished {
                execution_id: id,
                step_id: step.id,
                action: step.action.clone(),
                status: StepStatus::Skipped,
                retry_count: 0,
            });
        }
        Ok(flow)
    }

    async fn run_check(
        &self,
        id: ExecutionId,
        check: &ValidationStep,
        processed: usize,
        total: usize,
    ) -> RollbackResult<Flow> {
        if !self.dispatch(id, check.id)? {
            return Ok(Flow::Halted);
        }

        let deadline = check.timeout();
        debug!(check = %check.check, "running validation");
        let verdict = match tokio::time::timeout(deadline, self.validation_runner.check(check, deadline)).await {
            Err(_) => Err(ValidationError::Timeout {
                secs: check.timeout_secs,
            }),
            Ok(Err(err)) => Err(err),
            Ok(Ok(actual)) => {
                let blocking = self.gating == ValidationGating::Blocking;
                if check.critical && blocking && actual != check.expected_result {
                    Err(ValidationError::Mismatch {
                        expected: check.expected_result.to_string(),
                        actual: actual.to_string(),
                    })
                } else {
                    Ok(actual)
                }
            }
        };

        let now = self.clock.now();
        let fatal = check.critical && self.gating == ValidationGating::Blocking;
        let failure = verdict.as_ref().err().map(|err| {
            RollbackError::ValidationFailure {
                check: check.check.clone(),
                reason: err.to_string(),
            }
            .to_string()
        });

        let (flow, step_status) = self.ledger.update(id, |e| {
            let step_status = if verdict.is_ok() {
                StepStatus::Completed
            } else {
                StepStatus::Failed
            };
            if let Some(record) = e.executed_step_mut(check.id) {
                record.status = step_status;
                record.end_time = Some(now);
                match &verdict {
                    Ok(actual) => record.output = actual.to_string(),
                    Err(err) => record.error = Some(err.to_string()),
                }
            }
            if e.is_terminal() {
                return Ok((Flow::Halted, step_status));
            }
            e.current_step_id = None;

            if let Some(message) = &failure {
                e.errors.push(ExecutionError {
                    step_id: Some(check.id),
                    timestamp: now,
                    message: message.clone(),
                    severity: match (fatal, check.critical) {
                        (true, _) => Severity::Critical,
                        (false, true) => Severity::High,
                        (false, false) => Severity::Medium,
                    },
                    recovered: false,
                });
                if fatal {
                    e.status = ExecutionStatus::Failed;
                    e.end_time = Some(now);
                    return Ok((Flow::Aborted, step_status));
                }
            }
            e.progress_percent = e.progress_percent.max(progress(processed, total));
            Ok((Flow::Continue, step_status))
        })?;

        match (&failure, flow) {
            (Some(message), Flow::Aborted) => {
                error!(check = %check.check, %message, "critical validation failed, aborting");
            }
            (Some(message), _) => warn!(check = %check.check, %message, "validation failed, continuing"),
            (None, _) => debug!(check = %check.check, "validation passed"),
        }
        self.audit.record(AuditEvent::StepFinished {
            execution_id: id,
            step_id: check.id,
            action: check.check.clone(),
            status: step_status,
            retry_count: 0,
        });
        Ok(flow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditTrail;
    use crate::clock::SystemClock;
    use crate::collaborators::{MockStepRunner, MockValidationRunner};
    use crate::config::RollbackConfig;
    use crate::planner::PlanBuilder;
    use crate::types::{
        ChangeKind, Environment, Execution, PointStatus, RollbackPoint, RollbackPointId,
        SnapshotRef,
    };
    use chrono::Utc;

    fn plan(kind: ChangeKind) -> RollbackPlan {
        let point = RollbackPoint {
            id: RollbackPointId::new(),
            created_at: Utc::now(),
            kind,
            description: String::new(),
            version: "1".into(),
            environment: Environment::Staging,
            status: PointStatus::Active,
            created_by: "alice".into(),
            risks: Vec::new(),
            dependencies: Vec::new(),
            snapshot: SnapshotRef {
                digest: "d1".into(),
                captured_at: Utc::now(),
                components: Vec::new(),
            },
        };
        PlanBuilder::new(&RollbackConfig::default())
            .build(&point)
            .unwrap()
    }

    fn echo_validation() -> MockValidationRunner {
        let mut validation = MockValidationRunner::new();
        validation
            .expect_check()
            .returning(|check, _| Ok(check.expected_result.clone()));
        validation
    }

    fn executor(
        steps: MockStepRunner,
        validation: MockValidationRunner,
        gating: ValidationGating,
    ) -> (Executor, Arc<ExecutionLedger>) {
        let ledger = Arc::new(ExecutionLedger::in_memory());
        let executor = Executor::new(
            Arc::new(steps),
            Arc::new(validation),
            ledger.clone(),
            Arc::new(AuditTrail::new()),
            Arc::new(SystemClock),
            gating,
        );
        (executor, ledger)
    }

    fn record(ledger: &ExecutionLedger, plan: &RollbackPlan) -> ExecutionId {
        let execution = Execution::pending(ExecutionId::new(), plan, "alice", None, Utc::now());
        let id = execution.id;
        ledger.record(execution).unwrap();
        id
    }

    #[tokio::test]
    async fn all_steps_succeed() {
        let plan = plan(ChangeKind::Config);
        let mut steps = MockStepRunner::new();
        steps
            .expect_run()
            .times(plan.steps.len())
            .returning(|step, _| Ok(format!("{} done", step.action)));
        let (executor, ledger) = executor(steps, echo_validation(), ValidationGating::Blocking);
        let id = record(&ledger, &plan);

        let status = executor.run(&plan, id).await.unwrap();

        assert_eq!(status, ExecutionStatus::Completed);
        let execution = ledger.get(id).unwrap();
        assert_eq!(execution.progress_percent, 100);
        assert!(execution.end_time.is_some());
        assert!(execution.errors.is_empty());
        let total = plan.steps.len() + plan.pre_validation.len() + plan.post_validation.len();
        assert_eq!(execution.executed_steps.len(), total);
    }

    #[tokio::test]
    async fn retries_reuse_the_same_record() {
        let plan = plan(ChangeKind::Config);
        let mut steps = MockStepRunner::new();
        let mut failures = 2;
        steps.expect_run().returning(move |step, _| {
            if step.action == "restore-config" && failures > 0 {
                failures -= 1;
                Err(StepError::Failed("file locked".into()))
            } else {
                Ok(String::new())
            }
        });
        let (executor, ledger) = executor(steps, echo_validation(), ValidationGating::Blocking);
        let id = record(&ledger, &plan);

        assert_eq!(executor.run(&plan, id).await.unwrap(), ExecutionStatus::Completed);

        let execution = ledger.get(id).unwrap();
        let restore = plan.step_by_action("restore-config").unwrap();
        let records: Vec<_> = execution
            .executed_steps
            .iter()
            .filter(|s| s.step_id == restore.id)
            .collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].retry_count, 2);
        assert_eq!(records[0].status, StepStatus::Completed);
        assert_eq!(records[0].error, None);
    }

    #[tokio::test]
    async fn critical_pre_validation_blocks_destructive_steps() {
        let plan = plan(ChangeKind::Deployment);
        let mut steps = MockStepRunner::new();
        steps.expect_run().never();
        let mut validation = MockValidationRunner::new();
        validation
            .expect_check()
            .returning(|_, _| Ok(serde_json::json!("degraded")));
        let (executor, ledger) = executor(steps, validation, ValidationGating::Blocking);
        let id = record(&ledger, &plan);

        assert_eq!(executor.run(&plan, id).await.unwrap(), ExecutionStatus::Failed);

        let execution = ledger.get(id).unwrap();
        assert_eq!(execution.errors.len(), 1);
        assert_eq!(execution.errors[0].severity, Severity::Critical);
        assert!(execution.errors[0].message.contains("system-health"));
        assert!(execution.progress_percent < 100);
    }

    #[tokio::test]
    async fn observe_gating_records_but_continues() {
        let plan = plan(ChangeKind::Config);
        let mut steps = MockStepRunner::new();
        steps.expect_run().returning(|_, _| Ok(String::new()));
        let mut validation = MockValidationRunner::new();
        validation
            .expect_check()
            .returning(|_, _| Err(ValidationError::CheckFailed("health endpoint refused".into())));
        let (executor, ledger) = executor(steps, validation, ValidationGating::Observe);
        let id = record(&ledger, &plan);

        assert_eq!(executor.run(&plan, id).await.unwrap(), ExecutionStatus::Completed);

        let execution = ledger.get(id).unwrap();
        let checks = plan.pre_validation.len() + plan.post_validation.len();
        assert_eq!(execution.errors.len(), checks);
        assert!(execution.errors.iter().all(|e| !e.recovered));
    }

    #[tokio::test]
    async fn cancelled_before_start_never_runs() {
        let plan = plan(ChangeKind::Config);
        let mut steps = MockStepRunner::new();
        steps.expect_run().never();
        let mut validation = MockValidationRunner::new();
        validation.expect_check().never();
        let (executor, ledger) = executor(steps, validation, ValidationGating::Blocking);
        let id = record(&ledger, &plan);
        ledger
            .update(id, |e| {
                e.status = ExecutionStatus::Cancelled;
                Ok(())
            })
            .unwrap();

        assert_eq!(executor.run(&plan, id).await.unwrap(), ExecutionStatus::Cancelled);
        assert!(ledger.get(id).unwrap().executed_steps.is_empty());
    }

    #[tokio::test]
    async fn mark_failed_closes_the_open_step() {
        let plan = plan(ChangeKind::Config);
        let (executor, ledger) = executor(
            MockStepRunner::new(),
            MockValidationRunner::new(),
            ValidationGating::Blocking,
        );
        let id = record(&ledger, &plan);
        let step = plan.steps[0].id;
        ledger
            .update(id, |e| {
                e.status = ExecutionStatus::InProgress;
                e.current_step_id = Some(step);
                e.executed_steps.push(ExecutedStep::started(step, Utc::now()));
                Ok(())
            })
            .unwrap();

        assert!(executor.mark_failed(id, "runner panicked").unwrap());
        assert!(!executor.mark_failed(id, "again").unwrap());

        let execution = ledger.get(id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.errors.len(), 1);
        assert_eq!(execution.errors[0].step_id, Some(step));
        assert_eq!(execution.executed_steps[0].status, StepStatus::Failed);
    }

    #[test]
    fn progress_reserves_one_hundred() {
        assert_eq!(progress(0, 0), 0);
        assert_eq!(progress(1, 4), 25);
        assert_eq!(progress(4, 4), 99);
    }
}
