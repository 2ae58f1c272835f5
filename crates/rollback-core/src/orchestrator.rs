//! Rollback orchestrator
//!
//! The public surface of the engine. One explicitly constructed instance
//! owns the point store, plan repository, execution ledger, environment
//! leases and executor; callers share it by reference.
//!
//! Usage:
//! ```rust,ignore
//! let orchestrator = RollbackOrchestrator::builder(config)
//!     .snapshot_capture(capture)
//!     .step_runner(runner)
//!     .validation_runner(checks)
//!     .build()?;
//!
//! let point = orchestrator
//!     .create_rollback_point(ChangeKind::Config, "tune pool", "1.4.0", Environment::Staging, "alice")
//!     .await?;
//! let plan = orchestrator.create_rollback_plan(point.id)?;
//! let execution = orchestrator.execute_rollback(plan.id, "alice", None)?;
//! let done = orchestrator.wait_for_terminal(execution.id).await?;
//! ```

use crate::approval::{normalize_approver, point_requires_approval};
use crate::audit::{AuditEvent, AuditLogger, TracingAuditLogger};
use crate::clock::{Clock, SystemClock};
use crate::collaborators::{SnapshotCapture, StepRunner, ValidationRunner};
use crate::config::RollbackConfig;
use crate::error::{ConfigError, Entity, RollbackError, RollbackResult};
use crate::executor::Executor;
use crate::lease::{EnvironmentLease, EnvironmentLeases, LeaseHolder};
use crate::ledger::{ExecutionLedger, LedgerStats};
use crate::planner::PlanBuilder;
use crate::repository::{
    ExecutionRepository, InMemoryExecutionRepository, InMemoryPlanRepository,
    InMemoryPointRepository, PlanRepository, PointRepository,
};
use crate::retention::{RetentionPolicy, RetentionReport};
use crate::risk::RiskAssessor;
use crate::store::{NewRollbackPoint, RollbackPointStore};
use crate::types::{
    ChangeKind, Environment, Execution, ExecutionId, ExecutionStatus, PlanId, RollbackPlan,
    RollbackPoint, RollbackPointId,
};
use std::any::Any;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{error, info, warn, Instrument};

/// Builder for [`RollbackOrchestrator`]
#[derive(Debug)]
pub struct OrchestratorBuilder {
    config: RollbackConfig,
    snapshot_capture: Option<Arc<dyn SnapshotCapture>>,
    step_runner: Option<Arc<dyn StepRunner>>,
    validation_runner: Option<Arc<dyn ValidationRunner>>,
    audit: Option<Arc<dyn AuditLogger>>,
    clock: Option<Arc<dyn Clock>>,
    points: Option<Arc<dyn PointRepository>>,
    plans: Option<Arc<dyn PlanRepository>>,
    executions: Option<Arc<dyn ExecutionRepository>>,
    assessor: Option<RiskAssessor>,
    runtime: Option<Handle>,
}

impl OrchestratorBuilder {
    /// Snapshot collaborator (required)
    #[must_use]
    pub fn snapshot_capture(mut self, capture: Arc<dyn SnapshotCapture>) -> Self {
        self.snapshot_capture = Some(capture);
        self
    }

    /// Step collaborator (required)
    #[must_use]
    pub fn step_runner(mut self, runner: Arc<dyn StepRunner>) -> Self {
        self.step_runner = Some(runner);
        self
    }

    /// Validation collaborator (required)
    #[must_use]
    pub fn validation_runner(mut self, runner: Arc<dyn ValidationRunner>) -> Self {
        self.validation_runner = Some(runner);
        self
    }

    /// Audit sink; defaults to [`TracingAuditLogger`]
    #[must_use]
    pub fn audit_logger(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Time source; defaults to [`SystemClock`]
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Point storage; defaults to in-memory
    #[must_use]
    pub fn point_repository(mut self, repo: Arc<dyn PointRepository>) -> Self {
        self.points = Some(repo);
        self
    }

    /// Plan storage; defaults to in-memory
    #[must_use]
    pub fn plan_repository(mut self, repo: Arc<dyn PlanRepository>) -> Self {
        self.plans = Some(repo);
        self
    }

    /// Execution storage; defaults to in-memory
    #[must_use]
    pub fn execution_repository(mut self, repo: Arc<dyn ExecutionRepository>) -> Self {
        self.executions = Some(repo);
        self
    }

    /// Risk rules; defaults to [`RiskAssessor::new`]
    #[must_use]
    pub fn risk_assessor(mut self, assessor: RiskAssessor) -> Self {
        self.assessor = Some(assessor);
        self
    }

    /// Runtime executions are spawned on; defaults to the current one
    #[must_use]
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Validate and assemble
    pub fn build(self) -> RollbackResult<RollbackOrchestrator> {
        self.config.validate()?;
        let missing = |what: &str| ConfigError::Invalid(format!("{what} collaborator is required"));
        let capture = self.snapshot_capture.ok_or_else(|| missing("snapshot capture"))?;
        let step_runner = self.step_runner.ok_or_else(|| missing("step runner"))?;
        let validation_runner = self
            .validation_runner
            .ok_or_else(|| missing("validation runner"))?;
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| {
                ConfigError::Invalid("no tokio runtime available to run executions".to_string())
            })?,
        };

        let audit = self
            .audit
            .unwrap_or_else(|| Arc::new(TracingAuditLogger) as Arc<dyn AuditLogger>);
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let points = self
            .points
            .unwrap_or_else(|| Arc::new(InMemoryPointRepository::new()) as Arc<dyn PointRepository>);
        let plans = self
            .plans
            .unwrap_or_else(|| Arc::new(InMemoryPlanRepository::new()) as Arc<dyn PlanRepository>);
        let executions = self.executions.unwrap_or_else(|| {
            Arc::new(InMemoryExecutionRepository::new()) as Arc<dyn ExecutionRepository>
        });

        let store = Arc::new(RollbackPointStore::new(
            RetentionPolicy::from_config(&self.config),
            points,
            capture,
            Arc::new(self.assessor.unwrap_or_default()),
            Arc::clone(&clock),
            Arc::clone(&audit),
        ));
        let ledger = Arc::new(ExecutionLedger::new(executions)?);
        let executor = Executor::new(
            step_runner,
            validation_runner,
            Arc::clone(&ledger),
            Arc::clone(&audit),
            Arc::clone(&clock),
            self.config.validation_gating,
        );
        let planner = PlanBuilder::new(&self.config).with_clock(Arc::clone(&clock));

        Ok(RollbackOrchestrator {
            config: self.config,
            store,
            plans,
            planner,
            ledger,
            leases: Arc::new(EnvironmentLeases::new()),
            executor,
            audit,
            clock,
            runtime,
        })
    }
}

/// Rollback orchestration service
#[derive(Debug)]
pub struct RollbackOrchestrator {
    config: RollbackConfig,
    store: Arc<RollbackPointStore>,
    plans: Arc<dyn PlanRepository>,
    planner: PlanBuilder,
    ledger: Arc<ExecutionLedger>,
    leases: Arc<EnvironmentLeases>,
    executor: Executor,
    audit: Arc<dyn AuditLogger>,
    clock: Arc<dyn Clock>,
    runtime: Handle,
}

impl RollbackOrchestrator {
    /// Start building an orchestrator
    #[must_use]
    pub fn builder(config: RollbackConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            snapshot_capture: None,
            step_runner: None,
            validation_runner: None,
            audit: None,
            clock: None,
            points: None,
            plans: None,
            executions: None,
            assessor: None,
            runtime: None,
        }
    }

    /// Configuration in force
    #[inline]
    #[must_use]
    pub fn config(&self) -> &RollbackConfig {
        &self.config
    }

    /// Snapshot, assess and register a rollback point
    pub async fn create_rollback_point(
        &self,
        kind: ChangeKind,
        description: &str,
        version: &str,
        environment: Environment,
        actor: &str,
    ) -> RollbackResult<RollbackPoint> {
        self.create_rollback_point_with(NewRollbackPoint::new(
            kind,
            description,
            version,
            environment,
            actor,
        ))
        .await
    }

    /// Register a rollback point from a full request
    pub async fn create_rollback_point_with(
        &self,
        request: NewRollbackPoint,
    ) -> RollbackResult<RollbackPoint> {
        self.store
            .create(request, || self.leases.pinned_points())
            .await
    }

    /// Build and store a plan for an active point
    pub fn create_rollback_plan(&self, point_id: RollbackPointId) -> RollbackResult<RollbackPlan> {
        let point = self.store.get(point_id)?;
        if !point.is_active() {
            return Err(RollbackError::invalid_state(
                Entity::RollbackPoint,
                point_id,
                point.status,
                "plan",
            ));
        }

        let plan = self.planner.build(&point)?;
        self.plans.insert(plan.clone())?;
        info!(
            plan_id = %plan.id,
            point_id = %point.id,
            steps = plan.steps.len(),
            approval_required = plan.approval_required,
            estimated_minutes = plan.estimated_duration_minutes,
            "rollback plan created"
        );
        self.audit.record(AuditEvent::PlanCreated {
            plan_id: plan.id,
            point_id: point.id,
            approval_required: plan.approval_required,
            steps: plan.steps.len(),
        });
        Ok(plan)
    }

    /// Accept a plan for execution and dispatch it in the background
    ///
    /// Returns the execution as recorded, in `pending`. Approval is checked
    /// before anything is recorded; a refused call leaves no execution.
    pub fn execute_rollback(
        &self,
        plan_id: PlanId,
        executed_by: &str,
        approved_by: Option<&str>,
    ) -> RollbackResult<Execution> {
        let plan = self.get_rollback_plan(plan_id)?;
        let approver = normalize_approver(approved_by);
        let execution_id = ExecutionId::new();

        // The lease is taken under the point's environment lock so no sweep
        // can retire the point between the check and the pin.
        let lease = self.store.pin_active(plan.point_id, "execute a plan of", |point| {
            let needs_approval = plan.approval_required || point_requires_approval(point);
            if needs_approval && approver.is_none() {
                warn!(%plan_id, executed_by, "execution refused: approval required");
                self.audit.record(AuditEvent::ApprovalDenied {
                    plan_id,
                    executed_by: executed_by.to_string(),
                });
                return Err(RollbackError::ApprovalRequired { plan_id });
            }
            self.leases.try_acquire(
                plan.environment,
                LeaseHolder {
                    execution_id,
                    point_id: point.id,
                },
            )
        })?;

        let execution = Execution::pending(
            execution_id,
            &plan,
            executed_by,
            approver,
            self.clock.now(),
        );
        self.ledger.record(execution.clone())?;

        info!(
            execution_id = %execution.id,
            %plan_id,
            environment = %plan.environment,
            executed_by,
            approved_by = execution.approved_by.as_deref().unwrap_or("-"),
            "rollback execution accepted"
        );
        self.audit.record(AuditEvent::ExecutionStarted {
            execution_id: execution.id,
            plan_id,
            environment: plan.environment,
            executed_by: execution.executed_by.clone(),
            approved_by: execution.approved_by.clone(),
        });

        self.dispatch(plan, execution.id, lease);
        Ok(execution)
    }

    /// Cancel a pending or in-progress execution
    ///
    /// Takes effect at the next step boundary; a dispatched step runs to
    /// its outcome.
    pub fn cancel_execution(&self, id: ExecutionId) -> RollbackResult<()> {
        let now = self.clock.now();
        self.ledger.update(id, |e| {
            if e.is_terminal() {
                return Err(RollbackError::invalid_state(
                    Entity::Execution,
                    id,
                    e.status,
                    "cancel",
                ));
            }
            e.status = ExecutionStatus::Cancelled;
            e.end_time = Some(now);
            Ok(())
        })?;
        info!(execution_id = %id, "rollback execution cancelled");
        self.audit
            .record(AuditEvent::ExecutionCancelled { execution_id: id });
        Ok(())
    }

    /// Fetch a rollback point
    pub fn get_rollback_point(&self, id: RollbackPointId) -> RollbackResult<RollbackPoint> {
        self.store.get(id)
    }

    /// Fetch a rollback plan
    pub fn get_rollback_plan(&self, id: PlanId) -> RollbackResult<RollbackPlan> {
        self.plans
            .get(&id)?
            .ok_or_else(|| RollbackError::not_found(Entity::Plan, id))
    }

    /// Fetch an execution
    pub fn get_execution(&self, id: ExecutionId) -> RollbackResult<Execution> {
        self.ledger.get(id)
    }

    /// Rollback points, oldest first
    pub fn list_rollback_points(
        &self,
        environment: Option<Environment>,
    ) -> RollbackResult<Vec<RollbackPoint>> {
        self.store.list(environment)
    }

    /// Plans built from a point
    pub fn list_rollback_plans(&self, point_id: RollbackPointId) -> RollbackResult<Vec<RollbackPlan>> {
        Ok(self.plans.for_point(&point_id)?)
    }

    /// Executions, oldest first
    pub fn list_executions(
        &self,
        environment: Option<Environment>,
        status: Option<ExecutionStatus>,
    ) -> RollbackResult<Vec<Execution>> {
        self.ledger.list(environment, status)
    }

    /// Executions of one plan, oldest first
    pub fn list_executions_for_plan(&self, plan_id: PlanId) -> RollbackResult<Vec<Execution>> {
        self.ledger.by_plan(plan_id)
    }

    /// Every committed state of an execution
    pub fn subscribe(&self, id: ExecutionId) -> RollbackResult<watch::Receiver<Execution>> {
        self.ledger.subscribe(id)
    }

    /// Wait until an execution is terminal and its task has exited
    pub async fn wait_for_terminal(&self, id: ExecutionId) -> RollbackResult<Execution> {
        let mut rx = self.ledger.subscribe(id)?;
        rx.wait_for(Execution::is_terminal)
            .await
            .map_err(|_| RollbackError::not_found(Entity::Execution, id))?;
        self.leases.wait_released(id).await;
        self.ledger.get(id)
    }

    /// Apply retention to one environment now
    pub fn sweep_retention(&self, environment: Environment) -> RollbackResult<RetentionReport> {
        self.store
            .sweep(environment, || self.leases.pinned_points())
    }

    /// Execution counts per status
    #[must_use]
    pub fn ledger_stats(&self) -> LedgerStats {
        self.ledger.stats()
    }

    /// Run the executor in a supervised task
    ///
    /// The inner task's error or panic is captured into the execution. The
    /// environment is swept for retention before the lease is released.
    fn dispatch(&self, plan: RollbackPlan, id: ExecutionId, lease: EnvironmentLease) {
        let executor = self.executor.clone();
        let store = Arc::clone(&self.store);
        let leases = Arc::clone(&self.leases);
        let environment = plan.environment;
        let span = tracing::info_span!("rollback_supervisor", execution_id = %id);

        self.runtime.spawn(
            async move {
                let worker = {
                    let executor = executor.clone();
                    tokio::spawn(async move { executor.run(&plan, id).await })
                };

                let failure = match worker.await {
                    Ok(Ok(status)) => {
                        info!(%status, "execution task finished");
                        None
                    }
                    Ok(Err(err)) => Some(format!("execution aborted by internal error: {err}")),
                    Err(join) if join.is_panic() => Some(format!(
                        "execution task panicked: {}",
                        panic_message(join.into_panic().as_ref())
                    )),
                    Err(join) => Some(format!("execution task did not finish: {join}")),
                };
                if let Some(message) = failure {
                    if let Err(err) = executor.mark_failed(id, &message) {
                        error!(error = %err, "could not record execution failure");
                    }
                }

                if let Err(err) = store.sweep(environment, || leases.pinned_points_except(id)) {
                    warn!(error = %err, "retention sweep after execution failed");
                }
                drop(lease);
            }
            .instrument(span),
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_reads_common_payloads() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic payload");
    }

    #[test]
    fn build_requires_collaborators() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let err = RollbackOrchestrator::builder(RollbackConfig::default())
            .runtime(rt.handle().clone())
            .build()
            .unwrap_err();
        assert!(matches!(err, RollbackError::Config(ConfigError::Invalid(_))));
    }
}
