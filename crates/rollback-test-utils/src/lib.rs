//! Testing utilities for the rollback workspace
//!
//! Scripted collaborators, a manual clock and a ready-wired orchestrator
//! harness.

#![allow(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rollback_core::audit::AuditTrail;
use rollback_core::clock::Clock;
use rollback_core::collaborators::{
    ConfigSnapshot, DatabaseSnapshot, EnvironmentSnapshot, FeatureSnapshot, FileSnapshot,
    SnapshotCapture, StepRunner, ValidationRunner,
};
use rollback_core::error::{SnapshotError, StepError, ValidationError};
use rollback_core::{
    ChangeKind, Environment, Execution, RollbackConfig, RollbackOrchestrator, RollbackPlan,
    RollbackPoint, RollbackStep, SnapshotComponent, ValidationStep,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Rendezvous between a test and a blocked collaborator call
#[derive(Debug, Default)]
pub struct StepGate {
    entered: Notify,
    release: Notify,
    has_entered: AtomicBool,
}

impl StepGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Resolve once the blocked call has been entered
    pub async fn wait_entered(&self) {
        if self.has_entered.load(Ordering::SeqCst) {
            return;
        }
        self.entered.notified().await;
    }

    /// Let the blocked call finish successfully
    pub fn release(&self) {
        self.release.notify_one();
    }

    async fn block(&self) {
        self.has_entered.store(true, Ordering::SeqCst);
        self.entered.notify_one();
        self.release.notified().await;
    }
}

/// Behaviour of one action under [`ScriptedStepRunner`]
#[derive(Debug, Clone)]
pub enum Script {
    Succeed,
    /// Fail the first `n` attempts, then succeed
    FailTimes(u32),
    AlwaysFail,
    /// Report a timeout immediately
    AlwaysTimeout,
    /// Never return; the executor's deadline has to fire
    Hang,
    /// Wait on the gate, then succeed
    Block(Arc<StepGate>),
    Panic,
}

/// Step runner driven by per-action scripts; unscripted actions succeed
#[derive(Debug, Default)]
pub struct ScriptedStepRunner {
    scripts: DashMap<String, Script>,
    attempts: DashMap<String, u32>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedStepRunner {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_script(self, action: &str, script: Script) -> Self {
        self.set_script(action, script);
        self
    }

    pub fn set_script(&self, action: &str, script: Script) {
        self.scripts.insert(action.to_string(), script);
    }

    /// Actions in call order, one entry per attempt
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn attempts(&self, action: &str) -> u32 {
        self.attempts.get(action).map_or(0, |n| *n)
    }
}

#[async_trait]
impl StepRunner for ScriptedStepRunner {
    async fn run(&self, step: &RollbackStep, deadline: Duration) -> Result<String, StepError> {
        self.calls.lock().push(step.action.clone());
        let attempt = {
            let mut n = self.attempts.entry(step.action.clone()).or_insert(0);
            *n += 1;
            *n
        };
        let script = self
            .scripts
            .get(&step.action)
            .map_or(Script::Succeed, |s| s.value().clone());

        match script {
            Script::Succeed => Ok(format!("{} ok", step.action)),
            Script::FailTimes(n) if attempt <= n => {
                Err(StepError::Failed(format!("{} attempt {attempt} failed", step.action)))
            }
            Script::FailTimes(_) => Ok(format!("{} ok after {attempt} attempts", step.action)),
            Script::AlwaysFail => Err(StepError::Failed(format!("{} failed", step.action))),
            Script::AlwaysTimeout => Err(StepError::Timeout {
                secs: deadline.as_secs(),
            }),
            Script::Hang => std::future::pending::<Result<String, StepError>>().await,
            Script::Block(gate) => {
                gate.block().await;
                Ok(format!("{} ok", step.action))
            }
            Script::Panic => panic!("scripted panic in {}", step.action),
        }
    }
}

/// Behaviour of one check under [`ScriptedValidationRunner`]
#[derive(Debug, Clone)]
pub enum CheckScript {
    /// Return this value regardless of the expected one
    Return(serde_json::Value),
    Fail(String),
    Hang,
}

/// Validation runner echoing each check's expected value unless scripted
#[derive(Debug, Default)]
pub struct ScriptedValidationRunner {
    scripts: DashMap<String, CheckScript>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedValidationRunner {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_script(self, check: &str, script: CheckScript) -> Self {
        self.set_script(check, script);
        self
    }

    pub fn set_script(&self, check: &str, script: CheckScript) {
        self.scripts.insert(check.to_string(), script);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ValidationRunner for ScriptedValidationRunner {
    async fn check(
        &self,
        step: &ValidationStep,
        _deadline: Duration,
    ) -> Result<serde_json::Value, ValidationError> {
        self.calls.lock().push(step.check.clone());
        let script = self.scripts.get(&step.check).map(|s| s.value().clone());
        match script {
            None => Ok(step.expected_result.clone()),
            Some(CheckScript::Return(value)) => Ok(value),
            Some(CheckScript::Fail(reason)) => Err(ValidationError::CheckFailed(reason)),
            Some(CheckScript::Hang) => {
                std::future::pending::<Result<serde_json::Value, ValidationError>>().await
            }
        }
    }
}

/// Snapshot backend returning fixed data
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticSnapshotCapture;

#[async_trait]
impl SnapshotCapture for StaticSnapshotCapture {
    async fn capture_files(&self) -> Result<Vec<FileSnapshot>, SnapshotError> {
        Ok(vec![FileSnapshot {
            path: "/srv/app/bin/app".into(),
            checksum: "aa11".into(),
            size_bytes: 1024,
        }])
    }

    async fn capture_database(&self) -> Result<DatabaseSnapshot, SnapshotError> {
        Ok(DatabaseSnapshot {
            schema_version: "7".into(),
            tables: vec!["accounts".into()],
            backup_ref: "dump-7".into(),
        })
    }

    async fn capture_config(&self, environment: Environment) -> Result<ConfigSnapshot, SnapshotError> {
        Ok(ConfigSnapshot {
            environment,
            values: BTreeMap::from([("pool_size".to_string(), "16".to_string())]),
        })
    }

    async fn capture_feature_flags(&self) -> Result<Vec<FeatureSnapshot>, SnapshotError> {
        Ok(vec![FeatureSnapshot {
            name: "new-checkout".into(),
            enabled: true,
            rollout_percent: 25,
        }])
    }

    async fn capture_environment(&self) -> Result<EnvironmentSnapshot, SnapshotError> {
        Ok(EnvironmentSnapshot {
            runtime_version: "test".into(),
            variables: BTreeMap::new(),
        })
    }
}

/// Snapshot backend failing on one component
#[derive(Debug, Clone, Copy)]
pub struct FailingSnapshotCapture {
    pub component: SnapshotComponent,
}

impl FailingSnapshotCapture {
    fn check(&self, component: SnapshotComponent) -> Result<(), SnapshotError> {
        if component == self.component {
            return Err(SnapshotError::CaptureFailed {
                component,
                reason: "backend refused".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotCapture for FailingSnapshotCapture {
    async fn capture_files(&self) -> Result<Vec<FileSnapshot>, SnapshotError> {
        self.check(SnapshotComponent::Files)?;
        StaticSnapshotCapture.capture_files().await
    }

    async fn capture_database(&self) -> Result<DatabaseSnapshot, SnapshotError> {
        self.check(SnapshotComponent::Database)?;
        StaticSnapshotCapture.capture_database().await
    }

    async fn capture_config(&self, environment: Environment) -> Result<ConfigSnapshot, SnapshotError> {
        self.check(SnapshotComponent::Config)?;
        StaticSnapshotCapture.capture_config(environment).await
    }

    async fn capture_feature_flags(&self) -> Result<Vec<FeatureSnapshot>, SnapshotError> {
        self.check(SnapshotComponent::FeatureFlags)?;
        StaticSnapshotCapture.capture_feature_flags().await
    }

    async fn capture_environment(&self) -> Result<EnvironmentSnapshot, SnapshotError> {
        self.check(SnapshotComponent::Environment)?;
        StaticSnapshotCapture.capture_environment().await
    }
}

/// Snapshot backend whose next config capture waits on a gate
#[derive(Debug, Default)]
pub struct GatedSnapshotCapture {
    armed: Mutex<Option<Arc<StepGate>>>,
}

impl GatedSnapshotCapture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Block the next config capture until `gate` is released
    pub fn arm(&self, gate: Arc<StepGate>) {
        *self.armed.lock() = Some(gate);
    }
}

#[async_trait]
impl SnapshotCapture for GatedSnapshotCapture {
    async fn capture_files(&self) -> Result<Vec<FileSnapshot>, SnapshotError> {
        StaticSnapshotCapture.capture_files().await
    }

    async fn capture_database(&self) -> Result<DatabaseSnapshot, SnapshotError> {
        StaticSnapshotCapture.capture_database().await
    }

    async fn capture_config(&self, environment: Environment) -> Result<ConfigSnapshot, SnapshotError> {
        let gate = self.armed.lock().take();
        if let Some(gate) = gate {
            gate.block().await;
        }
        StaticSnapshotCapture.capture_config(environment).await
    }

    async fn capture_feature_flags(&self) -> Result<Vec<FeatureSnapshot>, SnapshotError> {
        StaticSnapshotCapture.capture_feature_flags().await
    }

    async fn capture_environment(&self) -> Result<EnvironmentSnapshot, SnapshotError> {
        StaticSnapshotCapture.capture_environment().await
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Fixed, arbitrary start instant
    pub fn fixed() -> Self {
        Self::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap())
    }

    pub fn advance(&self, by: ChronoDuration) {
        *self.now.lock() += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Orchestrator wired to scripted collaborators
#[derive(Debug)]
pub struct Harness {
    pub orchestrator: RollbackOrchestrator,
    pub steps: Arc<ScriptedStepRunner>,
    pub checks: Arc<ScriptedValidationRunner>,
    pub audit: Arc<AuditTrail>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    /// Harness with default configuration; needs a running tokio runtime
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub async fn point(&self, kind: ChangeKind, environment: Environment) -> RollbackPoint {
        self.orchestrator
            .create_rollback_point(kind, "test change", "1.0.0", environment, "alice")
            .await
            .unwrap()
    }

    pub async fn plan(&self, kind: ChangeKind, environment: Environment) -> RollbackPlan {
        let point = self.point(kind, environment).await;
        self.orchestrator.create_rollback_plan(point.id).unwrap()
    }

    /// Start `plan` and wait until it is terminal
    pub async fn run(&self, plan: &RollbackPlan, approver: Option<&str>) -> Execution {
        let started = self
            .orchestrator
            .execute_rollback(plan.id, "alice", approver)
            .unwrap();
        self.orchestrator.wait_for_terminal(started.id).await.unwrap()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct HarnessBuilder {
    config: RollbackConfig,
    steps: ScriptedStepRunner,
    checks: ScriptedValidationRunner,
    capture: Arc<dyn SnapshotCapture>,
    clock: Arc<ManualClock>,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            config: RollbackConfig::default(),
            steps: ScriptedStepRunner::new(),
            checks: ScriptedValidationRunner::new(),
            capture: Arc::new(StaticSnapshotCapture),
            clock: Arc::new(ManualClock::fixed()),
        }
    }
}

impl HarnessBuilder {
    #[must_use]
    pub fn config(mut self, config: RollbackConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn step(mut self, action: &str, script: Script) -> Self {
        self.steps = self.steps.with_script(action, script);
        self
    }

    #[must_use]
    pub fn check(mut self, check: &str, script: CheckScript) -> Self {
        self.checks = self.checks.with_script(check, script);
        self
    }

    #[must_use]
    pub fn capture(mut self, capture: Arc<dyn SnapshotCapture>) -> Self {
        self.capture = capture;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<ManualClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Harness {
        let steps = Arc::new(self.steps);
        let checks = Arc::new(self.checks);
        let audit = Arc::new(AuditTrail::with_clock(self.clock.clone()));
        let orchestrator = RollbackOrchestrator::builder(self.config)
            .snapshot_capture(self.capture)
            .step_runner(steps.clone())
            .validation_runner(checks.clone())
            .audit_logger(audit.clone())
            .clock(self.clock.clone())
            .build()
            .unwrap();

        Harness {
            orchestrator,
            steps,
            checks,
            audit,
            clock: self.clock,
        }
    }
}
