//! End-to-end runs of the three reference rollbacks

use pretty_assertions::assert_eq;
use rollback_core::audit::AuditEvent;
use rollback_core::sim::{run_scenario, Scenario};
use rollback_core::{
    ChangeKind, Environment, ExecutionStatus, RollbackConfig, RollbackError, Severity, StepStatus,
};
use rollback_test_utils::{Harness, Script};

#[tokio::test]
async fn test_production_database_rollback_needs_an_approver() {
    let h = Harness::new();
    let plan = h.plan(ChangeKind::Database, Environment::Production).await;
    assert!(plan.approval_required);

    let err = h
        .orchestrator
        .execute_rollback(plan.id, "alice", None)
        .unwrap_err();
    assert!(matches!(err, RollbackError::ApprovalRequired { plan_id } if plan_id == plan.id));
    assert!(err.requires_human());

    // Blank approvers count as absent.
    assert!(h
        .orchestrator
        .execute_rollback(plan.id, "alice", Some("   "))
        .is_err());
    assert!(h.orchestrator.list_executions(None, None).unwrap().is_empty());
    assert!(h.steps.calls().is_empty());

    let execution = h.run(&plan, Some("bob")).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.approved_by.as_deref(), Some("bob"));
    assert_eq!(execution.progress_percent, 100);
    assert!(execution.errors.is_empty());

    let denied = h
        .audit
        .events()
        .iter()
        .filter(|e| matches!(e, AuditEvent::ApprovalDenied { .. }))
        .count();
    assert_eq!(denied, 2);
}

#[tokio::test]
async fn test_staging_config_rollback_runs_unattended() {
    let h = Harness::new();
    let plan = h.plan(ChangeKind::Config, Environment::Staging).await;
    assert!(!plan.approval_required);

    let execution = h.run(&plan, None).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.progress_percent, 100);
    assert!(execution.end_time.is_some());
    assert!(execution.current_step_id.is_none());
    assert_eq!(
        h.steps.calls(),
        vec![
            "pre-rollback-health-check",
            "restore-config",
            "post-rollback-health-check"
        ]
    );
    // pre checks + steps + post checks
    assert_eq!(execution.executed_steps.len(), 2 + 3 + 2);
    assert!(execution
        .executed_steps
        .iter()
        .all(|s| s.status == StepStatus::Completed));
}

#[tokio::test]
async fn test_timing_out_file_restore_is_tolerated() {
    let h = Harness::builder()
        .step("restore-files", Script::AlwaysTimeout)
        .build();
    let plan = h.plan(ChangeKind::Deployment, Environment::Staging).await;

    let execution = h.run(&plan, None).await;

    assert_eq!(h.steps.attempts("restore-files"), 4);
    let restore = plan.step_by_action("restore-files").unwrap();
    let record = execution.executed_step(restore.id).unwrap();
    assert_eq!(record.status, StepStatus::Failed);
    assert_eq!(record.retry_count, 3);
    assert!(record.error.as_deref().unwrap().contains("timed out"));

    let start = plan.step_by_action("start-service").unwrap();
    assert_eq!(
        execution.executed_step(start.id).map(|r| r.status),
        Some(StepStatus::Completed)
    );

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.errors.len(), 1);
    assert_eq!(execution.errors[0].step_id, Some(restore.id));
    assert_eq!(execution.errors[0].severity, Severity::Medium);
    assert_eq!(execution.unrecovered_errors().count(), 1);
}

#[tokio::test]
async fn test_simulated_scenarios_reach_expected_outcomes() {
    let a = run_scenario(Scenario::A, RollbackConfig::default()).await.unwrap();
    assert!(a.refused_without_approver.is_some());
    assert_eq!(a.execution.status, ExecutionStatus::Completed);
    assert_eq!(a.execution.approved_by.as_deref(), Some("bob"));

    let c = run_scenario(Scenario::C, RollbackConfig::default()).await.unwrap();
    assert_eq!(c.execution.status, ExecutionStatus::Completed);
    assert_eq!(c.execution.errors.len(), 1);
    assert!(c.generate_text().contains("restore-files"));
    assert!(c.audit_events > 0);
    assert_eq!(c.audit_head.as_deref().map(str::len), Some(64));
}
