//! Plan construction
//!
//! Turns a rollback point into an ordered plan:
//! - a critical pre-rollback health check step
//! - the middle steps of the point's change kind
//! - a critical post-rollback health check step
//!
//! Steps are ordered by their `depends_on` edges with a topological sort;
//! cycles and dangling dependencies are rejected. Timeouts and retries come
//! from the configured step policies.

use crate::approval::point_requires_approval;
use crate::clock::{Clock, SystemClock};
use crate::config::{RollbackConfig, StepPolicies};
use crate::error::PlanError;
use crate::types::{
    ChangeKind, PlanId, RollbackPlan, RollbackPoint, RollbackStep, StepId, StepKind,
    ValidationKind, ValidationStep,
};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

/// Check name of the health validation
pub const CHECK_SYSTEM_HEALTH: &str = "system-health";
/// Check name of the snapshot integrity validation
pub const CHECK_SNAPSHOT_INTEGRITY: &str = "snapshot-integrity";
/// Check name of the functional smoke test
pub const CHECK_SMOKE_TEST: &str = "functional-smoke-test";

/// Action of the leading health check step
pub const ACTION_PRE_HEALTH_CHECK: &str = "pre-rollback-health-check";
/// Action of the trailing health check step
pub const ACTION_POST_HEALTH_CHECK: &str = "post-rollback-health-check";

struct StepTemplate {
    kind: StepKind,
    action: &'static str,
    description: &'static str,
    automated: bool,
    critical: bool,
}

const fn template(
    kind: StepKind,
    action: &'static str,
    description: &'static str,
    automated: bool,
    critical: bool,
) -> StepTemplate {
    StepTemplate {
        kind,
        action,
        description,
        automated,
        critical,
    }
}

/// Middle steps per change kind, as a chain
fn middle_steps(kind: ChangeKind) -> &'static [StepTemplate] {
    const DEPLOYMENT: &[StepTemplate] = &[
        template(StepKind::Service, "stop-service", "Stop application service", true, true),
        template(StepKind::File, "restore-files", "Restore application files", true, false),
        template(StepKind::Service, "start-service", "Start application service", true, true),
    ];
    const DATABASE: &[StepTemplate] = &[template(
        StepKind::Database,
        "restore-database",
        "Restore database from snapshot",
        false,
        true,
    )];
    const CONFIG: &[StepTemplate] = &[template(
        StepKind::Config,
        "restore-config",
        "Restore configuration",
        true,
        false,
    )];
    const FEATURE: &[StepTemplate] = &[template(
        StepKind::Config,
        "restore-feature-flags",
        "Restore feature flag states",
        true,
        false,
    )];
    const SYSTEM: &[StepTemplate] = &[template(
        StepKind::File,
        "restore-system-state",
        "Restore system state",
        true,
        true,
    )];

    match kind {
        ChangeKind::Deployment => DEPLOYMENT,
        ChangeKind::Database => DATABASE,
        ChangeKind::Config => CONFIG,
        ChangeKind::Feature => FEATURE,
        ChangeKind::System => SYSTEM,
    }
}

/// Builds rollback plans from points
#[derive(Debug, Clone)]
pub struct PlanBuilder {
    policies: StepPolicies,
    validation_timeout_secs: u64,
    include_smoke_test: bool,
    clock: Arc<dyn Clock>,
}

impl PlanBuilder {
    /// Builder using `config`
    #[must_use]
    pub fn new(config: &RollbackConfig) -> Self {
        Self {
            policies: config.step_policies.clone(),
            validation_timeout_secs: config.validation_timeout_secs,
            include_smoke_test: config.include_smoke_test,
            clock: Arc::new(SystemClock),
        }
    }

    /// With a clock for plan timestamps
    #[inline]
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build a plan for `point`
    pub fn build(&self, point: &RollbackPoint) -> Result<RollbackPlan, PlanError> {
        let mut steps = Vec::new();
        let pre = self.step(
            &template(
                StepKind::Validation,
                ACTION_PRE_HEALTH_CHECK,
                "Pre-rollback health check",
                true,
                true,
            ),
            Vec::new(),
        );
        let mut previous = pre.id;
        steps.push(pre);

        for tpl in middle_steps(point.kind) {
            let step = self.step(tpl, vec![previous]);
            previous = step.id;
            steps.push(step);
        }

        steps.push(self.step(
            &template(
                StepKind::Validation,
                ACTION_POST_HEALTH_CHECK,
                "Post-rollback health check",
                true,
                true,
            ),
            vec![previous],
        ));

        let steps = order_steps(steps)?;
        let total_secs: u64 = steps.iter().map(|s| s.timeout_secs).sum();

        Ok(RollbackPlan {
            id: PlanId::new(),
            point_id: point.id,
            environment: point.environment,
            change_kind: point.kind,
            steps,
            risks: point.risks.clone(),
            approval_required: point_requires_approval(point),
            pre_validation: self.pre_validation(point),
            post_validation: self.post_validation(),
            estimated_duration_minutes: total_secs / 60,
            created_at: self.clock.now(),
        })
    }

    fn step(&self, tpl: &StepTemplate, depends_on: Vec<StepId>) -> RollbackStep {
        let policy = self.policies.for_kind(tpl.kind);
        RollbackStep {
            id: StepId::new(),
            order: 0,
            kind: tpl.kind,
            action: tpl.action.to_string(),
            description: tpl.description.to_string(),
            automated: tpl.automated,
            timeout_secs: policy.timeout_secs,
            max_retries: policy.max_retries,
            depends_on,
            critical: tpl.critical,
        }
    }

    fn validation(
        &self,
        kind: ValidationKind,
        check: &str,
        description: &str,
        expected: serde_json::Value,
        critical: bool,
    ) -> ValidationStep {
        ValidationStep {
            id: StepId::new(),
            kind,
            description: description.to_string(),
            check: check.to_string(),
            expected_result: expected,
            timeout_secs: self.validation_timeout_secs,
            critical,
        }
    }

    fn pre_validation(&self, point: &RollbackPoint) -> Vec<ValidationStep> {
        vec![
            self.validation(
                ValidationKind::Health,
                CHECK_SYSTEM_HEALTH,
                "System is healthy before rollback",
                json!("healthy"),
                true,
            ),
            self.validation(
                ValidationKind::Integrity,
                CHECK_SNAPSHOT_INTEGRITY,
                "Snapshot digest matches the rollback point",
                json!(point.snapshot.digest),
                true,
            ),
        ]
    }

    fn post_validation(&self) -> Vec<ValidationStep> {
        let mut checks = vec![self.validation(
            ValidationKind::Health,
            CHECK_SYSTEM_HEALTH,
            "System is healthy after rollback",
            json!("healthy"),
            true,
        )];
        if self.include_smoke_test {
            checks.push(self.validation(
                ValidationKind::Functional,
                CHECK_SMOKE_TEST,
                "Functional smoke test",
                json!("passed"),
                false,
            ));
        }
        checks
    }
}

/// Order steps so every step follows its dependencies; assigns `order` 1..n
pub fn order_steps(steps: Vec<RollbackStep>) -> Result<Vec<RollbackStep>, PlanError> {
    let mut graph: DiGraphMap<StepId, ()> = DiGraphMap::new();
    for step in &steps {
        graph.add_node(step.id);
    }
    for step in &steps {
        for dependency in &step.depends_on {
            if !graph.contains_node(*dependency) {
                return Err(PlanError::UnknownDependency {
                    step: step.action.clone(),
                    dependency: dependency.to_string(),
                });
            }
            graph.add_edge(*dependency, step.id, ());
        }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| PlanError::Cycle {
        step: steps
            .iter()
            .find(|s| s.id == cycle.node_id())
            .map_or_else(|| cycle.node_id().to_string(), |s| s.action.clone()),
    })?;

    let mut by_id: HashMap<StepId, RollbackStep> = steps.into_iter().map(|s| (s.id, s)).collect();
    let mut ordered = Vec::with_capacity(sorted.len());
    for (position, id) in sorted.into_iter().enumerate() {
        if let Some(mut step) = by_id.remove(&id) {
            step.order = u32::try_from(position + 1).unwrap_or(u32::MAX);
            ordered.push(step);
        }
    }
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StepPolicy;
    use crate::risk::RiskAssessor;
    use crate::types::{Environment, PointStatus, RollbackPointId, SnapshotRef};
    use chrono::Utc;

    fn point(kind: ChangeKind, environment: Environment) -> RollbackPoint {
        RollbackPoint {
            id: RollbackPointId::new(),
            created_at: Utc::now(),
            kind,
            description: String::new(),
            version: "1".into(),
            environment,
            status: PointStatus::Active,
            created_by: "alice".into(),
            risks: RiskAssessor::new().assess(kind, environment),
            dependencies: Vec::new(),
            snapshot: SnapshotRef {
                digest: "abc".into(),
                captured_at: Utc::now(),
                components: Vec::new(),
            },
        }
    }

    fn actions(plan: &RollbackPlan) -> Vec<&str> {
        plan.steps.iter().map(|s| s.action.as_str()).collect()
    }

    #[test]
    fn deployment_plan_shape() {
        let plan = PlanBuilder::new(&RollbackConfig::default())
            .build(&point(ChangeKind::Deployment, Environment::Staging))
            .unwrap();

        assert_eq!(
            actions(&plan),
            vec![
                ACTION_PRE_HEALTH_CHECK,
                "stop-service",
                "restore-files",
                "start-service",
                ACTION_POST_HEALTH_CHECK,
            ]
        );
        let critical: Vec<_> = plan.steps.iter().map(|s| s.critical).collect();
        assert_eq!(critical, vec![true, true, false, true, true]);
        let orders: Vec<_> = plan.steps.iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![1, 2, 3, 4, 5]);

        let restore = plan.step_by_action("restore-files").unwrap();
        let stop = plan.step_by_action("stop-service").unwrap();
        assert_eq!(restore.depends_on, vec![stop.id]);
        assert_eq!(restore.max_retries, 3);
        assert!(!plan.approval_required);
    }

    #[test]
    fn database_step_needs_a_human() {
        let plan = PlanBuilder::new(&RollbackConfig::default())
            .build(&point(ChangeKind::Database, Environment::Development))
            .unwrap();

        let restore = plan.step_by_action("restore-database").unwrap();
        assert!(!restore.automated);
        assert!(restore.critical);
        assert!(plan.approval_required);
    }

    #[test]
    fn estimate_is_whole_minutes_of_total_timeout() {
        // 60 + 60 + 60 seconds for config: pre check, restore, post check
        let plan = PlanBuilder::new(&RollbackConfig::default())
            .build(&point(ChangeKind::Config, Environment::Staging))
            .unwrap();
        assert_eq!(plan.estimated_duration_minutes, 3);

        let plan = PlanBuilder::new(&RollbackConfig::default())
            .build(&point(ChangeKind::Deployment, Environment::Staging))
            .unwrap();
        // 60 + 120 + 300 + 120 + 60 = 660s
        assert_eq!(plan.estimated_duration_minutes, 11);

        // 60 + 30 + 60 = 150s; partial minutes are dropped
        let config = RollbackConfig::default()
            .with_step_policy(StepKind::Config, StepPolicy::new(30, 1));
        let plan = PlanBuilder::new(&config)
            .build(&point(ChangeKind::Config, Environment::Staging))
            .unwrap();
        assert_eq!(plan.estimated_duration_minutes, 2);
    }

    #[test]
    fn smoke_test_is_optional() {
        let with = PlanBuilder::new(&RollbackConfig::default())
            .build(&point(ChangeKind::Config, Environment::Staging))
            .unwrap();
        let without = PlanBuilder::new(&RollbackConfig::default().with_smoke_test(false))
            .build(&point(ChangeKind::Config, Environment::Staging))
            .unwrap();

        assert_eq!(with.post_validation.len(), 2);
        assert!(!with.post_validation[1].critical);
        assert_eq!(without.post_validation.len(), 1);
    }

    #[test]
    fn integrity_check_expects_point_digest() {
        let plan = PlanBuilder::new(&RollbackConfig::default())
            .build(&point(ChangeKind::Feature, Environment::Staging))
            .unwrap();
        let integrity = plan
            .pre_validation
            .iter()
            .find(|v| v.check == CHECK_SNAPSHOT_INTEGRITY)
            .unwrap();
        assert_eq!(integrity.expected_result, json!("abc"));
    }

    fn bare(action: &str) -> RollbackStep {
        RollbackStep {
            id: StepId::new(),
            order: 0,
            kind: StepKind::Service,
            action: action.into(),
            description: String::new(),
            automated: true,
            timeout_secs: 1,
            max_retries: 0,
            depends_on: Vec::new(),
            critical: false,
        }
    }

    #[test]
    fn order_steps_follows_dependencies() {
        let a = bare("a");
        let mut b = bare("b");
        let mut c = bare("c");
        c.depends_on = vec![b.id];
        b.depends_on = vec![a.id];

        let ordered = order_steps(vec![c, a, b]).unwrap();
        let names: Vec<_> = ordered.iter().map(|s| s.action.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn order_steps_rejects_cycles() {
        let mut a = bare("a");
        let mut b = bare("b");
        a.depends_on = vec![b.id];
        b.depends_on = vec![a.id];

        assert!(matches!(order_steps(vec![a, b]), Err(PlanError::Cycle { .. })));
    }

    #[test]
    fn order_steps_rejects_unknown_dependency() {
        let mut a = bare("a");
        a.depends_on = vec![StepId::new()];

        let err = order_steps(vec![a]).unwrap_err();
        assert!(matches!(err, PlanError::UnknownDependency { step, .. } if step == "a"));
    }
}
