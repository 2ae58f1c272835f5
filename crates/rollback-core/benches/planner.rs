use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rollback_core::planner::{order_steps, PlanBuilder};
use rollback_core::risk::RiskAssessor;
use rollback_core::{
    ChangeKind, Environment, PointStatus, RollbackConfig, RollbackPoint, RollbackPointId,
    RollbackStep, SnapshotRef, StepId, StepKind,
};

fn point(kind: ChangeKind) -> RollbackPoint {
    RollbackPoint {
        id: RollbackPointId::new(),
        created_at: Utc::now(),
        kind,
        description: "bench".into(),
        version: "1.0.0".into(),
        environment: Environment::Production,
        status: PointStatus::Active,
        created_by: "bench".into(),
        risks: RiskAssessor::new().assess(kind, Environment::Production),
        dependencies: Vec::new(),
        snapshot: SnapshotRef {
            digest: "00".repeat(32),
            captured_at: Utc::now(),
            components: Vec::new(),
        },
    }
}

/// Each step depends on the two before it
fn chain(len: usize) -> Vec<RollbackStep> {
    let mut steps: Vec<RollbackStep> = Vec::with_capacity(len);
    for i in 0..len {
        let depends_on = steps.iter().rev().take(2).map(|s| s.id).collect();
        steps.push(RollbackStep {
            id: StepId::new(),
            order: 0,
            kind: StepKind::Config,
            action: format!("step-{i}"),
            description: String::new(),
            automated: true,
            timeout_secs: 60,
            max_retries: 0,
            depends_on,
            critical: false,
        });
    }
    steps.reverse();
    steps
}

fn bench_build_plan(c: &mut Criterion) {
    let builder = PlanBuilder::new(&RollbackConfig::default());
    let mut group = c.benchmark_group("build_plan");
    for kind in ChangeKind::ALL {
        let p = point(*kind);
        group.bench_with_input(BenchmarkId::from_parameter(kind), &p, |b, p| {
            b.iter(|| builder.build(black_box(p)));
        });
    }
    group.finish();
}

fn bench_order_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("order_steps");
    for len in [10usize, 100, 1000] {
        let steps = chain(len);
        group.bench_with_input(BenchmarkId::from_parameter(len), &steps, |b, steps| {
            b.iter(|| order_steps(black_box(steps.clone())));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_build_plan, bench_order_steps);
criterion_main!(benches);
