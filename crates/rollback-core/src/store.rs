//! Rollback point store
//!
//! Registers immutable points and enforces per-environment retention.
//! Creation, sweeps and pinning of the same environment are serialized by
//! an environment lock; snapshot capture happens before the lock is taken
//! so a slow backend never blocks sweeps. The set of pinned points is read
//! only while the lock is held.

use crate::audit::{AuditEvent, AuditLogger};
use crate::clock::Clock;
use crate::collaborators::{SnapshotBundle, SnapshotCapture};
use crate::error::{Entity, RollbackError, RollbackResult, SnapshotError};
use crate::repository::PointRepository;
use crate::retention::{RetentionPolicy, RetentionReport, RetirementReason};
use crate::risk::RiskAssessor;
use crate::types::{
    ChangeKind, Environment, PointStatus, RollbackPoint, RollbackPointId, SnapshotRef,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Request to register a rollback point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRollbackPoint {
    /// Change kind
    pub kind: ChangeKind,
    /// Description of the change
    pub description: String,
    /// Version the point restores to
    pub version: String,
    /// Environment
    pub environment: Environment,
    /// Actor
    pub created_by: String,
    /// Existing points this one depends on
    pub dependencies: Vec<RollbackPointId>,
}

impl NewRollbackPoint {
    /// Create a request without dependencies
    #[must_use]
    pub fn new(
        kind: ChangeKind,
        description: impl Into<String>,
        version: impl Into<String>,
        environment: Environment,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            description: description.into(),
            version: version.into(),
            environment,
            created_by: created_by.into(),
            dependencies: Vec::new(),
        }
    }

    /// With dependencies
    #[inline]
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<RollbackPointId>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

/// Store of rollback points
#[derive(Debug)]
pub struct RollbackPointStore {
    policy: RetentionPolicy,
    repo: Arc<dyn PointRepository>,
    capture: Arc<dyn SnapshotCapture>,
    assessor: Arc<RiskAssessor>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditLogger>,
    env_locks: DashMap<Environment, Arc<Mutex<()>>>,
}

impl RollbackPointStore {
    /// Create a store
    #[must_use]
    pub fn new(
        policy: RetentionPolicy,
        repo: Arc<dyn PointRepository>,
        capture: Arc<dyn SnapshotCapture>,
        assessor: Arc<RiskAssessor>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditLogger>,
    ) -> Self {
        Self {
            policy,
            repo,
            capture,
            assessor,
            clock,
            audit,
            env_locks: DashMap::new(),
        }
    }

    /// Retention policy in force
    #[inline]
    #[must_use]
    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Capture, assess and register a point, then sweep its environment
    ///
    /// `pinned` yields the points referenced by active executions; it is
    /// called once the environment is locked. Fails with
    /// [`RollbackError::StoreFull`] when they already fill every slot of the
    /// environment. Any failure leaves no point behind.
    pub async fn create(
        &self,
        request: NewRollbackPoint,
        pinned: impl FnOnce() -> HashSet<RollbackPointId>,
    ) -> RollbackResult<RollbackPoint> {
        for dependency in &request.dependencies {
            if self.repo.get(dependency)?.is_none() {
                return Err(RollbackError::not_found(Entity::RollbackPoint, dependency));
            }
        }

        let bundle = self.capture(request.kind, request.environment).await?;
        let created_at = self.clock.now();
        let point = RollbackPoint {
            id: RollbackPointId::new(),
            created_at,
            kind: request.kind,
            description: request.description,
            version: request.version,
            environment: request.environment,
            status: PointStatus::Active,
            created_by: request.created_by,
            risks: self.assessor.assess(request.kind, request.environment),
            dependencies: request.dependencies,
            snapshot: SnapshotRef {
                digest: bundle.digest(),
                captured_at: bundle.captured_at.unwrap_or(created_at),
                components: bundle.components(),
            },
        };

        let lock = self.env_lock(point.environment);
        let _guard = lock.lock();
        let pinned = pinned();

        let pinned_here = self
            .repo
            .list(Some(point.environment))?
            .iter()
            .filter(|p| p.is_active() && pinned.contains(&p.id))
            .count();
        if pinned_here >= self.policy.max_points() {
            return Err(RollbackError::StoreFull {
                environment: point.environment,
                capacity: self.policy.max_points(),
            });
        }

        self.repo.insert(point.clone())?;
        info!(
            point_id = %point.id,
            kind = %point.kind,
            environment = %point.environment,
            risks = point.risks.len(),
            "rollback point created"
        );
        self.audit.record(AuditEvent::PointCreated {
            point_id: point.id,
            environment: point.environment,
            kind: point.kind,
            created_by: point.created_by.clone(),
        });

        self.sweep_locked(point.environment, &pinned)?;
        Ok(point)
    }

    /// Fetch a point
    pub fn get(&self, id: RollbackPointId) -> RollbackResult<RollbackPoint> {
        self.repo
            .get(&id)?
            .ok_or_else(|| RollbackError::not_found(Entity::RollbackPoint, id))
    }

    /// Points, oldest first, optionally filtered by environment
    pub fn list(&self, environment: Option<Environment>) -> RollbackResult<Vec<RollbackPoint>> {
        Ok(self.repo.list(environment)?)
    }

    /// Apply retention to one environment
    ///
    /// `pinned` is called under the environment lock.
    pub fn sweep(
        &self,
        environment: Environment,
        pinned: impl FnOnce() -> HashSet<RollbackPointId>,
    ) -> RollbackResult<RetentionReport> {
        let lock = self.env_lock(environment);
        let _guard = lock.lock();
        self.sweep_locked(environment, &pinned())
    }

    /// Run `pin` against a point while its environment is locked
    ///
    /// Fails with [`RollbackError::InvalidState`] for `operation` unless the
    /// point is still active once the lock is held. No
    /// sweep of the environment runs until `pin` returns, so a lease taken
    /// inside it is seen by every later sweep.
    pub fn pin_active<T>(
        &self,
        id: RollbackPointId,
        operation: &'static str,
        pin: impl FnOnce(&RollbackPoint) -> RollbackResult<T>,
    ) -> RollbackResult<T> {
        let environment = self.get(id)?.environment;
        let lock = self.env_lock(environment);
        let _guard = lock.lock();

        let point = self.get(id)?;
        if !point.is_active() {
            return Err(RollbackError::invalid_state(
                Entity::RollbackPoint,
                point.id,
                point.status,
                operation,
            ));
        }
        pin(&point)
    }

    fn sweep_locked(
        &self,
        environment: Environment,
        pinned: &HashSet<RollbackPointId>,
    ) -> RollbackResult<RetentionReport> {
        let points = self.repo.list(Some(environment))?;
        let report = self.policy.evaluate(&points, self.clock.now(), pinned);

        for id in &report.expired {
            self.retire(*id, environment, RetirementReason::Expired)?;
        }
        for id in &report.archived {
            self.retire(*id, environment, RetirementReason::Archived)?;
        }
        if !report.is_empty() {
            info!(
                %environment,
                expired = report.expired.len(),
                archived = report.archived.len(),
                "retention sweep dropped points"
            );
        }
        Ok(report)
    }

    fn retire(
        &self,
        id: RollbackPointId,
        environment: Environment,
        reason: RetirementReason,
    ) -> RollbackResult<()> {
        let status = match reason {
            RetirementReason::Expired => PointStatus::Expired,
            RetirementReason::Archived => PointStatus::Archived,
        };
        self.repo.set_status(&id, status)?;
        self.repo.remove(&id)?;
        debug!(point_id = %id, %status, "rollback point retired");
        self.audit.record(AuditEvent::PointRetired {
            point_id: id,
            environment,
            reason,
        });
        Ok(())
    }

    async fn capture(
        &self,
        kind: ChangeKind,
        environment: Environment,
    ) -> Result<SnapshotBundle, SnapshotError> {
        let capture = &self.capture;
        let mut bundle = SnapshotBundle {
            captured_at: Some(self.clock.now()),
            ..SnapshotBundle::default()
        };
        match kind {
            ChangeKind::Deployment => {
                bundle.files = Some(capture.capture_files().await?);
            }
            ChangeKind::Config => {
                bundle.config = Some(capture.capture_config(environment).await?);
            }
            ChangeKind::Database => {
                bundle.database = Some(capture.capture_database().await?);
            }
            ChangeKind::Feature => {
                bundle.feature_flags = Some(capture.capture_feature_flags().await?);
            }
            ChangeKind::System => {
                bundle.files = Some(capture.capture_files().await?);
                bundle.database = Some(capture.capture_database().await?);
                bundle.config = Some(capture.capture_config(environment).await?);
                bundle.feature_flags = Some(capture.capture_feature_flags().await?);
            }
        }
        bundle.environment = Some(capture.capture_environment().await?);
        Ok(bundle)
    }

    fn env_lock(&self, environment: Environment) -> Arc<Mutex<()>> {
        self.env_locks
            .entry(environment)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
