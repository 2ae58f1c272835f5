//! Persistence seams
//!
//! Points, plans and executions are stored behind these traits so the
//! system of record can be swapped for a durable backend. Ids are opaque
//! handles; implementations must never rely on pointer identity.
//!
//! The in-memory implementations are backed by `DashMap` and are what the
//! binary and the tests use.

use crate::error::RepositoryError;
use crate::types::{
    Environment, Execution, ExecutionId, PlanId, PointStatus, RollbackPlan, RollbackPoint,
    RollbackPointId,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt::Debug;

/// Storage for rollback points
pub trait PointRepository: Send + Sync + Debug {
    /// Insert a new point
    fn insert(&self, point: RollbackPoint) -> Result<(), RepositoryError>;

    /// Fetch a point
    fn get(&self, id: &RollbackPointId) -> Result<Option<RollbackPoint>, RepositoryError>;

    /// Change the status of a point; returns `false` if unknown
    fn set_status(&self, id: &RollbackPointId, status: PointStatus)
        -> Result<bool, RepositoryError>;

    /// Remove a point
    fn remove(&self, id: &RollbackPointId) -> Result<Option<RollbackPoint>, RepositoryError>;

    /// Points, oldest first, optionally filtered by environment
    fn list(&self, environment: Option<Environment>) -> Result<Vec<RollbackPoint>, RepositoryError>;
}

/// Storage for rollback plans
pub trait PlanRepository: Send + Sync + Debug {
    /// Insert a new plan
    fn insert(&self, plan: RollbackPlan) -> Result<(), RepositoryError>;

    /// Fetch a plan
    fn get(&self, id: &PlanId) -> Result<Option<RollbackPlan>, RepositoryError>;

    /// Plans derived from a point
    fn for_point(&self, point_id: &RollbackPointId) -> Result<Vec<RollbackPlan>, RepositoryError>;
}

/// Storage for execution records
pub trait ExecutionRepository: Send + Sync + Debug {
    /// Insert a new execution
    fn insert(&self, execution: Execution) -> Result<(), RepositoryError>;

    /// Replace an existing execution
    fn replace(&self, execution: Execution) -> Result<(), RepositoryError>;

    /// Fetch an execution
    fn get(&self, id: &ExecutionId) -> Result<Option<Execution>, RepositoryError>;

    /// Every execution, oldest first
    fn list(&self) -> Result<Vec<Execution>, RepositoryError>;
}

/// In-memory point repository
#[derive(Debug, Default)]
pub struct InMemoryPointRepository {
    points: DashMap<RollbackPointId, RollbackPoint>,
}

impl InMemoryPointRepository {
    /// Create an empty repository
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PointRepository for InMemoryPointRepository {
    fn insert(&self, point: RollbackPoint) -> Result<(), RepositoryError> {
        match self.points.entry(point.id) {
            Entry::Occupied(_) => Err(RepositoryError::Duplicate(point.id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(point);
                Ok(())
            }
        }
    }

    fn get(&self, id: &RollbackPointId) -> Result<Option<RollbackPoint>, RepositoryError> {
        Ok(self.points.get(id).map(|p| p.value().clone()))
    }

    fn set_status(
        &self,
        id: &RollbackPointId,
        status: PointStatus,
    ) -> Result<bool, RepositoryError> {
        Ok(self
            .points
            .get_mut(id)
            .map(|mut p| p.status = status)
            .is_some())
    }

    fn remove(&self, id: &RollbackPointId) -> Result<Option<RollbackPoint>, RepositoryError> {
        Ok(self.points.remove(id).map(|(_, p)| p))
    }

    fn list(&self, environment: Option<Environment>) -> Result<Vec<RollbackPoint>, RepositoryError> {
        let mut points: Vec<RollbackPoint> = self
            .points
            .iter()
            .filter(|p| environment.map_or(true, |env| p.environment == env))
            .map(|p| p.value().clone())
            .collect();
        points.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(points)
    }
}

/// In-memory plan repository
#[derive(Debug, Default)]
pub struct InMemoryPlanRepository {
    plans: DashMap<PlanId, RollbackPlan>,
}

impl InMemoryPlanRepository {
    /// Create an empty repository
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PlanRepository for InMemoryPlanRepository {
    fn insert(&self, plan: RollbackPlan) -> Result<(), RepositoryError> {
        match self.plans.entry(plan.id) {
            Entry::Occupied(_) => Err(RepositoryError::Duplicate(plan.id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(plan);
                Ok(())
            }
        }
    }

    fn get(&self, id: &PlanId) -> Result<Option<RollbackPlan>, RepositoryError> {
        Ok(self.plans.get(id).map(|p| p.value().clone()))
    }

    fn for_point(&self, point_id: &RollbackPointId) -> Result<Vec<RollbackPlan>, RepositoryError> {
        let mut plans: Vec<RollbackPlan> = self
            .plans
            .iter()
            .filter(|p| p.point_id == *point_id)
            .map(|p| p.value().clone())
            .collect();
        plans.sort_by_key(|p| p.created_at);
        Ok(plans)
    }
}

/// In-memory execution repository
#[derive(Debug, Default)]
pub struct InMemoryExecutionRepository {
    executions: DashMap<ExecutionId, Execution>,
}

impl InMemoryExecutionRepository {
    /// Create an empty repository
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionRepository for InMemoryExecutionRepository {
    fn insert(&self, execution: Execution) -> Result<(), RepositoryError> {
        match self.executions.entry(execution.id) {
            Entry::Occupied(_) => Err(RepositoryError::Duplicate(execution.id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(execution);
                Ok(())
            }
        }
    }

    fn replace(&self, execution: Execution) -> Result<(), RepositoryError> {
        match self.executions.get_mut(&execution.id) {
            Some(mut slot) => {
                *slot = execution;
                Ok(())
            }
            None => Err(RepositoryError::Missing(execution.id.to_string())),
        }
    }

    fn get(&self, id: &ExecutionId) -> Result<Option<Execution>, RepositoryError> {
        Ok(self.executions.get(id).map(|e| e.value().clone()))
    }

    fn list(&self) -> Result<Vec<Execution>, RepositoryError> {
        let mut executions: Vec<Execution> =
            self.executions.iter().map(|e| e.value().clone()).collect();
        executions.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        Ok(executions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeKind, SnapshotRef};
    use chrono::Utc;

    fn point(environment: Environment) -> RollbackPoint {
        RollbackPoint {
            id: RollbackPointId::new(),
            created_at: Utc::now(),
            kind: ChangeKind::Feature,
            description: "flags".to_string(),
            version: "2".to_string(),
            environment,
            status: PointStatus::Active,
            created_by: "tester".to_string(),
            risks: Vec::new(),
            dependencies: Vec::new(),
            snapshot: SnapshotRef {
                digest: "00".to_string(),
                captured_at: Utc::now(),
                components: Vec::new(),
            },
        }
    }

    #[test]
    fn point_insert_rejects_duplicates() {
        let repo = InMemoryPointRepository::new();
        let p = point(Environment::Staging);
        repo.insert(p.clone()).unwrap();
        assert!(matches!(repo.insert(p), Err(RepositoryError::Duplicate(_))));
    }

    #[test]
    fn point_list_filters_by_environment() {
        let repo = InMemoryPointRepository::new();
        repo.insert(point(Environment::Staging)).unwrap();
        repo.insert(point(Environment::Production)).unwrap();
        repo.insert(point(Environment::Staging)).unwrap();

        assert_eq!(repo.list(None).unwrap().len(), 3);
        assert_eq!(repo.list(Some(Environment::Staging)).unwrap().len(), 2);
        assert!(repo.list(Some(Environment::Development)).unwrap().is_empty());
    }

    #[test]
    fn point_status_update_and_remove() {
        let repo = InMemoryPointRepository::new();
        let p = point(Environment::Staging);
        repo.insert(p.clone()).unwrap();

        assert!(repo.set_status(&p.id, PointStatus::Archived).unwrap());
        assert_eq!(repo.get(&p.id).unwrap().unwrap().status, PointStatus::Archived);
        assert!(repo.remove(&p.id).unwrap().is_some());
        assert!(!repo.set_status(&p.id, PointStatus::Active).unwrap());
    }
}
