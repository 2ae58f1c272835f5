//! Per-environment execution lease
//!
//! At most one execution task may work on an environment at a time. The
//! lease is an RAII guard owned by the task: dropping it (normally when the
//! task exits, including by panic or runtime shutdown) frees the
//! environment and wakes anyone waiting for the release.

use crate::error::{RollbackError, RollbackResult};
use crate::types::{Environment, ExecutionId, RollbackPointId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Notify;

/// Execution holding an environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseHolder {
    /// Execution
    pub execution_id: ExecutionId,
    /// Point its plan restores; pinned against retention
    pub point_id: RollbackPointId,
}

/// Lease table
#[derive(Debug, Default)]
pub struct EnvironmentLeases {
    held: DashMap<Environment, LeaseHolder>,
    released: Notify,
}

impl EnvironmentLeases {
    /// Create an empty table
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease of `environment`, or fail with [`RollbackError::Conflict`]
    pub fn try_acquire(
        self: &Arc<Self>,
        environment: Environment,
        holder: LeaseHolder,
    ) -> RollbackResult<EnvironmentLease> {
        match self.held.entry(environment) {
            Entry::Occupied(slot) => Err(RollbackError::Conflict {
                environment,
                active_execution: slot.get().execution_id,
            }),
            Entry::Vacant(slot) => {
                slot.insert(holder);
                Ok(EnvironmentLease {
                    leases: Arc::clone(self),
                    environment,
                    holder,
                })
            }
        }
    }

    /// Current holder of an environment
    #[must_use]
    pub fn holder(&self, environment: Environment) -> Option<LeaseHolder> {
        self.held.get(&environment).map(|h| *h)
    }

    /// Whether `execution_id` still holds a lease
    #[must_use]
    pub fn is_held_by(&self, execution_id: ExecutionId) -> bool {
        self.held.iter().any(|h| h.execution_id == execution_id)
    }

    /// Points referenced by any held lease
    #[must_use]
    pub fn pinned_points(&self) -> HashSet<RollbackPointId> {
        self.held.iter().map(|h| h.point_id).collect()
    }

    /// Points referenced by every lease other than `execution_id`'s
    #[must_use]
    pub fn pinned_points_except(&self, execution_id: ExecutionId) -> HashSet<RollbackPointId> {
        self.held
            .iter()
            .filter(|h| h.execution_id != execution_id)
            .map(|h| h.point_id)
            .collect()
    }

    /// Resolve once `execution_id` no longer holds a lease
    pub async fn wait_released(&self, execution_id: ExecutionId) {
        loop {
            let released = self.released.notified();
            if !self.is_held_by(execution_id) {
                return;
            }
            released.await;
        }
    }

    fn release(&self, environment: Environment, holder: LeaseHolder) {
        self.held
            .remove_if(&environment, |_, current| *current == holder);
        self.released.notify_waiters();
    }
}

/// Held lease; released on drop
#[derive(Debug)]
pub struct EnvironmentLease {
    leases: Arc<EnvironmentLeases>,
    environment: Environment,
    holder: LeaseHolder,
}

impl EnvironmentLease {
    /// Leased environment
    #[inline]
    #[must_use]
    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Holder recorded for this lease
    #[inline]
    #[must_use]
    pub fn holder(&self) -> LeaseHolder {
        self.holder
    }
}

impl Drop for EnvironmentLease {
    fn drop(&mut self) {
        self.leases.release(self.environment, self.holder);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn holder() -> LeaseHolder {
        LeaseHolder {
            execution_id: ExecutionId::new(),
            point_id: RollbackPointId::new(),
        }
    }

    #[test]
    fn second_acquire_conflicts() {
        let leases = Arc::new(EnvironmentLeases::new());
        let first = holder();
        let _lease = leases.try_acquire(Environment::Staging, first).unwrap();

        let err = leases
            .try_acquire(Environment::Staging, holder())
            .unwrap_err();
        assert!(matches!(
            err,
            RollbackError::Conflict { active_execution, .. } if active_execution == first.execution_id
        ));
    }

    #[test]
    fn environments_are_independent() {
        let leases = Arc::new(EnvironmentLeases::new());
        let _a = leases.try_acquire(Environment::Staging, holder()).unwrap();
        assert!(leases.try_acquire(Environment::Production, holder()).is_ok());
    }

    #[test]
    fn drop_releases_and_unpins() {
        let leases = Arc::new(EnvironmentLeases::new());
        let h = holder();
        let lease = leases.try_acquire(Environment::Staging, h).unwrap();
        assert!(leases.pinned_points().contains(&h.point_id));
        assert!(leases.pinned_points_except(h.execution_id).is_empty());

        drop(lease);
        assert!(leases.holder(Environment::Staging).is_none());
        assert!(leases.pinned_points().is_empty());
        assert!(leases.try_acquire(Environment::Staging, holder()).is_ok());
    }

    #[tokio::test]
    async fn waiters_wake_on_release() {
        let leases = Arc::new(EnvironmentLeases::new());
        let h = holder();
        let lease = leases.try_acquire(Environment::Staging, h).unwrap();

        let waiter = {
            let leases = Arc::clone(&leases);
            tokio::spawn(async move { leases.wait_released(h.execution_id).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(lease);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
