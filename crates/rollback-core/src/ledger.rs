//! Execution ledger
//!
//! Registry of executions keyed by id with secondary indices by plan,
//! environment and status. Every write goes through [`ExecutionLedger::update`],
//! which serializes writers per execution, validates status transitions and
//! notifies subscribers.
//!
//! Reads return copies so long-running executions never block queries.

use crate::error::{Entity, RollbackError, RollbackResult};
use crate::repository::{ExecutionRepository, InMemoryExecutionRepository};
use crate::state_machine::validate_transition;
use crate::types::{Environment, Execution, ExecutionId, ExecutionStatus, PlanId};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;

/// Execution counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    /// All executions
    pub total: usize,
    /// Pending
    pub pending: usize,
    /// In progress
    pub in_progress: usize,
    /// Completed
    pub completed: usize,
    /// Failed
    pub failed: usize,
    /// Cancelled
    pub cancelled: usize,
}

impl LedgerStats {
    /// Pending or in progress
    #[inline]
    #[must_use]
    pub fn active(&self) -> usize {
        self.pending + self.in_progress
    }
}

/// Registry of executions
#[derive(Debug)]
pub struct ExecutionLedger {
    repo: Arc<dyn ExecutionRepository>,
    by_plan: DashMap<PlanId, Vec<ExecutionId>>,
    by_environment: DashMap<Environment, Vec<ExecutionId>>,
    by_status: DashMap<ExecutionStatus, HashSet<ExecutionId>>,
    locks: DashMap<ExecutionId, Arc<Mutex<()>>>,
    watchers: DashMap<ExecutionId, watch::Sender<Execution>>,
}

impl ExecutionLedger {
    /// Ledger over `repo`; indices are rebuilt from its contents
    pub fn new(repo: Arc<dyn ExecutionRepository>) -> RollbackResult<Self> {
        let ledger = Self {
            repo,
            by_plan: DashMap::new(),
            by_environment: DashMap::new(),
            by_status: DashMap::new(),
            locks: DashMap::new(),
            watchers: DashMap::new(),
        };
        for execution in ledger.repo.list()? {
            ledger.index(&execution);
        }
        Ok(ledger)
    }

    /// Ledger over a fresh in-memory repository
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            repo: Arc::new(InMemoryExecutionRepository::new()),
            by_plan: DashMap::new(),
            by_environment: DashMap::new(),
            by_status: DashMap::new(),
            locks: DashMap::new(),
            watchers: DashMap::new(),
        }
    }

    /// Register a new execution
    pub fn record(&self, execution: Execution) -> RollbackResult<()> {
        self.repo.insert(execution.clone())?;
        self.index(&execution);
        let (tx, _rx) = watch::channel(execution.clone());
        self.watchers.insert(execution.id, tx);
        tracing::debug!(execution_id = %execution.id, status = %execution.status, "execution recorded");
        Ok(())
    }

    /// Mutate one execution under its write lock
    ///
    /// The closure works on a copy; nothing is written if it fails or if
    /// the status change it makes is not an allowed transition.
    pub fn update<R>(
        &self,
        id: ExecutionId,
        mutate: impl FnOnce(&mut Execution) -> RollbackResult<R>,
    ) -> RollbackResult<R> {
        let lock = self.write_lock(id);
        let out = {
            let _guard = lock.lock();
            self.commit(id, mutate)
        };
        drop(lock);
        if self.is_settled(id) {
            self.prune(id);
        }
        out
    }

    fn commit<R>(
        &self,
        id: ExecutionId,
        mutate: impl FnOnce(&mut Execution) -> RollbackResult<R>,
    ) -> RollbackResult<R> {
        let current = self
            .repo
            .get(&id)?
            .ok_or_else(|| RollbackError::not_found(Entity::Execution, id))?;
        let mut next = current.clone();
        let out = mutate(&mut next)?;

        if next.status != current.status {
            validate_transition(current.status, next.status)?;
        }
        self.repo.replace(next.clone())?;
        if next.status != current.status {
            self.move_status(id, current.status, next.status);
        }
        if let Some(tx) = self.watchers.get(&id) {
            tx.send_replace(next);
        }
        Ok(out)
    }

    /// Fetch a copy of an execution
    pub fn get(&self, id: ExecutionId) -> RollbackResult<Execution> {
        self.repo
            .get(&id)?
            .ok_or_else(|| RollbackError::not_found(Entity::Execution, id))
    }

    /// Whether the execution is known and terminal
    #[must_use]
    pub fn is_terminal(&self, id: ExecutionId) -> bool {
        matches!(self.repo.get(&id), Ok(Some(e)) if e.is_terminal())
    }

    /// Executions filtered by environment and status, oldest first
    pub fn list(
        &self,
        environment: Option<Environment>,
        status: Option<ExecutionStatus>,
    ) -> RollbackResult<Vec<Execution>> {
        let mut ids: Option<HashSet<ExecutionId>> = None;
        if let Some(env) = environment {
            let by_env: HashSet<_> = self
                .by_environment
                .get(&env)
                .map(|v| v.iter().copied().collect())
                .unwrap_or_default();
            ids = Some(by_env);
        }
        if let Some(status) = status {
            let by_status = self
                .by_status
                .get(&status)
                .map(|s| s.clone())
                .unwrap_or_default();
            ids = Some(match ids {
                Some(ids) => ids.intersection(&by_status).copied().collect(),
                None => by_status,
            });
        }

        let Some(ids) = ids else {
            return Ok(self.repo.list()?);
        };
        self.fetch_sorted(ids)
    }

    /// Executions of one plan, oldest first
    pub fn by_plan(&self, plan_id: PlanId) -> RollbackResult<Vec<Execution>> {
        let ids: HashSet<_> = self
            .by_plan
            .get(&plan_id)
            .map(|v| v.iter().copied().collect())
            .unwrap_or_default();
        self.fetch_sorted(ids)
    }

    /// Receive every committed state of an execution
    ///
    /// A terminal execution yields a receiver already holding its final
    /// state; its sender is gone, so `changed` reports a closed channel.
    pub fn subscribe(&self, id: ExecutionId) -> RollbackResult<watch::Receiver<Execution>> {
        if let Some(tx) = self.watchers.get(&id) {
            return Ok(tx.subscribe());
        }

        let lock = self.write_lock(id);
        let rx = {
            let _guard = lock.lock();
            self.subscribe_locked(id)
        };
        drop(lock);
        if self.is_settled(id) {
            self.prune(id);
        }
        rx
    }

    fn subscribe_locked(&self, id: ExecutionId) -> RollbackResult<watch::Receiver<Execution>> {
        if let Some(tx) = self.watchers.get(&id) {
            return Ok(tx.subscribe());
        }
        let current = self.get(id)?;
        if current.is_terminal() {
            return Ok(watch::channel(current).1);
        }
        // Executions loaded from the repository have no channel yet.
        let tx = self
            .watchers
            .entry(id)
            .or_insert_with(|| watch::channel(current).0);
        Ok(tx.subscribe())
    }

    /// Counts per status
    #[must_use]
    pub fn stats(&self) -> LedgerStats {
        let count = |status: ExecutionStatus| self.by_status.get(&status).map_or(0, |s| s.len());
        let stats = LedgerStats {
            total: 0,
            pending: count(ExecutionStatus::Pending),
            in_progress: count(ExecutionStatus::InProgress),
            completed: count(ExecutionStatus::Completed),
            failed: count(ExecutionStatus::Failed),
            cancelled: count(ExecutionStatus::Cancelled),
        };
        LedgerStats {
            total: stats.active() + stats.completed + stats.failed + stats.cancelled,
            ..stats
        }
    }

    fn write_lock(&self, id: ExecutionId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Terminal, or unknown to the repository
    fn is_settled(&self, id: ExecutionId) -> bool {
        !matches!(self.repo.get(&id), Ok(Some(e)) if !e.is_terminal())
    }

    /// Forget the write lock and channel of a settled execution
    ///
    /// A lock still cloned by a waiting writer stays until that writer is
    /// done with it.
    fn prune(&self, id: ExecutionId) {
        self.watchers.remove(&id);
        self.locks
            .remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn index(&self, execution: &Execution) {
        self.by_plan
            .entry(execution.plan_id)
            .or_default()
            .push(execution.id);
        self.by_environment
            .entry(execution.environment)
            .or_default()
            .push(execution.id);
        self.by_status
            .entry(execution.status)
            .or_default()
            .insert(execution.id);
    }

    fn move_status(&self, id: ExecutionId, from: ExecutionStatus, to: ExecutionStatus) {
        if let Some(mut set) = self.by_status.get_mut(&from) {
            set.remove(&id);
        }
        self.by_status.entry(to).or_default().insert(id);
    }

    fn fetch_sorted(&self, ids: HashSet<ExecutionId>) -> RollbackResult<Vec<Execution>> {
        let mut executions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(execution) = self.repo.get(&id)? {
                executions.push(execution);
            }
        }
        executions.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        Ok(executions)
    }
}
