//! Audit trail
//!
//! Lifecycle events of points, plans and executions. Recording is
//! synchronous, infallible and never influences control flow.
//!
//! Sinks:
//! - [`TracingAuditLogger`] emits each event on the `rollback::audit` target
//! - [`AuditTrail`] keeps a SHA-256 hash-chained in-memory log
//! - [`FanoutAuditLogger`] forwards to several sinks

use crate::clock::{Clock, SystemClock};
use crate::error::AuditError;
use crate::retention::RetirementReason;
use crate::types::{
    ChangeKind, Environment, ExecutionId, ExecutionStatus, PlanId, RollbackPointId, StepId,
    StepStatus,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Debug;
use std::sync::Arc;

/// A lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A point was registered
    PointCreated {
        /// Point
        point_id: RollbackPointId,
        /// Environment
        environment: Environment,
        /// Change kind
        kind: ChangeKind,
        /// Actor
        created_by: String,
    },
    /// A point was dropped by retention
    PointRetired {
        /// Point
        point_id: RollbackPointId,
        /// Environment
        environment: Environment,
        /// Bound that dropped it
        reason: RetirementReason,
    },
    /// A plan was built
    PlanCreated {
        /// Plan
        plan_id: PlanId,
        /// Source point
        point_id: RollbackPointId,
        /// Approval flag
        approval_required: bool,
        /// Number of rollback steps
        steps: usize,
    },
    /// Execution refused for lack of an approver
    ApprovalDenied {
        /// Plan
        plan_id: PlanId,
        /// Actor that asked
        executed_by: String,
    },
    /// Execution accepted and dispatched
    ExecutionStarted {
        /// Execution
        execution_id: ExecutionId,
        /// Plan
        plan_id: PlanId,
        /// Environment
        environment: Environment,
        /// Actor
        executed_by: String,
        /// Approver
        approved_by: Option<String>,
    },
    /// A step or validation check reached its final outcome
    StepFinished {
        /// Execution
        execution_id: ExecutionId,
        /// Step
        step_id: StepId,
        /// Action or check name
        action: String,
        /// Outcome
        status: StepStatus,
        /// Retries performed
        retry_count: u32,
    },
    /// Execution reached completed or failed
    ExecutionFinished {
        /// Execution
        execution_id: ExecutionId,
        /// Terminal status
        status: ExecutionStatus,
        /// Errors recorded
        errors: usize,
    },
    /// Execution cancelled by an operator
    ExecutionCancelled {
        /// Execution
        execution_id: ExecutionId,
    },
}

impl AuditEvent {
    /// Stable event name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::PointCreated { .. } => "point_created",
            Self::PointRetired { .. } => "point_retired",
            Self::PlanCreated { .. } => "plan_created",
            Self::ApprovalDenied { .. } => "approval_denied",
            Self::ExecutionStarted { .. } => "execution_started",
            Self::StepFinished { .. } => "step_finished",
            Self::ExecutionFinished { .. } => "execution_finished",
            Self::ExecutionCancelled { .. } => "execution_cancelled",
        }
    }
}

/// Sink for audit events
pub trait AuditLogger: Send + Sync + Debug {
    /// Record an event; must not block
    fn record(&self, event: AuditEvent);
}

/// Emits events through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLogger;

impl AuditLogger for TracingAuditLogger {
    fn record(&self, event: AuditEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        tracing::info!(target: "rollback::audit", event = event.name(), %payload);
    }
}

/// Forwards every event to each sink in order
#[derive(Debug, Default)]
pub struct FanoutAuditLogger {
    sinks: Vec<Arc<dyn AuditLogger>>,
}

impl FanoutAuditLogger {
    /// Create an empty fanout
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn AuditLogger>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl AuditLogger for FanoutAuditLogger {
    fn record(&self, event: AuditEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record(event.clone());
            }
            last.record(event);
        }
    }
}

/// One chained record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Position in the trail, from 0
    pub sequence: u64,
    /// Recording time
    pub timestamp: DateTime<Utc>,
    /// Event
    pub event: AuditEvent,
    /// Hash of the previous record (zeros for the first)
    pub prev_hash: [u8; 32],
    /// Hash of this record
    pub hash: [u8; 32],
}

/// Hash-chained in-memory audit log
#[derive(Debug)]
pub struct AuditTrail {
    inner: Mutex<Vec<AuditRecord>>,
    clock: Arc<dyn Clock>,
}

impl AuditTrail {
    /// Create an empty trail stamped by the wall clock
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty trail stamped by `clock`
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
            clock,
        }
    }

    /// Copy of every record
    pub fn records(&self) -> Vec<AuditRecord> {
        self.inner.lock().clone()
    }

    /// Events only, in order
    pub fn events(&self) -> Vec<AuditEvent> {
        self.inner.lock().iter().map(|r| r.event.clone()).collect()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// No records yet
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Hash of the last record, hex encoded
    pub fn head(&self) -> Option<String> {
        self.inner.lock().last().map(|r| hex::encode(r.hash))
    }

    /// Walk the chain and recompute every hash
    pub fn verify_integrity(&self) -> Result<(), AuditError> {
        let guard = self.inner.lock();
        let mut prev = [0u8; 32];
        for record in guard.iter() {
            if record.prev_hash != prev || record.hash != compute_hash(record) {
                return Err(AuditError::ChainBroken {
                    sequence: record.sequence,
                });
            }
            prev = record.hash;
        }
        Ok(())
    }
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLogger for AuditTrail {
    fn record(&self, event: AuditEvent) {
        let timestamp = self.clock.now();
        let mut guard = self.inner.lock();
        let prev_hash = guard.last().map_or([0u8; 32], |r| r.hash);
        let mut record = AuditRecord {
            sequence: guard.len() as u64,
            timestamp,
            event,
            prev_hash,
            hash: [0u8; 32],
        };
        record.hash = compute_hash(&record);
        guard.push(record);
    }
}

fn compute_hash(record: &AuditRecord) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(record.sequence.to_le_bytes());
    hasher.update(record.timestamp.to_rfc3339().as_bytes());
    hasher.update([0]);
    hasher.update(serde_json::to_vec(&record.event).unwrap_or_default());
    hasher.update([0]);
    hasher.update(record.prev_hash);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancelled() -> AuditEvent {
        AuditEvent::ExecutionCancelled {
            execution_id: ExecutionId::new(),
        }
    }

    #[test]
    fn trail_chains_records() {
        let trail = AuditTrail::new();
        trail.record(cancelled());
        trail.record(cancelled());

        let records = trail.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].prev_hash, [0u8; 32]);
        assert_eq!(records[1].prev_hash, records[0].hash);
        assert_eq!(records[1].sequence, 1);
        assert!(trail.verify_integrity().is_ok());
    }

    #[test]
    fn tampering_breaks_the_chain() {
        let trail = AuditTrail::new();
        trail.record(cancelled());
        trail.record(cancelled());
        trail.record(cancelled());

        trail.inner.lock()[1].event = cancelled();

        assert_eq!(
            trail.verify_integrity(),
            Err(AuditError::ChainBroken { sequence: 1 })
        );
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(AuditTrail::new());
        let b = Arc::new(AuditTrail::new());
        let fanout = FanoutAuditLogger::new()
            .with_sink(a.clone())
            .with_sink(b.clone())
            .with_sink(Arc::new(TracingAuditLogger));

        fanout.record(cancelled());

        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn event_serializes_with_tag() {
        let json = serde_json::to_value(cancelled()).unwrap();
        assert_eq!(json["event"], "execution_cancelled");
        assert_eq!(cancelled().name(), "execution_cancelled");
    }
}
