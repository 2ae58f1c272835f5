//! Retention policy
//!
//! Pure decision over the active points of one environment. The store
//! applies the decision; this module never mutates anything.
//!
//! Rules, evaluated most-recent-first:
//! - pinned points (referenced by an active execution) are always kept and
//!   occupy a slot of the count bound
//! - unpinned points older than the age bound expire
//! - unpinned points beyond the remaining slots are archived

use crate::config::RollbackConfig;
use crate::types::{RollbackPoint, RollbackPointId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Why a point left the active set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetirementReason {
    /// Older than the age bound
    Expired,
    /// Beyond the count bound
    Archived,
}

/// Outcome of one retention pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionReport {
    /// Dropped for age
    pub expired: Vec<RollbackPointId>,
    /// Dropped for count
    pub archived: Vec<RollbackPointId>,
    /// Past the age bound but kept because an execution references them
    pub pinned_retained: Vec<RollbackPointId>,
}

impl RetentionReport {
    /// Nothing was dropped
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.archived.is_empty()
    }

    /// Total dropped
    #[inline]
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.expired.len() + self.archived.len()
    }
}

/// Count and age bounds per environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    max_points: usize,
    max_age: chrono::Duration,
}

impl RetentionPolicy {
    /// Create a policy
    #[inline]
    #[must_use]
    pub fn new(max_points: usize, max_age: chrono::Duration) -> Self {
        Self {
            max_points,
            max_age,
        }
    }

    /// Policy from configuration
    #[inline]
    #[must_use]
    pub fn from_config(config: &RollbackConfig) -> Self {
        Self::new(
            config.max_rollback_points,
            chrono::Duration::days(i64::from(config.retention_days)),
        )
    }

    /// Count bound
    #[inline]
    #[must_use]
    pub fn max_points(&self) -> usize {
        self.max_points
    }

    /// Age bound
    #[inline]
    #[must_use]
    pub fn max_age(&self) -> chrono::Duration {
        self.max_age
    }

    /// Whether a point is past the age bound
    #[inline]
    #[must_use]
    pub fn is_expired(&self, point: &RollbackPoint, now: DateTime<Utc>) -> bool {
        point.age(now) > self.max_age
    }

    /// Decide which of `points` to drop
    ///
    /// Non-active points are ignored. Running the decision again over the
    /// survivors yields an empty report.
    #[must_use]
    pub fn evaluate(
        &self,
        points: &[RollbackPoint],
        now: DateTime<Utc>,
        pinned: &HashSet<RollbackPointId>,
    ) -> RetentionReport {
        let mut active: Vec<&RollbackPoint> = points.iter().filter(|p| p.is_active()).collect();
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let pinned_count = active.iter().filter(|p| pinned.contains(&p.id)).count();
        let free_slots = self.max_points.saturating_sub(pinned_count);

        let mut report = RetentionReport::default();
        let mut kept = 0usize;
        for point in active {
            let expired = self.is_expired(point, now);
            if pinned.contains(&point.id) {
                if expired {
                    report.pinned_retained.push(point.id);
                }
            } else if expired {
                report.expired.push(point.id);
            } else if kept < free_slots {
                kept += 1;
            } else {
                report.archived.push(point.id);
            }
        }
        report
    }
}
