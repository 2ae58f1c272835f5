//! Approval gate
//!
//! The rule is always derived from the point itself, both when a plan is
//! built and again when it is executed.

use crate::types::{ChangeKind, Environment, Risk, RollbackPoint, Severity};

/// Whether a change with these attributes needs a named approver
#[must_use]
pub fn requires_approval(kind: ChangeKind, environment: Environment, risks: &[Risk]) -> bool {
    environment == Environment::Production
        || kind == ChangeKind::Database
        || risks.iter().any(|r| r.severity == Severity::Critical)
}

/// Approval rule applied to a stored point
#[inline]
#[must_use]
pub fn point_requires_approval(point: &RollbackPoint) -> bool {
    requires_approval(point.kind, point.environment, &point.risks)
}

/// Normalise an approver name; blank names count as absent
#[must_use]
pub fn normalize_approver(approved_by: Option<&str>) -> Option<String> {
    approved_by
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RiskKind;

    #[test]
    fn production_requires_approval() {
        assert!(requires_approval(ChangeKind::Config, Environment::Production, &[]));
    }

    #[test]
    fn database_requires_approval_anywhere() {
        assert!(requires_approval(ChangeKind::Database, Environment::Development, &[]));
    }

    #[test]
    fn critical_risk_requires_approval() {
        let risks = [Risk::new(RiskKind::Compatibility, Severity::Critical, 5)];
        assert!(requires_approval(ChangeKind::Feature, Environment::Staging, &risks));
    }

    #[test]
    fn staging_config_without_risks_is_free() {
        let risks = [Risk::new(RiskKind::Performance, Severity::High, 50)];
        assert!(!requires_approval(ChangeKind::Config, Environment::Staging, &risks));
    }

    #[test]
    fn blank_approver_is_absent() {
        assert_eq!(normalize_approver(Some("  ")), None);
        assert_eq!(normalize_approver(None), None);
        assert_eq!(normalize_approver(Some(" bob ")), Some("bob".to_string()));
    }
}
