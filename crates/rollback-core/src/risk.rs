//! Risk assessment
//!
//! A deterministic rule table, evaluated per (change kind, environment).
//! Rules are pure: no I/O, no clock, no randomness.

use crate::types::{ChangeKind, Environment, Risk, RiskKind, Severity};
use std::fmt::Debug;

/// A single assessment rule
pub trait RiskRule: Send + Sync + Debug {
    /// Rule name, for diagnostics
    fn name(&self) -> &'static str;

    /// Risk contributed for this change, if any
    fn evaluate(&self, kind: ChangeKind, environment: Environment) -> Option<Risk>;
}

/// Production rollbacks interrupt live traffic
#[derive(Debug, Clone, Copy, Default)]
pub struct ProductionDowntimeRule;

impl RiskRule for ProductionDowntimeRule {
    fn name(&self) -> &'static str {
        "production-downtime"
    }

    fn evaluate(&self, _kind: ChangeKind, environment: Environment) -> Option<Risk> {
        (environment == Environment::Production).then(|| {
            Risk::new(RiskKind::Downtime, Severity::High, 80)
                .with_description("rollback interrupts production traffic")
                .with_mitigation("schedule a maintenance window and drain traffic first")
        })
    }
}

/// Restoring a database discards writes made after the snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct DatabaseDataLossRule;

impl RiskRule for DatabaseDataLossRule {
    fn name(&self) -> &'static str {
        "database-data-loss"
    }

    fn evaluate(&self, kind: ChangeKind, _environment: Environment) -> Option<Risk> {
        (kind == ChangeKind::Database).then(|| {
            Risk::new(RiskKind::DataLoss, Severity::Critical, 30)
                .with_description("writes made after the snapshot are discarded")
                .with_mitigation("export recent writes before restoring")
        })
    }
}

/// Evaluates every registered rule in registration order
#[derive(Debug)]
pub struct RiskAssessor {
    rules: Vec<Box<dyn RiskRule>>,
}

impl RiskAssessor {
    /// Assessor with the default rule table
    #[must_use]
    pub fn new() -> Self {
        Self::empty()
            .with_rule(ProductionDowntimeRule)
            .with_rule(DatabaseDataLossRule)
    }

    /// Assessor with no rules
    #[inline]
    #[must_use]
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Register an additional rule
    #[must_use]
    pub fn with_rule(mut self, rule: impl RiskRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    /// Number of registered rules
    #[inline]
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Risks for a change
    #[must_use]
    pub fn assess(&self, kind: ChangeKind, environment: Environment) -> Vec<Risk> {
        self.rules
            .iter()
            .filter_map(|rule| rule.evaluate(kind, environment))
            .collect()
    }
}

impl Default for RiskAssessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_config_has_no_risks() {
        let risks = RiskAssessor::new().assess(ChangeKind::Config, Environment::Staging);
        assert!(risks.is_empty());
    }

    #[test]
    fn production_adds_downtime() {
        let risks = RiskAssessor::new().assess(ChangeKind::Config, Environment::Production);
        assert_eq!(risks.len(), 1);
        assert_eq!(risks[0].kind, RiskKind::Downtime);
        assert_eq!(risks[0].severity, Severity::High);
        assert_eq!(risks[0].probability, 80);
    }

    #[test]
    fn production_database_has_both_rules() {
        let risks = RiskAssessor::new().assess(ChangeKind::Database, Environment::Production);
        let kinds: Vec<_> = risks.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![RiskKind::Downtime, RiskKind::DataLoss]);
        assert_eq!(risks[1].severity, Severity::Critical);
        assert_eq!(risks[1].probability, 30);
    }

    #[derive(Debug)]
    struct FeatureCompatibilityRule;

    impl RiskRule for FeatureCompatibilityRule {
        fn name(&self) -> &'static str {
            "feature-compatibility"
        }

        fn evaluate(&self, kind: ChangeKind, _environment: Environment) -> Option<Risk> {
            (kind == ChangeKind::Feature)
                .then(|| Risk::new(RiskKind::Compatibility, Severity::Medium, 20))
        }
    }

    #[test]
    fn custom_rules_extend_the_table() {
        let assessor = RiskAssessor::new().with_rule(FeatureCompatibilityRule);
        assert_eq!(assessor.rule_count(), 3);

        let risks = assessor.assess(ChangeKind::Feature, Environment::Development);
        assert_eq!(risks.len(), 1);
        assert_eq!(risks[0].kind, RiskKind::Compatibility);
    }

    #[test]
    fn assessment_is_deterministic() {
        let assessor = RiskAssessor::new();
        for kind in ChangeKind::ALL {
            for env in Environment::ALL {
                assert_eq!(assessor.assess(*kind, *env), assessor.assess(*kind, *env));
            }
        }
    }
}
