//! Engine configuration
//!
//! Loaded from TOML; every field has a default so partial files are valid.
//!
//! ```toml
//! max_rollback_points = 5
//! retention_days = 14
//! validation_gating = "observe"
//!
//! [step_policies.database]
//! timeout_secs = 3600
//! max_retries = 0
//! ```

use crate::error::ConfigError;
use crate::types::StepKind;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How failed validation checks affect an execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationGating {
    /// A failed critical check aborts the execution
    #[default]
    Blocking,
    /// Failures are recorded but never abort
    Observe,
}

/// Timeout and retry budget for one step kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPolicy {
    /// Per-attempt deadline in seconds
    pub timeout_secs: u64,
    /// Retries after the first attempt
    pub max_retries: u32,
}

impl StepPolicy {
    /// Create a policy
    #[inline]
    #[must_use]
    pub const fn new(timeout_secs: u64, max_retries: u32) -> Self {
        Self {
            timeout_secs,
            max_retries,
        }
    }
}

/// Step policies keyed by step kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepPolicies {
    /// File restores
    pub file: StepPolicy,
    /// Database restores
    pub database: StepPolicy,
    /// Configuration restores
    pub config: StepPolicy,
    /// Service stop/start
    pub service: StepPolicy,
    /// Validation-kind rollback steps
    pub validation: StepPolicy,
}

impl StepPolicies {
    /// Policy for a step kind
    #[inline]
    #[must_use]
    pub fn for_kind(&self, kind: StepKind) -> StepPolicy {
        match kind {
            StepKind::File => self.file,
            StepKind::Database => self.database,
            StepKind::Config => self.config,
            StepKind::Service => self.service,
            StepKind::Validation => self.validation,
        }
    }
}

impl Default for StepPolicies {
    fn default() -> Self {
        Self {
            file: StepPolicy::new(300, 3),
            database: StepPolicy::new(1800, 1),
            config: StepPolicy::new(60, 3),
            service: StepPolicy::new(120, 2),
            validation: StepPolicy::new(60, 0),
        }
    }
}

/// Rollback engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    /// Active points kept per environment
    pub max_rollback_points: usize,
    /// Maximum point age in days
    pub retention_days: u32,
    /// Validation gating mode
    pub validation_gating: ValidationGating,
    /// Append the non-critical functional smoke test to post-validation
    pub include_smoke_test: bool,
    /// Deadline for validation checks in seconds
    pub validation_timeout_secs: u64,
    /// Per step kind timeouts and retries
    pub step_policies: StepPolicies,
}

impl RollbackConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With max rollback points per environment
    #[inline]
    #[must_use]
    pub fn with_max_rollback_points(mut self, max: usize) -> Self {
        self.max_rollback_points = max;
        self
    }

    /// With retention in days
    #[inline]
    #[must_use]
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    /// With validation gating
    #[inline]
    #[must_use]
    pub fn with_validation_gating(mut self, gating: ValidationGating) -> Self {
        self.validation_gating = gating;
        self
    }

    /// With or without the smoke test
    #[inline]
    #[must_use]
    pub fn with_smoke_test(mut self, include: bool) -> Self {
        self.include_smoke_test = include;
        self
    }

    /// Override the policy of one step kind
    #[must_use]
    pub fn with_step_policy(mut self, kind: StepKind, policy: StepPolicy) -> Self {
        let slot = match kind {
            StepKind::File => &mut self.step_policies.file,
            StepKind::Database => &mut self.step_policies.database,
            StepKind::Config => &mut self.step_policies.config,
            StepKind::Service => &mut self.step_policies.service,
            StepKind::Validation => &mut self.step_policies.validation,
        };
        *slot = policy;
        self
    }

    /// Parse and validate TOML
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_rollback_points == 0 {
            return Err(ConfigError::Invalid(
                "max_rollback_points must be at least 1".to_string(),
            ));
        }
        if self.retention_days == 0 {
            return Err(ConfigError::Invalid(
                "retention_days must be at least 1".to_string(),
            ));
        }
        if self.validation_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "validation_timeout_secs must be positive".to_string(),
            ));
        }
        for kind in StepKind::ALL {
            if self.step_policies.for_kind(*kind).timeout_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "step_policies.{kind}.timeout_secs must be positive"
                )));
            }
        }
        Ok(())
    }
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            max_rollback_points: 10,
            retention_days: 30,
            validation_gating: ValidationGating::Blocking,
            include_smoke_test: true,
            validation_timeout_secs: 60,
            step_policies: StepPolicies::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RollbackConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_rollback_points, 10);
        assert_eq!(config.validation_gating, ValidationGating::Blocking);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = RollbackConfig::from_toml_str(
            r#"
            retention_days = 7
            validation_gating = "observe"

            [step_policies.database]
            timeout_secs = 3600
            max_retries = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.retention_days, 7);
        assert_eq!(config.max_rollback_points, 10);
        assert_eq!(config.validation_gating, ValidationGating::Observe);
        assert_eq!(
            config.step_policies.for_kind(StepKind::Database),
            StepPolicy::new(3600, 0)
        );
        assert_eq!(config.step_policies.file, StepPolicy::new(300, 3));
    }

    #[test]
    fn rejects_zero_capacity() {
        let err = RollbackConfig::from_toml_str("max_rollback_points = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = RollbackConfig::from_toml_str("retention_days = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn renders_and_reparses() {
        let config = RollbackConfig::new()
            .with_max_rollback_points(3)
            .with_step_policy(StepKind::Service, StepPolicy::new(30, 1));
        let rendered = config.to_toml_string().unwrap();
        assert_eq!(RollbackConfig::from_toml_str(&rendered).unwrap(), config);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = RollbackConfig::load("/nonexistent/rollback.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
