//! External collaborators
//!
//! The engine never touches files, databases or services itself. It
//! drives three seams:
//! - [`SnapshotCapture`] records system state when a point is created
//! - [`StepRunner`] performs one rollback step attempt under a deadline
//! - [`ValidationRunner`] runs one pre/post check under a deadline
//!
//! Snapshot content is opaque to the engine; only its digest is kept on
//! the point.

use crate::error::{SnapshotError, StepError, ValidationError};
use crate::types::{Environment, RollbackStep, SnapshotComponent, ValidationStep};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

/// One captured file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshot {
    /// Path of the file
    pub path: String,
    /// Content hash reported by the backend
    pub checksum: String,
    /// Size in bytes
    pub size_bytes: u64,
}

/// Captured database state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSnapshot {
    /// Schema version at capture time
    pub schema_version: String,
    /// Tables included in the dump
    pub tables: Vec<String>,
    /// Backend reference of the dump
    pub backup_ref: String,
}

/// Captured configuration of one environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// Environment the configuration belongs to
    pub environment: Environment,
    /// Flattened key/value pairs
    pub values: BTreeMap<String, String>,
}

/// Captured state of one feature flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    /// Flag name
    pub name: String,
    /// Whether the flag was on
    pub enabled: bool,
    /// Rollout percentage
    pub rollout_percent: u8,
}

/// Captured host environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    /// Runtime version string
    pub runtime_version: String,
    /// Relevant environment variables
    pub variables: BTreeMap<String, String>,
}

/// Everything captured for one rollback point
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotBundle {
    /// Capture time
    pub captured_at: Option<DateTime<Utc>>,
    /// Files, when captured
    pub files: Option<Vec<FileSnapshot>>,
    /// Database, when captured
    pub database: Option<DatabaseSnapshot>,
    /// Configuration, when captured
    pub config: Option<ConfigSnapshot>,
    /// Feature flags, when captured
    pub feature_flags: Option<Vec<FeatureSnapshot>>,
    /// Host environment, when captured
    pub environment: Option<EnvironmentSnapshot>,
}

impl SnapshotBundle {
    /// Components present in the bundle
    #[must_use]
    pub fn components(&self) -> Vec<SnapshotComponent> {
        let mut components = Vec::new();
        if self.files.is_some() {
            components.push(SnapshotComponent::Files);
        }
        if self.database.is_some() {
            components.push(SnapshotComponent::Database);
        }
        if self.config.is_some() {
            components.push(SnapshotComponent::Config);
        }
        if self.feature_flags.is_some() {
            components.push(SnapshotComponent::FeatureFlags);
        }
        if self.environment.is_some() {
            components.push(SnapshotComponent::Environment);
        }
        components
    }

    /// SHA-256 over the canonical JSON encoding (hex)
    #[must_use]
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        // Serializing plain data with string keys cannot fail.
        if let Ok(bytes) = serde_json::to_vec(self) {
            hasher.update(&bytes);
        }
        hex::encode(hasher.finalize())
    }
}

/// Captures system state for a new rollback point
///
/// Called once per point creation; any error aborts the creation.
#[async_trait]
pub trait SnapshotCapture: Send + Sync + Debug {
    /// Application files
    async fn capture_files(&self) -> Result<Vec<FileSnapshot>, SnapshotError>;

    /// Database state
    async fn capture_database(&self) -> Result<DatabaseSnapshot, SnapshotError>;

    /// Configuration of one environment
    async fn capture_config(&self, environment: Environment)
        -> Result<ConfigSnapshot, SnapshotError>;

    /// Feature flag states
    async fn capture_feature_flags(&self) -> Result<Vec<FeatureSnapshot>, SnapshotError>;

    /// Host environment
    async fn capture_environment(&self) -> Result<EnvironmentSnapshot, SnapshotError>;
}

/// Performs one attempt of a rollback step
///
/// Implementations must honor `deadline`; the executor additionally
/// enforces it and treats an elapsed deadline as [`StepError::Timeout`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Run the step; returns its output
    async fn run(&self, step: &RollbackStep, deadline: Duration) -> Result<String, StepError>;
}

/// Runs one validation check
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ValidationRunner: Send + Sync {
    /// Run the check; returns the observed value
    async fn check(
        &self,
        step: &ValidationStep,
        deadline: Duration,
    ) -> Result<serde_json::Value, ValidationError>;
}

impl Debug for dyn StepRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StepRunner")
    }
}

impl Debug for dyn ValidationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ValidationRunner")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_follow_captured_fields() {
        let bundle = SnapshotBundle {
            database: Some(DatabaseSnapshot {
                schema_version: "42".into(),
                tables: vec!["users".into()],
                backup_ref: "dump-1".into(),
            }),
            environment: Some(EnvironmentSnapshot {
                runtime_version: "1.0".into(),
                variables: BTreeMap::new(),
            }),
            ..SnapshotBundle::default()
        };

        assert_eq!(
            bundle.components(),
            vec![SnapshotComponent::Database, SnapshotComponent::Environment]
        );
    }

    #[test]
    fn digest_is_stable_and_content_sensitive() {
        let mut bundle = SnapshotBundle {
            feature_flags: Some(vec![FeatureSnapshot {
                name: "new-checkout".into(),
                enabled: true,
                rollout_percent: 50,
            }]),
            ..SnapshotBundle::default()
        };
        let first = bundle.digest();
        assert_eq!(first, bundle.digest());
        assert_eq!(first.len(), 64);

        if let Some(flags) = bundle.feature_flags.as_mut() {
            flags[0].enabled = false;
        }
        assert_ne!(first, bundle.digest());
    }
}
