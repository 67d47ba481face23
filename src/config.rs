//! Configuration management for Turnstile.
//!
//! Policies, route bindings and engine settings are loaded from YAML.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{LimiterOptions, PartitionRule};

const BUILTIN_CONFIG: &str = include_str!("../config/turnstile.yaml");

/// Main configuration for the admission engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Engine-wide settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Named policies
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,

    /// Route to policy bindings
    #[serde(default)]
    pub routes: BTreeMap<String, String>,

    /// Policy for routes without an explicit binding
    #[serde(default)]
    pub default_policy: Option<String>,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Status code reported on rejection
    #[serde(default = "default_rejection_status_code")]
    pub rejection_status_code: u16,

    /// Whether rejections carry a retry hint
    #[serde(default = "default_include_retry_after")]
    pub include_retry_after: bool,

    /// Periodic eviction of idle partitions (disabled when absent)
    #[serde(default)]
    pub idle_eviction: Option<EvictionConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rejection_status_code: default_rejection_status_code(),
            include_retry_after: default_include_retry_after(),
            idle_eviction: None,
        }
    }
}

fn default_rejection_status_code() -> u16 {
    429
}

fn default_include_retry_after() -> bool {
    true
}

/// Idle partition eviction settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// How often the sweep runs, in milliseconds
    #[serde(default = "default_eviction_interval")]
    pub interval_ms: u64,

    /// Minimum idle time before a partition is dropped, in milliseconds
    #[serde(default = "default_idle_after")]
    pub idle_after_ms: u64,
}

impl EvictionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn idle_after(&self) -> Duration {
        Duration::from_millis(self.idle_after_ms)
    }
}

fn default_eviction_interval() -> u64 {
    10_000
}

fn default_idle_after() -> u64 {
    60_000
}

/// A named policy: one limiter configuration plus a partitioning rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Policy name, referenced by routes
    pub name: String,

    /// Limiter created for each partition
    pub limiter: LimiterOptions,

    /// How requests are split into partitions
    #[serde(default)]
    pub partition: PartitionRule,
}

impl TurnstileConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// The configuration shipped with the binary.
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(BUILTIN_CONFIG)
    }

    /// Check cross references that serde cannot.
    pub fn validate(&self) -> Result<()> {
        if !(100..=599).contains(&self.engine.rejection_status_code) {
            return Err(TurnstileError::Config(format!(
                "rejection_status_code {} is not a valid HTTP status",
                self.engine.rejection_status_code
            )));
        }

        if let Some(eviction) = &self.engine.idle_eviction {
            if eviction.interval_ms == 0 {
                return Err(TurnstileError::Config(
                    "idle_eviction.interval_ms must be greater than zero".to_string(),
                ));
            }
        }

        let mut names = HashSet::new();
        for policy in &self.policies {
            if !names.insert(policy.name.as_str()) {
                return Err(TurnstileError::DuplicatePolicy(policy.name.clone()));
            }
        }

        for policy in self.routes.values() {
            if !names.contains(policy.as_str()) {
                return Err(TurnstileError::UnknownPolicy(policy.clone()));
            }
        }

        if let Some(policy) = &self.default_policy {
            if !names.contains(policy.as_str()) {
                return Err(TurnstileError::UnknownPolicy(policy.clone()));
            }
        }

        Ok(())
    }

    pub fn policy(&self, name: &str) -> Option<&PolicyConfig> {
        self.policies.iter().find(|policy| policy.name == name)
    }
}
