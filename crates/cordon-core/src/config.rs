//! Sandbox configuration (`cordon.toml`)
//!
//! ```toml
//! component_types = ["Engine.GameObject", "Engine.Component"]
//!
//! [sandbox]
//! time_budget_ms = 10
//! check_interval = 64
//!
//! [profiles.avatar]
//! allowed_types = ["Engine.Transform", "Engine.Animation.*"]
//! denied_methods = ["Engine.Transform::SetParent"]
//! ```

use crate::policy::{PolicyProfile, ProfilePolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Validation error
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// Requested profile is not defined
    #[error("Unknown policy profile '{0}'")]
    UnknownProfile(String),
}

/// Per-box execution limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxOptions {
    /// Wall-clock budget per host frame
    #[serde(rename = "time_budget_ms", with = "duration_ms")]
    pub time_budget: Duration,

    /// Optional cap on instructions per top-level entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_instructions: Option<u64>,

    /// Instructions between budget checks
    pub check_interval: u32,

    /// Value slots in each entry's frame buffer
    pub frame_slots: usize,

    /// Maximum interpreted call depth
    pub max_call_depth: usize,

    /// Total array elements one entry may allocate
    pub max_allocated_elements: u64,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            time_budget: Duration::from_millis(10),
            max_instructions: None,
            check_interval: 64,
            frame_slots: 4096,
            max_call_depth: 256,
            max_allocated_elements: 1 << 26,
        }
    }
}

impl SandboxOptions {
    /// Validate option ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval == 0 {
            return Err(ConfigError::ValidationError(
                "check_interval must be at least 1".to_string(),
            ));
        }
        if self.frame_slots < 16 {
            return Err(ConfigError::ValidationError(
                "frame_slots must be at least 16".to_string(),
            ));
        }
        if self.max_call_depth == 0 {
            return Err(ConfigError::ValidationError(
                "max_call_depth must be at least 1".to_string(),
            ));
        }
        if self.max_allocated_elements == 0 {
            return Err(ConfigError::ValidationError(
                "max_allocated_elements must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_component_types() -> Vec<String> {
    vec!["Engine.GameObject".to_string(), "Engine.Component".to_string()]
}

/// Complete configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Execution limits
    #[serde(default)]
    pub sandbox: SandboxOptions,

    /// Host object types that receive the object-model shims
    #[serde(default = "default_component_types")]
    pub component_types: Vec<String>,

    /// Named policy profiles
    #[serde(default)]
    pub profiles: HashMap<String, PolicyProfile>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxOptions::default(),
            component_types: default_component_types(),
            profiles: HashMap::new(),
        }
    }
}

impl SandboxConfig {
    /// Load a configuration file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse a configuration from a string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: SandboxConfig = toml::from_str(content)?;
        config.sandbox.validate()?;
        Ok(config)
    }

    /// Build the policy for a named profile
    pub fn policy(&self, profile: &str) -> Result<ProfilePolicy, ConfigError> {
        self.profiles
            .get(profile)
            .map(|p| ProfilePolicy::new(profile, p))
            .ok_or_else(|| ConfigError::UnknownProfile(profile.to_string()))
    }
}
