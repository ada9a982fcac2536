// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration loaded from TOML.
//!
//! ```toml
//! max_threads = 10
//! start_threads = true
//! [role_limits]
//! "role.audio" = 2
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Environment variable naming a TOML configuration file.
pub const CONFIG_ENV: &str = "NEXUS_DRT_CONFIG";

/// Environment variable overriding [`RuntimeConfig::max_threads`].
pub const MAX_THREADS_ENV: &str = "NEXUS_DRT_MAX_THREADS";

/// Default cap of every thread pool.
pub const DEFAULT_MAX_THREADS: u32 = 10;

/// Errors produced while loading a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not valid TOML for [`RuntimeConfig`].
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is syntactically fine but unusable.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunables of a [`crate::Runtime`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Thread cap of the default pool and of roles without an explicit limit.
    pub max_threads: u32,
    /// Whether [`crate::Runtime::global`] starts its default pool.
    pub start_threads: bool,
    /// Per scheduler role thread caps.
    pub role_limits: BTreeMap<String, u32>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { max_threads: DEFAULT_MAX_THREADS, start_threads: true, role_limits: BTreeMap::new() }
    }
}

impl RuntimeConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Loads [`CONFIG_ENV`] if set, then applies [`MAX_THREADS_ENV`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_path(path)?,
            Err(_) => Self::default(),
        };
        if let Ok(raw) = std::env::var(MAX_THREADS_ENV) {
            config.max_threads = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("{MAX_THREADS_ENV}={raw}")))?;
            config.validate()?;
        }
        Ok(config)
    }

    /// Thread cap applying to `role`.
    pub fn limit_for_role(&self, role: &str) -> u32 {
        self.role_limits.get(role).copied().unwrap_or(self.max_threads)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_threads == 0 {
            return Err(ConfigError::Invalid("max_threads must be at least 1".to_string()));
        }
        if let Some((role, _)) = self.role_limits.iter().find(|(_, limit)| **limit == 0) {
            return Err(ConfigError::Invalid(format!("role {role} has a zero thread limit")));
        }
        Ok(())
    }
}
