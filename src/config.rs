//! Engine configuration

use crate::backend::cpu::CpuConfig;
use crate::backend::stream::StreamConfig;
use crate::plan::{AllocStrategy, PlanOptions};
use crate::sched::{PlacementPolicy, TieBreak};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Everything needed to build an [`Engine`](crate::Engine)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub cpu: CpuConfig,

    /// Stream backends, registered after the CPU backend in this order
    #[serde(default)]
    pub streams: Vec<StreamConfig>,

    /// Arena budget in bytes per backend name
    #[serde(default)]
    pub arena_budgets: HashMap<String, usize>,

    #[serde(default)]
    pub alloc_strategy: AllocStrategy,

    /// Let eligible operations overwrite a dying input
    #[serde(default = "default_allow_inplace")]
    pub allow_inplace: bool,

    #[serde(default)]
    pub tie_break: TieBreak,

    #[serde(default)]
    pub placement: PlacementPolicy,
}

fn default_allow_inplace() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cpu: CpuConfig::default(),
            streams: Vec::new(),
            arena_budgets: HashMap::new(),
            alloc_strategy: AllocStrategy::default(),
            allow_inplace: default_allow_inplace(),
            tie_break: TieBreak::default(),
            placement: PlacementPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Add a stream backend
    pub fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.streams.push(stream);
        self
    }

    /// Set the arena budget of one backend
    pub fn with_budget(mut self, backend: impl Into<String>, bytes: usize) -> Self {
        self.arena_budgets.insert(backend.into(), bytes);
        self
    }

    pub fn with_placement(mut self, placement: PlacementPolicy) -> Self {
        self.placement = placement;
        self
    }

    fn backend_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.cpu.name.as_str()).chain(self.streams.iter().map(|s| s.name.as_str()))
    }

    /// Check that every backend name used in the configuration is defined once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let names: Vec<&str> = self.backend_names().collect();
        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(ConfigError::Invalid(format!("backend '{}' is defined twice", name)));
            }
        }

        let referenced = self
            .arena_budgets
            .keys()
            .map(String::as_str)
            .chain(self.placement.default_backend.as_deref())
            .chain(self.placement.rules.iter().map(|r| r.backend.as_str()));
        for name in referenced {
            if !names.contains(&name) {
                return Err(ConfigError::Invalid(format!("unknown backend '{}'", name)));
            }
        }
        Ok(())
    }

    pub fn plan_options(&self) -> PlanOptions {
        PlanOptions {
            strategy: self.alloc_strategy,
            allow_inplace: self.allow_inplace,
            budgets: self.arena_budgets.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_object() {
        let config = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(config.allow_inplace);
        assert_eq!(config.cpu.name, "cpu");
    }

    #[test]
    fn test_full_config() {
        let json = r#"{
            "cpu": { "threads": 2 },
            "streams": [{ "name": "accel0", "ops": ["add", "matmul"] }],
            "arena_budgets": { "accel0": 1048576 },
            "alloc_strategy": "first_fit",
            "allow_inplace": false,
            "tie_break": "default",
            "placement": {
                "default_backend": "cpu",
                "rules": [{ "pattern": "blk.*", "backend": "accel0" }]
            }
        }"#;
        let config = EngineConfig::from_json_str(json).unwrap();
        assert_eq!(config.cpu.threads, 2);
        assert_eq!(config.streams[0].name, "accel0");
        assert_eq!(config.alloc_strategy, AllocStrategy::FirstFit);
        assert_eq!(config.tie_break, TieBreak::Default);

        let options = config.plan_options();
        assert!(!options.allow_inplace);
        assert_eq!(options.budgets.get("accel0"), Some(&1048576));

        let round_trip = EngineConfig::from_json_str(&config.to_json().unwrap()).unwrap();
        assert_eq!(round_trip, config);
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let json = r#"{ "placement": { "rules": [{ "pattern": "*", "backend": "gpu" }] } }"#;
        assert!(matches!(
            EngineConfig::from_json_str(json),
            Err(ConfigError::Invalid(_))
        ));

        let json = r#"{ "streams": [{ "name": "cpu" }] }"#;
        assert!(matches!(
            EngineConfig::from_json_str(json),
            Err(ConfigError::Invalid(_))
        ));
    }
}
