use std::fs;
use std::path::Path;

use aether_domain::{ensure_unit_interval, AetherError};
use aether_memory_core::MemoryGraphConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// EMA smoothing factor.
    pub alpha: f64,
    pub refinement_threshold: f64,
    pub initial_score: f64,
    pub min_samples_before_refine: u64,
    pub outcome_window: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            refinement_threshold: 0.6,
            initial_score: 0.5,
            min_samples_before_refine: 1,
            outcome_window: 10,
        }
    }
}

impl RegistryConfig {
    /// # Errors
    /// Returns [`AetherError::Configuration`] when a value is out of range.
    pub fn validate(&self) -> Result<(), AetherError> {
        ensure_unit_interval("alpha", self.alpha)?;
        if self.alpha <= 0.0 {
            return Err(AetherError::Configuration("alpha MUST be > 0".to_string()));
        }
        ensure_unit_interval("refinement_threshold", self.refinement_threshold)?;
        ensure_unit_interval("initial_score", self.initial_score)?;
        if self.outcome_window == 0 {
            return Err(AetherError::Configuration(
                "outcome_window MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    pub parallelism: usize,
    pub cancel_poll_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            cancel_poll_ms: 25,
        }
    }
}

impl OrchestratorConfig {
    /// # Errors
    /// Returns [`AetherError::Configuration`] when a value is out of range.
    pub fn validate(&self) -> Result<(), AetherError> {
        if self.parallelism == 0 {
            return Err(AetherError::Configuration(
                "parallelism MUST be >= 1".to_string(),
            ));
        }
        if self.cancel_poll_ms == 0 {
            return Err(AetherError::Configuration(
                "cancel_poll_ms MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FacadeConfig {
    pub context_k: usize,
    pub context_min_importance: f64,
    pub decay_before_recall: bool,
    pub persist_after_write_back: bool,
    /// Pull graph neighbours of recalled memories into the context at this
    /// fraction of the recalled memory's score.
    pub context_neighbor_attenuation: Option<f64>,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            context_k: 5,
            context_min_importance: 0.0,
            decay_before_recall: true,
            persist_after_write_back: true,
            context_neighbor_attenuation: None,
        }
    }
}

impl FacadeConfig {
    /// # Errors
    /// Returns [`AetherError::Configuration`] when a value is out of range.
    pub fn validate(&self) -> Result<(), AetherError> {
        ensure_unit_interval("context_min_importance", self.context_min_importance)?;
        if let Some(attenuation) = self.context_neighbor_attenuation {
            ensure_unit_interval("context_neighbor_attenuation", attenuation)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AetherConfig {
    pub memory: MemoryGraphConfig,
    pub registry: RegistryConfig,
    pub orchestrator: OrchestratorConfig,
    pub facade: FacadeConfig,
}

impl AetherConfig {
    /// # Errors
    /// Returns [`AetherError::Configuration`] when any section is invalid.
    pub fn validate(&self) -> Result<(), AetherError> {
        self.memory.validate()?;
        self.registry.validate()?;
        self.orchestrator.validate()?;
        self.facade.validate()
    }

    /// # Errors
    /// Returns [`AetherError::Configuration`] on decode or validation failure.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, AetherError> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|err| AetherError::Configuration(format!("invalid config YAML: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`AetherError::Configuration`] on decode or validation failure.
    pub fn from_json_str(json: &str) -> Result<Self, AetherError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| AetherError::Configuration(format!("invalid config JSON: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// `.json` files are read as JSON, anything else as YAML.
    ///
    /// # Errors
    /// Returns [`AetherError::Configuration`] when the file cannot be read or decoded.
    pub fn load_from_path(path: &Path) -> Result<Self, AetherError> {
        let content = fs::read_to_string(path).map_err(|err| {
            AetherError::Configuration(format!(
                "failed to read config file {}: {err}",
                path.display()
            ))
        })?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_yaml_str(&content)
        }
    }
}
