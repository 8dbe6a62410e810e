//! TOML configuration of a joint model and its training run.
//!
//! Every field has a default, so an empty document is a valid configuration: a
//! DeepSurv survival head on a 30-unit recurrent state with both auxiliary heads
//! disabled.
//!
//! ```toml
//! hidden = 30
//! risks = 2
//! weight = 0.3
//!
//! [survival]
//! layers = [50, 50]
//!
//! [longitudinal]
//! kind = "neural"
//! layers = [50]
//!
//! [training]
//! lr = 1e-4
//! batch = 250
//! ```

use crate::heads::{DISABLED, HeadArgs};
use crate::nn::Activation;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// One `[survival]`, `[longitudinal]` or `[missing]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadConfig {
    /// Factory identifier. When absent the survival head is `"deepsurv"` and the
    /// auxiliary heads are `"None"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub layers: Vec<usize>,
    pub activation: Activation,
    pub representation: usize,
}

impl Default for HeadConfig {
    fn default() -> Self {
        let args = HeadArgs::default();
        Self {
            kind: None,
            layers: args.layers,
            activation: args.activation,
            representation: args.representation,
        }
    }
}

impl HeadConfig {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: Some(kind.to_string()),
            ..Self::default()
        }
    }

    pub fn with_layers(mut self, layers: Vec<usize>) -> Self {
        self.layers = layers;
        self
    }

    pub fn kind_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.kind.as_deref().unwrap_or(fallback)
    }

    pub fn args(&self) -> HeadArgs {
        HeadArgs {
            layers: self.layers.clone(),
            activation: self.activation,
            representation: self.representation,
        }
    }
}

/// The `[training]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub lr: f64,
    /// Patients per optimisation step.
    pub batch: usize,
    pub epochs: usize,
    /// Epochs without validation improvement before stopping.
    pub patience: usize,
    /// Share of patients held out for early stopping.
    pub validation_fraction: f64,
    pub weight_decay: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            batch: 100,
            epochs: 500,
            patience: 5,
            validation_fraction: 0.1,
            weight_decay: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JointConfig {
    /// Width of the latent state.
    pub hidden: usize,
    /// Number of competing risks.
    pub risks: usize,
    /// Weight of the auxiliary (longitudinal and missingness) losses.
    pub weight: f64,
    pub seed: u64,
    /// Channels read by the longitudinal and missingness heads, e.g. the raw
    /// covariates when mask and elapsed-time channels are appended to `x`.
    /// Absent means every channel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modelled_channels: Option<Vec<usize>>,
    pub survival: HeadConfig,
    pub longitudinal: HeadConfig,
    pub missing: HeadConfig,
    pub training: TrainingConfig,
}

impl Default for JointConfig {
    fn default() -> Self {
        Self {
            hidden: 30,
            risks: 1,
            weight: 0.1,
            seed: 0,
            modelled_channels: None,
            survival: HeadConfig::default(),
            longitudinal: HeadConfig::default(),
            missing: HeadConfig::default(),
            training: TrainingConfig::default(),
        }
    }
}

impl JointConfig {
    pub fn survival_kind(&self) -> &str {
        self.survival.kind_or("deepsurv")
    }

    pub fn longitudinal_kind(&self) -> &str {
        self.longitudinal.kind_or(DISABLED)
    }

    pub fn missing_kind(&self) -> &str {
        self.missing.kind_or(DISABLED)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hidden == 0 {
            return Err(ConfigError::Invalid("hidden must be positive".to_string()));
        }
        if self.risks == 0 {
            return Err(ConfigError::Invalid("risks must be positive".to_string()));
        }
        if !(self.weight.is_finite() && self.weight >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "weight must be a non-negative number, got {}",
                self.weight
            )));
        }
        if let Some(channels) = &self.modelled_channels {
            if channels.is_empty() {
                return Err(ConfigError::Invalid(
                    "modelled_channels must name at least one channel".to_string(),
                ));
            }
            if let Some(duplicate) = channels.iter().duplicates().next() {
                return Err(ConfigError::Invalid(format!(
                    "modelled_channels lists channel {duplicate} twice"
                )));
            }
        }
        let training = &self.training;
        if !(training.lr.is_finite() && training.lr > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "training.lr must be positive, got {}",
                training.lr
            )));
        }
        if training.batch == 0 {
            return Err(ConfigError::Invalid(
                "training.batch must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&training.validation_fraction) {
            return Err(ConfigError::Invalid(format!(
                "training.validation_fraction must lie in [0, 1), got {}",
                training.validation_fraction
            )));
        }
        if !(training.weight_decay.is_finite() && training.weight_decay >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "training.weight_decay must be non-negative, got {}",
                training.weight_decay
            )));
        }
        Ok(())
    }
}
