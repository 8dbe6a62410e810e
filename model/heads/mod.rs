//! Prediction heads reading the encoder's latent state.
//!
//! Each head family is built through a factory that maps a string identifier to a
//! concrete head. `"None"` means the task is disabled and yields `Ok(None)`; an
//! unrecognised identifier is a configuration error raised at construction.

pub mod longitudinal;
pub mod missing;
pub mod survival;

use crate::batch::ShapeError;
use crate::nn::Activation;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier that disables a head.
pub const DISABLED: &str = "None";

#[derive(Debug, Error)]
pub enum HeadError {
    #[error("{head} head '{name}' is not implemented: unknown identifier")]
    UnknownVariant { head: &'static str, name: String },
    #[error("{head} head '{name}' is not implemented")]
    NotImplemented { head: &'static str, name: String },
    #[error("invalid {head} head argument: {reason}")]
    InvalidArgument { head: &'static str, reason: String },
    #[error("baseline hazard has not been computed; call compute_baseline after training")]
    BaselineNotComputed,
    #[error("risk {risk} is outside the modelled risks 1..={risks}")]
    InvalidRisk { risk: usize, risks: usize },
    #[error("sample {sample} has event indicator {event} but only {risks} risks are modelled")]
    InvalidEvent {
        sample: usize,
        event: usize,
        risks: usize,
    },
    #[error(transparent)]
    Shape(#[from] ShapeError),
}

/// How a summed loss is normalised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    /// Divide by the number of contributing entries; an empty denominator yields 0.
    #[default]
    Mean,
    Sum,
}

impl Reduction {
    /// Factor applied to the summed loss (and its gradient).
    pub(crate) fn scale(self, count: usize) -> f64 {
        match self {
            Reduction::Sum => 1.0,
            Reduction::Mean if count == 0 => 0.0,
            Reduction::Mean => 1.0 / count as f64,
        }
    }
}

/// Hyperparameters read by every head constructor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadArgs {
    /// Hidden layer widths; defaults to `[100]`.
    pub layers: Vec<usize>,
    pub activation: Activation,
    /// Width of the learned reference vector of the time-only longitudinal head.
    pub representation: usize,
}

impl Default for HeadArgs {
    fn default() -> Self {
        Self {
            layers: vec![100],
            activation: Activation::default(),
            representation: 50,
        }
    }
}

impl HeadArgs {
    pub fn with_layers(layers: Vec<usize>) -> Self {
        Self {
            layers,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self, head: &'static str) -> Result<(), HeadError> {
        if self.layers.contains(&0) {
            return Err(HeadError::InvalidArgument {
                head,
                reason: format!("hidden layer widths must be positive, got {:?}", self.layers),
            });
        }
        Ok(())
    }
}

/// Loss value with gradients for the head's own parameters (in
/// `parameters_mut` order) and for the latent state it read.
#[derive(Debug, Clone)]
pub struct HeadGradient<L> {
    pub loss: f64,
    pub parameters: Vec<ArrayD<f64>>,
    pub latent: L,
}

pub(crate) fn ensure_dimension(
    input: &'static str,
    expected: usize,
    found: usize,
    shape: &[usize],
) -> Result<(), HeadError> {
    if expected != found {
        let mut expected_shape = shape.to_vec();
        if let Some(last) = expected_shape.last_mut() {
            *last = expected;
        }
        return Err(ShapeError::DimensionMismatch {
            input,
            expected: expected_shape,
            found: shape.to_vec(),
        }
        .into());
    }
    Ok(())
}
