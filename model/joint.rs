//! Joint model: a sequence encoder shared by a survival head and optional
//! longitudinal and missingness heads.
//!
//! The encoder maps each patient's covariate history to latent states `h`
//! `(patients, time, hidden)`. The survival head reads the state at the last
//! valid step of each patient; the auxiliary heads read every step. Training
//! minimises
//!
//! `survival + weight · (longitudinal + missing)`
//!
//! where a disabled head contributes exactly zero.

use crate::batch::{EventBatch, SequenceBatch, ShapeError, batch_forward};
use crate::config::{ConfigError, JointConfig};
use crate::data::{ChannelSelection, CohortView, SequenceInputs};
use crate::encoder::{RecurrentEncoder, SequenceEncoder};
use crate::heads::longitudinal::LongitudinalHead;
use crate::heads::missing::MissingHead;
use crate::heads::survival::{BaselineHazard, SurvivalHead};
use crate::heads::{HeadError, Reduction};
use crate::optim::Parameterized;
use ndarray::{Array2, Array3, ArrayD, ArrayView1, ArrayView3, ArrayViewMutD, s};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JointError {
    #[error(transparent)]
    Head(#[from] HeadError),
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to read or write model file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("a survival head is required; survival.kind cannot be \"None\"")]
    NoSurvivalHead,
    #[error("encoder produces {found}-dimensional states but the configuration expects {expected}")]
    HiddenMismatch { expected: usize, found: usize },
    #[error("cannot train on an empty cohort")]
    EmptyCohort,
    #[error("training diverged in epoch {epoch}: loss is {loss}")]
    Diverged { epoch: usize, loss: f64 },
}

/// Per-task breakdown of the joint loss. Disabled heads report 0.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct JointLoss {
    pub survival: f64,
    pub longitudinal: f64,
    pub missing: f64,
    pub total: f64,
}

impl JointLoss {
    fn new(survival: f64, longitudinal: f64, missing: f64, weight: f64) -> Self {
        Self {
            survival,
            longitudinal,
            missing,
            total: survival + weight * (longitudinal + missing),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JointModel<E> {
    config: JointConfig,
    encoder: E,
    survival: SurvivalHead,
    longitudinal: Option<LongitudinalHead>,
    missing: Option<MissingHead>,
}

impl JointModel<RecurrentEncoder> {
    /// Builds the recurrent encoder and every configured head from one seeded stream.
    pub fn from_config(config: JointConfig, channels: usize) -> Result<Self, JointError> {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let encoder = RecurrentEncoder::new(channels, config.hidden, &mut rng);
        Self::build(config, encoder, &mut rng)
    }
}

impl<E: SequenceEncoder> JointModel<E> {
    pub fn new(config: JointConfig, encoder: E) -> Result<Self, JointError> {
        let mut rng = StdRng::seed_from_u64(config.seed);
        Self::build(config, encoder, &mut rng)
    }

    fn build(config: JointConfig, encoder: E, rng: &mut StdRng) -> Result<Self, JointError> {
        config.validate()?;
        if encoder.hidden_dim() != config.hidden {
            return Err(JointError::HiddenMismatch {
                expected: config.hidden,
                found: encoder.hidden_dim(),
            });
        }
        let hidden = config.hidden;
        let channels = match &config.modelled_channels {
            Some(selected) => {
                if let Some(&channel) = selected.iter().find(|&&c| c >= encoder.input_dim()) {
                    return Err(ConfigError::Invalid(format!(
                        "modelled channel {channel} is out of range for {} encoder channels",
                        encoder.input_dim()
                    ))
                    .into());
                }
                selected.len()
            }
            None => encoder.input_dim(),
        };
        let survival = SurvivalHead::create(
            config.survival_kind(),
            hidden,
            config.risks,
            &config.survival.args(),
            rng,
        )?
        .ok_or(JointError::NoSurvivalHead)?;
        let longitudinal = LongitudinalHead::create(
            config.longitudinal_kind(),
            hidden,
            channels,
            &config.longitudinal.args(),
            rng,
        )?;
        let missing = MissingHead::create(
            config.missing_kind(),
            hidden,
            channels,
            &config.missing.args(),
            rng,
        )?;
        log::debug!(
            "Joint model: hidden={}, risks={}, longitudinal={}, missing={}, modelled channels={}",
            hidden,
            config.risks,
            config.longitudinal_kind(),
            config.missing_kind(),
            channels
        );
        Ok(Self {
            config,
            encoder,
            survival,
            longitudinal,
            missing,
        })
    }

    pub fn config(&self) -> &JointConfig {
        &self.config
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    pub fn survival(&self) -> &SurvivalHead {
        &self.survival
    }

    pub fn longitudinal(&self) -> Option<&LongitudinalHead> {
        self.longitudinal.as_ref()
    }

    pub fn missing(&self) -> Option<&MissingHead> {
        self.missing.as_ref()
    }

    /// Latent states `(patients, time, hidden)`, encoded `size` patients at a time.
    pub fn encode(
        &self,
        inputs: &SequenceInputs<'_>,
        size: Option<usize>,
    ) -> Result<Array3<f64>, JointError> {
        let states = batch_forward(inputs.len(), size, |range| {
            self.encoder.encode(&inputs.slice(range))
        })?;
        Ok(states)
    }

    pub fn loss(&self, cohort: &CohortView<'_>, size: Option<usize>) -> Result<JointLoss, JointError> {
        let h = self.encode(&cohort.inputs, size)?;
        let last = last_states(h.view(), cohort.inputs.l)?;
        let events = EventBatch::new(last.view(), cohort.e.reborrow(), cohort.t.reborrow())?;
        let survival = self.survival.loss(&events, size, Reduction::Mean)?;

        let selection = self.channel_selection(&cohort.inputs)?;
        let modelled = modelled_inputs(&selection, &cohort.inputs);
        let sequence = SequenceBatch::new(h.view(), modelled)?;
        let longitudinal = match &self.longitudinal {
            Some(head) => head.loss(&sequence, size, Reduction::Mean)?,
            None => 0.0,
        };
        let missing = match &self.missing {
            Some(head) => head.loss(&sequence, size, Reduction::Mean)?,
            None => 0.0,
        };
        Ok(JointLoss::new(survival, longitudinal, missing, self.config.weight))
    }

    /// Joint loss and its gradient for every parameter, in `parameters_mut` order.
    pub fn loss_and_gradient(
        &self,
        cohort: &CohortView<'_>,
    ) -> Result<(JointLoss, Vec<ArrayD<f64>>), JointError> {
        let weight = self.config.weight;
        let h = self.encoder.encode(&cohort.inputs)?;
        let last = last_states(h.view(), cohort.inputs.l)?;
        let events = EventBatch::new(last.view(), cohort.e.reborrow(), cohort.t.reborrow())?;
        let survival = self.survival.loss_and_gradient(&events, Reduction::Mean)?;

        let mut grad_h = Array3::zeros(h.raw_dim());
        for (b, &length) in cohort.inputs.l.iter().enumerate() {
            grad_h
                .slice_mut(s![b, length - 1, ..])
                .assign(&survival.latent.row(b));
        }
        let mut head_parameters = survival.parameters;

        let selection = self.channel_selection(&cohort.inputs)?;
        let modelled = modelled_inputs(&selection, &cohort.inputs);
        let sequence = SequenceBatch::new(h.view(), modelled)?;
        let mut longitudinal_loss = 0.0;
        if let Some(head) = &self.longitudinal {
            let gradient = head.loss_and_gradient(&sequence, Reduction::Mean)?;
            longitudinal_loss = gradient.loss;
            grad_h.scaled_add(weight, &gradient.latent);
            head_parameters.extend(gradient.parameters.into_iter().map(|g| g * weight));
        }
        let mut missing_loss = 0.0;
        if let Some(head) = &self.missing {
            let gradient = head.loss_and_gradient(&sequence, Reduction::Mean)?;
            missing_loss = gradient.loss;
            grad_h.scaled_add(weight, &gradient.latent);
            head_parameters.extend(gradient.parameters.into_iter().map(|g| g * weight));
        }

        let mut gradients = self.encoder.backward(&cohort.inputs, grad_h.view())?;
        gradients.extend(head_parameters);
        Ok((
            JointLoss::new(survival.loss, longitudinal_loss, missing_loss, weight),
            gradients,
        ))
    }

    /// Fits the Breslow baseline of the survival head on `cohort` with the current
    /// parameters. Call after the last optimisation step.
    pub fn compute_baseline(
        &mut self,
        cohort: &CohortView<'_>,
        size: Option<usize>,
    ) -> Result<&BaselineHazard, JointError> {
        let h = self.encode(&cohort.inputs, size)?;
        let last = last_states(h.view(), cohort.inputs.l)?;
        let events = EventBatch::new(last.view(), cohort.e.reborrow(), cohort.t.reborrow())?;
        Ok(self.survival.compute_baseline(&events, size)?)
    }

    /// Survival probability of `risk` at each horizon, from each patient's last
    /// valid state; `(patients, horizons)`.
    pub fn predict_survival(
        &self,
        inputs: &SequenceInputs<'_>,
        horizons: &[f64],
        risk: usize,
        size: Option<usize>,
    ) -> Result<Array2<f64>, JointError> {
        let h = self.encode(inputs, size)?;
        let last = last_states(h.view(), inputs.l)?;
        Ok(self.survival.predict(last.view(), horizons, risk, size)?)
    }

    /// Predicted mean change and variance of every modelled channel, or `None`
    /// when the longitudinal head is disabled.
    pub fn predict_longitudinal(
        &self,
        inputs: &SequenceInputs<'_>,
        size: Option<usize>,
    ) -> Result<Option<(Array3<f64>, Array3<f64>)>, JointError> {
        let Some(head) = &self.longitudinal else {
            return Ok(None);
        };
        let h = self.encode(inputs, size)?;
        let selection = self.channel_selection(inputs)?;
        let sequence = SequenceBatch::new(h.view(), modelled_inputs(&selection, inputs))?;
        Ok(Some(head.forward(&sequence, size)?))
    }

    /// Probability that each modelled channel is missing at the next step, or
    /// `None` when the missingness head is disabled.
    pub fn predict_missing(
        &self,
        inputs: &SequenceInputs<'_>,
        size: Option<usize>,
    ) -> Result<Option<Array3<f64>>, JointError> {
        let Some(head) = &self.missing else {
            return Ok(None);
        };
        let h = self.encode(inputs, size)?;
        let selection = self.channel_selection(inputs)?;
        let sequence = SequenceBatch::new(h.view(), modelled_inputs(&selection, inputs))?;
        Ok(Some(head.forward(&sequence, size)?))
    }

    /// Copy of the channels read by the auxiliary heads, or `None` when they read
    /// every channel.
    fn channel_selection<'a>(
        &self,
        inputs: &SequenceInputs<'a>,
    ) -> Result<Option<ChannelSelection<'a>>, ShapeError> {
        self.config
            .modelled_channels
            .as_deref()
            .map(|channels| ChannelSelection::new(inputs, channels))
            .transpose()
    }
}

fn modelled_inputs<'s>(
    selection: &'s Option<ChannelSelection<'_>>,
    inputs: &'s SequenceInputs<'_>,
) -> SequenceInputs<'s> {
    match selection {
        Some(selection) => selection.inputs(),
        None => inputs.reborrow(),
    }
}

impl<E: Serialize> JointModel<E> {
    /// Saves the model, including any computed baseline, as TOML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), JointError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

impl<E: DeserializeOwned> JointModel<E> {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, JointError> {
        let toml_string = fs::read_to_string(path)?;
        let model = toml::from_str(&toml_string)?;
        Ok(model)
    }
}

impl<E: SequenceEncoder> Parameterized for JointModel<E> {
    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        let mut parameters = self.encoder.parameters_mut();
        parameters.extend(self.survival.parameters_mut());
        if let Some(head) = &mut self.longitudinal {
            parameters.extend(head.parameters_mut());
        }
        if let Some(head) = &mut self.missing {
            parameters.extend(head.parameters_mut());
        }
        parameters
    }
}

/// State at step `l - 1` of every patient.
fn last_states(h: ArrayView3<'_, f64>, l: ArrayView1<'_, usize>) -> Result<Array2<f64>, ShapeError> {
    let mut last = Array2::zeros((h.len_of(ndarray::Axis(0)), h.len_of(ndarray::Axis(2))));
    for (b, &length) in l.iter().enumerate() {
        let step = length
            .checked_sub(1)
            .ok_or(ShapeError::EmptySequence { patient: b })?;
        last.row_mut(b).assign(&h.slice(s![b, step, ..]));
    }
    Ok(last)
}
