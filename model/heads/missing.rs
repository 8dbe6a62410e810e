use super::{DISABLED, HeadArgs, HeadError, HeadGradient, Reduction, ensure_dimension};
use crate::batch::{SequenceBatch, batch_forward};
use crate::nn::{Mlp, sigmoid};
use crate::optim::Parameterized;
use ndarray::{Array2, Array3, ArrayView3, ArrayViewMutD, Axis, s};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

const LOG_FLOOR: f64 = -100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissingKind {
    Neural,
}

impl MissingKind {
    pub fn parse(name: &str) -> Result<Option<Self>, HeadError> {
        match name {
            DISABLED => Ok(None),
            "neural" => Ok(Some(MissingKind::Neural)),
            other => Err(HeadError::UnknownVariant {
                head: "missing",
                name: other.to_string(),
            }),
        }
    }
}

/// Predicts, for each channel, the probability that it is *not* observed at the
/// next step, from the current latent state and the time elapsed until that step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingHead {
    inputdim: usize,
    outputdim: usize,
    network: Mlp,
}

impl MissingHead {
    /// Factory: `"None"` disables the task, `"neural"` builds a [`MissingHead`].
    pub fn create(
        name: &str,
        inputdim: usize,
        outputdim: usize,
        args: &HeadArgs,
        rng: &mut StdRng,
    ) -> Result<Option<Self>, HeadError> {
        match MissingKind::parse(name)? {
            None => Ok(None),
            Some(MissingKind::Neural) => Self::new(inputdim, outputdim, args, rng).map(Some),
        }
    }

    pub fn new(
        inputdim: usize,
        outputdim: usize,
        args: &HeadArgs,
        rng: &mut StdRng,
    ) -> Result<Self, HeadError> {
        args.validate("missing")?;
        // Elapsed time is informative about what gets measured, hence the extra input.
        let network = Mlp::new(inputdim + 1, &args.layers, outputdim, args.activation, rng);
        Ok(Self {
            inputdim,
            outputdim,
            network,
        })
    }

    pub fn inputdim(&self) -> usize {
        self.inputdim
    }

    pub fn outputdim(&self) -> usize {
        self.outputdim
    }

    /// Missingness probabilities of shape `(patients, T - 1, channels)`; entry `t`
    /// is the prediction for step `t + 1`.
    pub fn forward(
        &self,
        batch: &SequenceBatch<'_>,
        size: Option<usize>,
    ) -> Result<Array3<f64>, HeadError> {
        self.check(batch)?;
        batch_forward(batch.len(), size, |range| {
            let chunk = batch.slice(range);
            let logits = self.network.forward(self.design(&chunk).view());
            Ok(to_sequence(&logits, &chunk).mapv(sigmoid))
        })
    }

    pub fn loss(
        &self,
        batch: &SequenceBatch<'_>,
        size: Option<usize>,
        reduction: Reduction,
    ) -> Result<f64, HeadError> {
        let probabilities = self.forward(batch, size)?;
        let (total, count, _) = binary_cross_entropy(batch, probabilities.view());
        Ok(total * reduction.scale(count))
    }

    pub fn loss_and_gradient(
        &self,
        batch: &SequenceBatch<'_>,
        reduction: Reduction,
    ) -> Result<HeadGradient<Array3<f64>>, HeadError> {
        self.check(batch)?;
        let rows = self.design(batch);
        let (logits, cache) = self.network.forward_cached(rows.view());
        let probabilities = to_sequence(&logits, batch).mapv(sigmoid);
        let (total, count, mut grad_logits) = binary_cross_entropy(batch, probabilities.view());
        let scale = reduction.scale(count);
        grad_logits.mapv_inplace(|g| g * scale);

        let transitions = batch.transitions();
        let grad_rows = Array2::from_shape_fn(logits.raw_dim(), |(row, c)| {
            grad_logits[[row / transitions, row % transitions, c]]
        });
        let (parameters, grad_input) = self.network.backward(&cache, grad_rows.view());

        let mut latent = Array3::zeros(batch.h.raw_dim());
        for (row, grad) in grad_input.axis_iter(Axis(0)).enumerate() {
            let (b, t) = (row / transitions, row % transitions);
            latent
                .slice_mut(s![b, t, ..])
                .assign(&grad.slice(s![..self.inputdim]));
        }

        Ok(HeadGradient {
            loss: total * scale,
            parameters: parameters.into_tensors(),
            latent,
        })
    }

    fn check(&self, batch: &SequenceBatch<'_>) -> Result<(), HeadError> {
        ensure_dimension("h", self.inputdim, batch.hidden(), batch.h.shape())?;
        ensure_dimension(
            "x",
            self.outputdim,
            batch.inputs.channels(),
            batch.inputs.x.shape(),
        )
    }

    /// One row per `(patient, step)` transition: `[h[t], elapsed time to t + 1]`.
    fn design(&self, batch: &SequenceBatch<'_>) -> Array2<f64> {
        let transitions = batch.transitions();
        let mut rows = Array2::zeros((batch.len() * transitions, self.inputdim + 1));
        for b in 0..batch.len() {
            for t in 0..transitions {
                let mut row = rows.row_mut(b * transitions + t);
                row.slice_mut(s![..self.inputdim])
                    .assign(&batch.h.slice(s![b, t, ..]));
                row[self.inputdim] = elapsed_to_next(batch.inputs.i, b, t);
            }
        }
        rows
    }
}

impl Parameterized for MissingHead {
    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        self.network.parameters_mut()
    }
}

/// Smallest positive per-channel elapsed time between steps `t` and `t + 1`; at
/// least one channel was measured to produce a step, so this is the step's gap.
fn elapsed_to_next(i: ArrayView3<'_, f64>, b: usize, t: usize) -> f64 {
    i.slice(s![b, t + 1, ..])
        .iter()
        .map(|v| v.abs())
        .filter(|v| *v > 0.0)
        .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.min(v))))
        .unwrap_or(0.0)
}

fn to_sequence(rows: &Array2<f64>, batch: &SequenceBatch<'_>) -> Array3<f64> {
    let transitions = batch.transitions();
    Array3::from_shape_fn((batch.len(), transitions, rows.ncols()), |(b, t, c)| {
        rows[[b * transitions + t, c]]
    })
}

/// Weighted BCE against the missing indicator `!m[t + 1]` over valid transitions.
/// Returns the summed loss, the number of observed next values (the mean
/// reduction's denominator) and the unscaled gradient w.r.t. the logits.
fn binary_cross_entropy(
    batch: &SequenceBatch<'_>,
    probabilities: ArrayView3<'_, f64>,
) -> (f64, usize, Array3<f64>) {
    let inputs = &batch.inputs;
    let mut grad = Array3::zeros(probabilities.raw_dim());
    let mut total = 0.0;
    let mut count = 0usize;
    for ((b, t, c), &p) in probabilities.indexed_iter() {
        if !inputs.transition_valid(b, t) {
            continue;
        }
        let target = if inputs.m[[b, t + 1, c]] { 0.0 } else { 1.0 };
        let weight = inputs.alpha[b];
        let log_p = p.ln().max(LOG_FLOOR);
        let log_not_p = (1.0 - p).ln().max(LOG_FLOOR);
        total -= weight * (target * log_p + (1.0 - target) * log_not_p);
        grad[[b, t, c]] = weight * (p - target);
        if inputs.m[[b, t + 1, c]] {
            count += 1;
        }
    }
    (total, count, grad)
}
