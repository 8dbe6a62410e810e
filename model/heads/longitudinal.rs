use super::{DISABLED, HeadArgs, HeadError, HeadGradient, Reduction, ensure_dimension};
use crate::batch::{SequenceBatch, batch_forward};
use crate::nn::{Mlp, MlpCache, sigmoid, softplus};
use crate::optim::Parameterized;
use ndarray::{Array1, Array2, Array3, ArrayView3, ArrayViewMutD, Axis, s};
use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Lower bound applied to the predicted variance inside the likelihood.
const VARIANCE_FLOOR: f64 = 1e-6;
const LN_2PI: f64 = 1.837_877_066_409_345_3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LongitudinalKind {
    /// Conditioned on the encoder's latent state.
    Neural,
    /// Conditioned on a single learned reference vector: a smooth function of time only.
    Gaussian,
}

impl LongitudinalKind {
    pub fn parse(name: &str) -> Result<Option<Self>, HeadError> {
        match name {
            DISABLED => Ok(None),
            "neural" => Ok(Some(LongitudinalKind::Neural)),
            "gaussian" => Ok(Some(LongitudinalKind::Gaussian)),
            other => Err(HeadError::UnknownVariant {
                head: "longitudinal",
                name: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Conditioning {
    State,
    Centroid(Array1<f64>),
}

/// Predicts a Gaussian over the change of every channel between consecutive steps.
///
/// The network sees `[condition, τ_c]` where `τ_c` is the (signed) time until the
/// next measurement of channel `c`; it emits `2C` values, of which column `c` is the
/// raw mean and column `C + c` the pre-softplus variance of channel `c`. The mean
/// change is de-biased by the network's own prediction at `τ = 0`, so no change is
/// predicted when no time elapses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongitudinalHead {
    kind: LongitudinalKind,
    inputdim: usize,
    outputdim: usize,
    conditioning: Conditioning,
    network: Mlp,
}

struct Evaluation {
    rows: usize,
    output: Array2<f64>,
    cache: MlpCache,
}

impl LongitudinalHead {
    /// Factory: `"None"` disables the task; `"neural"` and `"gaussian"` build the
    /// state-conditioned and time-only variants.
    pub fn create(
        name: &str,
        inputdim: usize,
        outputdim: usize,
        args: &HeadArgs,
        rng: &mut StdRng,
    ) -> Result<Option<Self>, HeadError> {
        match LongitudinalKind::parse(name)? {
            None => Ok(None),
            Some(LongitudinalKind::Neural) => Self::neural(inputdim, outputdim, args, rng).map(Some),
            Some(LongitudinalKind::Gaussian) => {
                Self::gaussian(inputdim, outputdim, args, rng).map(Some)
            }
        }
    }

    pub fn neural(
        inputdim: usize,
        outputdim: usize,
        args: &HeadArgs,
        rng: &mut StdRng,
    ) -> Result<Self, HeadError> {
        args.validate("longitudinal")?;
        Ok(Self {
            kind: LongitudinalKind::Neural,
            inputdim,
            outputdim,
            conditioning: Conditioning::State,
            network: Mlp::new(inputdim + 1, &args.layers, 2 * outputdim, args.activation, rng),
        })
    }

    pub fn gaussian(
        inputdim: usize,
        outputdim: usize,
        args: &HeadArgs,
        rng: &mut StdRng,
    ) -> Result<Self, HeadError> {
        if args.representation == 0 {
            return Err(HeadError::InvalidArgument {
                head: "longitudinal",
                reason: "representation width must be positive".to_string(),
            });
        }
        let reference = Array1::from_shape_fn(args.representation, |_| rng.sample::<f64, _>(StandardNormal));
        Ok(Self {
            kind: LongitudinalKind::Gaussian,
            inputdim,
            outputdim,
            conditioning: Conditioning::Centroid(reference),
            network: Mlp::new(args.representation + 1, &[], 2 * outputdim, args.activation, rng),
        })
    }

    pub fn kind(&self) -> LongitudinalKind {
        self.kind
    }

    pub fn outputdim(&self) -> usize {
        self.outputdim
    }

    /// Mean change and variance, each `(patients, T - 1, channels)`; entry `t`
    /// describes `x[t + 1] - x[t]`.
    pub fn forward(
        &self,
        batch: &SequenceBatch<'_>,
        size: Option<usize>,
    ) -> Result<(Array3<f64>, Array3<f64>), HeadError> {
        self.check(batch)?;
        batch_forward(batch.len(), size, |range| {
            let chunk = batch.slice(range);
            let evaluation = self.evaluate(&chunk);
            Ok(self.split(&evaluation, &chunk))
        })
    }

    pub fn loss(
        &self,
        batch: &SequenceBatch<'_>,
        size: Option<usize>,
        reduction: Reduction,
    ) -> Result<f64, HeadError> {
        let (mean, variance) = self.forward(batch, size)?;
        let terms = gaussian_nll(batch, mean.view(), variance.view());
        Ok(terms.total * reduction.scale(terms.count))
    }

    pub fn loss_and_gradient(
        &self,
        batch: &SequenceBatch<'_>,
        reduction: Reduction,
    ) -> Result<HeadGradient<Array3<f64>>, HeadError> {
        self.check(batch)?;
        let evaluation = self.evaluate(batch);
        let (mean, variance) = self.split(&evaluation, batch);
        let terms = gaussian_nll(batch, mean.view(), variance.view());
        let scale = reduction.scale(terms.count);

        let channels = self.outputdim;
        let transitions = batch.transitions();
        let mut grad_output = Array2::zeros(evaluation.output.raw_dim());
        for ((b, t, c), &d_mean) in terms.d_mean.indexed_iter() {
            let n = b * transitions + t;
            let tau_row = n * channels + c;
            let d_var = terms.d_variance[[b, t, c]];
            grad_output[[tau_row, c]] += scale * d_mean;
            grad_output[[evaluation.rows + n, c]] -= scale * d_mean;
            grad_output[[tau_row, channels + c]] +=
                scale * d_var * sigmoid(evaluation.output[[tau_row, channels + c]]);
        }

        let (network_grad, grad_input) = self.network.backward(&evaluation.cache, grad_output.view());
        let mut parameters = network_grad.into_tensors();
        let mut latent = Array3::zeros(batch.h.raw_dim());
        match &self.conditioning {
            Conditioning::State => {
                for (row, grad) in grad_input.axis_iter(Axis(0)).enumerate() {
                    let n = if row < evaluation.rows {
                        row / channels
                    } else {
                        row - evaluation.rows
                    };
                    let mut target = latent.slice_mut(s![n / transitions, n % transitions, ..]);
                    target += &grad.slice(s![..self.inputdim]);
                }
            }
            Conditioning::Centroid(reference) => {
                let width = reference.len();
                let grad_reference = grad_input
                    .slice(s![.., ..width])
                    .sum_axis(Axis(0));
                parameters.push(grad_reference.into_dyn());
            }
        }

        Ok(HeadGradient {
            loss: terms.total * scale,
            parameters,
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

    /// Runs the network once over a stacked design: one row per
    /// `(patient, step, channel)` carrying that channel's elapsed time, followed by
    /// one row per `(patient, step)` with the elapsed time set to zero.
    fn evaluate(&self, batch: &SequenceBatch<'_>) -> Evaluation {
        let channels = self.outputdim;
        let transitions = batch.transitions();
        let steps = batch.len() * transitions;
        let rows = steps * channels;
        let width = match &self.conditioning {
            Conditioning::State => self.inputdim,
            Conditioning::Centroid(reference) => reference.len(),
        };

        let mut design = Array2::zeros((rows + steps, width + 1));
        for b in 0..batch.len() {
            for t in 0..transitions {
                let n = b * transitions + t;
                for row in (n * channels..(n + 1) * channels).chain(std::iter::once(rows + n)) {
                    let mut target = design.slice_mut(s![row, ..width]);
                    match &self.conditioning {
                        Conditioning::State => target.assign(&batch.h.slice(s![b, t, ..])),
                        Conditioning::Centroid(reference) => target.assign(reference),
                    }
                }
                for c in 0..channels {
                    design[[n * channels + c, width]] = batch.inputs.i[[b, t + 1, c]];
                }
            }
        }

        let (output, cache) = self.network.forward_cached(design.view());
        Evaluation {
            rows,
            output,
            cache,
        }
    }

    fn split(
        &self,
        evaluation: &Evaluation,
        batch: &SequenceBatch<'_>,
    ) -> (Array3<f64>, Array3<f64>) {
        let channels = self.outputdim;
        let transitions = batch.transitions();
        let shape = (batch.len(), transitions, channels);
        let output = &evaluation.output;
        let mean = Array3::from_shape_fn(shape, |(b, t, c)| {
            let n = b * transitions + t;
            output[[n * channels + c, c]] - output[[evaluation.rows + n, c]]
        });
        let variance = Array3::from_shape_fn(shape, |(b, t, c)| {
            let n = b * transitions + t;
            softplus(output[[n * channels + c, channels + c]])
        });
        (mean, variance)
    }
}

impl Parameterized for LongitudinalHead {
    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        let mut parameters = self.network.parameters_mut();
        if let Conditioning::Centroid(reference) = &mut self.conditioning {
            parameters.push(reference.view_mut().into_dyn());
        }
        parameters
    }
}

struct GaussianTerms {
    total: f64,
    count: usize,
    d_mean: Array3<f64>,
    d_variance: Array3<f64>,
}

/// Weighted Gaussian negative log-likelihood (with the normalising constant) of
/// the observed change `x[t + 1] - x[t]`, over entries observed at `t + 1` within
/// the patient's sequence.
fn gaussian_nll(
    batch: &SequenceBatch<'_>,
    mean: ArrayView3<'_, f64>,
    variance: ArrayView3<'_, f64>,
) -> GaussianTerms {
    let inputs = &batch.inputs;
    let mut terms = GaussianTerms {
        total: 0.0,
        count: 0,
        d_mean: Array3::zeros(mean.raw_dim()),
        d_variance: Array3::zeros(mean.raw_dim()),
    };
    for ((b, t, c), &mu) in mean.indexed_iter() {
        if !inputs.transition_valid(b, t) || !inputs.m[[b, t + 1, c]] {
            continue;
        }
        let weight = inputs.alpha[b];
        let diff = inputs.x[[b, t + 1, c]] - inputs.x[[b, t, c]];
        let raw_variance = variance[[b, t, c]];
        let var = raw_variance.max(VARIANCE_FLOOR);
        let residual = mu - diff;
        terms.total += weight * 0.5 * (var.ln() + residual * residual / var + LN_2PI);
        terms.d_mean[[b, t, c]] = weight * residual / var;
        if raw_variance >= VARIANCE_FLOOR {
            terms.d_variance[[b, t, c]] =
                weight * 0.5 * (1.0 / var - residual * residual / (var * var));
        }
        terms.count += 1;
    }
    terms
}
