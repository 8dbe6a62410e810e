//! Sequence encoders producing the latent state read by the prediction heads.
//!
//! The joint model only relies on [`SequenceEncoder`]: it hands the encoder the
//! aligned covariate inputs and receives `h` of shape `(patients, time, hidden)`,
//! and during training it hands back `dL/dh` to obtain the encoder's parameter
//! gradients. [`RecurrentEncoder`] is the reference implementation.

use crate::batch::ShapeError;
use crate::data::SequenceInputs;
use crate::optim::Parameterized;
use ndarray::{Array1, Array2, Array3, ArrayD, ArrayView3, ArrayViewMutD, Axis, s};
use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

pub trait SequenceEncoder: Parameterized {
    /// Number of covariate channels expected in `x`.
    fn input_dim(&self) -> usize;

    /// Width of the latent state.
    fn hidden_dim(&self) -> usize;

    fn encode(&self, inputs: &SequenceInputs<'_>) -> Result<Array3<f64>, ShapeError>;

    /// Parameter gradients (in `parameters_mut` order) given `dL/dh`.
    fn backward(
        &self,
        inputs: &SequenceInputs<'_>,
        grad_h: ArrayView3<'_, f64>,
    ) -> Result<Vec<ArrayD<f64>>, ShapeError>;
}

/// Elman cell over the step features `[x_t, m_t, i_t]`:
///
/// `h_t = tanh(u_t W_in + h_{t-1} W_rec + b)`, with `h_{-1} = 0`.
///
/// Feeding the mask and the elapsed times alongside the imputed values lets the
/// state tell measured values from carried ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurrentEncoder {
    w_in: Array2<f64>,
    w_rec: Array2<f64>,
    bias: Array1<f64>,
}

impl RecurrentEncoder {
    pub fn new(channels: usize, hidden: usize, rng: &mut StdRng) -> Self {
        let features = 3 * channels;
        let input_bound = 1.0 / (features.max(1) as f64).sqrt();
        let hidden_bound = 1.0 / (hidden.max(1) as f64).sqrt();
        Self {
            w_in: Array2::from_shape_fn((features, hidden), |_| {
                rng.gen_range(-input_bound..input_bound)
            }),
            w_rec: Array2::from_shape_fn((hidden, hidden), |_| {
                rng.gen_range(-hidden_bound..hidden_bound)
            }),
            bias: Array1::zeros(hidden),
        }
    }

    fn check(&self, inputs: &SequenceInputs<'_>) -> Result<(), ShapeError> {
        if inputs.channels() != self.input_dim() {
            let mut expected = inputs.x.shape().to_vec();
            expected[2] = self.input_dim();
            return Err(ShapeError::DimensionMismatch {
                input: "x",
                expected,
                found: inputs.x.shape().to_vec(),
            });
        }
        Ok(())
    }

    /// Step features `(patients, 3 * channels)` at time `t`.
    fn features(&self, inputs: &SequenceInputs<'_>, t: usize) -> Array2<f64> {
        let channels = inputs.channels();
        Array2::from_shape_fn((inputs.len(), 3 * channels), |(b, f)| {
            let c = f % channels;
            match f / channels {
                0 => inputs.x[[b, t, c]],
                1 => f64::from(u8::from(inputs.m[[b, t, c]])),
                _ => inputs.i[[b, t, c]],
            }
        })
    }
}

impl SequenceEncoder for RecurrentEncoder {
    fn input_dim(&self) -> usize {
        self.w_in.nrows() / 3
    }

    fn hidden_dim(&self) -> usize {
        self.w_rec.nrows()
    }

    fn encode(&self, inputs: &SequenceInputs<'_>) -> Result<Array3<f64>, ShapeError> {
        self.check(inputs)?;
        let mut states = Array3::zeros((inputs.len(), inputs.steps(), self.hidden_dim()));
        let mut previous = Array2::zeros((inputs.len(), self.hidden_dim()));
        for t in 0..inputs.steps() {
            let mut z = self.features(inputs, t).dot(&self.w_in) + previous.dot(&self.w_rec);
            z += &self.bias;
            z.mapv_inplace(f64::tanh);
            states.slice_mut(s![.., t, ..]).assign(&z);
            previous = z;
        }
        Ok(states)
    }

    fn backward(
        &self,
        inputs: &SequenceInputs<'_>,
        grad_h: ArrayView3<'_, f64>,
    ) -> Result<Vec<ArrayD<f64>>, ShapeError> {
        let states = self.encode(inputs)?;
        if grad_h.shape() != states.shape() {
            return Err(ShapeError::DimensionMismatch {
                input: "grad_h",
                expected: states.shape().to_vec(),
                found: grad_h.shape().to_vec(),
            });
        }

        let mut grad_in = Array2::zeros(self.w_in.raw_dim());
        let mut grad_rec = Array2::zeros(self.w_rec.raw_dim());
        let mut grad_bias = Array1::zeros(self.bias.raw_dim());
        let mut carried = Array2::zeros((inputs.len(), self.hidden_dim()));
        for t in (0..inputs.steps()).rev() {
            let state = states.index_axis(Axis(1), t);
            let mut dz = &grad_h.index_axis(Axis(1), t) + &carried;
            dz.zip_mut_with(&state, |g, &a| *g *= 1.0 - a * a);

            grad_in += &self.features(inputs, t).t().dot(&dz);
            if t > 0 {
                grad_rec += &states.index_axis(Axis(1), t - 1).t().dot(&dz);
            }
            grad_bias += &dz.sum_axis(Axis(0));
            carried = dz.dot(&self.w_rec.t());
        }
        Ok(vec![
            grad_in.into_dyn(),
            grad_rec.into_dyn(),
            grad_bias.into_dyn(),
        ])
    }
}

impl Parameterized for RecurrentEncoder {
    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        vec![
            self.w_in.view_mut().into_dyn(),
            self.w_rec.view_mut().into_dyn(),
            self.bias.view_mut().into_dyn(),
        ]
    }
}
