use ndarray::{Array1, Array2, ArrayView2, ArrayViewMutD, Axis};
use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// Non-linearity inserted between the hidden layers of an [`Mlp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Activation {
    #[default]
    ReLU6,
    ReLU,
    Tanh,
}

impl Activation {
    #[inline]
    fn apply(self, z: f64) -> f64 {
        match self {
            Activation::ReLU6 => z.clamp(0.0, 6.0),
            Activation::ReLU => z.max(0.0),
            Activation::Tanh => z.tanh(),
        }
    }

    /// Derivative with respect to the pre-activation `z`.
    #[inline]
    fn derivative(self, z: f64) -> f64 {
        match self {
            Activation::ReLU6 => {
                if z > 0.0 && z < 6.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::ReLU => {
                if z > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::Tanh => {
                let a = z.tanh();
                1.0 - a * a
            }
        }
    }
}

/// Fully connected layer storing its weight as `(input, output)` so that a batch of
/// row vectors maps through a single `rows.dot(&weight)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dense {
    pub weight: Array2<f64>,
    pub bias: Array1<f64>,
}

impl Dense {
    fn new(input_dim: usize, output_dim: usize, rng: &mut StdRng) -> Self {
        let bound = 1.0 / (input_dim.max(1) as f64).sqrt();
        Self {
            weight: Array2::from_shape_fn((input_dim, output_dim), |_| {
                rng.gen_range(-bound..bound)
            }),
            bias: Array1::from_shape_fn(output_dim, |_| rng.gen_range(-bound..bound)),
        }
    }
}

/// Feed-forward network: `Linear -> act -> ... -> Linear`, without an activation on
/// the output layer. An empty hidden list yields a single affine map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mlp {
    layers: Vec<Dense>,
    activation: Activation,
}

/// Intermediate values retained by [`Mlp::forward_cached`] for the backward pass.
#[derive(Debug, Clone)]
pub struct MlpCache {
    inputs: Vec<Array2<f64>>,
    pre_activations: Vec<Array2<f64>>,
}

/// Parameter gradients of an [`Mlp`], one entry per layer.
#[derive(Debug, Clone)]
pub struct MlpGradient {
    pub weights: Vec<Array2<f64>>,
    pub biases: Vec<Array1<f64>>,
}

impl MlpGradient {
    /// Flattens into the order used by [`Mlp::parameters_mut`].
    pub fn into_tensors(self) -> Vec<ndarray::ArrayD<f64>> {
        self.weights
            .into_iter()
            .zip(self.biases)
            .flat_map(|(w, b)| [w.into_dyn(), b.into_dyn()])
            .collect()
    }
}

impl Mlp {
    pub fn new(
        input_dim: usize,
        hidden: &[usize],
        output_dim: usize,
        activation: Activation,
        rng: &mut StdRng,
    ) -> Self {
        let mut layers = Vec::with_capacity(hidden.len() + 1);
        let mut previous = input_dim;
        for &width in hidden.iter().chain(std::iter::once(&output_dim)) {
            layers.push(Dense::new(previous, width, rng));
            previous = width;
        }
        Self { layers, activation }
    }

    pub fn input_dim(&self) -> usize {
        self.layers.first().map_or(0, |layer| layer.weight.nrows())
    }

    pub fn output_dim(&self) -> usize {
        self.layers.last().map_or(0, |layer| layer.weight.ncols())
    }

    pub fn forward(&self, rows: ArrayView2<'_, f64>) -> Array2<f64> {
        let last = self.layers.len() - 1;
        let mut current = rows.to_owned();
        for (k, layer) in self.layers.iter().enumerate() {
            let mut z = current.dot(&layer.weight);
            z += &layer.bias;
            if k < last {
                z.mapv_inplace(|v| self.activation.apply(v));
            }
            current = z;
        }
        current
    }

    pub fn forward_cached(&self, rows: ArrayView2<'_, f64>) -> (Array2<f64>, MlpCache) {
        let last = self.layers.len() - 1;
        let mut cache = MlpCache {
            inputs: Vec::with_capacity(self.layers.len()),
            pre_activations: Vec::with_capacity(self.layers.len()),
        };
        let mut current = rows.to_owned();
        for (k, layer) in self.layers.iter().enumerate() {
            let mut z = current.dot(&layer.weight);
            z += &layer.bias;
            cache.inputs.push(current);
            current = if k < last {
                let activated = z.mapv(|v| self.activation.apply(v));
                cache.pre_activations.push(z);
                activated
            } else {
                cache.pre_activations.push(z.clone());
                z
            };
        }
        (current, cache)
    }

    /// Back-propagates `grad_output` (same shape as the forward output) and returns
    /// the parameter gradients together with the gradient w.r.t. the input rows.
    pub fn backward(
        &self,
        cache: &MlpCache,
        grad_output: ArrayView2<'_, f64>,
    ) -> (MlpGradient, Array2<f64>) {
        let depth = self.layers.len();
        let mut weights = vec![Array2::zeros((0, 0)); depth];
        let mut biases = vec![Array1::zeros(0); depth];
        let mut grad = grad_output.to_owned();
        for k in (0..depth).rev() {
            if k + 1 < depth {
                grad.zip_mut_with(&cache.pre_activations[k], |g, &z| {
                    *g *= self.activation.derivative(z)
                });
            }
            weights[k] = cache.inputs[k].t().dot(&grad).as_standard_layout().into_owned();
            biases[k] = grad.sum_axis(Axis(0));
            grad = grad.dot(&self.layers[k].weight.t());
        }
        (MlpGradient { weights, biases }, grad)
    }

    pub fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        self.layers
            .iter_mut()
            .flat_map(|layer| {
                [
                    layer.weight.view_mut().into_dyn(),
                    layer.bias.view_mut().into_dyn(),
                ]
            })
            .collect()
    }
}

pub fn softplus(x: f64) -> f64 {
    if x.is_infinite() {
        if x.is_sign_positive() { x } else { 0.0 }
    } else if x > 20.0 {
        x
    } else if x < -20.0 {
        x.exp().ln_1p()
    } else {
        (1.0 + x.exp()).ln()
    }
}

pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let exp_x = x.exp();
        exp_x / (1.0 + exp_x)
    }
}

/// `ln(exp(a) + exp(b))` without overflow; `-inf` is the identity element.
pub fn log_add_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    hi + (lo - hi).exp().ln_1p()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn empty_hidden_list_is_affine() {
        let mut rng = StdRng::seed_from_u64(3);
        let net = Mlp::new(3, &[], 2, Activation::ReLU6, &mut rng);
        assert_eq!(net.input_dim(), 3);
        assert_eq!(net.output_dim(), 2);
        let a = net.forward(array![[1.0, 2.0, 3.0]].view());
        let b = net.forward(array![[2.0, 4.0, 6.0]].view());
        let zero = net.forward(array![[0.0, 0.0, 0.0]].view());
        for j in 0..2 {
            assert_abs_diff_eq!(b[[0, j]] - zero[[0, j]], 2.0 * (a[[0, j]] - zero[[0, j]]), epsilon = 1e-12);
        }
    }

    #[test]
    fn backward_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut net = Mlp::new(3, &[4, 3], 2, Activation::Tanh, &mut rng);
        let rows = array![[0.3, -0.1, 0.7], [-0.5, 0.2, 0.1]];
        let upstream = array![[1.0, -0.5], [0.25, 2.0]];
        let objective = |net: &Mlp, rows: &Array2<f64>| (net.forward(rows.view()) * &upstream).sum();

        let (_, cache) = net.forward_cached(rows.view());
        let (grads, grad_input) = net.backward(&cache, upstream.view());
        let analytic = grads.into_tensors();

        let eps = 1e-6;
        for (p, expected) in analytic.iter().enumerate() {
            for idx in 0..expected.len() {
                let original = net.parameters_mut()[p].as_slice_mut().unwrap()[idx];
                net.parameters_mut()[p].as_slice_mut().unwrap()[idx] = original + eps;
                let plus = objective(&net, &rows);
                net.parameters_mut()[p].as_slice_mut().unwrap()[idx] = original - eps;
                let minus = objective(&net, &rows);
                net.parameters_mut()[p].as_slice_mut().unwrap()[idx] = original;
                let numeric = (plus - minus) / (2.0 * eps);
                assert_abs_diff_eq!(expected.as_slice().unwrap()[idx], numeric, epsilon = 1e-6);
            }
        }

        for r in 0..rows.nrows() {
            for c in 0..rows.ncols() {
                let mut plus = rows.clone();
                plus[[r, c]] += eps;
                let mut minus = rows.clone();
                minus[[r, c]] -= eps;
                let numeric = (objective(&net, &plus) - objective(&net, &minus)) / (2.0 * eps);
                assert_abs_diff_eq!(grad_input[[r, c]], numeric, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn parameter_gradients_are_row_major() {
        let mut rng = StdRng::seed_from_u64(5);
        let net = Mlp::new(1, &[3], 2, Activation::ReLU6, &mut rng);
        // A single input column and several rows make the weight gradient a transposed product.
        let rows = Array2::from_shape_fn((6, 1), |(r, _)| r as f64 * 0.1);
        let upstream = Array2::ones((6, 2));
        let (_, cache) = net.forward_cached(rows.view());
        let (grads, _) = net.backward(&cache, upstream.view());
        for tensor in grads.into_tensors() {
            assert!(tensor.is_standard_layout());
            assert!(tensor.as_slice().is_some());
        }
    }

    #[test]
    fn stable_scalar_helpers() {
        assert_abs_diff_eq!(softplus(0.0), 2f64.ln(), epsilon = 1e-12);
        assert!(softplus(-800.0) >= 0.0);
        assert_eq!(softplus(800.0), 800.0);
        assert_abs_diff_eq!(sigmoid(0.0), 0.5, epsilon = 1e-12);
        assert!(sigmoid(-800.0) >= 0.0);
        assert_abs_diff_eq!(log_add_exp(1000.0, 1000.0), 1000.0 + 2f64.ln(), epsilon = 1e-9);
        assert_eq!(log_add_exp(f64::NEG_INFINITY, 1.5), 1.5);
    }
}
