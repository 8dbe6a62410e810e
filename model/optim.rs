use crate::batch::ShapeError;
use ndarray::{ArrayD, ArrayViewMutD, Zip};

/// Anything with trainable tensors. The order of the returned views is fixed and
/// matches the order of the gradients produced for the same component.
pub trait Parameterized {
    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>>;
}

/// Adam with optional decoupled weight decay.
#[derive(Debug, Clone)]
pub struct Adam {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    step: i32,
    first_moment: Vec<ArrayD<f64>>,
    second_moment: Vec<ArrayD<f64>>,
}

impl Adam {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
            step: 0,
            first_moment: Vec::new(),
            second_moment: Vec::new(),
        }
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn step<P>(&mut self, model: &mut P, gradients: &[ArrayD<f64>]) -> Result<(), ShapeError>
    where
        P: Parameterized + ?Sized,
    {
        let mut parameters = model.parameters_mut();
        if parameters.len() != gradients.len() {
            return Err(ShapeError::ParameterCount {
                expected: parameters.len(),
                found: gradients.len(),
            });
        }
        for (index, (parameter, gradient)) in parameters.iter().zip(gradients).enumerate() {
            if parameter.shape() != gradient.shape() {
                return Err(ShapeError::DimensionMismatch {
                    input: "gradient",
                    expected: parameter.shape().to_vec(),
                    found: gradient.shape().to_vec(),
                });
            }
            if let Some(moment) = self.first_moment.get(index) {
                if moment.shape() != gradient.shape() {
                    return Err(ShapeError::DimensionMismatch {
                        input: "optimizer state",
                        expected: moment.shape().to_vec(),
                        found: gradient.shape().to_vec(),
                    });
                }
            }
        }
        if self.first_moment.is_empty() {
            self.first_moment = gradients.iter().map(|g| ArrayD::zeros(g.raw_dim())).collect();
            self.second_moment = gradients.iter().map(|g| ArrayD::zeros(g.raw_dim())).collect();
        } else if self.first_moment.len() != gradients.len() {
            return Err(ShapeError::ParameterCount {
                expected: self.first_moment.len(),
                found: gradients.len(),
            });
        }

        self.step += 1;
        let (beta1, beta2, eps) = (self.beta1, self.beta2, self.epsilon);
        let correction1 = 1.0 - beta1.powi(self.step);
        let correction2 = 1.0 - beta2.powi(self.step);
        let lr = self.learning_rate;
        let decay = 1.0 - lr * self.weight_decay;

        for (((parameter, gradient), m), v) in parameters
            .iter_mut()
            .zip(gradients)
            .zip(self.first_moment.iter_mut())
            .zip(self.second_moment.iter_mut())
        {
            Zip::from(parameter)
                .and(gradient)
                .and(m)
                .and(v)
                .for_each(|p, &g, m, v| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / correction1;
                    let v_hat = *v / correction2;
                    *p = *p * decay - lr * m_hat / (v_hat.sqrt() + eps);
                });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, array};

    struct Quadratic {
        x: Array1<f64>,
    }

    impl Parameterized for Quadratic {
        fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
            vec![self.x.view_mut().into_dyn()]
        }
    }

    #[test]
    fn adam_descends_a_quadratic() {
        let mut model = Quadratic {
            x: array![3.0, -2.0],
        };
        let mut adam = Adam::new(0.1);
        for _ in 0..1000 {
            let grad = (&model.x * 2.0).into_dyn();
            adam.step(&mut model, &[grad]).unwrap();
        }
        assert_abs_diff_eq!(model.x[0], 0.0, epsilon = 5e-2);
        assert_abs_diff_eq!(model.x[1], 0.0, epsilon = 5e-2);
    }

    #[test]
    fn gradient_count_mismatch_is_rejected() {
        let mut model = Quadratic { x: array![1.0] };
        let err = Adam::new(0.1).step(&mut model, &[]).unwrap_err();
        assert!(matches!(
            err,
            ShapeError::ParameterCount {
                expected: 1,
                found: 0
            }
        ));
    }
}
