use super::{DISABLED, HeadArgs, HeadError, HeadGradient, Reduction, ensure_dimension};
use crate::batch::{EventBatch, batch_forward};
use crate::nn::{Mlp, log_add_exp};
use crate::optim::Parameterized;
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMutD, Axis, s};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SurvivalKind {
    DeepSurv,
    DeepHit,
    Full,
}

impl SurvivalKind {
    pub fn parse(name: &str) -> Result<Option<Self>, HeadError> {
        match name {
            DISABLED => Ok(None),
            "deepsurv" => Ok(Some(SurvivalKind::DeepSurv)),
            "deephit" => Ok(Some(SurvivalKind::DeepHit)),
            "full" => Ok(Some(SurvivalKind::Full)),
            other => Err(HeadError::UnknownVariant {
                head: "survival",
                name: other.to_string(),
            }),
        }
    }
}

/// Cumulative baseline hazard per risk, a right-continuous step function over the
/// sorted unique event/censoring times seen by [`SurvivalHead::compute_baseline`].
///
/// Stored as `ln H0` so that extreme log-risks neither overflow the risk sets nor
/// underflow the increments; `-inf` marks a zero hazard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineHazard {
    pub times: Array1<f64>,
    /// `(risks, times)`; row `k` is non-decreasing.
    pub log_cumulative: Array2<f64>,
}

impl BaselineHazard {
    /// `ln H0` at the largest stored time `<= horizon`, or `None` before the first time.
    pub fn log_cumulative_at(&self, risk_index: usize, horizon: f64) -> Option<f64> {
        let position = self
            .times
            .as_slice()
            .map(|times| times.partition_point(|&time| time <= horizon))
            .unwrap_or_else(|| self.times.iter().take_while(|&&time| time <= horizon).count());
        position
            .checked_sub(1)
            .map(|index| self.log_cumulative[[risk_index, index]])
    }

    pub fn cumulative_at(&self, risk_index: usize, horizon: f64) -> Option<f64> {
        self.log_cumulative_at(risk_index, horizon).map(f64::exp)
    }
}

/// `exp(-exp(log_risk) · H0)` evaluated from `ln H0`; a zero hazard means survival 1.
fn survival_probability(log_risk: f64, log_cumulative: f64) -> f64 {
    if log_cumulative == f64::NEG_INFINITY {
        return 1.0;
    }
    (-(log_risk + log_cumulative).exp()).exp()
}

/// DeepSurv under competing risks: one feed-forward network per risk maps the
/// latent state to a log-risk score.
///
/// The baseline hazard is only valid for the parameters it was computed with.
/// It stays `None` until [`compute_baseline`](Self::compute_baseline) runs, and
/// any mutable access to the parameters (an optimiser step) discards it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurvivalHead {
    inputdim: usize,
    outputdim: usize,
    networks: Vec<Mlp>,
    baseline: Option<BaselineHazard>,
}

impl SurvivalHead {
    /// Factory: `"deepsurv"` builds the head; `"deephit"` and `"full"` are known
    /// variants without an implementation and fail here rather than at use.
    pub fn create(
        name: &str,
        inputdim: usize,
        outputdim: usize,
        args: &HeadArgs,
        rng: &mut StdRng,
    ) -> Result<Option<Self>, HeadError> {
        match SurvivalKind::parse(name)? {
            None => Ok(None),
            Some(SurvivalKind::DeepSurv) => Self::new(inputdim, outputdim, args, rng).map(Some),
            Some(SurvivalKind::DeepHit) => Err(HeadError::NotImplemented {
                head: "survival",
                name: "deephit".to_string(),
            }),
            Some(SurvivalKind::Full) => Err(HeadError::NotImplemented {
                head: "survival",
                name: "full".to_string(),
            }),
        }
    }

    pub fn new(
        inputdim: usize,
        outputdim: usize,
        args: &HeadArgs,
        rng: &mut StdRng,
    ) -> Result<Self, HeadError> {
        args.validate("survival")?;
        if outputdim == 0 {
            return Err(HeadError::InvalidArgument {
                head: "survival",
                reason: "at least one risk must be modelled".to_string(),
            });
        }
        let networks = (0..outputdim)
            .map(|_| Mlp::new(inputdim, &args.layers, 1, args.activation, rng))
            .collect();
        Ok(Self {
            inputdim,
            outputdim,
            networks,
            baseline: None,
        })
    }

    pub fn risks(&self) -> usize {
        self.outputdim
    }

    pub fn baseline(&self) -> Option<&BaselineHazard> {
        self.baseline.as_ref()
    }

    /// Log-risk scores `(samples, risks)`.
    pub fn forward(
        &self,
        h: ArrayView2<'_, f64>,
        size: Option<usize>,
    ) -> Result<Array2<f64>, HeadError> {
        ensure_dimension("h", self.inputdim, h.ncols(), h.shape())?;
        batch_forward(h.nrows(), size, |range| Ok(self.forward_rows(h.slice(s![range, ..]))))
    }

    /// Relative risks `exp(log-risk)`.
    pub fn risk_scores(
        &self,
        h: ArrayView2<'_, f64>,
        size: Option<usize>,
    ) -> Result<Array2<f64>, HeadError> {
        Ok(self.forward(h, size)?.mapv(f64::exp))
    }

    pub fn loss(
        &self,
        batch: &EventBatch<'_>,
        size: Option<usize>,
        reduction: Reduction,
    ) -> Result<f64, HeadError> {
        let scores = self.forward(batch.h, size)?;
        let (loss, _) = partial_likelihood(scores.view(), batch.e, batch.t, reduction)?;
        Ok(loss)
    }

    pub fn loss_and_gradient(
        &self,
        batch: &EventBatch<'_>,
        reduction: Reduction,
    ) -> Result<HeadGradient<Array2<f64>>, HeadError> {
        ensure_dimension("h", self.inputdim, batch.h.ncols(), batch.h.shape())?;
        let mut latent = Array2::zeros(batch.h.raw_dim());
        let mut caches = Vec::with_capacity(self.outputdim);
        let mut scores = Array2::zeros((batch.len(), self.outputdim));
        for (k, network) in self.networks.iter().enumerate() {
            let (output, cache) = network.forward_cached(batch.h);
            scores.column_mut(k).assign(&output.column(0));
            caches.push(cache);
        }
        let (loss, grad_scores) = partial_likelihood(scores.view(), batch.e, batch.t, reduction)?;

        let mut parameters = Vec::new();
        for (k, (network, cache)) in self.networks.iter().zip(&caches).enumerate() {
            let upstream = grad_scores.slice(s![.., k..k + 1]);
            let (network_grad, grad_input) = network.backward(cache, upstream);
            parameters.extend(network_grad.into_tensors());
            latent += &grad_input;
        }
        Ok(HeadGradient {
            loss,
            parameters,
            latent,
        })
    }

    /// Fits the discrete Breslow estimator of the cumulative baseline hazard of every
    /// risk from the current scores, replacing any previously cached table.
    pub fn compute_baseline(
        &mut self,
        batch: &EventBatch<'_>,
        size: Option<usize>,
    ) -> Result<&BaselineHazard, HeadError> {
        validate_outcomes(batch.e, batch.t, self.outputdim)?;
        let scores = self.forward(batch.h, size)?;
        let order = ascending_order(batch.t);
        let groups = tie_groups(&order, batch.t);
        let times: Array1<f64> = groups.iter().map(|group| batch.t[order[group.start]]).collect();

        // ln(d_u / Σ_{t_j >= t_u} exp(s_j)), with the risk set summed in the log domain.
        let mut log_increments = Array2::from_elem((self.outputdim, groups.len()), f64::NEG_INFINITY);
        let mut log_at_risk = vec![f64::NEG_INFINITY; self.outputdim];
        for (u, group) in groups.iter().enumerate().rev() {
            let mut events = vec![0.0f64; self.outputdim];
            for &sample in &order[group.clone()] {
                for (k, total) in log_at_risk.iter_mut().enumerate() {
                    *total = log_add_exp(*total, scores[[sample, k]]);
                }
                if let Some(risk) = batch.e[sample].checked_sub(1) {
                    events[risk] += 1.0;
                }
            }
            for k in 0..self.outputdim {
                if events[k] > 0.0 {
                    if log_at_risk[k] > f64::NEG_INFINITY {
                        log_increments[[k, u]] = events[k].ln() - log_at_risk[k];
                    } else {
                        log::warn!(
                            "risk set of risk {} at time {} has zero relative risk; hazard increment dropped",
                            k + 1,
                            times[u]
                        );
                    }
                }
            }
        }
        let mut log_cumulative = log_increments;
        for mut row in log_cumulative.axis_iter_mut(Axis(0)) {
            let mut running = f64::NEG_INFINITY;
            for value in row.iter_mut() {
                running = log_add_exp(running, *value);
                *value = running;
            }
        }

        log::debug!(
            "Computed Breslow baseline over {} unique times for {} risk(s)",
            times.len(),
            self.outputdim
        );
        Ok(&*self.baseline.insert(BaselineHazard {
            times,
            log_cumulative,
        }))
    }

    /// Survival probability of risk `risk` (1-based) at each horizon:
    /// `exp(-exp(log-risk) · H0(horizon))`, `(samples, horizons)`.
    pub fn predict(
        &self,
        h: ArrayView2<'_, f64>,
        horizons: &[f64],
        risk: usize,
        size: Option<usize>,
    ) -> Result<Array2<f64>, HeadError> {
        let baseline = self.baseline.as_ref().ok_or(HeadError::BaselineNotComputed)?;
        let index = self.risk_index(risk)?;
        if let Some(horizon) = horizons.iter().find(|horizon| horizon.is_nan()) {
            return Err(HeadError::InvalidArgument {
                head: "survival",
                reason: format!("horizon {horizon} is not a number"),
            });
        }
        let hazards: Vec<Option<f64>> = horizons
            .iter()
            .map(|&horizon| baseline.log_cumulative_at(index, horizon))
            .collect();
        let scores = self.forward(h, size)?;
        Ok(Array2::from_shape_fn((h.nrows(), horizons.len()), |(n, j)| {
            match hazards[j] {
                Some(log_cumulative) => survival_probability(scores[[n, index]], log_cumulative),
                None => 1.0,
            }
        }))
    }

    /// Survival probability of risk `risk` at every stored baseline time.
    pub fn predict_curve(
        &self,
        h: ArrayView2<'_, f64>,
        risk: usize,
        size: Option<usize>,
    ) -> Result<Array2<f64>, HeadError> {
        let baseline = self.baseline.as_ref().ok_or(HeadError::BaselineNotComputed)?;
        let index = self.risk_index(risk)?;
        let scores = self.forward(h, size)?;
        let log_cumulative = baseline.log_cumulative.row(index);
        Ok(Array2::from_shape_fn((h.nrows(), log_cumulative.len()), |(n, j)| {
            survival_probability(scores[[n, index]], log_cumulative[j])
        }))
    }

    fn forward_rows(&self, h: ArrayView2<'_, f64>) -> Array2<f64> {
        let mut scores = Array2::zeros((h.nrows(), self.outputdim));
        for (k, network) in self.networks.iter().enumerate() {
            scores.column_mut(k).assign(&network.forward(h).column(0));
        }
        scores
    }

    fn risk_index(&self, risk: usize) -> Result<usize, HeadError> {
        if risk == 0 || risk > self.outputdim {
            return Err(HeadError::InvalidRisk {
                risk,
                risks: self.outputdim,
            });
        }
        Ok(risk - 1)
    }
}

impl Parameterized for SurvivalHead {
    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        if self.baseline.take().is_some() {
            log::debug!("Survival parameters changing; cached baseline hazard discarded");
        }
        self.networks
            .iter_mut()
            .flat_map(|network| network.parameters_mut())
            .collect()
    }
}

/// Negative Cox partial log-likelihood under competing risks and its gradient with
/// respect to the log-risk scores.
///
/// For every sample with event `k > 0` the loss accumulates
/// `-s_ik + log Σ_{j : t_j >= t_i} exp(s_jk)`. Rows are sorted internally by
/// decreasing time and tied times share one risk set, so the value does not depend
/// on the order of the input rows. `Mean` divides by the number of uncensored
/// samples (yielding 0 when there are none).
pub fn partial_likelihood(
    scores: ArrayView2<'_, f64>,
    e: ArrayView1<'_, usize>,
    t: ArrayView1<'_, f64>,
    reduction: Reduction,
) -> Result<(f64, Array2<f64>), HeadError> {
    let risks = scores.ncols();
    validate_outcomes(e, t, risks)?;
    let n = scores.nrows();
    let mut order = ascending_order(t);
    order.reverse();
    let groups = tie_groups(&order, t);

    let mut total = 0.0;
    let mut grad = Array2::zeros((n, risks));
    let mut log_risk_set = vec![f64::NEG_INFINITY; n];
    for k in 0..risks {
        let event = k + 1;
        // Running log-sum-exp in decreasing time; a tie group shares its final value.
        let mut running = f64::NEG_INFINITY;
        for group in &groups {
            for &sample in &order[group.clone()] {
                running = log_add_exp(running, scores[[sample, k]]);
            }
            for &sample in &order[group.clone()] {
                log_risk_set[sample] = running;
                if e[sample] == event {
                    total += running - scores[[sample, k]];
                    grad[[sample, k]] -= 1.0;
                }
            }
        }

        // d/ds_jk = Σ_{i : e_i = k, t_i <= t_j} exp(s_jk - LSE_i), accumulated in
        // increasing time as a log-sum of exp(-LSE_i).
        let mut inverse = f64::NEG_INFINITY;
        for group in groups.iter().rev() {
            for &sample in &order[group.clone()] {
                if e[sample] == event {
                    inverse = log_add_exp(inverse, -log_risk_set[sample]);
                }
            }
            for &sample in &order[group.clone()] {
                grad[[sample, k]] += (scores[[sample, k]] + inverse).exp();
            }
        }
    }

    let uncensored = e.iter().filter(|&&event| event != 0).count();
    if uncensored == 0 {
        log::debug!("Survival loss batch has no uncensored samples");
    }
    let scale = reduction.scale(uncensored);
    grad.mapv_inplace(|g| g * scale);
    Ok((total * scale, grad))
}

fn validate_outcomes(
    e: ArrayView1<'_, usize>,
    t: ArrayView1<'_, f64>,
    risks: usize,
) -> Result<(), HeadError> {
    if let Some((sample, &event)) = e.iter().enumerate().find(|(_, event)| **event > risks) {
        return Err(HeadError::InvalidEvent {
            sample,
            event,
            risks,
        });
    }
    if let Some(time) = t.iter().find(|time| !time.is_finite()) {
        return Err(HeadError::InvalidArgument {
            head: "survival",
            reason: format!("event/censoring time {time} is not finite"),
        });
    }
    Ok(())
}

/// Sample indices by increasing time; equal times keep their input order.
fn ascending_order(t: ArrayView1<'_, f64>) -> Vec<usize> {
    (0..t.len()).sorted_by(|&a, &b| t[a].total_cmp(&t[b])).collect()
}

/// Ranges of `order` holding equal times.
fn tie_groups(order: &[usize], t: ArrayView1<'_, f64>) -> Vec<Range<usize>> {
    let mut groups = Vec::new();
    let mut start = 0;
    while start < order.len() {
        let time = t[order[start]];
        let mut end = start + 1;
        while end < order.len() && t[order[end]] == time {
            end += 1;
        }
        groups.push(start..end);
        start = end;
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::Activation;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::{Rng, SeedableRng};

    fn head(hidden: usize, risks: usize, seed: u64) -> SurvivalHead {
        let mut rng = StdRng::seed_from_u64(seed);
        let args = HeadArgs {
            layers: vec![4],
            activation: Activation::Tanh,
            ..HeadArgs::default()
        };
        SurvivalHead::new(hidden, risks, &args, &mut rng).unwrap()
    }

    fn cohort(n: usize, hidden: usize, risks: usize, seed: u64) -> (Array2<f64>, Array1<usize>, Array1<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let h = Array2::from_shape_fn((n, hidden), |_| rng.gen_range(-1.0..1.0));
        let e = Array1::from_shape_fn(n, |_| rng.gen_range(0..=risks));
        // Coarse times so that ties occur.
        let t = Array1::from_shape_fn(n, |_| f64::from(rng.gen_range(1..6u8)));
        (h, e, t)
    }

    #[test]
    fn factory_rejects_unimplemented_variants_at_construction() {
        let mut rng = StdRng::seed_from_u64(0);
        let args = HeadArgs::default();
        assert!(SurvivalHead::create("deepsurv", 3, 2, &args, &mut rng).unwrap().is_some());
        assert!(SurvivalHead::create("None", 3, 2, &args, &mut rng).unwrap().is_none());
        for name in ["deephit", "full"] {
            let err = SurvivalHead::create(name, 3, 2, &args, &mut rng).unwrap_err();
            match err {
                HeadError::NotImplemented { head, name: found } => {
                    assert_eq!(head, "survival");
                    assert_eq!(found, name);
                }
                other => panic!("unexpected error {other:?}"),
            }
        }
        assert!(matches!(
            SurvivalHead::create("weibull", 3, 2, &args, &mut rng),
            Err(HeadError::UnknownVariant { head: "survival", .. })
        ));
    }

    #[test]
    fn reference_loss_for_three_samples() {
        let scores = array![[0.5, -0.2], [0.1, 0.3], [-0.4, 0.8]];
        let e = array![1usize, 0, 2];
        let t = array![5.0, 3.0, 1.0];
        // Risk 1: sample 0 is alone in its risk set. Risk 2: sample 2 sees everyone.
        let expected_sum = -0.8 + ((-0.2f64).exp() + 0.3f64.exp() + 0.8f64.exp()).ln();
        let (sum, _) = partial_likelihood(scores.view(), e.view(), t.view(), Reduction::Sum).unwrap();
        assert_abs_diff_eq!(sum, expected_sum, epsilon = 1e-12);
        assert_abs_diff_eq!(sum, 0.680_269_670_641_734_6, epsilon = 1e-12);
        let (mean, _) = partial_likelihood(scores.view(), e.view(), t.view(), Reduction::Mean).unwrap();
        assert_abs_diff_eq!(mean, expected_sum / 2.0, epsilon = 1e-12);

        // Increasing-time input with the rows permuted accordingly gives the same value.
        let reversed_scores = array![[-0.4, 0.8], [0.1, 0.3], [0.5, -0.2]];
        let reversed_e = array![2usize, 0, 1];
        let reversed_t = array![1.0, 3.0, 5.0];
        let (reversed, _) = partial_likelihood(
            reversed_scores.view(),
            reversed_e.view(),
            reversed_t.view(),
            Reduction::Mean,
        )
        .unwrap();
        assert_abs_diff_eq!(reversed, mean, epsilon = 1e-12);
    }

    #[test]
    fn loss_depends_on_the_time_ordering_of_outcomes() {
        // Same rows, but the times are reassigned: risk sets change, so must the loss.
        let scores = array![[0.5, -0.2], [0.1, 0.3], [-0.4, 0.8]];
        let e = array![1usize, 0, 2];
        let (original, _) =
            partial_likelihood(scores.view(), e.view(), array![5.0, 3.0, 1.0].view(), Reduction::Sum)
                .unwrap();
        let (swapped, _) =
            partial_likelihood(scores.view(), e.view(), array![1.0, 3.0, 5.0].view(), Reduction::Sum)
                .unwrap();
        assert!((original - swapped).abs() > 1e-6);
    }

    #[test]
    fn loss_is_invariant_to_row_permutations_with_ties() {
        let model = head(3, 2, 1);
        let (h, e, t) = cohort(12, 3, 2, 2);
        let batch = EventBatch::new(h.view(), e.view(), t.view()).unwrap();
        let reference = model.loss(&batch, None, Reduction::Mean).unwrap();

        let permutation: Vec<usize> = vec![7, 3, 11, 0, 5, 9, 1, 10, 2, 8, 6, 4];
        let h2 = h.select(Axis(0), &permutation);
        let e2 = e.select(Axis(0), &permutation);
        let t2 = t.select(Axis(0), &permutation);
        let permuted = EventBatch::new(h2.view(), e2.view(), t2.view()).unwrap();
        assert_abs_diff_eq!(
            model.loss(&permuted, Some(5), Reduction::Mean).unwrap(),
            reference,
            epsilon = 1e-10
        );
    }

    #[test]
    fn all_censored_batch_has_zero_mean_loss() {
        let model = head(2, 1, 3);
        let h = array![[0.1, 0.2], [0.3, -0.4]];
        let e = array![0usize, 0];
        let t = array![2.0, 1.0];
        let batch = EventBatch::new(h.view(), e.view(), t.view()).unwrap();
        assert_eq!(model.loss(&batch, None, Reduction::Mean).unwrap(), 0.0);
        let grad = model.loss_and_gradient(&batch, Reduction::Mean).unwrap();
        assert!(grad.latent.iter().all(|g| *g == 0.0));
    }

    #[test]
    fn event_outside_modelled_risks_is_rejected() {
        let model = head(2, 1, 4);
        let h = array![[0.1, 0.2]];
        let e = array![2usize];
        let t = array![1.0];
        let batch = EventBatch::new(h.view(), e.view(), t.view()).unwrap();
        assert!(matches!(
            model.loss(&batch, None, Reduction::Mean),
            Err(HeadError::InvalidEvent {
                sample: 0,
                event: 2,
                risks: 1
            })
        ));
    }

    #[test]
    fn gradients_match_finite_differences() {
        let mut model = head(3, 2, 5);
        let (h, e, t) = cohort(9, 3, 2, 6);
        let batch = EventBatch::new(h.view(), e.view(), t.view()).unwrap();
        let grad = model.loss_and_gradient(&batch, Reduction::Mean).unwrap();
        assert_abs_diff_eq!(
            grad.loss,
            model.loss(&batch, None, Reduction::Mean).unwrap(),
            epsilon = 1e-12
        );

        let eps = 1e-6;
        for ((n, k), analytic) in grad.latent.indexed_iter() {
            let mut plus = h.clone();
            plus[[n, k]] += eps;
            let mut minus = h.clone();
            minus[[n, k]] -= eps;
            let lp = model
                .loss(&EventBatch::new(plus.view(), e.view(), t.view()).unwrap(), None, Reduction::Mean)
                .unwrap();
            let lm = model
                .loss(&EventBatch::new(minus.view(), e.view(), t.view()).unwrap(), None, Reduction::Mean)
                .unwrap();
            assert_abs_diff_eq!(*analytic, (lp - lm) / (2.0 * eps), epsilon = 1e-6);
        }

        for (p, expected) in grad.parameters.iter().enumerate() {
            for idx in 0..expected.len() {
                let original = model.parameters_mut()[p].as_slice_mut().unwrap()[idx];
                model.parameters_mut()[p].as_slice_mut().unwrap()[idx] = original + eps;
                let lp = model.loss(&batch, None, Reduction::Mean).unwrap();
                model.parameters_mut()[p].as_slice_mut().unwrap()[idx] = original - eps;
                let lm = model.loss(&batch, None, Reduction::Mean).unwrap();
                model.parameters_mut()[p].as_slice_mut().unwrap()[idx] = original;
                assert_abs_diff_eq!(
                    expected.as_slice().unwrap()[idx],
                    (lp - lm) / (2.0 * eps),
                    epsilon = 1e-6
                );
            }
        }
    }

    #[test]
    fn breslow_matches_hand_computation() {
        let mut model = head(2, 2, 7);
        let h = array![[0.2, -0.1], [0.5, 0.4], [-0.3, 0.9], [0.0, 0.0]];
        let e = array![1usize, 2, 0, 1];
        let t = array![2.0, 1.0, 2.0, 3.0];
        let batch = EventBatch::new(h.view(), e.view(), t.view()).unwrap();
        let r = model.risk_scores(h.view(), None).unwrap();
        let baseline = model.compute_baseline(&batch, None).unwrap().clone();

        assert_eq!(baseline.times, array![1.0, 2.0, 3.0]);
        // Risk 1: events at t=2 (sample 0) and t=3 (sample 3).
        let at_risk_1_t2 = r[[0, 0]] + r[[2, 0]] + r[[3, 0]];
        let at_risk_1_t3 = r[[3, 0]];
        let expected_risk1 = [0.0, 1.0 / at_risk_1_t2, 1.0 / at_risk_1_t2 + 1.0 / at_risk_1_t3];
        // Risk 2: one event at t=1 (sample 1), everyone at risk.
        let at_risk_2_t1: f64 = r.column(1).sum();
        let expected_risk2 = [1.0 / at_risk_2_t1; 3];
        for (u, &time) in [1.0, 2.0, 3.0].iter().enumerate() {
            assert_abs_diff_eq!(baseline.cumulative_at(0, time).unwrap(), expected_risk1[u], epsilon = 1e-12);
            assert_abs_diff_eq!(baseline.cumulative_at(1, time).unwrap(), expected_risk2[u], epsilon = 1e-12);
        }
        assert_eq!(baseline.log_cumulative[[0, 0]], f64::NEG_INFINITY);
        assert_eq!(baseline.cumulative_at(0, 0.5), None);
    }

    #[test]
    fn baseline_is_non_decreasing() {
        let mut model = head(3, 3, 8);
        let (h, e, t) = cohort(40, 3, 3, 9);
        let batch = EventBatch::new(h.view(), e.view(), t.view()).unwrap();
        let baseline = model.compute_baseline(&batch, Some(7)).unwrap();
        for row in baseline.log_cumulative.rows() {
            for pair in row.windows(2) {
                assert!(pair[1] >= pair[0]);
            }
        }
        for pair in baseline.times.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn predictions_are_bounded_and_start_at_one() {
        let mut model = head(3, 2, 10);
        let (h, e, t) = cohort(30, 3, 2, 11);
        let batch = EventBatch::new(h.view(), e.view(), t.view()).unwrap();
        let first = model.compute_baseline(&batch, None).unwrap().times[0];

        let horizons = [first - 0.5, first, 2.5, 4.0, 100.0];
        let survival = model.predict(h.view(), &horizons, 2, Some(4)).unwrap();
        assert_eq!(survival.shape(), &[30, 5]);
        assert!(survival.iter().all(|p| (0.0..=1.0).contains(p)));
        assert!(survival.column(0).iter().all(|p| *p == 1.0));
        for row in survival.rows() {
            for pair in row.windows(2) {
                assert!(pair[1] <= pair[0] + 1e-15);
            }
        }

        // Beyond the last stored time the curve stays at its final value.
        let curve = model.predict_curve(h.view(), 2, None).unwrap();
        let last = curve.ncols() - 1;
        for n in 0..30 {
            assert_abs_diff_eq!(survival[[n, 4]], curve[[n, last]], epsilon = 1e-15);
        }
    }

    #[test]
    fn extreme_log_risks_keep_the_baseline_and_predictions_finite() {
        let mut model = head(2, 1, 13);
        // Push every log-risk far beyond the range of exp.
        if let Some(mut bias) = model.parameters_mut().pop() {
            bias.fill(800.0);
        }
        let h = array![[0.1, 0.2], [0.3, -0.4], [-0.5, 0.6]];
        let e = array![1usize, 0, 1];
        let t = array![1.0, 2.0, 3.0];
        let batch = EventBatch::new(h.view(), e.view(), t.view()).unwrap();
        let scores = model.forward(h.view(), None).unwrap();
        assert!(scores.iter().all(|s| *s > 700.0));

        let baseline = model.compute_baseline(&batch, None).unwrap().clone();
        let row = baseline.log_cumulative.row(0);
        assert!(row.iter().all(|v| v.is_finite()));
        let expected = -log_add_exp(log_add_exp(scores[[0, 0]], scores[[1, 0]]), scores[[2, 0]]);
        assert_abs_diff_eq!(row[0], expected, epsilon = 1e-9);
        assert!(row[2] > row[1] - 1e-12);

        let survival = model.predict(h.view(), &[0.5, 1.0, 3.0, 10.0], 1, None).unwrap();
        assert!(survival.iter().all(|p| p.is_finite() && (0.0..=1.0).contains(p)));
        assert!(survival.column(0).iter().all(|p| *p == 1.0));
        for n in 0..3 {
            assert!(survival[[n, 1]] < 1.0);
        }
        let curve = model.predict_curve(h.view(), 1, None).unwrap();
        assert!(curve.iter().all(|p| p.is_finite()));
    }

    #[test]
    fn prediction_requires_a_fresh_baseline() {
        let mut model = head(2, 1, 12);
        let h = array![[0.1, 0.2], [0.3, 0.4]];
        let e = array![1usize, 0];
        let t = array![1.0, 2.0];
        let batch = EventBatch::new(h.view(), e.view(), t.view()).unwrap();
        assert!(matches!(
            model.predict(h.view(), &[1.0], 1, None),
            Err(HeadError::BaselineNotComputed)
        ));
        model.compute_baseline(&batch, None).unwrap();
        assert!(model.predict(h.view(), &[1.0], 1, None).is_ok());
        assert!(matches!(
            model.predict(h.view(), &[1.0], 2, None),
            Err(HeadError::InvalidRisk { risk: 2, risks: 1 })
        ));
        model.parameters_mut();
        assert!(model.baseline().is_none());
    }
}
