use crate::batch::{ShapeError, ensure_batch};
use ndarray::{Array1, Array3, ArrayView1, ArrayView3, Axis, s};
use std::ops::Range;

/// Aligned covariate inputs for a batch of patients.
///
/// * `x`: covariates `(patients, time, channels)`; unobserved entries hold an
///   imputed value, never NaN.
/// * `m`: observation mask, `true` where the value was actually measured.
/// * `i`: per-channel time elapsed since the previous step.
/// * `l`: number of valid (non-padded) steps per patient.
/// * `alpha`: per-patient loss weight.
#[derive(Debug, Clone, Copy)]
pub struct SequenceInputs<'a> {
    pub x: ArrayView3<'a, f64>,
    pub m: ArrayView3<'a, bool>,
    pub i: ArrayView3<'a, f64>,
    pub l: ArrayView1<'a, usize>,
    pub alpha: ArrayView1<'a, f64>,
}

impl<'a> SequenceInputs<'a> {
    pub fn new(
        x: ArrayView3<'a, f64>,
        m: ArrayView3<'a, bool>,
        i: ArrayView3<'a, f64>,
        l: ArrayView1<'a, usize>,
        alpha: ArrayView1<'a, f64>,
    ) -> Result<Self, ShapeError> {
        let patients = x.len_of(Axis(0));
        ensure_batch("m", m.len_of(Axis(0)), "x", patients)?;
        ensure_batch("i", i.len_of(Axis(0)), "x", patients)?;
        ensure_batch("l", l.len(), "x", patients)?;
        ensure_batch("alpha", alpha.len(), "x", patients)?;
        if m.shape() != x.shape() {
            return Err(ShapeError::DimensionMismatch {
                input: "m",
                expected: x.shape().to_vec(),
                found: m.shape().to_vec(),
            });
        }
        if i.shape() != x.shape() {
            return Err(ShapeError::DimensionMismatch {
                input: "i",
                expected: x.shape().to_vec(),
                found: i.shape().to_vec(),
            });
        }
        let steps = x.len_of(Axis(1));
        if let Some((patient, &length)) = l.iter().enumerate().find(|(_, length)| **length > steps) {
            return Err(ShapeError::LengthOutOfRange {
                patient,
                length,
                steps,
            });
        }
        Ok(Self { x, m, i, l, alpha })
    }

    pub fn len(&self) -> usize {
        self.x.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn steps(&self) -> usize {
        self.x.len_of(Axis(1))
    }

    pub fn channels(&self) -> usize {
        self.x.len_of(Axis(2))
    }

    /// Whether the transition from step `t` to `t + 1` lies inside patient `b`'s sequence.
    #[inline]
    pub fn transition_valid(&self, b: usize, t: usize) -> bool {
        t + 1 < self.l[b]
    }

    /// Shortens the borrow so the inputs can be paired with locally owned states.
    pub fn reborrow(&self) -> SequenceInputs<'_> {
        SequenceInputs {
            x: self.x.reborrow(),
            m: self.m.reborrow(),
            i: self.i.reborrow(),
            l: self.l.reborrow(),
            alpha: self.alpha.reborrow(),
        }
    }

    pub fn slice(&self, range: Range<usize>) -> SequenceInputs<'a> {
        SequenceInputs {
            x: self.x.slice_move(s![range.clone(), .., ..]),
            m: self.m.slice_move(s![range.clone(), .., ..]),
            i: self.i.slice_move(s![range.clone(), .., ..]),
            l: self.l.slice_move(s![range.clone()]),
            alpha: self.alpha.slice_move(s![range]),
        }
    }
}

/// Owned copy of a subset of channels of [`SequenceInputs`]; lengths and weights
/// stay borrowed.
#[derive(Debug, Clone)]
pub struct ChannelSelection<'a> {
    x: Array3<f64>,
    m: Array3<bool>,
    i: Array3<f64>,
    l: ArrayView1<'a, usize>,
    alpha: ArrayView1<'a, f64>,
}

impl<'a> ChannelSelection<'a> {
    /// Copies `channels`, in the given order. Every index must be below
    /// `inputs.channels()`.
    pub fn new(inputs: &SequenceInputs<'a>, channels: &[usize]) -> Result<Self, ShapeError> {
        if let Some(&channel) = channels.iter().find(|&&c| c >= inputs.channels()) {
            return Err(ShapeError::ChannelOutOfRange {
                channel,
                channels: inputs.channels(),
            });
        }
        Ok(Self {
            x: inputs.x.select(Axis(2), channels),
            m: inputs.m.select(Axis(2), channels),
            i: inputs.i.select(Axis(2), channels),
            l: inputs.l,
            alpha: inputs.alpha,
        })
    }

    pub fn inputs(&self) -> SequenceInputs<'_> {
        SequenceInputs {
            x: self.x.view(),
            m: self.m.view(),
            i: self.i.view(),
            l: self.l.reborrow(),
            alpha: self.alpha.reborrow(),
        }
    }
}

/// Sequence inputs plus the survival outcome of each patient.
#[derive(Debug, Clone, Copy)]
pub struct CohortView<'a> {
    pub inputs: SequenceInputs<'a>,
    pub e: ArrayView1<'a, usize>,
    pub t: ArrayView1<'a, f64>,
}

impl<'a> CohortView<'a> {
    pub fn new(
        inputs: SequenceInputs<'a>,
        e: ArrayView1<'a, usize>,
        t: ArrayView1<'a, f64>,
    ) -> Result<Self, ShapeError> {
        ensure_batch("e", e.len(), "x", inputs.len())?;
        ensure_batch("t", t.len(), "x", inputs.len())?;
        Ok(Self { inputs, e, t })
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// Owned cohort used by the training loop.
#[derive(Debug, Clone)]
pub struct Cohort {
    pub x: Array3<f64>,
    pub m: Array3<bool>,
    pub i: Array3<f64>,
    pub l: Array1<usize>,
    pub alpha: Array1<f64>,
    pub e: Array1<usize>,
    pub t: Array1<f64>,
}

impl Cohort {
    pub fn new(
        x: Array3<f64>,
        m: Array3<bool>,
        i: Array3<f64>,
        l: Array1<usize>,
        alpha: Array1<f64>,
        e: Array1<usize>,
        t: Array1<f64>,
    ) -> Result<Self, ShapeError> {
        let inputs = SequenceInputs::new(x.view(), m.view(), i.view(), l.view(), alpha.view())?;
        CohortView::new(inputs, e.view(), t.view())?;
        Ok(Self {
            x,
            m,
            i,
            l,
            alpha,
            e,
            t,
        })
    }

    pub fn len(&self) -> usize {
        self.x.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn inputs(&self) -> SequenceInputs<'_> {
        SequenceInputs {
            x: self.x.view(),
            m: self.m.view(),
            i: self.i.view(),
            l: self.l.view(),
            alpha: self.alpha.view(),
        }
    }

    pub fn view(&self) -> CohortView<'_> {
        CohortView {
            inputs: self.inputs(),
            e: self.e.view(),
            t: self.t.view(),
        }
    }

    /// Copies the given patients, in the given order, into a new cohort.
    pub fn select(&self, patients: &[usize]) -> Cohort {
        Cohort {
            x: self.x.select(Axis(0), patients),
            m: self.m.select(Axis(0), patients),
            i: self.i.select(Axis(0), patients),
            l: self.l.select(Axis(0), patients),
            alpha: self.alpha.select(Axis(0), patients),
            e: self.e.select(Axis(0), patients),
            t: self.t.select(Axis(0), patients),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn mask_shape_must_match_covariates() {
        let x = Array3::<f64>::zeros((2, 3, 2));
        let m = Array3::<bool>::from_elem((2, 3, 1), true);
        let i = Array3::<f64>::zeros((2, 3, 2));
        let l = array![3usize, 2];
        let alpha = array![1.0, 1.0];
        let err = SequenceInputs::new(x.view(), m.view(), i.view(), l.view(), alpha.view())
            .unwrap_err();
        assert!(matches!(err, ShapeError::DimensionMismatch { input: "m", .. }));
    }

    #[test]
    fn sequence_length_cannot_exceed_steps() {
        let x = Array3::<f64>::zeros((2, 3, 1));
        let m = Array3::<bool>::from_elem((2, 3, 1), true);
        let l = array![3usize, 4];
        let alpha = array![1.0, 1.0];
        let err = SequenceInputs::new(x.view(), m.view(), x.view(), l.view(), alpha.view())
            .unwrap_err();
        assert!(matches!(
            err,
            ShapeError::LengthOutOfRange {
                patient: 1,
                length: 4,
                steps: 3
            }
        ));
    }

    #[test]
    fn channel_selection_keeps_the_named_channels() {
        let x = Array3::from_shape_fn((2, 3, 4), |(b, t, c)| (100 * b + 10 * t + c) as f64);
        let m = Array3::from_shape_fn((2, 3, 4), |(_, _, c)| c % 2 == 0);
        let i = Array3::from_shape_fn((2, 3, 4), |(_, t, c)| (t * c) as f64);
        let l = array![3usize, 2];
        let alpha = array![1.0, 0.5];
        let inputs = SequenceInputs::new(x.view(), m.view(), i.view(), l.view(), alpha.view())
            .unwrap();

        let selection = ChannelSelection::new(&inputs, &[2, 0]).unwrap();
        let picked = selection.inputs();
        assert_eq!(picked.channels(), 2);
        assert_eq!(picked.x[[1, 2, 0]], 122.0);
        assert_eq!(picked.x[[1, 2, 1]], 120.0);
        assert!(picked.m[[0, 0, 0]] && picked.m[[0, 0, 1]]);
        assert_eq!(picked.i[[0, 2, 0]], 4.0);
        assert_eq!(picked.l, l);
        assert_eq!(picked.alpha, alpha);

        assert!(matches!(
            ChannelSelection::new(&inputs, &[1, 4]),
            Err(ShapeError::ChannelOutOfRange {
                channel: 4,
                channels: 4
            })
        ));
    }

    /// States built inside a function can be paired with inputs borrowed from outside.
    fn batch_with_local_states(inputs: &SequenceInputs<'_>, hidden: usize) -> usize {
        let h = Array3::zeros((inputs.len(), inputs.steps(), hidden));
        let batch = crate::batch::SequenceBatch::new(h.view(), inputs.reborrow()).unwrap();
        batch.hidden()
    }

    #[test]
    fn reborrowed_inputs_pair_with_local_states() {
        let x = Array3::<f64>::zeros((2, 3, 1));
        let m = Array3::<bool>::from_elem((2, 3, 1), true);
        let l = array![3usize, 1];
        let alpha = array![1.0, 1.0];
        let inputs = SequenceInputs::new(x.view(), m.view(), x.view(), l.view(), alpha.view())
            .unwrap();
        assert_eq!(batch_with_local_states(&inputs, 4), 4);
        assert_eq!(inputs.reborrow().l, l);
    }

    #[test]
    fn select_keeps_rows_aligned() {
        let x = Array3::from_shape_fn((3, 2, 1), |(b, t, _)| (10 * b + t) as f64);
        let cohort = Cohort::new(
            x.clone(),
            Array3::from_elem((3, 2, 1), true),
            Array3::zeros((3, 2, 1)),
            array![2, 1, 2],
            array![1.0, 2.0, 3.0],
            array![0, 1, 2],
            array![5.0, 3.0, 1.0],
        )
        .unwrap();
        let picked = cohort.select(&[2, 0]);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked.x[[0, 1, 0]], 21.0);
        assert_eq!(picked.e, array![2, 0]);
        assert_eq!(picked.t, array![1.0, 5.0]);
        assert_eq!(picked.l, array![2, 2]);
        assert_eq!(picked.alpha, array![3.0, 1.0]);
    }
}
