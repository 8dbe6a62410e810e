//! Batched evaluation of prediction heads.
//!
//! Every head evaluates rows independently along the leading (patient) axis, so a
//! full-cohort call and a chunked call must agree. [`batch_forward`] slices the
//! batch axis into chunks, runs the head on each chunk and concatenates the
//! outputs in order. The input bundles in this module validate alignment up front
//! so a mismatched co-input fails with a descriptive error instead of being
//! silently truncated or broadcast.

use crate::data::SequenceInputs;
use ndarray::{Array, ArrayView1, ArrayView2, ArrayView3, Axis, RemoveAxis, s};
use std::ops::Range;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShapeError {
    #[error("{input} has batch dimension {found}, expected {expected} to match {reference}")]
    BatchMismatch {
        input: &'static str,
        reference: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{input} has shape {found:?}, expected {expected:?}")]
    DimensionMismatch {
        input: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("batch size must be positive")]
    ZeroBatchSize,
    #[error("patient {patient} has sequence length {length} but only {steps} time steps exist")]
    LengthOutOfRange {
        patient: usize,
        length: usize,
        steps: usize,
    },
    #[error("channel {channel} selected but the inputs only have {channels} channels")]
    ChannelOutOfRange { channel: usize, channels: usize },
    #[error("patient {patient} has an empty sequence")]
    EmptySequence { patient: usize },
    #[error("expected {expected} parameter tensors, found {found}")]
    ParameterCount { expected: usize, found: usize },
    #[error("cannot concatenate batch outputs: {0}")]
    Concatenate(String),
}

/// Checks that a co-input has the batch length of the reference input.
pub(crate) fn ensure_batch(
    input: &'static str,
    found: usize,
    reference: &'static str,
    expected: usize,
) -> Result<(), ShapeError> {
    if found != expected {
        return Err(ShapeError::BatchMismatch {
            input,
            reference,
            expected,
            found,
        });
    }
    Ok(())
}

/// Output of a head that can be stitched back together after chunked evaluation.
pub trait BatchOutput: Sized {
    fn concat(parts: Vec<Self>) -> Result<Self, ShapeError>;
}

impl<A, D> BatchOutput for Array<A, D>
where
    A: Clone,
    D: RemoveAxis,
{
    fn concat(parts: Vec<Self>) -> Result<Self, ShapeError> {
        let views: Vec<_> = parts.iter().map(|part| part.view()).collect();
        ndarray::concatenate(Axis(0), &views).map_err(|err| ShapeError::Concatenate(err.to_string()))
    }
}

impl<A, B> BatchOutput for (A, B)
where
    A: BatchOutput,
    B: BatchOutput,
{
    fn concat(parts: Vec<Self>) -> Result<Self, ShapeError> {
        let (left, right): (Vec<A>, Vec<B>) = parts.into_iter().unzip();
        Ok((A::concat(left)?, B::concat(right)?))
    }
}

/// Runs `evaluate` on consecutive ranges of `len` rows and concatenates the results.
///
/// `batch = None` evaluates everything in one call. An empty input still calls
/// `evaluate` once with `0..0` so the output carries the right trailing shape.
pub fn batch_forward<T, E, F>(len: usize, batch: Option<usize>, mut evaluate: F) -> Result<T, E>
where
    T: BatchOutput,
    E: From<ShapeError>,
    F: FnMut(Range<usize>) -> Result<T, E>,
{
    let size = match batch {
        Some(0) => return Err(ShapeError::ZeroBatchSize.into()),
        Some(size) => size,
        None => len,
    };
    if len <= size {
        return evaluate(0..len);
    }
    let mut parts = Vec::with_capacity(len.div_ceil(size));
    for start in (0..len).step_by(size) {
        parts.push(evaluate(start..(start + size).min(len))?);
    }
    T::concat(parts).map_err(E::from)
}

/// Latent states aligned with the covariate inputs they were encoded from.
#[derive(Debug, Clone, Copy)]
pub struct SequenceBatch<'a> {
    pub h: ArrayView3<'a, f64>,
    pub inputs: SequenceInputs<'a>,
}

impl<'a> SequenceBatch<'a> {
    pub fn new(h: ArrayView3<'a, f64>, inputs: SequenceInputs<'a>) -> Result<Self, ShapeError> {
        ensure_batch("h", h.len_of(Axis(0)), "x", inputs.len())?;
        if h.len_of(Axis(1)) != inputs.steps() {
            return Err(ShapeError::DimensionMismatch {
                input: "h",
                expected: vec![inputs.len(), inputs.steps(), h.len_of(Axis(2))],
                found: h.shape().to_vec(),
            });
        }
        Ok(Self { h, inputs })
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn hidden(&self) -> usize {
        self.h.len_of(Axis(2))
    }

    /// Number of step-to-step transitions, i.e. `T - 1` (or zero for empty sequences).
    pub fn transitions(&self) -> usize {
        self.inputs.steps().saturating_sub(1)
    }

    pub fn slice(&self, range: Range<usize>) -> SequenceBatch<'a> {
        SequenceBatch {
            h: self.h.slice_move(s![range.clone(), .., ..]),
            inputs: self.inputs.slice(range),
        }
    }
}

/// One row per patient: the latent state used for survival, the event indicator
/// and the event/censoring time.
#[derive(Debug, Clone, Copy)]
pub struct EventBatch<'a> {
    pub h: ArrayView2<'a, f64>,
    pub e: ArrayView1<'a, usize>,
    pub t: ArrayView1<'a, f64>,
}

impl<'a> EventBatch<'a> {
    pub fn new(
        h: ArrayView2<'a, f64>,
        e: ArrayView1<'a, usize>,
        t: ArrayView1<'a, f64>,
    ) -> Result<Self, ShapeError> {
        ensure_batch("e", e.len(), "h", h.nrows())?;
        ensure_batch("t", t.len(), "h", h.nrows())?;
        Ok(Self { h, e, t })
    }

    pub fn len(&self) -> usize {
        self.h.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn slice(&self, range: Range<usize>) -> EventBatch<'a> {
        EventBatch {
            h: self.h.slice_move(s![range.clone(), ..]),
            e: self.e.slice_move(s![range.clone()]),
            t: self.t.slice_move(s![range]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2, array};

    #[test]
    fn chunked_evaluation_concatenates_in_order() {
        let rows = Array2::from_shape_fn((7, 2), |(r, c)| (r * 10 + c) as f64);
        let full: Array2<f64> =
            batch_forward::<_, ShapeError, _>(7, None, |r| Ok(rows.slice(s![r, ..]).mapv(|v| v * 2.0)))
                .unwrap();
        for size in 1..=8 {
            let chunked: Array2<f64> =
                batch_forward::<_, ShapeError, _>(7, Some(size), |r| {
                    Ok(rows.slice(s![r, ..]).mapv(|v| v * 2.0))
                })
                .unwrap();
            assert_eq!(chunked, full);
        }
    }

    #[test]
    fn pairs_are_concatenated_componentwise() {
        let values = Array1::from_vec(vec![1.0, 2.0, 3.0]);
        let (a, b): (Array1<f64>, Array1<f64>) =
            batch_forward::<_, ShapeError, _>(3, Some(2), |r| {
                let part = values.slice(s![r]).to_owned();
                Ok((part.clone(), part.mapv(|v| -v)))
            })
            .unwrap();
        assert_eq!(a, values);
        assert_eq!(b, array![-1.0, -2.0, -3.0]);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = batch_forward::<Array1<f64>, ShapeError, _>(3, Some(0), |_| Ok(Array1::zeros(0)))
            .unwrap_err();
        assert!(matches!(err, ShapeError::ZeroBatchSize));
    }

    #[test]
    fn event_batch_rejects_misaligned_inputs() {
        let h = Array2::<f64>::zeros((3, 2));
        let e = array![1usize, 0];
        let t = array![1.0, 2.0, 3.0];
        let err = EventBatch::new(h.view(), e.view(), t.view()).unwrap_err();
        match err {
            ShapeError::BatchMismatch {
                input,
                expected,
                found,
                ..
            } => {
                assert_eq!(input, "e");
                assert_eq!(expected, 3);
                assert_eq!(found, 2);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
