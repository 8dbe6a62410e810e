//! Mini-batch training of a [`JointModel`] with early stopping.
//!
//! The cohort is split once, with the configured seed, into a training and a
//! validation part. Every epoch reshuffles the training patients, takes one Adam
//! step per mini-batch on the joint loss and then evaluates the validation loss.
//! The parameters with the lowest validation loss are restored at the end and the
//! survival baseline is fitted on the training patients.

use crate::data::Cohort;
use crate::encoder::SequenceEncoder;
use crate::joint::{JointError, JointModel};
use crate::optim::Adam;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    /// Patient-weighted mean of the mini-batch losses.
    pub train_loss: f64,
    pub validation_loss: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub epochs: Vec<EpochSummary>,
    /// Epoch whose parameters were restored; 0 means the initial parameters.
    pub best_epoch: usize,
    pub best_validation_loss: f64,
    pub stopped_early: bool,
}

/// Trains `model` on `cohort` using the `[training]` section of its configuration.
///
/// With a validation fraction of 0, or a cohort too small to hold out a patient,
/// the training patients double as the validation set.
pub fn train<E>(model: &mut JointModel<E>, cohort: &Cohort) -> Result<TrainingReport, JointError>
where
    E: SequenceEncoder + Clone,
{
    if cohort.is_empty() {
        return Err(JointError::EmptyCohort);
    }
    let settings = model.config().training.clone();
    let mut rng = StdRng::seed_from_u64(model.config().seed);

    let mut patients: Vec<usize> = (0..cohort.len()).collect();
    patients.shuffle(&mut rng);
    let held_out = validation_size(cohort.len(), settings.validation_fraction);
    let (validation_ids, training_ids) = patients.split_at(held_out);
    let training = cohort.select(training_ids);
    let validation = if validation_ids.is_empty() {
        training.clone()
    } else {
        cohort.select(validation_ids)
    };
    log::info!(
        "Training on {} patients, validating on {} ({} risk(s), weight {})",
        training.len(),
        validation.len(),
        model.config().risks,
        model.config().weight
    );

    let mut optimizer = Adam::new(settings.lr).with_weight_decay(settings.weight_decay);
    let mut best_validation_loss = model.loss(&validation.view(), Some(settings.batch))?.total;
    if !best_validation_loss.is_finite() {
        return Err(JointError::Diverged {
            epoch: 0,
            loss: best_validation_loss,
        });
    }
    let mut best = model.clone();
    let mut best_epoch = 0;
    let mut stale = 0;
    let mut stopped_early = false;
    let mut epochs = Vec::new();

    let mut order: Vec<usize> = (0..training.len()).collect();
    for epoch in 1..=settings.epochs {
        order.shuffle(&mut rng);
        let mut weighted_loss = 0.0;
        for (step, chunk) in order.chunks(settings.batch).enumerate() {
            let batch = training.select(chunk);
            let (loss, gradients) = model.loss_and_gradient(&batch.view())?;
            if !loss.total.is_finite() {
                return Err(JointError::Diverged {
                    epoch,
                    loss: loss.total,
                });
            }
            optimizer.step(&mut *model, &gradients)?;
            weighted_loss += loss.total * chunk.len() as f64;
            log::debug!(
                "epoch {epoch} batch {step}: total {:.6} (survival {:.6}, longitudinal {:.6}, missing {:.6})",
                loss.total,
                loss.survival,
                loss.longitudinal,
                loss.missing
            );
        }

        let train_loss = weighted_loss / training.len() as f64;
        let validation_loss = model.loss(&validation.view(), Some(settings.batch))?.total;
        if !validation_loss.is_finite() {
            return Err(JointError::Diverged {
                epoch,
                loss: validation_loss,
            });
        }
        log::info!(
            "Epoch {epoch}: train loss {train_loss:.6}, validation loss {validation_loss:.6}"
        );
        epochs.push(EpochSummary {
            epoch,
            train_loss,
            validation_loss,
        });

        if validation_loss < best_validation_loss {
            best_validation_loss = validation_loss;
            best = model.clone();
            best_epoch = epoch;
            stale = 0;
        } else {
            stale += 1;
            if stale >= settings.patience {
                log::info!(
                    "No validation improvement for {stale} epochs; stopping after epoch {epoch}"
                );
                stopped_early = true;
                break;
            }
        }
    }

    *model = best;
    log::info!("Restored parameters of epoch {best_epoch} (validation loss {best_validation_loss:.6})");
    model.compute_baseline(&training.view(), Some(settings.batch))?;

    Ok(TrainingReport {
        epochs,
        best_epoch,
        best_validation_loss,
        stopped_early,
    })
}

/// Number of patients held out; always leaves at least one for training.
fn validation_size(patients: usize, fraction: f64) -> usize {
    let requested = (patients as f64 * fraction).round() as usize;
    requested.min(patients.saturating_sub(1))
}
