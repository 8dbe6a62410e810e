//! Joint modelling of competing-risks survival with longitudinal covariates and
//! their observation process.
//!
//! A [`SequenceEncoder`] summarises each patient's irregularly sampled history
//! into latent states. Three heads read those states:
//!
//! * [`SurvivalHead`]: DeepSurv scores per risk, trained with the Cox partial
//!   likelihood, plus a Breslow baseline for survival curves.
//! * [`LongitudinalHead`]: Gaussian model of the change of every channel until
//!   the next step.
//! * [`MissingHead`]: probability that each channel goes unmeasured at the next
//!   step.
//!
//! [`JointModel`] ties them together and [`train`] fits it.

#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

pub mod batch;
pub mod config;
pub mod data;
pub mod encoder;
pub mod heads;
pub mod joint;
pub mod nn;
pub mod optim;
pub mod train;

pub use batch::{EventBatch, SequenceBatch, ShapeError, batch_forward};
pub use config::{ConfigError, HeadConfig, JointConfig, TrainingConfig};
pub use data::{ChannelSelection, Cohort, CohortView, SequenceInputs};
pub use encoder::{RecurrentEncoder, SequenceEncoder};
pub use heads::longitudinal::LongitudinalHead;
pub use heads::missing::MissingHead;
pub use heads::survival::{BaselineHazard, SurvivalHead};
pub use heads::{HeadArgs, HeadError, Reduction};
pub use joint::{JointError, JointLoss, JointModel};
pub use train::{EpochSummary, TrainingReport, train};
