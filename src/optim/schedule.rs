//! Epoch-based learning-rate schedules
//!
//! Both schedules are pure functions of the base rate and the 0-based epoch
//! index, so resuming a run recomputes the same rate the interrupted run was
//! using. The driver applies the schedule once at every epoch start.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Learning-rate decay applied at epoch boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedule {
    /// Hold the base rate through `start_epoch`, then decay exponentially to
    /// `base * 1e-3` at the final epoch
    Exponential {
        /// Last 0-based epoch that still uses the base rate
        start_epoch: usize,
    },
    /// Multiply by `factor` at each listed epoch, keeping the product of all
    /// boundaries already passed
    Staircase {
        /// 0-based epochs at which the rate drops, in ascending order
        decay_at_epochs: Vec<usize>,
        /// Multiplier applied at each boundary, in (0, 1)
        factor: f64,
    },
}

impl LrSchedule {
    /// Rate for `epoch` (0-based) out of `total_epochs`.
    pub fn lr_at(&self, base_lr: f64, epoch: usize, total_epochs: usize) -> f64 {
        match self {
            LrSchedule::Exponential { start_epoch } => {
                if epoch <= *start_epoch {
                    base_lr
                } else {
                    let progress = (epoch - start_epoch) as f64
                        / (total_epochs - start_epoch) as f64;
                    base_lr * 1e-3f64.powf(progress)
                }
            }
            LrSchedule::Staircase {
                decay_at_epochs,
                factor,
            } => {
                let passed = decay_at_epochs.iter().filter(|&&at| at <= epoch).count();
                base_lr * factor.powi(passed as i32)
            }
        }
    }

    /// Check the schedule against the run length.
    pub fn validate(&self, total_epochs: usize) -> Result<()> {
        match self {
            LrSchedule::Exponential { start_epoch } => {
                if *start_epoch >= total_epochs {
                    return Err(Error::config(format!(
                        "exponential decay start_epoch ({start_epoch}) must be < total_epochs \
                         ({total_epochs})"
                    )));
                }
            }
            LrSchedule::Staircase {
                decay_at_epochs,
                factor,
            } => {
                if decay_at_epochs.is_empty() {
                    return Err(Error::config(
                        "staircase schedule needs at least one decay epoch",
                    ));
                }
                if !decay_at_epochs.windows(2).all(|w| w[0] < w[1]) {
                    return Err(Error::config(
                        "staircase decay epochs must be strictly ascending",
                    ));
                }
                if !(*factor > 0.0 && *factor < 1.0) {
                    return Err(Error::config(format!(
                        "staircase factor must be in (0, 1), got {factor}"
                    )));
                }
            }
        }
        Ok(())
    }
}
