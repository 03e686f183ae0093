//! Per-model optimizers and learning-rate schedules
//!
//! Every model in the ensemble owns one optimizer over its own trainable
//! variables. The driver collects one gradient store per model first and
//! applies every optimizer step afterwards, so a model never sees a peer
//! that already moved within the same step.

pub mod schedule;

pub use schedule::LrSchedule;

use candle_core::backprop::GradStore;
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap, SGD};

use crate::config::{OptimizerConfig, OptimizerKind};
use crate::error::Result;

enum Inner {
    AdamW(AdamW),
    Sgd(SGD),
}

/// Optimizer for one model of the ensemble.
///
/// Wraps the configured `candle` optimizer and counts applied steps, which
/// the driver reports and the tests assert on.
pub struct ModelOptimizer {
    inner: Inner,
    steps: usize,
}

impl ModelOptimizer {
    /// Build an optimizer over every trainable variable in `var_map`.
    pub fn new(var_map: &VarMap, config: &OptimizerConfig) -> Result<Self> {
        let vars = var_map.all_vars();
        let inner = match config.kind {
            OptimizerKind::AdamW { beta1, beta2, eps } => Inner::AdamW(AdamW::new(
                vars,
                ParamsAdamW {
                    lr: config.base_lr,
                    beta1,
                    beta2,
                    eps,
                    weight_decay: config.weight_decay,
                },
            )?),
            OptimizerKind::Sgd => Inner::Sgd(SGD::new(vars, config.base_lr)?),
        };
        Ok(Self { inner, steps: 0 })
    }

    /// Apply one update from a gradient store produced by `backward`.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match &mut self.inner {
            Inner::AdamW(opt) => opt.step(grads)?,
            Inner::Sgd(opt) => opt.step(grads)?,
        }
        self.steps += 1;
        Ok(())
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f64 {
        match &self.inner {
            Inner::AdamW(opt) => opt.learning_rate(),
            Inner::Sgd(opt) => opt.learning_rate(),
        }
    }

    /// Replace the learning rate, typically at an epoch boundary.
    pub fn set_learning_rate(&mut self, lr: f64) {
        match &mut self.inner {
            Inner::AdamW(opt) => opt.set_learning_rate(lr),
            Inner::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> usize {
        self.steps
    }
}

/// One optimizer per model, all sharing the same hyperparameters.
pub fn build_optimizers(
    var_maps: &[VarMap],
    config: &OptimizerConfig,
) -> Result<Vec<ModelOptimizer>> {
    var_maps
        .iter()
        .map(|vm| ModelOptimizer::new(vm, config))
        .collect()
}
