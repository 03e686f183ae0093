//! AlignReID - mutual learning for person re-identification embeddings
//!
//! This crate trains an ensemble of re-identification models jointly:
//! each model learns from hard-mined triplet losses over its global and
//! local features plus an identity classifier, while mutual-learning
//! regularizers pull the models' class probabilities and pairwise distance
//! structures toward each other. All models step in lockstep on the same
//! batch; peer tensors are detached, so each term only trains the model
//! that owns it.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod data;
pub mod error;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod trainer;

// Re-exports
pub use config::{EnabledTerms, TrainConfig};
pub use error::{Error, Result};
pub use loss::{MarginMode, TripletLoss};
pub use model::{LinearEmbedder, ModelOutput, ReidModel};
pub use trainer::{ReidTrainer, TrainEvent, TrainReport};

use tracing::debug;

use crate::data::SyntheticSource;
use crate::metrics::MetricsSink;

/// Assemble a ready-to-run trainer from a configuration: one reference
/// embedder per configured device and the seeded synthetic batch source.
///
/// Embedding the training loop with custom models or a real dataset means
/// building [`ReidTrainer`] directly instead.
pub fn build_trainer(config: TrainConfig, sink: Box<dyn MetricsSink>) -> Result<ReidTrainer> {
    config.validate()?;
    let devices = config.resolve_devices()?;
    let primary = devices
        .first()
        .ok_or_else(|| Error::config("no devices resolved for the ensemble"))?
        .clone();

    let mut models: Vec<Box<dyn ReidModel>> = Vec::with_capacity(devices.len());
    for device in &devices {
        models.push(Box::new(LinearEmbedder::new(&config.model, device)?));
    }
    debug!(num_models = models.len(), "ensemble initialized");

    let source = SyntheticSource::new(
        &config.data,
        config.model.input_dim,
        config.training.seed,
        &primary,
    )?;
    ReidTrainer::new(config, models, Box::new(source), sink)
}
