//! Training configuration for the re-identification ensemble
//!
//! One `TrainConfig` drives a whole run: ensemble shape and device placement,
//! reference embedder dimensions, synthetic data layout, loss weights and
//! margins, optimizer and learning-rate schedule, and driver parameters.
//! Configurations are validated once before training starts; anything the
//! trainer would otherwise have to silently skip mid-run (a mutual term with
//! a single model, a local-distance mutual term without a full local matrix)
//! is rejected here instead.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use candle_core::Device;

use crate::error::{Error, Result};
use crate::loss::{LocalSamplePolicy, MarginMode};
use crate::optim::LrSchedule;

/// Main configuration for one training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Ensemble size and device placement
    pub ensemble: EnsembleConfig,

    /// Reference embedder dimensions
    pub model: EmbedderConfig,

    /// Synthetic batch source layout
    pub data: DataConfig,

    /// Loss weights, margins, and the local-loss policy
    pub loss: LossConfig,

    /// Optimizer selection and base hyperparameters
    pub optimizer: OptimizerConfig,

    /// Learning-rate schedule, applied at each epoch start
    pub schedule: LrSchedule,

    /// Epoch count, logging cadence, seeding, checkpointing
    pub training: TrainingParams,
}

/// Ensemble shape and device placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Number of co-trained models (M >= 1)
    pub num_models: usize,

    /// Compute devices: either one entry shared by every model, or exactly
    /// one entry per model
    pub devices: Vec<DeviceKind>,
}

/// A compute device selector, resolved to a `candle` device at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Host CPU
    Cpu,
    /// CUDA device by ordinal
    Cuda {
        /// CUDA device ordinal
        index: usize,
    },
    /// Metal device by ordinal
    Metal {
        /// Metal device ordinal
        index: usize,
    },
}

impl DeviceKind {
    /// Resolve to a concrete device. Fails when the requested backend is
    /// unavailable in this build.
    pub fn resolve(&self) -> Result<Device> {
        match self {
            DeviceKind::Cpu => Ok(Device::Cpu),
            DeviceKind::Cuda { index } => Ok(Device::new_cuda(*index)?),
            DeviceKind::Metal { index } => Ok(Device::new_metal(*index)?),
        }
    }
}

/// Dimensions of the reference linear embedder.
///
/// This is the stand-in backbone used by the CLI smoke run and the test
/// suite; a production model only has to honor the same output contract
/// (global feature, local feature map, logits).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderConfig {
    /// Flattened input width per image
    pub input_dim: usize,

    /// Trunk hidden width
    pub hidden_dim: usize,

    /// Global feature width
    pub feature_dim: usize,

    /// Number of local region descriptors per image
    pub local_regions: usize,

    /// Width of each local region descriptor
    pub local_dim: usize,

    /// Classifier output width; must cover every identity label
    pub num_classes: usize,
}

/// Layout of the synthetic identity-structured batch source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Size of the identity pool
    pub num_identities: usize,

    /// Identities drawn per batch (P)
    pub ids_per_batch: usize,

    /// Images per drawn identity (K); the triplet miner needs K >= 2
    pub ims_per_id: usize,

    /// Batches per epoch; the last batch of an epoch carries `epoch_done`
    pub batches_per_epoch: usize,

    /// Standard deviation of the per-image noise around each identity
    /// prototype
    pub noise_std: f64,
}

/// Loss weights, margins, feature normalization, and the local-loss policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    /// L2-normalize feature rows before distance computation
    pub normalize_features: bool,

    /// Margin formulation for the global triplet loss
    pub global_margin: MarginMode,

    /// Margin formulation for the local triplet loss
    pub local_margin: MarginMode,

    /// How the local loss picks its triplets; `independent` is required by
    /// the local-distance mutual term
    pub local_hard_samples: LocalSamplePolicy,

    /// Weight of the global triplet term
    pub global_weight: f64,

    /// Weight of the local triplet term
    pub local_weight: f64,

    /// Weight of the identity classification term
    pub id_weight: f64,

    /// Weight of the probability mutual term (KL toward peers)
    pub prob_mutual_weight: f64,

    /// Weight of the global-distance mutual term
    pub global_mutual_weight: f64,

    /// Weight of the local-distance mutual term
    pub local_mutual_weight: f64,
}

/// Optimizer selection and base hyperparameters, shared by every model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Which optimizer to build per model
    pub kind: OptimizerKind,

    /// Base learning rate, mutated between epochs by the schedule
    pub base_lr: f64,

    /// Weight decay (AdamW only)
    pub weight_decay: f64,
}

/// Supported optimizers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    /// AdamW with the configured betas/epsilon
    AdamW {
        /// First-moment decay
        beta1: f64,
        /// Second-moment decay
        beta2: f64,
        /// Denominator epsilon
        eps: f64,
    },
    /// Plain stochastic gradient descent
    Sgd,
}

/// Driver parameters: epochs, logging cadence, seeding, checkpointing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    /// Total number of epochs
    pub total_epochs: usize,

    /// Emit a step log line every this many steps
    pub steps_per_log: usize,

    /// Seed for the synthetic source
    pub seed: u64,

    /// Directory for per-epoch checkpoints; `None` disables checkpointing
    pub checkpoint_dir: Option<PathBuf>,

    /// Restore models and epoch counter from `checkpoint_dir` before
    /// training
    pub resume: bool,
}

/// The set of loss terms a validated configuration enables.
///
/// Derived once per run from the weights (and the local policy for the
/// local-distance mutual term) and consulted everywhere, so what is
/// computed, logged, and metered always agrees. Only meaningful for a
/// configuration that passed [`TrainConfig::validate`]; validation is what
/// rules out combinations like a mutual weight with a single model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnabledTerms {
    /// Global triplet loss
    pub global: bool,
    /// Local alignment triplet loss
    pub local: bool,
    /// Identity classification loss
    pub id: bool,
    /// Probability mutual loss
    pub prob_mutual: bool,
    /// Global-distance mutual loss
    pub global_mutual: bool,
    /// Local-distance mutual loss
    pub local_mutual: bool,
}

impl EnabledTerms {
    /// True when any mutual term is enabled.
    pub fn any_mutual(&self) -> bool {
        self.prob_mutual || self.global_mutual || self.local_mutual
    }

    /// True when at least one term is enabled.
    pub fn any(&self) -> bool {
        self.global
            || self.local
            || self.id
            || self.prob_mutual
            || self.global_mutual
            || self.local_mutual
    }
}

impl TrainConfig {
    /// Load a configuration from a JSON file and validate it.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Derive the enabled-term set. Call only on a validated configuration.
    pub fn enabled_terms(&self) -> EnabledTerms {
        EnabledTerms {
            global: self.loss.global_weight > 0.0,
            local: self.loss.local_weight > 0.0,
            id: self.loss.id_weight > 0.0,
            prob_mutual: self.loss.prob_mutual_weight > 0.0,
            global_mutual: self.loss.global_mutual_weight > 0.0,
            local_mutual: self.loss.local_mutual_weight > 0.0,
        }
    }

    /// One resolved device per model. A single configured device is shared
    /// by the whole ensemble.
    pub fn resolve_devices(&self) -> Result<Vec<Device>> {
        let m = self.ensemble.num_models;
        if self.ensemble.devices.len() == 1 {
            let device = self.ensemble.devices[0].resolve()?;
            return Ok(vec![device; m]);
        }
        self.ensemble.devices.iter().map(|d| d.resolve()).collect()
    }

    /// Samples per batch produced by the configured data layout.
    pub fn batch_size(&self) -> usize {
        self.data.ids_per_batch * self.data.ims_per_id
    }

    /// Validate the configuration, rejecting anything the trainer would
    /// otherwise have to skip or mis-log mid-run.
    pub fn validate(&self) -> Result<()> {
        let m = self.ensemble.num_models;
        if m == 0 {
            return Err(Error::config("ensemble must contain at least one model"));
        }
        if self.ensemble.devices.is_empty() {
            return Err(Error::config("at least one device must be configured"));
        }
        if self.ensemble.devices.len() != 1 && self.ensemble.devices.len() != m {
            return Err(Error::config(format!(
                "device list must have 1 entry or one per model, got {} for {} models",
                self.ensemble.devices.len(),
                m
            )));
        }

        for (name, dim) in [
            ("model.input_dim", self.model.input_dim),
            ("model.hidden_dim", self.model.hidden_dim),
            ("model.feature_dim", self.model.feature_dim),
            ("model.local_regions", self.model.local_regions),
            ("model.local_dim", self.model.local_dim),
            ("model.num_classes", self.model.num_classes),
        ] {
            if dim == 0 {
                return Err(Error::config(format!("{name} must be > 0")));
            }
        }

        if self.data.ids_per_batch < 2 {
            return Err(Error::config(
                "ids_per_batch must be >= 2 so every anchor has a negative",
            ));
        }
        if self.data.ims_per_id < 2 {
            return Err(Error::config(
                "ims_per_id must be >= 2 so every anchor has a positive",
            ));
        }
        if self.data.num_identities < self.data.ids_per_batch {
            return Err(Error::config(format!(
                "identity pool ({}) is smaller than ids_per_batch ({})",
                self.data.num_identities, self.data.ids_per_batch
            )));
        }
        if self.data.batches_per_epoch == 0 {
            return Err(Error::config("batches_per_epoch must be > 0"));
        }
        if !self.data.noise_std.is_finite() || self.data.noise_std < 0.0 {
            return Err(Error::config("noise_std must be finite and >= 0"));
        }
        if self.model.num_classes < self.data.num_identities {
            return Err(Error::config(format!(
                "num_classes ({}) must cover the identity pool ({})",
                self.model.num_classes, self.data.num_identities
            )));
        }

        for (name, margin) in [
            ("global_margin", self.loss.global_margin),
            ("local_margin", self.loss.local_margin),
        ] {
            if let MarginMode::Hard { margin } = margin {
                if !(margin > 0.0) {
                    return Err(Error::config(format!("{name} must be > 0")));
                }
            }
        }

        for (name, weight) in [
            ("global_weight", self.loss.global_weight),
            ("local_weight", self.loss.local_weight),
            ("id_weight", self.loss.id_weight),
            ("prob_mutual_weight", self.loss.prob_mutual_weight),
            ("global_mutual_weight", self.loss.global_mutual_weight),
            ("local_mutual_weight", self.loss.local_mutual_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(Error::config(format!(
                    "{name} must be finite and >= 0, got {weight}"
                )));
            }
        }
        if !self.enabled_terms().any() {
            return Err(Error::config("at least one loss weight must be > 0"));
        }

        let any_mutual = self.loss.prob_mutual_weight > 0.0
            || self.loss.global_mutual_weight > 0.0
            || self.loss.local_mutual_weight > 0.0;
        if any_mutual && m < 2 {
            return Err(Error::config(
                "mutual-loss weights require an ensemble of at least two models",
            ));
        }
        if self.loss.local_mutual_weight > 0.0 {
            if self.loss.local_hard_samples != LocalSamplePolicy::Independent {
                return Err(Error::config(
                    "local-distance mutual loss requires the independent local-hard-sample \
                     policy, which is the only one producing a full local distance matrix",
                ));
            }
            if self.loss.local_weight == 0.0 {
                return Err(Error::config(
                    "local-distance mutual loss requires a non-zero local_weight; the local \
                     distance matrix is only computed by the local loss pipeline",
                ));
            }
        }

        if !(self.optimizer.base_lr > 0.0) {
            return Err(Error::config("base_lr must be > 0"));
        }
        if !self.optimizer.weight_decay.is_finite() || self.optimizer.weight_decay < 0.0 {
            return Err(Error::config("weight_decay must be finite and >= 0"));
        }
        if self.optimizer.weight_decay > 0.0 && self.optimizer.kind == OptimizerKind::Sgd {
            return Err(Error::config(
                "weight_decay is only applied by the adamw optimizer",
            ));
        }

        if self.training.total_epochs == 0 {
            return Err(Error::config("total_epochs must be > 0"));
        }
        if self.training.steps_per_log == 0 {
            return Err(Error::config("steps_per_log must be > 0"));
        }
        if self.training.resume && self.training.checkpoint_dir.is_none() {
            return Err(Error::config(
                "resume requires a checkpoint_dir to restore from",
            ));
        }
        self.schedule.validate(self.training.total_epochs)?;

        Ok(())
    }
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            ensemble: EnsembleConfig::default(),
            model: EmbedderConfig::default(),
            data: DataConfig::default(),
            loss: LossConfig::default(),
            optimizer: OptimizerConfig::default(),
            schedule: LrSchedule::Exponential { start_epoch: 5 },
            training: TrainingParams::default(),
        }
    }
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            num_models: 2,
            devices: vec![DeviceKind::Cpu],
        }
    }
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            input_dim: 64,
            hidden_dim: 128,
            feature_dim: 128,
            local_regions: 8,
            local_dim: 32,
            num_classes: 32,
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            num_identities: 32,
            ids_per_batch: 4,
            ims_per_id: 4,
            batches_per_epoch: 8,
            noise_std: 0.1,
        }
    }
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            normalize_features: false,
            global_margin: MarginMode::Hard { margin: 0.3 },
            local_margin: MarginMode::Hard { margin: 0.3 },
            local_hard_samples: LocalSamplePolicy::Independent,
            global_weight: 1.0,
            local_weight: 1.0,
            id_weight: 1.0,
            prob_mutual_weight: 1.0,
            global_mutual_weight: 1.0,
            local_mutual_weight: 1.0,
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::AdamW {
                beta1: 0.9,
                beta2: 0.999,
                eps: 1e-8,
            },
            base_lr: 2e-4,
            weight_decay: 5e-4,
        }
    }
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            total_epochs: 10,
            steps_per_log: 4,
            seed: 1,
            checkpoint_dir: None,
            resume: false,
        }
    }
}
