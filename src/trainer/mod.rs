//! Multi-model training driver
//!
//! [`ReidTrainer`] owns the ensemble, one optimizer per model, the batch
//! source, and a metrics sink, and runs the epoch loop: adjust learning
//! rates from the schedule, consume batches until the source signals the
//! epoch boundary, run the synchronized [`train_step`] across all models,
//! and log, record, and checkpoint at each epoch end. Progress events are
//! available through an optional channel for embedding the trainer in a
//! larger application.

pub mod checkpoint;
pub mod step;

#[cfg(test)]
mod tests;

pub use checkpoint::{load_checkpoint, save_checkpoint, CheckpointState};
pub use step::{train_step, ModelStepStats, StepOutput};

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use candle_nn::VarMap;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::{EnabledTerms, TrainConfig};
use crate::data::BatchSource;
use crate::error::{Error, Result};
use crate::loss::TripletLoss;
use crate::metrics::{EpochMeters, MetricsSink};
use crate::model::ReidModel;
use crate::optim::{build_optimizers, ModelOptimizer};

/// Progress notifications emitted while training.
#[derive(Debug, Clone)]
pub enum TrainEvent {
    /// An epoch is starting with the given learning rate
    EpochStarted {
        /// 0-based epoch index
        epoch: usize,
        /// Learning rate for this epoch
        lr: f64,
    },
    /// One ensemble step finished
    StepCompleted {
        /// 0-based epoch index
        epoch: usize,
        /// 1-based step within the epoch
        step: usize,
        /// Last model's weighted total loss
        total_loss: f32,
    },
    /// An epoch finished
    EpochCompleted {
        /// 0-based epoch index
        epoch: usize,
        /// Epoch average of the last model's total loss
        avg_loss: f64,
    },
    /// A checkpoint was written
    CheckpointSaved {
        /// 0-based epoch index that just completed
        epoch: usize,
        /// Checkpoint directory
        path: PathBuf,
    },
}

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct TrainReport {
    /// Epochs executed by this call
    pub epochs_run: usize,
    /// Steps taken across the whole run, including restored ones
    pub total_steps: usize,
    /// Epoch average of the total loss over the final epoch
    pub final_avg_loss: f64,
    /// Wall time of this call
    pub elapsed: Duration,
}

/// Drives mutual training of a model ensemble.
pub struct ReidTrainer {
    config: TrainConfig,
    enabled: EnabledTerms,
    models: Vec<Box<dyn ReidModel>>,
    optimizers: Vec<ModelOptimizer>,
    source: Box<dyn BatchSource>,
    sink: Box<dyn MetricsSink>,
    g_tri: TripletLoss,
    l_tri: TripletLoss,
    events: Option<mpsc::UnboundedSender<TrainEvent>>,
    epochs_done: usize,
    global_step: usize,
}

impl fmt::Debug for ReidTrainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReidTrainer")
            .field("num_models", &self.models.len())
            .field("epochs_done", &self.epochs_done)
            .field("global_step", &self.global_step)
            .finish_non_exhaustive()
    }
}

impl ReidTrainer {
    /// Build a trainer over `models`, validating the configuration and
    /// restoring a checkpoint when the run resumes.
    pub fn new(
        config: TrainConfig,
        models: Vec<Box<dyn ReidModel>>,
        source: Box<dyn BatchSource>,
        sink: Box<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;
        if models.len() != config.ensemble.num_models {
            return Err(Error::config(format!(
                "configuration names {} models but {} were supplied",
                config.ensemble.num_models,
                models.len()
            )));
        }
        let var_maps: Vec<VarMap> = models.iter().map(|m| m.var_map()).collect();
        let optimizers = build_optimizers(&var_maps, &config.optimizer)?;
        let enabled = config.enabled_terms();
        let g_tri = TripletLoss::new(config.loss.global_margin);
        let l_tri = TripletLoss::new(config.loss.local_margin);

        let mut trainer = Self {
            config,
            enabled,
            models,
            optimizers,
            source,
            sink,
            g_tri,
            l_tri,
            events: None,
            epochs_done: 0,
            global_step: 0,
        };
        if trainer.config.training.resume {
            trainer.restore()?;
        }
        Ok(trainer)
    }

    /// Attach an event channel; the receiver sees every [`TrainEvent`].
    pub fn with_event_channel(mut self) -> (Self, mpsc::UnboundedReceiver<TrainEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        (self, rx)
    }

    /// The models, in ensemble order.
    pub fn models(&self) -> &[Box<dyn ReidModel>] {
        &self.models
    }

    /// Completed epochs, including restored ones.
    pub fn epochs_done(&self) -> usize {
        self.epochs_done
    }

    /// Run the remaining epochs.
    pub async fn train(&mut self) -> Result<TrainReport> {
        let started = Instant::now();
        let first_epoch = self.epochs_done;
        let total_epochs = self.config.training.total_epochs;
        if first_epoch >= total_epochs {
            info!(
                epochs_done = self.epochs_done,
                "nothing to do, run is already complete"
            );
        }

        let mut final_avg_loss = 0.0;
        for epoch in first_epoch..total_epochs {
            final_avg_loss = self.run_epoch(epoch).await?;
        }
        self.sink.flush()?;

        Ok(TrainReport {
            epochs_run: total_epochs.saturating_sub(first_epoch),
            total_steps: self.global_step,
            final_avg_loss,
            elapsed: started.elapsed(),
        })
    }

    async fn run_epoch(&mut self, epoch: usize) -> Result<f64> {
        let lr = self.config.schedule.lr_at(
            self.config.optimizer.base_lr,
            epoch,
            self.config.training.total_epochs,
        );
        let changed = self
            .optimizers
            .first()
            .map(|opt| opt.learning_rate() != lr)
            .unwrap_or(false);
        for opt in &mut self.optimizers {
            opt.set_learning_rate(lr);
        }
        if changed {
            info!("=====> lr adjusted to {lr:.10}");
        }
        for model in &mut self.models {
            model.set_train(true);
        }
        self.emit(TrainEvent::EpochStarted { epoch, lr });

        let mut meters = EpochMeters::new();
        let epoch_start = Instant::now();
        let mut step = 0usize;
        loop {
            let step_start = Instant::now();
            let batch = self.source.next_batch().await?;
            let epoch_done = batch.epoch_done;
            let out = train_step(
                &self.models,
                &mut self.optimizers,
                &batch,
                &self.config.loss,
                &self.enabled,
                &self.g_tri,
                &self.l_tri,
            )?;
            meters.update(out.last());
            step += 1;
            self.global_step += 1;
            self.emit(TrainEvent::StepCompleted {
                epoch,
                step,
                total_loss: out.last().total_loss,
            });

            if step % self.config.training.steps_per_log == 0 {
                info!(
                    "Step {}/Ep {}, {:.2}s{}",
                    step,
                    epoch + 1,
                    step_start.elapsed().as_secs_f64(),
                    meters.step_line(&self.enabled)
                );
            }
            if epoch_done {
                break;
            }
        }

        info!(
            "Ep {}, {:.2}s{}",
            epoch + 1,
            epoch_start.elapsed().as_secs_f64(),
            meters.epoch_line(&self.enabled)
        );
        meters.record_epoch(epoch, &self.enabled, self.sink.as_mut())?;
        self.sink.flush()?;
        self.epochs_done = epoch + 1;

        if let Some(dir) = self.config.training.checkpoint_dir.clone() {
            let state = CheckpointState {
                epochs_done: self.epochs_done,
                global_step: self.global_step,
                saved_at: Utc::now(),
            };
            save_checkpoint(&dir, &self.models, &state)?;
            self.emit(TrainEvent::CheckpointSaved { epoch, path: dir });
        }

        let avg_loss = meters.avg_total_loss();
        self.emit(TrainEvent::EpochCompleted { epoch, avg_loss });
        Ok(avg_loss)
    }

    fn restore(&mut self) -> Result<()> {
        let dir = self
            .config
            .training
            .checkpoint_dir
            .as_ref()
            .ok_or_else(|| Error::checkpoint("resume requested without a checkpoint_dir"))?;
        let state = load_checkpoint(dir, &self.models)?;
        self.epochs_done = state.epochs_done;
        self.global_step = state.global_step;
        info!(
            epochs_done = state.epochs_done,
            global_step = state.global_step,
            "restored checkpoint from {}",
            dir.display()
        );
        Ok(())
    }

    fn emit(&self, event: TrainEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}
