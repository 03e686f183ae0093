//! Tests for the epoch driver

use std::sync::{Arc, Mutex};

use approx::assert_relative_eq;
use candle_core::Device;

use crate::config::TrainConfig;
use crate::data::SyntheticSource;
use crate::error::Error;
use crate::optim::LrSchedule;
use crate::trainer::{ReidTrainer, TrainEvent};

use super::fixtures::{build_models, test_config, CaptureSink, SinkRecord};

fn build_trainer_with(cfg: TrainConfig) -> (ReidTrainer, Arc<Mutex<Vec<SinkRecord>>>) {
    let models = build_models(&cfg);
    let source = SyntheticSource::new(
        &cfg.data,
        cfg.model.input_dim,
        cfg.training.seed,
        &Device::Cpu,
    )
    .unwrap();
    let (sink, records) = CaptureSink::new();
    let trainer = ReidTrainer::new(cfg, models, Box::new(source), Box::new(sink)).unwrap();
    (trainer, records)
}

#[tokio::test]
async fn driver_runs_every_configured_epoch_and_step() {
    let (mut trainer, _records) = build_trainer_with(test_config(2));
    let report = trainer.train().await.unwrap();

    assert_eq!(report.epochs_run, 2);
    assert_eq!(report.total_steps, 4);
    assert_eq!(trainer.epochs_done(), 2);
    assert!(report.final_avg_loss.is_finite());
    assert!(report.final_avg_loss > 0.0);
}

#[tokio::test]
async fn event_channel_reports_progress() {
    let (trainer, _records) = build_trainer_with(test_config(2));
    let (mut trainer, mut rx) = trainer.with_event_channel();
    trainer.train().await.unwrap();

    let mut started = 0;
    let mut steps = 0;
    let mut completed = 0;
    let mut saved = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            TrainEvent::EpochStarted { .. } => started += 1,
            TrainEvent::StepCompleted { total_loss, .. } => {
                assert!(total_loss.is_finite());
                steps += 1;
            }
            TrainEvent::EpochCompleted { .. } => completed += 1,
            TrainEvent::CheckpointSaved { .. } => saved += 1,
        }
    }
    assert_eq!(started, 2);
    assert_eq!(steps, 4);
    assert_eq!(completed, 2);
    // No checkpoint directory was configured.
    assert_eq!(saved, 0);
}

#[tokio::test]
async fn checkpoints_are_written_and_resume_skips_completed_epochs() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(2);
    cfg.training.checkpoint_dir = Some(dir.path().to_path_buf());

    let (mut trainer, _records) = build_trainer_with(cfg.clone());
    let report = trainer.train().await.unwrap();
    assert_eq!(report.epochs_run, 2);
    assert!(dir.path().join("model_0.safetensors").exists());
    assert!(dir.path().join("model_1.safetensors").exists());
    assert!(dir.path().join("train_state.json").exists());

    cfg.training.resume = true;
    let (mut resumed, _records) = build_trainer_with(cfg);
    assert_eq!(resumed.epochs_done(), 2);
    let report = resumed.train().await.unwrap();
    assert_eq!(report.epochs_run, 0);
    assert_eq!(report.total_steps, 4);
}

#[tokio::test]
async fn sink_receives_only_enabled_groups() {
    let mut cfg = test_config(2);
    cfg.loss.local_weight = 0.0;
    cfg.loss.local_mutual_weight = 0.0;

    let (mut trainer, records) = build_trainer_with(cfg);
    trainer.train().await.unwrap();

    let records = records.lock().unwrap();
    let loss_groups: Vec<_> = records.iter().filter(|(_, group, _)| group == "loss").collect();
    assert_eq!(loss_groups.len(), 2, "one loss group per epoch");
    for (_, _, values) in &loss_groups {
        let keys: Vec<&str> = values.iter().map(|(k, _)| k.as_str()).collect();
        assert!(keys.contains(&"global_loss"));
        assert!(keys.contains(&"loss"));
        assert!(!keys.contains(&"local_loss"));
    }
    assert!(records.iter().any(|(_, group, _)| group == "global_dist"));
    assert!(records.iter().all(|(_, group, _)| group != "local_dist"));
}

#[tokio::test]
async fn schedule_drives_epoch_learning_rates() {
    let mut cfg = test_config(2);
    cfg.schedule = LrSchedule::Staircase {
        decay_at_epochs: vec![1],
        factor: 0.1,
    };

    let (trainer, _records) = build_trainer_with(cfg);
    let (mut trainer, mut rx) = trainer.with_event_channel();
    trainer.train().await.unwrap();

    let mut lrs = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let TrainEvent::EpochStarted { lr, .. } = event {
            lrs.push(lr);
        }
    }
    assert_eq!(lrs.len(), 2);
    assert_relative_eq!(lrs[0], 2e-4);
    assert_relative_eq!(lrs[1], 2e-5, epsilon = 1e-12);
}

#[test]
fn trainer_rejects_model_count_mismatch() {
    let cfg = test_config(2);
    let models = build_models(&test_config(1));
    let source = SyntheticSource::new(
        &cfg.data,
        cfg.model.input_dim,
        cfg.training.seed,
        &Device::Cpu,
    )
    .unwrap();
    let (sink, _records) = CaptureSink::new();

    let err = ReidTrainer::new(cfg, models, Box::new(source), Box::new(sink)).unwrap_err();
    assert!(matches!(err, Error::Config(_)), "got {err}");
}
