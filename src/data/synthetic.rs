//! Synthetic identity-structured batch source
//!
//! Draws a fixed pool of identity prototypes at construction, then emits
//! P*K batches: P identities sampled without replacement, K noisy copies of
//! each prototype. Deterministic for a given seed, which is what the smoke
//! run and the driver tests key on.

use async_trait::async_trait;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, StandardNormal};

use crate::config::DataConfig;
use crate::error::{Error, Result};

use super::{BatchSource, TrainBatch};

/// Batch source over a pool of Gaussian identity prototypes.
pub struct SyntheticSource {
    prototypes: Vec<Vec<f32>>,
    ids_per_batch: usize,
    ims_per_id: usize,
    batches_per_epoch: usize,
    noise: Normal<f32>,
    input_dim: usize,
    device: Device,
    rng: StdRng,
    batches_in_epoch: usize,
}

impl SyntheticSource {
    /// Build a source from a validated data section.
    pub fn new(data: &DataConfig, input_dim: usize, seed: u64, device: &Device) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let prototypes = (0..data.num_identities)
            .map(|_| {
                (0..input_dim)
                    .map(|_| StandardNormal.sample(&mut rng))
                    .collect()
            })
            .collect();
        let noise = Normal::new(0f32, data.noise_std as f32)
            .map_err(|e| Error::config(format!("invalid noise distribution: {e}")))?;
        Ok(Self {
            prototypes,
            ids_per_batch: data.ids_per_batch,
            ims_per_id: data.ims_per_id,
            batches_per_epoch: data.batches_per_epoch,
            noise,
            input_dim,
            device: device.clone(),
            rng,
            batches_in_epoch: 0,
        })
    }

    fn make_batch(&mut self) -> Result<TrainBatch> {
        let n = self.ids_per_batch * self.ims_per_id;
        let mut flat = Vec::with_capacity(n * self.input_dim);
        let mut names = Vec::with_capacity(n);
        let mut labels = Vec::with_capacity(n);
        let mut mirrored = Vec::with_capacity(n);

        let ids = rand::seq::index::sample(&mut self.rng, self.prototypes.len(), self.ids_per_batch);
        for id in ids {
            for im in 0..self.ims_per_id {
                let mut row: Vec<f32> = self.prototypes[id]
                    .iter()
                    .map(|&p| p + self.noise.sample(&mut self.rng))
                    .collect();
                let mirror = self.rng.random_bool(0.5);
                if mirror {
                    row.reverse();
                }
                flat.extend_from_slice(&row);
                names.push(format!("{id:08}_{im:04}.png"));
                labels.push(id as u32);
                mirrored.push(mirror);
            }
        }

        let images = Tensor::from_vec(flat, (n, self.input_dim), &self.device)?;
        let epoch_done = self.batches_in_epoch + 1 == self.batches_per_epoch;
        self.batches_in_epoch = if epoch_done {
            0
        } else {
            self.batches_in_epoch + 1
        };

        Ok(TrainBatch {
            images,
            names,
            labels,
            mirrored,
            epoch_done,
        })
    }
}

#[async_trait]
impl BatchSource for SyntheticSource {
    async fn next_batch(&mut self) -> Result<TrainBatch> {
        self.make_batch()
    }

    fn batch_size(&self) -> usize {
        self.ids_per_batch * self.ims_per_id
    }
}
