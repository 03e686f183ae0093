//! Identity-structured batches and the sources that produce them
//!
//! Training consumes P*K batches: P identities, K images each, so every row
//! has at least one same-identity row and at least one other-identity row in
//! the same batch. [`TrainBatch::validate`] enforces that layout up front;
//! the triplet miner still fails on violation, but the driver checks first
//! so a bad source is reported as a data problem, not a mining problem.

pub mod synthetic;

pub use synthetic::SyntheticSource;

use std::collections::HashMap;

use async_trait::async_trait;
use candle_core::{Device, Tensor};

use crate::error::{Error, Result};

/// One training batch of flattened images with identity structure.
#[derive(Debug, Clone)]
pub struct TrainBatch {
    /// Flattened images, `(n, input_dim)`
    pub images: Tensor,

    /// Source name per row, carried through for logging and debugging
    pub names: Vec<String>,

    /// Identity label per row
    pub labels: Vec<u32>,

    /// Horizontal-mirror flag per row
    pub mirrored: Vec<bool>,

    /// True on the last batch of an epoch
    pub epoch_done: bool,
}

impl TrainBatch {
    /// Number of rows in the batch.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// True when the batch has no rows.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Check the per-row arrays against the image tensor and the identity
    /// layout the triplet miner needs.
    pub fn validate(&self) -> Result<()> {
        let (n, _) = self.images.dims2().map_err(|_| {
            Error::malformed_batch(format!(
                "images must be a 2-D tensor, got shape {:?}",
                self.images.shape()
            ))
        })?;
        if n == 0 {
            return Err(Error::malformed_batch("batch has no rows"));
        }
        if self.names.len() != n || self.labels.len() != n || self.mirrored.len() != n {
            return Err(Error::malformed_batch(format!(
                "per-row arrays disagree with {} image rows: {} names, {} labels, {} mirror \
                 flags",
                n,
                self.names.len(),
                self.labels.len(),
                self.mirrored.len()
            )));
        }

        let mut counts: HashMap<u32, usize> = HashMap::new();
        for &label in &self.labels {
            *counts.entry(label).or_insert(0) += 1;
        }
        if counts.len() < 2 {
            return Err(Error::malformed_batch(
                "batch needs at least two identities so every anchor has a negative",
            ));
        }
        if let Some((&label, &count)) = counts.iter().find(|(_, &count)| count < 2) {
            return Err(Error::malformed_batch(format!(
                "identity {label} has {count} row(s); every identity needs at least two so \
                 each anchor has a positive"
            )));
        }
        Ok(())
    }

    /// Labels as a `u32` tensor on `device`, for the classification loss.
    pub fn labels_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(&self.labels, self.labels.len(), device)?)
    }

    /// Image tensor moved to `device`.
    pub fn images_on(&self, device: &Device) -> Result<Tensor> {
        Ok(self.images.to_device(device)?)
    }
}

/// A stream of training batches.
///
/// Sources own their iteration state; `next_batch` never ends, the epoch
/// boundary is signalled in-band through [`TrainBatch::epoch_done`].
#[async_trait]
pub trait BatchSource: Send {
    /// Produce the next batch.
    async fn next_batch(&mut self) -> Result<TrainBatch>;

    /// Rows per batch this source produces.
    fn batch_size(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(labels: Vec<u32>, rows: usize) -> TrainBatch {
        let images = Tensor::zeros((rows, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        TrainBatch {
            images,
            names: (0..labels.len()).map(|i| format!("{i}.png")).collect(),
            labels,
            mirrored: vec![false; rows],
            epoch_done: false,
        }
    }

    #[test]
    fn well_formed_batch_passes() {
        batch(vec![0, 0, 1, 1], 4).validate().unwrap();
    }

    #[test]
    fn mismatched_row_arrays_are_rejected() {
        let mut b = batch(vec![0, 0, 1, 1], 4);
        b.names.pop();
        let err = b.validate().unwrap_err();
        assert!(matches!(err, Error::MalformedBatch(_)), "got {err}");
    }

    #[test]
    fn singleton_identity_is_rejected() {
        let err = batch(vec![0, 0, 1], 3).validate().unwrap_err();
        assert!(err.to_string().contains("positive"));
    }

    #[test]
    fn single_identity_batch_is_rejected() {
        let err = batch(vec![7, 7, 7, 7], 4).validate().unwrap_err();
        assert!(err.to_string().contains("negative"));
    }

    #[test]
    fn labels_tensor_is_u32() {
        let b = batch(vec![0, 0, 1, 1], 4);
        let t = b.labels_tensor(&Device::Cpu).unwrap();
        assert_eq!(t.dtype(), candle_core::DType::U32);
        assert_eq!(t.to_vec1::<u32>().unwrap(), vec![0, 0, 1, 1]);
    }
}
