//! Model seam and the reference linear embedder
//!
//! The training loop only sees [`ReidModel`]: a forward pass producing a
//! global feature, a stack of local region descriptors, and identity logits.
//! [`LinearEmbedder`] is the reference implementation behind the CLI and the
//! test suite; a convolutional backbone drops in by implementing the same
//! trait.

use candle_core::{DType, Device, Tensor};
use candle_nn::{linear, Linear, Module, VarBuilder, VarMap};

use crate::config::EmbedderConfig;
use crate::error::Result;

/// Outputs of one forward pass over a batch of `n` images.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Global feature, `(n, feature_dim)`
    pub global: Tensor,

    /// Local region descriptors, `(n, regions, local_dim)`
    pub local: Tensor,

    /// Identity logits, `(n, num_classes)`
    pub logits: Tensor,
}

/// A trainable re-identification model.
///
/// Implementations own their variables through a [`VarMap`]; the trainer
/// builds one optimizer per model from that map and saves checkpoints
/// through it.
pub trait ReidModel: Send {
    /// Run the model over a batch of flattened images on its own device.
    fn forward(&self, images: &Tensor) -> Result<ModelOutput>;

    /// Device this model computes on.
    fn device(&self) -> &Device;

    /// Handle to the model's variable store. The handle shares storage with
    /// the model, so loading weights through it updates the live model.
    fn var_map(&self) -> VarMap;

    /// Switch between training and evaluation behavior. The reference
    /// embedder has no mode-dependent layers, so the default is a no-op.
    fn set_train(&mut self, _train: bool) {}
}

/// Linear trunk with three heads: global feature, local region stack, and
/// identity classifier over the global feature.
pub struct LinearEmbedder {
    trunk: Linear,
    global_head: Linear,
    local_head: Linear,
    classifier: Linear,
    local_regions: usize,
    local_dim: usize,
    var_map: VarMap,
    device: Device,
}

impl LinearEmbedder {
    /// Build an embedder with freshly initialized weights on `device`.
    pub fn new(config: &EmbedderConfig, device: &Device) -> Result<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        let trunk = linear(config.input_dim, config.hidden_dim, vb.pp("trunk"))?;
        let global_head = linear(config.hidden_dim, config.feature_dim, vb.pp("global_head"))?;
        let local_head = linear(
            config.hidden_dim,
            config.local_regions * config.local_dim,
            vb.pp("local_head"),
        )?;
        let classifier = linear(config.feature_dim, config.num_classes, vb.pp("classifier"))?;
        Ok(Self {
            trunk,
            global_head,
            local_head,
            classifier,
            local_regions: config.local_regions,
            local_dim: config.local_dim,
            var_map,
            device: device.clone(),
        })
    }
}

impl ReidModel for LinearEmbedder {
    fn forward(&self, images: &Tensor) -> Result<ModelOutput> {
        let hidden = self.trunk.forward(images)?.relu()?;
        let global = self.global_head.forward(&hidden)?;
        let (n, _) = hidden.dims2()?;
        let local = self
            .local_head
            .forward(&hidden)?
            .reshape((n, self.local_regions, self.local_dim))?;
        let logits = self.classifier.forward(&global)?;
        Ok(ModelOutput {
            global,
            local,
            logits,
        })
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn var_map(&self) -> VarMap {
        self.var_map.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_finite(t: &Tensor) -> bool {
        t.flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
            .iter()
            .all(|v| v.is_finite())
    }

    #[test]
    fn forward_produces_the_contracted_shapes() {
        let config = EmbedderConfig::default();
        let device = Device::Cpu;
        let model = LinearEmbedder::new(&config, &device).unwrap();

        let images = Tensor::randn(0f32, 1f32, (6, config.input_dim), &device).unwrap();
        let out = model.forward(&images).unwrap();

        assert_eq!(out.global.dims(), &[6, config.feature_dim]);
        assert_eq!(
            out.local.dims(),
            &[6, config.local_regions, config.local_dim]
        );
        assert_eq!(out.logits.dims(), &[6, config.num_classes]);
        assert!(is_finite(&out.global));
        assert!(is_finite(&out.local));
        assert!(is_finite(&out.logits));
    }

    #[test]
    fn embedders_own_independent_variables() {
        let config = EmbedderConfig::default();
        let device = Device::Cpu;
        let a = LinearEmbedder::new(&config, &device).unwrap();
        let b = LinearEmbedder::new(&config, &device).unwrap();

        let wa = a.var_map().all_vars()[0]
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let wb = b.var_map().all_vars()[0]
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(wa.iter().zip(&wb).any(|(x, y)| x != y));
    }

    #[test]
    fn var_map_handle_shares_storage_with_the_model() {
        let config = EmbedderConfig::default();
        let device = Device::Cpu;
        let model = LinearEmbedder::new(&config, &device).unwrap();

        let images = Tensor::ones((2, config.input_dim), DType::F32, &device).unwrap();
        let before = model.forward(&images).unwrap();

        // Zero every variable through a cloned handle; the model must see it.
        for var in model.var_map().all_vars() {
            let zeros = var.as_tensor().zeros_like().unwrap();
            var.set(&zeros).unwrap();
        }
        let after = model.forward(&images).unwrap();

        let sum = after.global.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(sum, 0.0);
        let before_sum = before.global.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(before_sum > 0.0);
    }
}
