//! Backbone construction and dispatch.
//!
//! Training is generic over the [`Backbone`] trait so one trainer serves
//! every family; loading a saved artifact goes through the
//! [`LoadedBackbone`] tag, which picks the concrete module from the
//! spec that was stored next to the weights.

use std::path::Path;

use burn::{
    module::Module,
    record::CompactRecorder,
    tensor::{backend::Backend, Tensor},
};

use crate::error::{PavementError, Result};
use crate::model::conv::{AttentionConvNet, ConvResidualNet, MobileLightNet};
use crate::model::spec::{ArchitectureSpec, BackboneKind};
use crate::model::vit::VisionTransformerNet;

/// Output contract shared by every backbone.
#[derive(Debug, Clone)]
pub struct BackboneOutput<B: Backend> {
    /// Condition logits, shape [batch, 5]
    pub condition: Tensor<B, 2>,
    /// Crack logits, shape [batch, 6], present when the spec enables
    /// the auxiliary head
    pub crack: Option<Tensor<B, 2>>,
}

/// A trainable backbone built from an [`ArchitectureSpec`].
pub trait Backbone<B: Backend>: Module<B> + Sized {
    /// Construct with freshly initialized weights. The spec must
    /// already be validated.
    fn build(spec: &ArchitectureSpec, device: &B::Device) -> Self;

    /// Forward pass over a normalized image batch.
    fn forward(&self, images: Tensor<B, 4>) -> BackboneOutput<B>;
}

impl<B: Backend> Backbone<B> for ConvResidualNet<B> {
    fn build(spec: &ArchitectureSpec, device: &B::Device) -> Self {
        ConvResidualNet::new(spec, device)
    }

    fn forward(&self, images: Tensor<B, 4>) -> BackboneOutput<B> {
        ConvResidualNet::forward(self, images)
    }
}

impl<B: Backend> Backbone<B> for AttentionConvNet<B> {
    fn build(spec: &ArchitectureSpec, device: &B::Device) -> Self {
        AttentionConvNet::new(spec, device)
    }

    fn forward(&self, images: Tensor<B, 4>) -> BackboneOutput<B> {
        AttentionConvNet::forward(self, images)
    }
}

impl<B: Backend> Backbone<B> for VisionTransformerNet<B> {
    fn build(spec: &ArchitectureSpec, device: &B::Device) -> Self {
        VisionTransformerNet::new(spec, device)
    }

    fn forward(&self, images: Tensor<B, 4>) -> BackboneOutput<B> {
        VisionTransformerNet::forward(self, images)
    }
}

impl<B: Backend> Backbone<B> for MobileLightNet<B> {
    fn build(spec: &ArchitectureSpec, device: &B::Device) -> Self {
        MobileLightNet::new(spec, device)
    }

    fn forward(&self, images: Tensor<B, 4>) -> BackboneOutput<B> {
        MobileLightNet::forward(self, images)
    }
}

/// A backbone loaded for inference, tagged by family.
#[derive(Debug, Clone)]
pub enum LoadedBackbone<B: Backend> {
    ConvResidual(ConvResidualNet<B>),
    AttentionConv(AttentionConvNet<B>),
    VisionTransformer(VisionTransformerNet<B>),
    MobileLight(MobileLightNet<B>),
}

impl<B: Backend> LoadedBackbone<B> {
    /// Build a backbone with fresh weights after validating the spec.
    pub fn init(spec: &ArchitectureSpec, device: &B::Device) -> Result<Self> {
        spec.validate()?;
        Ok(match spec.backbone {
            BackboneKind::ConvResidual => {
                LoadedBackbone::ConvResidual(ConvResidualNet::new(spec, device))
            }
            BackboneKind::AttentionConv => {
                LoadedBackbone::AttentionConv(AttentionConvNet::new(spec, device))
            }
            BackboneKind::VisionTransformer => {
                LoadedBackbone::VisionTransformer(VisionTransformerNet::new(spec, device))
            }
            BackboneKind::MobileLight => {
                LoadedBackbone::MobileLight(MobileLightNet::new(spec, device))
            }
        })
    }

    /// Build a backbone and load saved weights into it.
    pub fn load(spec: &ArchitectureSpec, weights: &Path, device: &B::Device) -> Result<Self> {
        spec.validate()?;
        let recorder = CompactRecorder::new();

        let map_err = |e: burn::record::RecorderError| {
            PavementError::Serialization(format!(
                "failed to load weights from {}: {}",
                weights.display(),
                e
            ))
        };

        Ok(match spec.backbone {
            BackboneKind::ConvResidual => LoadedBackbone::ConvResidual(
                ConvResidualNet::new(spec, device)
                    .load_file(weights, &recorder, device)
                    .map_err(map_err)?,
            ),
            BackboneKind::AttentionConv => LoadedBackbone::AttentionConv(
                AttentionConvNet::new(spec, device)
                    .load_file(weights, &recorder, device)
                    .map_err(map_err)?,
            ),
            BackboneKind::VisionTransformer => LoadedBackbone::VisionTransformer(
                VisionTransformerNet::new(spec, device)
                    .load_file(weights, &recorder, device)
                    .map_err(map_err)?,
            ),
            BackboneKind::MobileLight => LoadedBackbone::MobileLight(
                MobileLightNet::new(spec, device)
                    .load_file(weights, &recorder, device)
                    .map_err(map_err)?,
            ),
        })
    }

    /// Forward pass dispatching to the concrete module.
    pub fn forward(&self, images: Tensor<B, 4>) -> BackboneOutput<B> {
        match self {
            LoadedBackbone::ConvResidual(m) => m.forward(images),
            LoadedBackbone::AttentionConv(m) => m.forward(images),
            LoadedBackbone::VisionTransformer(m) => m.forward(images),
            LoadedBackbone::MobileLight(m) => m.forward(images),
        }
    }

    pub fn kind(&self) -> BackboneKind {
        match self {
            LoadedBackbone::ConvResidual(_) => BackboneKind::ConvResidual,
            LoadedBackbone::AttentionConv(_) => BackboneKind::AttentionConv,
            LoadedBackbone::VisionTransformer(_) => BackboneKind::VisionTransformer,
            LoadedBackbone::MobileLight(_) => BackboneKind::MobileLight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{default_device, DefaultBackend};
    use crate::NUM_CONDITION_CLASSES;

    #[test]
    fn test_init_all_kinds() {
        let device = default_device();
        for mut spec in [
            ArchitectureSpec::conv_residual(32),
            ArchitectureSpec::attention_conv(32),
            ArchitectureSpec::vision_transformer(32),
            ArchitectureSpec::mobile_light(32),
        ] {
            if spec.backbone == BackboneKind::VisionTransformer {
                spec.embed_dim = 32;
                spec.depth = 2;
            }
            let model = LoadedBackbone::<DefaultBackend>::init(&spec, &device).unwrap();
            assert_eq!(model.kind(), spec.backbone);

            let input = Tensor::<DefaultBackend, 4>::zeros([1, 3, 32, 32], &device);
            let output = model.forward(input);
            assert_eq!(output.condition.dims(), [1, NUM_CONDITION_CLASSES]);
        }
    }

    #[test]
    fn test_invalid_spec_fails_before_allocation() {
        let device = default_device();
        let mut spec = ArchitectureSpec::vision_transformer(30);
        spec.patch_size = 8;
        let err = LoadedBackbone::<DefaultBackend>::init(&spec, &device).unwrap_err();
        assert!(matches!(err, PavementError::UnsupportedArchitecture(_)));
    }

    #[test]
    fn test_load_missing_weights_fails() {
        let device = default_device();
        let spec = ArchitectureSpec::mobile_light(32);
        let err = LoadedBackbone::<DefaultBackend>::load(
            &spec,
            Path::new("/nonexistent/weights"),
            &device,
        )
        .unwrap_err();
        assert!(matches!(err, PavementError::Serialization(_)));
    }
}
