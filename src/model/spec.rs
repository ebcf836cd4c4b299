//! Architecture specifications.
//!
//! The set of supported backbones is a closed enum: an unsupported name
//! fails at spec time, before any tensor is allocated, and loading a
//! saved artifact dispatches over the same tag.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PavementError, Result};

/// Supported backbone families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackboneKind {
    /// CNN with residual skip connections
    ConvResidual,
    /// CNN with a spatial-attention gate between stages
    AttentionConv,
    /// Patch-based vision transformer
    VisionTransformer,
    /// Small depth-reduced CNN for edge deployment
    MobileLight,
}

impl BackboneKind {
    pub const ALL: [BackboneKind; 4] = [
        BackboneKind::ConvResidual,
        BackboneKind::AttentionConv,
        BackboneKind::VisionTransformer,
        BackboneKind::MobileLight,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackboneKind::ConvResidual => "conv_residual",
            BackboneKind::AttentionConv => "attention_conv",
            BackboneKind::VisionTransformer => "vision_transformer",
            BackboneKind::MobileLight => "mobile_light",
        }
    }
}

impl FromStr for BackboneKind {
    type Err = PavementError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "conv_residual" => Ok(BackboneKind::ConvResidual),
            "attention_conv" => Ok(BackboneKind::AttentionConv),
            "vision_transformer" => Ok(BackboneKind::VisionTransformer),
            "mobile_light" => Ok(BackboneKind::MobileLight),
            other => Err(PavementError::UnsupportedArchitecture(format!(
                "unknown backbone '{}', expected one of: conv_residual, attention_conv, vision_transformer, mobile_light",
                other
            ))),
        }
    }
}

impl std::fmt::Display for BackboneKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Task head configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadConfig {
    /// Attach the auxiliary crack-type head
    pub crack_head: bool,
    /// Weight of the crack loss relative to the condition loss
    pub crack_loss_weight: f64,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            crack_head: false,
            crack_loss_weight: 0.5,
        }
    }
}

/// Complete description of a trainable model.
///
/// `base_filters`/`depth` parameterize the convolutional families;
/// `embed_dim`/`num_heads`/`patch_size` only matter for the transformer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureSpec {
    /// Human-readable name used in experiment records and logs
    pub name: String,
    /// Backbone family
    pub backbone: BackboneKind,
    /// Square input side length
    pub image_size: usize,
    /// Base channel count for conv families
    pub base_filters: usize,
    /// Residual stages or transformer blocks
    pub depth: usize,
    /// Transformer embedding dimension
    pub embed_dim: usize,
    /// Transformer attention heads
    pub num_heads: usize,
    /// Transformer patch side length
    pub patch_size: usize,
    /// Dropout rate in the classifier head
    pub dropout: f64,
    /// Task heads
    pub heads: HeadConfig,
}

impl ArchitectureSpec {
    /// Residual CNN, the workhorse configuration.
    pub fn conv_residual(image_size: usize) -> Self {
        Self {
            name: "conv_residual".to_string(),
            backbone: BackboneKind::ConvResidual,
            image_size,
            base_filters: 32,
            depth: 3,
            embed_dim: 0,
            num_heads: 0,
            patch_size: 0,
            dropout: 0.3,
            heads: HeadConfig::default(),
        }
    }

    /// Residual CNN with a spatial-attention gate.
    pub fn attention_conv(image_size: usize) -> Self {
        Self {
            name: "attention_conv".to_string(),
            backbone: BackboneKind::AttentionConv,
            ..Self::conv_residual(image_size)
        }
    }

    /// Small vision transformer.
    pub fn vision_transformer(image_size: usize) -> Self {
        Self {
            name: "vision_transformer".to_string(),
            backbone: BackboneKind::VisionTransformer,
            image_size,
            base_filters: 0,
            depth: 4,
            embed_dim: 64,
            num_heads: 4,
            patch_size: 8,
            dropout: 0.1,
            heads: HeadConfig::default(),
        }
    }

    /// Lightweight CNN for mobile/edge deployment.
    pub fn mobile_light(image_size: usize) -> Self {
        Self {
            name: "mobile_light".to_string(),
            backbone: BackboneKind::MobileLight,
            base_filters: 16,
            depth: 3,
            dropout: 0.2,
            ..Self::conv_residual(image_size)
        }
    }

    /// Enable the auxiliary crack head.
    pub fn with_crack_head(mut self) -> Self {
        self.heads.crack_head = true;
        self
    }

    /// Validate all parameters. Called by the factory before any
    /// allocation happens.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(PavementError::UnsupportedArchitecture(
                "spec name must not be empty".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(PavementError::UnsupportedArchitecture(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.heads.crack_head && self.heads.crack_loss_weight <= 0.0 {
            return Err(PavementError::UnsupportedArchitecture(
                "crack_loss_weight must be positive when the crack head is enabled".to_string(),
            ));
        }

        match self.backbone {
            BackboneKind::ConvResidual | BackboneKind::AttentionConv | BackboneKind::MobileLight => {
                if self.base_filters < 4 {
                    return Err(PavementError::UnsupportedArchitecture(format!(
                        "base_filters must be at least 4, got {}",
                        self.base_filters
                    )));
                }
                if !(1..=5).contains(&self.depth) {
                    return Err(PavementError::UnsupportedArchitecture(format!(
                        "depth must be in 1..=5, got {}",
                        self.depth
                    )));
                }
                // Each stage halves the spatial resolution
                if self.image_size < (1 << self.depth) * 2 {
                    return Err(PavementError::UnsupportedArchitecture(format!(
                        "image_size {} too small for {} pooling stages",
                        self.image_size, self.depth
                    )));
                }
            }
            BackboneKind::VisionTransformer => {
                if self.patch_size == 0 || self.image_size % self.patch_size != 0 {
                    return Err(PavementError::UnsupportedArchitecture(format!(
                        "image_size {} must be divisible by patch_size {}",
                        self.image_size, self.patch_size
                    )));
                }
                if self.num_heads == 0 || self.embed_dim % self.num_heads != 0 {
                    return Err(PavementError::UnsupportedArchitecture(format!(
                        "embed_dim {} must be divisible by num_heads {}",
                        self.embed_dim, self.num_heads
                    )));
                }
                if !(1..=12).contains(&self.depth) {
                    return Err(PavementError::UnsupportedArchitecture(format!(
                        "depth must be in 1..=12, got {}",
                        self.depth
                    )));
                }
            }
        }
        Ok(())
    }
}
