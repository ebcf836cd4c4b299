//! Model architectures and construction.

pub mod conv;
pub mod factory;
pub mod spec;
pub mod vit;

pub use conv::{AttentionConvNet, ConvBlock, ConvResidualNet, MobileLightNet};
pub use factory::{Backbone, BackboneOutput, LoadedBackbone};
pub use spec::{ArchitectureSpec, BackboneKind, HeadConfig};
pub use vit::VisionTransformerNet;
