//! Convolutional backbone families.
//!
//! Three CNN variants share the same building blocks: a residual
//! network, a residual network with a spatial-attention gate, and a
//! depth-reduced mobile variant.

use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
        Relu,
    },
    tensor::{activation::sigmoid, backend::Backend, Tensor},
};

use crate::model::factory::BackboneOutput;
use crate::model::spec::ArchitectureSpec;
use crate::{IMAGE_CHANNELS, NUM_CONDITION_CLASSES, NUM_CRACK_CLASSES};

/// Conv2d + BatchNorm + ReLU with an optional 2x2 max pool.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
    pub relu: Relu,
    pub pool: Option<MaxPool2d>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        with_pool: bool,
        device: &B::Device,
    ) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
            .with_padding(PaddingConfig2d::Same)
            .init(device);
        let bn = BatchNormConfig::new(out_channels).init(device);
        let pool = if with_pool {
            Some(MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init())
        } else {
            None
        };

        Self {
            conv,
            bn,
            relu: Relu::new(),
            pool,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        let x = self.relu.forward(x);
        match &self.pool {
            Some(pool) => pool.forward(x),
            None => x,
        }
    }
}

/// Two-conv residual block with a 1x1 projection when channels change.
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    projection: Option<Conv2d<B>>,
    relu: Relu,
}

impl<B: Backend> ResidualBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv1 = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);
        let bn1 = BatchNormConfig::new(out_channels).init(device);
        let conv2 = Conv2dConfig::new([out_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);
        let bn2 = BatchNormConfig::new(out_channels).init(device);

        let projection = if in_channels != out_channels {
            Some(
                Conv2dConfig::new([in_channels, out_channels], [1, 1])
                    .init(device),
            )
        } else {
            None
        };

        Self {
            conv1,
            bn1,
            conv2,
            bn2,
            projection,
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let skip = match &self.projection {
            Some(proj) => proj.forward(x.clone()),
            None => x.clone(),
        };

        let y = self.conv1.forward(x);
        let y = self.bn1.forward(y);
        let y = self.relu.forward(y);
        let y = self.conv2.forward(y);
        let y = self.bn2.forward(y);

        self.relu.forward(y + skip)
    }
}

/// Residual block followed by a 2x2 max pool.
#[derive(Module, Debug)]
pub struct ResidualStage<B: Backend> {
    block: ResidualBlock<B>,
    pool: MaxPool2d,
}

impl<B: Backend> ResidualStage<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            block: ResidualBlock::new(in_channels, out_channels, device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.pool.forward(self.block.forward(x))
    }
}

/// Spatial attention gate: a 7x7 conv collapses channels to one
/// attention map which rescales the feature map.
#[derive(Module, Debug)]
pub struct SpatialAttention<B: Backend> {
    conv: Conv2d<B>,
}

impl<B: Backend> SpatialAttention<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([channels, 1], [7, 7])
            .with_padding(PaddingConfig2d::Same)
            .init(device);
        Self { conv }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let attention = sigmoid(self.conv.forward(x.clone()));
        // [B, 1, H, W] broadcasts over channels
        x * attention
    }
}

/// Shared classifier head: pooled features through a hidden layer into
/// the condition logits, with an optional crack-type branch.
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    fc: Linear<B>,
    dropout: Dropout,
    condition: Linear<B>,
    crack: Option<Linear<B>>,
    relu: Relu,
}

impl<B: Backend> ClassifierHead<B> {
    pub fn new(in_features: usize, hidden: usize, crack_head: bool, dropout: f64, device: &B::Device) -> Self {
        Self {
            fc: LinearConfig::new(in_features, hidden).init(device),
            dropout: DropoutConfig::new(dropout).init(),
            condition: LinearConfig::new(hidden, NUM_CONDITION_CLASSES).init(device),
            crack: crack_head.then(|| LinearConfig::new(hidden, NUM_CRACK_CLASSES).init(device)),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, features: Tensor<B, 2>) -> BackboneOutput<B> {
        let hidden = self.fc.forward(features);
        let hidden = self.relu.forward(hidden);
        let hidden = self.dropout.forward(hidden);

        BackboneOutput {
            condition: self.condition.forward(hidden.clone()),
            crack: self.crack.as_ref().map(|head| head.forward(hidden)),
        }
    }
}

/// Residual CNN backbone.
///
/// Stem halves the resolution once, then each residual stage doubles
/// the channels and halves the resolution again.
#[derive(Module, Debug)]
pub struct ConvResidualNet<B: Backend> {
    stem: ConvBlock<B>,
    stages: Vec<ResidualStage<B>>,
    global_pool: AdaptiveAvgPool2d,
    head: ClassifierHead<B>,
}

impl<B: Backend> ConvResidualNet<B> {
    pub fn new(spec: &ArchitectureSpec, device: &B::Device) -> Self {
        let base = spec.base_filters;
        let stem = ConvBlock::new(IMAGE_CHANNELS, base, 3, true, device);

        let mut stages = Vec::with_capacity(spec.depth);
        let mut channels = base;
        for _ in 0..spec.depth {
            stages.push(ResidualStage::new(channels, channels * 2, device));
            channels *= 2;
        }

        Self {
            stem,
            stages,
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            head: ClassifierHead::new(channels, 256, spec.heads.crack_head, spec.dropout, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> BackboneOutput<B> {
        let mut x = self.stem.forward(x);
        for stage in &self.stages {
            x = stage.forward(x);
        }

        let x = self.global_pool.forward(x);
        let [batch_size, channels, _, _] = x.dims();
        self.head.forward(x.reshape([batch_size, channels]))
    }
}

/// Residual CNN with a spatial-attention gate before global pooling.
#[derive(Module, Debug)]
pub struct AttentionConvNet<B: Backend> {
    stem: ConvBlock<B>,
    stages: Vec<ResidualStage<B>>,
    attention: SpatialAttention<B>,
    global_pool: AdaptiveAvgPool2d,
    head: ClassifierHead<B>,
}

impl<B: Backend> AttentionConvNet<B> {
    pub fn new(spec: &ArchitectureSpec, device: &B::Device) -> Self {
        let base = spec.base_filters;
        let stem = ConvBlock::new(IMAGE_CHANNELS, base, 3, true, device);

        let mut stages = Vec::with_capacity(spec.depth);
        let mut channels = base;
        for _ in 0..spec.depth {
            stages.push(ResidualStage::new(channels, channels * 2, device));
            channels *= 2;
        }

        Self {
            stem,
            stages,
            attention: SpatialAttention::new(channels, device),
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            head: ClassifierHead::new(channels, 256, spec.heads.crack_head, spec.dropout, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> BackboneOutput<B> {
        let mut x = self.stem.forward(x);
        for stage in &self.stages {
            x = stage.forward(x);
        }
        let x = self.attention.forward(x);

        let x = self.global_pool.forward(x);
        let [batch_size, channels, _, _] = x.dims();
        self.head.forward(x.reshape([batch_size, channels]))
    }
}

/// Lightweight CNN for edge deployment: three plain conv blocks, no
/// residual connections, small head.
#[derive(Module, Debug)]
pub struct MobileLightNet<B: Backend> {
    block1: ConvBlock<B>,
    block2: ConvBlock<B>,
    block3: ConvBlock<B>,
    global_pool: AdaptiveAvgPool2d,
    head: ClassifierHead<B>,
}

impl<B: Backend> MobileLightNet<B> {
    pub fn new(spec: &ArchitectureSpec, device: &B::Device) -> Self {
        let base = spec.base_filters;

        Self {
            block1: ConvBlock::new(IMAGE_CHANNELS, base, 3, true, device),
            block2: ConvBlock::new(base, base * 2, 3, true, device),
            block3: ConvBlock::new(base * 2, base * 4, 3, false, device),
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            head: ClassifierHead::new(base * 4, 128, spec.heads.crack_head, spec.dropout, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> BackboneOutput<B> {
        let x = self.block1.forward(x);
        let x = self.block2.forward(x);
        let x = self.block3.forward(x);

        let x = self.global_pool.forward(x);
        let [batch_size, channels, _, _] = x.dims();
        self.head.forward(x.reshape([batch_size, channels]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{default_device, DefaultBackend};

    #[test]
    fn test_conv_residual_output_shape() {
        let device = default_device();
        let spec = ArchitectureSpec::conv_residual(32);
        let model = ConvResidualNet::<DefaultBackend>::new(&spec, &device);

        let input = Tensor::<DefaultBackend, 4>::zeros([2, 3, 32, 32], &device);
        let output = model.forward(input);

        assert_eq!(output.condition.dims(), [2, NUM_CONDITION_CLASSES]);
        assert!(output.crack.is_none());
    }

    #[test]
    fn test_attention_conv_with_crack_head() {
        let device = default_device();
        let spec = ArchitectureSpec::attention_conv(32).with_crack_head();
        let model = AttentionConvNet::<DefaultBackend>::new(&spec, &device);

        let input = Tensor::<DefaultBackend, 4>::zeros([1, 3, 32, 32], &device);
        let output = model.forward(input);

        assert_eq!(output.condition.dims(), [1, NUM_CONDITION_CLASSES]);
        assert_eq!(output.crack.unwrap().dims(), [1, NUM_CRACK_CLASSES]);
    }

    #[test]
    fn test_mobile_light_output_shape() {
        let device = default_device();
        let spec = ArchitectureSpec::mobile_light(32);
        let model = MobileLightNet::<DefaultBackend>::new(&spec, &device);

        let input = Tensor::<DefaultBackend, 4>::zeros([3, 3, 32, 32], &device);
        let output = model.forward(input);

        assert_eq!(output.condition.dims(), [3, NUM_CONDITION_CLASSES]);
    }

    #[test]
    fn test_residual_projection_on_channel_change() {
        let device = default_device();
        let block = ResidualBlock::<DefaultBackend>::new(8, 16, &device);
        let input = Tensor::<DefaultBackend, 4>::zeros([1, 8, 8, 8], &device);
        assert_eq!(block.forward(input).dims(), [1, 16, 8, 8]);
    }
}
