//! Vision transformer backbone.
//!
//! Strided-conv patch embedding, sinusoidal positional encoding, and a
//! stack of pre-norm transformer blocks with hand-rolled multi-head
//! attention. Mean pooling over patch tokens feeds the shared head.

use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Dropout, DropoutConfig, Gelu, LayerNorm, LayerNormConfig, Linear, LinearConfig,
    },
    tensor::{activation::softmax, backend::Backend, Tensor, TensorData},
};

use crate::model::conv::ClassifierHead;
use crate::model::factory::BackboneOutput;
use crate::model::spec::ArchitectureSpec;
use crate::IMAGE_CHANNELS;

/// Multi-head self-attention over patch tokens.
#[derive(Module, Debug)]
pub struct MultiHeadAttention<B: Backend> {
    query: Linear<B>,
    key: Linear<B>,
    value: Linear<B>,
    proj: Linear<B>,
    num_heads: usize,
    head_dim: usize,
}

impl<B: Backend> MultiHeadAttention<B> {
    pub fn new(embed_dim: usize, num_heads: usize, device: &B::Device) -> Self {
        Self {
            query: LinearConfig::new(embed_dim, embed_dim).init(device),
            key: LinearConfig::new(embed_dim, embed_dim).init(device),
            value: LinearConfig::new(embed_dim, embed_dim).init(device),
            proj: LinearConfig::new(embed_dim, embed_dim).init(device),
            num_heads,
            head_dim: embed_dim / num_heads,
        }
    }

    /// Input and output shape: [batch, tokens, embed_dim].
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, tokens, embed_dim] = x.dims();
        let heads = self.num_heads;
        let head_dim = self.head_dim;

        let split = |t: Tensor<B, 3>| {
            t.reshape([batch, tokens, heads, head_dim]).swap_dims(1, 2)
        };

        let q = split(self.query.forward(x.clone()));
        let k = split(self.key.forward(x.clone()));
        let v = split(self.value.forward(x));

        // [batch, heads, tokens, tokens]
        let scores = q
            .matmul(k.swap_dims(2, 3))
            .div_scalar((head_dim as f32).sqrt());
        let attention = softmax(scores, 3);

        let context = attention
            .matmul(v)
            .swap_dims(1, 2)
            .reshape([batch, tokens, embed_dim]);

        self.proj.forward(context)
    }
}

/// Pre-norm transformer block.
#[derive(Module, Debug)]
pub struct TransformerBlock<B: Backend> {
    norm1: LayerNorm<B>,
    attention: MultiHeadAttention<B>,
    norm2: LayerNorm<B>,
    mlp_in: Linear<B>,
    mlp_out: Linear<B>,
    gelu: Gelu,
    dropout: Dropout,
}

impl<B: Backend> TransformerBlock<B> {
    pub fn new(embed_dim: usize, num_heads: usize, dropout: f64, device: &B::Device) -> Self {
        Self {
            norm1: LayerNormConfig::new(embed_dim).init(device),
            attention: MultiHeadAttention::new(embed_dim, num_heads, device),
            norm2: LayerNormConfig::new(embed_dim).init(device),
            mlp_in: LinearConfig::new(embed_dim, embed_dim * 4).init(device),
            mlp_out: LinearConfig::new(embed_dim * 4, embed_dim).init(device),
            gelu: Gelu::new(),
            dropout: DropoutConfig::new(dropout).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = x.clone() + self.attention.forward(self.norm1.forward(x));

        let mlp = self.mlp_in.forward(self.norm2.forward(x.clone()));
        let mlp = self.gelu.forward(mlp);
        let mlp = self.dropout.forward(mlp);
        let mlp = self.mlp_out.forward(mlp);

        x + mlp
    }
}

/// Fixed sinusoidal positional encoding, shape [1, tokens, embed_dim].
fn positional_encoding<B: Backend>(
    tokens: usize,
    embed_dim: usize,
    device: &B::Device,
) -> Tensor<B, 3> {
    let mut data = vec![0.0f32; tokens * embed_dim];
    for pos in 0..tokens {
        for i in 0..embed_dim {
            let exponent = (2 * (i / 2)) as f32 / embed_dim as f32;
            let angle = pos as f32 / 10_000f32.powf(exponent);
            data[pos * embed_dim + i] = if i % 2 == 0 { angle.sin() } else { angle.cos() };
        }
    }
    Tensor::from_floats(TensorData::new(data, [1, tokens, embed_dim]), device)
}

/// Vision transformer backbone.
#[derive(Module, Debug)]
pub struct VisionTransformerNet<B: Backend> {
    patch_embed: Conv2d<B>,
    blocks: Vec<TransformerBlock<B>>,
    norm: LayerNorm<B>,
    head: ClassifierHead<B>,
    tokens: usize,
    embed_dim: usize,
}

impl<B: Backend> VisionTransformerNet<B> {
    pub fn new(spec: &ArchitectureSpec, device: &B::Device) -> Self {
        let patches_per_side = spec.image_size / spec.patch_size;
        let tokens = patches_per_side * patches_per_side;

        let patch_embed = Conv2dConfig::new(
            [IMAGE_CHANNELS, spec.embed_dim],
            [spec.patch_size, spec.patch_size],
        )
        .with_stride([spec.patch_size, spec.patch_size])
        .init(device);

        let blocks = (0..spec.depth)
            .map(|_| TransformerBlock::new(spec.embed_dim, spec.num_heads, spec.dropout, device))
            .collect();

        Self {
            patch_embed,
            blocks,
            norm: LayerNormConfig::new(spec.embed_dim).init(device),
            head: ClassifierHead::new(spec.embed_dim, 128, spec.heads.crack_head, spec.dropout, device),
            tokens,
            embed_dim: spec.embed_dim,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> BackboneOutput<B> {
        let device = x.device();
        let [batch, _, _, _] = x.dims();

        // [B, C, H, W] -> [B, D, T] -> [B, T, D]
        let x = self.patch_embed.forward(x);
        let x = x.reshape([batch, self.embed_dim, self.tokens]).swap_dims(1, 2);

        let x = x + positional_encoding::<B>(self.tokens, self.embed_dim, &device);

        let mut x = x;
        for block in &self.blocks {
            x = block.forward(x);
        }
        let x = self.norm.forward(x);

        // Mean over tokens: [B, T, D] -> [B, D]
        let x = x.mean_dim(1).reshape([batch, self.embed_dim]);
        self.head.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{default_device, DefaultBackend};
    use crate::{NUM_CONDITION_CLASSES, NUM_CRACK_CLASSES};

    #[test]
    fn test_vit_output_shape() {
        let device = default_device();
        let mut spec = ArchitectureSpec::vision_transformer(32);
        spec.patch_size = 8;
        spec.embed_dim = 32;
        spec.num_heads = 4;
        spec.depth = 2;

        let model = VisionTransformerNet::<DefaultBackend>::new(&spec, &device);
        let input = Tensor::<DefaultBackend, 4>::zeros([2, 3, 32, 32], &device);
        let output = model.forward(input);

        assert_eq!(output.condition.dims(), [2, NUM_CONDITION_CLASSES]);
        assert!(output.crack.is_none());
    }

    #[test]
    fn test_vit_crack_head_shape() {
        let device = default_device();
        let mut spec = ArchitectureSpec::vision_transformer(16).with_crack_head();
        spec.patch_size = 4;
        spec.embed_dim = 16;
        spec.num_heads = 2;
        spec.depth = 1;

        let model = VisionTransformerNet::<DefaultBackend>::new(&spec, &device);
        let input = Tensor::<DefaultBackend, 4>::zeros([1, 3, 16, 16], &device);
        let output = model.forward(input);

        assert_eq!(output.crack.unwrap().dims(), [1, NUM_CRACK_CLASSES]);
    }

    #[test]
    fn test_attention_preserves_shape() {
        let device = default_device();
        let attn = MultiHeadAttention::<DefaultBackend>::new(16, 4, &device);
        let x = Tensor::<DefaultBackend, 3>::zeros([2, 9, 16], &device);
        assert_eq!(attn.forward(x).dims(), [2, 9, 16]);
    }
}
