//! Perceiver-style projector mapping image-encoder token sequences to a
//! fixed number of conditioning tokens in the text embedding width.
//!
//! A small set of learned query latents repeatedly cross-attends to the
//! input tokens, so the output length is independent of the input length.
use candle::{Result, Tensor, D};
use candle_nn as nn;
use candle_nn::Module;

#[derive(Debug, Clone, Copy)]
pub struct FeatureProjectorConfig {
    pub dim: usize,
    pub depth: usize,
    pub dim_head: usize,
    pub heads: usize,
    pub num_queries: usize,
    pub embedding_dim: usize,
    pub output_dim: usize,
    pub ff_mult: usize,
}

impl Default for FeatureProjectorConfig {
    fn default() -> Self {
        Self {
            dim: 768,
            depth: 4,
            dim_head: 64,
            heads: 12,
            num_queries: 16,
            embedding_dim: 1280,
            output_dim: 768,
            ff_mult: 4,
        }
    }
}

#[derive(Debug)]
struct PerceiverAttention {
    norm1: nn::LayerNorm,
    norm2: nn::LayerNorm,
    to_q: nn::Linear,
    to_kv: nn::Linear,
    to_out: nn::Linear,
    heads: usize,
    scale: f64,
    span: tracing::Span,
}

impl PerceiverAttention {
    fn new(vs: nn::VarBuilder, dim: usize, dim_head: usize, heads: usize) -> Result<Self> {
        let inner_dim = dim_head * heads;
        let norm1 = nn::layer_norm(dim, 1e-5, vs.pp("norm1"))?;
        let norm2 = nn::layer_norm(dim, 1e-5, vs.pp("norm2"))?;
        let to_q = nn::linear_no_bias(dim, inner_dim, vs.pp("to_q"))?;
        let to_kv = nn::linear_no_bias(dim, inner_dim * 2, vs.pp("to_kv"))?;
        let to_out = nn::linear_no_bias(inner_dim, dim, vs.pp("to_out"))?;
        let scale = 1.0 / f64::sqrt(dim_head as f64);
        let span = tracing::span!(tracing::Level::TRACE, "perceiver-attn");
        Ok(Self {
            norm1,
            norm2,
            to_q,
            to_kv,
            to_out,
            heads,
            scale,
            span,
        })
    }

    fn separate_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, seq, inner) = xs.dims3()?;
        xs.reshape((b, seq, self.heads, inner / self.heads))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(&self, xs: &Tensor, latents: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let xs = self.norm1.forward(xs)?;
        let latents = self.norm2.forward(latents)?;
        let (b, l, _) = latents.dims3()?;

        let q = self.to_q.forward(&latents)?;
        // Keys and values attend over the inputs and the latents together.
        let kv_input = Tensor::cat(&[&xs, &latents], 1)?;
        let kv = self.to_kv.forward(&kv_input)?.chunk(2, D::Minus1)?;
        let (k, v) = (&kv[0], &kv[1]);

        let q = self.separate_heads(&q)?;
        let k = self.separate_heads(k)?;
        let v = self.separate_heads(v)?;

        let weight = (q.matmul(&k.t()?)? * self.scale)?;
        let weight = nn::ops::softmax_last_dim(&weight)?;
        let out = weight.matmul(&v)?;
        let out = out
            .transpose(1, 2)?
            .reshape((b, l, self.heads * q.dim(D::Minus1)?))?;
        self.to_out.forward(&out)
    }
}

// LayerNorm, Linear, GELU, Linear with the sequential index layout.
#[derive(Debug)]
struct FeedForward {
    norm: nn::LayerNorm,
    proj_in: nn::Linear,
    proj_out: nn::Linear,
    span: tracing::Span,
}

impl FeedForward {
    fn new(vs: nn::VarBuilder, dim: usize, mult: usize) -> Result<Self> {
        let norm = nn::layer_norm(dim, 1e-5, vs.pp("0"))?;
        let proj_in = nn::linear_no_bias(dim, dim * mult, vs.pp("1"))?;
        let proj_out = nn::linear_no_bias(dim * mult, dim, vs.pp("3"))?;
        let span = tracing::span!(tracing::Level::TRACE, "projector-ff");
        Ok(Self {
            norm,
            proj_in,
            proj_out,
            span,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let xs = self.norm.forward(xs)?;
        let xs = self.proj_in.forward(&xs)?.gelu_erf()?;
        self.proj_out.forward(&xs)
    }
}

#[derive(Debug)]
pub struct FeatureProjector {
    latents: Tensor,
    proj_in: nn::Linear,
    proj_out: nn::Linear,
    norm_out: nn::LayerNorm,
    layers: Vec<(PerceiverAttention, FeedForward)>,
    span: tracing::Span,
    pub config: FeatureProjectorConfig,
}

impl FeatureProjector {
    pub fn new(vs: nn::VarBuilder, config: FeatureProjectorConfig) -> Result<Self> {
        let latents = vs.get((1, config.num_queries, config.dim), "latents")?;
        let proj_in = nn::linear(config.embedding_dim, config.dim, vs.pp("proj_in"))?;
        let proj_out = nn::linear(config.dim, config.output_dim, vs.pp("proj_out"))?;
        let norm_out = nn::layer_norm(config.output_dim, 1e-5, vs.pp("norm_out"))?;
        let vs_layers = vs.pp("layers");
        let mut layers = Vec::with_capacity(config.depth);
        for i in 0..config.depth {
            let vs_layer = vs_layers.pp(i.to_string());
            let attn =
                PerceiverAttention::new(vs_layer.pp("0"), config.dim, config.dim_head, config.heads)?;
            let ff = FeedForward::new(vs_layer.pp("1"), config.dim, config.ff_mult)?;
            layers.push((attn, ff))
        }
        let span = tracing::span!(tracing::Level::TRACE, "feature-projector");
        Ok(Self {
            latents,
            proj_in,
            proj_out,
            norm_out,
            layers,
            span,
            config,
        })
    }

    /// Maps `(batch, source_len, embedding_dim)` image-encoder tokens to
    /// `(batch, num_queries, output_dim)` conditioning tokens.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let batch_size = xs.dim(0)?;
        let mut latents = self
            .latents
            .expand((batch_size, self.config.num_queries, self.config.dim))?
            .contiguous()?;
        let xs = self.proj_in.forward(xs)?;
        for (attn, ff) in self.layers.iter() {
            latents = (attn.forward(&xs, &latents)? + latents)?;
            latents = (ff.forward(&latents)? + latents)?;
        }
        let out = self.proj_out.forward(&latents)?;
        self.norm_out.forward(&out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device, IndexOp};

    fn tiny_config() -> FeatureProjectorConfig {
        FeatureProjectorConfig {
            dim: 8,
            depth: 2,
            dim_head: 4,
            heads: 2,
            num_queries: 4,
            embedding_dim: 6,
            output_dim: 10,
            ff_mult: 2,
        }
    }

    #[test]
    fn output_length_is_fixed_by_the_query_count() {
        let device = Device::Cpu;
        let vs = nn::VarBuilder::zeros(DType::F32, &device);
        let config = tiny_config();
        let projector = FeatureProjector::new(vs, config).unwrap();
        for source_len in [1usize, 17, 257] {
            let xs = Tensor::zeros((2, source_len, config.embedding_dim), DType::F32, &device)
                .unwrap();
            let out = projector.forward(&xs).unwrap();
            assert_eq!(out.dims(), &[2, config.num_queries, config.output_dim]);
        }
    }

    #[test]
    fn latents_broadcast_over_the_batch() {
        let device = Device::Cpu;
        device.set_seed(42).ok();
        let vs = nn::VarBuilder::zeros(DType::F32, &device);
        let projector = FeatureProjector::new(vs, tiny_config()).unwrap();
        let one = Tensor::randn(0f32, 1f32, (1, 5, 6), &device).unwrap();
        let twice = Tensor::cat(&[&one, &one], 0).unwrap();
        let out = projector.forward(&twice).unwrap();
        let a = out.i(0).unwrap().to_vec2::<f32>().unwrap();
        let b = out.i(1).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
    }
}
