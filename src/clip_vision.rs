//! CLIP vision transformer used as the image feature encoder.
//!
//! The open-CLIP ViT-H/14 checkpoint trained for image prompting. Conditioning
//! uses the penultimate encoder layer's token sequence rather than the pooled
//! projection, so the encoder here keeps the per-layer hidden states
//! addressable instead of collapsing to the class token.
//!
//! https://github.com/huggingface/transformers/tree/f6fa0f0bf0796ac66f201f23bdb8585de1609add/src/transformers/models/clip
use candle::{Result, Shape, Tensor, D};
use candle_nn as nn;
use candle_nn::Module;

#[derive(Debug, Clone)]
pub struct ClipVisionConfig {
    pub embed_dim: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_channels: usize,
    pub image_size: usize,
    pub patch_size: usize,
}

impl ClipVisionConfig {
    // The config details can be found in the "vision_config" section of the
    // image encoder shipped with the h94/IP-Adapter weights.
    pub fn vit_h_14() -> Self {
        Self {
            embed_dim: 1280,
            intermediate_size: 5120,
            num_hidden_layers: 32,
            num_attention_heads: 16,
            num_channels: 3,
            image_size: 224,
            patch_size: 14,
        }
    }
}

#[derive(Debug)]
struct ClipVisionEmbeddings {
    patch_embedding: nn::Conv2d,
    position_ids: Tensor,
    class_embedding: Tensor,
    position_embedding: nn::Embedding,
}

impl ClipVisionEmbeddings {
    fn new(vs: nn::VarBuilder, c: &ClipVisionConfig) -> Result<Self> {
        let class_embedding = vs.get(c.embed_dim, "class_embedding")?;
        let num_patches = (c.image_size / c.patch_size).pow(2);
        let num_positions = num_patches + 1;
        let position_ids = Tensor::arange(0, num_positions as i64, vs.device())?;
        let conv2dconfig = nn::Conv2dConfig {
            stride: c.patch_size,
            ..Default::default()
        };
        let position_embedding =
            nn::embedding(num_positions, c.embed_dim, vs.pp("position_embedding"))?;
        let patch_embedding = nn::conv2d_no_bias(
            c.num_channels,
            c.embed_dim,
            c.patch_size,
            conv2dconfig,
            vs.pp("patch_embedding"),
        )?;
        Ok(Self {
            patch_embedding,
            position_ids,
            class_embedding,
            position_embedding,
        })
    }
}

impl Module for ClipVisionEmbeddings {
    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let batch_size = pixel_values.dim(0)?;
        let patch_embeds = self
            .patch_embedding
            .forward(pixel_values)?
            .flatten_from(2)?
            .transpose(1, 2)?;
        let shape = Shape::from((batch_size, 1, self.class_embedding.dim(D::Minus1)?));
        let class_embeds = self.class_embedding.expand(shape)?;
        let embeddings = Tensor::cat(&[class_embeds, patch_embeds], 1)?;
        let position_embedding = self.position_embedding.forward(&self.position_ids)?;
        embeddings.broadcast_add(&position_embedding)
    }
}

#[derive(Debug)]
struct ClipAttention {
    k_proj: nn::Linear,
    v_proj: nn::Linear,
    q_proj: nn::Linear,
    out_proj: nn::Linear,
    head_dim: usize,
    scale: f64,
    num_attention_heads: usize,
}

impl ClipAttention {
    fn new(vs: nn::VarBuilder, c: &ClipVisionConfig) -> Result<Self> {
        let embed_dim = c.embed_dim;
        let num_attention_heads = c.num_attention_heads;
        let k_proj = nn::linear(embed_dim, embed_dim, vs.pp("k_proj"))?;
        let v_proj = nn::linear(embed_dim, embed_dim, vs.pp("v_proj"))?;
        let q_proj = nn::linear(embed_dim, embed_dim, vs.pp("q_proj"))?;
        let out_proj = nn::linear(embed_dim, embed_dim, vs.pp("out_proj"))?;
        let head_dim = embed_dim / num_attention_heads;
        let scale = (head_dim as f64).powf(-0.5);
        Ok(Self {
            k_proj,
            v_proj,
            q_proj,
            out_proj,
            head_dim,
            scale,
            num_attention_heads,
        })
    }

    fn shape(&self, xs: &Tensor, seq_len: usize, bsz: usize) -> Result<Tensor> {
        xs.reshape((bsz, seq_len, self.num_attention_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (bsz, seq_len, embed_dim) = xs.dims3()?;
        let query_states = (self.q_proj.forward(xs)? * self.scale)?;
        let proj_shape = (bsz * self.num_attention_heads, seq_len, self.head_dim);
        let query_states = self
            .shape(&query_states, seq_len, bsz)?
            .reshape(proj_shape)?;
        let key_states = self
            .shape(&self.k_proj.forward(xs)?, seq_len, bsz)?
            .reshape(proj_shape)?;
        let value_states = self
            .shape(&self.v_proj.forward(xs)?, seq_len, bsz)?
            .reshape(proj_shape)?;
        let attn_weights = query_states.matmul(&key_states.transpose(1, 2)?)?;
        let attn_weights = nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&value_states)?;
        let attn_output = attn_output
            .reshape((bsz, self.num_attention_heads, seq_len, self.head_dim))?
            .transpose(1, 2)?
            .reshape((bsz, seq_len, embed_dim))?;
        self.out_proj.forward(&attn_output)
    }
}

#[derive(Debug)]
struct ClipMlp {
    fc1: nn::Linear,
    fc2: nn::Linear,
}

impl ClipMlp {
    fn new(vs: nn::VarBuilder, c: &ClipVisionConfig) -> Result<Self> {
        let fc1 = nn::linear(c.embed_dim, c.intermediate_size, vs.pp("fc1"))?;
        let fc2 = nn::linear(c.intermediate_size, c.embed_dim, vs.pp("fc2"))?;
        Ok(Self { fc1, fc2 })
    }
}

impl Module for ClipMlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.fc1.forward(xs)?;
        self.fc2.forward(&xs.gelu_erf()?)
    }
}

#[derive(Debug)]
struct ClipEncoderLayer {
    self_attn: ClipAttention,
    layer_norm1: nn::LayerNorm,
    mlp: ClipMlp,
    layer_norm2: nn::LayerNorm,
}

impl ClipEncoderLayer {
    fn new(vs: nn::VarBuilder, c: &ClipVisionConfig) -> Result<Self> {
        let self_attn = ClipAttention::new(vs.pp("self_attn"), c)?;
        let layer_norm1 = nn::layer_norm(c.embed_dim, 1e-5, vs.pp("layer_norm1"))?;
        let mlp = ClipMlp::new(vs.pp("mlp"), c)?;
        let layer_norm2 = nn::layer_norm(c.embed_dim, 1e-5, vs.pp("layer_norm2"))?;
        Ok(Self {
            self_attn,
            layer_norm1,
            mlp,
            layer_norm2,
        })
    }
}

impl Module for ClipEncoderLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let residual = xs;
        let xs = self.layer_norm1.forward(xs)?;
        let xs = (self.self_attn.forward(&xs)? + residual)?;
        let residual = &xs;
        let ys = self.layer_norm2.forward(&xs)?;
        self.mlp.forward(&ys)? + residual
    }
}

#[derive(Debug)]
pub struct ClipVisionTransformer {
    embeddings: ClipVisionEmbeddings,
    layers: Vec<ClipEncoderLayer>,
    pre_layer_norm: nn::LayerNorm,
    span: tracing::Span,
}

impl ClipVisionTransformer {
    pub fn new(vs: nn::VarBuilder, c: &ClipVisionConfig) -> Result<Self> {
        let embeddings = ClipVisionEmbeddings::new(vs.pp("embeddings"), c)?;
        // "pre_layrnorm" is the upstream checkpoint's spelling.
        let pre_layer_norm = nn::layer_norm(c.embed_dim, 1e-5, vs.pp("pre_layrnorm"))?;
        let vs_layers = vs.pp("encoder.layers");
        let mut layers = Vec::with_capacity(c.num_hidden_layers);
        for index in 0..c.num_hidden_layers {
            layers.push(ClipEncoderLayer::new(vs_layers.pp(index.to_string()), c)?)
        }
        let span = tracing::span!(tracing::Level::TRACE, "clip-vision");
        Ok(Self {
            embeddings,
            layers,
            pre_layer_norm,
            span,
        })
    }

    /// Token sequence from the second-to-last encoder layer, without the
    /// final layer norm, shape `(batch, num_patches + 1, embed_dim)`.
    pub fn penultimate_hidden_state(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let mut xs = pixel_values
            .apply(&self.embeddings)?
            .apply(&self.pre_layer_norm)?;
        for layer in self.layers[..self.layers.len() - 1].iter() {
            xs = layer.forward(&xs)?
        }
        Ok(xs)
    }
}
