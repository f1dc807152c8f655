//! Attention building blocks for the two denoiser copies.
//!
//! The layers follow the usual latent-diffusion transformer layout, with one
//! twist: every attention layer carries an [`AttnProcessor`] chosen when the
//! denoiser is built. The processor decides whether the layer runs plain
//! attention, captures its key/value tensors into the shared
//! [`AttentionCache`] (reference denoiser), blends cached reference features
//! into self-attention (main denoiser), or mixes identity-token
//! cross-attention into the text-conditioned output (main denoiser).
use crate::cache::{AttentionCache, LayerId};
use candle::{DType, IndexOp, Result, Tensor, D};
use candle_nn as nn;
use candle_nn::Module;

/// Per-forward-pass conditioning handed down to every attention layer.
///
/// There is exactly one writer (the reference pass) and one reader (the main
/// pass) of the cache per timestep; the state is rebuilt for each forward
/// call so nothing leaks across passes.
pub struct ConditioningState<'a> {
    pub(crate) cache: &'a mut AttentionCache,
    pub(crate) ip_tokens: Option<&'a Tensor>,
    pub(crate) image_scale: f64,
    pub(crate) ipa_scale: f64,
}

impl<'a> ConditioningState<'a> {
    /// State for the reference pass: cache writes only.
    pub fn reference(cache: &'a mut AttentionCache) -> Self {
        Self {
            cache,
            ip_tokens: None,
            image_scale: 0.,
            ipa_scale: 0.,
        }
    }

    /// State for a main-denoiser pass.
    pub fn main(
        cache: &'a mut AttentionCache,
        ip_tokens: Option<&'a Tensor>,
        image_scale: f64,
        ipa_scale: f64,
    ) -> Self {
        Self {
            cache,
            ip_tokens,
            image_scale,
            ipa_scale,
        }
    }

    /// State for a network without reference or identity conditioning, e.g.
    /// the pose conditioner trunk.
    pub fn plain(cache: &'a mut AttentionCache) -> Self {
        Self::reference(cache)
    }
}

/// Per-layer behavior, fixed at model-build time.
#[derive(Debug)]
pub enum AttnProcessor {
    PlainSelf,
    PlainCross,
    /// Store this layer's key/value in the cache and pass the input through.
    CacheWrite { id: LayerId },
    /// Concatenate the cached reference key/value onto the local ones.
    ReferenceInject { id: LayerId },
    /// Blend identity-token cross-attention into the text cross-attention.
    IdentityCross {
        to_k_ip: nn::Linear,
        to_v_ip: nn::Linear,
    },
}

#[derive(Debug)]
struct GeGlu {
    proj: nn::Linear,
    span: tracing::Span,
}

impl GeGlu {
    fn new(vs: nn::VarBuilder, dim_in: usize, dim_out: usize) -> Result<Self> {
        let proj = nn::linear(dim_in, dim_out * 2, vs.pp("proj"))?;
        let span = tracing::span!(tracing::Level::TRACE, "geglu");
        Ok(Self { proj, span })
    }
}

impl Module for GeGlu {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let hidden_states_and_gate = self.proj.forward(xs)?.chunk(2, D::Minus1)?;
        &hidden_states_and_gate[0] * hidden_states_and_gate[1].gelu()?
    }
}

#[derive(Debug)]
struct FeedForward {
    project_in: GeGlu,
    linear: nn::Linear,
    span: tracing::Span,
}

impl FeedForward {
    fn new(vs: nn::VarBuilder, dim: usize, dim_out: Option<usize>, mult: usize) -> Result<Self> {
        let inner_dim = dim * mult;
        let dim_out = dim_out.unwrap_or(dim);
        let vs = vs.pp("net");
        let project_in = GeGlu::new(vs.pp("0"), dim, inner_dim)?;
        let linear = nn::linear(inner_dim, dim_out, vs.pp("2"))?;
        let span = tracing::span!(tracing::Level::TRACE, "ff");
        Ok(Self {
            project_in,
            linear,
            span,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let xs = self.project_in.forward(xs)?;
        self.linear.forward(&xs)
    }
}

#[cfg(feature = "flash-attn")]
fn flash_attn(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    softmax_scale: f32,
    causal: bool,
) -> Result<Tensor> {
    candle_flash_attn::flash_attn(q, k, v, softmax_scale, causal)
}

#[cfg(not(feature = "flash-attn"))]
fn flash_attn(_: &Tensor, _: &Tensor, _: &Tensor, _: f32, _: bool) -> Result<Tensor> {
    unimplemented!("compile with '--features flash-attn'")
}

#[derive(Debug)]
pub struct CrossAttention {
    to_q: nn::Linear,
    to_k: nn::Linear,
    to_v: nn::Linear,
    to_out: nn::Linear,
    processor: AttnProcessor,
    heads: usize,
    scale: f64,
    slice_size: Option<usize>,
    span: tracing::Span,
    span_attn: tracing::Span,
    span_softmax: tracing::Span,
    use_flash_attn: bool,
}

impl CrossAttention {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vs: nn::VarBuilder,
        query_dim: usize,
        context_dim: Option<usize>,
        heads: usize,
        dim_head: usize,
        slice_size: Option<usize>,
        use_flash_attn: bool,
        processor: AttnProcessor,
    ) -> Result<Self> {
        let inner_dim = dim_head * heads;
        let context_dim = context_dim.unwrap_or(query_dim);
        let scale = 1.0 / f64::sqrt(dim_head as f64);
        let to_q = nn::linear_no_bias(query_dim, inner_dim, vs.pp("to_q"))?;
        let to_k = nn::linear_no_bias(context_dim, inner_dim, vs.pp("to_k"))?;
        let to_v = nn::linear_no_bias(context_dim, inner_dim, vs.pp("to_v"))?;
        let to_out = nn::linear(inner_dim, query_dim, vs.pp("to_out.0"))?;
        let span = tracing::span!(tracing::Level::TRACE, "xa");
        let span_attn = tracing::span!(tracing::Level::TRACE, "xa-attn");
        let span_softmax = tracing::span!(tracing::Level::TRACE, "xa-softmax");
        Ok(Self {
            to_q,
            to_k,
            to_v,
            to_out,
            processor,
            heads,
            scale,
            slice_size,
            span,
            span_attn,
            span_softmax,
            use_flash_attn,
        })
    }

    fn reshape_heads_to_batch_dim(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, dim) = xs.dims3()?;
        xs.reshape((batch_size, seq_len, self.heads, dim / self.heads))?
            .transpose(1, 2)?
            .reshape((batch_size * self.heads, seq_len, dim / self.heads))
    }

    fn reshape_batch_dim_to_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, dim) = xs.dims3()?;
        xs.reshape((batch_size / self.heads, self.heads, seq_len, dim))?
            .transpose(1, 2)?
            .reshape((batch_size / self.heads, seq_len, dim * self.heads))
    }

    fn sliced_attention(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        slice_size: usize,
    ) -> Result<Tensor> {
        let batch_size_attention = query.dim(0)?;
        let mut hidden_states = Vec::with_capacity(batch_size_attention / slice_size);
        let in_dtype = query.dtype();
        let query = query.to_dtype(DType::F32)?;
        let key = key.to_dtype(DType::F32)?;
        let value = value.to_dtype(DType::F32)?;

        for i in 0..batch_size_attention / slice_size {
            let start_idx = i * slice_size;
            let end_idx = (i + 1) * slice_size;

            let xs = query
                .i(start_idx..end_idx)?
                .matmul(&(key.i(start_idx..end_idx)?.t()? * self.scale)?)?;
            let xs = nn::ops::softmax(&xs, D::Minus1)?.matmul(&value.i(start_idx..end_idx)?)?;
            hidden_states.push(xs)
        }
        let hidden_states = Tensor::stack(&hidden_states, 0)?.to_dtype(in_dtype)?;
        self.reshape_batch_dim_to_heads(&hidden_states)
    }

    fn attention(&self, query: &Tensor, key: &Tensor, value: &Tensor) -> Result<Tensor> {
        let _enter = self.span_attn.enter();
        let xs = if self.use_flash_attn {
            let init_dtype = query.dtype();
            let q = query
                .to_dtype(candle::DType::F16)?
                .unsqueeze(0)?
                .transpose(1, 2)?;
            let k = key
                .to_dtype(candle::DType::F16)?
                .unsqueeze(0)?
                .transpose(1, 2)?;
            let v = value
                .to_dtype(candle::DType::F16)?
                .unsqueeze(0)?
                .transpose(1, 2)?;
            flash_attn(&q, &k, &v, self.scale as f32, false)?
                .transpose(1, 2)?
                .squeeze(0)?
                .to_dtype(init_dtype)?
        } else {
            let in_dtype = query.dtype();
            let query = query.to_dtype(DType::F32)?;
            let key = key.to_dtype(DType::F32)?;
            let value = value.to_dtype(DType::F32)?;
            let xs = query.matmul(&(key.t()? * self.scale)?)?;
            let xs = {
                let _enter = self.span_softmax.enter();
                nn::ops::softmax_last_dim(&xs)?
            };
            xs.matmul(&value)?.to_dtype(in_dtype)?
        };
        self.reshape_batch_dim_to_heads(&xs)
    }

    /// Multi-head attention over already-projected q/k/v of shape
    /// `(batch, seq, inner_dim)`, returning `(batch, seq_q, inner_dim)`.
    fn attend(&self, query: &Tensor, key: &Tensor, value: &Tensor) -> Result<Tensor> {
        let query = self.reshape_heads_to_batch_dim(query)?;
        let key = self.reshape_heads_to_batch_dim(key)?;
        let value = self.reshape_heads_to_batch_dim(value)?;
        let dim0 = query.dim(0)?;
        let slice_size = self.slice_size.and_then(|slice_size| {
            if dim0 < slice_size {
                None
            } else {
                Some(slice_size)
            }
        });
        match slice_size {
            None => self.attention(&query, &key, &value),
            Some(slice_size) => self.sliced_attention(&query, &key, &value, slice_size),
        }
    }

    pub fn forward(
        &self,
        xs: &Tensor,
        context: Option<&Tensor>,
        cond: &mut ConditioningState<'_>,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        match &self.processor {
            AttnProcessor::PlainSelf => self.forward_plain(xs, None),
            AttnProcessor::PlainCross => self.forward_plain(xs, context),
            AttnProcessor::CacheWrite { id } => self.forward_cache_write(*id, xs, cond),
            AttnProcessor::ReferenceInject { id } => self.forward_reference_inject(*id, xs, cond),
            AttnProcessor::IdentityCross { to_k_ip, to_v_ip } => {
                self.forward_identity_cross(xs, context, to_k_ip, to_v_ip, cond)
            }
        }
    }

    fn forward_plain(&self, xs: &Tensor, context: Option<&Tensor>) -> Result<Tensor> {
        let query = self.to_q.forward(xs)?;
        let context = context.unwrap_or(xs).contiguous()?;
        let key = self.to_k.forward(&context)?;
        let value = self.to_v.forward(&context)?;
        let xs = self.attend(&query, &key, &value)?;
        self.to_out.forward(&xs)
    }

    /// Reference-denoiser self-attention: capture key/value, return the input
    /// unchanged so the surrounding block structure still completes.
    fn forward_cache_write(
        &self,
        id: LayerId,
        xs: &Tensor,
        cond: &mut ConditioningState<'_>,
    ) -> Result<Tensor> {
        let key = self.to_k.forward(xs)?;
        let value = self.to_v.forward(xs)?;
        cond.cache.put(id, key, value)?;
        Ok(xs.clone())
    }

    /// Main-denoiser self-attention with reference injection.
    ///
    /// The cached key/value are concatenated onto the local ones and the
    /// merged attention output is blended with the plain one, so that an
    /// `image_scale` of 0 is exactly plain self-attention. A missing cache
    /// entry is a structural mismatch between the two denoisers and fails
    /// the whole pass.
    fn forward_reference_inject(
        &self,
        id: LayerId,
        xs: &Tensor,
        cond: &mut ConditioningState<'_>,
    ) -> Result<Tensor> {
        let query = self.to_q.forward(xs)?;
        let key = self.to_k.forward(xs)?;
        let value = self.to_v.forward(xs)?;
        let (ref_key, ref_value) = cond.cache.get(id)?;
        let plain = self.attend(&query, &key, &value)?;
        let xs = if cond.image_scale == 0. {
            plain
        } else {
            let key = Tensor::cat(&[&key, ref_key], 1)?;
            let value = Tensor::cat(&[&value, ref_value], 1)?;
            let merged = self.attend(&query, &key, &value)?;
            (&plain + ((merged - &plain)? * cond.image_scale)?)?
        };
        self.to_out.forward(&xs)
    }

    /// Main-denoiser cross-attention: text attention plus a scaled
    /// identity-token attention sharing the same queries.
    fn forward_identity_cross(
        &self,
        xs: &Tensor,
        context: Option<&Tensor>,
        to_k_ip: &nn::Linear,
        to_v_ip: &nn::Linear,
        cond: &mut ConditioningState<'_>,
    ) -> Result<Tensor> {
        let context = match context {
            Some(context) => context.contiguous()?,
            None => candle::bail!("identity cross-attention layer called without a text context"),
        };
        let query = self.to_q.forward(xs)?;
        let key = self.to_k.forward(&context)?;
        let value = self.to_v.forward(&context)?;
        let text_out = self.attend(&query, &key, &value)?;
        let xs = match cond.ip_tokens {
            Some(ip_tokens) if cond.ipa_scale != 0. => {
                let ip_key = to_k_ip.forward(ip_tokens)?;
                let ip_value = to_v_ip.forward(ip_tokens)?;
                let ip_out = self.attend(&query, &ip_key, &ip_value)?;
                (&text_out + (ip_out * cond.ipa_scale)?)?
            }
            _ => text_out,
        };
        self.to_out.forward(&xs)
    }
}

/// Selects the attention-processor mapping for a denoiser instantiation.
///
/// The mapping is fixed once at model-build time: one denoiser type, two
/// instantiations with different weight sets and different processors.
#[derive(Clone)]
pub enum UNetRole<'a> {
    /// Main denoiser: reference injection on self-attention, identity
    /// blending on cross-attention. The adapter VarBuilder holds the
    /// per-layer `to_k_ip`/`to_v_ip` weights, keyed by cross-attention
    /// layer index.
    Main { adapters: nn::VarBuilder<'a> },
    /// Reference denoiser: self-attention writes the cache, cross-attention
    /// runs normally over the null-prompt embedding.
    Reference,
    /// Plain attention everywhere (pose conditioner trunk).
    Plain,
}

/// A basic transformer block: self-attention, cross-attention, feed-forward.
#[derive(Debug)]
struct BasicTransformerBlock {
    attn1: CrossAttention,
    ff: FeedForward,
    attn2: CrossAttention,
    norm1: nn::LayerNorm,
    norm2: nn::LayerNorm,
    norm3: nn::LayerNorm,
    span: tracing::Span,
}

impl BasicTransformerBlock {
    #[allow(clippy::too_many_arguments)]
    fn new(
        vs: nn::VarBuilder,
        dim: usize,
        n_heads: usize,
        d_head: usize,
        context_dim: Option<usize>,
        sliced_attention_size: Option<usize>,
        use_flash_attn: bool,
        role: &UNetRole,
        registry: &mut crate::cache::LayerRegistry,
    ) -> Result<Self> {
        let attn1_processor = match role {
            UNetRole::Main { .. } => AttnProcessor::ReferenceInject {
                id: registry.register_self_attn(),
            },
            UNetRole::Reference => AttnProcessor::CacheWrite {
                id: registry.register_self_attn(),
            },
            UNetRole::Plain => AttnProcessor::PlainSelf,
        };
        let attn2_processor = match role {
            UNetRole::Main { adapters } => {
                let index = registry.register_cross_attn();
                let vs_ip = adapters.pp(index.to_string());
                let ip_dim = context_dim.unwrap_or(dim);
                AttnProcessor::IdentityCross {
                    to_k_ip: nn::linear_no_bias(ip_dim, n_heads * d_head, vs_ip.pp("to_k_ip"))?,
                    to_v_ip: nn::linear_no_bias(ip_dim, n_heads * d_head, vs_ip.pp("to_v_ip"))?,
                }
            }
            UNetRole::Reference | UNetRole::Plain => AttnProcessor::PlainCross,
        };
        let attn1 = CrossAttention::new(
            vs.pp("attn1"),
            dim,
            None,
            n_heads,
            d_head,
            sliced_attention_size,
            use_flash_attn,
            attn1_processor,
        )?;
        let ff = FeedForward::new(vs.pp("ff"), dim, None, 4)?;
        let attn2 = CrossAttention::new(
            vs.pp("attn2"),
            dim,
            context_dim,
            n_heads,
            d_head,
            sliced_attention_size,
            use_flash_attn,
            attn2_processor,
        )?;
        let norm1 = nn::layer_norm(dim, 1e-5, vs.pp("norm1"))?;
        let norm2 = nn::layer_norm(dim, 1e-5, vs.pp("norm2"))?;
        let norm3 = nn::layer_norm(dim, 1e-5, vs.pp("norm3"))?;
        let span = tracing::span!(tracing::Level::TRACE, "basic-transformer");
        Ok(Self {
            attn1,
            ff,
            attn2,
            norm1,
            norm2,
            norm3,
            span,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        context: Option<&Tensor>,
        cond: &mut ConditioningState<'_>,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let xs = (self.attn1.forward(&self.norm1.forward(xs)?, None, cond)? + xs)?;
        let xs = (self.attn2.forward(&self.norm2.forward(&xs)?, context, cond)? + xs)?;
        self.ff.forward(&self.norm3.forward(&xs)?)? + xs
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SpatialTransformerConfig {
    pub depth: usize,
    pub num_groups: usize,
    pub context_dim: Option<usize>,
    pub sliced_attention_size: Option<usize>,
    pub use_linear_projection: bool,
}

impl Default for SpatialTransformerConfig {
    fn default() -> Self {
        Self {
            depth: 1,
            num_groups: 32,
            context_dim: None,
            sliced_attention_size: None,
            use_linear_projection: false,
        }
    }
}

#[derive(Debug)]
enum Proj {
    Conv2d(nn::Conv2d),
    Linear(nn::Linear),
}

// Aka Transformer2DModel
#[derive(Debug)]
pub struct SpatialTransformer {
    norm: nn::GroupNorm,
    proj_in: Proj,
    transformer_blocks: Vec<BasicTransformerBlock>,
    proj_out: Proj,
    span: tracing::Span,
    pub config: SpatialTransformerConfig,
}

impl SpatialTransformer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vs: nn::VarBuilder,
        in_channels: usize,
        n_heads: usize,
        d_head: usize,
        use_flash_attn: bool,
        config: SpatialTransformerConfig,
        role: &UNetRole,
        registry: &mut crate::cache::LayerRegistry,
    ) -> Result<Self> {
        let inner_dim = n_heads * d_head;
        let norm = nn::group_norm(config.num_groups, in_channels, 1e-6, vs.pp("norm"))?;
        let proj_in = if config.use_linear_projection {
            Proj::Linear(nn::linear(in_channels, inner_dim, vs.pp("proj_in"))?)
        } else {
            Proj::Conv2d(nn::conv2d(
                in_channels,
                inner_dim,
                1,
                Default::default(),
                vs.pp("proj_in"),
            )?)
        };
        let mut transformer_blocks = vec![];
        let vs_tb = vs.pp("transformer_blocks");
        for index in 0..config.depth {
            let tb = BasicTransformerBlock::new(
                vs_tb.pp(index.to_string()),
                inner_dim,
                n_heads,
                d_head,
                config.context_dim,
                config.sliced_attention_size,
                use_flash_attn,
                role,
                registry,
            )?;
            transformer_blocks.push(tb)
        }
        let proj_out = if config.use_linear_projection {
            Proj::Linear(nn::linear(in_channels, inner_dim, vs.pp("proj_out"))?)
        } else {
            Proj::Conv2d(nn::conv2d(
                inner_dim,
                in_channels,
                1,
                Default::default(),
                vs.pp("proj_out"),
            )?)
        };
        let span = tracing::span!(tracing::Level::TRACE, "spatial-transformer");
        Ok(Self {
            norm,
            proj_in,
            transformer_blocks,
            proj_out,
            span,
            config,
        })
    }

    pub fn forward(
        &self,
        xs: &Tensor,
        context: Option<&Tensor>,
        cond: &mut ConditioningState<'_>,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (batch, _channel, height, weight) = xs.dims4()?;
        let residual = xs;
        let xs = self.norm.forward(xs)?;
        let (inner_dim, xs) = match &self.proj_in {
            Proj::Conv2d(p) => {
                let xs = p.forward(&xs)?;
                let inner_dim = xs.dim(1)?;
                let xs = xs
                    .transpose(1, 2)?
                    .t()?
                    .reshape((batch, height * weight, inner_dim))?;
                (inner_dim, xs)
            }
            Proj::Linear(p) => {
                let inner_dim = xs.dim(1)?;
                let xs = xs
                    .transpose(1, 2)?
                    .t()?
                    .reshape((batch, height * weight, inner_dim))?;
                (inner_dim, p.forward(&xs)?)
            }
        };
        let mut xs = xs;
        for block in self.transformer_blocks.iter() {
            xs = block.forward(&xs, context, cond)?
        }
        let xs = match &self.proj_out {
            Proj::Conv2d(p) => p.forward(
                &xs.reshape((batch, height, weight, inner_dim))?
                    .t()?
                    .transpose(1, 2)?,
            )?,
            Proj::Linear(p) => p
                .forward(&xs)?
                .reshape((batch, height, weight, inner_dim))?
                .t()?
                .transpose(1, 2)?,
        };
        xs + residual
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LayerRegistry;
    use candle::{DType, Device};
    use std::collections::HashMap;

    const DIM: usize = 8;
    const HEADS: usize = 2;
    const DIM_HEAD: usize = 4;

    fn attn_weights(device: &Device, context_dim: usize, with_ip: bool) -> HashMap<String, Tensor> {
        let inner = HEADS * DIM_HEAD;
        let mut ws = HashMap::new();
        let mut insert = |name: &str, shape: (usize, usize)| {
            ws.insert(
                name.to_string(),
                Tensor::randn(0f32, 1f32, shape, device).unwrap(),
            );
        };
        insert("to_q.weight", (inner, DIM));
        insert("to_k.weight", (inner, context_dim));
        insert("to_v.weight", (inner, context_dim));
        insert("to_out.0.weight", (DIM, inner));
        if with_ip {
            insert("to_k_ip.weight", (inner, context_dim));
            insert("to_v_ip.weight", (inner, context_dim));
        }
        ws.insert(
            "to_out.0.bias".to_string(),
            Tensor::randn(0f32, 1f32, DIM, device).unwrap(),
        );
        ws
    }

    fn build(
        ws: &HashMap<String, Tensor>,
        context_dim: Option<usize>,
        processor: AttnProcessor,
        device: &Device,
    ) -> CrossAttention {
        let vs = nn::VarBuilder::from_tensors(ws.clone(), DType::F32, device);
        CrossAttention::new(vs, DIM, context_dim, HEADS, DIM_HEAD, None, false, processor).unwrap()
    }

    fn ip_linears(ws: &HashMap<String, Tensor>) -> (nn::Linear, nn::Linear) {
        (
            nn::Linear::new(ws["to_k_ip.weight"].clone(), None),
            nn::Linear::new(ws["to_v_ip.weight"].clone(), None),
        )
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_vec0::<f32>()
            .unwrap()
    }

    #[test]
    fn reference_inject_scale_zero_is_plain_self_attention() {
        let device = Device::Cpu;
        device.set_seed(42).ok();
        let ws = attn_weights(&device, DIM, false);
        let mut registry = LayerRegistry::new();
        let id = registry.register_self_attn();
        let plain = build(&ws, None, AttnProcessor::PlainSelf, &device);
        let inject = build(&ws, None, AttnProcessor::ReferenceInject { id }, &device);

        let xs = Tensor::randn(0f32, 1f32, (1, 5, DIM), &device).unwrap();
        let mut cache = AttentionCache::new(registry.self_attn_layers());
        let inner = HEADS * DIM_HEAD;
        cache
            .put(
                id,
                Tensor::randn(0f32, 1f32, (1, 3, inner), &device).unwrap(),
                Tensor::randn(0f32, 1f32, (1, 3, inner), &device).unwrap(),
            )
            .unwrap();

        let plain_out = {
            let mut unused = AttentionCache::new(0);
            let mut cond = ConditioningState::plain(&mut unused);
            plain.forward(&xs, None, &mut cond).unwrap()
        };
        let zero_out = {
            let mut cond = ConditioningState::main(&mut cache, None, 0., 0.);
            inject.forward(&xs, None, &mut cond).unwrap()
        };
        assert!(max_abs_diff(&plain_out, &zero_out) < 1e-5);

        // A non-zero scale must actually pull in the reference features.
        let one_out = {
            let mut cond = ConditioningState::main(&mut cache, None, 1., 0.);
            inject.forward(&xs, None, &mut cond).unwrap()
        };
        assert!(max_abs_diff(&plain_out, &one_out) > 1e-4);
    }

    #[test]
    fn reference_inject_without_cache_entry_fails() {
        let device = Device::Cpu;
        device.set_seed(42).ok();
        let ws = attn_weights(&device, DIM, false);
        let mut registry = LayerRegistry::new();
        let id = registry.register_self_attn();
        let inject = build(&ws, None, AttnProcessor::ReferenceInject { id }, &device);
        let xs = Tensor::randn(0f32, 1f32, (1, 5, DIM), &device).unwrap();
        let mut cache = AttentionCache::new(registry.self_attn_layers());
        // Cache never written: even at scale 0 this is a structural error.
        let mut cond = ConditioningState::main(&mut cache, None, 0., 0.);
        assert!(inject.forward(&xs, None, &mut cond).is_err());
    }

    #[test]
    fn identity_cross_scale_zero_is_text_only() {
        let device = Device::Cpu;
        device.set_seed(43).ok();
        let context_dim = 6;
        let ws = attn_weights(&device, context_dim, true);
        let plain = build(&ws, Some(context_dim), AttnProcessor::PlainCross, &device);
        let (to_k_ip, to_v_ip) = ip_linears(&ws);
        let ip = build(
            &ws,
            Some(context_dim),
            AttnProcessor::IdentityCross { to_k_ip, to_v_ip },
            &device,
        );

        let xs = Tensor::randn(0f32, 1f32, (1, 5, DIM), &device).unwrap();
        let context = Tensor::randn(0f32, 1f32, (1, 7, context_dim), &device).unwrap();
        let ip_tokens = Tensor::randn(0f32, 1f32, (1, 4, context_dim), &device).unwrap();

        let mut unused = AttentionCache::new(0);
        let text_out = {
            let mut cond = ConditioningState::plain(&mut unused);
            plain.forward(&xs, Some(&context), &mut cond).unwrap()
        };
        let zero_out = {
            let mut cond = ConditioningState::main(&mut unused, Some(&ip_tokens), 0., 0.);
            ip.forward(&xs, Some(&context), &mut cond).unwrap()
        };
        assert!(max_abs_diff(&text_out, &zero_out) < 1e-5);

        // Absent identity tokens behave exactly like a zero scale.
        let absent_out = {
            let mut cond = ConditioningState::main(&mut unused, None, 0., 1.2);
            ip.forward(&xs, Some(&context), &mut cond).unwrap()
        };
        assert!(max_abs_diff(&text_out, &absent_out) < 1e-5);

        let scaled_out = {
            let mut cond = ConditioningState::main(&mut unused, Some(&ip_tokens), 0., 1.2);
            ip.forward(&xs, Some(&context), &mut cond).unwrap()
        };
        assert!(max_abs_diff(&text_out, &scaled_out) > 1e-4);
    }

    #[test]
    fn cache_write_is_identity_pass_through() {
        let device = Device::Cpu;
        device.set_seed(44).ok();
        let ws = attn_weights(&device, DIM, false);
        let mut registry = LayerRegistry::new();
        let id = registry.register_self_attn();
        let writer = build(&ws, None, AttnProcessor::CacheWrite { id }, &device);
        let xs = Tensor::randn(0f32, 1f32, (1, 5, DIM), &device).unwrap();
        let mut cache = AttentionCache::new(registry.self_attn_layers());
        let out = {
            let mut cond = ConditioningState::reference(&mut cache);
            writer.forward(&xs, None, &mut cond).unwrap()
        };
        assert!(max_abs_diff(&out, &xs) == 0.);
        assert!(cache.is_fully_populated());
        let (key, value) = cache.get(id).unwrap();
        assert_eq!(key.dims(), &[1, 5, HEADS * DIM_HEAD]);
        assert_eq!(value.dims(), &[1, 5, HEADS * DIM_HEAD]);
    }
}
