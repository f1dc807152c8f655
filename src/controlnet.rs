//! Pose conditioning network.
//!
//! A copy of the denoiser's down path whose per-resolution outputs go
//! through zero-initialized 1x1 convolutions and come back as additive
//! residuals for the main denoiser. The pose skeleton image is embedded by
//! a small convolutional stack and added right after the input convolution.
use crate::attention::{ConditioningState, UNetRole};
use crate::cache::{AttentionCache, LayerRegistry};
use crate::unet_2d::{build_down_blocks, build_mid_block, UNet2DConditionModelConfig, UNetDownBlock};
use crate::unet_2d_blocks::UNetMidBlock2DCrossAttn;
use candle::{Module, Result, Tensor};
use candle_nn as nn;
use candle_transformers::models::stable_diffusion::embeddings::{TimestepEmbedding, Timesteps};
use candle_transformers::models::with_tracing::{conv2d, Conv2d};

#[derive(Debug, Clone)]
pub struct ControlNetConfig {
    pub unet: UNet2DConditionModelConfig,
    pub conditioning_embedding_out_channels: Vec<usize>,
    pub conditioning_channels: usize,
}

impl Default for ControlNetConfig {
    fn default() -> Self {
        Self {
            unet: Default::default(),
            conditioning_embedding_out_channels: vec![16, 32, 96, 256],
            conditioning_channels: 3,
        }
    }
}

/// Embeds the conditioning image down to the latent resolution, ending in a
/// zero-initialized projection so an untrained copy is a no-op.
#[derive(Debug)]
struct ConditioningEmbedding {
    conv_in: Conv2d,
    blocks: Vec<Conv2d>,
    conv_out: Conv2d,
    span: tracing::Span,
}

impl ConditioningEmbedding {
    fn new(
        vs: nn::VarBuilder,
        conditioning_channels: usize,
        block_out_channels: &[usize],
        conditioning_embedding_channels: usize,
    ) -> Result<Self> {
        let conv_cfg = nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let first = match block_out_channels.first() {
            Some(c) => *c,
            None => candle::bail!("the conditioning embedding needs at least one block"),
        };
        let last = block_out_channels[block_out_channels.len() - 1];
        let conv_in = conv2d(conditioning_channels, first, 3, conv_cfg, vs.pp("conv_in"))?;
        let vs_b = vs.pp("blocks");
        let mut blocks = Vec::with_capacity(2 * (block_out_channels.len() - 1));
        for (i, window) in block_out_channels.windows(2).enumerate() {
            let (channel_in, channel_out) = (window[0], window[1]);
            blocks.push(conv2d(
                channel_in,
                channel_in,
                3,
                conv_cfg,
                vs_b.pp((2 * i).to_string()),
            )?);
            let down_cfg = nn::Conv2dConfig {
                padding: 1,
                stride: 2,
                ..Default::default()
            };
            blocks.push(conv2d(
                channel_in,
                channel_out,
                3,
                down_cfg,
                vs_b.pp((2 * i + 1).to_string()),
            )?);
        }
        let conv_out = conv2d(
            last,
            conditioning_embedding_channels,
            3,
            conv_cfg,
            vs.pp("conv_out"),
        )?;
        let span = tracing::span!(tracing::Level::TRACE, "cond-embedding");
        Ok(Self {
            conv_in,
            blocks,
            conv_out,
            span,
        })
    }
}

impl Module for ConditioningEmbedding {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let mut xs = nn::ops::silu(&self.conv_in.forward(xs)?)?;
        for block in self.blocks.iter() {
            xs = nn::ops::silu(&block.forward(&xs)?)?
        }
        self.conv_out.forward(&xs)
    }
}

#[derive(Debug)]
pub struct ControlNet {
    conv_in: Conv2d,
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    cond_embedding: ConditioningEmbedding,
    down_blocks: Vec<UNetDownBlock>,
    mid_block: UNetMidBlock2DCrossAttn,
    controlnet_down_blocks: Vec<Conv2d>,
    controlnet_mid_block: Conv2d,
    span: tracing::Span,
    pub config: ControlNetConfig,
}

impl ControlNet {
    pub fn new(
        vs: nn::VarBuilder,
        in_channels: usize,
        use_flash_attn: bool,
        config: ControlNetConfig,
    ) -> Result<Self> {
        let unet_cfg = &config.unet;
        let b_channels = unet_cfg.blocks[0].out_channels;
        let bl_channels = match unet_cfg.blocks.last() {
            Some(block) => block.out_channels,
            None => candle::bail!("the conditioner config has no blocks"),
        };
        let time_embed_dim = b_channels * 4;
        let conv_cfg = nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv_in = conv2d(in_channels, b_channels, 3, conv_cfg, vs.pp("conv_in"))?;

        let time_proj = Timesteps::new(b_channels, unet_cfg.flip_sin_to_cos, unet_cfg.freq_shift);
        let time_embedding =
            TimestepEmbedding::new(vs.pp("time_embedding"), b_channels, time_embed_dim)?;

        let cond_embedding = ConditioningEmbedding::new(
            vs.pp("controlnet_cond_embedding"),
            config.conditioning_channels,
            &config.conditioning_embedding_out_channels,
            b_channels,
        )?;

        let role = UNetRole::Plain;
        let mut registry = LayerRegistry::new();
        let down_blocks = build_down_blocks(
            vs.pp("down_blocks"),
            unet_cfg,
            time_embed_dim,
            use_flash_attn,
            &role,
            &mut registry,
        )?;
        let mid_block = build_mid_block(
            vs.pp("mid_block"),
            unet_cfg,
            time_embed_dim,
            use_flash_attn,
            &role,
            &mut registry,
        )?;

        // One zero conv for the conv_in output plus one per down-block
        // residual, all at the matching channel width.
        let vs_czc = vs.pp("controlnet_down_blocks");
        let mut controlnet_down_blocks = vec![conv2d(
            b_channels,
            b_channels,
            1,
            Default::default(),
            vs_czc.pp("0"),
        )?];
        let n_blocks = unet_cfg.blocks.len();
        let mut index = 1;
        for (i, block) in unet_cfg.blocks.iter().enumerate() {
            for _ in 0..unet_cfg.layers_per_block {
                controlnet_down_blocks.push(conv2d(
                    block.out_channels,
                    block.out_channels,
                    1,
                    Default::default(),
                    vs_czc.pp(index.to_string()),
                )?);
                index += 1
            }
            if i < n_blocks - 1 {
                controlnet_down_blocks.push(conv2d(
                    block.out_channels,
                    block.out_channels,
                    1,
                    Default::default(),
                    vs_czc.pp(index.to_string()),
                )?);
                index += 1
            }
        }
        let controlnet_mid_block = conv2d(
            bl_channels,
            bl_channels,
            1,
            Default::default(),
            vs.pp("controlnet_mid_block"),
        )?;
        let span = tracing::span!(tracing::Level::TRACE, "controlnet");
        Ok(Self {
            conv_in,
            time_proj,
            time_embedding,
            cond_embedding,
            down_blocks,
            mid_block,
            controlnet_down_blocks,
            controlnet_mid_block,
            span,
            config,
        })
    }

    /// Returns the per-resolution down residuals and the mid residual, both
    /// already multiplied by `conditioning_scale`.
    pub fn forward(
        &self,
        xs: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        cond_image: &Tensor,
        conditioning_scale: f64,
    ) -> Result<(Vec<Tensor>, Tensor)> {
        let _enter = self.span.enter();
        let (bsize, _channels, _height, _width) = xs.dims4()?;
        let device = xs.device();
        // 1. time
        let emb = (Tensor::ones(bsize, xs.dtype(), device)? * timestep)?;
        let emb = self.time_proj.forward(&emb)?;
        let emb = self.time_embedding.forward(&emb)?;
        // 2. pre-process
        let xs = self.conv_in.forward(xs)?;
        let xs = (xs + self.cond_embedding.forward(cond_image)?)?;
        // 3. down
        let mut cache = AttentionCache::new(0);
        let mut plain = ConditioningState::plain(&mut cache);
        let mut down_res_xs = vec![xs.clone()];
        let mut xs = xs;
        for down_block in self.down_blocks.iter() {
            let (_xs, res_xs) =
                down_block.forward(&xs, Some(&emb), Some(encoder_hidden_states), &mut plain)?;
            down_res_xs.extend(res_xs);
            xs = _xs;
        }
        // 4. mid
        let xs = self
            .mid_block
            .forward(&xs, Some(&emb), Some(encoder_hidden_states), &mut plain)?;
        // 5. zero convs
        if down_res_xs.len() != self.controlnet_down_blocks.len() {
            candle::bail!(
                "unexpected number of conditioner residuals: {} but {} projections",
                down_res_xs.len(),
                self.controlnet_down_blocks.len()
            )
        }
        let mut down_block_residuals = Vec::with_capacity(down_res_xs.len());
        for (res, zero_conv) in down_res_xs.iter().zip(self.controlnet_down_blocks.iter()) {
            down_block_residuals.push((zero_conv.forward(res)? * conditioning_scale)?)
        }
        let mid_block_residual = (self.controlnet_mid_block.forward(&xs)? * conditioning_scale)?;
        Ok((down_block_residuals, mid_block_residual))
    }
}
