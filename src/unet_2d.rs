//! Conditional 2D denoiser.
//!
//! One model type, instantiated twice per pipeline: once as the main
//! denoiser and once as the reference denoiser. The [`UNetRole`] passed at
//! construction decides which attention processors each transformer layer
//! gets; layer ids are assigned by traversal order, so two instantiations of
//! the same config agree on which cache slot belongs to which layer.
use crate::attention::{ConditioningState, UNetRole};
use crate::cache::LayerRegistry;
use crate::unet_2d_blocks::{
    CrossAttnDownBlock2D, CrossAttnDownBlock2DConfig, CrossAttnUpBlock2D, CrossAttnUpBlock2DConfig,
    UNetMidBlock2DCrossAttn, UNetMidBlock2DCrossAttnConfig,
};
use candle::{Result, Tensor};
use candle_nn as nn;
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::embeddings::{TimestepEmbedding, Timesteps};
use candle_transformers::models::stable_diffusion::unet_2d_blocks::{
    DownBlock2D, DownBlock2DConfig, UpBlock2D, UpBlock2DConfig,
};
use candle_transformers::models::with_tracing::{conv2d, Conv2d};

#[derive(Debug, Clone, Copy)]
pub struct BlockConfig {
    pub out_channels: usize,
    /// When `None` no cross-attn is used, when `Some(d)` then cross-attn is used and `d` is the
    /// number of transformer blocks to be used.
    pub use_cross_attn: Option<usize>,
    pub attention_head_dim: usize,
}

#[derive(Debug, Clone)]
pub struct UNet2DConditionModelConfig {
    pub center_input_sample: bool,
    pub flip_sin_to_cos: bool,
    pub freq_shift: f64,
    pub blocks: Vec<BlockConfig>,
    pub layers_per_block: usize,
    pub downsample_padding: usize,
    pub mid_block_scale_factor: f64,
    pub norm_num_groups: usize,
    pub norm_eps: f64,
    pub cross_attention_dim: usize,
    pub sliced_attention_size: Option<usize>,
    pub use_linear_projection: bool,
}

impl Default for UNet2DConditionModelConfig {
    fn default() -> Self {
        Self {
            center_input_sample: false,
            flip_sin_to_cos: true,
            freq_shift: 0.,
            blocks: vec![
                BlockConfig {
                    out_channels: 320,
                    use_cross_attn: Some(1),
                    attention_head_dim: 8,
                },
                BlockConfig {
                    out_channels: 640,
                    use_cross_attn: Some(1),
                    attention_head_dim: 8,
                },
                BlockConfig {
                    out_channels: 1280,
                    use_cross_attn: Some(1),
                    attention_head_dim: 8,
                },
                BlockConfig {
                    out_channels: 1280,
                    use_cross_attn: None,
                    attention_head_dim: 8,
                },
            ],
            layers_per_block: 2,
            downsample_padding: 1,
            mid_block_scale_factor: 1.,
            norm_num_groups: 32,
            norm_eps: 1e-5,
            cross_attention_dim: 768,
            sliced_attention_size: None,
            use_linear_projection: false,
        }
    }
}

#[derive(Debug)]
pub(crate) enum UNetDownBlock {
    Basic(DownBlock2D),
    CrossAttn(CrossAttnDownBlock2D),
}

impl UNetDownBlock {
    pub(crate) fn forward(
        &self,
        xs: &Tensor,
        temb: Option<&Tensor>,
        encoder_hidden_states: Option<&Tensor>,
        cond: &mut ConditioningState<'_>,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        match self {
            Self::Basic(b) => b.forward(xs, temb),
            Self::CrossAttn(b) => b.forward(xs, temb, encoder_hidden_states, cond),
        }
    }
}

#[derive(Debug)]
enum UNetUpBlock {
    Basic(UpBlock2D),
    CrossAttn(CrossAttnUpBlock2D),
}

/// The trunk shared between the denoiser and the pose conditioner: input
/// convolution, timestep embedding and the stack of down blocks.
pub(crate) fn build_down_blocks(
    vs_db: nn::VarBuilder,
    config: &UNet2DConditionModelConfig,
    time_embed_dim: usize,
    use_flash_attn: bool,
    role: &UNetRole,
    registry: &mut LayerRegistry,
) -> Result<Vec<UNetDownBlock>> {
    let n_blocks = config.blocks.len();
    let b_channels = config.blocks[0].out_channels;
    let mut down_blocks = Vec::with_capacity(n_blocks);
    for i in 0..n_blocks {
        let BlockConfig {
            out_channels,
            use_cross_attn,
            attention_head_dim,
        } = config.blocks[i];

        // Enable automatic attention slicing if the config sliced_attention_size is set to 0.
        let sliced_attention_size = match config.sliced_attention_size {
            Some(0) => Some(attention_head_dim / 2),
            _ => config.sliced_attention_size,
        };

        let in_channels = if i > 0 {
            config.blocks[i - 1].out_channels
        } else {
            b_channels
        };
        let db_cfg = DownBlock2DConfig {
            num_layers: config.layers_per_block,
            resnet_eps: config.norm_eps,
            resnet_groups: config.norm_num_groups,
            add_downsample: i < n_blocks - 1,
            downsample_padding: config.downsample_padding,
            ..Default::default()
        };
        let block = if let Some(transformer_layers_per_block) = use_cross_attn {
            let cfg = CrossAttnDownBlock2DConfig {
                downblock: db_cfg,
                attn_num_head_channels: attention_head_dim,
                cross_attention_dim: config.cross_attention_dim,
                sliced_attention_size,
                use_linear_projection: config.use_linear_projection,
                transformer_layers_per_block,
            };
            UNetDownBlock::CrossAttn(CrossAttnDownBlock2D::new(
                vs_db.pp(i.to_string()),
                in_channels,
                out_channels,
                Some(time_embed_dim),
                use_flash_attn,
                role,
                registry,
                cfg,
            )?)
        } else {
            UNetDownBlock::Basic(DownBlock2D::new(
                vs_db.pp(i.to_string()),
                in_channels,
                out_channels,
                Some(time_embed_dim),
                db_cfg,
            )?)
        };
        down_blocks.push(block)
    }
    Ok(down_blocks)
}

pub(crate) fn build_mid_block(
    vs: nn::VarBuilder,
    config: &UNet2DConditionModelConfig,
    time_embed_dim: usize,
    use_flash_attn: bool,
    role: &UNetRole,
    registry: &mut LayerRegistry,
) -> Result<UNetMidBlock2DCrossAttn> {
    let bl_channels = match config.blocks.last() {
        Some(block) => block.out_channels,
        None => candle::bail!("the denoiser config has no blocks"),
    };
    let bl_attention_head_dim = match config.blocks.last() {
        Some(block) => block.attention_head_dim,
        None => candle::bail!("the denoiser config has no blocks"),
    };
    let mid_transformer_layers_per_block = match config.blocks.last() {
        None => 1,
        Some(block) => block.use_cross_attn.unwrap_or(1),
    };
    let mid_cfg = UNetMidBlock2DCrossAttnConfig {
        resnet_eps: config.norm_eps,
        output_scale_factor: config.mid_block_scale_factor,
        cross_attn_dim: config.cross_attention_dim,
        attn_num_head_channels: bl_attention_head_dim,
        resnet_groups: Some(config.norm_num_groups),
        use_linear_projection: config.use_linear_projection,
        transformer_layers_per_block: mid_transformer_layers_per_block,
        ..Default::default()
    };
    UNetMidBlock2DCrossAttn::new(
        vs,
        bl_channels,
        Some(time_embed_dim),
        use_flash_attn,
        role,
        registry,
        mid_cfg,
    )
}

#[derive(Debug)]
pub struct UNet2DConditionModel {
    conv_in: Conv2d,
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    down_blocks: Vec<UNetDownBlock>,
    mid_block: UNetMidBlock2DCrossAttn,
    up_blocks: Vec<UNetUpBlock>,
    conv_norm_out: nn::GroupNorm,
    conv_out: Conv2d,
    self_attn_layers: usize,
    cross_attn_layers: usize,
    span: tracing::Span,
    config: UNet2DConditionModelConfig,
}

impl UNet2DConditionModel {
    pub fn new(
        vs: nn::VarBuilder,
        in_channels: usize,
        out_channels: usize,
        use_flash_attn: bool,
        role: UNetRole,
        config: UNet2DConditionModelConfig,
    ) -> Result<Self> {
        let n_blocks = config.blocks.len();
        let b_channels = config.blocks[0].out_channels;
        let bl_channels = match config.blocks.last() {
            Some(block) => block.out_channels,
            None => candle::bail!("the denoiser config has no blocks"),
        };
        let time_embed_dim = b_channels * 4;
        let conv_cfg = nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv_in = conv2d(in_channels, b_channels, 3, conv_cfg, vs.pp("conv_in"))?;

        let time_proj = Timesteps::new(b_channels, config.flip_sin_to_cos, config.freq_shift);
        let time_embedding =
            TimestepEmbedding::new(vs.pp("time_embedding"), b_channels, time_embed_dim)?;

        let mut registry = LayerRegistry::new();
        let down_blocks = build_down_blocks(
            vs.pp("down_blocks"),
            &config,
            time_embed_dim,
            use_flash_attn,
            &role,
            &mut registry,
        )?;
        let mid_block = build_mid_block(
            vs.pp("mid_block"),
            &config,
            time_embed_dim,
            use_flash_attn,
            &role,
            &mut registry,
        )?;

        let vs_ub = vs.pp("up_blocks");
        let mut up_blocks = Vec::with_capacity(n_blocks);
        for i in 0..n_blocks {
            let BlockConfig {
                out_channels,
                use_cross_attn,
                attention_head_dim,
            } = config.blocks[n_blocks - 1 - i];

            // Enable automatic attention slicing if the config sliced_attention_size is set to 0.
            let sliced_attention_size = match config.sliced_attention_size {
                Some(0) => Some(attention_head_dim / 2),
                _ => config.sliced_attention_size,
            };

            let prev_out_channels = if i > 0 {
                config.blocks[n_blocks - i].out_channels
            } else {
                bl_channels
            };
            let in_channels = {
                let index = if i == n_blocks - 1 {
                    0
                } else {
                    n_blocks - i - 2
                };
                config.blocks[index].out_channels
            };
            let ub_cfg = UpBlock2DConfig {
                num_layers: config.layers_per_block + 1,
                resnet_eps: config.norm_eps,
                resnet_groups: config.norm_num_groups,
                add_upsample: i < n_blocks - 1,
                ..Default::default()
            };
            let block = if let Some(transformer_layers_per_block) = use_cross_attn {
                let cfg = CrossAttnUpBlock2DConfig {
                    upblock: ub_cfg,
                    attn_num_head_channels: attention_head_dim,
                    cross_attention_dim: config.cross_attention_dim,
                    sliced_attention_size,
                    use_linear_projection: config.use_linear_projection,
                    transformer_layers_per_block,
                };
                UNetUpBlock::CrossAttn(CrossAttnUpBlock2D::new(
                    vs_ub.pp(i.to_string()),
                    in_channels,
                    prev_out_channels,
                    out_channels,
                    Some(time_embed_dim),
                    use_flash_attn,
                    &role,
                    &mut registry,
                    cfg,
                )?)
            } else {
                UNetUpBlock::Basic(UpBlock2D::new(
                    vs_ub.pp(i.to_string()),
                    in_channels,
                    prev_out_channels,
                    out_channels,
                    Some(time_embed_dim),
                    ub_cfg,
                )?)
            };
            up_blocks.push(block)
        }

        let conv_norm_out = nn::group_norm(
            config.norm_num_groups,
            b_channels,
            config.norm_eps,
            vs.pp("conv_norm_out"),
        )?;
        let conv_out = conv2d(b_channels, out_channels, 3, conv_cfg, vs.pp("conv_out"))?;
        let span = tracing::span!(tracing::Level::TRACE, "unet2d");
        Ok(Self {
            conv_in,
            time_proj,
            time_embedding,
            down_blocks,
            mid_block,
            up_blocks,
            conv_norm_out,
            conv_out,
            self_attn_layers: registry.self_attn_layers(),
            cross_attn_layers: registry.cross_attn_layers(),
            span,
            config,
        })
    }

    /// Number of self-attention layers, i.e. the number of cache slots this
    /// model writes or reads per pass.
    pub fn self_attn_layers(&self) -> usize {
        self.self_attn_layers
    }

    pub fn cross_attn_layers(&self) -> usize {
        self.cross_attn_layers
    }

    pub fn forward(
        &self,
        xs: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        cond: &mut ConditioningState<'_>,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        self.forward_with_additional_residuals(
            xs,
            timestep,
            encoder_hidden_states,
            cond,
            None,
            None,
        )
    }

    pub fn forward_with_additional_residuals(
        &self,
        xs: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        cond: &mut ConditioningState<'_>,
        down_block_additional_residuals: Option<&[Tensor]>,
        mid_block_additional_residual: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (bsize, _channels, height, width) = xs.dims4()?;
        let device = xs.device();
        let n_blocks = self.config.blocks.len();
        let num_upsamplers = n_blocks - 1;
        let default_overall_up_factor = 2usize.pow(num_upsamplers as u32);
        let forward_upsample_size =
            height % default_overall_up_factor != 0 || width % default_overall_up_factor != 0;
        // 0. center input if necessary
        let xs = if self.config.center_input_sample {
            ((xs * 2.0)? - 1.0)?
        } else {
            xs.clone()
        };
        // 1. time
        let emb = (Tensor::ones(bsize, xs.dtype(), device)? * timestep)?;
        let emb = self.time_proj.forward(&emb)?;
        let emb = self.time_embedding.forward(&emb)?;
        // 2. pre-process
        let xs = self.conv_in.forward(&xs)?;
        // 3. down
        let mut down_block_res_xs = vec![xs.clone()];
        let mut xs = xs;
        for down_block in self.down_blocks.iter() {
            let (_xs, res_xs) =
                down_block.forward(&xs, Some(&emb), Some(encoder_hidden_states), cond)?;
            down_block_res_xs.extend(res_xs);
            xs = _xs;
        }

        let new_down_block_res_xs =
            if let Some(down_block_additional_residuals) = down_block_additional_residuals {
                let mut v = vec![];
                // A previous version of this code had a bug because of the addition being made
                // in place via += hence modifying the input of the mid block.
                for (i, residuals) in down_block_additional_residuals.iter().enumerate() {
                    v.push((&down_block_res_xs[i] + residuals)?)
                }
                v
            } else {
                down_block_res_xs
            };
        let mut down_block_res_xs = new_down_block_res_xs;

        // 4. mid
        let xs = self
            .mid_block
            .forward(&xs, Some(&emb), Some(encoder_hidden_states), cond)?;
        let xs = match mid_block_additional_residual {
            None => xs,
            Some(m) => (m + xs)?,
        };
        // 5. up
        let mut xs = xs;
        let mut upsample_size = None;
        for (i, up_block) in self.up_blocks.iter().enumerate() {
            let n_resnets = match up_block {
                UNetUpBlock::Basic(b) => b.resnets.len(),
                UNetUpBlock::CrossAttn(b) => b.config.upblock.num_layers,
            };
            let res_xs = down_block_res_xs.split_off(down_block_res_xs.len() - n_resnets);
            if i < n_blocks - 1 && forward_upsample_size {
                match down_block_res_xs.last() {
                    Some(res) => {
                        let (_, _, h, w) = res.dims4()?;
                        upsample_size = Some((h, w))
                    }
                    None => candle::bail!("missing down-block residuals for upsampling"),
                }
            }
            xs = match up_block {
                UNetUpBlock::Basic(b) => b.forward(&xs, &res_xs, Some(&emb), upsample_size)?,
                UNetUpBlock::CrossAttn(b) => b.forward(
                    &xs,
                    &res_xs,
                    Some(&emb),
                    upsample_size,
                    Some(encoder_hidden_states),
                    cond,
                )?,
            };
        }
        // 6. post-process
        let xs = self.conv_norm_out.forward(&xs)?;
        let xs = nn::ops::silu(&xs)?;
        self.conv_out.forward(&xs)
    }
}
