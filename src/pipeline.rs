//! Dual-denoiser sampling pipeline.
//!
//! Two copies of the same denoiser run per timestep: the reference copy
//! encodes the garment latent and writes every self-attention key/value into
//! the shared cache, then the main copy denoises the sample while blending
//! those cached features into its own self-attention. Identity tokens from
//! the image encoder enter through the adapter cross-attention path, and the
//! optional pose conditioner contributes additive residuals.
use crate::attention::{ConditioningState, UNetRole};
use crate::cache::AttentionCache;
use crate::clip_vision::{ClipVisionConfig, ClipVisionTransformer};
use crate::controlnet::{ControlNet, ControlNetConfig};
use crate::resampler::{FeatureProjector, FeatureProjectorConfig};
use crate::unet_2d::{UNet2DConditionModel, UNet2DConditionModelConfig};
use candle::{DType, Device, Result, Tensor};
use candle_nn as nn;
use candle_transformers::models::stable_diffusion::clip;
use candle_transformers::models::stable_diffusion::ddim::DDIMSchedulerConfig;
use candle_transformers::models::stable_diffusion::schedulers::{Scheduler, SchedulerConfig};
use candle_transformers::models::stable_diffusion::vae::{self, AutoEncoderKL};

pub const VAE_SCALE: f64 = 0.18215;

#[derive(Debug, Clone)]
pub struct RefDressConfig {
    pub width: usize,
    pub height: usize,
    pub clip: clip::Config,
    pub autoencoder: vae::AutoEncoderKLConfig,
    pub unet: UNet2DConditionModelConfig,
    pub scheduler: DDIMSchedulerConfig,
    pub projector: FeatureProjectorConfig,
    pub image_encoder: ClipVisionConfig,
}

impl RefDressConfig {
    pub fn v1_5(
        sliced_attention_size: Option<usize>,
        height: Option<usize>,
        width: Option<usize>,
    ) -> Self {
        let height = if let Some(height) = height {
            assert_eq!(height % 8, 0, "height has to be divisible by 8");
            height
        } else {
            640
        };
        let width = if let Some(width) = width {
            assert_eq!(width % 8, 0, "width has to be divisible by 8");
            width
        } else {
            512
        };
        let autoencoder = vae::AutoEncoderKLConfig {
            block_out_channels: vec![128, 256, 512, 512],
            layers_per_block: 2,
            latent_channels: 4,
            norm_num_groups: 32,
            ..Default::default()
        };
        let unet = UNet2DConditionModelConfig {
            sliced_attention_size,
            ..Default::default()
        };
        Self {
            width,
            height,
            clip: clip::Config::v1_5(),
            autoencoder,
            unet,
            scheduler: Default::default(),
            projector: Default::default(),
            image_encoder: ClipVisionConfig::vit_h_14(),
        }
    }

    pub fn build_vae<P: AsRef<std::path::Path>>(
        &self,
        vae_weights: P,
        device: &Device,
        dtype: DType,
    ) -> Result<AutoEncoderKL> {
        let weights = vae_weights.as_ref();
        let vs_ae = unsafe { nn::VarBuilder::from_mmaped_safetensors(&[weights], dtype, device)? };
        AutoEncoderKL::new(vs_ae, 3, 3, self.autoencoder.clone())
    }

    pub fn build_scheduler(&self, n_steps: usize) -> Result<Box<dyn Scheduler>> {
        self.scheduler.build(n_steps)
    }
}

/// Weight file locations; the adapter checkpoint bundles the reference
/// denoiser (`ref_unet.`), the feature projector (`proj.`) and the per-layer
/// cross-attention adapters (`adapter.`) in a single safetensors file.
pub struct WeightFiles {
    pub unet: std::path::PathBuf,
    pub vae: std::path::PathBuf,
    pub adapter: std::path::PathBuf,
    pub image_encoder: std::path::PathBuf,
    pub controlnet: Option<std::path::PathBuf>,
}

#[derive(Debug, Clone, Copy)]
pub struct GenerationParams {
    pub n_steps: usize,
    pub guidance_scale: f64,
    pub image_scale: f64,
    pub ipa_scale: f64,
    pub pose_conditioning_scale: f64,
    /// Drop the cached reference features from the unconditioned branch so
    /// the guidance direction also covers the image conditioning signal.
    pub strip_reference_on_uncond: bool,
}

/// Preprocessed conditioning images, all on the pipeline device.
pub struct ConditioningInputs {
    /// Garment image in `[-1, 1]` at the output resolution.
    pub garment: Tensor,
    /// Garment image at the image-encoder resolution, CLIP-normalized.
    pub garment_clip: Tensor,
    /// Face crop at the image-encoder resolution, CLIP-normalized.
    pub face_clip: Option<Tensor>,
    /// Pose skeleton rendering in `[0, 1]` at the output resolution.
    pub pose: Option<Tensor>,
}

/// CLIP text encodings, each of shape `(1, max_position_embeddings, 768)`.
pub struct TextEmbeddings {
    pub cond: Tensor,
    pub uncond: Tensor,
    /// Empty-prompt embedding, the text context of the reference pass.
    pub null: Tensor,
}

/// Classifier-free guidance combine.
pub fn guidance(uncond: &Tensor, cond: &Tensor, guidance_scale: f64) -> Result<Tensor> {
    uncond + ((cond - uncond)? * guidance_scale)?
}

/// Pairs a pose image with the pose conditioner. No pose image means the
/// conditioner is skipped entirely; a pose image without conditioner weights
/// is an error rather than a silent fall-back to unconditioned generation.
fn pose_conditioner<'a>(
    controlnet: Option<&'a ControlNet>,
    pose: Option<&'a Tensor>,
) -> Result<Option<(&'a ControlNet, &'a Tensor)>> {
    match (controlnet, pose) {
        (_, None) => Ok(None),
        (Some(controlnet), Some(pose)) => Ok(Some((controlnet, pose))),
        (None, Some(_)) => {
            candle::bail!("a pose image was supplied but no pose conditioner weights were loaded")
        }
    }
}

/// Post-decode hook, e.g. a content filter applied before the image is
/// returned to the caller.
pub type ImageFilter = Box<dyn Fn(&Tensor) -> Result<Tensor> + Send + Sync>;

fn apply_image_filter(images: Tensor, filter: Option<&ImageFilter>) -> Result<Tensor> {
    match filter {
        Some(filter) => filter(&images),
        None => Ok(images),
    }
}

pub struct RefDressPipeline {
    main_unet: UNet2DConditionModel,
    ref_unet: UNet2DConditionModel,
    projector: FeatureProjector,
    image_encoder: ClipVisionTransformer,
    vae: AutoEncoderKL,
    controlnet: Option<ControlNet>,
    image_filter: Option<ImageFilter>,
    pub config: RefDressConfig,
}

impl RefDressPipeline {
    pub fn new(
        config: RefDressConfig,
        files: &WeightFiles,
        use_flash_attn: bool,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let vs_adapter =
            unsafe { nn::VarBuilder::from_mmaped_safetensors(&[&files.adapter], dtype, device)? };
        let vs_unet =
            unsafe { nn::VarBuilder::from_mmaped_safetensors(&[&files.unet], dtype, device)? };
        let main_unet = UNet2DConditionModel::new(
            vs_unet,
            4,
            4,
            use_flash_attn,
            UNetRole::Main {
                adapters: vs_adapter.pp("adapter"),
            },
            config.unet.clone(),
        )?;
        let ref_unet = UNet2DConditionModel::new(
            vs_adapter.pp("ref_unet"),
            4,
            4,
            use_flash_attn,
            UNetRole::Reference,
            config.unet.clone(),
        )?;
        if main_unet.self_attn_layers() != ref_unet.self_attn_layers() {
            candle::bail!(
                "self-attention layer count mismatch between the denoisers: main has {}, reference has {}",
                main_unet.self_attn_layers(),
                ref_unet.self_attn_layers()
            )
        }
        let projector = FeatureProjector::new(vs_adapter.pp("proj"), config.projector)?;
        let vs_img = unsafe {
            nn::VarBuilder::from_mmaped_safetensors(&[&files.image_encoder], dtype, device)?
        };
        let image_encoder =
            ClipVisionTransformer::new(vs_img.pp("vision_model"), &config.image_encoder)?;
        let vae = config.build_vae(&files.vae, device, dtype)?;
        let controlnet = match &files.controlnet {
            Some(weights) => {
                let vs_cn =
                    unsafe { nn::VarBuilder::from_mmaped_safetensors(&[weights], dtype, device)? };
                let cn_config = ControlNetConfig {
                    unet: config.unet.clone(),
                    ..Default::default()
                };
                Some(ControlNet::new(vs_cn, 4, use_flash_attn, cn_config)?)
            }
            None => None,
        };
        Ok(Self {
            main_unet,
            ref_unet,
            projector,
            image_encoder,
            vae,
            controlnet,
            image_filter: None,
            config,
        })
    }

    /// Attaches a filter that runs on every decoded image.
    pub fn with_image_filter(mut self, filter: ImageFilter) -> Self {
        self.image_filter = Some(filter);
        self
    }

    fn image_tokens(&self, clip_image: &Tensor) -> Result<Tensor> {
        let features = self.image_encoder.penultimate_hidden_state(clip_image)?;
        self.projector.forward(&features)
    }

    fn pose_residuals(
        &self,
        latent_input: &Tensor,
        timestep: usize,
        text: &Tensor,
        pose: Option<&Tensor>,
        conditioning_scale: f64,
    ) -> Result<Option<(Vec<Tensor>, Tensor)>> {
        match pose_conditioner(self.controlnet.as_ref(), pose)? {
            Some((controlnet, pose)) => {
                let residuals = controlnet.forward(
                    latent_input,
                    timestep as f64,
                    text,
                    pose,
                    conditioning_scale,
                )?;
                Ok(Some(residuals))
            }
            None => Ok(None),
        }
    }

    fn main_pass(
        &self,
        latent_input: &Tensor,
        timestep: usize,
        text: &Tensor,
        cond: &mut ConditioningState<'_>,
        residuals: Option<&(Vec<Tensor>, Tensor)>,
    ) -> Result<Tensor> {
        match residuals {
            Some((down, mid)) => self.main_unet.forward_with_additional_residuals(
                latent_input,
                timestep as f64,
                text,
                cond,
                Some(down),
                Some(mid),
            ),
            None => self
                .main_unet
                .forward(latent_input, timestep as f64, text, cond),
        }
    }

    /// Runs the full sampling loop for one sample and returns the decoded
    /// image, shape `(1, 3, height, width)`, values in `[0, 1]`.
    pub fn generate(
        &self,
        params: &GenerationParams,
        inputs: &ConditioningInputs,
        text: &TextEmbeddings,
        device: &Device,
    ) -> Result<Tensor> {
        let dtype = inputs.garment.dtype();
        let use_guide_scale = params.guidance_scale > 1.0;
        let mut scheduler = self.config.build_scheduler(params.n_steps)?;

        let garment_latent = (self.vae.encode(&inputs.garment)?.sample()? * VAE_SCALE)?;
        // Fixed noise for the reference latent, re-applied at each timestep.
        let ref_noise = garment_latent.randn_like(0., 1.)?;
        let garment_tokens = self.image_tokens(&inputs.garment_clip)?;
        let face_tokens = match &inputs.face_clip {
            Some(face) => Some(self.image_tokens(face)?),
            None => None,
        };

        let latents = Tensor::randn(
            0f32,
            1f32,
            (1, 4, self.config.height / 8, self.config.width / 8),
            device,
        )?
        .to_dtype(dtype)?;
        // scale the initial noise by the standard deviation required by the scheduler
        let mut latents = (latents * scheduler.init_noise_sigma())?;

        let mut cache = AttentionCache::new(self.main_unet.self_attn_layers());
        let timesteps = scheduler.timesteps().to_vec();
        for (timestep_index, &timestep) in timesteps.iter().enumerate() {
            let start_time = std::time::Instant::now();

            // Reference pass: re-noise the garment latent to this timestep
            // and let the reference denoiser fill the cache. Its output is
            // discarded, only the captured key/value pairs matter.
            cache.reset();
            let noised_ref = scheduler.add_noise(&garment_latent, ref_noise.clone(), timestep)?;
            {
                let mut ref_state = ConditioningState::reference(&mut cache);
                self.ref_unet
                    .forward(&noised_ref, timestep as f64, &text.null, &mut ref_state)?;
            }
            if !cache.is_fully_populated() {
                candle::bail!(
                    "the reference pass did not populate all {} cache slots",
                    cache.num_layers()
                )
            }

            let latent_input = scheduler.scale_model_input(latents.clone(), timestep)?;

            let cond_residuals = self.pose_residuals(
                &latent_input,
                timestep,
                &text.cond,
                inputs.pose.as_ref(),
                params.pose_conditioning_scale,
            )?;
            let noise_pred_cond = {
                let mut state = ConditioningState::main(
                    &mut cache,
                    face_tokens.as_ref(),
                    params.image_scale,
                    params.ipa_scale,
                );
                self.main_pass(
                    &latent_input,
                    timestep,
                    &text.cond,
                    &mut state,
                    cond_residuals.as_ref(),
                )?
            };

            let noise_pred = if use_guide_scale {
                let uncond_residuals = self.pose_residuals(
                    &latent_input,
                    timestep,
                    &text.uncond,
                    inputs.pose.as_ref(),
                    params.pose_conditioning_scale,
                )?;
                // The uncond branch carries the garment tokens on the
                // identity path so guidance moves along the text axis only;
                // the cached features are optionally stripped as well.
                let image_scale = if params.strip_reference_on_uncond {
                    0.
                } else {
                    params.image_scale
                };
                let noise_pred_uncond = {
                    let mut state = ConditioningState::main(
                        &mut cache,
                        Some(&garment_tokens),
                        image_scale,
                        params.ipa_scale,
                    );
                    self.main_pass(
                        &latent_input,
                        timestep,
                        &text.uncond,
                        &mut state,
                        uncond_residuals.as_ref(),
                    )?
                };
                guidance(&noise_pred_uncond, &noise_pred_cond, params.guidance_scale)?
            } else {
                noise_pred_cond
            };

            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            let dt = start_time.elapsed().as_secs_f32();
            println!(
                "step {}/{} done, {:.2}s",
                timestep_index + 1,
                timesteps.len(),
                dt
            );
        }
        self.decode_latents(&latents)
    }

    pub fn decode_latents(&self, latents: &Tensor) -> Result<Tensor> {
        let images = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let images = ((images / 2.)? + 0.5)?.clamp(0f32, 1.)?;
        apply_image_filter(images, self.image_filter.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unet_2d::BlockConfig;
    use candle::{DType, Device};

    fn tiny_pose_conditioner(device: &Device) -> ControlNet {
        let unet = UNet2DConditionModelConfig {
            blocks: vec![BlockConfig {
                out_channels: 8,
                use_cross_attn: None,
                attention_head_dim: 4,
            }],
            layers_per_block: 1,
            norm_num_groups: 4,
            cross_attention_dim: 8,
            ..Default::default()
        };
        let config = ControlNetConfig {
            unet,
            conditioning_embedding_out_channels: vec![8],
            conditioning_channels: 3,
        };
        let vs = nn::VarBuilder::zeros(DType::F32, device);
        ControlNet::new(vs, 4, false, config).unwrap()
    }

    #[test]
    fn no_pose_image_skips_the_pose_conditioner() {
        let device = Device::Cpu;
        let conditioner = tiny_pose_conditioner(&device);
        assert!(pose_conditioner(Some(&conditioner), None)
            .unwrap()
            .is_none());
        assert!(pose_conditioner(None, None).unwrap().is_none());
    }

    #[test]
    fn a_pose_image_without_a_pose_conditioner_is_an_error() {
        let device = Device::Cpu;
        let pose = Tensor::zeros((1, 3, 64, 64), DType::F32, &device).unwrap();
        let err = pose_conditioner(None, Some(&pose)).unwrap_err();
        assert!(err.to_string().contains("pose conditioner"));
    }

    #[test]
    fn the_image_filter_runs_on_the_decoded_image() {
        let device = Device::Cpu;
        let images = Tensor::ones((1, 3, 4, 4), DType::F32, &device).unwrap();
        let passthrough = apply_image_filter(images.clone(), None).unwrap();
        let diff = (passthrough - &images)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        assert_eq!(diff, 0.);
        let filter: ImageFilter = Box::new(|images| images.zeros_like());
        let filtered = apply_image_filter(images, Some(&filter)).unwrap();
        assert_eq!(
            filtered
                .flatten_all()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_vec0::<f32>()
                .unwrap(),
            0.
        );
    }

    #[test]
    fn guidance_at_scale_one_is_the_conditioned_prediction() {
        let device = Device::Cpu;
        device.set_seed(42).ok();
        let uncond = Tensor::randn(0f32, 1f32, (1, 4, 8, 8), &device).unwrap();
        let cond = Tensor::randn(0f32, 1f32, (1, 4, 8, 8), &device).unwrap();
        let out = guidance(&uncond, &cond, 1.0).unwrap();
        let diff = (&out - &cond)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn guidance_pushes_away_from_the_unconditioned_prediction() {
        let device = Device::Cpu;
        let uncond = Tensor::zeros((1, 4), candle::DType::F32, &device).unwrap();
        let cond = Tensor::ones((1, 4), candle::DType::F32, &device).unwrap();
        let out = guidance(&uncond, &cond, 7.5).unwrap();
        assert_eq!(out.to_vec2::<f32>().unwrap(), vec![vec![7.5f32; 4]]);
    }
}
