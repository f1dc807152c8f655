//! Reference-garment conditioned image synthesis on Stable Diffusion v1.5.
//!
//! The pipeline runs two instantiations of the same denoiser per step: a
//! reference copy that encodes the garment and publishes its self-attention
//! key/value pairs through [`cache::AttentionCache`], and a main copy that
//! blends those features into its own self-attention while taking identity
//! tokens through adapter cross-attention and pose residuals from an
//! optional conditioner. See [`pipeline::RefDressPipeline`] for the sampling
//! loop.

pub mod attention;
pub mod cache;
pub mod clip_vision;
pub mod controlnet;
pub mod pipeline;
pub mod resampler;
pub mod unet_2d;
pub mod unet_2d_blocks;
