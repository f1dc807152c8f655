#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

use anyhow::{Error as E, Result};
use candle::{DType, Device, IndexOp, Module, Tensor};
use clap::Parser;
use rand::Rng;
use refdress::pipeline::{
    ConditioningInputs, GenerationParams, RefDressConfig, RefDressPipeline, TextEmbeddings,
    WeightFiles,
};
use tokenizers::Tokenizer;

use candle_transformers::models::stable_diffusion::build_clip_transformer;

const CLIP_MEAN: [f64; 3] = [0.48145466, 0.4578275, 0.40821073];
const CLIP_STD: [f64; 3] = [0.26862954, 0.26130258, 0.27577711];

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The garment reference image.
    #[arg(long, value_name = "FILE")]
    garment_path: String,

    /// A face crop providing the identity conditioning.
    #[arg(long, value_name = "FILE")]
    face_path: Option<String>,

    /// A rendered pose skeleton image.
    #[arg(long, value_name = "FILE")]
    pose_path: Option<String>,

    /// The prompt to be used for image generation.
    #[arg(long, default_value = "A model wearing a colorful skirt")]
    prompt: String,

    #[arg(
        long,
        default_value = "bare, naked, nude, undressed, monochrome, lowres, bad anatomy, worst quality, low quality"
    )]
    negative_prompt: String,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    /// The height in pixels of the generated image.
    #[arg(long)]
    height: Option<usize>,

    /// The width in pixels of the generated image.
    #[arg(long)]
    width: Option<usize>,

    /// The trained adapter checkpoint bundling the reference denoiser, the
    /// feature projector and the cross-attention adapters, in .safetensors
    /// format.
    #[arg(long, value_name = "FILE")]
    adapter_weights: String,

    /// The UNet weight file, in .safetensors format.
    #[arg(long, value_name = "FILE")]
    unet_weights: Option<String>,

    /// The CLIP weight file, in .safetensors format.
    #[arg(long, value_name = "FILE")]
    clip_weights: Option<String>,

    /// The VAE weight file, in .safetensors format.
    #[arg(long, value_name = "FILE")]
    vae_weights: Option<String>,

    /// The image-encoder weight file, in .safetensors format.
    #[arg(long, value_name = "FILE")]
    image_encoder_weights: Option<String>,

    /// The pose conditioner weight file, in .safetensors format.
    #[arg(long, value_name = "FILE")]
    controlnet_weights: Option<String>,

    #[arg(long, value_name = "FILE")]
    /// The file specifying the tokenizer to used for tokenization.
    tokenizer: Option<String>,

    /// The size of the sliced attention or 0 for automatic slicing (disabled by default)
    #[arg(long)]
    sliced_attention_size: Option<usize>,

    /// The number of steps to run the diffusion for.
    #[arg(long, default_value_t = 30)]
    n_steps: usize,

    /// The number of samples to generate iteratively.
    #[arg(long, default_value_t = 1)]
    num_samples: usize,

    /// The name of the final image to generate.
    #[arg(long, value_name = "FILE", default_value = "refdress_final.png")]
    final_image: String,

    #[arg(long)]
    use_flash_attn: bool,

    #[arg(long)]
    use_f16: bool,

    #[arg(long, default_value_t = 7.5)]
    guidance_scale: f64,

    /// How strongly the cached garment features steer self-attention.
    #[arg(long, default_value_t = 1.0)]
    image_scale: f64,

    /// How strongly the identity tokens steer cross-attention.
    #[arg(long, default_value_t = 1.2)]
    ipa_scale: f64,

    /// Scale applied to the pose conditioner residuals.
    #[arg(long, default_value_t = 1.0)]
    pose_conditioning_scale: f64,

    /// Remove the garment features from the unconditioned branch so guidance
    /// also amplifies the image conditioning.
    #[arg(long)]
    strip_reference_on_uncond: bool,

    /// The seed to use when generating random samples.
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelFile {
    Tokenizer,
    Clip,
    Unet,
    Vae,
    ImageEncoder,
    ControlNet,
}

impl ModelFile {
    fn get(&self, filename: Option<String>) -> Result<std::path::PathBuf> {
        use hf_hub::api::sync::Api;
        match filename {
            Some(filename) => Ok(std::path::PathBuf::from(filename)),
            None => {
                let (repo, path) = match self {
                    Self::Tokenizer => ("openai/clip-vit-base-patch32", "tokenizer.json"),
                    Self::Clip => (
                        "runwayml/stable-diffusion-v1-5",
                        "text_encoder/model.safetensors",
                    ),
                    Self::Unet => (
                        "runwayml/stable-diffusion-v1-5",
                        "unet/diffusion_pytorch_model.safetensors",
                    ),
                    Self::Vae => (
                        "runwayml/stable-diffusion-v1-5",
                        "vae/diffusion_pytorch_model.safetensors",
                    ),
                    Self::ImageEncoder => {
                        ("h94/IP-Adapter", "models/image_encoder/model.safetensors")
                    }
                    Self::ControlNet => (
                        "lllyasviel/control_v11p_sd15_openpose",
                        "diffusion_pytorch_model.safetensors",
                    ),
                };
                let filename = Api::new()?.model(repo.to_string()).get(path)?;
                Ok(filename)
            }
        }
    }
}

fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        Ok(Device::Cpu)
    }
}

fn output_filename(basename: &str, sample_idx: usize, num_samples: usize) -> String {
    if num_samples > 1 {
        match basename.rsplit_once('.') {
            None => format!("{basename}.{sample_idx}.png"),
            Some((filename_no_extension, extension)) => {
                format!("{filename_no_extension}.{sample_idx}.{extension}")
            }
        }
    } else {
        basename.to_string()
    }
}

fn save_image<P: AsRef<std::path::Path>>(img: &Tensor, p: P) -> Result<()> {
    let (channel, height, width) = img.dims3()?;
    if channel != 3 {
        anyhow::bail!("save_image expects an input of shape (3, height, width)")
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let image: image::ImageBuffer<image::Rgb<u8>, Vec<u8>> =
        match image::ImageBuffer::from_raw(width as u32, height as u32, pixels) {
            Some(image) => image,
            None => anyhow::bail!("error saving image {:?}", p.as_ref()),
        };
    image.save(p).map_err(E::msg)?;
    Ok(())
}

/// Loads an image resized to exactly `(width, height)` as a `(1, 3, h, w)`
/// f32 tensor with values in `[0, 255]`.
fn load_image<T: AsRef<std::path::Path>>(path: T, width: usize, height: usize) -> Result<Tensor> {
    let img = image::ImageReader::open(path)?.decode()?;
    let img = img.resize_to_fill(
        width as u32,
        height as u32,
        image::imageops::FilterType::CatmullRom,
    );
    let img = img.to_rgb8().into_raw();
    let img = Tensor::from_vec(img, (height, width, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .unsqueeze(0)?;
    Ok(img)
}

/// Garment image scaled to `[-1, 1]` for the autoencoder.
fn garment_preprocess<T: AsRef<std::path::Path>>(
    path: T,
    width: usize,
    height: usize,
) -> Result<Tensor> {
    Ok(load_image(path, width, height)?.affine(2. / 255., -1.)?)
}

/// Pose skeleton scaled to `[0, 1]` for the conditioning embedder.
fn pose_preprocess<T: AsRef<std::path::Path>>(
    path: T,
    width: usize,
    height: usize,
) -> Result<Tensor> {
    Ok((load_image(path, width, height)? / 255.)?)
}

/// Image-encoder input: 224x224, CLIP channel normalization.
fn clip_preprocess<T: AsRef<std::path::Path>>(path: T, image_size: usize) -> Result<Tensor> {
    let img = (load_image(path, image_size, image_size)? / 255.)?;
    let mean = Tensor::new(&CLIP_MEAN, &Device::Cpu)?
        .to_dtype(DType::F32)?
        .reshape((1, 3, 1, 1))?;
    let std = Tensor::new(&CLIP_STD, &Device::Cpu)?
        .to_dtype(DType::F32)?
        .reshape((1, 3, 1, 1))?;
    Ok(img.broadcast_sub(&mean)?.broadcast_div(&std)?)
}

fn text_embeddings(
    args: &Args,
    config: &RefDressConfig,
    device: &Device,
    dtype: DType,
) -> Result<TextEmbeddings> {
    let tokenizer = ModelFile::Tokenizer.get(args.tokenizer.clone())?;
    let tokenizer = Tokenizer::from_file(tokenizer).map_err(E::msg)?;
    let pad_id = match &config.clip.pad_with {
        Some(padding) => *tokenizer
            .get_vocab(true)
            .get(padding.as_str())
            .ok_or_else(|| anyhow::anyhow!("no pad token {padding} in the tokenizer vocab"))?,
        None => *tokenizer
            .get_vocab(true)
            .get("<|endoftext|>")
            .ok_or_else(|| anyhow::anyhow!("no <|endoftext|> token in the tokenizer vocab"))?,
    };
    println!("Building the Clip transformer.");
    let clip_weights = ModelFile::Clip.get(args.clip_weights.clone())?;
    let text_model = build_clip_transformer(&config.clip, clip_weights, device, DType::F32)?;

    let encode = |prompt: &str| -> Result<Tensor> {
        let mut tokens = tokenizer
            .encode(prompt, true)
            .map_err(E::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > config.clip.max_position_embeddings {
            anyhow::bail!(
                "the prompt is too long, {} > max-tokens ({})",
                tokens.len(),
                config.clip.max_position_embeddings
            )
        }
        while tokens.len() < config.clip.max_position_embeddings {
            tokens.push(pad_id)
        }
        let tokens = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        Ok(text_model.forward(&tokens)?.to_dtype(dtype)?)
    };

    println!("Running with prompt \"{}\".", args.prompt);
    Ok(TextEmbeddings {
        cond: encode(&args.prompt)?,
        uncond: encode(&args.negative_prompt)?,
        null: encode("")?,
    })
}

fn run(args: Args) -> Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        None
    };

    let dtype = if args.use_f16 { DType::F16 } else { DType::F32 };
    let config = RefDressConfig::v1_5(args.sliced_attention_size, args.height, args.width);
    let device = device(args.cpu)?;
    // If a seed is not given, generate a random seed and print it
    let seed = args
        .seed
        .unwrap_or(rand::rng().random_range(0u64..u64::MAX));
    println!("Using seed {seed}");
    device.set_seed(seed)?;

    let text = text_embeddings(&args, &config, &device, dtype)?;

    let garment = garment_preprocess(&args.garment_path, config.width, config.height)?
        .to_device(&device)?
        .to_dtype(dtype)?;
    let garment_clip = clip_preprocess(&args.garment_path, config.image_encoder.image_size)?
        .to_device(&device)?
        .to_dtype(dtype)?;
    let face_clip = match &args.face_path {
        Some(path) => Some(
            clip_preprocess(path, config.image_encoder.image_size)?
                .to_device(&device)?
                .to_dtype(dtype)?,
        ),
        None => None,
    };
    let pose = match &args.pose_path {
        Some(path) => Some(
            pose_preprocess(path, config.width, config.height)?
                .to_device(&device)?
                .to_dtype(dtype)?,
        ),
        None => None,
    };

    println!("Building the pipeline.");
    let controlnet = if pose.is_some() || args.controlnet_weights.is_some() {
        Some(ModelFile::ControlNet.get(args.controlnet_weights.clone())?)
    } else {
        None
    };
    let files = WeightFiles {
        unet: ModelFile::Unet.get(args.unet_weights.clone())?,
        vae: ModelFile::Vae.get(args.vae_weights.clone())?,
        adapter: std::path::PathBuf::from(&args.adapter_weights),
        image_encoder: ModelFile::ImageEncoder.get(args.image_encoder_weights.clone())?,
        controlnet,
    };
    let pipeline = RefDressPipeline::new(config, &files, args.use_flash_attn, &device, dtype)?;

    let inputs = ConditioningInputs {
        garment,
        garment_clip,
        face_clip,
        pose,
    };
    let params = GenerationParams {
        n_steps: args.n_steps,
        guidance_scale: args.guidance_scale,
        image_scale: args.image_scale,
        ipa_scale: args.ipa_scale,
        pose_conditioning_scale: args.pose_conditioning_scale,
        strip_reference_on_uncond: args.strip_reference_on_uncond,
    };

    for idx in 0..args.num_samples {
        println!("starting sampling {}/{}", idx + 1, args.num_samples);
        let image = pipeline.generate(&params, &inputs, &text, &device)?;
        let image = (image.to_device(&Device::Cpu)? * 255.)?.to_dtype(DType::U8)?;
        let image_filename = output_filename(&args.final_image, idx + 1, args.num_samples);
        save_image(&image.i(0)?, image_filename)?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    run(args)
}
