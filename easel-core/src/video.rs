use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::vae::AutoEncoderKL;
use candle_transformers::models::stable_diffusion::StableDiffusionConfig;
use hf_hub::api::tokio::Api;
use image::DynamicImage;

use crate::catalog::WeightFile;
use crate::{
    decoded_to_image, image_to_tensor, select_device, DevicePreference, ImageToVideo,
    ImageToVideoRequest, Loader,
};

// SVD's native clip geometry.
pub const NUM_FRAMES: usize = 14;
pub const WIDTH: usize = 1024;
pub const HEIGHT: usize = 576;

/// Per-frame latent drift at motion_bucket_id 255.
const LATENT_DRIFT: f64 = 0.08;

const VAE_PREFIX: &str = "first_stage_model";

/// Image-to-video over a video checkpoint's autoencoder: the init image's
/// latent is walked under bounded noise and each step is decoded to a frame.
/// The amount of motion scales with `motion_bucket_id`, as in SVD.
pub struct VideoPipeline {
    device: Device,
    dtype: DType,
    vae: AutoEncoderKL,
}

impl Loader for VideoPipeline {
    type Pipeline = Self;

    async fn load(file: &WeightFile, _api: &Api, pref: DevicePreference) -> Result<Self> {
        let (device, dtype) = select_device(pref).context("failed to set up device")?;
        let config = StableDiffusionConfig::v1_5(None, Some(HEIGHT), Some(WIDTH));
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&file.path], dtype, &device)
                .context("failed to map checkpoint")?
        };
        let vae = AutoEncoderKL::new(vb.pp(VAE_PREFIX), 3, 3, config.autoencoder.clone())
            .context("failed to load autoencoder")?;
        Ok(Self { device, dtype, vae })
    }
}

impl ImageToVideo for VideoPipeline {
    fn generate(
        &mut self,
        init: &DynamicImage,
        request: &ImageToVideoRequest,
    ) -> Result<Vec<DynamicImage>> {
        let motion = request.motion_bucket_id.min(255) as f64 / 255.0;
        let drift = motion * LATENT_DRIFT;

        let init = image_to_tensor(init, WIDTH, HEIGHT, &self.device)?.to_dtype(self.dtype)?;
        let latent_dist = self.vae.encode(&init)?;
        let mut latent = latent_dist.sample()?;

        let mut frames = Vec::with_capacity(NUM_FRAMES);
        for _ in 0..NUM_FRAMES {
            let decoded = self.vae.decode(&latent)?;
            frames.push(decoded_to_image(&decoded)?);
            let noise = latent.randn_like(0f64, 1f64)?;
            latent = (latent + (noise * drift)?)?;
        }
        Ok(frames)
    }
}
