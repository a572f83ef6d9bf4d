use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Module, VarBuilder};
use candle_transformers::models::stable_diffusion::clip::ClipTextTransformer;
use candle_transformers::models::stable_diffusion::schedulers::Scheduler;
use candle_transformers::models::stable_diffusion::unet_2d::UNet2DConditionModel;
use candle_transformers::models::stable_diffusion::vae::AutoEncoderKL;
use candle_transformers::models::stable_diffusion::StableDiffusionConfig;
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;

use crate::catalog::WeightFile;
use crate::{
    image_to_tensor, decoded_to_image, select_device, DevicePreference, ImageToImage,
    ImageToImageRequest, Loader, TextToImage, TextToImageRequest,
};

const CLIP_TOKENIZER_REPO: &str = "openai/clip-vit-large-patch14";
const GUIDANCE_SCALE: f64 = 7.5;
const VAE_SCALE: f64 = 0.18215;
const RESOLUTION: usize = 512;

// Tensor-name roots inside a single-file SD checkpoint.
const CLIP_PREFIX: &str = "cond_stage_model.transformer";
const VAE_PREFIX: &str = "first_stage_model";
const UNET_PREFIX: &str = "model.diffusion_model";

/// A stable-diffusion checkpoint loaded once and driven for both text2img and
/// img2img, so both routes share a single set of components.
pub struct SdPipeline {
    device: Device,
    dtype: DType,
    config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    text_model: ClipTextTransformer,
    vae: AutoEncoderKL,
    unet: UNet2DConditionModel,
}

impl Loader for SdPipeline {
    type Pipeline = Self;

    async fn load(file: &WeightFile, api: &Api, pref: DevicePreference) -> Result<Self> {
        let (device, dtype) = select_device(pref).context("failed to set up device")?;
        let config = StableDiffusionConfig::v1_5(None, Some(RESOLUTION), Some(RESOLUTION));

        let tokenizer_filename = api
            .model(CLIP_TOKENIZER_REPO.to_string())
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        // A single checkpoint carries all three components under fixed roots.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&file.path], dtype, &device)
                .context("failed to map checkpoint")?
        };
        let text_model = ClipTextTransformer::new(vb.pp(CLIP_PREFIX), &config.clip)
            .context("failed to load CLIP text encoder")?;
        let vae = AutoEncoderKL::new(vb.pp(VAE_PREFIX), 3, 3, config.autoencoder.clone())
            .context("failed to load autoencoder")?;
        let unet = UNet2DConditionModel::new(vb.pp(UNET_PREFIX), 4, 4, false, config.unet.clone())
            .context("failed to load unet")?;

        Ok(Self {
            device,
            dtype,
            config,
            tokenizer,
            text_model,
            vae,
            unet,
        })
    }
}

impl SdPipeline {
    fn encode_prompt(&self, text: &str) -> Result<Tensor> {
        let vocab = self.tokenizer.get_vocab(true);
        let pad_id = match &self.config.clip.pad_with {
            Some(padding) => *vocab
                .get(padding.as_str())
                .ok_or_else(|| Error::msg(format!("pad token {padding:?} not in vocab")))?,
            None => *vocab
                .get("<|endoftext|>")
                .ok_or_else(|| Error::msg("<|endoftext|> not in vocab"))?,
        };
        let mut tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.truncate(self.config.clip.max_position_embeddings);
        while tokens.len() < self.config.clip.max_position_embeddings {
            tokens.push(pad_id);
        }
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        let embedding = self.text_model.forward(&tokens)?;
        Ok(embedding)
    }

    /// Batched [uncond, cond] embeddings for classifier-free guidance.
    fn text_embeddings(&self, prompt: &str, negative_prompt: &str) -> Result<Tensor> {
        let cond = self.encode_prompt(prompt)?;
        let uncond = self.encode_prompt(negative_prompt)?;
        let embeddings = Tensor::cat(&[uncond, cond], 0)?.to_dtype(self.dtype)?;
        Ok(embeddings)
    }

    fn denoise(
        &self,
        mut latents: Tensor,
        text_embeddings: &Tensor,
        scheduler: &mut dyn Scheduler,
        t_start: usize,
    ) -> Result<Tensor> {
        let timesteps = scheduler.timesteps().to_vec();
        for (timestep_index, &timestep) in timesteps.iter().enumerate() {
            if timestep_index < t_start {
                continue;
            }
            let latent_model_input = Tensor::cat(&[&latents, &latents], 0)?;
            let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;
            let noise_pred =
                self.unet
                    .forward(&latent_model_input, timestep as f64, text_embeddings)?;
            let noise_pred = noise_pred.chunk(2, 0)?;
            let (noise_pred_uncond, noise_pred_text) = (&noise_pred[0], &noise_pred[1]);
            let noise_pred =
                (noise_pred_uncond + ((noise_pred_text - noise_pred_uncond)? * GUIDANCE_SCALE)?)?;
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
        }
        Ok(latents)
    }

    fn decode_latents(&self, latents: &Tensor) -> Result<DynamicImage> {
        let decoded = self.vae.decode(&(latents / VAE_SCALE)?)?;
        decoded_to_image(&decoded)
    }
}

impl TextToImage for SdPipeline {
    fn generate(&mut self, request: &TextToImageRequest) -> Result<DynamicImage> {
        if let Some(seed) = request.seed {
            self.device.set_seed(seed)?;
        }
        let mut scheduler = self.config.build_scheduler(request.steps)?;
        let text_embeddings = self.text_embeddings(&request.prompt, &request.negative_prompt)?;

        let latents = Tensor::randn(
            0f32,
            1f32,
            (1, 4, self.config.height / 8, self.config.width / 8),
            &self.device,
        )?
        .to_dtype(self.dtype)?;
        let latents = (latents * scheduler.init_noise_sigma())?;

        let latents = self.denoise(latents, &text_embeddings, scheduler.as_mut(), 0)?;
        self.decode_latents(&latents)
    }
}

impl ImageToImage for SdPipeline {
    fn generate(&mut self, init: &DynamicImage, request: &ImageToImageRequest) -> Result<DynamicImage> {
        let strength = request.strength.clamp(0.0, 1.0);
        if let Some(seed) = request.seed {
            self.device.set_seed(seed)?;
        }
        let mut scheduler = self.config.build_scheduler(request.steps)?;
        let text_embeddings = self.text_embeddings(&request.prompt, &request.negative_prompt)?;

        let init = image_to_tensor(init, self.config.width, self.config.height, &self.device)?
            .to_dtype(self.dtype)?;
        let latent_dist = self.vae.encode(&init)?;
        let latents = (latent_dist.sample()? * VAE_SCALE)?;

        // A stronger push skips less of the schedule.
        let t_start = request.steps - (request.steps as f64 * strength) as usize;
        let timesteps = scheduler.timesteps();
        let latents = if t_start < timesteps.len() {
            let noise = latents.randn_like(0f64, 1f64)?;
            scheduler.add_noise(&latents, noise, timesteps[t_start])?
        } else {
            latents
        };

        let latents = self.denoise(latents, &text_embeddings, scheduler.as_mut(), t_start)?;
        self.decode_latents(&latents)
    }
}
