use anyhow::{Context, Error, Result};
use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::quantized_llama::ModelWeights;
use hf_hub::api::tokio::Api;
use tokenizers::Tokenizer;

use crate::catalog::WeightFile;
use crate::{select_device, ChatModel, ChatRequest, DevicePreference, Loader};

const CHAT_TOKENIZER_REPO: &str = "hf-internal-testing/llama-tokenizer";
const SAMPLING_SEED: u64 = 299792458;
const TEMPERATURE: f64 = 0.8;

/// A GGUF chat checkpoint behind candle's quantized-llama weights.
pub struct ChatPipeline {
    device: Device,
    model: ModelWeights,
    tokenizer: Tokenizer,
    eos_token: Option<u32>,
}

impl Loader for ChatPipeline {
    type Pipeline = Self;

    async fn load(file: &WeightFile, api: &Api, pref: DevicePreference) -> Result<Self> {
        let (device, _dtype) = select_device(pref).context("failed to set up device")?;

        let tokenizer_filename = api
            .model(CHAT_TOKENIZER_REPO.to_string())
            .get("tokenizer.json")
            .await
            .context("failed to get chat tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load chat tokenizer")?;

        let mut reader = std::fs::File::open(&file.path)
            .with_context(|| format!("failed to open {}", file.path.display()))?;
        let content = gguf_file::Content::read(&mut reader)
            .map_err(|e| e.with_path(&file.path))
            .context("failed to read gguf checkpoint")?;
        let model = ModelWeights::from_gguf(content, &mut reader, &device)
            .context("failed to build quantized weights")?;

        let eos_token = tokenizer.token_to_id("</s>");
        Ok(Self {
            device,
            model,
            tokenizer,
            eos_token,
        })
    }
}

impl ChatModel for ChatPipeline {
    /// Greedy-ish completion of `prompt`, returned with the prompt prepended
    /// the way HF text-generation pipelines report `generated_text`.
    fn reply(&mut self, request: &ChatRequest) -> Result<String> {
        let prompt_tokens = self
            .tokenizer
            .encode(request.prompt.as_str(), true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if prompt_tokens.is_empty() {
            anyhow::bail!("prompt produced no tokens");
        }
        if request.max_length <= prompt_tokens.len() {
            return Ok(request.prompt.clone());
        }

        let mut logits_processor = LogitsProcessor::new(SAMPLING_SEED, Some(TEMPERATURE), None);

        let input = Tensor::new(prompt_tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        let logits = self.model.forward(&input, 0)?.squeeze(0)?;
        let mut next_token = logits_processor.sample(&logits)?;

        let mut generated = vec![next_token];
        let mut index_pos = prompt_tokens.len();
        while prompt_tokens.len() + generated.len() < request.max_length {
            if Some(next_token) == self.eos_token {
                break;
            }
            let input = Tensor::new(&[next_token], &self.device)?.unsqueeze(0)?;
            let logits = self.model.forward(&input, index_pos)?.squeeze(0)?;
            next_token = logits_processor.sample(&logits)?;
            generated.push(next_token);
            index_pos += 1;
        }

        let completion_tokens: Vec<u32> = generated
            .into_iter()
            .filter(|t| Some(*t) != self.eos_token)
            .collect();
        let completion = self
            .tokenizer
            .decode(&completion_tokens, true)
            .map_err(Error::msg)?;
        Ok(format!("{}{}", request.prompt, completion))
    }
}
