pub mod catalog;
pub mod device;
mod loader;
mod util;

mod chat;
mod sd;
mod video;

pub use catalog::{list_weights, WeightError, WeightFile, WeightKind};
pub use chat::ChatPipeline;
pub use device::{select_device, DevicePreference};
pub use loader::{load_weight, LoadedPipeline, Loader};
pub use sd::SdPipeline;
pub use video::VideoPipeline;
pub(crate) use util::*;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

// Request types mirror the HTTP surface; defaults match what the UI sends
// when a field is omitted.

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct TextToImageRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default = "default_steps")]
    pub steps: usize,
    pub seed: Option<u64>,
}

impl Default for TextToImageRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            steps: default_steps(),
            seed: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ImageToImageRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default = "default_steps")]
    pub steps: usize,
    /// How far the init image is pushed towards the prompt, in [0, 1].
    #[serde(default = "default_strength")]
    pub strength: f64,
    pub seed: Option<u64>,
}

impl Default for ImageToImageRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            steps: default_steps(),
            strength: default_strength(),
            seed: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ImageToVideoRequest {
    /// Accepted for pipelines that condition on text; the stock video pipeline ignores it.
    pub prompt: Option<String>,
    #[serde(default = "default_fps")]
    pub fps: usize,
    #[serde(default = "default_motion_bucket_id")]
    pub motion_bucket_id: usize,
}

impl Default for ImageToVideoRequest {
    fn default() -> Self {
        Self {
            prompt: None,
            fps: default_fps(),
            motion_bucket_id: default_motion_bucket_id(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub prompt: String,
    /// Cap on prompt plus completion tokens.
    #[serde(default = "default_max_length")]
    pub max_length: usize,
}

impl Default for ChatRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            max_length: default_max_length(),
        }
    }
}

fn default_steps() -> usize {
    20
}

fn default_strength() -> f64 {
    0.75
}

fn default_fps() -> usize {
    7
}

fn default_motion_bucket_id() -> usize {
    127
}

fn default_max_length() -> usize {
    100
}

// The seams the server's registry stores handles behind. Generation takes
// `&mut self` because the underlying decoders carry per-request state.

pub trait TextToImage: Send {
    fn generate(&mut self, request: &TextToImageRequest) -> anyhow::Result<DynamicImage>;
}

pub trait ImageToImage: Send {
    fn generate(
        &mut self,
        init: &DynamicImage,
        request: &ImageToImageRequest,
    ) -> anyhow::Result<DynamicImage>;
}

pub trait ImageToVideo: Send {
    fn generate(
        &mut self,
        init: &DynamicImage,
        request: &ImageToVideoRequest,
    ) -> anyhow::Result<Vec<DynamicImage>>;
}

pub trait ChatModel: Send {
    fn reply(&mut self, request: &ChatRequest) -> anyhow::Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_to_image_defaults_fill_missing_fields() {
        let req: TextToImageRequest = serde_json::from_str(r#"{"prompt": "a boat"}"#).unwrap();
        assert_eq!(req.prompt, "a boat");
        assert_eq!(req.negative_prompt, "");
        assert_eq!(req.steps, 20);
        assert_eq!(req.seed, None);
    }

    #[test]
    fn image_to_image_defaults() {
        let req: ImageToImageRequest = serde_json::from_str(r#"{"prompt": "x"}"#).unwrap();
        assert_eq!(req.steps, 20);
        assert_eq!(req.strength, 0.75);
    }

    #[test]
    fn chat_request_defaults_max_length() {
        let req: ChatRequest = serde_json::from_str(r#"{"prompt": "hi"}"#).unwrap();
        assert_eq!(req.max_length, 100);
    }

    #[test]
    fn chat_request_honors_explicit_max_length() {
        let req: ChatRequest =
            serde_json::from_str(r#"{"prompt": "hi", "max_length": 32}"#).unwrap();
        assert_eq!(req.max_length, 32);
    }

    #[test]
    fn video_request_defaults() {
        let req: ImageToVideoRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.fps, 7);
        assert_eq!(req.motion_bucket_id, 127);
        assert_eq!(req.prompt, None);
    }
}
