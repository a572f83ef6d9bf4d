use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use easel_core::{ChatModel, DevicePreference, ImageToImage, ImageToVideo, TextToImage};
use tokio::sync::RwLock;

/// Shared axum state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RwLock<Registry>>,
    pub models_dir: PathBuf,
    pub outputs_dir: PathBuf,
    pub device: DevicePreference,
}

impl AppState {
    pub fn new(models_dir: PathBuf, outputs_dir: PathBuf, device: DevicePreference) -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
            models_dir,
            outputs_dir,
            device,
        }
    }
}

/// The mutable registry of swappable pipeline handles: at most four are live
/// at a time, and an empty slot means the corresponding endpoint serves its
/// mocked output (or, for video, refuses).
#[derive(Default)]
pub struct Registry {
    text2img: Option<Arc<Mutex<dyn TextToImage>>>,
    img2img: Option<Arc<Mutex<dyn ImageToImage>>>,
    video: Option<Arc<Mutex<dyn ImageToVideo>>>,
    chat: Option<Arc<Mutex<dyn ChatModel>>>,
    image_model: Option<String>,
    video_model: Option<String>,
    chat_model: Option<String>,
}

impl Registry {
    /// Installs a loaded image pipeline. The img2img handle shares the same
    /// pipeline object as the text2img handle.
    pub fn install_image<P>(&mut self, name: &str, pipeline: P)
    where
        P: TextToImage + ImageToImage + 'static,
    {
        let shared = Arc::new(Mutex::new(pipeline));
        let text2img: Arc<Mutex<dyn TextToImage>> = shared.clone();
        let img2img: Arc<Mutex<dyn ImageToImage>> = shared;
        self.text2img = Some(text2img);
        self.img2img = Some(img2img);
        self.image_model = Some(name.to_string());
    }

    pub fn install_video<P: ImageToVideo + 'static>(&mut self, name: &str, pipeline: P) {
        let video: Arc<Mutex<dyn ImageToVideo>> = Arc::new(Mutex::new(pipeline));
        self.video = Some(video);
        self.video_model = Some(name.to_string());
    }

    pub fn install_chat<P: ChatModel + 'static>(&mut self, name: &str, pipeline: P) {
        let chat: Arc<Mutex<dyn ChatModel>> = Arc::new(Mutex::new(pipeline));
        self.chat = Some(chat);
        self.chat_model = Some(name.to_string());
    }

    pub fn text2img(&self) -> Option<Arc<Mutex<dyn TextToImage>>> {
        self.text2img.clone()
    }

    pub fn img2img(&self) -> Option<Arc<Mutex<dyn ImageToImage>>> {
        self.img2img.clone()
    }

    pub fn video(&self) -> Option<Arc<Mutex<dyn ImageToVideo>>> {
        self.video.clone()
    }

    pub fn chat(&self) -> Option<Arc<Mutex<dyn ChatModel>>> {
        self.chat.clone()
    }

    pub fn image_model(&self) -> Option<&str> {
        self.image_model.as_deref()
    }

    pub fn video_model(&self) -> Option<&str> {
        self.video_model.as_deref()
    }

    pub fn chat_model(&self) -> Option<&str> {
        self.chat_model.as_deref()
    }
}
