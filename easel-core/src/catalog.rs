use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

/// Weight file extensions the catalog admits: safetensors checkpoints for the
/// diffusion pipelines, GGUF for chat.
const WEIGHT_EXTENSIONS: &[&str] = &["safetensors", "gguf"];

/// Pipeline family a weight file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WeightKind {
    Image,
    Video,
    Chat,
}

impl WeightKind {
    /// Detect the pipeline family from a weight file name.
    pub fn from_name(name: &str) -> Self {
        let name_lower = name.to_lowercase();
        if name_lower.ends_with(".gguf") {
            WeightKind::Chat
        } else if name_lower.contains("svd") || name_lower.contains("video") {
            WeightKind::Video
        } else {
            WeightKind::Image
        }
    }
}

#[derive(Debug, Error)]
pub enum WeightError {
    #[error("Model file not found")]
    NotFound(String),
    #[error("invalid model name: {0:?}")]
    InvalidName(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A weight file resolved inside the models directory.
#[derive(Debug, Clone)]
pub struct WeightFile {
    pub name: String,
    pub path: PathBuf,
    pub kind: WeightKind,
}

impl WeightFile {
    /// Resolves `name` inside `dir`. Names are plain file names; anything that
    /// could escape the directory is rejected up front.
    pub fn resolve(dir: &Path, name: &str) -> Result<Self, WeightError> {
        if name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name.contains("..")
        {
            return Err(WeightError::InvalidName(name.to_string()));
        }
        let path = dir.join(name);
        if !path.is_file() {
            return Err(WeightError::NotFound(name.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            path,
            kind: WeightKind::from_name(name),
        })
    }
}

/// Lists weight files directly under `dir`, sorted by file name. A missing
/// directory lists as empty rather than erroring; subdirectories are skipped.
pub fn list_weights(dir: &Path) -> Result<Vec<String>, WeightError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut names = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if !WEIGHT_EXTENSIONS.contains(&ext.to_lowercase().as_str()) {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}
