use std::path::Path;

use anyhow::anyhow;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::{prelude::BASE64_STANDARD, Engine};
use easel_core::{
    list_weights, load_weight, ChatRequest, ImageToImageRequest, ImageToVideoRequest,
    LoadedPipeline, Loader, TextToImageRequest, WeightFile,
};
use hf_hub::api::tokio::Api;
use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, DynamicImage, Frame, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const PLACEHOLDER_SIZE: u32 = 512;
const TEXT2IMG_PLACEHOLDER: [u8; 3] = [73, 109, 137];
const IMG2IMG_PLACEHOLDER: [u8; 3] = [100, 50, 150];
const NO_VIDEO_MODEL: &str =
    "No Video Model Loaded. Please load an SVD .safetensors file first.";
const UPLOAD_LIMIT: usize = 256 * 1024 * 1024;

pub fn build_router(state: AppState) -> Router {
    let outputs_dir = state.outputs_dir.clone();
    Router::new()
        .route("/models", get(list_models))
        .route("/load/image", post(load_image_model))
        .route("/load/chat", post(load_chat_model))
        .route("/chat", post(chat))
        .route("/generate/text2img", post(generate_text2img))
        .route("/generate/img2img", post(generate_img2img))
        .route("/generate/video", post(generate_video))
        .nest_service("/outputs", ServeDir::new(outputs_dir))
        .layer(DefaultBodyLimit::max(UPLOAD_LIMIT))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Deserialize)]
struct LoadRequest {
    name: String,
}

#[derive(Serialize)]
struct LoadResponse {
    status: &'static str,
    message: String,
}

#[derive(Serialize)]
struct ModelsResponse {
    models: Vec<String>,
}

#[derive(Serialize)]
struct ChatResponse {
    response: String,
}

#[derive(Serialize)]
struct ImageResponse {
    image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<&'static str>,
}

#[derive(Serialize)]
struct VideoResponse {
    video_url: String,
}

async fn list_models(State(state): State<AppState>) -> ApiResult<Json<ModelsResponse>> {
    let models = list_weights(&state.models_dir)?;
    Ok(Json(ModelsResponse { models }))
}

/// Loads a weight file into the slot matching its detected family: video
/// checkpoints land in the video slot even through this endpoint.
async fn load_image_model(
    State(state): State<AppState>,
    Json(req): Json<LoadRequest>,
) -> ApiResult<Json<LoadResponse>> {
    let file = WeightFile::resolve(&state.models_dir, &req.name)?;
    let api = Api::new().map_err(|e| ApiError::internal(format!("hub api: {e}")))?;
    let loaded = load_weight(&file, &api, state.device).await?;

    let mut registry = state.registry.write().await;
    let message = match loaded {
        LoadedPipeline::Image(pipeline) => {
            registry.install_image(&file.name, pipeline);
            format!("Loaded image/img2img model {}", file.name)
        }
        LoadedPipeline::Video(pipeline) => {
            registry.install_video(&file.name, pipeline);
            format!("Loaded generic video model {}", file.name)
        }
        LoadedPipeline::Chat(pipeline) => {
            registry.install_chat(&file.name, pipeline);
            format!("Loaded chat model {}", file.name)
        }
    };
    tracing::debug!(
        image = ?registry.image_model(),
        video = ?registry.video_model(),
        chat = ?registry.chat_model(),
        "registry slots"
    );
    tracing::info!("{message}");
    Ok(Json(LoadResponse {
        status: "success",
        message,
    }))
}

async fn load_chat_model(
    State(state): State<AppState>,
    Json(req): Json<LoadRequest>,
) -> ApiResult<Json<LoadResponse>> {
    let file = WeightFile::resolve(&state.models_dir, &req.name)?;
    let api = Api::new().map_err(|e| ApiError::internal(format!("hub api: {e}")))?;
    let pipeline = easel_core::ChatPipeline::load(&file, &api, state.device)
        .await
        .map_err(|e| ApiError::internal(format!("Failed to load as chat model: {e:#}")))?;

    let mut registry = state.registry.write().await;
    registry.install_chat(&file.name, pipeline);
    let message = format!("Loaded chat model {}", file.name);
    tracing::info!("{message}");
    Ok(Json(LoadResponse {
        status: "success",
        message,
    }))
}

async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> ApiResult<Json<ChatResponse>> {
    let handle = state.registry.read().await.chat();
    let Some(pipeline) = handle else {
        return Ok(Json(ChatResponse {
            response: format!("Echo (No model loaded): {}", req.prompt),
        }));
    };

    let response = tokio::task::spawn_blocking(move || {
        let mut pipeline = pipeline
            .lock()
            .map_err(|_| anyhow!("chat pipeline mutex poisoned"))?;
        pipeline.reply(&req)
    })
    .await??;
    Ok(Json(ChatResponse { response }))
}

async fn generate_text2img(
    State(state): State<AppState>,
    Json(req): Json<TextToImageRequest>,
) -> ApiResult<Json<ImageResponse>> {
    if req.steps == 0 {
        return Err(ApiError::bad_request("steps must be positive"));
    }

    let handle = state.registry.read().await.text2img();
    let Some(pipeline) = handle else {
        let placeholder = placeholder_image(TEXT2IMG_PLACEHOLDER);
        return Ok(Json(ImageResponse {
            image: png_data_url(&placeholder)?,
            status: Some("mocked"),
        }));
    };

    let image = tokio::task::spawn_blocking(move || {
        let mut pipeline = pipeline
            .lock()
            .map_err(|_| anyhow!("image pipeline mutex poisoned"))?;
        pipeline.generate(&req)
    })
    .await??;
    Ok(Json(ImageResponse {
        image: png_data_url(&image)?,
        status: None,
    }))
}

async fn generate_img2img(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<ImageResponse>> {
    let mut request = ImageToImageRequest::default();
    let mut has_prompt = false;
    let mut upload = None;

    while let Some(field) = multipart.next_field().await? {
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };
        match name.as_str() {
            "prompt" => {
                request.prompt = field.text().await?;
                has_prompt = true;
            }
            "negative_prompt" => request.negative_prompt = field.text().await?,
            "steps" => request.steps = parse_field(&field.text().await?, "steps")?,
            "strength" => request.strength = parse_field(&field.text().await?, "strength")?,
            "image" => upload = Some(field.bytes().await?),
            _ => {}
        }
    }
    if !has_prompt {
        return Err(ApiError::bad_request("missing form field: prompt"));
    }
    let upload = upload.ok_or_else(|| ApiError::bad_request("missing form field: image"))?;
    if request.steps == 0 {
        return Err(ApiError::bad_request("steps must be positive"));
    }

    let handle = state.registry.read().await.img2img();
    let Some(pipeline) = handle else {
        let placeholder = placeholder_image(IMG2IMG_PLACEHOLDER);
        return Ok(Json(ImageResponse {
            image: png_data_url(&placeholder)?,
            status: Some("mocked (no model)"),
        }));
    };

    let init = image::load_from_memory(&upload)
        .map_err(|e| ApiError::bad_request(format!("could not decode uploaded image: {e}")))?;
    let image = tokio::task::spawn_blocking(move || {
        let mut pipeline = pipeline
            .lock()
            .map_err(|_| anyhow!("image pipeline mutex poisoned"))?;
        pipeline.generate(&init, &request)
    })
    .await??;
    Ok(Json(ImageResponse {
        image: png_data_url(&image)?,
        status: None,
    }))
}

async fn generate_video(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<VideoResponse>> {
    let mut request = ImageToVideoRequest::default();
    let mut upload = None;

    while let Some(field) = multipart.next_field().await? {
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };
        match name.as_str() {
            "image" => upload = Some(field.bytes().await?),
            "prompt" => request.prompt = Some(field.text().await?),
            "fps" => request.fps = parse_field(&field.text().await?, "fps")?,
            "motion_bucket_id" => {
                request.motion_bucket_id = parse_field(&field.text().await?, "motion_bucket_id")?
            }
            _ => {}
        }
    }
    let upload = upload.ok_or_else(|| ApiError::bad_request("missing form field: image"))?;

    let handle = state.registry.read().await.video();
    let Some(pipeline) = handle else {
        return Err(ApiError::bad_request(NO_VIDEO_MODEL));
    };
    if let Some(prompt) = &request.prompt {
        // SVD-style pipelines take no text conditioning.
        tracing::debug!("video prompt accepted but unused: {prompt}");
    }

    let init = image::load_from_memory(&upload)
        .map_err(|e| ApiError::bad_request(format!("could not decode uploaded image: {e}")))?;
    let fps = request.fps;
    let frames = tokio::task::spawn_blocking(move || {
        let mut pipeline = pipeline
            .lock()
            .map_err(|_| anyhow!("video pipeline mutex poisoned"))?;
        pipeline.generate(&init, &request)
    })
    .await??;

    let filename = format!("{}.gif", Uuid::new_v4());
    let path = state.outputs_dir.join(&filename);
    write_gif(&path, &frames, fps)?;
    tracing::info!(%filename, frames = frames.len(), "wrote video clip");
    Ok(Json(VideoResponse {
        video_url: format!("/outputs/{filename}"),
    }))
}

fn parse_field<T: std::str::FromStr>(raw: &str, name: &str) -> Result<T, ApiError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| ApiError::bad_request(format!("invalid {name}: {e}")))
}

fn placeholder_image(color: [u8; 3]) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(
        PLACEHOLDER_SIZE,
        PLACEHOLDER_SIZE,
        Rgb(color),
    ))
}

/// PNG-encodes an image into the `data:image/png;base64,…` URL the UI renders
/// directly.
fn png_data_url(image: &DynamicImage) -> anyhow::Result<String> {
    let mut bytes = Vec::new();
    image.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(format!(
        "data:image/png;base64,{}",
        BASE64_STANDARD.encode(&bytes)
    ))
}

/// Encodes frames as a looping GIF with 1000/fps ms per frame.
fn write_gif(path: &Path, frames: &[DynamicImage], fps: usize) -> anyhow::Result<()> {
    let fps = fps.clamp(1, 60) as u32;
    let file = std::fs::File::create(path)?;
    let mut encoder = GifEncoder::new(file);
    encoder.set_repeat(Repeat::Infinite)?;
    for frame in frames {
        let delay = Delay::from_numer_denom_ms(1000, fps);
        encoder.encode_frame(Frame::from_parts(frame.to_rgba8(), 0, 0, delay))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use easel_core::DevicePreference;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const BOUNDARY: &str = "XoXoTESTBOUNDARYoXoX";

    fn test_state() -> (AppState, tempfile::TempDir, tempfile::TempDir) {
        let models = tempfile::tempdir().unwrap();
        let outputs = tempfile::tempdir().unwrap();
        let state = AppState::new(
            models.path().to_path_buf(),
            outputs.path().to_path_buf(),
            DevicePreference::ForceCpu,
        );
        (state, models, outputs)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn multipart_request(uri: &str, fields: &[(&str, &str)]) -> Request<Body> {
        let mut body = String::new();
        for (name, value) in fields {
            body.push_str(&format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            ));
        }
        body.push_str(&format!("--{BOUNDARY}--\r\n"));
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn decode_data_url(url: &str) -> DynamicImage {
        let encoded = url
            .strip_prefix("data:image/png;base64,")
            .expect("data url prefix");
        let bytes = BASE64_STANDARD.decode(encoded).unwrap();
        image::load_from_memory(&bytes).unwrap()
    }

    #[tokio::test]
    async fn models_lists_empty_directory() {
        let (state, _models, _outputs) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(Request::get("/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["models"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn models_lists_weight_files_sorted() {
        let (state, models, _outputs) = test_state();
        for name in ["b.safetensors", "a.gguf", "readme.md"] {
            std::fs::write(models.path().join(name), b"x").unwrap();
        }
        let app = build_router(state);
        let response = app
            .oneshot(Request::get("/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["models"], serde_json::json!(["a.gguf", "b.safetensors"]));
    }

    #[tokio::test]
    async fn chat_echoes_without_model() {
        let (state, _models, _outputs) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(json_request("/chat", r#"{"prompt": "hello there"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["response"], "Echo (No model loaded): hello there");
    }

    #[tokio::test]
    async fn text2img_mocks_without_model() {
        let (state, _models, _outputs) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(json_request("/generate/text2img", r#"{"prompt": "a cat"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "mocked");
        let image = decode_data_url(json["image"].as_str().unwrap()).to_rgb8();
        assert_eq!(image.dimensions(), (512, 512));
        assert_eq!(image.get_pixel(0, 0).0, TEXT2IMG_PLACEHOLDER);
    }

    #[tokio::test]
    async fn text2img_rejects_zero_steps() {
        let (state, _models, _outputs) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(json_request(
                "/generate/text2img",
                r#"{"prompt": "a cat", "steps": 0}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn img2img_requires_prompt() {
        let (state, _models, _outputs) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(multipart_request(
                "/generate/img2img",
                &[("image", "notanimage")],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"], "missing form field: prompt");
    }

    #[tokio::test]
    async fn img2img_mocks_without_model() {
        let (state, _models, _outputs) = test_state();
        let app = build_router(state);
        // The mocked branch replies before the upload is ever decoded, so junk
        // bytes are fine here.
        let response = app
            .oneshot(multipart_request(
                "/generate/img2img",
                &[("prompt", "a dog"), ("strength", "0.5"), ("image", "junk")],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "mocked (no model)");
        let image = decode_data_url(json["image"].as_str().unwrap()).to_rgb8();
        assert_eq!(image.get_pixel(0, 0).0, IMG2IMG_PLACEHOLDER);
    }

    #[tokio::test]
    async fn img2img_rejects_bad_steps_value() {
        let (state, _models, _outputs) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(multipart_request(
                "/generate/img2img",
                &[("prompt", "x"), ("steps", "lots"), ("image", "junk")],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn video_without_model_is_rejected() {
        let (state, _models, _outputs) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(multipart_request(
                "/generate/video",
                &[("image", "junk"), ("fps", "7")],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"], NO_VIDEO_MODEL);
    }

    #[tokio::test]
    async fn video_requires_image_upload() {
        let (state, _models, _outputs) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(multipart_request("/generate/video", &[("fps", "7")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"], "missing form field: image");
    }

    #[tokio::test]
    async fn load_image_unknown_model_is_404() {
        let (state, _models, _outputs) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(json_request("/load/image", r#"{"name": "ghost.safetensors"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Model file not found");
    }

    #[tokio::test]
    async fn load_image_rejects_traversal_names() {
        let (state, _models, _outputs) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(json_request("/load/image", r#"{"name": "../../etc/passwd"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn parse_field_reports_the_field_name() {
        let parsed: Result<usize, _> = parse_field("12", "steps");
        assert_eq!(parsed.unwrap(), 12);
        let err = parse_field::<usize>("twelve", "steps").unwrap_err();
        assert!(err.message.contains("steps"));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn png_data_url_has_prefix() {
        let url = png_data_url(&placeholder_image([1, 2, 3])).unwrap();
        assert!(url.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn write_gif_produces_a_gif_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.gif");
        let frames = vec![
            placeholder_image([255, 0, 0]),
            placeholder_image([0, 255, 0]),
        ];
        write_gif(&path, &frames, 7).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], b"GIF8");
    }
}
