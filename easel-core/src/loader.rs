use std::future::Future;

use anyhow::Result;
use hf_hub::api::tokio::Api;

use crate::catalog::{WeightFile, WeightKind};
use crate::{ChatPipeline, DevicePreference, SdPipeline, VideoPipeline};

/// Builds a pipeline from a local weight file. Tokenizers are fetched through
/// the hub `api`; model weights never are.
pub trait Loader {
    type Pipeline;

    fn load(
        file: &WeightFile,
        api: &Api,
        pref: DevicePreference,
    ) -> impl Future<Output = Result<Self::Pipeline>>
    where
        Self: Sized;
}

/// A pipeline ready to install into a registry slot.
pub enum LoadedPipeline {
    Image(SdPipeline),
    Video(VideoPipeline),
    Chat(ChatPipeline),
}

/// Loads a weight file with the loader matching its detected family.
pub async fn load_weight(
    file: &WeightFile,
    api: &Api,
    pref: DevicePreference,
) -> Result<LoadedPipeline> {
    tracing::info!(name = %file.name, kind = ?file.kind, "loading weight file");
    match file.kind {
        WeightKind::Image => Ok(LoadedPipeline::Image(SdPipeline::load(file, api, pref).await?)),
        WeightKind::Video => Ok(LoadedPipeline::Video(
            VideoPipeline::load(file, api, pref).await?,
        )),
        WeightKind::Chat => Ok(LoadedPipeline::Chat(
            ChatPipeline::load(file, api, pref).await?,
        )),
    }
}
