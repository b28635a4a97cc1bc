#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use moegen_cli::http::{AccessTokens, AppState};
use moegen_core::api::{
    AppConfig, BackendService, ChatMessage, DownloadedImage, EventBus, GenResult, GlobalConfig,
    ImageDownloader, ImageProvider, ProviderFactory, SchedulerConfig, Services,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub const TOKEN: &str = "secret-token";

struct NoImageProvider;

#[async_trait]
impl ImageProvider for NoImageProvider {
    fn name(&self) -> &str {
        "none"
    }

    async fn request_image(
        &self,
        _messages: &[ChatMessage],
        _cancel: &CancellationToken,
    ) -> GenResult<Option<String>> {
        Ok(None)
    }
}

struct NoImageFactory;

impl ProviderFactory for NoImageFactory {
    fn build(&self, _config: &GlobalConfig) -> GenResult<Arc<dyn ImageProvider>> {
        Ok(Arc::new(NoImageProvider))
    }
}

struct EmptyDownloader;

#[async_trait]
impl ImageDownloader for EmptyDownloader {
    async fn download(&self, _url: &str) -> GenResult<DownloadedImage> {
        Ok(DownloadedImage {
            bytes: b"img".to_vec(),
            content_type: "image/png".to_string(),
        })
    }
}

/// Server state over `dir` that accepts only [`TOKEN`].
pub async fn test_state(dir: &Path) -> AppState {
    let services = Services {
        providers: Arc::new(NoImageFactory),
        downloader: Arc::new(EmptyDownloader),
    };
    let scheduler = SchedulerConfig {
        retry_delay_ms: 50,
        sweep_delay_ms: 20,
    };
    let service = BackendService::open(dir, EventBus::default(), services, &scheduler)
        .await
        .unwrap();

    let mut config = AppConfig::default();
    config.storage.data_dir = dir.to_string_lossy().into_owned();
    let (shutdown_tx, _) = broadcast::channel(1);
    AppState::new(service, AccessTokens::new([TOKEN]), config, shutdown_tx)
}
