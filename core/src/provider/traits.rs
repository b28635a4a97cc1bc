use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::message::ChatMessage;
use super::payload::DownloadedImage;
use crate::error::GenResult;
use crate::model::GlobalConfig;

/// One configured image-generation backend.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Run one generation attempt.
    ///
    /// Returns the extracted image reference (http(s) or data URL), or `None`
    /// when the response carried no image. Cancelling `cancel` aborts the
    /// in-flight request with `GenError::Cancelled`.
    async fn request_image(
        &self,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> GenResult<Option<String>>;
}

/// Builds a provider for the active global configuration.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, config: &GlobalConfig) -> GenResult<Arc<dyn ImageProvider>>;
}

/// Fetches a remote image reference.
#[async_trait]
pub trait ImageDownloader: Send + Sync {
    async fn download(&self, url: &str) -> GenResult<DownloadedImage>;
}
