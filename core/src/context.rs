use std::sync::Arc;

use crate::config::AppConfig;
use crate::error::GenResult;
use crate::provider::{ImageDownloader, ProviderFactory};

/// Outbound collaborators the scheduler depends on.
#[derive(Clone)]
pub struct Services {
    pub providers: Arc<dyn ProviderFactory>,
    pub downloader: Arc<dyn ImageDownloader>,
}

#[async_trait::async_trait]
pub trait ServicesFactory: Send + Sync {
    async fn build_services(&self, cfg: &AppConfig) -> GenResult<Services>;
}
