//! ServicesFactory 实现：从配置构建 provider 工厂与图片下载器，供 CLI 复用。
use std::sync::Arc;

use async_trait::async_trait;
use moegen_core::api::{AppConfig, GenResult, Services, ServicesFactory};

use crate::factory::PluginProviderFactory;

pub struct PluginServicesFactory;

impl Default for PluginServicesFactory {
    fn default() -> Self {
        Self
    }
}

#[async_trait]
impl ServicesFactory for PluginServicesFactory {
    async fn build_services(&self, cfg: &AppConfig) -> GenResult<Services> {
        let providers = PluginProviderFactory::new(&cfg.provider)?;
        let downloader = providers.downloader();
        Ok(Services {
            providers: Arc::new(providers),
            downloader: Arc::new(downloader),
        })
    }
}
