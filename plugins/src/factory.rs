use std::sync::Arc;

use moegen_core::api::{
    ApiFormat, GenError, GenResult, GlobalConfig, ImageProvider, ProviderConfig, ProviderFactory,
};

use crate::provider::{http, GeminiProvider, HttpImageDownloader, OpenAiProvider};

/// Builds the provider matching `apiFormat` over one shared HTTP client.
pub struct PluginProviderFactory {
    http: reqwest::Client,
}

impl PluginProviderFactory {
    pub fn new(cfg: &ProviderConfig) -> GenResult<Self> {
        Ok(Self {
            http: http::build_client(cfg.timeout_ms)?,
        })
    }

    pub fn downloader(&self) -> HttpImageDownloader {
        HttpImageDownloader::new(self.http.clone())
    }
}

impl ProviderFactory for PluginProviderFactory {
    fn build(&self, config: &GlobalConfig) -> GenResult<Arc<dyn ImageProvider>> {
        if config.api_key.trim().is_empty() {
            return Err(GenError::Config("API key is not configured".to_string()));
        }
        if config.model.trim().is_empty() {
            return Err(GenError::Config("model is not configured".to_string()));
        }
        Ok(match config.api_format {
            ApiFormat::Openai => Arc::new(OpenAiProvider::new(self.http.clone(), config)),
            ApiFormat::Gemini | ApiFormat::Vertex => {
                Arc::new(GeminiProvider::new(self.http.clone(), config)?)
            }
        })
    }
}
