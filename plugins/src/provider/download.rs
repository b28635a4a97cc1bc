use async_trait::async_trait;
use moegen_core::api::{DownloadedImage, GenError, GenResult, ImageDownloader};
use reqwest::header::CONTENT_TYPE;

use super::http::transport_error;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Fetches `http(s)` image references returned by providers.
#[derive(Clone)]
pub struct HttpImageDownloader {
    http: reqwest::Client,
}

impl HttpImageDownloader {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ImageDownloader for HttpImageDownloader {
    async fn download(&self, url: &str) -> GenResult<DownloadedImage> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| transport_error(err, url))?;
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(
                target: "moegen.provider",
                stage = "provider.download.status_error",
                url = %url,
                status = status.as_u16()
            );
            let message = status
                .canonical_reason()
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            return Err(GenError::protocol(Some(status.as_u16()), message));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| transport_error(err, url))?;
        tracing::debug!(
            target: "moegen.provider",
            stage = "provider.download.done",
            url = %url,
            bytes = bytes.len(),
            content_type = %content_type
        );
        Ok(DownloadedImage {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}
