use async_trait::async_trait;
use moegen_core::api::{
    extract_image, ChatMessage, DeltaTextAccumulator, GenResult, GlobalConfig, ImageProvider,
    ProviderResponse,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::http::{self, log_preview};
use super::url::openai_chat_url;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

/// Chat-completions provider (`apiFormat = openai`).
pub struct OpenAiProvider {
    http: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    stream: bool,
}

impl OpenAiProvider {
    pub fn new(http: reqwest::Client, config: &GlobalConfig) -> Self {
        Self {
            http,
            url: openai_chat_url(config),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            stream: config.stream,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ImageProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn request_image(
        &self,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> GenResult<Option<String>> {
        tracing::info!(
            target: "moegen.provider",
            stage = "provider.openai.request",
            url = %self.url,
            model = %self.model,
            stream = self.stream
        );
        let body = ChatRequest {
            model: &self.model,
            messages,
            stream: self.stream,
        };
        let request = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .header("x-api-key", &self.api_key)
            .json(&body);
        let response = http::send(request, &self.url, cancel).await?;
        tracing::info!(
            target: "moegen.provider",
            stage = "provider.openai.response",
            status = response.status().as_u16()
        );
        let response = http::ensure_success(response).await?;

        let payload = if self.stream {
            let acc =
                http::read_stream(response, &self.url, DeltaTextAccumulator::new(), cancel)
                    .await?;
            ProviderResponse::Text(acc.into_text())
        } else {
            http::read_body(response, &self.url, cancel).await?
        };

        let image = extract_image(&payload);
        if image.is_none() {
            tracing::debug!(
                target: "moegen.provider",
                stage = "provider.openai.no_image",
                body = %log_preview(&payload)
            );
        }
        Ok(image)
    }
}
