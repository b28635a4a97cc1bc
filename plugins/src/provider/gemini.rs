use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use moegen_core::api::{
    extract_image, ApiFormat, ChatMessage, ContentPart, GenResult, GlobalConfig, ImageProvider,
    LastJsonAccumulator, ProviderResponse,
};
use moegen_core::provider::parse_data_url;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::http::{self, log_preview};
use super::url::{gemini_endpoint, GeminiEndpoint, KeyPlacement};

#[derive(Debug, Serialize, PartialEq)]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Content {
    pub role: &'static str,
    pub parts: Vec<Part>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Part {
    Text { text: String },
    InlineData { inline_data: InlineData },
    FileData { file_data: FileData },
}

#[derive(Debug, Serialize, PartialEq)]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct FileData {
    pub file_uri: String,
}

fn image_part(url: &str) -> Part {
    match parse_data_url(url) {
        Some(image) => Part::InlineData {
            inline_data: InlineData {
                mime_type: if image.content_type.is_empty() {
                    "image/png".to_string()
                } else {
                    image.content_type
                },
                data: STANDARD.encode(&image.bytes),
            },
        },
        None => Part::FileData {
            file_data: FileData {
                file_uri: url.to_string(),
            },
        },
    }
}

/// Flatten chat messages into a single user turn of generateContent parts.
pub fn contents_from_messages(messages: &[ChatMessage]) -> GenerateContentRequest {
    let parts = messages
        .iter()
        .flat_map(|m| m.content.iter())
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(Part::Text { text: text.clone() }),
            ContentPart::ImageUrl { image_url } if !image_url.url.is_empty() => {
                Some(image_part(&image_url.url))
            }
            ContentPart::ImageUrl { .. } => None,
        })
        .collect();
    GenerateContentRequest {
        contents: vec![Content {
            role: "user",
            parts,
        }],
    }
}

/// generateContent provider; serves both `gemini` and `vertex` formats.
pub struct GeminiProvider {
    http: reqwest::Client,
    format: ApiFormat,
    endpoint: GeminiEndpoint,
    api_key: String,
    model: String,
    stream: bool,
}

impl GeminiProvider {
    pub fn new(http: reqwest::Client, config: &GlobalConfig) -> GenResult<Self> {
        Ok(Self {
            http,
            format: config.api_format,
            endpoint: gemini_endpoint(config)?,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            stream: config.stream,
        })
    }

    pub fn url(&self) -> &str {
        &self.endpoint.url
    }
}

#[async_trait]
impl ImageProvider for GeminiProvider {
    fn name(&self) -> &str {
        self.format.as_str()
    }

    async fn request_image(
        &self,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> GenResult<Option<String>> {
        let url = self.endpoint.url.as_str();
        tracing::info!(
            target: "moegen.provider",
            stage = "provider.gemini.request",
            format = %self.format,
            model = %self.model,
            stream = self.stream
        );
        let mut request = self
            .http
            .post(url)
            .json(&contents_from_messages(messages));
        if self.endpoint.key_placement == KeyPlacement::Bearer {
            request = request.bearer_auth(&self.api_key);
        }
        let response = http::send(request, url, cancel).await?;
        tracing::info!(
            target: "moegen.provider",
            stage = "provider.gemini.response",
            format = %self.format,
            status = response.status().as_u16()
        );
        let response = http::ensure_success(response).await?;

        let payload = if self.stream {
            let acc = http::read_stream(response, url, LastJsonAccumulator::new(), cancel).await?;
            ProviderResponse::Json(acc.into_last().unwrap_or(Value::Null))
        } else {
            http::read_json(response, url, cancel).await?
        };

        let image = extract_image(&payload);
        if image.is_none() {
            tracing::debug!(
                target: "moegen.provider",
                stage = "provider.gemini.no_image",
                body = %log_preview(&payload)
            );
        }
        Ok(image)
    }
}
