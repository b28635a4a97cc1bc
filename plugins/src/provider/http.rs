//! Shared reqwest plumbing: sending with cancellation, error mapping, body reading.

use std::time::Duration;

use moegen_core::api::{
    GenError, GenResult, LineBuffer, ProviderResponse, StreamAccumulator, TransportKind,
};
use reqwest::{RequestBuilder, Response};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

const LOG_PREVIEW_LIMIT: usize = 800;
const DATA_IMAGE_PREFIX_CHARS: usize = 60;

pub fn build_client(timeout_ms: u64) -> GenResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
        .map_err(|err| GenError::Config(format!("failed to build http client: {err}")))
}

pub fn transport_kind(err: &reqwest::Error) -> TransportKind {
    if err.is_timeout() {
        TransportKind::Timeout
    } else if err.is_connect() {
        TransportKind::Connect
    } else if err.is_request() {
        TransportKind::Request
    } else if err.is_body() {
        TransportKind::Body
    } else if err.is_decode() {
        TransportKind::Decode
    } else {
        TransportKind::Unknown
    }
}

pub fn transport_error(err: reqwest::Error, url: &str) -> GenError {
    let kind = transport_kind(&err);
    tracing::warn!(
        target: "moegen.provider",
        stage = "provider.http.transport_error",
        kind = %kind,
        url = %url,
        error = %err
    );
    GenError::Transport {
        kind,
        message: err.to_string(),
    }
}

/// Send the request unless `cancel` fires first.
pub async fn send(
    request: RequestBuilder,
    url: &str,
    cancel: &CancellationToken,
) -> GenResult<Response> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GenError::Cancelled),
        res = request.send() => res.map_err(|err| transport_error(err, url)),
    }
}

fn status_fallback(response: &Response) -> String {
    let status = response.status();
    match status.canonical_reason() {
        Some(reason) => reason.to_string(),
        None => format!("HTTP {}", status.as_u16()),
    }
}

/// Pick the most useful message out of an error body.
pub fn error_message_from_body(body: &str) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return Some(body.to_string());
    };
    let pick = |ptr: &str| {
        value
            .pointer(ptr)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    pick("/error/message")
        .or_else(|| pick("/message"))
        .or_else(|| Some(body.to_string()))
}

/// Pass a success response through; turn anything else into a protocol error.
pub async fn ensure_success(response: Response) -> GenResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let fallback = status_fallback(&response);
    let message = match response.text().await {
        Ok(body) => error_message_from_body(&body).unwrap_or(fallback),
        Err(_) => fallback,
    };
    tracing::warn!(
        target: "moegen.provider",
        stage = "provider.http.status_error",
        status = status.as_u16(),
        message = %log_preview_text(&message)
    );
    Err(GenError::protocol(Some(status.as_u16()), message))
}

/// Read the whole body; JSON when it parses, raw text otherwise.
pub async fn read_body(
    response: Response,
    url: &str,
    cancel: &CancellationToken,
) -> GenResult<ProviderResponse> {
    let text = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(GenError::Cancelled),
        res = response.text() => res.map_err(|err| transport_error(err, url))?,
    };
    Ok(match serde_json::from_str::<Value>(&text) {
        Ok(value) => ProviderResponse::Json(value),
        Err(_) => ProviderResponse::Text(text),
    })
}

/// Read the whole body as JSON; anything else is a protocol error.
pub async fn read_json(
    response: Response,
    url: &str,
    cancel: &CancellationToken,
) -> GenResult<ProviderResponse> {
    let text = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(GenError::Cancelled),
        res = response.text() => res.map_err(|err| transport_error(err, url))?,
    };
    match serde_json::from_str::<Value>(&text) {
        Ok(value) => Ok(ProviderResponse::Json(value)),
        Err(err) => {
            tracing::warn!(
                target: "moegen.provider",
                stage = "provider.http.invalid_json",
                error = %err,
                body = %log_preview_text(&text)
            );
            Err(GenError::protocol(None, format!("invalid JSON response: {err}")))
        }
    }
}

/// Feed a streamed body line by line into `acc`; cancellation is checked between chunks.
pub async fn read_stream<A: StreamAccumulator>(
    mut response: Response,
    url: &str,
    mut acc: A,
    cancel: &CancellationToken,
) -> GenResult<A> {
    let mut lines = LineBuffer::new();
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GenError::Cancelled),
            res = response.chunk() => res.map_err(|err| transport_error(err, url))?,
        };
        let Some(chunk) = chunk else {
            break;
        };
        for line in lines.push(&chunk) {
            acc.consume_line(&line);
        }
    }
    if let Some(rest) = lines.finish() {
        acc.consume_line(&rest);
    }
    Ok(acc)
}

fn preview_string(value: &str) -> String {
    if value.starts_with("data:image") {
        let head: String = value.chars().take(DATA_IMAGE_PREFIX_CHARS).collect();
        return format!("{head}...<data:image>");
    }
    let total = value.chars().count();
    if total <= LOG_PREVIEW_LIMIT {
        return value.to_string();
    }
    let head: String = value.chars().take(LOG_PREVIEW_LIMIT).collect();
    format!("{head}...<{total}>")
}

fn shorten_strings(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(preview_string(s)),
        Value::Array(items) => Value::Array(items.iter().map(shorten_strings).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), shorten_strings(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

pub fn log_preview_text(text: &str) -> String {
    preview_string(text)
}

/// Log-safe rendering of a provider payload: long strings truncated, inline images elided.
pub fn log_preview(response: &ProviderResponse) -> String {
    match response {
        ProviderResponse::Text(text) => preview_string(text),
        ProviderResponse::Json(value) => shorten_strings(value).to_string(),
    }
}
