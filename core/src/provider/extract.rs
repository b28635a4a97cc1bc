//! Heuristic image extraction from provider responses.
//!
//! Providers disagree about where an image lives in a response. Each extractor
//! checks one known location; the first hit wins.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

const MIN_BASE64_LENGTH: usize = 256;

fn markdown_image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!\[[\s\S]*?\]\(([\s\S]*?)\)").expect("static regex"))
}

fn inline_image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:data:|[a-z0-9.+-]+:)?image/[a-z0-9.+-]+;base64,[A-Za-z0-9+/=\s]+")
            .expect("static regex")
    })
}

fn image_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(?:[a-z0-9.+-]+:)?(image/[a-z0-9.+-]+;base64,)([\s\S]+)$")
            .expect("static regex")
    })
}

fn base64_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9+/]+={0,2}$").expect("static regex"))
}

fn http_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^https?://").expect("static regex"))
}

/// A provider response body, parsed or raw.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderResponse {
    Json(Value),
    Text(String),
}

/// Whitespace-free base64 of plausible image size, or `None`.
fn normalize_base64_payload(value: &str) -> Option<String> {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() < MIN_BASE64_LENGTH || !base64_re().is_match(&compact) {
        return None;
    }
    Some(compact)
}

/// Turn a loose image reference into an http(s) or data URL.
pub fn normalize_image_url(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if http_re().is_match(trimmed) {
        return Some(trimmed.to_string());
    }
    if let Some(caps) = image_prefix_re().captures(trimmed) {
        let prefix = caps.get(1)?.as_str();
        let payload = normalize_base64_payload(caps.get(2)?.as_str())?;
        return Some(format!("data:{prefix}{payload}"));
    }
    normalize_base64_payload(trimmed).map(|payload| format!("data:image/png;base64,{payload}"))
}

/// Find an image inside free text: a markdown image link first, then inline base64.
pub fn scan_text(text: &str) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    let markdown = markdown_image_re()
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| normalize_image_url(m.as_str()));
    if markdown.is_some() {
        return markdown;
    }
    if let Some(m) = inline_image_re().find(text) {
        if let Some(url) = normalize_image_url(m.as_str()) {
            return Some(url);
        }
    }
    normalize_image_url(text)
}

type Extractor = fn(&Value) -> Option<String>;

/// Probe order for JSON responses.
const JSON_EXTRACTORS: &[(&str, Extractor)] = &[
    ("result_url", from_result_url),
    ("candidates", from_candidates),
    ("data_array", from_data_array),
    ("message_content", from_message_content),
    ("reasoning", from_reasoning),
];

pub fn extract_image(response: &ProviderResponse) -> Option<String> {
    match response {
        ProviderResponse::Text(text) => scan_text(text),
        ProviderResponse::Json(value) => extract_from_json(value),
    }
}

pub fn extract_from_json(value: &Value) -> Option<String> {
    JSON_EXTRACTORS.iter().find_map(|(name, extractor)| {
        let found = extractor(value);
        if found.is_some() {
            tracing::debug!(target: "moegen.provider", extractor = name, "image located");
        }
        found
    })
}

fn from_result_url(value: &Value) -> Option<String> {
    let raw = value
        .get("resultUrl")
        .filter(|v| !v.is_null())
        .or_else(|| value.get("result_url"))?;
    normalize_image_url(raw.as_str()?)
}

fn from_candidates(value: &Value) -> Option<String> {
    let candidates = value.get("candidates")?.as_array()?;
    for candidate in candidates {
        let Some(parts) = candidate.pointer("/content/parts").and_then(Value::as_array) else {
            continue;
        };
        for part in parts {
            if let Some(url) = from_gemini_part(part) {
                return Some(url);
            }
        }
    }
    None
}

fn from_gemini_part(part: &Value) -> Option<String> {
    if let Some(inline) = part.get("inline_data").or_else(|| part.get("inlineData")) {
        let payload = inline
            .get("data")
            .and_then(Value::as_str)
            .and_then(normalize_base64_payload);
        if let Some(payload) = payload {
            let mime = inline
                .get("mime_type")
                .or_else(|| inline.get("mimeType"))
                .and_then(Value::as_str)
                .filter(|m| !m.is_empty())
                .unwrap_or("image/png");
            return Some(format!("data:{mime};base64,{payload}"));
        }
    }
    if let Some(file) = part.get("file_data").or_else(|| part.get("fileData")) {
        let uri = file
            .get("file_uri")
            .or_else(|| file.get("fileUri"))
            .and_then(Value::as_str);
        if let Some(url) = uri.and_then(normalize_image_url) {
            return Some(url);
        }
    }
    part.get("text").and_then(Value::as_str).and_then(scan_text)
}

fn from_data_array(value: &Value) -> Option<String> {
    let first = value.get("data")?.as_array()?.first()?;
    if let Some(s) = first.as_str() {
        return normalize_image_url(s);
    }
    if let Some(url) = first.get("url").and_then(Value::as_str) {
        if let Some(url) = normalize_image_url(url) {
            return Some(url);
        }
    }
    let b64 = first.get("b64_json").and_then(Value::as_str)?;
    normalize_image_url(b64)
}

fn first_message(value: &Value) -> Option<&Value> {
    value.get("choices")?.as_array()?.first()?.get("message")
}

fn from_message_content(value: &Value) -> Option<String> {
    let content = first_message(value)?.get("content")?;
    match content {
        Value::String(text) => scan_text(text),
        Value::Array(parts) => parts.iter().find_map(from_content_part),
        _ => None,
    }
}

fn from_content_part(part: &Value) -> Option<String> {
    let kind = part.get("type").and_then(Value::as_str);
    if kind == Some("image_url") {
        let image_url = part.get("image_url")?;
        let url = match image_url {
            Value::String(s) => Some(s.as_str()),
            other => other.get("url").and_then(Value::as_str),
        };
        if let Some(url) = url.and_then(normalize_image_url) {
            return Some(url);
        }
    }
    if kind == Some("text") {
        return part.get("text").and_then(Value::as_str).and_then(scan_text);
    }
    None
}

fn from_reasoning(value: &Value) -> Option<String> {
    first_message(value)?
        .get("reasoning_content")?
        .as_str()
        .and_then(scan_text)
}
