use std::collections::HashSet;
use std::sync::OnceLock;

use percent_encoding::percent_decode_str;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::normalize_image_key;

/// Path prefix under which stored images are served.
pub const IMAGE_ROUTE_PREFIX: &str = "/api/backend/image/";

fn token_param_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[?&]token=[^&]+").expect("static regex"))
}

fn trailing_separator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[?&]$").expect("static regex"))
}

fn image_route_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/api/backend/image/([^?]+)").expect("static regex"))
}

/// A saved favourite shown in the collection panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionItem {
    pub id: String,
    pub prompt: String,
    pub task_id: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_signature: Option<String>,
}

impl CollectionItem {
    /// Sanitise one raw entry. Entries without a non-empty string id are dropped.
    pub fn sanitize(raw: &Value, now_ms: i64) -> Option<Self> {
        let obj = raw.as_object()?;
        let id = obj.get("id")?.as_str().filter(|s| !s.is_empty())?.to_string();
        let timestamp = obj
            .get("timestamp")
            .and_then(Value::as_f64)
            .filter(|f| f.is_finite())
            .map(|f| f as i64)
            .unwrap_or(now_ms);
        let image = obj
            .get("image")
            .and_then(Value::as_str)
            .map(strip_backend_token);
        let opt_str = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);

        Some(Self {
            id,
            prompt: coerce_string(obj.get("prompt")),
            task_id: coerce_string(obj.get("taskId")),
            timestamp,
            image,
            local_key: opt_str("localKey"),
            source_signature: opt_str("sourceSignature"),
        })
    }

    /// Stored blob this entry pins: its localKey, else the key embedded in an image route URL.
    pub fn image_key(&self) -> Option<String> {
        let raw = match &self.local_key {
            Some(key) => key.clone(),
            None => extract_key_from_url(self.image.as_deref()?)?,
        };
        normalize_image_key(&raw)
    }
}

fn coerce_string(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Drop access tokens from image route URLs so they are never persisted.
pub fn strip_backend_token(url: &str) -> String {
    if !url.contains(IMAGE_ROUTE_PREFIX) {
        return url.to_string();
    }
    let stripped = token_param_re().replace_all(url, "");
    trailing_separator_re().replace(&stripped, "").into_owned()
}

pub fn extract_key_from_url(url: &str) -> Option<String> {
    let encoded = image_route_key_re().captures(url)?.get(1)?.as_str();
    Some(percent_decode_str(encoded).decode_utf8_lossy().into_owned())
}

/// Sanitise a submitted list: non-arrays become empty, duplicates by id keep the first.
pub fn normalize_collection(raw: &Value, now_ms: i64) -> Vec<CollectionItem> {
    let Some(items) = raw.as_array() else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    items
        .iter()
        .filter_map(|item| CollectionItem::sanitize(item, now_ms))
        .filter(|item| seen.insert(item.id.clone()))
        .collect()
}
