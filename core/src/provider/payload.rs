use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use regex::Regex;

/// Image bytes plus the content type they arrived with.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadedImage {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

fn data_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^data:([^;]+);base64,([\s\S]*)$").expect("static regex"))
}

pub fn encode_data_url(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", STANDARD.encode(bytes))
}

/// Decode a `data:<mime>;base64,<payload>` URL. Whitespace in the payload is ignored.
pub fn parse_data_url(url: &str) -> Option<DownloadedImage> {
    let caps = data_url_re().captures(url)?;
    let mime = caps.get(1)?.as_str().to_string();
    let payload: String = caps
        .get(2)?
        .as_str()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let bytes = STANDARD.decode(payload.as_bytes()).ok()?;
    Some(DownloadedImage {
        bytes,
        content_type: mime,
    })
}

pub fn is_data_image_url(url: &str) -> bool {
    url.starts_with("data:image")
}

pub fn is_http_url(url: &str) -> bool {
    let lower = url.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}
