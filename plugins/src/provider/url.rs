//! Endpoint construction for the chat-completions and generateContent APIs.

use std::sync::OnceLock;

use moegen_core::api::{ApiFormat, GenError, GenResult, GlobalConfig};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;
use url::Url;

pub const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_GEMINI_BASE: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_VERTEX_BASE: &str = "https://aiplatform.googleapis.com";

const GEMINI_HOST: &str = "generativelanguage.googleapis.com";
const VERTEX_HOST: &str = "aiplatform.googleapis.com";

const MARKER_SEGMENTS: &[&str] = &["projects", "locations", "publishers", "models"];

const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^v1(?:beta1|beta)?$").expect("static regex"))
}

fn scheme_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^[a-z][a-z0-9+.\-]*://").expect("static regex"))
}

pub fn is_version_segment(segment: &str) -> bool {
    version_re().is_match(segment)
}

fn is_marker(segment: &str) -> bool {
    MARKER_SEGMENTS.contains(&segment)
}

/// Prefix `https://` when the value carries no scheme.
pub fn ensure_protocol(value: &str) -> String {
    if scheme_re().is_match(value) {
        value.to_string()
    } else {
        format!("https://{value}")
    }
}

/// Configured URL, or the well-known base of the format.
pub fn resolve_api_url(api_url: &str, format: ApiFormat) -> String {
    let trimmed = api_url.trim();
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }
    match format {
        ApiFormat::Openai => DEFAULT_OPENAI_BASE,
        ApiFormat::Gemini => DEFAULT_GEMINI_BASE,
        ApiFormat::Vertex => DEFAULT_VERTEX_BASE,
    }
    .to_string()
}

/// A base URL split into origin, non-empty path segments and lowercased host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiBase {
    pub origin: String,
    pub segments: Vec<String>,
    pub host: String,
}

fn parse_with_protocol(value: &str) -> Option<Url> {
    let url = Url::parse(&ensure_protocol(value)).ok()?;
    url.host_str()?;
    Some(url)
}

fn host_with_port(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn path_segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn normalize_api_base(api_url: &str) -> ApiBase {
    let cleaned = api_url.trim().trim_end_matches('/');
    if cleaned.is_empty() {
        return ApiBase::default();
    }
    match parse_with_protocol(cleaned) {
        Some(url) => {
            let host = host_with_port(&url);
            ApiBase {
                origin: format!("{}://{}", url.scheme(), host),
                segments: path_segments(url.path()),
                host: host.to_ascii_lowercase(),
            }
        }
        None => ApiBase {
            origin: cleaned.to_string(),
            ..ApiBase::default()
        },
    }
}

/// The last version-looking path segment of the URL, if any.
pub fn infer_api_version(api_url: &str) -> Option<String> {
    let cleaned = api_url.trim();
    if cleaned.is_empty() {
        return None;
    }
    let segments = match parse_with_protocol(cleaned) {
        Some(url) => path_segments(url.path()),
        None => path_segments(cleaned),
    };
    segments.into_iter().rev().find(|s| is_version_segment(s))
}

pub fn resolve_api_version(api_url: &str, configured: &str, fallback: &str) -> String {
    if let Some(inferred) = infer_api_version(api_url) {
        return inferred;
    }
    let configured = configured.trim();
    if configured.is_empty() {
        fallback.to_string()
    } else {
        configured.to_string()
    }
}

/// `<id>` from a `projects/<id>` pair in the URL path.
pub fn extract_vertex_project_id(api_url: &str) -> Option<String> {
    let base = normalize_api_base(api_url);
    let index = base.segments.iter().position(|s| s == "projects")?;
    let candidate = base.segments.get(index + 1)?;
    if is_marker(candidate) || is_version_segment(candidate) {
        return None;
    }
    Some(candidate.clone())
}

fn required<'a>(value: &'a str, what: &str) -> GenResult<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(GenError::Config(format!("{what} is not configured")));
    }
    Ok(value)
}

/// `<base>[/<version>]/chat/completions`.
pub fn openai_chat_url(config: &GlobalConfig) -> String {
    let api_url = resolve_api_url(&config.api_url, ApiFormat::Openai);
    let base = normalize_api_base(&api_url);
    let base_path = if base.origin.is_empty() {
        api_url.trim_end_matches('/').to_string()
    } else if base.segments.is_empty() {
        base.origin.clone()
    } else {
        format!("{}/{}", base.origin, base.segments.join("/"))
    };
    let with_version = if infer_api_version(&api_url).is_some() {
        base_path
    } else {
        let version = resolve_api_version(&api_url, &config.api_version, "v1");
        format!("{base_path}/{version}")
    };
    if with_version.ends_with("/chat/completions") {
        with_version
    } else {
        format!("{with_version}/chat/completions")
    }
}

/// How the API key travels with a generateContent request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPlacement {
    Query,
    Bearer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeminiEndpoint {
    pub url: String,
    pub key_placement: KeyPlacement,
}

fn apply_model_path(segments: &mut Vec<String>, model: &str, model_segments: &[&str]) {
    let model_index = segments.iter().position(|s| s == "models");
    if model_segments.first() == Some(&"models") {
        match model_index {
            Some(idx) => {
                segments.truncate(idx + 1);
                segments.extend(model_segments[1..].iter().map(|s| s.to_string()));
            }
            None => segments.extend(model_segments.iter().map(|s| s.to_string())),
        }
        return;
    }
    if let Some(idx) = model_index {
        segments.truncate(idx + 1);
    } else {
        segments.push("models".to_string());
    }
    segments.push(model.to_string());
}

/// Make sure `marker` is followed by a value, inserting `value` when it is not.
fn ensure_marker_value(segments: &mut Vec<String>, marker: &str, value: &str) {
    match segments.iter().position(|s| s == marker) {
        None => {
            if !value.is_empty() {
                segments.push(marker.to_string());
                segments.push(value.to_string());
            }
        }
        Some(idx) => {
            let missing = segments
                .get(idx + 1)
                .map_or(true, |next| is_marker(next) || is_version_segment(next));
            if missing && !value.is_empty() {
                segments.insert(idx + 1, value.to_string());
            }
        }
    }
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    let value = value.trim();
    if value.is_empty() {
        fallback
    } else {
        value
    }
}

/// generateContent endpoint for the gemini and vertex formats.
pub fn gemini_endpoint(config: &GlobalConfig) -> GenResult<GeminiEndpoint> {
    let format = match config.api_format {
        ApiFormat::Vertex => ApiFormat::Vertex,
        _ => ApiFormat::Gemini,
    };
    let api_url = resolve_api_url(&config.api_url, format);
    let base = normalize_api_base(&api_url);
    let origin = if base.origin.is_empty() {
        api_url.trim_end_matches('/').to_string()
    } else {
        base.origin.clone()
    };
    let mut segments = base.segments.clone();

    if infer_api_version(&api_url).is_none() {
        let fallback = if format == ApiFormat::Vertex {
            "v1beta1"
        } else {
            "v1beta"
        };
        let version = resolve_api_version(&api_url, &config.api_version, fallback);
        match segments.iter().position(|s| is_marker(s)) {
            Some(idx) => segments.insert(idx, version),
            None => segments.push(version),
        }
    }

    let model = required(&config.model, "model")?;
    let model_segments: Vec<&str> = model.split('/').filter(|s| !s.is_empty()).collect();
    let model_is_path = model_segments.first() == Some(&"models");
    let bare_model = if model_is_path {
        model_segments[1..].join("/")
    } else {
        model.to_string()
    };

    if format == ApiFormat::Vertex {
        let project_id = match config.vertex_project_id.trim() {
            "" => extract_vertex_project_id(&api_url).unwrap_or_default(),
            id => id.to_string(),
        };
        if model_segments.contains(&"projects") {
            segments.extend(model_segments.iter().map(|s| s.to_string()));
        } else if !project_id.is_empty() || segments.iter().any(|s| s == "projects") {
            let location = non_empty_or(&config.vertex_location, "us-central1");
            let publisher = non_empty_or(&config.vertex_publisher, "google");
            ensure_marker_value(&mut segments, "projects", &project_id);
            ensure_marker_value(&mut segments, "locations", location);
            ensure_marker_value(&mut segments, "publishers", publisher);
            ensure_marker_value(&mut segments, "models", &bare_model);
        } else {
            apply_model_path(&mut segments, model, &model_segments);
        }
    } else {
        apply_model_path(&mut segments, model, &model_segments);
    }

    let suffix = if config.stream {
        ":streamGenerateContent"
    } else {
        ":generateContent"
    };
    let mut url = if segments.is_empty() {
        format!("{origin}{suffix}")
    } else {
        format!("{origin}/{}{suffix}", segments.join("/"))
    };

    let key_placement = match format {
        ApiFormat::Vertex
            if base.host == VERTEX_HOST && !segments.iter().any(|s| s == "projects") =>
        {
            KeyPlacement::Query
        }
        ApiFormat::Gemini if base.host == GEMINI_HOST => KeyPlacement::Query,
        _ => KeyPlacement::Bearer,
    };
    if key_placement == KeyPlacement::Query {
        let sep = if url.contains('?') { '&' } else { '?' };
        let key = utf8_percent_encode(&config.api_key, QUERY_VALUE);
        url = format!("{url}{sep}key={key}");
    }

    Ok(GeminiEndpoint { url, key_placement })
}
