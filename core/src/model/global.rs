use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::lenient;
use super::task::Stats;

pub const DEFAULT_API_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_API_VERSION: &str = "v1";
pub const DEFAULT_VERTEX_LOCATION: &str = "us-central1";
pub const DEFAULT_VERTEX_PUBLISHER: &str = "google";

/// Keys remembered per API format when switching between providers.
pub const FORMAT_CONFIG_KEYS: &[&str] = &[
    "apiUrl",
    "apiKey",
    "model",
    "apiVersion",
    "vertexProjectId",
    "vertexLocation",
    "vertexPublisher",
    "thinkingBudget",
    "includeThoughts",
    "includeImageConfig",
    "includeSafetySettings",
    "safety",
    "imageConfig",
    "webpQuality",
    "useResponseModalities",
    "customJson",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiFormat {
    #[default]
    Openai,
    Gemini,
    Vertex,
}

impl ApiFormat {
    /// Unknown names fall back to `openai`.
    pub fn parse_lossy(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "gemini" => Self::Gemini,
            "vertex" => Self::Vertex,
            _ => Self::Openai,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Openai => "openai",
            Self::Gemini => "gemini",
            Self::Vertex => "vertex",
        }
    }
}

impl std::fmt::Display for ApiFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ApiFormat {
    fn deserialize<D>(d: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Value::deserialize(d)? {
            Value::String(s) => Self::parse_lossy(&s),
            _ => Self::Openai,
        })
    }
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

fn default_vertex_location() -> String {
    DEFAULT_VERTEX_LOCATION.to_string()
}

fn default_vertex_publisher() -> String {
    DEFAULT_VERTEX_PUBLISHER.to_string()
}

/// Active provider configuration shared by every task.
///
/// Provider-specific tuning knobs the dashboard stores (safety, imageConfig, ...)
/// are kept in `extra` and round-trip untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    #[serde(default = "default_api_url", deserialize_with = "lenient::string")]
    pub api_url: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub api_key: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub model: String,
    #[serde(default)]
    pub api_format: ApiFormat,
    #[serde(default = "default_api_version", deserialize_with = "lenient::string")]
    pub api_version: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub vertex_project_id: String,
    #[serde(default = "default_vertex_location", deserialize_with = "lenient::string")]
    pub vertex_location: String,
    #[serde(default = "default_vertex_publisher", deserialize_with = "lenient::string")]
    pub vertex_publisher: String,
    #[serde(default, deserialize_with = "lenient::bool_default_false")]
    pub stream: bool,
    #[serde(default, deserialize_with = "lenient::bool_default_false")]
    pub enable_collection: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: String::new(),
            model: String::new(),
            api_format: ApiFormat::Openai,
            api_version: default_api_version(),
            vertex_project_id: String::new(),
            vertex_location: default_vertex_location(),
            vertex_publisher: default_vertex_publisher(),
            stream: false,
            enable_collection: false,
            extra: Map::new(),
        }
    }
}

impl GlobalConfig {
    /// Decode a config object over the defaults; anything else is the default.
    pub fn from_value(value: Value) -> Self {
        match value {
            value @ Value::Object(_) => serde_json::from_value(value).unwrap_or_default(),
            _ => Self::default(),
        }
    }

    /// The subset of keys remembered for the active format.
    pub fn format_snapshot(&self) -> Map<String, Value> {
        let Ok(Value::Object(all)) = serde_json::to_value(self) else {
            return Map::new();
        };
        all.into_iter()
            .filter(|(key, _)| FORMAT_CONFIG_KEYS.contains(&key.as_str()))
            .collect()
    }
}

/// Persisted global document (`state.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendState {
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub config: GlobalConfig,
    #[serde(default, deserialize_with = "lenient::object")]
    pub config_by_format: Map<String, Value>,
    #[serde(default, deserialize_with = "lenient::string_vec")]
    pub tasks_order: Vec<String>,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub global_stats: Stats,
}

impl BackendState {
    /// Decode a stored document and fill the per-format snapshot for the active format.
    pub fn from_value(value: Value) -> Self {
        let mut state = match value {
            value @ Value::Object(_) => serde_json::from_value(value).unwrap_or_default(),
            _ => Self::default(),
        };
        state.ensure_format_snapshot();
        state
    }

    pub fn ensure_format_snapshot(&mut self) {
        let key = self.config.api_format.as_str();
        if !self.config_by_format.contains_key(key) {
            let snapshot = self.config.format_snapshot();
            self.config_by_format
                .insert(key.to_string(), Value::Object(snapshot));
        }
    }

    /// Apply a partial client update. Fields left out of the patch are untouched.
    pub fn apply_patch(&mut self, patch: StatePatch) {
        if let Some(Value::Object(by_format)) = patch.config_by_format {
            for (key, value) in by_format {
                self.config_by_format.insert(key, value);
            }
        }
        if let Some(config) = patch.config {
            self.config = GlobalConfig::from_value(config);
            let key = self.config.api_format.as_str().to_string();
            self.config_by_format
                .insert(key, Value::Object(self.config.format_snapshot()));
        }
        if let Some(order) = patch.tasks_order {
            self.tasks_order = dedup_task_ids(order);
        }
        if let Some(stats) = patch.global_stats {
            self.global_stats = match stats {
                value @ Value::Object(_) => serde_json::from_value(value).unwrap_or_default(),
                _ => Stats::default(),
            };
        }
    }
}

/// Partial update for `BackendState`; absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatePatch {
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(default)]
    pub config_by_format: Option<Value>,
    #[serde(default)]
    pub tasks_order: Option<Value>,
    #[serde(default)]
    pub global_stats: Option<Value>,
}

fn dedup_task_ids(order: Value) -> Vec<String> {
    let Value::Array(items) = order else {
        return Vec::new();
    };
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        if let Value::String(id) = item {
            if !out.contains(&id) {
                out.push(id);
            }
        }
    }
    out
}
