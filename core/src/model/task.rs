use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::lenient;
use super::normalize_image_key;

pub const TASK_VERSION: u32 = 1;

fn default_version() -> u32 {
    TASK_VERSION
}

fn default_concurrency() -> u32 {
    lenient::DEFAULT_CONCURRENCY
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtaskStatus {
    Loading,
    Success,
    Error,
}

/// Running counters; all durations in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Stats {
    #[serde(deserialize_with = "lenient::u64_or_zero")]
    pub total_requests: u64,
    #[serde(deserialize_with = "lenient::u64_or_zero")]
    pub success_count: u64,
    #[serde(deserialize_with = "lenient::u64_or_zero")]
    pub fastest_time: u64,
    #[serde(deserialize_with = "lenient::u64_or_zero")]
    pub slowest_time: u64,
    #[serde(deserialize_with = "lenient::u64_or_zero")]
    pub total_time: u64,
}

impl Stats {
    pub fn record_requests(&mut self, count: u64) {
        self.total_requests = self.total_requests.saturating_add(count);
    }

    pub fn record_success(&mut self, duration_ms: u64) {
        self.success_count = self.success_count.saturating_add(1);
        self.total_time = self.total_time.saturating_add(duration_ms);
        self.fastest_time = if self.fastest_time == 0 {
            duration_ms
        } else {
            self.fastest_time.min(duration_ms)
        };
        self.slowest_time = self.slowest_time.max(duration_ms);
    }
}

/// One generation slot inside a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskResult {
    pub id: String,
    pub status: SubtaskStatus,
    #[serde(default, deserialize_with = "lenient::opt_i64", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64", skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_u64", skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, deserialize_with = "lenient::u32_or_zero")]
    pub retry_count: u32,
    /// Anything but an explicit `false` counts as enabled.
    #[serde(default = "default_true", deserialize_with = "lenient::bool_default_true")]
    pub auto_retry: bool,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub local_key: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default, deserialize_with = "lenient::bool_default_false")]
    pub saved_local: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SubtaskResult {
    pub fn loading(id: String, start_time: i64) -> Self {
        Self {
            id,
            status: SubtaskStatus::Loading,
            start_time: Some(start_time),
            end_time: None,
            duration: None,
            error: None,
            retry_count: 0,
            auto_retry: true,
            local_key: None,
            source_url: None,
            saved_local: false,
            extra: Map::new(),
        }
    }

    pub fn is_loading(&self) -> bool {
        self.status == SubtaskStatus::Loading
    }
}

/// Reference image attached to a task prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedImage {
    #[serde(default, deserialize_with = "lenient::string")]
    pub uid: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub name: String,
    #[serde(rename = "type", default, deserialize_with = "lenient::string")]
    pub mime_type: String,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub local_key: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_i64", skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
    #[serde(default, deserialize_with = "lenient::bool_default_false", skip_serializing_if = "std::ops::Not::not")]
    pub from_collection: bool,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub source_signature: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Persisted task document (`tasks/<id>.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(default = "default_version", deserialize_with = "lenient::u32_or_zero")]
    pub version: u32,
    #[serde(default, deserialize_with = "lenient::string")]
    pub prompt: String,
    #[serde(default = "default_concurrency", deserialize_with = "lenient::concurrency")]
    pub concurrency: u32,
    #[serde(default = "default_true", deserialize_with = "lenient::bool_default_true")]
    pub enable_sound: bool,
    #[serde(default, deserialize_with = "lenient::vec")]
    pub results: Vec<SubtaskResult>,
    #[serde(default, deserialize_with = "lenient::vec")]
    pub uploads: Vec<UploadedImage>,
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub stats: Stats,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Task {
    fn default() -> Self {
        Self {
            version: TASK_VERSION,
            prompt: String::new(),
            concurrency: lenient::DEFAULT_CONCURRENCY,
            enable_sound: true,
            results: Vec::new(),
            uploads: Vec::new(),
            stats: Stats::default(),
            extra: Map::new(),
        }
    }
}

impl Task {
    /// Decode a stored or submitted document over the defaults.
    ///
    /// Non-object input yields the default task.
    pub fn from_value(value: Value) -> Self {
        match value {
            value @ Value::Object(_) => serde_json::from_value(value).unwrap_or_default(),
            _ => Self::default(),
        }
    }

    pub fn result(&self, subtask_id: &str) -> Option<&SubtaskResult> {
        self.results.iter().find(|r| r.id == subtask_id)
    }

    pub fn result_mut(&mut self, subtask_id: &str) -> Option<&mut SubtaskResult> {
        self.results.iter_mut().find(|r| r.id == subtask_id)
    }

    pub fn result_ids(&self) -> Vec<String> {
        self.results.iter().map(|r| r.id.clone()).collect()
    }

    /// Image keys referenced by results and uploads, normalised to basenames.
    pub fn image_keys(&self) -> BTreeSet<String> {
        let results = self.results.iter().filter_map(|r| r.local_key.as_deref());
        let uploads = self.uploads.iter().filter_map(|u| u.local_key.as_deref());
        results
            .chain(uploads)
            .filter_map(normalize_image_key)
            .collect()
    }
}

/// Keys referenced by `previous` that `next` no longer references.
pub fn removed_image_keys(previous: Option<&Task>, next: &Task) -> Vec<String> {
    let Some(previous) = previous else {
        return Vec::new();
    };
    let kept = next.image_keys();
    previous
        .image_keys()
        .into_iter()
        .filter(|key| !kept.contains(key))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_task_defaults_from_empty_object() {
        let task = Task::from_value(json!({}));
        assert_eq!(task, Task::default());
        assert_eq!(task.concurrency, 2);
        assert!(task.enable_sound);
        assert_eq!(task.version, 1);
    }

    #[test]
    fn test_task_lenient_fields() {
        let task = Task::from_value(json!({
            "prompt": 42,
            "concurrency": 0,
            "enableSound": "yes",
            "results": [{"id": "a", "status": "loading"}, {"bogus": true}],
            "uploads": "nope",
            "stats": [1, 2],
            "uiHint": "keep-me"
        }));
        assert_eq!(task.prompt, "");
        assert_eq!(task.concurrency, 1);
        assert!(task.enable_sound);
        assert_eq!(task.results.len(), 1);
        assert!(task.results[0].auto_retry);
        assert!(task.uploads.is_empty());
        assert_eq!(task.stats, Stats::default());
        assert_eq!(task.extra.get("uiHint"), Some(&json!("keep-me")));
    }

    #[test]
    fn test_non_object_is_default() {
        assert_eq!(Task::from_value(json!([1, 2])), Task::default());
        assert_eq!(Task::from_value(Value::Null), Task::default());
    }

    #[test]
    fn test_serialized_shape_is_camel_case() {
        let mut task = Task::default();
        task.results
            .push(SubtaskResult::loading("s1".to_string(), 1_000));
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["enableSound"], json!(true));
        assert_eq!(value["results"][0]["status"], json!("loading"));
        assert_eq!(value["results"][0]["startTime"], json!(1_000));
        assert_eq!(value["results"][0]["autoRetry"], json!(true));
        assert!(value["results"][0].get("endTime").is_none());
        assert_eq!(value["stats"]["totalRequests"], json!(0));
    }

    #[test]
    fn test_stats_record_success() {
        let mut stats = Stats::default();
        stats.record_success(300);
        stats.record_success(100);
        stats.record_success(200);
        assert_eq!(stats.success_count, 3);
        assert_eq!(stats.total_time, 600);
        assert_eq!(stats.fastest_time, 100);
        assert_eq!(stats.slowest_time, 300);
    }

    #[test]
    fn test_removed_image_keys() {
        let previous = Task::from_value(json!({
            "results": [
                {"id": "a", "status": "success", "localKey": "k1.png"},
                {"id": "b", "status": "success", "localKey": "nested/k2.png"}
            ],
            "uploads": [{"uid": "u", "localKey": "k3.png"}]
        }));
        let next = Task::from_value(json!({
            "results": [{"id": "a", "status": "success", "localKey": "k1.png"}]
        }));
        let mut removed = removed_image_keys(Some(&previous), &next);
        removed.sort();
        assert_eq!(removed, vec!["k2.png".to_string(), "k3.png".to_string()]);
        assert!(removed_image_keys(None, &next).is_empty());
    }
}
