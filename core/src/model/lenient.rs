//! Tolerant field decoders for documents written by older dashboards.
//!
//! Persisted JSON is merged over defaults: a field with the wrong shape falls
//! back to its default instead of rejecting the whole document.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

pub const DEFAULT_CONCURRENCY: u32 = 2;
pub const MIN_CONCURRENCY: u32 = 1;
/// Upper bound on parallel attempts per task.
pub const MAX_CONCURRENCY: u32 = 64;

pub fn string<'de, D>(d: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(d)? {
        Value::String(s) => s,
        _ => String::new(),
    })
}

pub fn opt_string<'de, D>(d: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(d)? {
        Value::String(s) => Some(s),
        _ => None,
    })
}

pub fn bool_default_true<'de, D>(d: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(!matches!(Value::deserialize(d)?, Value::Bool(false)))
}

pub fn bool_default_false<'de, D>(d: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(matches!(Value::deserialize(d)?, Value::Bool(true)))
}

pub fn opt_i64<'de, D>(d: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Value::deserialize(d)?
        .as_f64()
        .filter(|f| f.is_finite())
        .map(|f| f as i64))
}

pub fn opt_u64<'de, D>(d: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Value::deserialize(d)?
        .as_f64()
        .filter(|f| f.is_finite() && *f >= 0.0)
        .map(|f| f as u64))
}

pub fn u64_or_zero<'de, D>(d: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    opt_u64(d).map(Option::unwrap_or_default)
}

pub fn u32_or_zero<'de, D>(d: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(opt_u64(d)?.map(|v| v.min(u32::MAX as u64) as u32).unwrap_or(0))
}

/// Clamp into `1..=MAX_CONCURRENCY`; non-numeric input falls back to the default.
pub fn concurrency_value(value: &Value, fallback: u32) -> u32 {
    match value.as_f64() {
        Some(f) if !f.is_nan() => f.clamp(MIN_CONCURRENCY as f64, MAX_CONCURRENCY as f64) as u32,
        _ => fallback,
    }
}

pub fn concurrency<'de, D>(d: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(concurrency_value(&Value::deserialize(d)?, DEFAULT_CONCURRENCY))
}

/// Arrays keep every element that decodes; anything else becomes empty.
pub fn vec<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    Ok(vec_from_value(Value::deserialize(d)?))
}

pub fn vec_from_value<T: DeserializeOwned>(value: Value) -> Vec<T> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        _ => Vec::new(),
    }
}

pub fn string_vec<'de, D>(d: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(d)? {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    })
}

pub fn object<'de, D>(d: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(d)? {
        Value::Object(map) => map,
        _ => Map::new(),
    })
}

/// Objects decode over defaults; anything else (or a decode failure) is the default.
pub fn or_default<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    Ok(match Value::deserialize(d)? {
        value @ Value::Object(_) => serde_json::from_value(value).unwrap_or_default(),
        _ => T::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_concurrency_value_clamps() {
        assert_eq!(concurrency_value(&json!(0), 2), 1);
        assert_eq!(concurrency_value(&json!(-5), 2), 1);
        assert_eq!(concurrency_value(&json!(4), 2), 4);
        assert_eq!(concurrency_value(&json!(3.7), 2), 3);
        assert_eq!(concurrency_value(&json!("8"), 2), 2);
        assert_eq!(concurrency_value(&Value::Null, 5), 5);
    }

    #[test]
    fn test_concurrency_value_has_upper_bound() {
        assert_eq!(concurrency_value(&json!(1e9), 2), MAX_CONCURRENCY);
        assert_eq!(concurrency_value(&json!(f64::MAX), 2), MAX_CONCURRENCY);
        assert_eq!(concurrency_value(&json!(64), 2), 64);
    }

    #[test]
    fn test_vec_from_value_skips_bad_items() {
        let items: Vec<u32> = vec_from_value(json!([1, "x", 3]));
        assert_eq!(items, vec![1, 3]);
        let items: Vec<u32> = vec_from_value(json!({"a": 1}));
        assert!(items.is_empty());
    }
}
