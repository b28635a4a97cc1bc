//! Persisted documents: tasks, global state and the collection list.

pub mod collection;
pub mod global;
pub mod lenient;
pub mod task;

use std::path::Path;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

pub use collection::{
    extract_key_from_url, normalize_collection, strip_backend_token, CollectionItem,
    IMAGE_ROUTE_PREFIX,
};
pub use global::{ApiFormat, BackendState, GlobalConfig, StatePatch, FORMAT_CONFIG_KEYS};
pub use task::{removed_image_keys, Stats, SubtaskResult, SubtaskStatus, Task, UploadedImage};

/// Reduce a stored key to its basename. Empty, `.` and `..` yield `None`.
pub fn normalize_image_key(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let name = Path::new(trimmed).file_name()?.to_str()?;
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(name.to_string())
}

/// Characters left unescaped in a URI component.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Route under which a stored key is served.
pub fn image_route(key: &str) -> String {
    format!(
        "{IMAGE_ROUTE_PREFIX}{}",
        utf8_percent_encode(key, URI_COMPONENT)
    )
}
