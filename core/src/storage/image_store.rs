use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;

use crate::error::{GenError, GenResult};
use crate::model::normalize_image_key;

/// Result of storing a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedImage {
    pub key: String,
    /// False when identical content was already stored.
    pub created: bool,
}

/// Content-addressed blob directory: keys are `sha256(content) + extension`.
#[derive(Debug, Clone)]
pub struct ImageStore {
    dir: PathBuf,
}

pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn extension_for_content_type(content_type: &str) -> &'static str {
    let ct = content_type.to_ascii_lowercase();
    if ct.contains("png") {
        ".png"
    } else if ct.contains("jpeg") || ct.contains("jpg") {
        ".jpg"
    } else if ct.contains("webp") {
        ".webp"
    } else if ct.contains("gif") {
        ".gif"
    } else if ct.contains("bmp") {
        ".bmp"
    } else {
        ".bin"
    }
}

pub fn mime_for_key(key: &str) -> &'static str {
    let ext = Path::new(key)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        _ => "application/octet-stream",
    }
}

impl ImageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path for a key, rejecting anything that is not a plain basename.
    pub fn path_for(&self, key: &str) -> GenResult<PathBuf> {
        match normalize_image_key(key) {
            Some(name) if name == key => Ok(self.dir.join(name)),
            _ => Err(GenError::InvalidInput(format!("invalid image key: {key:?}"))),
        }
    }

    pub async fn save(&self, bytes: &[u8], content_type: &str) -> GenResult<SavedImage> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| GenError::storage(&self.dir, e))?;

        let hash = content_hash(bytes);
        if let Some(key) = self.find_existing(&hash).await? {
            return Ok(SavedImage {
                key,
                created: false,
            });
        }

        let key = format!("{hash}{}", extension_for_content_type(content_type));
        let path = self.dir.join(&key);
        fs::write(&path, bytes)
            .await
            .map_err(|e| GenError::storage(&path, e))?;
        tracing::debug!(target: "moegen.store", key = %key, size = bytes.len(), "stored image");
        Ok(SavedImage { key, created: true })
    }

    /// First stored key beginning with `hash`, whatever its extension.
    pub async fn find_existing(&self, hash: &str) -> GenResult<Option<String>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|name| name.starts_with(hash)))
    }

    pub async fn read(&self, key: &str) -> GenResult<Vec<u8>> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(GenError::NotFound(format!("image {key}")))
            }
            Err(e) => Err(GenError::storage(&path, e)),
        }
    }

    /// Remove a blob; a missing blob is not an error.
    pub async fn delete(&self, key: &str) -> GenResult<bool> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(GenError::storage(&path, e)),
        }
    }

    /// File names currently in the store.
    pub async fn list(&self) -> GenResult<Vec<String>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(GenError::storage(&self.dir, e)),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| GenError::storage(&self.dir, e))?
        {
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            if !is_file {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}
