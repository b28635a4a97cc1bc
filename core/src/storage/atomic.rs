//! Crash-safe JSON persistence.
//!
//! Writes land in an exclusively created sibling temp file and are renamed over
//! the target. Rename failures caused by a vanished directory or a transient
//! lock degrade to a direct write rather than losing the update.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{GenError, GenResult};

const TEMP_CREATE_ATTEMPTS: u32 = 3;
const LOCK_RETRY_ATTEMPTS: u32 = 3;
const LOCK_RETRY_BASE: Duration = Duration::from_millis(30);

/// Read a JSON document. Missing, empty and unparsable files read as `None`.
pub async fn read_json_file(path: &Path) -> GenResult<Option<Value>> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(GenError::storage(path, e)),
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!(
                target: "moegen.store",
                path = %path.display(),
                error = %e,
                "ignoring unparsable json document"
            );
            Ok(None)
        }
    }
}

pub async fn write_json_atomic<T>(path: &Path, data: &T) -> GenResult<()>
where
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_vec_pretty(data)?;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("data.json")
        .to_string();

    fs::create_dir_all(&dir)
        .await
        .map_err(|e| GenError::storage(&dir, e))?;

    let temp = create_temp_file(&dir, &base, &payload).await?;
    let result = commit(&temp, path, &dir, &payload).await;
    let _ = fs::remove_file(&temp).await;
    result
}

fn temp_name(base: &str) -> String {
    format!(
        ".{base}.{}.{}.{}.tmp",
        std::process::id(),
        chrono::Utc::now().timestamp_millis(),
        uuid::Uuid::new_v4().simple()
    )
}

async fn create_temp_file(dir: &Path, base: &str, payload: &[u8]) -> GenResult<PathBuf> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let temp = dir.join(temp_name(base));
        let opened = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp)
            .await;
        let mut file = match opened {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists && attempt < TEMP_CREATE_ATTEMPTS => {
                continue
            }
            Err(e) => return Err(GenError::storage(&temp, e)),
        };

        let written = async {
            file.write_all(payload).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        if let Err(e) = written {
            let _ = fs::remove_file(&temp).await;
            return Err(GenError::storage(&temp, e));
        }
        return Ok(temp);
    }
}

fn is_transient_lock_error(e: &std::io::Error) -> bool {
    // EBUSY has no stable ErrorKind; check the raw code too.
    matches!(e.kind(), ErrorKind::PermissionDenied) || e.raw_os_error() == Some(16)
}

async fn commit(temp: &Path, target: &Path, dir: &Path, payload: &[u8]) -> GenResult<()> {
    commit_with(temp, target, dir, payload, |from, to| async move {
        fs::rename(from, to).await
    })
    .await
}

async fn commit_with<R, Fut>(
    temp: &Path,
    target: &Path,
    dir: &Path,
    payload: &[u8],
    rename: R,
) -> GenResult<()>
where
    R: Fn(PathBuf, PathBuf) -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    let attempt_rename = || rename(temp.to_path_buf(), target.to_path_buf());

    let err = match attempt_rename().await {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };

    if err.kind() == ErrorKind::NotFound {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| GenError::storage(dir, e))?;
        match attempt_rename().await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(GenError::storage(target, e)),
        }
        return direct_write(target, payload, "directory vanished during rename").await;
    }

    if is_transient_lock_error(&err) {
        for attempt in 1..=LOCK_RETRY_ATTEMPTS {
            tokio::time::sleep(LOCK_RETRY_BASE * attempt).await;
            match attempt_rename().await {
                Ok(()) => return Ok(()),
                Err(e) if is_transient_lock_error(&e) => continue,
                Err(e) => return Err(GenError::storage(target, e)),
            }
        }
        return direct_write(target, payload, "target stayed locked").await;
    }

    Err(GenError::storage(target, err))
}

async fn direct_write(target: &Path, payload: &[u8], reason: &str) -> GenResult<()> {
    tracing::warn!(
        target: "moegen.store",
        path = %target.display(),
        reason,
        "atomic rename failed, writing in place"
    );
    fs::write(target, payload)
        .await
        .map_err(|e| GenError::storage(target, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");

        write_json_atomic(&path, &json!({"a": 1})).await.unwrap();
        write_json_atomic(&path, &json!({"a": 2})).await.unwrap();

        let value = read_json_file(&path).await.unwrap();
        assert_eq!(value, Some(json!({"a": 2})));
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        for i in 0..5 {
            write_json_atomic(&path, &json!({ "i": i })).await.unwrap();
        }
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["doc.json".to_string()]);
    }

    #[tokio::test]
    async fn test_creates_missing_parent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("doc.json");
        write_json_atomic(&path, &json!([1, 2])).await.unwrap();
        assert_eq!(read_json_file(&path).await.unwrap(), Some(json!([1, 2])));
    }

    #[tokio::test]
    async fn test_missing_empty_and_invalid_read_as_none() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert_eq!(read_json_file(&missing).await.unwrap(), None);

        let empty = dir.path().join("empty.json");
        std::fs::write(&empty, "  \n").unwrap();
        assert_eq!(read_json_file(&empty).await.unwrap(), None);

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{not json").unwrap();
        assert_eq!(read_json_file(&broken).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_writers_leave_valid_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let mut handles = Vec::new();
        for i in 0..8 {
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                write_json_atomic(&path, &json!({ "writer": i })).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let value = read_json_file(&path).await.unwrap().unwrap();
        assert!(value["writer"].is_number());
    }

    /// Rename that fails with `kind` for the first `failures` calls.
    fn flaky_rename(
        kind: ErrorKind,
        failures: usize,
        calls: Arc<AtomicUsize>,
    ) -> impl Fn(PathBuf, PathBuf) -> BoxFuture<'static, std::io::Result<()>> {
        move |from, to| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < failures {
                    Err(std::io::Error::from(kind))
                } else {
                    fs::rename(from, to).await
                }
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_commit_recreates_vanished_directory() {
        let dir = tempdir().unwrap();
        let staging = dir.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        let temp = create_temp_file(&staging, "doc.json", b"[1]").await.unwrap();

        let target_dir = dir.path().join("gone");
        let target = target_dir.join("doc.json");
        commit(&temp, &target, &target_dir, b"[1]").await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"[1]");
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn test_commit_writes_directly_when_temp_vanished_with_directory() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir_all(&sub).unwrap();
        let temp = create_temp_file(&sub, "doc.json", b"{}").await.unwrap();
        std::fs::remove_dir_all(&sub).unwrap();

        let target = sub.join("doc.json");
        commit(&temp, &target, &sub, b"{\"a\":1}").await.unwrap();

        assert_eq!(
            read_json_file(&target).await.unwrap(),
            Some(json!({"a": 1}))
        );
    }

    #[tokio::test]
    async fn test_commit_retries_transient_lock() {
        let dir = tempdir().unwrap();
        let temp = create_temp_file(dir.path(), "doc.json", b"[2]").await.unwrap();
        let target = dir.path().join("doc.json");
        let calls = Arc::new(AtomicUsize::new(0));

        let rename = flaky_rename(ErrorKind::PermissionDenied, 2, calls.clone());
        commit_with(&temp, &target, dir.path(), b"[2]", rename)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!temp.exists());
        assert_eq!(std::fs::read(&target).unwrap(), b"[2]");
    }

    #[tokio::test]
    async fn test_commit_falls_back_to_direct_write_when_lock_persists() {
        let dir = tempdir().unwrap();
        let temp = create_temp_file(dir.path(), "doc.json", b"[3]").await.unwrap();
        let target = dir.path().join("doc.json");
        let calls = Arc::new(AtomicUsize::new(0));

        let rename = flaky_rename(ErrorKind::PermissionDenied, usize::MAX, calls.clone());
        commit_with(&temp, &target, dir.path(), b"[3]", rename)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1 + LOCK_RETRY_ATTEMPTS as usize);
        assert_eq!(std::fs::read(&target).unwrap(), b"[3]");
    }

    #[tokio::test]
    async fn test_commit_surfaces_other_rename_errors() {
        let dir = tempdir().unwrap();
        let temp = create_temp_file(dir.path(), "doc.json", b"[4]").await.unwrap();
        let target = dir.path().join("doc.json");
        let calls = Arc::new(AtomicUsize::new(0));

        let rename = flaky_rename(ErrorKind::InvalidInput, usize::MAX, calls.clone());
        let err = commit_with(&temp, &target, dir.path(), b"[4]", rename)
            .await
            .unwrap_err();

        assert!(matches!(err, GenError::Storage { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!target.exists());
    }
}
