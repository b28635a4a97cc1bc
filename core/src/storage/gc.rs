use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedRwLockReadGuard, RwLock};

use super::image_store::ImageStore;
use super::task_store::TaskStore;
use crate::error::GenResult;
use crate::model::normalize_image_key;

/// Reference-counted cleanup of the image store.
///
/// A blob survives while any task (uploads or results) or collection entry
/// points at it.
#[derive(Clone)]
pub struct ImageGc {
    inner: Arc<GcInner>,
}

struct GcInner {
    store: TaskStore,
    images: ImageStore,
    sweep_delay: Duration,
    sweep_pending: AtomicBool,
    fence: Arc<RwLock<()>>,
}

impl ImageGc {
    pub fn new(store: TaskStore, images: ImageStore, sweep_delay: Duration) -> Self {
        Self {
            inner: Arc::new(GcInner {
                store,
                images,
                sweep_delay,
                sweep_pending: AtomicBool::new(false),
                fence: Arc::new(RwLock::new(())),
            }),
        }
    }

    /// Keep deletions out while a freshly stored blob is not yet referenced.
    pub async fn hold_sweeps(&self) -> OwnedRwLockReadGuard<()> {
        Arc::clone(&self.inner.fence).read_owned().await
    }

    /// Every key currently referenced by tasks or the collection.
    pub async fn referenced_keys(&self) -> GenResult<HashSet<String>> {
        let store = &self.inner.store;
        let mut keys = HashSet::new();
        for task_id in store.list_task_ids().await? {
            if let Some(task) = store.load_task(&task_id).await? {
                keys.extend(task.image_keys());
            }
        }
        for item in store.load_collection().await? {
            if let Some(key) = item.image_key() {
                keys.insert(key);
            }
        }
        Ok(keys)
    }

    /// Delete the given keys unless something still references them.
    pub async fn cleanup(&self, removed: &[String]) -> GenResult<usize> {
        let candidates: Vec<String> = removed
            .iter()
            .filter_map(|k| normalize_image_key(k))
            .collect();
        if candidates.is_empty() {
            return Ok(0);
        }
        let _fence = self.inner.fence.write().await;
        let referenced = self.referenced_keys().await?;
        let mut deleted = 0;
        for key in candidates {
            if referenced.contains(&key) {
                continue;
            }
            if self.delete_logged(&key).await {
                deleted += 1;
            }
        }
        if deleted > 0 {
            tracing::info!(target: "moegen.gc", deleted, "removed unreferenced images");
        }
        Ok(deleted)
    }

    /// Delete every stored blob nothing references.
    pub async fn sweep_orphans(&self) -> GenResult<usize> {
        let _fence = self.inner.fence.write().await;
        let referenced = self.referenced_keys().await?;
        let mut deleted = 0;
        for name in self.inner.images.list().await? {
            if referenced.contains(&name) {
                continue;
            }
            if self.delete_logged(&name).await {
                deleted += 1;
            }
        }
        tracing::info!(
            target: "moegen.gc",
            deleted,
            referenced = referenced.len(),
            "orphan sweep finished"
        );
        Ok(deleted)
    }

    /// A failed unlink leaves that blob for the next pass.
    async fn delete_logged(&self, key: &str) -> bool {
        match self.inner.images.delete(key).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(target: "moegen.gc", key, error = %e, "failed to delete image");
                false
            }
        }
    }

    /// Queue a sweep; triggers arriving while one is pending are folded into it.
    pub fn schedule_sweep(&self) {
        if self
            .inner
            .sweep_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let gc = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(gc.inner.sweep_delay).await;
            gc.inner.sweep_pending.store(false, Ordering::Release);
            if let Err(e) = gc.sweep_orphans().await {
                tracing::warn!(target: "moegen.gc", error = %e, "orphan sweep failed");
            }
        });
    }

    pub fn sweep_pending(&self) -> bool {
        self.inner.sweep_pending.load(Ordering::Acquire)
    }
}
