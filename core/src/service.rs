//! API-level operations behind the HTTP surface.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::config::SchedulerConfig;
use crate::context::Services;
use crate::error::{GenError, GenResult};
use crate::events::{BackendEvent, EventBus};
use crate::model::{
    lenient, normalize_collection, normalize_image_key, removed_image_keys, BackendState,
    CollectionItem, StatePatch, Task, UploadedImage,
};
use crate::scheduler::{StopMode, SubtaskScheduler};
use crate::storage::{mime_for_key, DataLayout, ImageGc, ImageStore, SavedImage, TaskStore};

/// Partial task edit from the dashboard; absent fields are kept.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    #[serde(default)]
    pub prompt: Option<Value>,
    #[serde(default)]
    pub concurrency: Option<Value>,
    #[serde(default)]
    pub enable_sound: Option<Value>,
    #[serde(default)]
    pub uploads: Option<Value>,
}

impl TaskPatch {
    pub fn apply(self, task: &mut Task) {
        if let Some(Value::String(prompt)) = self.prompt {
            task.prompt = prompt;
        }
        task.concurrency = match &self.concurrency {
            Some(value) => lenient::concurrency_value(value, task.concurrency.max(1)),
            None => task.concurrency.max(1),
        };
        if let Some(Value::Bool(enabled)) = self.enable_sound {
            task.enable_sound = enabled;
        }
        if let Some(uploads @ Value::Array(_)) = self.uploads {
            task.uploads = lenient::vec_from_value::<UploadedImage>(uploads);
        }
    }
}

/// Stored image bytes with their served content type.
#[derive(Debug, Clone)]
pub struct StoredImage {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

#[derive(Clone)]
pub struct BackendService {
    store: TaskStore,
    images: ImageStore,
    saved: ImageStore,
    gc: ImageGc,
    scheduler: SubtaskScheduler,
}

impl BackendService {
    pub fn new(
        layout: DataLayout,
        events: EventBus,
        services: Services,
        cfg: &SchedulerConfig,
    ) -> Self {
        let images = ImageStore::new(layout.images_dir.clone());
        let saved = ImageStore::new(layout.saved_dir.clone());
        let store = TaskStore::new(layout, events);
        let gc = ImageGc::new(
            store.clone(),
            images.clone(),
            Duration::from_millis(cfg.sweep_delay_ms),
        );
        let scheduler = SubtaskScheduler::new(
            store.clone(),
            images.clone(),
            gc.clone(),
            services,
            Duration::from_millis(cfg.retry_delay_ms),
        );
        Self {
            store,
            images,
            saved,
            gc,
            scheduler,
        }
    }

    /// Create the data directories and build the service.
    pub async fn open(
        data_dir: impl AsRef<Path>,
        events: EventBus,
        services: Services,
        cfg: &SchedulerConfig,
    ) -> GenResult<Self> {
        let layout = DataLayout::new(data_dir);
        layout.ensure_dirs().await?;
        Ok(Self::new(layout, events, services, cfg))
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn scheduler(&self) -> &SubtaskScheduler {
        &self.scheduler
    }

    pub fn gc(&self) -> &ImageGc {
        &self.gc
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.store.events().subscribe()
    }

    pub async fn get_state(&self) -> GenResult<BackendState> {
        self.store.load_state().await
    }

    pub async fn patch_state(&self, patch: StatePatch) -> GenResult<BackendState> {
        self.store.update_state(|state| state.apply_patch(patch)).await
    }

    pub async fn get_collection(&self) -> GenResult<Vec<CollectionItem>> {
        self.store.load_collection().await
    }

    /// Replace the collection and release images only it referenced.
    pub async fn put_collection(&self, raw: &Value) -> GenResult<Vec<CollectionItem>> {
        let previous = self.store.load_collection().await?;
        let items = normalize_collection(raw, chrono::Utc::now().timestamp_millis());
        self.store.save_collection(&items).await?;

        let kept: std::collections::HashSet<String> =
            items.iter().filter_map(CollectionItem::image_key).collect();
        let removed: Vec<String> = previous
            .iter()
            .filter_map(CollectionItem::image_key)
            .filter(|key| !kept.contains(key))
            .collect();
        self.gc.cleanup(&removed).await?;
        self.gc.schedule_sweep();
        Ok(items)
    }

    /// A task listed in `tasksOrder` but missing on disk is created with defaults.
    pub async fn get_task(&self, task_id: &str) -> GenResult<Task> {
        if let Some(task) = self.store.load_task(task_id).await? {
            return Ok(task);
        }
        let state = self.store.load_state().await?;
        if !state.tasks_order.iter().any(|id| id == task_id) {
            return Err(GenError::NotFound(format!("task {task_id}")));
        }
        let task = Task::default();
        self.store.save_task(task_id, &task).await?;
        Ok(task)
    }

    pub async fn put_task(&self, task_id: &str, payload: Value) -> GenResult<Task> {
        let previous = self.store.load_task(task_id).await?;
        let next = Task::from_value(payload);
        self.store.save_task(task_id, &next).await?;
        self.gc
            .cleanup(&removed_image_keys(previous.as_ref(), &next))
            .await?;
        self.gc.schedule_sweep();
        Ok(next)
    }

    pub async fn patch_task(&self, task_id: &str, patch: TaskPatch) -> GenResult<Task> {
        let current = self.store.load_task(task_id).await?.unwrap_or_default();
        let mut next = current.clone();
        patch.apply(&mut next);
        self.store.save_task(task_id, &next).await?;
        self.gc
            .cleanup(&removed_image_keys(Some(&current), &next))
            .await?;
        self.gc.schedule_sweep();
        Ok(next)
    }

    pub async fn delete_task(&self, task_id: &str) -> GenResult<()> {
        self.scheduler.delete_task(task_id).await
    }

    pub async fn generate(&self, task_id: &str) -> GenResult<Task> {
        self.scheduler.generate(task_id).await
    }

    pub async fn retry(&self, task_id: &str, subtask_id: &str) -> GenResult<Task> {
        if subtask_id.is_empty() {
            return Err(GenError::InvalidInput("missing subTaskId".to_string()));
        }
        self.scheduler.retry_subtask(task_id, subtask_id).await
    }

    pub async fn stop(
        &self,
        task_id: &str,
        subtask_id: Option<&str>,
        mode: StopMode,
    ) -> GenResult<Task> {
        let subtask_id = subtask_id.filter(|id| !id.is_empty());
        self.scheduler.stop_subtask(task_id, subtask_id, mode).await
    }

    pub async fn upload_image(&self, bytes: &[u8], content_type: &str) -> GenResult<SavedImage> {
        if bytes.is_empty() {
            return Err(GenError::InvalidInput("empty body".to_string()));
        }
        self.images.save(bytes, content_type).await
    }

    /// Keep a generated image in the saved-images directory.
    pub async fn save_generated_image(
        &self,
        bytes: &[u8],
        content_type: &str,
    ) -> GenResult<SavedImage> {
        if bytes.is_empty() {
            return Err(GenError::InvalidInput("empty body".to_string()));
        }
        let saved = self.saved.save(bytes, content_type).await?;
        tracing::info!(target: "moegen.store", key = %saved.key, created = saved.created, "image saved");
        Ok(saved)
    }

    pub async fn read_image(&self, key: &str) -> GenResult<StoredImage> {
        let key = normalize_image_key(key)
            .ok_or_else(|| GenError::InvalidInput("missing image key".to_string()))?;
        let bytes = self.images.read(&key).await?;
        Ok(StoredImage {
            bytes,
            content_type: mime_for_key(&key),
        })
    }

    /// Unconditional removal of one blob; a missing blob is fine.
    pub async fn delete_image(&self, key: &str) -> GenResult<()> {
        let key = normalize_image_key(key)
            .ok_or_else(|| GenError::InvalidInput("missing image key".to_string()))?;
        self.images.delete(&key).await?;
        Ok(())
    }

    pub async fn cleanup_images(&self, keys: &[Value]) -> GenResult<usize> {
        let keys: Vec<String> = keys
            .iter()
            .map(|key| match key {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .filter_map(|key| normalize_image_key(&key))
            .collect();
        let deleted = self.gc.cleanup(&keys).await?;
        self.gc.schedule_sweep();
        Ok(deleted)
    }

    pub async fn sweep_orphans(&self) -> GenResult<usize> {
        self.gc.sweep_orphans().await
    }
}
