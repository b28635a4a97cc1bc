use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::registry::SubtaskRegistry;
use crate::context::Services;
use crate::error::{GenError, GenResult};
use crate::model::lenient::{MAX_CONCURRENCY, MIN_CONCURRENCY};
use crate::model::{
    image_route, normalize_image_key, removed_image_keys, SubtaskResult, SubtaskStatus, Task,
};
use crate::provider::{
    is_data_image_url, is_http_url, parse_data_url, ChatMessage, DownloadedImage, InlineImage,
};
use crate::storage::{mime_for_key, ImageGc, ImageStore, SavedImage, TaskStore};

pub const STOPPED_MESSAGE: &str = "stopped";
pub const PAUSED_MESSAGE: &str = "paused";
const NO_IMAGE_MESSAGE: &str = "no image data found in response";
const DOWNLOAD_FAILED_MESSAGE: &str = "image download failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopMode {
    /// Stop scheduling retries; an in-flight call is left to finish.
    #[default]
    Pause,
    /// Cancel the in-flight call as well.
    Abort,
}

impl StopMode {
    /// Anything other than `abort` pauses.
    pub fn parse_lossy(raw: Option<&str>) -> Self {
        match raw {
            Some("abort") => Self::Abort,
            _ => Self::Pause,
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn retry_hint(delay: Duration) -> String {
    let ms = delay.as_millis();
    if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{ms}ms")
    }
}

/// Runs sub-task attempts and owns their retry lifecycle.
#[derive(Clone)]
pub struct SubtaskScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    store: TaskStore,
    images: ImageStore,
    gc: ImageGc,
    services: Services,
    registry: Arc<SubtaskRegistry>,
    retry_delay: Duration,
}

enum Failure {
    Retry,
    Terminal,
    Gone,
}

impl SubtaskScheduler {
    pub fn new(
        store: TaskStore,
        images: ImageStore,
        gc: ImageGc,
        services: Services,
        retry_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                images,
                gc,
                services,
                registry: SubtaskRegistry::new(),
                retry_delay,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<SubtaskRegistry> {
        &self.inner.registry
    }

    /// Reset the task's slots to `concurrency` fresh attempts and start them.
    ///
    /// Returns as soon as the new slots are persisted; outcomes arrive through
    /// task events.
    pub async fn generate(&self, task_id: &str) -> GenResult<Task> {
        let store = &self.inner.store;
        let previous = store.load_task(task_id).await?;
        let mut task = previous.clone().unwrap_or_default();

        for slot in &task.results {
            self.inner.registry.abort(&slot.id);
            self.inner.registry.clear_retry(&slot.id);
        }

        let count = task.concurrency.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY);
        let start = now_ms();
        task.results = (0..count)
            .map(|_| SubtaskResult::loading(Uuid::new_v4().to_string(), start))
            .collect();
        task.stats.record_requests(u64::from(count));
        store.save_task(task_id, &task).await?;
        store.record_global_requests(u64::from(count)).await?;

        let removed = removed_image_keys(previous.as_ref(), &task);
        if let Err(e) = self.inner.gc.cleanup(&removed).await {
            tracing::warn!(target: "moegen.gc", task_id, error = %e, "cleanup after generate failed");
        }
        self.inner.gc.schedule_sweep();

        tracing::info!(target: "moegen.scheduler", task_id, count, "generation started");
        for slot in &task.results {
            tokio::spawn(self.run_subtask(task_id.to_string(), slot.id.clone(), false));
        }
        Ok(task)
    }

    /// Reset one slot and run it again. Keeps its retry counter.
    pub async fn retry_subtask(&self, task_id: &str, subtask_id: &str) -> GenResult<Task> {
        self.inner.registry.clear_retry(subtask_id);
        let start = now_ms();
        let updated = self
            .inner
            .store
            .update_task(task_id, |task| {
                let slot = task.result_mut(subtask_id)?;
                let removed = slot.local_key.take();
                slot.status = SubtaskStatus::Loading;
                slot.error = None;
                slot.start_time = Some(start);
                slot.end_time = None;
                slot.duration = None;
                slot.source_url = None;
                slot.auto_retry = true;
                slot.saved_local = false;
                Some((task.clone(), removed))
            })
            .await?;
        let Some((task, removed)) = updated else {
            return Err(GenError::NotFound(format!(
                "subtask {subtask_id} in task {task_id}"
            )));
        };

        if let Some(key) = removed {
            if let Err(e) = self.inner.gc.cleanup(&[key]).await {
                tracing::warn!(target: "moegen.gc", task_id, error = %e, "cleanup after retry failed");
            }
        }
        self.inner.gc.schedule_sweep();

        tokio::spawn(self.run_subtask(task_id.to_string(), subtask_id.to_string(), true));
        Ok(task)
    }

    /// Stop one slot, or every slot when `subtask_id` is `None`.
    pub async fn stop_subtask(
        &self,
        task_id: &str,
        subtask_id: Option<&str>,
        mode: StopMode,
    ) -> GenResult<Task> {
        let Some(task) = self.inner.store.load_task(task_id).await? else {
            return Err(GenError::NotFound(format!("task {task_id}")));
        };
        let targets = |slot: &SubtaskResult| subtask_id.map_or(true, |id| slot.id == id);

        for slot in task.results.iter().filter(|s| targets(s)) {
            if mode == StopMode::Abort {
                self.inner.registry.abort(&slot.id);
            }
            self.inner.registry.clear_retry(&slot.id);
        }

        let end = now_ms();
        let updated = self
            .inner
            .store
            .update_task(task_id, |task| {
                for slot in task.results.iter_mut().filter(|s| targets(s)) {
                    if !slot.is_loading() {
                        continue;
                    }
                    slot.status = SubtaskStatus::Error;
                    slot.auto_retry = false;
                    match mode {
                        StopMode::Abort => {
                            slot.error = Some(STOPPED_MESSAGE.to_string());
                            slot.end_time = Some(end);
                        }
                        StopMode::Pause => slot.error = Some(PAUSED_MESSAGE.to_string()),
                    }
                }
                Some(task.clone())
            })
            .await?;

        tracing::info!(target: "moegen.scheduler", task_id, subtask_id, ?mode, "stop requested");
        updated.ok_or_else(|| GenError::NotFound(format!("task {task_id}")))
    }

    /// Cancel every attempt and timer of a task, then remove it and its images.
    pub async fn delete_task(&self, task_id: &str) -> GenResult<()> {
        let store = &self.inner.store;
        let existing = store.load_task(task_id).await?;
        if let Some(task) = &existing {
            for slot in &task.results {
                self.inner.registry.abort(&slot.id);
                self.inner.registry.clear_retry(&slot.id);
            }
        }

        store.delete_task_file(task_id).await?;
        store
            .update_state(|state| state.tasks_order.retain(|id| id != task_id))
            .await?;

        if let Some(task) = existing {
            let keys: Vec<String> = task.image_keys().into_iter().collect();
            self.inner.gc.cleanup(&keys).await?;
        }
        self.inner.gc.sweep_orphans().await?;
        tracing::info!(target: "moegen.scheduler", task_id, "task deleted");
        Ok(())
    }

    /// One attempt for one slot. Boxed so the retry timer can re-enter it.
    pub fn run_subtask(
        &self,
        task_id: String,
        subtask_id: String,
        count_request: bool,
    ) -> BoxFuture<'static, ()> {
        let this = self.clone();
        async move {
            if let Err(e) = this.run_attempt(&task_id, &subtask_id, count_request).await {
                tracing::error!(
                    target: "moegen.scheduler",
                    task_id = %task_id,
                    subtask_id = %subtask_id,
                    error = %e,
                    "subtask bookkeeping failed"
                );
            }
        }
        .boxed()
    }

    async fn run_attempt(
        &self,
        task_id: &str,
        subtask_id: &str,
        count_request: bool,
    ) -> GenResult<()> {
        let registry = &self.inner.registry;
        let Some(guard) = registry.try_acquire(subtask_id) else {
            tracing::debug!(target: "moegen.scheduler", task_id, subtask_id, "attempt already running");
            return Ok(());
        };
        registry.clear_retry(subtask_id);

        let now = now_ms();
        let prepared = self
            .inner
            .store
            .update_task(task_id, |task| {
                let slot = task.result_mut(subtask_id)?;
                let start = *slot.start_time.get_or_insert(now);
                slot.status = SubtaskStatus::Loading;
                slot.end_time = None;
                slot.duration = None;
                slot.saved_local = false;
                if count_request {
                    task.stats.record_requests(1);
                }
                Some((task.clone(), start))
            })
            .await?;
        let Some((task, start_time)) = prepared else {
            return Ok(());
        };
        if count_request {
            self.inner.store.record_global_requests(1).await?;
        }

        let token = guard.token().clone();
        let outcome = tokio::select! {
            res = self.attempt(&task, &token) => res,
            _ = token.cancelled() => Err(GenError::Cancelled),
        };

        let image = match outcome {
            Ok(image) => image,
            Err(_) if token.is_cancelled() => {
                tracing::debug!(target: "moegen.scheduler", task_id, subtask_id, "attempt aborted");
                return Ok(());
            }
            Err(e) => {
                drop(guard);
                return self.fail_attempt(task_id, subtask_id, e).await;
            }
        };

        // Sweeps wait until the new blob is referenced by the slot.
        let _fence = self.inner.gc.hold_sweeps().await;
        let saved = match self
            .inner
            .images
            .save(&image.bytes, &image.content_type)
            .await
        {
            Ok(saved) => saved,
            Err(e) => {
                drop(guard);
                return self.fail_attempt(task_id, subtask_id, e).await;
            }
        };
        if token.is_cancelled() {
            tracing::debug!(target: "moegen.scheduler", task_id, subtask_id, "attempt aborted after save");
            return Ok(());
        }
        drop(guard);
        self.record_success(task_id, subtask_id, start_time, saved)
            .await
    }

    async fn fail_attempt(&self, task_id: &str, subtask_id: &str, e: GenError) -> GenResult<()> {
        tracing::warn!(
            target: "moegen.scheduler",
            task_id,
            subtask_id,
            error_code = e.error_code().as_str(),
            error = %e,
            "attempt failed"
        );
        match self.record_failure(task_id, subtask_id, &e).await? {
            Failure::Retry => self.schedule_retry(task_id, subtask_id),
            Failure::Terminal | Failure::Gone => {}
        }
        Ok(())
    }

    async fn attempt(&self, task: &Task, token: &CancellationToken) -> GenResult<DownloadedImage> {
        let state = self.inner.store.load_state().await?;
        let messages = vec![self.build_message(task).await];
        let provider = self.inner.services.providers.build(&state.config)?;
        let url = provider
            .request_image(&messages, token)
            .await?
            .ok_or_else(|| GenError::Extraction(NO_IMAGE_MESSAGE.to_string()))?;
        self.resolve_payload(&url).await
    }

    async fn build_message(&self, task: &Task) -> ChatMessage {
        let mut images = Vec::new();
        for upload in &task.uploads {
            let Some(key) = upload.local_key.as_deref().and_then(normalize_image_key) else {
                continue;
            };
            match self.inner.images.read(&key).await {
                Ok(bytes) => {
                    let mime_type = if upload.mime_type.is_empty() {
                        mime_for_key(&key).to_string()
                    } else {
                        upload.mime_type.clone()
                    };
                    images.push(InlineImage { mime_type, bytes });
                }
                Err(e) => {
                    tracing::warn!(target: "moegen.scheduler", key = %key, error = %e, "skipping unreadable upload");
                }
            }
        }
        ChatMessage::user_prompt(&task.prompt, &images)
    }

    /// Turn an extracted reference into bytes.
    async fn resolve_payload(&self, url: &str) -> GenResult<DownloadedImage> {
        if is_data_image_url(url) {
            return parse_data_url(url)
                .ok_or_else(|| GenError::Extraction(DOWNLOAD_FAILED_MESSAGE.to_string()));
        }
        if is_http_url(url) {
            return self.inner.services.downloader.download(url).await;
        }
        Err(GenError::Extraction(DOWNLOAD_FAILED_MESSAGE.to_string()))
    }

    async fn record_success(
        &self,
        task_id: &str,
        subtask_id: &str,
        start_time: i64,
        saved: SavedImage,
    ) -> GenResult<()> {
        let end = now_ms();
        let duration = u64::try_from(end - start_time).unwrap_or(0);
        let route = image_route(&saved.key);
        let key = saved.key.clone();
        let updated = self
            .inner
            .store
            .update_task(task_id, |task| {
                let slot = task.result_mut(subtask_id)?;
                slot.status = SubtaskStatus::Success;
                slot.error = None;
                slot.local_key = Some(key);
                slot.source_url = Some(route);
                slot.saved_local = false;
                slot.auto_retry = false;
                slot.end_time = Some(end);
                slot.duration = Some(duration);
                task.stats.record_success(duration);
                Some(())
            })
            .await?;

        if updated.is_none() {
            // The slot was replaced while the image was in flight.
            self.inner.gc.schedule_sweep();
            return Ok(());
        }
        self.inner.store.record_global_success(duration).await?;
        tracing::info!(
            target: "moegen.scheduler",
            task_id,
            subtask_id,
            key = %saved.key,
            duration_ms = duration,
            "subtask succeeded"
        );
        Ok(())
    }

    async fn record_failure(
        &self,
        task_id: &str,
        subtask_id: &str,
        err: &GenError,
    ) -> GenResult<Failure> {
        let message = err.to_string();
        let hint = retry_hint(self.inner.retry_delay);
        let end = now_ms();
        let outcome = self
            .inner
            .store
            .update_task(task_id, |task| {
                let slot = task.result_mut(subtask_id)?;
                if slot.auto_retry {
                    slot.status = SubtaskStatus::Loading;
                    slot.error = Some(format!("{message} (retrying in {hint}...)"));
                    slot.retry_count = slot.retry_count.saturating_add(1);
                    Some(Failure::Retry)
                } else {
                    slot.status = SubtaskStatus::Error;
                    slot.error = Some(message.clone());
                    slot.end_time = Some(end);
                    Some(Failure::Terminal)
                }
            })
            .await?;
        Ok(outcome.unwrap_or(Failure::Gone))
    }

    fn schedule_retry(&self, task_id: &str, subtask_id: &str) {
        let this = self.clone();
        let delay = self.inner.retry_delay;
        let task_id = task_id.to_string();
        let subtask_id = subtask_id.to_string();
        let key = subtask_id.clone();

        let scheduled = self.inner.registry.schedule_retry(&key, move || {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                this.inner.registry.take_retry(&subtask_id);
                let task = match this.inner.store.load_task(&task_id).await {
                    Ok(Some(task)) => task,
                    Ok(None) => return,
                    Err(e) => {
                        tracing::warn!(target: "moegen.scheduler", task_id = %task_id, error = %e, "retry reload failed");
                        return;
                    }
                };
                let eligible = task
                    .result(&subtask_id)
                    .is_some_and(|slot| slot.auto_retry && slot.is_loading());
                if eligible {
                    tokio::spawn(this.run_subtask(task_id, subtask_id, true));
                }
            })
        });
        if scheduled {
            tracing::debug!(target: "moegen.scheduler", subtask_id = %key, "retry scheduled");
        }
    }
}
