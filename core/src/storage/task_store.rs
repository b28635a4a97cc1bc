use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::atomic::{read_json_file, write_json_atomic};
use super::DataLayout;
use crate::error::{GenError, GenResult};
use crate::events::EventBus;
use crate::model::{BackendState, CollectionItem, Task};

/// Persistence for task, state and collection documents.
///
/// Read-modify-write updates go through `update_task` / `update_state`, which
/// serialise against each other so concurrent sub-task completions never
/// overwrite one another.
#[derive(Clone)]
pub struct TaskStore {
    inner: Arc<TaskStoreInner>,
}

struct TaskStoreInner {
    layout: DataLayout,
    events: EventBus,
    task_lock: Mutex<()>,
    state_lock: Mutex<()>,
}

impl TaskStore {
    pub fn new(layout: DataLayout, events: EventBus) -> Self {
        Self {
            inner: Arc::new(TaskStoreInner {
                layout,
                events,
                task_lock: Mutex::new(()),
                state_lock: Mutex::new(()),
            }),
        }
    }

    pub fn layout(&self) -> &DataLayout {
        &self.inner.layout
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub async fn load_task(&self, task_id: &str) -> GenResult<Option<Task>> {
        let path = self.inner.layout.task_path(task_id)?;
        Ok(read_json_file(&path).await?.map(Task::from_value))
    }

    /// Persist a task and broadcast it.
    pub async fn save_task(&self, task_id: &str, task: &Task) -> GenResult<()> {
        let _guard = self.inner.task_lock.lock().await;
        self.write_task(task_id, task).await
    }

    async fn write_task(&self, task_id: &str, task: &Task) -> GenResult<()> {
        let path = self.inner.layout.task_path(task_id)?;
        write_json_atomic(&path, task).await?;
        self.inner.events.publish_task(task_id, task);
        Ok(())
    }

    /// Reload the task under the write lock and apply `f`.
    ///
    /// Nothing is written when the task is missing or `f` returns `None`.
    pub async fn update_task<F, R>(&self, task_id: &str, f: F) -> GenResult<Option<R>>
    where
        F: FnOnce(&mut Task) -> Option<R>,
    {
        let _guard = self.inner.task_lock.lock().await;
        let Some(mut task) = self.load_task(task_id).await? else {
            return Ok(None);
        };
        let Some(out) = f(&mut task) else {
            return Ok(None);
        };
        self.write_task(task_id, &task).await?;
        Ok(Some(out))
    }

    pub async fn delete_task_file(&self, task_id: &str) -> GenResult<bool> {
        let _guard = self.inner.task_lock.lock().await;
        let path = self.inner.layout.task_path(task_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(GenError::storage(&path, e)),
        }
    }

    /// Ids of every task document on disk.
    pub async fn list_task_ids(&self) -> GenResult<BTreeSet<String>> {
        let dir = &self.inner.layout.tasks_dir;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(GenError::storage(dir, e)),
        };
        let mut ids = BTreeSet::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| GenError::storage(dir, e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Some(id) = name.strip_suffix(".json") {
                ids.insert(id.to_string());
            }
        }
        Ok(ids)
    }

    pub async fn load_state(&self) -> GenResult<BackendState> {
        let value = read_json_file(&self.inner.layout.state_path).await?;
        Ok(BackendState::from_value(value.unwrap_or_default()))
    }

    pub async fn save_state(&self, state: &BackendState) -> GenResult<()> {
        let _guard = self.inner.state_lock.lock().await;
        self.write_state(state).await
    }

    async fn write_state(&self, state: &BackendState) -> GenResult<()> {
        write_json_atomic(&self.inner.layout.state_path, state).await?;
        self.inner.events.publish_state(state);
        Ok(())
    }

    /// Reload global state under its lock, apply `f` and persist.
    pub async fn update_state<F>(&self, f: F) -> GenResult<BackendState>
    where
        F: FnOnce(&mut BackendState),
    {
        let _guard = self.inner.state_lock.lock().await;
        let mut state = self.load_state().await?;
        f(&mut state);
        self.write_state(&state).await?;
        Ok(state)
    }

    pub async fn record_global_requests(&self, count: u64) -> GenResult<BackendState> {
        self.update_state(|s| s.global_stats.record_requests(count))
            .await
    }

    pub async fn record_global_success(&self, duration_ms: u64) -> GenResult<BackendState> {
        self.update_state(|s| s.global_stats.record_success(duration_ms))
            .await
    }

    pub async fn load_collection(&self) -> GenResult<Vec<CollectionItem>> {
        let value = read_json_file(&self.inner.layout.collection_path).await?;
        let now = chrono::Utc::now().timestamp_millis();
        Ok(value
            .map(|v| crate::model::normalize_collection(&v, now))
            .unwrap_or_default())
    }

    pub async fn save_collection(&self, items: &[CollectionItem]) -> GenResult<()> {
        write_json_atomic(&self.inner.layout.collection_path, items).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BackendEvent;
    use crate::model::SubtaskResult;
    use tempfile::tempdir;

    fn store(dir: &std::path::Path) -> TaskStore {
        TaskStore::new(DataLayout::new(dir), EventBus::default())
    }

    #[tokio::test]
    async fn test_save_broadcasts_task_event() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut rx = store.events().subscribe();

        let task = Task {
            prompt: "cat".into(),
            ..Task::default()
        };
        store.save_task("t1", &task).await.unwrap();

        match rx.recv().await.unwrap() {
            BackendEvent::Task { task_id, state } => {
                assert_eq!(task_id, "t1");
                assert_eq!(state.prompt, "cat");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(store.load_task("t1").await.unwrap(), Some(task));
    }

    #[tokio::test]
    async fn test_update_missing_task_writes_nothing() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let out = store
            .update_task("ghost", |_| Some(()))
            .await
            .unwrap();
        assert!(out.is_none());
        assert!(store.list_task_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_updates_do_not_lose_slots() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.save_task("t1", &Task::default()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update_task("t1", |task| {
                        task.results
                            .push(SubtaskResult::loading(format!("s{i}"), 0));
                        Some(())
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let task = store.load_task("t1").await.unwrap().unwrap();
        assert_eq!(task.results.len(), 10);
    }

    #[tokio::test]
    async fn test_state_defaults_and_stats() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let state = store.load_state().await.unwrap();
        assert!(state.tasks_order.is_empty());

        store.record_global_requests(3).await.unwrap();
        let state = store.record_global_success(250).await.unwrap();
        assert_eq!(state.global_stats.total_requests, 3);
        assert_eq!(state.global_stats.success_count, 1);
        assert_eq!(state.global_stats.fastest_time, 250);
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.save_task("a", &Task::default()).await.unwrap();
        store.save_task("b", &Task::default()).await.unwrap();
        assert_eq!(store.list_task_ids().await.unwrap().len(), 2);
        assert!(store.delete_task_file("a").await.unwrap());
        assert!(!store.delete_task_file("a").await.unwrap());
        assert!(store.load_task("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_id_is_rejected() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let err = store.load_task("../x").await.unwrap_err();
        assert!(matches!(err, GenError::InvalidInput(_)));
    }
}
