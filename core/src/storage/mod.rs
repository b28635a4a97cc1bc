//! On-disk layout: one JSON document per task, one for global state, one for
//! the collection list, a directory of content-addressed image blobs and a
//! separate directory of images the user saved.

pub mod atomic;
pub mod gc;
pub mod image_store;
pub mod task_store;

use std::path::{Path, PathBuf};

use crate::error::{GenError, GenResult};

pub use atomic::{read_json_file, write_json_atomic};
pub use gc::ImageGc;
pub use image_store::{content_hash, extension_for_content_type, mime_for_key, ImageStore, SavedImage};
pub use task_store::TaskStore;

const MAX_TASK_ID_LEN: usize = 128;

#[derive(Debug, Clone)]
pub struct DataLayout {
    pub root: PathBuf,
    pub tasks_dir: PathBuf,
    pub images_dir: PathBuf,
    /// Images the user explicitly kept; never garbage-collected.
    pub saved_dir: PathBuf,
    pub state_path: PathBuf,
    pub collection_path: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            tasks_dir: root.join("tasks"),
            images_dir: root.join("images"),
            saved_dir: root.join("saved-images"),
            state_path: root.join("state.json"),
            collection_path: root.join("collection.json"),
            root,
        }
    }

    pub fn task_path(&self, task_id: &str) -> GenResult<PathBuf> {
        validate_task_id(task_id)?;
        Ok(self.tasks_dir.join(format!("{task_id}.json")))
    }

    pub async fn ensure_dirs(&self) -> GenResult<()> {
        for dir in [&self.root, &self.tasks_dir, &self.images_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| GenError::storage(dir, e))?;
        }
        Ok(())
    }
}

/// Task ids become file names: no separators, no leading dot.
pub fn validate_task_id(task_id: &str) -> GenResult<()> {
    let ok = !task_id.is_empty()
        && task_id.len() <= MAX_TASK_ID_LEN
        && !task_id.starts_with('.')
        && task_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(GenError::InvalidInput(format!("invalid task id: {task_id:?}")))
    }
}
