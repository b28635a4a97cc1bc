use std::time::Duration;

use moegen_core::api::{AppConfig, CliError, DataLayout, EventBus, ImageGc, ImageStore, TaskStore};

use super::cli::SweepArgs;

/// One-shot orphan sweep over the data directory; returns the number of removed blobs.
pub async fn handle_sweep(args: SweepArgs, cfg: &AppConfig) -> Result<usize, CliError> {
    let data_dir = args
        .data_dir
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| cfg.storage.data_dir.clone());
    let layout = DataLayout::new(data_dir.trim());
    layout.ensure_dirs().await?;

    let images = ImageStore::new(layout.images_dir.clone());
    let store = TaskStore::new(layout, EventBus::default());
    let gc = ImageGc::new(
        store,
        images,
        Duration::from_millis(cfg.scheduler.sweep_delay_ms),
    );
    let removed = gc.sweep_orphans().await?;
    tracing::info!(target: "moegen.gc", removed, data_dir = %data_dir, "Orphan sweep finished");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_sweep_removes_unreferenced_blobs() {
        let dir = tempdir().unwrap();
        let images = dir.path().join("images");
        std::fs::create_dir_all(dir.path().join("tasks")).unwrap();
        std::fs::create_dir_all(&images).unwrap();
        std::fs::write(images.join("kept.png"), b"k").unwrap();
        std::fs::write(images.join("stray.png"), b"s").unwrap();
        std::fs::write(
            dir.path().join("tasks").join("t1.json"),
            r#"{"uploads":[{"uid":"u","localKey":"kept.png"}]}"#,
        )
        .unwrap();

        let args = SweepArgs {
            data_dir: Some(dir.path().to_string_lossy().into_owned()),
        };
        let removed = handle_sweep(args, &AppConfig::default()).await.unwrap();

        assert_eq!(removed, 1);
        assert!(images.join("kept.png").exists());
        assert!(!images.join("stray.png").exists());
    }
}
