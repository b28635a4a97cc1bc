mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{
    image_files, png_data_url, service, service_with, wait_for_task, Reply, ScriptedProvider,
};
use moegen_core::api::{
    BackendEvent, GenError, SchedulerConfig, StatePatch, StopMode, SubtaskStatus, Task,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::tempdir;

fn all_settled(task: &Task) -> bool {
    task.results.iter().all(|r| !r.is_loading())
}

#[tokio::test]
async fn generate_creates_one_loading_slot_per_concurrency() {
    let dir = tempdir().unwrap();
    let provider = ScriptedProvider::always(Reply::Hang);
    let svc = service(dir.path(), provider).await;
    svc.put_task("t1", json!({"prompt": "fox", "concurrency": 3}))
        .await
        .unwrap();

    let task = svc.generate("t1").await.unwrap();
    assert_eq!(task.results.len(), 3);
    assert!(task.results.iter().all(|r| r.status == SubtaskStatus::Loading));
    let ids: HashSet<_> = task.results.iter().map(|r| r.id.clone()).collect();
    assert_eq!(ids.len(), 3);
    assert_eq!(task.stats.total_requests, 3);

    let state = svc.get_state().await.unwrap();
    assert_eq!(state.global_stats.total_requests, 3);

    svc.stop("t1", None, StopMode::Abort).await.unwrap();
}

#[tokio::test]
async fn identical_images_share_one_key() {
    let dir = tempdir().unwrap();
    let provider = ScriptedProvider::always(Reply::Image(png_data_url("same")));
    let svc = service(dir.path(), provider.clone()).await;
    svc.put_task("t1", json!({"prompt": "cat", "concurrency": 2}))
        .await
        .unwrap();

    svc.generate("t1").await.unwrap();
    let task = wait_for_task(&svc, "t1", |t| {
        t.results.iter().all(|r| r.status == SubtaskStatus::Success)
    })
    .await;

    let keys: Vec<_> = task
        .results
        .iter()
        .map(|r| r.local_key.clone().unwrap())
        .collect();
    assert_eq!(keys[0], keys[1]);
    assert!(keys[0].ends_with(".png"));
    assert_eq!(
        task.results[0].source_url.as_deref(),
        Some(format!("/api/backend/image/{}", keys[0]).as_str())
    );
    assert!(task.results.iter().all(|r| !r.auto_retry));
    assert_eq!(task.stats.success_count, 2);
    assert_eq!(image_files(dir.path()), vec![keys[0].clone()]);
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn provider_error_is_retried_with_annotation() {
    let dir = tempdir().unwrap();
    let provider = ScriptedProvider::new(
        vec![Reply::Fail {
            status: 429,
            message: "rate limited".into(),
        }],
        Reply::Image(png_data_url("late")),
    );
    let cfg = SchedulerConfig {
        retry_delay_ms: 300,
        sweep_delay_ms: 20,
    };
    let svc = service_with(dir.path(), provider.clone(), cfg).await;
    svc.put_task("t1", json!({"concurrency": 1})).await.unwrap();
    let mut events = svc.subscribe();

    svc.generate("t1").await.unwrap();

    let retrying = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(BackendEvent::Task { state, .. }) = events.recv().await {
                let slot = &state.results[0];
                if slot.retry_count == 1 {
                    return slot.clone();
                }
            }
        }
    })
    .await
    .expect("retry annotation event");
    assert_eq!(retrying.status, SubtaskStatus::Loading);
    assert!(retrying.error.as_deref().unwrap().contains("rate limited"));
    assert!(retrying.error.as_deref().unwrap().contains("retrying in"));
    assert!(retrying.auto_retry);

    let task = wait_for_task(&svc, "t1", all_settled).await;
    let slot = &task.results[0];
    assert_eq!(slot.status, SubtaskStatus::Success);
    assert_eq!(slot.retry_count, 1);
    assert_eq!(slot.error, None);
    assert_eq!(provider.calls(), 2);
    // The timed re-attempt counts as a request of its own.
    assert_eq!(task.stats.total_requests, 2);
}

#[tokio::test]
async fn paused_slot_never_keeps_a_retry_timer() {
    let dir = tempdir().unwrap();
    let provider = ScriptedProvider::always(Reply::Fail {
        status: 500,
        message: "boom".into(),
    });
    let svc = service(dir.path(), provider.clone()).await;
    svc.put_task("t1", json!({"concurrency": 1})).await.unwrap();

    let task = svc.generate("t1").await.unwrap();
    let id = task.results[0].id.clone();
    svc.stop("t1", Some(&id), StopMode::Pause).await.unwrap();

    let task = wait_for_task(&svc, "t1", all_settled).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let registry = svc.scheduler().registry();
    assert!(!registry.has_retry(&id));
    assert!(!registry.is_active(&id));
    let slot = &task.results[0];
    assert_eq!(slot.status, SubtaskStatus::Error);
    assert!(!slot.auto_retry);

    let calls = provider.calls();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(provider.calls(), calls);
}

#[tokio::test]
async fn abort_cancels_in_flight_call_without_recording_error() {
    let dir = tempdir().unwrap();
    let provider = ScriptedProvider::always(Reply::Hang);
    let svc = service(dir.path(), provider.clone()).await;
    svc.put_task("t1", json!({"concurrency": 1})).await.unwrap();

    let task = svc.generate("t1").await.unwrap();
    let id = task.results[0].id.clone();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while provider.calls() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "provider never called");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let stopped = svc.stop("t1", Some(&id), StopMode::Abort).await.unwrap();
    assert_eq!(stopped.results[0].error.as_deref(), Some("stopped"));
    assert!(stopped.results[0].end_time.is_some());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!svc.scheduler().registry().is_active(&id));
    let task = svc.store().load_task("t1").await.unwrap().unwrap();
    assert_eq!(task.results[0].error.as_deref(), Some("stopped"));
    assert_eq!(task.results[0].retry_count, 0);
}

#[tokio::test]
async fn missing_image_in_response_is_reported_and_retried() {
    let dir = tempdir().unwrap();
    let provider = ScriptedProvider::always(Reply::NoImage);
    let svc = service(dir.path(), provider).await;
    svc.put_task(
        "t1",
        json!({"results": [{"id": "s1", "status": "error", "autoRetry": false}]}),
    )
    .await
    .unwrap();

    svc.retry("t1", "s1").await.unwrap();
    let task = wait_for_task(&svc, "t1", |t| {
        t.results[0].retry_count >= 1 || t.results[0].status != SubtaskStatus::Loading
    })
    .await;
    // Manual retry re-enables auto retry, so the failure is annotated and rescheduled.
    assert!(task.results[0]
        .error
        .as_deref()
        .unwrap()
        .contains("no image data found in response"));

    svc.stop("t1", Some("s1"), StopMode::Pause).await.unwrap();
    let task = wait_for_task(&svc, "t1", all_settled).await;
    assert_eq!(task.results[0].status, SubtaskStatus::Error);
}

#[tokio::test]
async fn retry_unknown_subtask_is_not_found() {
    let dir = tempdir().unwrap();
    let svc = service(dir.path(), ScriptedProvider::always(Reply::Hang)).await;
    svc.put_task("t1", json!({})).await.unwrap();

    let err = svc.retry("t1", "ghost").await.unwrap_err();
    assert!(matches!(err, GenError::NotFound(_)));
    let err = svc.retry("t1", "").await.unwrap_err();
    assert!(matches!(err, GenError::InvalidInput(_)));
}

#[tokio::test]
async fn uploads_are_embedded_in_the_request() {
    let dir = tempdir().unwrap();
    let provider = ScriptedProvider::always(Reply::Image(png_data_url("out")));
    let svc = service(dir.path(), provider.clone()).await;

    let saved = svc.upload_image(b"reference", "image/jpeg").await.unwrap();
    svc.put_task(
        "t1",
        json!({
            "prompt": "restyle",
            "concurrency": 1,
            "uploads": [{"uid": "u1", "name": "ref.jpg", "type": "", "localKey": saved.key}]
        }),
    )
    .await
    .unwrap();

    svc.generate("t1").await.unwrap();
    wait_for_task(&svc, "t1", all_settled).await;

    let seen = provider.seen_messages();
    let body = serde_json::to_value(&seen[0]).unwrap();
    assert_eq!(body[0]["content"][0], json!({"type": "text", "text": "restyle"}));
    assert_eq!(
        body[0]["content"][1]["image_url"]["url"],
        json!("data:image/jpeg;base64,cmVmZXJlbmNl")
    );
}

#[tokio::test]
async fn deleting_a_task_sweeps_its_images() {
    let dir = tempdir().unwrap();
    let provider = ScriptedProvider::always(Reply::Image(png_data_url("del")));
    let svc = service(dir.path(), provider).await;
    svc.patch_state(StatePatch {
        tasks_order: Some(json!(["t1", "t2"])),
        ..StatePatch::default()
    })
    .await
    .unwrap();
    svc.put_task("t1", json!({"concurrency": 1})).await.unwrap();

    svc.generate("t1").await.unwrap();
    wait_for_task(&svc, "t1", all_settled).await;
    assert_eq!(image_files(dir.path()).len(), 1);

    svc.delete_task("t1").await.unwrap();
    assert!(image_files(dir.path()).is_empty());
    assert!(svc.store().load_task("t1").await.unwrap().is_none());
    let state = svc.get_state().await.unwrap();
    assert_eq!(state.tasks_order, vec!["t2".to_string()]);
}

#[tokio::test]
async fn get_task_creates_listed_tasks_only() {
    let dir = tempdir().unwrap();
    let svc = service(dir.path(), ScriptedProvider::always(Reply::Hang)).await;
    svc.patch_state(StatePatch {
        tasks_order: Some(json!(["listed"])),
        ..StatePatch::default()
    })
    .await
    .unwrap();

    let task = svc.get_task("listed").await.unwrap();
    assert_eq!(task, Task::default());
    assert!(svc.store().load_task("listed").await.unwrap().is_some());

    let err = svc.get_task("unlisted").await.unwrap_err();
    assert!(matches!(err, GenError::NotFound(_)));
}

#[tokio::test]
async fn collection_pins_images_across_task_edits() {
    let dir = tempdir().unwrap();
    let svc = service(dir.path(), ScriptedProvider::always(Reply::Hang)).await;
    let pinned = svc.upload_image(b"pinned", "image/png").await.unwrap().key;
    let loose = svc.upload_image(b"loose", "image/png").await.unwrap().key;

    svc.put_task(
        "t1",
        json!({"uploads": [{"uid": "a", "localKey": pinned}, {"uid": "b", "localKey": loose}]}),
    )
    .await
    .unwrap();
    let items = svc
        .put_collection(&json!([{
            "id": "c1",
            "image": format!("/api/backend/image/{pinned}?token=abc")
        }]))
        .await
        .unwrap();
    assert_eq!(
        items[0].image.as_deref(),
        Some(format!("/api/backend/image/{pinned}").as_str())
    );

    svc.put_task("t1", json!({"uploads": []})).await.unwrap();
    assert_eq!(image_files(dir.path()), vec![pinned.clone()]);

    svc.put_collection(&json!([])).await.unwrap();
    assert!(image_files(dir.path()).is_empty());
}
