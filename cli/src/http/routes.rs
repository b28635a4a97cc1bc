//! HTTP路由handlers

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderMap},
    middleware,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::Local;
use futures::Stream;
use moegen_core::api::{
    image_route, BackendState, CollectionItem, StatePatch, StopMode, Task, TaskPatch,
};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::http::{
    middleware::require_token,
    models::*,
    state::{AppState, SseClientGuard},
    validation::{
        image_key, saved_image_type, upload_content_type, validate_task_path, validate_upload,
    },
};

/// Reconnect delay advertised to EventSource clients.
const SSE_RETRY: Duration = Duration::from_millis(2000);

type HttpResult<T> = Result<T, HttpServerError>;

/// 创建所有路由
pub fn create_router(state: AppState) -> Router {
    let max_body = state.config.server.max_upload_bytes;

    let backend = Router::new()
        .route(
            "/api/backend/state",
            get(get_state_handler).patch(patch_state_handler),
        )
        .route(
            "/api/backend/collection",
            get(get_collection_handler).put(put_collection_handler),
        )
        .route(
            "/api/backend/task/:id",
            get(get_task_handler)
                .put(put_task_handler)
                .patch(patch_task_handler)
                .delete(delete_task_handler),
        )
        .route("/api/backend/task/:id/generate", post(generate_handler))
        .route("/api/backend/task/:id/retry", post(retry_handler))
        .route("/api/backend/task/:id/stop", post(stop_handler))
        .route("/api/backend/upload", post(upload_handler))
        .route(
            "/api/backend/image/:key",
            get(get_image_handler).delete(delete_image_handler),
        )
        .route("/api/backend/images/cleanup", post(cleanup_images_handler))
        .route("/api/backend/stream", get(stream_handler))
        .route("/api/save-image", post(save_image_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(health_handler))
        .merge(backend)
        .layer(DefaultBodyLimit::max(max_body))
        .with_state(state)
}

fn body_or_empty(body: Option<Json<Value>>) -> Value {
    body.map(|Json(v)| v)
        .unwrap_or_else(|| Value::Object(Map::new()))
}

/// GET /api/backend/state
async fn get_state_handler(State(state): State<AppState>) -> HttpResult<Json<BackendState>> {
    Ok(Json(state.service.get_state().await?))
}

/// PATCH /api/backend/state - 只更新请求中出现的字段
async fn patch_state_handler(
    State(state): State<AppState>,
    body: Option<Json<StatePatch>>,
) -> HttpResult<Json<BackendState>> {
    let patch = body.map(|Json(p)| p).unwrap_or_default();
    Ok(Json(state.service.patch_state(patch).await?))
}

/// GET /api/backend/collection
async fn get_collection_handler(
    State(state): State<AppState>,
) -> HttpResult<Json<Vec<CollectionItem>>> {
    Ok(Json(state.service.get_collection().await?))
}

/// PUT /api/backend/collection - 替换收藏并释放不再引用的图片
async fn put_collection_handler(
    State(state): State<AppState>,
    body: Option<Json<Value>>,
) -> HttpResult<Json<Vec<CollectionItem>>> {
    let raw = body.map(|Json(v)| v).unwrap_or(Value::Array(Vec::new()));
    Ok(Json(state.service.put_collection(&raw).await?))
}

/// GET /api/backend/task/:id
async fn get_task_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> HttpResult<Json<Task>> {
    validate_task_path(&task_id)?;
    Ok(Json(state.service.get_task(&task_id).await?))
}

/// PUT /api/backend/task/:id - 整体替换
async fn put_task_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    body: Option<Json<Value>>,
) -> HttpResult<Json<Task>> {
    validate_task_path(&task_id)?;
    Ok(Json(
        state
            .service
            .put_task(&task_id, body_or_empty(body))
            .await?,
    ))
}

/// PATCH /api/backend/task/:id - {prompt?, concurrency?, enableSound?, uploads?}
async fn patch_task_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    body: Option<Json<TaskPatch>>,
) -> HttpResult<Json<Task>> {
    validate_task_path(&task_id)?;
    let patch = body.map(|Json(p)| p).unwrap_or_default();
    Ok(Json(state.service.patch_task(&task_id, patch).await?))
}

/// DELETE /api/backend/task/:id
async fn delete_task_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> HttpResult<Json<OkResponse>> {
    validate_task_path(&task_id)?;
    state.service.delete_task(&task_id).await?;
    Ok(OkResponse::ok())
}

/// POST /api/backend/task/:id/generate
async fn generate_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> HttpResult<Json<Task>> {
    validate_task_path(&task_id)?;
    Ok(Json(state.service.generate(&task_id).await?))
}

/// POST /api/backend/task/:id/retry - {subTaskId}
async fn retry_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    body: Option<Json<RetryRequest>>,
) -> HttpResult<Json<Task>> {
    validate_task_path(&task_id)?;
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let subtask_id = string_field(req.sub_task_id.as_ref())
        .ok_or_else(|| HttpServerError::InvalidRequest("Missing subTaskId".to_string()))?;
    Ok(Json(state.service.retry(&task_id, &subtask_id).await?))
}

/// POST /api/backend/task/:id/stop - {subTaskId?, mode?}
async fn stop_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    body: Option<Json<StopRequest>>,
) -> HttpResult<Json<Task>> {
    validate_task_path(&task_id)?;
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let subtask_id = string_field(req.sub_task_id.as_ref());
    let mode = StopMode::parse_lossy(req.mode.as_ref().and_then(Value::as_str));
    Ok(Json(
        state
            .service
            .stop(&task_id, subtask_id.as_deref(), mode)
            .await?,
    ))
}

/// POST /api/backend/upload - 原始字节上传
async fn upload_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResult<Json<UploadResponse>> {
    validate_upload(&body)?;
    let content_type = upload_content_type(&headers);
    let saved = state.service.upload_image(&body, &content_type).await?;
    Ok(Json(UploadResponse {
        url: image_route(&saved.key),
        key: saved.key,
    }))
}

/// POST /api/save-image - 保存到 saved-images 目录
async fn save_image_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResult<Json<SaveImageResponse>> {
    validate_upload(&body)?;
    let content_type = saved_image_type(&headers);
    let saved = state
        .service
        .save_generated_image(&body, &content_type)
        .await?;
    Ok(Json(SaveImageResponse {
        saved: saved.created,
        exists: !saved.created,
        file_name: saved.key,
    }))
}

/// GET /api/backend/image/:key
async fn get_image_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> HttpResult<Response> {
    let key = image_key(&key)?;
    let image = state.service.read_image(&key).await?;
    Ok(([(header::CONTENT_TYPE, image.content_type)], image.bytes).into_response())
}

/// DELETE /api/backend/image/:key - 文件不存在也视为成功
async fn delete_image_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> HttpResult<Json<OkResponse>> {
    let key = image_key(&key)?;
    state.service.delete_image(&key).await?;
    Ok(OkResponse::ok())
}

/// POST /api/backend/images/cleanup - {keys:[..]}
async fn cleanup_images_handler(
    State(state): State<AppState>,
    body: Option<Json<CleanupRequest>>,
) -> HttpResult<Json<OkResponse>> {
    let keys = match body.and_then(|Json(r)| r.keys) {
        Some(Value::Array(keys)) => keys,
        _ => Vec::new(),
    };
    state.service.cleanup_images(&keys).await?;
    Ok(OkResponse::ok())
}

fn json_event<T: Serialize + ?Sized>(name: &str, data: &T) -> Option<Event> {
    match Event::default().event(name).json_data(data) {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(target: "moegen.http", event = name, error = %err, "Failed to encode SSE event");
            None
        }
    }
}

/// GET /api/backend/stream - 推送 state / task 事件
async fn stream_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Subscribe before reading the snapshot so no update falls in between.
    let mut events = state.service.subscribe();
    let mut shutdown = state.shutdown_tx.subscribe();
    let guard = SseClientGuard::register(&state.sse_clients);
    let service = state.service.clone();

    let stream = async_stream::stream! {
        let _guard = guard;
        yield Ok(Event::default().retry(SSE_RETRY));

        match service.get_state().await {
            Ok(current) => {
                if let Some(event) = json_event("state", &current) {
                    yield Ok(event);
                }
            }
            Err(err) => warn!(target: "moegen.http", error = %err, "Failed to load initial stream state"),
        }

        loop {
            let received = tokio::select! {
                _ = shutdown.recv() => break,
                received = events.recv() => received,
            };
            match received {
                Ok(event) => {
                    if let Some(sse) = json_event(event.name(), &event.payload()) {
                        yield Ok(sse);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: "moegen.http", skipped, "SSE client lagged behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// GET /health - 无需鉴权
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let (uptime_seconds, requests_handled) = state
        .stats
        .read()
        .map(|s| (s.uptime_seconds(), s.requests_total))
        .unwrap_or_default();
    let registry = state.service.scheduler().registry();

    Json(HealthResponse {
        status: "healthy".into(),
        uptime_seconds,
        requests_handled,
        sse_clients: state.sse_client_count(),
        active_subtasks: registry.active_count(),
        pending_retries: registry.pending_retry_count(),
        timestamp: Local::now().to_rfc3339(),
    })
}
