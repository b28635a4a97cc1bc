//! HTTP中间件配置

use axum::{
    body::Body,
    extract::{MatchedPath, Query, State},
    http::{header, HeaderName, HeaderValue, Method, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer};
use tracing::{info, warn};

use super::models::HttpServerError;
use super::state::AppState;

pub const BACKEND_TOKEN_HEADER: &str = "x-backend-token";

/// 创建中间件栈
pub fn create_middleware_stack() -> tower::layer::util::Stack<CorsLayer, TimeoutLayer> {
    tower::layer::util::Stack::new(create_cors_layer(), create_timeout_layer())
}

/// 创建CORS中间件 - 仅允许localhost
fn create_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(tower_http::cors::AllowOrigin::predicate(
            |origin: &HeaderValue, _| {
                origin
                    .to_str()
                    .map(|s| {
                        s.starts_with("http://localhost")
                            || s.starts_with("https://localhost")
                            || s.starts_with("http://127.0.0.1")
                            || s.starts_with("https://127.0.0.1")
                    })
                    .unwrap_or(false)
            },
        ))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            HeaderName::from_static(BACKEND_TOKEN_HEADER),
        ])
        .allow_credentials(true)
        .max_age(Duration::from_secs(3600))
}

/// 创建超时中间件 - 只限制响应头，SSE 正文不受影响
fn create_timeout_layer() -> TimeoutLayer {
    TimeoutLayer::new(Duration::from_secs(30))
}

/// 从请求中取出访问令牌：`X-Backend-Token`，`Authorization: Bearer`，或 `?token=`
pub fn request_token<B>(req: &Request<B>) -> Option<String> {
    let headers = req.headers();
    if let Some(token) = headers
        .get(BACKEND_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return Some(token.to_string());
    }
    if let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(token.to_string());
    }
    Query::<HashMap<String, String>>::try_from_uri(req.uri())
        .ok()
        .and_then(|Query(mut params)| params.remove("token"))
        .filter(|v| !v.is_empty())
}

/// 鉴权中间件：令牌不在 `AccessTokens` 中则返回 401
pub async fn require_token(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    match request_token(&req) {
        Some(token) if state.tokens.contains(&token) => next.run(req).await,
        _ => {
            warn!(
                target: "moegen.http",
                method = %req.method(),
                uri = %req.uri().path(),
                "Rejected request without a valid token"
            );
            HttpServerError::Unauthorized.into_response()
        }
    }
}

/// 请求日志中间件（记录耗时并累计统计）
pub async fn request_logger(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let method = req.method().clone();
    // Query strings may carry the access token.
    let path = req.uri().path().to_string();
    let endpoint = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    let start = Instant::now();

    let response = next.run(req).await;

    let duration = start.elapsed();
    let status = response.status();

    if let Ok(mut stats) = state.stats.write() {
        stats.increment_request(&endpoint);
        if status.is_client_error() || status.is_server_error() {
            stats.increment_error();
        }
    }

    if status.is_client_error() || status.is_server_error() {
        warn!(
            target: "moegen.http",
            method = %method,
            uri = %path,
            status = %status.as_u16(),
            duration_ms = %duration.as_millis(),
            "Request failed"
        );
    } else {
        info!(
            target: "moegen.http",
            method = %method,
            uri = %path,
            status = %status.as_u16(),
            duration_ms = %duration.as_millis(),
            "Request completed"
        );
    }

    response
}
