//! 基础请求验证逻辑

use axum::http::{header, HeaderMap};
use moegen_core::storage::validate_task_id;

use super::models::HttpServerError;

const DEFAULT_UPLOAD_TYPE: &str = "application/octet-stream";

/// 验证路径中的 task id（会被用作文件名）
pub fn validate_task_path(task_id: &str) -> Result<(), HttpServerError> {
    validate_task_id(task_id).map_err(|e| HttpServerError::InvalidRequest(e.to_string()))
}

/// 只保留最后一段路径作为图片 key
pub fn image_key(raw: &str) -> Result<String, HttpServerError> {
    raw.rsplit(['/', '\\'])
        .next()
        .map(str::trim)
        .filter(|k| !k.is_empty() && *k != "." && *k != "..")
        .map(str::to_string)
        .ok_or_else(|| HttpServerError::InvalidRequest("Missing image key".to_string()))
}

/// 上传内容的 Content-Type，缺省为 octet-stream
pub fn upload_content_type(headers: &HeaderMap) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_UPLOAD_TYPE)
        .to_string()
}

pub const IMAGE_TYPE_HEADER: &str = "x-image-type";

/// 保存图片时优先使用 X-Image-Type，其次 Content-Type
pub fn saved_image_type(headers: &HeaderMap) -> String {
    [headers.get(IMAGE_TYPE_HEADER), headers.get(header::CONTENT_TYPE)]
        .into_iter()
        .flatten()
        .filter_map(|v| v.to_str().ok())
        .map(str::trim)
        .find(|v| !v.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// 上传不能为空
pub fn validate_upload(body: &[u8]) -> Result<(), HttpServerError> {
    if body.is_empty() {
        return Err(HttpServerError::InvalidRequest("Empty Body".to_string()));
    }
    Ok(())
}
