//! 统一的 API 错误类型与转换。

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use std::io::ErrorKind;
use tracing::error;

use crate::upload::metadata::MetadataError;
use crate::upload::store::StoreError;
use crate::volumes::VolumeError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(HeaderMap),
    NotFound(String),
    /// 创建上传时协议版本不匹配。
    MethodNotAllowed(String),
    Conflict(String),
    Internal(String),
    /// 资源在等待超时后仍被占用。
    Unavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::Unauthorized(headers) => {
                (StatusCode::UNAUTHORIZED, headers, "unauthorized").into_response()
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::MethodNotAllowed(msg) => {
                (StatusCode::METHOD_NOT_ALLOWED, msg).into_response()
            }
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg).into_response(),
            ApiError::Internal(msg) => {
                error!(error = msg, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response()
            }
            ApiError::Unavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, msg).into_response()
            }
        }
    }
}

impl From<VolumeError> for ApiError {
    fn from(error: VolumeError) -> Self {
        match error {
            VolumeError::UnknownVolume(name) => ApiError::NotFound(format!("unknown volume {name}")),
            VolumeError::InvalidPath => ApiError::BadRequest("invalid path".into()),
            VolumeError::Io(err) => match err.kind() {
                ErrorKind::NotFound => ApiError::NotFound(err.to_string()),
                _ => ApiError::Internal(err.to_string()),
            },
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Exists => ApiError::Conflict("file already exists".into()),
            StoreError::Io(err) => ApiError::Internal(err.to_string()),
            StoreError::TimedOut => ApiError::Internal("file operation timed out".into()),
            StoreError::Worker(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(error: sqlx::Error) -> Self {
        ApiError::Internal(format!("database error: {error}"))
    }
}

impl From<MetadataError> for ApiError {
    fn from(error: MetadataError) -> Self {
        match error {
            MetadataError::MissingFilename => {
                ApiError::BadRequest("Upload-Metadata must include filename".into())
            }
            MetadataError::InvalidEncoding => {
                ApiError::BadRequest("filename is not valid base64 utf-8".into())
            }
            MetadataError::EmptyFilename => ApiError::BadRequest("filename is empty".into()),
        }
    }
}
