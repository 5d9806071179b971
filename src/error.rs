//! 统一的 API 错误类型与 `{code, msg, data}` 响应封装。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use serde::Serialize;
use serde_json::Value;
use std::io::ErrorKind;

use crate::storage::StorageError;

/// 标准 JSON 响应封装，code 为 0 表示成功。
#[derive(Serialize)]
pub struct Envelope {
    pub code: u16,
    pub msg: String,
    pub data: Option<Value>,
}

impl Envelope {
    /// 构建成功响应。
    pub fn ok(data: Value) -> JsonResponse<Envelope> {
        JsonResponse(Envelope {
            code: 0,
            msg: "success".into(),
            data: Some(data),
        })
    }

    /// 构建带自定义消息的成功响应。
    pub fn ok_msg(msg: impl Into<String>, data: Value) -> JsonResponse<Envelope> {
        JsonResponse(Envelope {
            code: 0,
            msg: msg.into(),
            data: Some(data),
        })
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    UnknownShare,
    NotFound(String),
    AlreadyExists(String),
    NotADirectory(String),
    ParentMissing(String),
    PayloadTooLarge(String),
    RangeNotSatisfiable(u64),
    Unauthorized,
    Forbidden(String),
    MethodNotAllowed,
    RateLimited(u64),
    TooManyConcurrent,
    IpDenied,
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::NotADirectory(_) => StatusCode::BAD_REQUEST,
            ApiError::UnknownShare | ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::AlreadyExists(_) | ApiError::ParentMissing(_) => StatusCode::CONFLICT,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) | ApiError::IpDenied => StatusCode::FORBIDDEN,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::RateLimited(_) | ApiError::TooManyConcurrent => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::AlreadyExists(msg)
            | ApiError::NotADirectory(msg)
            | ApiError::ParentMissing(msg)
            | ApiError::PayloadTooLarge(msg)
            | ApiError::Forbidden(msg)
            | ApiError::Internal(msg) => msg.clone(),
            ApiError::UnknownShare => "share not found".into(),
            ApiError::RangeNotSatisfiable(_) => "range not satisfiable".into(),
            ApiError::Unauthorized => "authentication required".into(),
            ApiError::MethodNotAllowed => "method not allowed".into(),
            ApiError::RateLimited(_) => "rate limit exceeded".into(),
            ApiError::TooManyConcurrent => "too many concurrent requests".into(),
            ApiError::IpDenied => "access denied from your IP address".into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        match &self {
            ApiError::Unauthorized => {
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static(crate::auth::AUTH_REALM),
                );
            }
            ApiError::RangeNotSatisfiable(size) => {
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
            }
            ApiError::RateLimited(retry_after) => {
                if *retry_after > 0
                    && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
                {
                    headers.insert(header::RETRY_AFTER, value);
                }
            }
            ApiError::TooManyConcurrent => {
                headers.insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
            }
            _ => {}
        }

        let body = Envelope {
            code: self.status().as_u16(),
            msg: self.message(),
            data: None,
        };
        (self.status(), headers, JsonResponse(body)).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::PathEscape | StorageError::InvalidPath => {
                ApiError::BadRequest("invalid path".into())
            }
            StorageError::InvalidFilename => ApiError::BadRequest("invalid filename".into()),
            StorageError::NotFound => ApiError::NotFound("not found".into()),
            StorageError::NotADirectory => ApiError::NotADirectory("not a directory".into()),
            StorageError::AlreadyExists => ApiError::AlreadyExists("already exists".into()),
            StorageError::ParentMissing => {
                ApiError::ParentMissing("parent directory missing".into())
            }
            StorageError::Io(err) => match err.kind() {
                ErrorKind::NotFound => ApiError::NotFound("not found".into()),
                ErrorKind::AlreadyExists => ApiError::AlreadyExists("already exists".into()),
                _ => ApiError::Internal(err.to_string()),
            },
        }
    }
}
