//! 文本分享：短 ID 创建与原文读取。

use axum::extract::{Extension, Json, Path as UrlPath};
use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncWriteExt, ErrorKind};
use tracing::info;
use uuid::Uuid;

use crate::auth::AuthedUser;
use crate::config::ConfigStore;
use crate::error::{ApiError, Envelope};

pub const TEXT_SHARE_ID_LEN: usize = 8;
const CREATE_ATTEMPTS: usize = 4;

#[derive(Deserialize)]
pub(crate) struct TextShareBody {
    text: String,
}

/// Short random identifier, collision-checked by the exclusive create below.
fn generate_short_id() -> String {
    Uuid::new_v4().simple().to_string()[..TEXT_SHARE_ID_LEN].to_string()
}

fn id_is_valid(id: &str) -> bool {
    id.len() == TEXT_SHARE_ID_LEN && id.chars().all(|ch| ch.is_ascii_alphanumeric())
}

fn entry_path(dir: &std::path::Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.txt"))
}

/// 创建文本分享，返回短 ID。
pub async fn create_text_share(
    Extension(store): Extension<Arc<ConfigStore>>,
    _user: AuthedUser,
    Json(body): Json<TextShareBody>,
) -> Result<JsonResponse<Envelope>, ApiError> {
    let config = store.snapshot();
    let Some(dir) = config.ui.text_share_dir.as_ref() else {
        return Err(ApiError::BadRequest("text sharing is not configured".into()));
    };
    if body.text.is_empty() {
        return Err(ApiError::BadRequest("text is required".into()));
    }

    for _ in 0..CREATE_ATTEMPTS {
        let id = generate_short_id();
        let path = entry_path(dir, &id);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(mut file) => {
                if let Err(err) = file.write_all(body.text.as_bytes()).await {
                    let _ = fs::remove_file(&path).await;
                    return Err(ApiError::Internal(err.to_string()));
                }
                info!(id, bytes = body.text.len(), "text share created");
                return Ok(Envelope::ok(json!({"id": id})));
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(ApiError::Internal(err.to_string())),
        }
    }

    Err(ApiError::Internal("failed to allocate a share id".into()))
}

/// 读取文本分享原文。
pub async fn get_text_share(
    UrlPath(id): UrlPath<String>,
    Extension(store): Extension<Arc<ConfigStore>>,
) -> Result<Response, ApiError> {
    let config = store.snapshot();
    let Some(dir) = config.ui.text_share_dir.as_ref() else {
        return Err(ApiError::NotFound("text share not found".into()));
    };
    if !id_is_valid(&id) {
        return Err(ApiError::NotFound("text share not found".into()));
    }

    match fs::read_to_string(entry_path(dir, &id)).await {
        Ok(text) => {
            let mut response = text.into_response();
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            Ok(response)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {
            Err(ApiError::NotFound("text share not found".into()))
        }
        Err(err) => Err(ApiError::Internal(err.to_string())),
    }
}
