//! 文件列表、下载、上传、重命名与删除处理器。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Json, Multipart, Query};
use axum::extract::multipart::Field;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use futures_util::StreamExt;
use httpdate::{fmt_http_date, parse_http_date};
use serde::Deserialize;
use serde_json::json;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::atomic::{AtomicFile, PartialGuard};
use crate::auth::AuthedUser;
use crate::config::{ConfigStore, LOCK_WAIT_TIMEOUT_SECS};
use crate::error::{ApiError, Envelope};
use crate::etag::etag_from_metadata;
use crate::http::ClientIp;
use crate::locking::LockManager;
use crate::metrics::Metrics;
use crate::quota::QuotaTracker;
use crate::rules::{self, Permission};
use crate::storage;

#[derive(Deserialize)]
pub(crate) struct ListQuery {
    root: String,
    #[serde(default)]
    path: String,
}

#[derive(Deserialize)]
pub(crate) struct DownloadQuery {
    root: String,
    path: String,
}

#[derive(Deserialize)]
pub(crate) struct MkdirBody {
    root: String,
    path: String,
}

#[derive(Deserialize)]
pub(crate) struct RenameBody {
    root: String,
    path: String,
    #[serde(rename = "newName")]
    new_name: String,
}

#[derive(Deserialize)]
pub(crate) struct DeleteBody {
    root: String,
    paths: Vec<String>,
}

/// 当前会话信息与可访问的共享根。
pub async fn session(
    Extension(store): Extension<Arc<ConfigStore>>,
    ClientIp(client_ip): ClientIp,
    user: AuthedUser,
) -> Result<JsonResponse<Envelope>, ApiError> {
    let config = store.snapshot();
    let roots = rules::accessible_roots(&config, &user.name, client_ip);
    Ok(Envelope::ok(json!({
        "user": {"name": user.name},
        "roots": roots,
    })))
}

/// 列出目录内容。
pub async fn list_files(
    Query(query): Query<ListQuery>,
    Extension(store): Extension<Arc<ConfigStore>>,
    ClientIp(client_ip): ClientIp,
    user: AuthedUser,
) -> Result<JsonResponse<Envelope>, ApiError> {
    let config = store.snapshot();
    rules::authorize(
        &config,
        &user.name,
        Permission::Read,
        &query.root,
        &query.path,
        client_ip,
    )?;
    let share = config.share(&query.root).ok_or(ApiError::UnknownShare)?;

    let entries = storage::list_dir(&share.root, &query.path).await?;
    info!(
        root = query.root,
        path = query.path,
        count = entries.len(),
        "list files"
    );
    Ok(Envelope::ok(json!({
        "root": query.root,
        "path": query.path,
        "files": entries,
    })))
}

/// 下载文件，支持 Range 请求与缓存相关头。
pub async fn download_file(
    Query(DownloadQuery { root, path }): Query<DownloadQuery>,
    request_headers: HeaderMap,
    Extension(store): Extension<Arc<ConfigStore>>,
    Extension(metrics): Extension<Arc<Metrics>>,
    ClientIp(client_ip): ClientIp,
    user: AuthedUser,
) -> Result<Response, ApiError> {
    let config = store.snapshot();
    rules::authorize(&config, &user.name, Permission::Read, &root, &path, client_ip)?;
    let share = config.share(&root).ok_or(ApiError::UnknownShare)?;

    let target = storage::resolve_checked(&share.root, &path, false).await?;
    let metadata = fs::metadata(&target).await.map_err(io_to_api)?;
    if metadata.is_dir() {
        return Err(ApiError::BadRequest("path is not a file".into()));
    }
    let file_size = metadata.len();
    let modified = metadata.modified().ok();
    let etag = etag_from_metadata(&metadata);
    let mime = mime_guess::from_path(&target).first_or_octet_stream();

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
    );
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(ts) = modified {
        header_value(&mut response_headers, header::LAST_MODIFIED, &fmt_http_date(ts))?;
    }
    header_value(&mut response_headers, header::ETAG, &etag)?;
    let filename = target
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    header_value(
        &mut response_headers,
        header::CONTENT_DISPOSITION,
        &format!("attachment; filename=\"{}\"", ascii_fallback(&filename)),
    )?;

    let if_range_matches = match request_headers
        .get(header::IF_RANGE)
        .and_then(|value| value.to_str().ok())
    {
        Some(value) if value.starts_with("W/") || value.starts_with('"') => {
            value.trim() == etag
        }
        Some(value) => match parse_http_date(value) {
            Ok(date) => modified.map(|ts| ts <= date).unwrap_or(false),
            Err(_) => false,
        },
        None => true,
    };

    let range = if if_range_matches {
        parse_range(request_headers.get(header::RANGE), file_size)?
    } else {
        None
    };

    let file = File::open(&target).await.map_err(io_to_api)?;
    let count_metrics = metrics.clone();
    if let Some((start, end)) = range {
        let length = end - start + 1;
        debug!(path, start, end, length, "download range request accepted");
        let mut file = file;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(io_to_api)?;
        let stream = ReaderStream::new(file.take(length)).inspect(move |chunk| {
            if let Ok(chunk) = chunk {
                count_metrics.add_download_bytes(chunk.len() as u64);
            }
        });
        header_value(
            &mut response_headers,
            header::CONTENT_RANGE,
            &format!("bytes {start}-{end}/{file_size}"),
        )?;
        header_value(
            &mut response_headers,
            header::CONTENT_LENGTH,
            &length.to_string(),
        )?;
        return Ok((
            StatusCode::PARTIAL_CONTENT,
            response_headers,
            AxumBody::from_stream(stream),
        )
            .into_response());
    }

    header_value(
        &mut response_headers,
        header::CONTENT_LENGTH,
        &file_size.to_string(),
    )?;
    info!(root, path, size = file_size, "download full file");
    let stream = ReaderStream::new(file).inspect(move |chunk| {
        if let Ok(chunk) = chunk {
            count_metrics.add_download_bytes(chunk.len() as u64);
        }
    });
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(stream),
    )
        .into_response())
}

/// 上传文件（multipart 表单：root、path、可选 overwrite、file）。
pub async fn upload_file(
    Extension(store): Extension<Arc<ConfigStore>>,
    Extension(quota): Extension<Arc<QuotaTracker>>,
    Extension(metrics): Extension<Arc<Metrics>>,
    Extension(locks): Extension<Arc<LockManager>>,
    ClientIp(client_ip): ClientIp,
    user: AuthedUser,
    mut multipart: Multipart,
) -> Result<JsonResponse<Envelope>, ApiError> {
    let mut root: Option<String> = None;
    let mut rel_path = String::new();
    let mut overwrite = false;
    let mut saved: Option<(String, u64, String)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.to_string()))?
    {
        let name = field.name().map(|name| name.to_string());
        match name.as_deref() {
            Some("root") => {
                root = Some(read_text_field(field).await?);
            }
            Some("path") => {
                rel_path = read_text_field(field).await?;
            }
            Some("overwrite") => {
                let value = read_text_field(field).await?;
                overwrite = matches!(value.as_str(), "1" | "true" | "yes");
            }
            Some("file") => {
                let root = root
                    .clone()
                    .ok_or_else(|| ApiError::BadRequest("root field must precede file".into()))?;
                let result = receive_file(
                    &store, &quota, &locks, &user, client_ip, &root, &rel_path, overwrite, field,
                )
                .await?;
                saved = Some((result.0, result.1, root));
            }
            _ => continue,
        }
    }

    let (filename, size, root) =
        saved.ok_or_else(|| ApiError::BadRequest("file field is required".into()))?;
    metrics.add_upload_bytes(size);
    info!(root, path = rel_path, filename, size, "file uploaded");
    Ok(Envelope::ok_msg(
        "file uploaded successfully",
        json!({
            "filename": filename,
            "size": size,
            "path": rel_path,
        }),
    ))
}

#[allow(clippy::too_many_arguments)]
async fn receive_file(
    store: &ConfigStore,
    quota: &QuotaTracker,
    locks: &LockManager,
    user: &AuthedUser,
    client_ip: std::net::IpAddr,
    root: &str,
    rel_path: &str,
    overwrite: bool,
    mut field: Field<'_>,
) -> Result<(String, u64), ApiError> {
    let config = store.snapshot();
    rules::authorize(
        &config,
        &user.name,
        Permission::Write,
        root,
        rel_path,
        client_ip,
    )?;
    let share = config.share(root).ok_or(ApiError::UnknownShare)?;

    let declared = field.file_name().unwrap_or("unnamed").to_string();
    let filename = storage::sanitize_filename(&declared);

    let size_cap = config.ui.max_upload_size;
    let quota_cap = quota
        .remaining(share)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    if quota_cap == Some(0) {
        return Err(ApiError::PayloadTooLarge("share quota exceeded".into()));
    }
    let cap = match (size_cap, quota_cap) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    };
    let cap_is_quota = match (size_cap, quota_cap) {
        (Some(size), Some(quota)) => quota < size,
        (None, Some(_)) => true,
        _ => false,
    };

    let written = if overwrite {
        let relative = storage::join_relative(rel_path, &filename);
        let _path_lock = locks
            .lock_path_with_timeout(root, &relative, Duration::from_secs(LOCK_WAIT_TIMEOUT_SECS))
            .await
            .map_err(|_| ApiError::AlreadyExists("path is busy".into()))?;
        let target = storage::resolve_checked(&share.root, &relative, true).await?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| ApiError::Internal(err.to_string()))?;
        }
        let mut atomic = AtomicFile::new(&target)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        let guard = PartialGuard::new(atomic.temp_path().to_path_buf());
        match stream_field(&mut field, atomic.file_mut(), cap, cap_is_quota).await {
            Ok(written) => {
                atomic
                    .finalize()
                    .await
                    .map_err(|err| ApiError::Internal(err.to_string()))?;
                guard.disarm();
                // Replaced content of unknown prior size: recount lazily.
                quota.invalidate(&share.name).await;
                written
            }
            Err(err) => {
                atomic.cleanup().await;
                guard.disarm();
                return Err(err);
            }
        }
    } else {
        let (target, mut file) = storage::open_exclusive(&share.root, rel_path, &filename).await?;
        let guard = PartialGuard::new(target);
        match stream_field(&mut field, &mut file, cap, cap_is_quota).await {
            Ok(written) => {
                file.flush()
                    .await
                    .map_err(|err| ApiError::Internal(err.to_string()))?;
                guard.disarm();
                quota.commit(share, written).await;
                written
            }
            Err(err) => {
                drop(file);
                // The guard removes the partial file on drop.
                return Err(err);
            }
        }
    };

    Ok((filename, written))
}

async fn read_text_field(field: Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|err| ApiError::BadRequest(err.to_string()))
}

async fn stream_field<W>(
    field: &mut Field<'_>,
    writer: &mut W,
    cap: Option<u64>,
    cap_is_quota: bool,
) -> Result<u64, ApiError>
where
    W: AsyncWrite + Unpin,
{
    let mut written: u64 = 0;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|err| ApiError::BadRequest(err.to_string()))?
    {
        if chunk.is_empty() {
            continue;
        }
        written += chunk.len() as u64;
        if let Some(cap) = cap
            && written > cap
        {
            return Err(if cap_is_quota {
                ApiError::PayloadTooLarge("share quota exceeded".into())
            } else {
                ApiError::PayloadTooLarge(format!("file too large (max {cap} bytes)"))
            });
        }
        writer
            .write_all(&chunk)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
    }
    Ok(written)
}

/// 创建目录（仅创建最后一级）。
pub async fn make_directory(
    Extension(store): Extension<Arc<ConfigStore>>,
    Extension(locks): Extension<Arc<LockManager>>,
    ClientIp(client_ip): ClientIp,
    user: AuthedUser,
    Json(body): Json<MkdirBody>,
) -> Result<JsonResponse<Envelope>, ApiError> {
    let config = store.snapshot();
    rules::authorize(
        &config,
        &user.name,
        Permission::Write,
        &body.root,
        &body.path,
        client_ip,
    )?;
    let share = config.share(&body.root).ok_or(ApiError::UnknownShare)?;

    let _path_lock = locks
        .lock_path_with_timeout(
            &body.root,
            &body.path,
            Duration::from_secs(LOCK_WAIT_TIMEOUT_SECS),
        )
        .await
        .map_err(|_| ApiError::AlreadyExists("path is busy".into()))?;
    storage::create_dir(&share.root, &body.path).await?;
    info!(root = body.root, path = body.path, "directory created");
    Ok(Envelope::ok_msg(
        "directory created successfully",
        json!({"root": body.root, "path": body.path}),
    ))
}

/// 重命名文件或目录（newName 仅允许纯文件名）。
pub async fn rename_entry(
    Extension(store): Extension<Arc<ConfigStore>>,
    Extension(locks): Extension<Arc<LockManager>>,
    ClientIp(client_ip): ClientIp,
    user: AuthedUser,
    Json(body): Json<RenameBody>,
) -> Result<JsonResponse<Envelope>, ApiError> {
    let config = store.snapshot();
    rules::authorize(
        &config,
        &user.name,
        Permission::Write,
        &body.root,
        &body.path,
        client_ip,
    )?;
    let share = config.share(&body.root).ok_or(ApiError::UnknownShare)?;

    let _path_lock = locks
        .lock_path_with_timeout(
            &body.root,
            &body.path,
            Duration::from_secs(LOCK_WAIT_TIMEOUT_SECS),
        )
        .await
        .map_err(|_| ApiError::AlreadyExists("path is busy".into()))?;
    storage::rename(&share.root, &body.path, &body.new_name).await?;
    info!(
        root = body.root,
        path = body.path,
        new_name = body.new_name,
        "renamed"
    );
    Ok(Envelope::ok_msg(
        "renamed successfully",
        json!({
            "root": body.root,
            "oldPath": body.path,
            "newName": body.new_name,
        }),
    ))
}

/// 批量删除：每个路径独立尝试，返回逐项结果。
pub async fn delete_entries(
    Extension(store): Extension<Arc<ConfigStore>>,
    Extension(quota): Extension<Arc<QuotaTracker>>,
    Extension(locks): Extension<Arc<LockManager>>,
    ClientIp(client_ip): ClientIp,
    user: AuthedUser,
    Json(body): Json<DeleteBody>,
) -> Result<JsonResponse<Envelope>, ApiError> {
    let config = store.snapshot();
    let mut deleted: Vec<String> = Vec::new();
    let mut failed: Vec<serde_json::Value> = Vec::new();

    for path in &body.paths {
        if let Err(err) = rules::authorize(
            &config,
            &user.name,
            Permission::Delete,
            &body.root,
            path,
            client_ip,
        ) {
            failed.push(json!({"path": path, "error": error_text(err)}));
            continue;
        }
        let Some(share) = config.share(&body.root) else {
            failed.push(json!({"path": path, "error": "share not found"}));
            continue;
        };

        let lock = locks
            .lock_path_with_timeout(&body.root, path, Duration::from_secs(LOCK_WAIT_TIMEOUT_SECS))
            .await;
        if lock.is_err() {
            failed.push(json!({"path": path, "error": "path is busy"}));
            continue;
        }
        match storage::delete(&share.root, path).await {
            Ok(()) => deleted.push(path.clone()),
            Err(err) => failed.push(json!({"path": path, "error": err.to_string()})),
        }
    }

    if !deleted.is_empty() {
        quota.invalidate(&body.root).await;
    }
    info!(
        root = body.root,
        deleted = deleted.len(),
        failed = failed.len(),
        "delete entries"
    );
    Ok(Envelope::ok_msg(
        format!("deleted {} items", deleted.len()),
        json!({
            "root": body.root,
            "deleted": deleted,
            "failed": failed,
        }),
    ))
}

fn error_text(err: ApiError) -> String {
    match err {
        ApiError::Forbidden(msg) => msg,
        _ => "operation failed".to_string(),
    }
}

fn ascii_fallback(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|ch| {
            if (' '..='\u{7e}').contains(&ch) && ch != '"' && ch != '\\' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}

fn header_value(
    headers: &mut HeaderMap,
    name: header::HeaderName,
    value: &str,
) -> Result<(), ApiError> {
    let value = HeaderValue::from_str(value)
        .map_err(|_| ApiError::Internal("failed to build response header".into()))?;
    headers.insert(name, value);
    Ok(())
}

fn io_to_api(err: std::io::Error) -> ApiError {
    ApiError::from(storage::StorageError::Io(err))
}

/// 解析 Range 头，返回可读取的范围。
fn parse_range(
    value: Option<&HeaderValue>,
    file_size: u64,
) -> Result<Option<(u64, u64)>, ApiError> {
    let Some(value) = value else {
        return Ok(None);
    };
    if file_size == 0 {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    let value = value
        .to_str()
        .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
    let Some(range) = value.strip_prefix("bytes=") else {
        return Err(ApiError::BadRequest("invalid Range header".into()));
    };
    if range.contains(',') {
        return Err(ApiError::BadRequest("multiple ranges not supported".into()));
    }

    let mut parts = range.splitn(2, '-');
    let start_part = parts.next().unwrap_or_default();
    let end_part = parts.next().unwrap_or_default();

    let (start, end) = if start_part.is_empty() {
        let suffix: u64 = end_part
            .parse()
            .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
        if suffix == 0 {
            return Ok(None);
        }
        let start = file_size.saturating_sub(suffix);
        (start, file_size.saturating_sub(1))
    } else {
        let start: u64 = start_part
            .parse()
            .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
        let end: u64 = if end_part.is_empty() {
            file_size.saturating_sub(1)
        } else {
            end_part
                .parse()
                .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?
        };
        (start, end)
    };

    if start > end || start >= file_size {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }

    Ok(Some((start, end.min(file_size.saturating_sub(1)))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::FromRequest;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::net::IpAddr;
    use std::path::Path;
    use tempfile::tempdir;

    use crate::config::{Config, FileConfig};

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    fn test_config(share_dir: &Path, allow: &str) -> Config {
        let raw = format!(
            r#"
[[shares]]
name = "public"
path = "{}"

[[users]]
name = "alice"
pass = "secret"

[[rules]]
who = "alice"
allow = {allow}
roots = ["public"]
paths = ["/"]
"#,
            share_dir.display()
        );
        let file: FileConfig = toml::from_str(&raw).expect("parse test config");
        Config::validate(file).expect("validate test config")
    }

    struct Handles {
        store: Arc<ConfigStore>,
        quota: Arc<QuotaTracker>,
        metrics: Arc<Metrics>,
        locks: Arc<LockManager>,
    }

    fn handles(config: Config) -> Handles {
        Handles {
            store: Arc::new(ConfigStore::for_tests(config)),
            quota: Arc::new(QuotaTracker::new()),
            metrics: Arc::new(Metrics::new()),
            locks: Arc::new(LockManager::new()),
        }
    }

    fn alice() -> AuthedUser {
        AuthedUser {
            name: "alice".into(),
        }
    }

    async fn multipart_from(parts: &[(&str, Option<&str>, &str)]) -> Multipart {
        let mut body = String::new();
        for (name, filename, value) in parts {
            body.push_str("--BOUNDARY\r\n");
            match filename {
                Some(filename) => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\r\n"
                )),
                None => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"\r\n\r\n"
                )),
            }
            body.push_str(value);
            body.push_str("\r\n");
        }
        body.push_str("--BOUNDARY--\r\n");

        let request = Request::builder()
            .header(
                header::CONTENT_TYPE,
                "multipart/form-data; boundary=BOUNDARY",
            )
            .body(Body::from(body))
            .expect("request");
        Multipart::from_request(request, &()).await.expect("multipart")
    }

    async fn do_upload(handles: &Handles, content: &str) -> Result<JsonResponse<Envelope>, ApiError> {
        do_upload_named(handles, "data.bin", content).await
    }

    async fn do_upload_named(
        handles: &Handles,
        filename: &str,
        content: &str,
    ) -> Result<JsonResponse<Envelope>, ApiError> {
        let multipart = multipart_from(&[
            ("root", None, "public"),
            ("path", None, ""),
            ("file", Some(filename), content),
        ])
        .await;
        upload_file(
            Extension(handles.store.clone()),
            Extension(handles.quota.clone()),
            Extension(handles.metrics.clone()),
            Extension(handles.locks.clone()),
            ClientIp(localhost()),
            alice(),
            multipart,
        )
        .await
    }

    #[tokio::test]
    async fn upload_then_download_roundtrip() {
        let temp = tempdir().expect("tempdir");
        let share_dir = temp.path().join("public");
        let handles = handles(test_config(&share_dir, r#"["R", "W", "D"]"#));

        let JsonResponse(envelope) = match do_upload(&handles, "hello world").await {
            Ok(response) => response,
            Err(_) => panic!("upload failed"),
        };
        assert_eq!(envelope.code, 0);

        let response = download_file(
            Query(DownloadQuery {
                root: "public".into(),
                path: "data.bin".into(),
            }),
            HeaderMap::new(),
            Extension(handles.store.clone()),
            Extension(handles.metrics.clone()),
            ClientIp(localhost()),
            alice(),
        )
        .await
        .unwrap_or_else(|_| panic!("download failed"));

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(&bytes[..], b"hello world");
    }

    #[tokio::test]
    async fn ranged_download_returns_partial_content() {
        let temp = tempdir().expect("tempdir");
        let share_dir = temp.path().join("public");
        std::fs::create_dir_all(&share_dir).expect("mkdir");
        std::fs::write(share_dir.join("data.bin"), b"0123456789").expect("seed");
        let handles = handles(test_config(&share_dir, r#"["R"]"#));

        let mut request_headers = HeaderMap::new();
        request_headers.insert(header::RANGE, HeaderValue::from_static("bytes=0-3"));
        let response = download_file(
            Query(DownloadQuery {
                root: "public".into(),
                path: "data.bin".into(),
            }),
            request_headers,
            Extension(handles.store.clone()),
            Extension(handles.metrics.clone()),
            ClientIp(localhost()),
            alice(),
        )
        .await
        .unwrap_or_else(|_| panic!("download failed"));

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok()),
            Some("bytes 0-3/10")
        );
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(&bytes[..], b"0123");
    }

    #[tokio::test]
    async fn upload_without_overwrite_refuses_existing() {
        let temp = tempdir().expect("tempdir");
        let share_dir = temp.path().join("public");
        let handles = handles(test_config(&share_dir, r#"["R", "W"]"#));

        assert!(do_upload(&handles, "first").await.is_ok());
        let second = do_upload(&handles, "second").await;
        assert!(matches!(second, Err(ApiError::AlreadyExists(_))));
        assert_eq!(
            std::fs::read(share_dir.join("data.bin")).expect("read"),
            b"first"
        );
    }

    #[tokio::test]
    async fn upload_over_limit_removes_partial_file() {
        let temp = tempdir().expect("tempdir");
        let share_dir = temp.path().join("public");
        let mut config = test_config(&share_dir, r#"["W"]"#);
        config.ui.max_upload_size = Some(4);
        let handles = handles(config);

        let result = do_upload(&handles, "way past the limit").await;
        assert!(matches!(result, Err(ApiError::PayloadTooLarge(_))));
        assert!(!share_dir.join("data.bin").exists(), "partial removed");
    }

    #[tokio::test]
    async fn concurrent_uploads_accumulate_quota_usage() {
        let temp = tempdir().expect("tempdir");
        let share_dir = temp.path().join("public");
        let mut config = test_config(&share_dir, r#"["W"]"#);
        config.shares[0].quota_bytes = Some(1024);
        let share = config.shares[0].clone();
        let handles = handles(config);

        // Seed the usage cache so both uploads commit incrementally.
        assert_eq!(handles.quota.usage(&share).await.expect("usage"), 0);

        let (first, second) = tokio::join!(
            do_upload_named(&handles, "one.bin", "aaaa"),
            do_upload_named(&handles, "two.bin", "bbbbbb"),
        );
        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(
            handles.quota.usage(&share).await.expect("usage"),
            10,
            "usage reflects the sum of both uploads"
        );
    }

    #[tokio::test]
    async fn upload_denied_without_write_permission() {
        let temp = tempdir().expect("tempdir");
        let share_dir = temp.path().join("public");
        let handles = handles(test_config(&share_dir, r#"["R"]"#));

        let result = do_upload(&handles, "nope").await;
        assert!(matches!(result, Err(ApiError::Forbidden(_))));
    }

    #[tokio::test]
    async fn delete_reports_per_path_outcomes() {
        let temp = tempdir().expect("tempdir");
        let share_dir = temp.path().join("public");
        std::fs::create_dir_all(&share_dir).expect("mkdir");
        std::fs::write(share_dir.join("keep-me.txt"), b"x").expect("seed");
        let handles = handles(test_config(&share_dir, r#"["R", "W", "D"]"#));

        let JsonResponse(envelope) = delete_entries(
            Extension(handles.store.clone()),
            Extension(handles.quota.clone()),
            Extension(handles.locks.clone()),
            ClientIp(localhost()),
            alice(),
            Json(DeleteBody {
                root: "public".into(),
                paths: vec!["keep-me.txt".into(), "missing.txt".into()],
            }),
        )
        .await
        .unwrap_or_else(|_| panic!("delete failed"));

        let data = envelope.data.expect("data");
        assert_eq!(data["deleted"], json!(["keep-me.txt"]));
        assert_eq!(data["failed"][0]["path"], "missing.txt");
        assert!(!share_dir.join("keep-me.txt").exists());
    }

    #[tokio::test]
    async fn delete_without_permission_is_forbidden_per_item() {
        let temp = tempdir().expect("tempdir");
        let share_dir = temp.path().join("public");
        std::fs::create_dir_all(&share_dir).expect("mkdir");
        std::fs::write(share_dir.join("foo.txt"), b"x").expect("seed");
        // Read/Write only, delete must be denied.
        let handles = handles(test_config(&share_dir, r#"["R", "W"]"#));

        let JsonResponse(envelope) = delete_entries(
            Extension(handles.store.clone()),
            Extension(handles.quota.clone()),
            Extension(handles.locks.clone()),
            ClientIp(localhost()),
            alice(),
            Json(DeleteBody {
                root: "public".into(),
                paths: vec!["foo.txt".into()],
            }),
        )
        .await
        .unwrap_or_else(|_| panic!("delete failed"));

        let data = envelope.data.expect("data");
        assert_eq!(data["deleted"], json!([]));
        assert_eq!(data["failed"][0]["path"], "foo.txt");
        assert!(share_dir.join("foo.txt").exists());
    }

    #[tokio::test]
    async fn mkdir_is_not_idempotent() {
        let temp = tempdir().expect("tempdir");
        let share_dir = temp.path().join("public");
        let handles = handles(test_config(&share_dir, r#"["W"]"#));

        let first = make_directory(
            Extension(handles.store.clone()),
            Extension(handles.locks.clone()),
            ClientIp(localhost()),
            alice(),
            Json(MkdirBody {
                root: "public".into(),
                path: "reports".into(),
            }),
        )
        .await;
        assert!(first.is_ok());

        let second = make_directory(
            Extension(handles.store.clone()),
            Extension(handles.locks.clone()),
            ClientIp(localhost()),
            alice(),
            Json(MkdirBody {
                root: "public".into(),
                path: "reports".into(),
            }),
        )
        .await;
        assert!(matches!(second, Err(ApiError::AlreadyExists(_))));
    }

    #[test]
    fn range_parsing_matches_rfc_semantics() {
        let value = HeaderValue::from_static("bytes=0-499");
        assert_eq!(parse_range(Some(&value), 1000).unwrap(), Some((0, 499)));

        let value = HeaderValue::from_static("bytes=500-");
        assert_eq!(parse_range(Some(&value), 1000).unwrap(), Some((500, 999)));

        let value = HeaderValue::from_static("bytes=-200");
        assert_eq!(parse_range(Some(&value), 1000).unwrap(), Some((800, 999)));

        let value = HeaderValue::from_static("bytes=0-5000");
        assert_eq!(parse_range(Some(&value), 1000).unwrap(), Some((0, 999)));

        let value = HeaderValue::from_static("bytes=2000-3000");
        assert!(matches!(
            parse_range(Some(&value), 1000),
            Err(ApiError::RangeNotSatisfiable(1000))
        ));

        let value = HeaderValue::from_static("bytes=0-99,200-299");
        assert!(matches!(
            parse_range(Some(&value), 1000),
            Err(ApiError::BadRequest(_))
        ));

        let value = HeaderValue::from_static("items=0-5");
        assert!(matches!(
            parse_range(Some(&value), 1000),
            Err(ApiError::BadRequest(_))
        ));

        assert_eq!(parse_range(None, 1000).unwrap(), None);
    }
}
