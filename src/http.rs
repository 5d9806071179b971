//! HTTP 辅助工具：客户端 IP 解析、安全头、CORS 与首页。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, FromRequestParts, connect_info::ConnectInfo};
use axum::http::request::Parts;
use axum::http::{Extensions, HeaderMap, HeaderValue, Method, Request};
use axum::response::{Html, Response};
use axum::middleware::Next;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

use crate::config::ConfigStore;
use crate::error::ApiError;

/// 判断是否为免检路径（健康检查、指标、首页与文本分享读取）。
pub fn is_public_path(method: &Method, path: &str) -> bool {
    if method != Method::GET {
        return false;
    }
    path == "/healthz" || path == "/metrics" || path == "/" || path.starts_with("/t/")
}

/// 从代理转发头解析客户端 IP。
pub fn extract_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    for name in ["x-forwarded-for", "x-real-ip", "cf-connecting-ip"] {
        let candidate = headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .and_then(|value| value.parse::<IpAddr>().ok());
        if candidate.is_some() {
            return candidate;
        }
    }
    None
}

/// 综合转发头与连接信息计算客户端 IP。
pub fn resolve_client_ip(headers: &HeaderMap, extensions: &Extensions) -> Option<IpAddr> {
    extract_forwarded_ip(headers).or_else(|| {
        extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
    })
}

/// 提取器：请求的客户端 IP。
#[derive(Debug, Clone, Copy)]
pub struct ClientIp(pub IpAddr);

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        resolve_client_ip(&parts.headers, &parts.extensions)
            .map(ClientIp)
            .ok_or_else(|| ApiError::BadRequest("client address unavailable".into()))
    }
}

/// 构建 CORS Layer（支持逗号分隔的来源列表）。
pub fn build_cors_layer(cors_origins: Option<&str>) -> Option<CorsLayer> {
    let origins = cors_origins?
        .split(',')
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "invalid cors origin");
                None
            }
        })
        .collect::<Vec<_>>();

    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

/// 添加基础安全响应头。
pub async fn add_security_headers(request: Request<AxumBody>, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        axum::http::header::X_FRAME_OPTIONS,
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        axum::http::header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

/// 首页：展示品牌与标题。
pub async fn index(Extension(store): Extension<Arc<ConfigStore>>) -> Html<String> {
    let config = store.snapshot();
    Html(format!(
        "<!doctype html><html lang=\"{}\"><head><meta charset=\"utf-8\">\
         <title>{}</title></head><body><h1>{}</h1>\
         <p>API at <code>/api</code>, WebDAV at <code>{}</code>.</p></body></html>",
        config.ui.language, config.ui.title, config.ui.brand, config.dav.mount_path
    ))
}
