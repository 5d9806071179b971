//! Process-wide counters surfaced at `/metrics`, plus the health endpoint.

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::Request;
use axum::response::{Json as JsonResponse, Response};
use axum::middleware::Next;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug)]
pub struct Metrics {
    started: Instant,
    total_requests: AtomicU64,
    active_requests: AtomicU64,
    by_method: Mutex<HashMap<String, u64>>,
    by_status: Mutex<HashMap<u16, u64>>,
    upload_bytes: AtomicU64,
    download_bytes: AtomicU64,
    errors: AtomicU64,
    auth_failures: AtomicU64,
    rate_limited: AtomicU64,
    ip_denied: AtomicU64,
    webdav_requests: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            total_requests: AtomicU64::new(0),
            active_requests: AtomicU64::new(0),
            by_method: Mutex::new(HashMap::new()),
            by_status: Mutex::new(HashMap::new()),
            upload_bytes: AtomicU64::new(0),
            download_bytes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            ip_denied: AtomicU64::new(0),
            webdav_requests: AtomicU64::new(0),
        }
    }

    pub fn record_request(&self, method: &str) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut by_method) = self.by_method.lock() {
            *by_method.entry(method.to_string()).or_insert(0) += 1;
        }
    }

    pub fn record_status(&self, status: u16) {
        if status >= 500 {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut by_status) = self.by_status.lock() {
            *by_status.entry(status).or_insert(0) += 1;
        }
    }

    pub fn add_upload_bytes(&self, bytes: u64) {
        self.upload_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_download_bytes(&self, bytes: u64) {
        self.download_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn incr_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_ip_denied(&self) {
        self.ip_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_webdav(&self) {
        self.webdav_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> Value {
        let by_method: HashMap<String, u64> = self
            .by_method
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default();
        let by_status: HashMap<String, u64> = self
            .by_status
            .lock()
            .map(|m| m.iter().map(|(k, v)| (k.to_string(), *v)).collect())
            .unwrap_or_default();

        json!({
            "uptime_seconds": self.uptime_secs(),
            "requests": {
                "total": self.total_requests.load(Ordering::Relaxed),
                "active": self.active_requests.load(Ordering::Relaxed),
                "by_method": by_method,
                "by_status": by_status,
            },
            "transfer": {
                "upload_bytes": self.upload_bytes.load(Ordering::Relaxed),
                "download_bytes": self.download_bytes.load(Ordering::Relaxed),
            },
            "errors": {
                "total": self.errors.load(Ordering::Relaxed),
                "auth_failures": self.auth_failures.load(Ordering::Relaxed),
                "rate_limit_hits": self.rate_limited.load(Ordering::Relaxed),
                "ip_denied": self.ip_denied.load(Ordering::Relaxed),
            },
            "webdav": {
                "requests": self.webdav_requests.load(Ordering::Relaxed),
            },
        })
    }
}

/// Middleware counting every request and its response status.
pub async fn record_middleware(
    Extension(metrics): Extension<Arc<Metrics>>,
    request: Request<AxumBody>,
    next: Next,
) -> Response {
    metrics.record_request(request.method().as_str());
    metrics.active_requests.fetch_add(1, Ordering::Relaxed);
    let response = next.run(request).await;
    metrics.active_requests.fetch_sub(1, Ordering::Relaxed);
    metrics.record_status(response.status().as_u16());
    response
}

/// 健康检查端点。
pub async fn healthz() -> JsonResponse<Value> {
    JsonResponse(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// 指标端点。
pub async fn metrics_endpoint(Extension(metrics): Extension<Arc<Metrics>>) -> JsonResponse<Value> {
    JsonResponse(metrics.snapshot())
}
