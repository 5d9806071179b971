//! 配置热重载与配额缓存刷新的后台任务。

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::fs;
use tracing::{info, warn};

use crate::config::{CONFIG_POLL_INTERVAL_SECS, ConfigStore, QUOTA_REFRESH_INTERVAL_SECS};
use crate::limit::Limiter;
use crate::quota::QuotaTracker;
use crate::webdav::DavGateway;

/// 启动后台任务：配置文件监视与配额缓存刷新。
pub fn spawn_background_tasks(
    store: Arc<ConfigStore>,
    limiter: Arc<Limiter>,
    gateway: Arc<DavGateway>,
    quota: Arc<QuotaTracker>,
) {
    let initial = store.snapshot();
    if initial.hot_reload.enabled && initial.hot_reload.watch_config {
        let quota_for_reload = quota.clone();
        tokio::spawn(async move {
            watch_config(store, limiter, gateway, quota_for_reload).await;
        });
    }

    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(QUOTA_REFRESH_INTERVAL_SECS));
        interval.tick().await;
        loop {
            interval.tick().await;
            // Drop cached usage so drift from overwrites and external
            // changes gets corrected by a fresh walk.
            quota.clear().await;
        }
    });
}

/// Polls the config file mtime. Rapid successive changes are debounced into
/// one reload; an invalid document keeps the previous snapshot serving.
async fn watch_config(
    store: Arc<ConfigStore>,
    limiter: Arc<Limiter>,
    gateway: Arc<DavGateway>,
    quota: Arc<QuotaTracker>,
) {
    let debounce = Duration::from_millis(store.snapshot().hot_reload.debounce_ms.max(1));
    let mut interval = tokio::time::interval(Duration::from_secs(CONFIG_POLL_INTERVAL_SECS));
    let mut last_mtime: Option<SystemTime> = current_mtime(&store).await;
    let mut pending_since: Option<Instant> = None;

    loop {
        interval.tick().await;
        let Some(mtime) = current_mtime(&store).await else {
            continue;
        };
        if Some(mtime) != last_mtime {
            last_mtime = Some(mtime);
            pending_since = Some(Instant::now());
            continue;
        }

        if let Some(since) = pending_since
            && since.elapsed() >= debounce
        {
            pending_since = None;
            match store.reload() {
                Ok(config) => {
                    limiter.reconfigure(&config.rate_limit);
                    gateway.rebuild(&config);
                    quota.retain_known(&config).await;
                    info!(path = ?store.path(), "configuration reloaded");
                }
                Err(err) => {
                    warn!(path = ?store.path(), error = %err, "config reload failed, keeping previous snapshot");
                }
            }
        }
    }
}

async fn current_mtime(store: &ConfigStore) -> Option<SystemTime> {
    fs::metadata(store.path())
        .await
        .ok()
        .and_then(|meta| meta.modified().ok())
}
