//! 内存路径锁：串行化同一共享内同一路径上的冲突写操作。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time;

/// Manages asynchronous mutexes keyed by (share, relative path). Reads are
/// never locked; only conflicting mutations on the same entry wait here.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// 在给定超时时间内获取路径锁，超时返回 Err。
    pub async fn lock_path_with_timeout(
        &self,
        share: &str,
        path: &str,
        timeout: Duration,
    ) -> Result<tokio::sync::OwnedMutexGuard<()>, ()> {
        let key = lock_key(share, path);
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| ())
    }
}

fn lock_key(share: &str, path: &str) -> String {
    let trimmed = path.trim().trim_start_matches(['/', '\\']);
    format!("{share}:{}", trimmed.replace('\\', "/"))
}
