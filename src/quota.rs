//! Per-share usage accounting for quota enforcement.
//!
//! Usage is computed by a directory walk off the async runtime, cached per
//! share, and advanced incrementally as uploads commit. Deletes and renames
//! invalidate the cache instead of trying to subtract.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use tokio::sync::Mutex;

use crate::config::{Config, Share};

#[derive(Debug, Default)]
pub struct QuotaTracker {
    usage: Mutex<HashMap<String, u64>>,
}

impl QuotaTracker {
    pub fn new() -> Self {
        Self {
            usage: Mutex::new(HashMap::new()),
        }
    }

    /// Current usage in bytes, walking the share root on a cache miss.
    pub async fn usage(&self, share: &Share) -> io::Result<u64> {
        let mut usage = self.usage.lock().await;
        if let Some(current) = usage.get(&share.name) {
            return Ok(*current);
        }
        let total = walk_usage(share.root.clone()).await?;
        usage.insert(share.name.clone(), total);
        Ok(total)
    }

    /// Bytes still available under the quota, or None when unlimited.
    /// Zero means the share is already at or over its limit.
    pub async fn remaining(&self, share: &Share) -> io::Result<Option<u64>> {
        let Some(limit) = share.quota_bytes else {
            return Ok(None);
        };
        let used = self.usage(share).await?;
        Ok(Some(limit.saturating_sub(used)))
    }

    /// Adds committed upload bytes to the cached usage. Holding the lock for
    /// the increment keeps concurrent uploads from losing updates.
    pub async fn commit(&self, share: &Share, bytes: u64) {
        let mut usage = self.usage.lock().await;
        if let Some(current) = usage.get_mut(&share.name) {
            *current = current.saturating_add(bytes);
        }
    }

    /// Drops the cached usage so the next query walks the share again.
    pub async fn invalidate(&self, share_name: &str) {
        self.usage.lock().await.remove(share_name);
    }

    /// Drops every cached usage value.
    pub async fn clear(&self) {
        self.usage.lock().await.clear();
    }

    /// Reload hook: forget shares that no longer exist.
    pub async fn retain_known(&self, config: &Config) {
        let mut usage = self.usage.lock().await;
        usage.retain(|name, _| config.share(name).is_some());
    }
}

async fn walk_usage(root: PathBuf) -> io::Result<u64> {
    tokio::task::spawn_blocking(move || {
        fn walk(dir: &std::path::Path) -> u64 {
            let Ok(entries) = std::fs::read_dir(dir) else {
                return 0;
            };
            let mut total = 0;
            for entry in entries.flatten() {
                let Ok(metadata) = entry.metadata() else {
                    continue;
                };
                if metadata.is_dir() {
                    total += walk(&entry.path());
                } else {
                    total += metadata.len();
                }
            }
            total
        }
        Ok(walk(&root))
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}

/// Formats a byte count with binary units, one decimal above bytes.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[0])
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

/// Parses human sizes like `500`, `10KB`, `2.5 GB` into bytes.
pub fn parse_size(text: &str) -> Result<u64, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("empty size".to_string());
    }
    let upper = trimmed.to_uppercase();
    let (number_part, multiplier) = if let Some(rest) = upper.strip_suffix("TB") {
        (rest, 1024u64.pow(4))
    } else if let Some(rest) = upper.strip_suffix("GB") {
        (rest, 1024u64.pow(3))
    } else if let Some(rest) = upper.strip_suffix("MB") {
        (rest, 1024u64.pow(2))
    } else if let Some(rest) = upper.strip_suffix("KB") {
        (rest, 1024)
    } else if let Some(rest) = upper.strip_suffix('B') {
        (rest, 1)
    } else {
        (upper.as_str(), 1)
    };

    let number: f64 = number_part
        .trim()
        .parse()
        .map_err(|_| format!("invalid size '{trimmed}'"))?;
    if number < 0.0 {
        return Err(format!("invalid size '{trimmed}'"));
    }
    Ok((number * multiplier as f64) as u64)
}
