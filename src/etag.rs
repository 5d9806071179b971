//! ETag 计算：用于下载响应的缓存协商。

use std::fs::Metadata;
use std::time::UNIX_EPOCH;

/// 根据文件元数据生成弱 ETag。
pub fn etag_from_metadata(metadata: &Metadata) -> String {
    let size = metadata.len();
    if let Ok(modified) = metadata.modified()
        && let Ok(duration) = modified.duration_since(UNIX_EPOCH)
    {
        return format!(
            "W/\"{}-{}-{}\"",
            size,
            duration.as_secs(),
            duration.subsec_nanos()
        );
    }
    format!("W/\"{size}\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn etag_changes_with_content_size() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("file.txt");
        std::fs::write(&path, b"one").expect("write");
        let first = etag_from_metadata(&std::fs::metadata(&path).expect("meta"));

        std::fs::write(&path, b"longer content").expect("write");
        let second = etag_from_metadata(&std::fs::metadata(&path).expect("meta"));

        assert_ne!(first, second);
        assert!(first.starts_with("W/\""));
    }
}
