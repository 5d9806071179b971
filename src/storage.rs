use serde::Serialize;
use std::cmp::Ordering;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::ErrorKind;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("path escapes share root")]
    PathEscape,
    #[error("invalid path")]
    InvalidPath,
    #[error("invalid filename")]
    InvalidFilename,
    #[error("not found")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("already exists")]
    AlreadyExists,
    #[error("parent directory missing")]
    ParentMissing,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Serialize, Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub mtime: u64,
}

/// Normalizes a share-relative path and joins it onto `root`.
///
/// Backslashes are treated as separators, `.` segments collapse, and any
/// `..`, rooted, or prefixed component is rejected outright, so the result
/// always stays under `root`. Null bytes are refused before normalization.
pub fn resolve(root: &Path, relative: &str) -> Result<PathBuf, StorageError> {
    if relative.contains('\0') {
        return Err(StorageError::InvalidPath);
    }
    let unified = relative.replace('\\', "/");
    let trimmed = unified.trim().trim_start_matches('/');

    let mut normalized = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(segment) => normalized.push(segment),
            Component::CurDir => continue,
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::PathEscape);
            }
        }
    }

    let target = root.join(normalized);
    if !target.starts_with(root) {
        return Err(StorageError::PathEscape);
    }
    Ok(target)
}

/// Resolves and then walks every component below the share root, refusing
/// symlinks. The walk runs immediately before the caller's filesystem call
/// to keep the check-to-use window as small as the platform allows.
pub async fn resolve_checked(
    root: &Path,
    relative: &str,
    allow_missing_leaf: bool,
) -> Result<PathBuf, StorageError> {
    let target = resolve(root, relative)?;
    ensure_no_symlink_components(root, &target, allow_missing_leaf).await?;
    Ok(target)
}

async fn ensure_no_symlink_components(
    root: &Path,
    target: &Path,
    allow_missing_leaf: bool,
) -> Result<(), StorageError> {
    let relative = target
        .strip_prefix(root)
        .map_err(|_| StorageError::PathEscape)?;
    let mut current = root.to_path_buf();
    let mut components = relative.components().peekable();

    while let Some(component) = components.next() {
        current.push(component.as_os_str());
        match fs::symlink_metadata(&current).await {
            Ok(metadata) => {
                if metadata.file_type().is_symlink() {
                    return Err(StorageError::PathEscape);
                }
                if components.peek().is_some() && !metadata.is_dir() {
                    return Err(StorageError::NotADirectory);
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if allow_missing_leaf {
                    return Ok(());
                }
                return Err(StorageError::NotFound);
            }
            Err(err) => return Err(StorageError::Io(err)),
        }
    }

    Ok(())
}

/// Lists a directory, name-ascending (case-insensitive).
pub async fn list_dir(root: &Path, relative: &str) -> Result<Vec<DirEntry>, StorageError> {
    let target = resolve_checked(root, relative, false).await?;
    let metadata = fs::metadata(&target).await?;
    if !metadata.is_dir() {
        return Err(StorageError::NotADirectory);
    }

    let mut dir = fs::read_dir(&target).await?;
    let mut entries = Vec::new();
    while let Some(entry) = dir.next_entry().await? {
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            // Entries that vanish mid-listing are skipped, not fatal.
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(StorageError::Io(err)),
        };
        let name = entry.file_name().to_string_lossy().to_string();
        let is_dir = metadata.is_dir();
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|ts| ts.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        entries.push(DirEntry {
            name,
            is_dir,
            size: if is_dir { 0 } else { metadata.len() },
            mtime,
        });
    }

    entries.sort_by(|a, b| match a.name.to_lowercase().cmp(&b.name.to_lowercase()) {
        Ordering::Equal => a.name.cmp(&b.name),
        other => other,
    });

    Ok(entries)
}

/// Creates the final path segment only. Missing intermediate directories
/// fail with `ParentMissing` rather than being created implicitly.
pub async fn create_dir(root: &Path, relative: &str) -> Result<(), StorageError> {
    let target = resolve_checked(root, relative, true).await?;
    if target == root {
        return Err(StorageError::AlreadyExists);
    }
    match fs::create_dir(&target).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Err(StorageError::AlreadyExists),
        Err(err) if err.kind() == ErrorKind::NotFound => Err(StorageError::ParentMissing),
        Err(err) => Err(StorageError::Io(err)),
    }
}

/// Renames an entry in place. `new_name` must be a bare filename.
pub async fn rename(root: &Path, relative: &str, new_name: &str) -> Result<(), StorageError> {
    if !is_valid_filename(new_name) {
        return Err(StorageError::InvalidFilename);
    }
    let source = resolve_checked(root, relative, false).await?;
    if source == root {
        return Err(StorageError::InvalidPath);
    }
    let target = source.with_file_name(new_name);

    match fs::symlink_metadata(&target).await {
        Ok(_) => return Err(StorageError::AlreadyExists),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(StorageError::Io(err)),
    }
    fs::rename(&source, &target).await?;
    Ok(())
}

/// Deletes a file or directory; directories are removed recursively.
pub async fn delete(root: &Path, relative: &str) -> Result<(), StorageError> {
    let target = resolve_checked(root, relative, false).await?;
    if target == root {
        return Err(StorageError::InvalidPath);
    }
    let metadata = fs::metadata(&target).await?;
    if metadata.is_dir() {
        fs::remove_dir_all(&target).await?;
    } else {
        fs::remove_file(&target).await?;
    }
    Ok(())
}

/// Opens the upload target with an exclusive create so a concurrent upload
/// of the same name loses the race instead of silently clobbering it.
/// The containing directory is created if missing. Returns the final path
/// together with the open handle.
pub async fn open_exclusive(
    root: &Path,
    relative_dir: &str,
    filename: &str,
) -> Result<(PathBuf, File), StorageError> {
    let dir = resolve_checked(root, relative_dir, true).await?;
    fs::create_dir_all(&dir).await?;

    let target = resolve(root, &join_relative(relative_dir, filename))?;
    match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&target)
        .await
    {
        Ok(file) => Ok((target, file)),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Err(StorageError::AlreadyExists),
        Err(err) => Err(StorageError::Io(err)),
    }
}

/// Joins a relative directory and a filename with forward slashes.
pub fn join_relative(relative_dir: &str, filename: &str) -> String {
    let dir = relative_dir.trim_matches('/');
    if dir.is_empty() {
        filename.to_string()
    } else {
        format!("{dir}/{filename}")
    }
}

/// Strips path separators and control characters from a client-supplied
/// filename, trimming trailing dots and spaces. Falls back to `unnamed`.
pub fn sanitize_filename(filename: &str) -> String {
    let mut cleaned: String = filename
        .chars()
        .map(|ch| match ch {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            _ => ch,
        })
        .filter(|ch| !ch.is_control())
        .collect();

    cleaned = cleaned.trim_matches(|ch| ch == ' ' || ch == '.').to_string();
    if cleaned.is_empty() {
        return "unnamed".to_string();
    }
    if cleaned.chars().count() > 255 {
        cleaned = cleaned.chars().take(255).collect();
    }
    cleaned
}

/// Accepts bare filenames only: no separators, no control characters,
/// not `.` or `..`.
pub fn is_valid_filename(filename: &str) -> bool {
    if filename.is_empty() || filename == "." || filename == ".." {
        return false;
    }
    !filename
        .chars()
        .any(|ch| matches!(ch, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') || ch.is_control())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_root() -> (tempfile::TempDir, PathBuf) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("share");
        std::fs::create_dir_all(&root).expect("create share root");
        (temp, root)
    }

    #[test]
    fn resolve_rejects_parent_segments() {
        let (_temp, root) = make_root();
        for candidate in [
            "../outside.txt",
            "a/../../outside.txt",
            "..",
            "a/b/../../../c",
            "..\\windows\\escape",
        ] {
            assert!(
                matches!(resolve(&root, candidate), Err(StorageError::PathEscape)),
                "{candidate} should be rejected"
            );
        }
    }

    #[test]
    fn resolve_rejects_nul_bytes() {
        let (_temp, root) = make_root();
        assert!(matches!(
            resolve(&root, "a\0b"),
            Err(StorageError::InvalidPath)
        ));
    }

    #[test]
    fn resolve_normalizes_separators_and_dots() {
        let (_temp, root) = make_root();
        let resolved = resolve(&root, "/a\\b/./c").expect("resolve");
        assert_eq!(resolved, root.join("a").join("b").join("c"));
        let root_itself = resolve(&root, "").expect("resolve empty");
        assert_eq!(root_itself, root);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_checked_rejects_symlink_component() {
        use std::os::unix::fs::symlink;

        let (temp, root) = make_root();
        let outside = temp.path().join("outside.txt");
        std::fs::write(&outside, b"secret").expect("write outside file");
        symlink(&outside, root.join("link")).expect("symlink");

        let result = resolve_checked(&root, "link", false).await;
        assert!(matches!(result, Err(StorageError::PathEscape)));
    }

    #[tokio::test]
    async fn list_dir_sorts_by_name() {
        let (_temp, root) = make_root();
        std::fs::create_dir(root.join("zeta")).expect("mkdir");
        std::fs::write(root.join("Beta.txt"), b"b").expect("write");
        std::fs::write(root.join("alpha.txt"), b"a").expect("write");

        let entries = list_dir(&root, "").await.expect("list");
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha.txt", "Beta.txt", "zeta"]);
        assert!(entries[2].is_dir);
        assert_eq!(entries[2].size, 0);
        assert_eq!(entries[0].size, 1);
    }

    #[tokio::test]
    async fn list_dir_on_file_is_not_a_directory() {
        let (_temp, root) = make_root();
        std::fs::write(root.join("file.txt"), b"x").expect("write");
        let result = list_dir(&root, "file.txt").await;
        assert!(matches!(result, Err(StorageError::NotADirectory)));
    }

    #[tokio::test]
    async fn create_dir_reports_existing_and_missing_parent() {
        let (_temp, root) = make_root();
        create_dir(&root, "fresh").await.expect("mkdir");

        // Repeating never succeeds without deleting first.
        for _ in 0..2 {
            let result = create_dir(&root, "fresh").await;
            assert!(matches!(result, Err(StorageError::AlreadyExists)));
        }

        let result = create_dir(&root, "missing/deep").await;
        assert!(matches!(result, Err(StorageError::ParentMissing)));
    }

    #[tokio::test]
    async fn rename_validates_name_and_destination() {
        let (_temp, root) = make_root();
        std::fs::write(root.join("a.txt"), b"a").expect("write");
        std::fs::write(root.join("b.txt"), b"b").expect("write");

        let result = rename(&root, "a.txt", "sub/dir.txt").await;
        assert!(matches!(result, Err(StorageError::InvalidFilename)));

        let result = rename(&root, "a.txt", "b.txt").await;
        assert!(matches!(result, Err(StorageError::AlreadyExists)));

        rename(&root, "a.txt", "c.txt").await.expect("rename");
        assert!(root.join("c.txt").exists());
        assert!(!root.join("a.txt").exists());

        let result = rename(&root, "gone.txt", "d.txt").await;
        assert!(matches!(result, Err(StorageError::NotFound)));
    }

    #[tokio::test]
    async fn delete_removes_files_and_directories() {
        let (_temp, root) = make_root();
        std::fs::create_dir_all(root.join("dir/nested")).expect("mkdir");
        std::fs::write(root.join("dir/nested/file.txt"), b"x").expect("write");
        std::fs::write(root.join("file.txt"), b"y").expect("write");

        delete(&root, "file.txt").await.expect("delete file");
        delete(&root, "dir").await.expect("delete dir");
        assert!(!root.join("dir").exists());

        let result = delete(&root, "gone").await;
        assert!(matches!(result, Err(StorageError::NotFound)));
    }

    #[tokio::test]
    async fn open_exclusive_refuses_existing_target() {
        let (_temp, root) = make_root();
        let (path, _file) = open_exclusive(&root, "", "upload.bin").await.expect("open");
        assert_eq!(path, root.join("upload.bin"));

        let result = open_exclusive(&root, "", "upload.bin").await;
        assert!(matches!(result, Err(StorageError::AlreadyExists)));
    }

    #[test]
    fn sanitize_filename_strips_dangerous_characters() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_filename("a<b>c.txt"), "a_b_c.txt");
        assert_eq!(sanitize_filename("  spaced.txt  "), "spaced.txt");
        assert_eq!(sanitize_filename("\u{1}\u{2}"), "unnamed");
        assert_eq!(sanitize_filename(""), "unnamed");
    }

    #[test]
    fn filename_validation() {
        assert!(is_valid_filename("report.pdf"));
        assert!(!is_valid_filename("a/b"));
        assert!(!is_valid_filename("a\\b"));
        assert!(!is_valid_filename(".."));
        assert!(!is_valid_filename(""));
    }
}
