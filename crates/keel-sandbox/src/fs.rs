//! File system operations on virtual paths.
//!
//! Every operation resolves its virtual path first; nothing touches the host
//! filesystem until the path is known to stay under the sandbox root.

use crate::error::{Result, SandboxError};
use crate::Sandbox;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use tracing::{debug, trace};

/// Maximum file size for read_file (10 MB).
pub const MAX_READ_SIZE: u64 = 10 * 1024 * 1024;

/// File entry for directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// File or directory name.
    pub name: String,
    /// True if this is a directory.
    pub is_dir: bool,
    /// File size in bytes (0 for directories).
    pub size: u64,
}

impl Sandbox {
    /// Read a file's contents.
    ///
    /// Files larger than [`MAX_READ_SIZE`] are rejected.
    pub fn read_file(&self, path: &str) -> Result<String> {
        let real = self.resolve(path)?;
        let metadata = fs::metadata(&real).map_err(|e| SandboxError::io(path, e))?;

        if metadata.len() > MAX_READ_SIZE {
            return Err(SandboxError::TooLarge {
                path: path.to_string(),
                size: metadata.len(),
                max: MAX_READ_SIZE,
            });
        }

        let content = fs::read_to_string(&real).map_err(|e| SandboxError::io(path, e))?;
        trace!(path = %path, size = content.len(), "file read");
        Ok(content)
    }

    /// Write content to a file, creating parent directories as needed.
    pub fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let real = self.resolve(path)?;
        if let Some(parent) = real.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| SandboxError::io(path, e))?;
            }
        }

        fs::write(&real, content).map_err(|e| SandboxError::io(path, e))?;
        debug!(path = %path, content_len = content.len(), "file written");
        Ok(())
    }

    /// Append content to a file, creating it if missing.
    pub fn append_file(&self, path: &str, content: &str) -> Result<()> {
        let real = self.resolve(path)?;
        if let Some(parent) = real.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| SandboxError::io(path, e))?;
            }
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&real)
            .map_err(|e| SandboxError::io(path, e))?;
        file.write_all(content.as_bytes())
            .map_err(|e| SandboxError::io(path, e))?;
        debug!(path = %path, content_len = content.len(), "file appended");
        Ok(())
    }

    /// List directory contents, sorted by name.
    pub fn list_dir(&self, path: &str) -> Result<Vec<FileEntry>> {
        let real = self.resolve(path)?;
        let entries = fs::read_dir(&real).map_err(|e| SandboxError::io(path, e))?;

        let mut result = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SandboxError::io(path, e))?;
            let metadata = entry.metadata().map_err(|e| SandboxError::io(path, e))?;

            result.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: metadata.is_dir(),
                size: if metadata.is_file() { metadata.len() } else { 0 },
            });
        }

        result.sort_by(|a, b| a.name.cmp(&b.name));
        trace!(path = %path, count = result.len(), "directory listed");
        Ok(result)
    }

    /// Delete a file or a directory tree. The root itself cannot be removed.
    pub fn remove(&self, path: &str) -> Result<()> {
        let real = self.resolve(path)?;
        if real == self.root() {
            return Err(SandboxError::denied(path, "the sandbox root cannot be deleted"));
        }

        let metadata = fs::symlink_metadata(&real).map_err(|e| SandboxError::io(path, e))?;
        if metadata.is_dir() {
            fs::remove_dir_all(&real)
        } else {
            fs::remove_file(&real)
        }
        .map_err(|e| SandboxError::io(path, e))?;

        debug!(path = %path, "path removed");
        Ok(())
    }

    /// Create a directory and any missing parents.
    pub fn make_dir(&self, path: &str) -> Result<()> {
        let real = self.resolve(path)?;
        fs::create_dir_all(&real).map_err(|e| SandboxError::io(path, e))?;
        debug!(path = %path, "directory created");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_dir() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir =
            std::env::temp_dir().join(format!("keel-fs-test-{}-{}", std::process::id(), id));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_write_and_read_file() {
        let dir = temp_dir();
        let sandbox = Sandbox::open(&dir).unwrap();

        let content = "Hello, keel!";
        sandbox.write_file("/test.txt", content).unwrap();
        assert_eq!(sandbox.read_file("test.txt").unwrap(), content);
        assert!(dir.join("test.txt").exists());

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_write_creates_parent_dirs() {
        let dir = temp_dir();
        let sandbox = Sandbox::open(&dir).unwrap();

        sandbox.write_file("/nested/dirs/test.txt", "content").unwrap();
        assert!(dir.join("nested/dirs/test.txt").exists());

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_append_file() {
        let dir = temp_dir();
        let sandbox = Sandbox::open(&dir).unwrap();

        sandbox.append_file("/log.txt", "one\n").unwrap();
        sandbox.append_file("/log.txt", "two\n").unwrap();
        assert_eq!(sandbox.read_file("/log.txt").unwrap(), "one\ntwo\n");

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_read_nonexistent_file() {
        let dir = temp_dir();
        let sandbox = Sandbox::open(&dir).unwrap();

        let err = sandbox.read_file("/missing.txt").unwrap_err();
        assert!(matches!(err, SandboxError::Io { .. }));

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_escape_never_touches_host() {
        let dir = temp_dir();
        let sandbox = Sandbox::open(&dir).unwrap();

        assert!(sandbox.read_file("/../../etc/passwd").unwrap_err().is_access_denied());
        assert!(sandbox.write_file("../outside.txt", "x").unwrap_err().is_access_denied());
        assert!(!dir.parent().unwrap().join("outside.txt").exists());

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_list_dir() {
        let dir = temp_dir();
        let sandbox = Sandbox::open(&dir).unwrap();
        fs::write(dir.join("file2.txt"), "content").unwrap();
        fs::write(dir.join("file1.txt"), "content").unwrap();
        fs::create_dir(dir.join("subdir")).unwrap();

        let entries = sandbox.list_dir("/").unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["file1.txt", "file2.txt", "subdir"]);

        let subdir = entries.iter().find(|e| e.name == "subdir").unwrap();
        assert!(subdir.is_dir);
        assert_eq!(subdir.size, 0);
        assert_eq!(entries[0].size, 7);

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_remove_and_make_dir() {
        let dir = temp_dir();
        let sandbox = Sandbox::open(&dir).unwrap();

        sandbox.make_dir("/a/b/c").unwrap();
        assert!(dir.join("a/b/c").is_dir());
        sandbox.write_file("/a/b/c/f.txt", "x").unwrap();

        sandbox.remove("/a/b/c/f.txt").unwrap();
        assert!(!dir.join("a/b/c/f.txt").exists());
        sandbox.remove("/a").unwrap();
        assert!(!dir.join("a").exists());

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_root_cannot_be_removed() {
        let dir = temp_dir();
        let sandbox = Sandbox::open(&dir).unwrap();

        assert!(sandbox.remove("/").unwrap_err().is_access_denied());
        assert!(sandbox.remove("/a/..").unwrap_err().is_access_denied());
        assert!(dir.exists());

        fs::remove_dir_all(dir).ok();
    }
}
