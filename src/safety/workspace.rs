/// Run-scoped workspaces.
///
/// Every invocation gets `<root>/<uuid>` (mode 0700). Nothing inside is ever
/// named after user input, so concurrent submissions cannot collide.
use crate::config::types::{MazeboxError, Result};
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Per-invocation directory, removed on drop
#[derive(Debug)]
pub struct Workspace {
    id: String,
    dir: PathBuf,
}

impl Workspace {
    /// Create a fresh workspace under `root`
    pub fn create(root: &Path) -> Result<Self> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o711)
            .create(root)
            .map_err(|e| {
                MazeboxError::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create workspace root {}: {}", root.display(), e),
                ))
            })?;

        let id = Uuid::new_v4().to_string();
        let dir = root.join(&id);
        fs::DirBuilder::new().mode(0o700).create(&dir).map_err(|e| {
            MazeboxError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to create workspace directory {}: {}", dir.display(), e),
            ))
        })?;

        log::debug!("Created workspace {}", dir.display());
        Ok(Self { id, dir })
    }

    /// Invocation id the directory is named after
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a file inside the workspace
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Write `content` to a plain file name inside the workspace
    pub fn write_file(&self, name: &str, content: &[u8]) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(MazeboxError::Config(format!(
                "invalid workspace file name: {:?}",
                name
            )));
        }
        let path = self.path(name);
        fs::write(&path, content).map_err(|e| {
            MazeboxError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to write {}: {}", path.display(), e),
            ))
        })?;
        Ok(path)
    }

    /// Give the workspace tree to the identity the child will run as
    pub fn hand_over(&self, uid: u32, gid: u32) -> Result<()> {
        chown_tree(&self.dir, uid, gid)
    }

    /// Remove the workspace (idempotent)
    pub fn cleanup(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MazeboxError::Io(e)),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            log::warn!("Failed to remove workspace {}: {}", self.dir.display(), e);
        }
    }
}

fn chown_tree(path: &Path, uid: u32, gid: u32) -> Result<()> {
    std::os::unix::fs::lchown(path, Some(uid), Some(gid))?;
    if fs::symlink_metadata(path)?.is_dir() {
        for entry in fs::read_dir(path)? {
            chown_tree(&entry?.path(), uid, gid)?;
        }
    }
    Ok(())
}

/// Remove workspaces older than `max_age` left behind by crashed servers.
/// Returns the number of directories removed.
pub fn sweep_stale_workspaces(root: &Path, max_age: Duration) -> Result<usize> {
    if !root.exists() {
        return Ok(0);
    }

    let now = SystemTime::now();
    let mut cleaned = 0;

    let entries = fs::read_dir(root).map_err(|e| {
        MazeboxError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to read workspace root {}: {}", root.display(), e),
        ))
    })?;

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                log::warn!("Failed to read directory entry: {}", e);
                continue;
            }
        };

        let path = entry.path();
        let is_workspace = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| Uuid::parse_str(n).is_ok())
            .unwrap_or(false);
        if !is_workspace || !path.is_dir() {
            continue;
        }

        let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("Failed to stat {}: {}", path.display(), e);
                continue;
            }
        };

        // Future timestamps are skipped
        let Ok(age) = now.duration_since(modified) else {
            continue;
        };

        if age >= max_age {
            log::info!("Removing stale workspace: {}", path.display());
            match fs::remove_dir_all(&path) {
                Ok(()) => cleaned += 1,
                Err(e) => log::warn!("Failed to remove stale workspace {}: {}", path.display(), e),
            }
        }
    }

    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn test_root(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("mazebox_ws_{}_{}", tag, Uuid::new_v4()))
    }

    #[test]
    fn test_workspace_is_private_and_removed_on_drop() {
        let root = test_root("drop");
        let workspace = Workspace::create(&root).unwrap();
        let dir = workspace.dir().to_path_buf();
        assert!(dir.exists());
        assert_eq!(fs::metadata(&dir).unwrap().permissions().mode() & 0o777, 0o700);
        assert!(Uuid::parse_str(workspace.id()).is_ok());

        workspace.write_file("main.rs", b"fn main() {}").unwrap();
        drop(workspace);
        assert!(!dir.exists());

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_workspaces_never_share_directories() {
        let root = test_root("unique");
        let a = Workspace::create(&root).unwrap();
        let b = Workspace::create(&root).unwrap();
        assert_ne!(a.dir(), b.dir());
        drop(a);
        assert!(b.dir().exists());
        drop(b);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_write_file_rejects_paths() {
        let root = test_root("names");
        let workspace = Workspace::create(&root).unwrap();
        assert!(workspace.write_file("../escape.rs", b"").is_err());
        assert!(workspace.write_file("..", b"").is_err());
        assert!(workspace.write_file("", b"").is_err());
        drop(workspace);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let root = test_root("idem");
        let workspace = Workspace::create(&root).unwrap();
        workspace.cleanup().unwrap();
        workspace.cleanup().unwrap();
        drop(workspace);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_sweep_removes_only_workspaces() {
        let root = test_root("sweep");
        let stale = root.join(Uuid::new_v4().to_string());
        let unrelated = root.join("keep-me");
        fs::create_dir_all(&stale).unwrap();
        fs::create_dir_all(&unrelated).unwrap();

        let cleaned = sweep_stale_workspaces(&root, Duration::ZERO).unwrap();
        assert_eq!(cleaned, 1);
        assert!(!stale.exists());
        assert!(unrelated.exists());

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_sweep_missing_root() {
        assert_eq!(
            sweep_stale_workspaces(&test_root("missing"), Duration::ZERO).unwrap(),
            0
        );
    }
}
