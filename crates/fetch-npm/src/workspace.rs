//! Per-attempt temp workspaces.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::error::Result;

/// Directory under the temp root that holds every workspace.
const ISOLATION_DIR: &str = "fetch-npm-isolated";

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A uniquely named directory that removes itself when dropped.
///
/// Removal runs on a detached task and is not part of any operation's
/// completion: callers never wait for it and failures are only logged.
#[derive(Debug)]
pub struct TempWorkspace {
    root: PathBuf,
}

impl TempWorkspace {
    /// Create `<temp_root>/fetch-npm-isolated/<pid>/<dir_name>/<millis>-<seq>`.
    pub async fn create(temp_root: &Path, dir_name: &str) -> Result<Self> {
        let root = temp_root
            .join(ISOLATION_DIR)
            .join(std::process::id().to_string())
            .join(dir_name)
            .join(format!(
                "{}-{}",
                chrono::Utc::now().timestamp_millis(),
                SEQUENCE.fetch_add(1, Ordering::Relaxed)
            ));

        tokio::fs::create_dir_all(&root).await?;
        debug!("Created workspace {}", root.display());

        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Create and return a subdirectory.
    pub async fn subdir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.root.join(name);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Where the extracted package lives.
    pub fn package_dir(&self) -> PathBuf {
        self.root.join("package")
    }
}

impl Drop for TempWorkspace {
    fn drop(&mut self) {
        let root = std::mem::take(&mut self.root);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = tokio::fs::remove_dir_all(&root).await {
                        debug!("Ignoring cleanup failure for {}: {}", root.display(), e);
                    }
                });
            }
            Err(_) => {
                if let Err(e) = std::fs::remove_dir_all(&root) {
                    debug!("Ignoring cleanup failure for {}: {}", root.display(), e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_workspaces_are_unique_and_removed() {
        let temp = tempfile::tempdir().unwrap();

        let a = TempWorkspace::create(temp.path(), "left-pad-1.3.0").await.unwrap();
        let b = TempWorkspace::create(temp.path(), "left-pad-1.3.0").await.unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.path().starts_with(temp.path().join(ISOLATION_DIR)));
        assert!(a.path().to_string_lossy().contains("left-pad-1.3.0"));

        let sub = a.subdir("http").await.unwrap();
        std::fs::write(sub.join("x.tgz"), b"x").unwrap();

        let a_path = a.path().to_path_buf();
        drop(a);
        for _ in 0..50 {
            if !a_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!a_path.exists());
        assert!(b.path().exists());
    }

    #[test]
    fn test_drop_outside_runtime_removes_synchronously() {
        let temp = tempfile::tempdir().unwrap();
        let ws = tokio_test::block_on(TempWorkspace::create(temp.path(), "pkg")).unwrap();
        let path = ws.path().to_path_buf();

        drop(ws);
        assert!(!path.exists());
    }
}
