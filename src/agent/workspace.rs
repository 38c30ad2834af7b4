use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use uuid::Uuid;

/// A fresh directory scoped to one job attempt.
///
/// [`Workspace::remove`] deletes it; if that never happens (task aborted,
/// panic) the directory is removed on drop instead.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    removed: bool,
}

impl Workspace {
    pub async fn create(root: &Path, job_id: Uuid, attempt: u32) -> io::Result<Self> {
        let path = root.join(format!("job-{}-{}", job_id.simple(), attempt));
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&path).await?;
        }
        tokio::fs::create_dir_all(&path).await?;
        // Writable by whatever uid the sandbox runs the command as.
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o777)).await?;
        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn remove(mut self) -> io::Result<()> {
        self.removed = true;
        match tokio::fs::remove_dir_all(&self.path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.removed {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove workspace");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_remove() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::create(root.path(), Uuid::new_v4(), 1).await.unwrap();
        let path = ws.path().to_path_buf();
        tokio::fs::write(path.join("out.txt"), b"x").await.unwrap();
        ws.remove().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn dropped_workspace_is_cleaned_up() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let ws = Workspace::create(root.path(), Uuid::new_v4(), 1).await.unwrap();
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
