//! Source repository the compile copies from.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use gamehost_core::error::JobError;
use gamehost_core::types::DbId;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// The revision a build was compiled from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevisionInfo {
    /// Identifier assigned by the revision tracker; `0` when untracked.
    pub id: DbId,
    pub commit_sha: String,
}

impl RevisionInfo {
    /// First 7 characters of the commit, for messages.
    pub fn short_sha(&self) -> &str {
        self.commit_sha.get(..7).unwrap_or(&self.commit_sha)
    }
}

#[async_trait]
pub trait SourceRepository: Send + Sync {
    /// Revision currently checked out.
    async fn revision(&self) -> Result<RevisionInfo, JobError>;

    /// Copy the working tree (without VCS metadata) into `dest`.
    async fn copy_to(&self, dest: &Path, token: &CancellationToken) -> Result<(), JobError>;
}

/// A checked-out working tree on local disk.
pub struct LocalRepository {
    path: PathBuf,
    /// Fixed revision; `None` follows `.git/HEAD`.
    pinned: Option<RevisionInfo>,
}

impl LocalRepository {
    /// A working tree whose revision is known up front.
    pub fn new(path: impl Into<PathBuf>, revision: RevisionInfo) -> Self {
        Self {
            path: path.into(),
            pinned: Some(revision),
        }
    }

    /// A git working tree. The commit is read from `.git/HEAD` on every
    /// [`revision`](SourceRepository::revision) call.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pinned: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn read_head(path: &Path) -> std::io::Result<String> {
    let git_dir = path.join(".git");
    let head = match tokio::fs::read_to_string(git_dir.join("HEAD")).await {
        Ok(head) => head,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "Repository has no .git/HEAD");
            return Ok("unknown".to_string());
        }
        Err(e) => return Err(e),
    };
    let head = head.trim();
    match head.strip_prefix("ref: ") {
        Some(reference) => Ok(tokio::fs::read_to_string(git_dir.join(reference))
            .await?
            .trim()
            .to_string()),
        None => Ok(head.to_string()),
    }
}

#[async_trait]
impl SourceRepository for LocalRepository {
    async fn revision(&self) -> Result<RevisionInfo, JobError> {
        if let Some(revision) = &self.pinned {
            return Ok(revision.clone());
        }
        let commit_sha = read_head(&self.path).await?;
        Ok(RevisionInfo { id: 0, commit_sha })
    }

    async fn copy_to(&self, dest: &Path, token: &CancellationToken) -> Result<(), JobError> {
        tokio::select! {
            _ = token.cancelled() => Err(JobError::Cancelled),
            result = crate::fs::copy_dir(&self.path, dest, &[".git"]) => Ok(result?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn head_reference_is_resolved() {
        let repo = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(repo.path().join(".git/refs/heads")).unwrap();
        std::fs::write(repo.path().join(".git/HEAD"), "ref: refs/heads/master\n").unwrap();
        std::fs::write(
            repo.path().join(".git/refs/heads/master"),
            "0123456789abcdef0123456789abcdef01234567\n",
        )
        .unwrap();

        let local = LocalRepository::open(repo.path());
        let revision = local.revision().await.unwrap();
        assert_eq!(revision.commit_sha, "0123456789abcdef0123456789abcdef01234567");
        assert_eq!(revision.short_sha(), "0123456");
    }

    #[tokio::test]
    async fn copy_skips_git_metadata() {
        let repo = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(repo.path().join(".git")).unwrap();
        std::fs::write(repo.path().join(".git/HEAD"), "abc\n").unwrap();
        std::fs::write(repo.path().join("game.dme"), "").unwrap();

        let local = LocalRepository::open(repo.path());
        assert_eq!(local.revision().await.unwrap().short_sha(), "abc");
        local
            .copy_to(dest.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(dest.path().join("game.dme").exists());
        assert!(!dest.path().join(".git").exists());
    }

    #[tokio::test]
    async fn revision_follows_head() {
        let repo = tempfile::tempdir().unwrap();
        let local = LocalRepository::open(repo.path());
        assert_eq!(local.revision().await.unwrap().commit_sha, "unknown");

        std::fs::create_dir_all(repo.path().join(".git")).unwrap();
        std::fs::write(repo.path().join(".git/HEAD"), "feedbeef\n").unwrap();
        assert_eq!(local.revision().await.unwrap().commit_sha, "feedbeef");

        let pinned = LocalRepository::new(
            repo.path(),
            RevisionInfo {
                id: 4,
                commit_sha: "c0ffee".into(),
            },
        );
        assert_eq!(pinned.revision().await.unwrap().id, 4);
    }
}
