//! Server-side modifications applied to the project file before compiling.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use gamehost_core::error::JobError;
use tokio_util::sync::CancellationToken;

/// How to modify the project file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceAugmentation {
    /// Include these files before and after the original contents.
    Includes {
        prepend: Vec<String>,
        append: Vec<String>,
    },
    /// Replace the project file entirely.
    Override(String),
}

#[async_trait]
pub trait SourceAugmentationProvider: Send + Sync {
    /// Copy modification files into `dest` and describe how `source_file`
    /// should be changed. `None` leaves it untouched.
    async fn copy_source_augmentations(
        &self,
        source_file: &str,
        dest: &Path,
        token: &CancellationToken,
    ) -> Result<Option<SourceAugmentation>, JobError>;
}

/// File included before the project file's contents.
pub const HEAD_INCLUDE: &str = "HeadInclude.dm";
/// File included after the project file's contents.
pub const TAIL_INCLUDE: &str = "TailInclude.dm";

/// Reads modifications from a directory of files.
///
/// Everything in the directory is copied into the build. A file named like
/// the project file overrides it; otherwise [`HEAD_INCLUDE`] and
/// [`TAIL_INCLUDE`] are included around it when present.
pub struct CodeModificationsDir {
    dir: Option<PathBuf>,
}

impl CodeModificationsDir {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl SourceAugmentationProvider for CodeModificationsDir {
    async fn copy_source_augmentations(
        &self,
        source_file: &str,
        dest: &Path,
        token: &CancellationToken,
    ) -> Result<Option<SourceAugmentation>, JobError> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        if !tokio::fs::try_exists(dir).await? {
            return Ok(None);
        }
        if token.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let override_path = dir.join(source_file);
        if tokio::fs::try_exists(&override_path).await? {
            crate::fs::copy_dir(dir, dest, &[source_file]).await?;
            let contents = tokio::fs::read_to_string(&override_path).await?;
            return Ok(Some(SourceAugmentation::Override(contents)));
        }

        crate::fs::copy_dir(dir, dest, &[]).await?;
        let mut prepend = Vec::new();
        let mut append = Vec::new();
        if tokio::fs::try_exists(dir.join(HEAD_INCLUDE)).await? {
            prepend.push(HEAD_INCLUDE.to_string());
        }
        if tokio::fs::try_exists(dir.join(TAIL_INCLUDE)).await? {
            append.push(TAIL_INCLUDE.to_string());
        }
        if prepend.is_empty() && append.is_empty() {
            return Ok(None);
        }
        Ok(Some(SourceAugmentation::Includes { prepend, append }))
    }
}
