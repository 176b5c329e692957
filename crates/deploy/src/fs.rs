//! Filesystem helpers for build directories.

use std::io;
use std::path::{Path, PathBuf};

/// Recursively copy `src` into `dst`, skipping top-level entries named in `skip`.
///
/// `dst` is created if missing. Symlinks are copied as the files they point to.
pub async fn copy_dir(src: &Path, dst: &Path, skip: &[&str]) -> io::Result<()> {
    let mut pending: Vec<(PathBuf, PathBuf, bool)> = vec![(src.to_path_buf(), dst.to_path_buf(), true)];

    while let Some((from, to, top_level)) = pending.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if top_level && name.to_str().is_some_and(|n| skip.contains(&n)) {
                continue;
            }
            let target = to.join(&name);
            if tokio::fs::metadata(entry.path()).await?.is_dir() {
                pending.push((entry.path(), target, false));
            } else {
                tokio::fs::copy(entry.path(), &target).await?;
            }
        }
    }
    Ok(())
}

/// Link every entry of `static_dir` into `dest`, replacing what is there.
pub async fn link_static_files(static_dir: &Path, dest: &Path) -> io::Result<usize> {
    let mut linked = 0;
    let mut entries = tokio::fs::read_dir(static_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let target = dest.join(entry.file_name());
        remove_path(&target).await?;
        let is_dir = entry.file_type().await?.is_dir();
        symlink(&entry.path(), &target, is_dir).await?;
        linked += 1;
    }
    Ok(linked)
}

/// Remove a directory tree, logging instead of failing.
pub async fn remove_dir_best_effort(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed directory"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove directory"),
    }
}

async fn remove_path(path: &Path) -> io::Result<()> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}

#[cfg(unix)]
async fn symlink(original: &Path, link: &Path, _is_dir: bool) -> io::Result<()> {
    tokio::fs::symlink(original, link).await
}

#[cfg(windows)]
async fn symlink(original: &Path, link: &Path, is_dir: bool) -> io::Result<()> {
    if is_dir {
        tokio::fs::symlink_dir(original, link).await
    } else {
        tokio::fs::symlink_file(original, link).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copies_nested_tree_and_skips_top_level_names() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("code/modules")).unwrap();
        std::fs::create_dir_all(src.path().join(".git")).unwrap();
        std::fs::write(src.path().join("game.dme"), "#include \"code/a.dm\"").unwrap();
        std::fs::write(src.path().join("code/modules/a.dm"), "/proc/a()").unwrap();
        std::fs::write(src.path().join(".git/HEAD"), "ref: refs/heads/main").unwrap();

        copy_dir(src.path(), &dst.path().join("A"), &[".git"]).await.unwrap();

        let copied = dst.path().join("A");
        assert!(copied.join("game.dme").is_file());
        assert_eq!(
            std::fs::read_to_string(copied.join("code/modules/a.dm")).unwrap(),
            "/proc/a()"
        );
        assert!(!copied.join(".git").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn static_files_are_linked_over_existing_entries() {
        let static_dir = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        std::fs::create_dir(static_dir.path().join("config")).unwrap();
        std::fs::write(static_dir.path().join("config/game.txt"), "MAX_PLAYERS 80").unwrap();
        std::fs::create_dir(dest.path().join("config")).unwrap();

        assert_eq!(link_static_files(static_dir.path(), dest.path()).await.unwrap(), 1);
        let link = dest.path().join("config");
        assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(
            std::fs::read_to_string(link.join("game.txt")).unwrap(),
            "MAX_PLAYERS 80"
        );
    }

    #[tokio::test]
    async fn removing_a_missing_directory_is_silent() {
        let root = tempfile::tempdir().unwrap();
        remove_dir_best_effort(&root.path().join("missing")).await;
    }
}
