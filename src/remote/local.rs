//! Local or mounted directory source

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::Regex;
use walkdir::WalkDir;

use super::{discard_part, finish_part, matches_filter, part_path, RemoteSource, RetryPolicy};
use crate::error::{RelayError, Result};
use crate::types::RelativePath;

/// Files below a directory reachable through the local filesystem
pub struct LocalDirSource {
    root: PathBuf,
    retry: RetryPolicy,
}

impl LocalDirSource {
    pub fn new(root: PathBuf, retry: RetryPolicy) -> Self {
        Self { root, retry }
    }

    fn list_once(&self) -> Result<Vec<RelativePath>> {
        if !self.root.is_dir() {
            return Err(RelayError::Transport(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }

        let mut found = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            match RelativePath::new(relative.to_string_lossy()) {
                Ok(path) => found.push(path),
                Err(e) => tracing::debug!(error = %e, "ignoring entry"),
            }
        }
        Ok(found)
    }

    async fn copy_once(&self, path: &RelativePath, target: &Path) -> Result<()> {
        let source = path.under(&self.root);
        let part = part_path(target);
        if let Err(e) = tokio::fs::copy(&source, &part).await {
            discard_part(&part).await;
            return Err(e.into());
        }
        finish_part(&part, target).await
    }
}

#[async_trait]
impl RemoteSource for LocalDirSource {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    async fn find(&self, name_filter: Option<&Regex>) -> Result<Vec<RelativePath>> {
        let listed = self
            .retry
            .run("directory listing", || async { self.list_once() })
            .await
            .map_err(|_| RelayError::ListingFailed {
                location: self.describe(),
                attempts: self.retry.attempts,
            })?;

        let mut found: Vec<RelativePath> = listed
            .into_iter()
            .filter(|p| matches_filter(name_filter, p))
            .collect();
        found.sort();
        Ok(found)
    }

    async fn download(&self, path: &RelativePath, staging_root: &Path) -> Result<PathBuf> {
        let target = path.under(staging_root);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.retry
            .run("copy", || self.copy_once(path, &target))
            .await
            .map_err(|_| RelayError::DownloadFailed {
                path: path.to_string(),
                attempts: self.retry.attempts,
            })?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn quick() -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_find_and_download() {
        let remote = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        std::fs::create_dir_all(remote.path().join("2024/q1")).unwrap();
        std::fs::write(remote.path().join("top.txt"), b"top").unwrap();
        std::fs::write(remote.path().join("2024/q1/data.pgp"), b"cipher").unwrap();

        let source = LocalDirSource::new(remote.path().to_path_buf(), quick());
        let all = source.find(None).await.unwrap();
        let names: Vec<&str> = all.iter().map(|p| p.as_str()).collect();
        assert_eq!(names, vec!["2024/q1/data.pgp", "top.txt"]);

        let filter = Regex::new(r"\.pgp$").unwrap();
        assert_eq!(source.find(Some(&filter)).await.unwrap().len(), 1);

        let local = source.download(&all[0], staging.path()).await.unwrap();
        assert_eq!(local, staging.path().join("2024/q1/data.pgp"));
        assert_eq!(std::fs::read(&local).unwrap(), b"cipher");
        assert!(!part_path(&local).exists());
    }

    #[tokio::test]
    async fn test_empty_listing_is_ok() {
        let remote = TempDir::new().unwrap();
        let source = LocalDirSource::new(remote.path().to_path_buf(), quick());
        assert!(source.find(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_distinguishable() {
        let staging = TempDir::new().unwrap();
        let source = LocalDirSource::new(PathBuf::from("/nonexistent/filerelay/root"), quick());

        let err = source.find(None).await.unwrap_err();
        assert!(matches!(err, RelayError::ListingFailed { attempts: 2, .. }));

        let path = RelativePath::new("missing.txt").unwrap();
        let err = source.download(&path, staging.path()).await.unwrap_err();
        assert!(matches!(err, RelayError::DownloadFailed { .. }));
        assert!(!staging.path().join("missing.txt").exists());
    }
}
