//! Remote sources: listing and fetching files into staging
//!
//! Supports multiple backends:
//! - HTTP directory index pages - requires `http` feature
//! - SFTP through the OpenSSH client
//! - A local or mounted directory
//!
//! # Feature Flags
//!
//! - `http`: Enables the HTTP backend (on by default)

#[cfg(feature = "http")]
mod http;
mod local;
mod sftp;

#[cfg(feature = "http")]
pub use http::HttpSource;
pub use local::LocalDirSource;
pub use sftp::SftpSource;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::config::{RemoteConfig, TransportConfig};
use crate::error::{RelayError, Result};
use crate::types::RelativePath;

/// A location files are fetched from
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Human readable location for logs
    fn describe(&self) -> String;

    /// List every file whose name matches `name_filter`.
    ///
    /// An empty listing is not an error.
    async fn find(&self, name_filter: Option<&Regex>) -> Result<Vec<RelativePath>>;

    /// Fetch one file to `path` under `staging_root`, returning the local path
    async fn download(&self, path: &RelativePath, staging_root: &Path) -> Result<PathBuf>;
}

/// Bounded attempts with a fixed delay in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    pub fn from_config(config: &RemoteConfig) -> Self {
        Self::new(config.retries, config.retry_delay())
    }

    /// Run `op` until it succeeds or the attempts are used up.
    ///
    /// Invalid paths and config errors are returned at once. On exhaustion
    /// the last error is returned.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e @ (RelayError::InvalidPath(_) | RelayError::Config(_))) => return Err(e),
                Err(e) if attempt >= self.attempts => {
                    tracing::warn!(what, attempts = attempt, error = %e, "giving up");
                    return Err(e);
                }
                Err(e) => {
                    tracing::debug!(
                        what,
                        attempt,
                        of = self.attempts,
                        error = %e,
                        "attempt failed, retrying in {:?}",
                        self.delay
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Apply the optional name filter to the file name of `path`.
///
/// Filters built by [`compile_name_filter`](crate::config::compile_name_filter)
/// only match at the start of the name.
pub fn matches_filter(name_filter: Option<&Regex>, path: &RelativePath) -> bool {
    name_filter.map_or(true, |re| re.is_match(path.file_name()))
}

/// Temporary sibling a download is written to before it is renamed into place
pub(crate) fn part_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    target.with_file_name(name)
}

/// Move a finished `.part` file onto its final name
pub(crate) async fn finish_part(part: &Path, target: &Path) -> Result<()> {
    tokio::fs::rename(part, target).await?;
    Ok(())
}

/// Remove a leftover `.part` file, ignoring absence
pub(crate) async fn discard_part(part: &Path) {
    if let Err(e) = tokio::fs::remove_file(part).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!(path = %part.display(), error = %e, "could not remove partial download");
        }
    }
}

/// Build the configured source
pub fn from_config(config: &RemoteConfig) -> Result<Box<dyn RemoteSource>> {
    let retry = RetryPolicy::from_config(config);
    let source: Box<dyn RemoteSource> = match &config.transport {
        #[cfg(feature = "http")]
        TransportConfig::Http { url } => Box::new(HttpSource::new(url, config.timeout(), retry)?),
        #[cfg(not(feature = "http"))]
        TransportConfig::Http { .. } => {
            return Err(RelayError::Config(
                "http source requires the `http` feature".to_string(),
            ))
        }
        TransportConfig::Sftp {
            host,
            port,
            user,
            root,
            identity_file,
            ..
        } => Box::new(
            SftpSource::new(host.clone(), *port, user.clone(), root.clone(), retry)
                .with_identity_file(identity_file.clone())
                .with_connect_timeout(config.timeout_secs)
                .with_password(config.transport.sftp_password()?)?,
        ),
        TransportConfig::Local { path } => Box::new(LocalDirSource::new(path.clone(), retry)),
    };
    tracing::info!(source = %source.describe(), "remote source configured");
    Ok(source)
}
