//! HTTP directory-index source
//!
//! Crawls the `<a href>` links of index pages as served by common web
//! servers. Links ending in `/` are directories; everything else is a file.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::AsyncWriteExt;

use super::{discard_part, finish_part, matches_filter, part_path, RemoteSource, RetryPolicy};
use crate::error::{RelayError, Result};
use crate::types::RelativePath;

/// Directory levels below the root that are still crawled
const MAX_DEPTH: usize = 32;

static HREF_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<a\s[^>]*?href\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#).unwrap()
});

/// Links in an index page, split into sub-directories and files.
///
/// `dir` is the listed directory relative to the root ("" for the root).
/// External, absolute, parent, query and fragment-only links are skipped.
pub fn parse_index(html: &str, dir: &str) -> (Vec<String>, Vec<RelativePath>) {
    let mut dirs = Vec::new();
    let mut files = Vec::new();

    for caps in HREF_PATTERN.captures_iter(html) {
        let Some(raw) = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)) else {
            continue;
        };
        let href = raw.as_str().trim();
        if !is_relative_link(href) {
            continue;
        }
        let href = href.split(['#', '?']).next().unwrap_or_default();
        let Ok(decoded) = urlencoding::decode(href) else {
            continue;
        };
        if decoded.is_empty() || decoded == "./" {
            continue;
        }

        let joined = if dir.is_empty() {
            decoded.to_string()
        } else {
            format!("{}/{}", dir, decoded)
        };
        let Ok(path) = RelativePath::new(&joined) else {
            continue;
        };
        if decoded.ends_with('/') {
            dirs.push(path.as_str().to_string());
        } else {
            files.push(path);
        }
    }
    (dirs, files)
}

fn is_relative_link(href: &str) -> bool {
    const SKIP: &[&str] = &["mailto:", "tel:", "javascript:", "data:"];
    let lower = href.to_ascii_lowercase();
    !(href.is_empty()
        || lower.contains("://")
        || SKIP.iter().any(|s| lower.starts_with(s))
        || href.starts_with('/')
        || href.starts_with('?')
        || href.starts_with('#')
        || href.starts_with(".."))
}

/// Files below an HTTP(S) directory index
pub struct HttpSource {
    client: reqwest::Client,
    root: String,
    /// Total deadline for index pages
    index_timeout: Duration,
    retry: RetryPolicy,
}

impl HttpSource {
    /// `timeout` bounds connecting and each read. File bodies have no total
    /// deadline as long as data keeps arriving; index pages do.
    pub fn new(url: &str, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            root: format!("{}/", url.trim_end_matches('/')),
            index_timeout: timeout,
            retry,
        })
    }

    fn url_for(&self, relative: &str, trailing_slash: bool) -> String {
        let encoded: Vec<String> = relative
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| urlencoding::encode(s).into_owned())
            .collect();
        let mut url = format!("{}{}", self.root, encoded.join("/"));
        if trailing_slash && !encoded.is_empty() {
            url.push('/');
        }
        url
    }

    async fn fetch_index(&self, dir: &str) -> Result<String> {
        let url = self.url_for(dir, true);
        let response = self
            .client
            .get(&url)
            .timeout(self.index_timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RelayError::Transport(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }
        Ok(response.text().await?)
    }

    async fn fetch_file(&self, path: &RelativePath, target: &Path) -> Result<()> {
        let url = self.url_for(path.as_str(), false);
        let mut response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(RelayError::Transport(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }

        let part = part_path(target);
        let result = async {
            let mut file = tokio::fs::File::create(&part).await?;
            while let Some(chunk) = response.chunk().await? {
                file.write_all(&chunk).await?;
            }
            file.sync_all().await?;
            finish_part(&part, target).await
        }
        .await;
        if result.is_err() {
            discard_part(&part).await;
        }
        result
    }
}

#[async_trait]
impl RemoteSource for HttpSource {
    fn describe(&self) -> String {
        self.root.clone()
    }

    async fn find(&self, name_filter: Option<&Regex>) -> Result<Vec<RelativePath>> {
        let root_page = self
            .retry
            .run("http listing", || self.fetch_index(""))
            .await
            .map_err(|_| RelayError::ListingFailed {
                location: self.root.clone(),
                attempts: self.retry.attempts,
            })?;

        let mut found = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();

        let (dirs, files) = parse_index(&root_page, "");
        found.extend(files);
        queue.extend(dirs.into_iter().map(|d| (d, 1)));

        while let Some((dir, depth)) = queue.pop_front() {
            if depth > MAX_DEPTH || !visited.insert(dir.clone()) {
                continue;
            }
            match self.fetch_index(&dir).await {
                Ok(page) => {
                    let (dirs, files) = parse_index(&page, &dir);
                    found.extend(files);
                    queue.extend(dirs.into_iter().map(|d| (d, depth + 1)));
                }
                Err(e) => {
                    tracing::warn!(dir = %dir, error = %e, "skipping unreadable directory");
                }
            }
        }

        found.retain(|p| matches_filter(name_filter, p));
        found.sort();
        found.dedup();
        tracing::debug!(source = %self.root, count = found.len(), "listed remote files");
        Ok(found)
    }

    async fn download(&self, path: &RelativePath, staging_root: &Path) -> Result<PathBuf> {
        let target = path.under(staging_root);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tracing::debug!(path = %path, target = %target.display(), "downloading");
        self.retry
            .run("http download", || self.fetch_file(path, &target))
            .await
            .map_err(|_| RelayError::DownloadFailed {
                path: path.to_string(),
                attempts: self.retry.attempts,
            })?;
        Ok(target)
    }
}
