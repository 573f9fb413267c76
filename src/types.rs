//! Core types for filerelay

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// A file location relative to the root shared by the remote source,
/// the staging directory and the destination tree.
///
/// Always `/`-separated, never empty, never absolute and never contains `..`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelativePath(String);

impl RelativePath {
    /// Normalize and validate a raw path
    pub fn new(raw: impl AsRef<str>) -> Result<Self> {
        let raw = raw.as_ref();
        let mut segments = Vec::new();
        for segment in raw.split(['/', '\\']) {
            match segment {
                "" | "." => continue,
                ".." => {
                    return Err(RelayError::InvalidPath(format!(
                        "parent segment in '{}'",
                        raw
                    )))
                }
                s if s.contains('\0') => {
                    return Err(RelayError::InvalidPath(format!("NUL byte in '{}'", raw)))
                }
                s => segments.push(s),
            }
        }
        if segments.is_empty() {
            return Err(RelayError::InvalidPath(format!("empty path '{}'", raw)));
        }
        Ok(Self(segments.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Everything before the last segment, if any
    pub fn parent(&self) -> Option<&str> {
        self.0.rsplit_once('/').map(|(parent, _)| parent)
    }

    /// Number of segments
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Resolve under a local root directory
    pub fn under(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for segment in self.segments() {
            path.push(segment);
        }
        path
    }

    /// Case-insensitive check for one of the given suffixes (with leading dot)
    pub fn has_suffix(&self, suffixes: &[&str]) -> bool {
        let name = self.file_name().to_ascii_lowercase();
        suffixes
            .iter()
            .any(|s| name.len() > s.len() && name.ends_with(&s.to_ascii_lowercase()))
    }

    /// Drop a trailing suffix (case-insensitive). Returns `None` when the
    /// suffix is absent or nothing would remain of the file name.
    pub fn strip_suffix(&self, suffix: &str) -> Option<RelativePath> {
        if !self.has_suffix(&[suffix]) {
            return None;
        }
        let stripped = &self.0[..self.0.len() - suffix.len()];
        RelativePath::new(stripped).ok()
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RelativePath {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for RelativePath {
    type Error = RelayError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<RelativePath> for String {
    fn from(path: RelativePath) -> Self {
        path.0
    }
}

impl AsRef<str> for RelativePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle position of a tracked file.
///
/// A file that was never downloaded, or whose record was purged, has no
/// record at all and therefore no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Staged locally, not yet in the destination
    Downloaded,
    /// Copied or decrypted into the destination
    Forwarded,
    /// Staged copy removed under file retention
    LocallyDeleted,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Downloaded => write!(f, "downloaded"),
            Lifecycle::Forwarded => write!(f, "forwarded"),
            Lifecycle::LocallyDeleted => write!(f, "deleted"),
        }
    }
}

impl FromStr for Lifecycle {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "downloaded" | "pending" => Ok(Lifecycle::Downloaded),
            "forwarded" => Ok(Lifecycle::Forwarded),
            "deleted" | "locally_deleted" => Ok(Lifecycle::LocallyDeleted),
            other => Err(RelayError::Config(format!(
                "unknown lifecycle state '{}'",
                other
            ))),
        }
    }
}

/// One record of the tracking store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedFile {
    pub relative_path: RelativePath,
    pub download_time: DateTime<Utc>,
    pub forward_time: Option<DateTime<Utc>>,
    pub delete_time: Option<DateTime<Utc>>,
}

impl TrackedFile {
    pub fn lifecycle(&self) -> Lifecycle {
        match (self.forward_time, self.delete_time) {
            (None, _) => Lifecycle::Downloaded,
            (Some(_), None) => Lifecycle::Forwarded,
            (Some(_), Some(_)) => Lifecycle::LocallyDeleted,
        }
    }
}

/// Stages of one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickStage {
    Idle,
    Discovering,
    Downloading,
    Forwarding,
    Cleaning,
}

impl fmt::Display for TickStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TickStage::Idle => "idle",
            TickStage::Discovering => "discovering",
            TickStage::Downloading => "downloading",
            TickStage::Forwarding => "forwarding",
            TickStage::Cleaning => "cleaning",
        };
        f.write_str(name)
    }
}

/// Outcome of one tick
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// New remote paths found by discovery
    pub discovered: usize,
    pub downloaded: usize,
    pub download_failures: usize,
    pub forwarded: usize,
    /// Destination already existed
    pub conflicts: usize,
    pub forward_failures: usize,
    /// Forward stage skipped by the wait policy
    pub forward_skipped: bool,
    pub trigger_written: bool,
    pub files_removed: usize,
    pub removal_failures: usize,
    pub records_purged: usize,
    /// Non-fatal stage failures
    pub stage_errors: Vec<String>,
    pub duration_ms: u64,
}

impl TickReport {
    /// True when the tick changed nothing
    pub fn is_idle(&self) -> bool {
        self.downloaded == 0
            && self.forwarded == 0
            && self.files_removed == 0
            && self.records_purged == 0
    }
}

/// Record counts per lifecycle state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total: i64,
    pub pending: i64,
    pub forwarded: i64,
    pub locally_deleted: i64,
    pub oldest_download: Option<DateTime<Utc>>,
    pub newest_download: Option<DateTime<Utc>>,
}

/// Host/user/process identity written into trigger files
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub host: String,
    pub user: String,
    pub pid: u32,
}

impl Identity {
    /// Identity of the running process
    pub fn current() -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            host,
            user,
            pid: std::process::id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path_normalization() {
        let p = RelativePath::new("/exports//2024/./a.txt").unwrap();
        assert_eq!(p.as_str(), "exports/2024/a.txt");
        assert_eq!(p.file_name(), "a.txt");
        assert_eq!(p.parent(), Some("exports/2024"));
        assert_eq!(p.depth(), 3);

        let windows = RelativePath::new("dir\\sub\\b.bin").unwrap();
        assert_eq!(windows.as_str(), "dir/sub/b.bin");

        let flat = RelativePath::new("a.txt").unwrap();
        assert_eq!(flat.parent(), None);
    }

    #[test]
    fn test_relative_path_rejects_traversal() {
        assert!(RelativePath::new("../etc/passwd").is_err());
        assert!(RelativePath::new("a/../../b").is_err());
        assert!(RelativePath::new("").is_err());
        assert!(RelativePath::new("/").is_err());
        assert!(RelativePath::new("./.").is_err());
    }

    #[test]
    fn test_relative_path_under_root() {
        let p = RelativePath::new("x/y/z.dat").unwrap();
        let root = Path::new("/srv/staging");
        assert_eq!(p.under(root), PathBuf::from("/srv/staging/x/y/z.dat"));
    }

    #[test]
    fn test_suffix_handling() {
        let p = RelativePath::new("in/report.CSV.PGP").unwrap();
        assert!(p.has_suffix(&[".pgp", ".gpg"]));
        assert_eq!(p.strip_suffix(".pgp").unwrap().as_str(), "in/report.CSV");

        let bare = RelativePath::new("in/.pgp").unwrap();
        assert!(!bare.has_suffix(&[".pgp"]));
        assert!(bare.strip_suffix(".pgp").is_none());
    }

    #[test]
    fn test_serde_roundtrip_validates() {
        let ok: RelativePath = serde_json::from_str("\"a/b.txt\"").unwrap();
        assert_eq!(ok.as_str(), "a/b.txt");
        assert!(serde_json::from_str::<RelativePath>("\"../x\"").is_err());
    }

    #[test]
    fn test_lifecycle_from_times() {
        let now = Utc::now();
        let mut file = TrackedFile {
            relative_path: RelativePath::new("a.txt").unwrap(),
            download_time: now,
            forward_time: None,
            delete_time: None,
        };
        assert_eq!(file.lifecycle(), Lifecycle::Downloaded);
        file.forward_time = Some(now);
        assert_eq!(file.lifecycle(), Lifecycle::Forwarded);
        file.delete_time = Some(now);
        assert_eq!(file.lifecycle(), Lifecycle::LocallyDeleted);
    }

    #[test]
    fn test_tick_stage_labels() {
        let labels: Vec<String> = [
            TickStage::Discovering,
            TickStage::Downloading,
            TickStage::Forwarding,
            TickStage::Cleaning,
            TickStage::Idle,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(
            labels,
            ["discovering", "downloading", "forwarding", "cleaning", "idle"]
        );
        assert_eq!(serde_json::to_string(&TickStage::Idle).unwrap(), "\"idle\"");
    }

    #[test]
    fn test_lifecycle_parse() {
        assert_eq!("pending".parse::<Lifecycle>().unwrap(), Lifecycle::Downloaded);
        assert_eq!("Deleted".parse::<Lifecycle>().unwrap(), Lifecycle::LocallyDeleted);
        assert!("purged".parse::<Lifecycle>().is_err());
    }
}
