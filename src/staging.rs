//! Local staging area and forwarding into the destination tree
//!
//! Staging mirrors the remote hierarchy. Forwarding never overwrites an
//! existing destination file: copies are linked into place with no-clobber
//! semantics, so a file appears in the destination complete or not at all.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::decrypt::Decryptor;
use crate::error::{RelayError, Result};
use crate::types::{Identity, RelativePath};

const TEMP_PREFIX: &str = ".filerelay-";

/// Temporary entries older than this were left behind by a killed process
const STALE_TEMP_AGE: Duration = Duration::from_secs(15 * 60);

/// Staging directory, destination tree and trigger file
pub struct LocalStaging {
    staging_root: PathBuf,
    destination_root: PathBuf,
    trigger_path: Option<PathBuf>,
    decryptor: Option<Box<dyn Decryptor>>,
}

impl LocalStaging {
    pub fn new(staging_root: impl Into<PathBuf>, destination_root: impl Into<PathBuf>) -> Self {
        Self {
            staging_root: staging_root.into(),
            destination_root: destination_root.into(),
            trigger_path: None,
            decryptor: None,
        }
    }

    pub fn with_trigger(mut self, trigger_path: Option<PathBuf>) -> Self {
        self.trigger_path = trigger_path;
        self
    }

    pub fn with_decryptor(mut self, decryptor: Option<Box<dyn Decryptor>>) -> Self {
        self.decryptor = decryptor;
        self
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    pub fn destination_root(&self) -> &Path {
        &self.destination_root
    }

    pub fn staged_path(&self, path: &RelativePath) -> PathBuf {
        path.under(&self.staging_root)
    }

    /// Where forwarding `path` lands, after any decryptor suffix stripping
    pub fn destination_path(&self, path: &RelativePath) -> Result<PathBuf> {
        let relative = match &self.decryptor {
            Some(decryptor) if decryptor.accepts(path) => {
                decryptor.output_path(path).ok_or_else(|| {
                    RelayError::InvalidPath(format!("{} has nothing left after its suffix", path))
                })?
            }
            _ => path.clone(),
        };
        Ok(relative.under(&self.destination_root))
    }

    /// Create the staging directories needed to hold `path`
    pub fn ensure_staging_dir(&self, path: &RelativePath) -> Result<PathBuf> {
        let dir = self
            .staged_path(path)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.staging_root.clone());
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Advisory presence check used before purging a record
    pub fn exists_in_staging(&self, path: &RelativePath) -> bool {
        fs::symlink_metadata(self.staged_path(path)).is_ok()
    }

    pub fn destination_root_exists(&self) -> bool {
        self.destination_root.exists()
    }

    /// Copy or decrypt a staged file into the destination tree.
    ///
    /// Fails with [`RelayError::Conflict`] without writing anything when the
    /// destination already exists. The staged file is left in place.
    pub fn forward(&self, path: &RelativePath) -> Result<PathBuf> {
        let source = self.staged_path(path);
        if !source.is_file() {
            return Err(RelayError::NotStaged(source));
        }

        let destination = self.destination_path(path)?;
        if fs::symlink_metadata(&destination).is_ok() {
            return Err(RelayError::Conflict(destination));
        }
        let parent = parent_dir(&destination)?;
        fs::create_dir_all(parent)?;
        sweep_stale_temps(parent);

        match &self.decryptor {
            Some(decryptor) if decryptor.accepts(path) => {
                self.decrypt_into_place(&**decryptor, &source, &destination)?;
                tracing::info!(
                    path = %path,
                    decryptor = decryptor.name(),
                    destination = %destination.display(),
                    "decrypted into destination"
                );
            }
            _ => {
                copy_into_place(&source, &destination)?;
                tracing::info!(path = %path, destination = %destination.display(), "copied into destination");
            }
        }
        Ok(destination)
    }

    fn decrypt_into_place(
        &self,
        decryptor: &dyn Decryptor,
        source: &Path,
        destination: &Path,
    ) -> Result<()> {
        let scratch = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempdir_in(parent_dir(destination)?)?;
        let artifact = decryptor.transform(source, scratch.path())?;
        place_no_clobber(&artifact, destination)
    }

    /// Write the trigger file. Returns `false` when no trigger is configured.
    pub fn write_trigger(&self, identity: &Identity) -> Result<bool> {
        let Some(trigger) = &self.trigger_path else {
            return Ok(false);
        };
        let dir = match trigger.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let content = format!(
            "host={}\nuser={}\npid={}\ntime={}\n",
            identity.host,
            identity.user,
            identity.pid,
            Utc::now().to_rfc3339()
        );
        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(trigger).map_err(|e| RelayError::Io(e.error))?;

        tracing::info!(trigger = %trigger.display(), "trigger written");
        Ok(true)
    }

    /// Delete the staged copy of `path`
    pub fn remove_staged_file(&self, path: &RelativePath) -> Result<()> {
        let staged = self.staged_path(path);
        match fs::remove_file(&staged) {
            Ok(()) => {
                tracing::debug!(path = %path, "removed staged file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(RelayError::NotStaged(staged)),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove empty directories below the staging root, deepest first.
    ///
    /// The root itself is kept. Failures are logged and skipped. Returns the
    /// number of directories removed.
    pub fn prune_empty_directories(&self) -> usize {
        let mut dirs: Vec<(usize, PathBuf)> = WalkDir::new(&self.staging_root)
            .min_depth(1)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) if entry.file_type().is_dir() => Some((entry.depth(), entry.into_path())),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "cannot inspect staging entry");
                    None
                }
            })
            .collect();
        dirs.sort_by(|a, b| b.0.cmp(&a.0));

        let mut removed = 0;
        for (_, dir) in dirs {
            let is_empty = match fs::read_dir(&dir) {
                Ok(mut entries) => entries.next().is_none(),
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "cannot read directory");
                    continue;
                }
            };
            if !is_empty {
                continue;
            }
            match fs::remove_dir(&dir) {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "cannot remove empty directory")
                }
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "pruned empty staging directories");
        }
        removed
    }
}

fn parent_dir(path: &Path) -> Result<&Path> {
    path.parent()
        .ok_or_else(|| RelayError::InvalidPath(format!("{} has no parent", path.display())))
}

/// Byte copy through a synced temp file, linked into place only if the
/// destination is still free
fn copy_into_place(source: &Path, destination: &Path) -> Result<()> {
    let mut input = File::open(source)?;
    let expected = input.metadata()?.len();

    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(parent_dir(destination)?)?;
    let (copied, source_digest) = copy_hashing(&mut input, tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;
    if copied != expected {
        return Err(RelayError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "copied {} of {} bytes from {}",
                copied,
                expected,
                source.display()
            ),
        )));
    }

    verify_digest(&source_digest, tmp.path())?;

    tmp.persist_noclobber(destination).map_err(|e| {
        if e.error.kind() == io::ErrorKind::AlreadyExists {
            RelayError::Conflict(destination.to_path_buf())
        } else {
            RelayError::Io(e.error)
        }
    })?;
    sync_dir(parent_dir(destination)?);
    Ok(())
}

/// Copy `input` to `output`, returning the byte count and the SHA-256 of
/// what was read
fn copy_hashing(input: &mut impl Read, output: &mut impl Write) -> io::Result<(u64, String)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        output.write_all(&buf[..n])?;
        total += n as u64;
    }
    Ok((total, hex::encode(hasher.finalize())))
}

/// Hex SHA-256 of a file's content
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let (_, digest) = copy_hashing(&mut file, &mut io::sink())?;
    Ok(digest)
}

/// Re-read `copy` and compare it with the digest of its source
fn verify_digest(expected: &str, copy: &Path) -> Result<()> {
    let actual = sha256_file(copy)?;
    if actual != expected {
        return Err(RelayError::Verification(format!(
            "{} has sha256 {}, source had {}",
            copy.display(),
            actual,
            expected
        )));
    }
    Ok(())
}

/// Remove temporary entries a killed process left in `dir`. Returns the
/// number removed.
fn sweep_stale_temps(dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        if !entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
            continue;
        }
        let stale = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .map_or(false, |age| age >= STALE_TEMP_AGE);
        if !stale {
            continue;
        }

        let path = entry.path();
        let result = if entry.file_type().map_or(false, |t| t.is_dir()) {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => {
                removed += 1;
                tracing::info!(path = %path.display(), "removed stale temporary entry");
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot remove stale temporary entry")
            }
        }
    }
    removed
}

/// Move a finished artifact to `destination` without replacing anything there
fn place_no_clobber(artifact: &Path, destination: &Path) -> Result<()> {
    if artifact.is_file() {
        File::open(artifact)?.sync_all()?;
        match fs::hard_link(artifact, destination) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(RelayError::Conflict(destination.to_path_buf()))
            }
            Err(e) => {
                tracing::debug!(error = %e, "hard link unavailable, renaming");
                rename_if_absent(artifact, destination)?;
            }
        }
    } else {
        rename_if_absent(artifact, destination)?;
    }
    sync_dir(parent_dir(destination)?);
    Ok(())
}

fn rename_if_absent(from: &Path, to: &Path) -> Result<()> {
    if fs::symlink_metadata(to).is_ok() {
        return Err(RelayError::Conflict(to.to_path_buf()));
    }
    fs::rename(from, to)?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        tracing::debug!(dir = %dir.display(), error = %e, "directory sync failed");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
