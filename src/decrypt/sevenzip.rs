//! Password protected 7z archives through the `7z` program

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use super::{tool_failure, Decryptor};
use crate::error::{RelayError, Result};

const SUFFIXES: &[&str] = &[".7z"];

/// Directory inside the scratch dir the archive is unpacked into first
const UNPACK_DIR: &str = ".unpack";

/// Unpacks `.7z` archives.
///
/// An archive holding exactly one file named like the archive without its
/// suffix yields that file; anything else yields a directory of that name.
pub struct SevenZipDecryptor {
    passphrase: String,
    command: String,
}

impl SevenZipDecryptor {
    pub fn new(passphrase: String) -> Self {
        Self {
            passphrase,
            command: "7z".to_string(),
        }
    }

    pub fn with_command(mut self, command: Option<String>) -> Self {
        if let Some(command) = command {
            self.command = command;
        }
        self
    }
}

/// Turn the unpacked tree into the final artifact named `name`
pub(crate) fn settle_unpacked(unpacked: &Path, scratch_dir: &Path, name: &str) -> Result<PathBuf> {
    let entries: Vec<_> = std::fs::read_dir(unpacked)?.collect::<std::io::Result<_>>()?;
    let target = scratch_dir.join(name);

    if let [only] = entries.as_slice() {
        if only.file_name().to_string_lossy() == name && only.file_type()?.is_file() {
            std::fs::rename(only.path(), &target)?;
            std::fs::remove_dir(unpacked)?;
            return Ok(target);
        }
    }
    if entries.is_empty() {
        return Err(RelayError::Decrypt(format!("archive for {} is empty", name)));
    }
    std::fs::rename(unpacked, &target)?;
    Ok(target)
}

impl Decryptor for SevenZipDecryptor {
    fn name(&self) -> &str {
        "7z"
    }

    fn suffixes(&self) -> &[&'static str] {
        SUFFIXES
    }

    fn transform(&self, source: &Path, scratch_dir: &Path) -> Result<PathBuf> {
        let name = self.artifact_name(source)?;
        let unpacked = scratch_dir.join(UNPACK_DIR);
        std::fs::create_dir_all(&unpacked)?;
        tracing::debug!(source = %source.display(), "unpacking");

        let result = Command::new(&self.command)
            .arg("x")
            .arg("-y")
            .arg(format!("-p{}", self.passphrase))
            .arg(format!("-o{}", unpacked.display()))
            .arg(source)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| RelayError::Decrypt(format!("failed to execute {}: {}", self.command, e)))?;

        if !result.status.success() {
            return Err(tool_failure(&self.command, &result));
        }
        settle_unpacked(&unpacked, scratch_dir, &name)
    }
}
