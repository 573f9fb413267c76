//! Symmetric PGP decryption through `gpg`

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use super::{tool_failure, Decryptor};
use crate::error::{RelayError, Result};

const SUFFIXES: &[&str] = &[".pgp", ".gpg"];

/// Decrypts `.pgp`/`.gpg` files with a passphrase
pub struct PgpDecryptor {
    passphrase: String,
    command: String,
}

impl PgpDecryptor {
    pub fn new(passphrase: String) -> Self {
        Self {
            passphrase,
            command: "gpg".to_string(),
        }
    }

    pub fn with_command(mut self, command: Option<String>) -> Self {
        if let Some(command) = command {
            self.command = command;
        }
        self
    }

    fn args(output: &Path, source: &Path) -> Vec<String> {
        vec![
            "--batch".to_string(),
            "--yes".to_string(),
            "--quiet".to_string(),
            "--pinentry-mode".to_string(),
            "loopback".to_string(),
            "--passphrase-fd".to_string(),
            "0".to_string(),
            "--output".to_string(),
            output.to_string_lossy().into_owned(),
            "--decrypt".to_string(),
            source.to_string_lossy().into_owned(),
        ]
    }
}

impl Decryptor for PgpDecryptor {
    fn name(&self) -> &str {
        "pgp"
    }

    fn suffixes(&self) -> &[&'static str] {
        SUFFIXES
    }

    fn transform(&self, source: &Path, scratch_dir: &Path) -> Result<PathBuf> {
        let output = scratch_dir.join(self.artifact_name(source)?);
        tracing::debug!(source = %source.display(), output = %output.display(), "decrypting");

        // passphrase goes through stdin, never argv
        let mut child = Command::new(&self.command)
            .args(Self::args(&output, source))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RelayError::Decrypt(format!("failed to execute {}: {}", self.command, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(self.passphrase.as_bytes())?;
            stdin.write_all(b"\n")?;
        }
        let result = child.wait_with_output()?;

        if !result.status.success() {
            return Err(tool_failure(&self.command, &result));
        }
        if !output.is_file() {
            return Err(RelayError::Decrypt(format!(
                "{} produced no output for {}",
                self.command,
                source.display()
            )));
        }
        Ok(output)
    }
}
