//! Decryption and unpacking of staged files
//!
//! Supports multiple backends:
//! - PGP/GPG symmetric encryption through the `gpg` program
//! - Password protected 7z archives through the `7z` program
//!
//! A decryptor writes its artifact into an empty scratch directory; staging
//! then moves it to the destination without clobbering anything.

mod pgp;
mod sevenzip;

pub use pgp::PgpDecryptor;
pub use sevenzip::SevenZipDecryptor;

use std::path::{Path, PathBuf};

use crate::config::DecryptConfig;
use crate::error::{RelayError, Result};
use crate::types::RelativePath;

/// Trait for decryptors applied while forwarding
pub trait Decryptor: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// File name suffixes handled, with leading dot
    fn suffixes(&self) -> &[&'static str];

    /// Whether forwarding `path` goes through this decryptor
    fn accepts(&self, path: &RelativePath) -> bool {
        path.has_suffix(self.suffixes())
    }

    /// Destination path of the artifact produced for `path`
    fn output_path(&self, path: &RelativePath) -> Option<RelativePath> {
        self.suffixes().iter().find_map(|s| path.strip_suffix(s))
    }

    /// Name of the artifact produced for the file at `source`
    fn artifact_name(&self, source: &Path) -> Result<String> {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let lower = name.to_ascii_lowercase();
        self.suffixes()
            .iter()
            .find(|s| lower.len() > s.len() && lower.ends_with(*s))
            .map(|s| name[..name.len() - s.len()].to_string())
            .ok_or_else(|| {
                RelayError::Decrypt(format!("{} has no {} suffix", source.display(), self.name()))
            })
    }

    /// Decrypt `source` into the empty directory `scratch_dir`, returning
    /// the produced file or directory
    fn transform(&self, source: &Path, scratch_dir: &Path) -> Result<PathBuf>;
}

/// Build the configured decryptor, if any
pub fn from_config(config: Option<&DecryptConfig>) -> Result<Option<Box<dyn Decryptor>>> {
    let Some(config) = config else {
        return Ok(None);
    };
    let settings = config.settings();
    let passphrase = settings.resolve_passphrase()?;
    let decryptor: Box<dyn Decryptor> = match config {
        DecryptConfig::Pgp(_) => {
            Box::new(PgpDecryptor::new(passphrase).with_command(settings.command.clone()))
        }
        DecryptConfig::Sevenzip(_) => {
            Box::new(SevenZipDecryptor::new(passphrase).with_command(settings.command.clone()))
        }
    };
    tracing::info!(decryptor = decryptor.name(), "decryption enabled");
    Ok(Some(decryptor))
}

/// Collect stderr of a failed tool run into an error
pub(crate) fn tool_failure(tool: &str, output: &std::process::Output) -> RelayError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    RelayError::Decrypt(format!(
        "{} exited with {}: {}",
        tool,
        output.status,
        stderr.trim()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecryptSettings;

    #[test]
    fn test_from_config() {
        assert!(from_config(None).unwrap().is_none());

        let config = DecryptConfig::Sevenzip(DecryptSettings {
            passphrase: Some("pw".to_string()),
            ..Default::default()
        });
        let decryptor = from_config(Some(&config)).unwrap().unwrap();
        assert_eq!(decryptor.name(), "7z");

        let missing = DecryptConfig::Pgp(DecryptSettings::default());
        assert!(from_config(Some(&missing)).is_err());
    }

    #[test]
    fn test_output_path_and_artifact_name() {
        let pgp = PgpDecryptor::new("pw".to_string());
        let path = RelativePath::new("in/Report.csv.GPG").unwrap();
        assert!(pgp.accepts(&path));
        assert_eq!(pgp.output_path(&path).unwrap().as_str(), "in/Report.csv");
        assert_eq!(
            pgp.artifact_name(Path::new("/stage/in/Report.csv.GPG")).unwrap(),
            "Report.csv"
        );
        assert!(pgp.artifact_name(Path::new("/stage/in/plain.txt")).is_err());
    }
}
