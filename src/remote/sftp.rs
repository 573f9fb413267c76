//! SFTP source driven through the OpenSSH client
//!
//! Listing runs `find` over `ssh`; downloads run `sftp -b -` with a one-line
//! batch. Without a password both run in batch mode, so key-based auth must
//! be set up. With a password, OpenSSH reads it from a private askpass helper
//! that echoes it from the child's environment.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use regex::Regex;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{discard_part, finish_part, matches_filter, part_path, RemoteSource, RetryPolicy};
use crate::error::{RelayError, Result};
use crate::types::RelativePath;

/// Files below a directory on an SSH server
pub struct SftpSource {
    host: String,
    port: u16,
    user: Option<String>,
    /// Remote root, relative to the login directory unless absolute
    root: String,
    identity_file: Option<PathBuf>,
    connect_timeout: u64,
    askpass: Option<Askpass>,
    retry: RetryPolicy,
}

/// Environment variable the askpass helper reads the password from
const PASSWORD_VAR: &str = "FILERELAY_SFTP_PASSWORD";

/// Password plus the helper script that hands it to OpenSSH
struct Askpass {
    _dir: TempDir,
    script: PathBuf,
    password: String,
}

impl Askpass {
    #[cfg(unix)]
    fn new(password: String) -> Result<Self> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::Builder::new().prefix("filerelay-askpass-").tempdir()?;
        let script = dir.path().join("askpass.sh");
        std::fs::write(
            &script,
            format!("#!/bin/sh\nprintf '%s\\n' \"${}\"\n", PASSWORD_VAR),
        )?;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o700))?;
        Ok(Self {
            _dir: dir,
            script,
            password,
        })
    }

    #[cfg(not(unix))]
    fn new(_password: String) -> Result<Self> {
        Err(RelayError::Config(
            "sftp password authentication needs a unix host".to_string(),
        ))
    }
}

impl SftpSource {
    pub fn new(
        host: String,
        port: u16,
        user: Option<String>,
        root: String,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            host,
            port,
            user,
            root,
            identity_file: None,
            connect_timeout: 30,
            askpass: None,
            retry,
        }
    }

    pub fn with_identity_file(mut self, identity_file: Option<PathBuf>) -> Self {
        self.identity_file = identity_file;
        self
    }

    /// Authenticate with a password instead of keys only
    pub fn with_password(mut self, password: Option<String>) -> Result<Self> {
        self.askpass = password.map(Askpass::new).transpose()?;
        Ok(self)
    }

    pub fn with_connect_timeout(mut self, seconds: u64) -> Self {
        self.connect_timeout = seconds.max(1);
        self
    }

    fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    /// Options shared by `ssh` and `sftp`
    fn ssh_options(&self) -> Vec<String> {
        let mut settings = vec![
            format!("ConnectTimeout={}", self.connect_timeout),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if self.askpass.is_some() {
            settings.push("BatchMode=no".to_string());
            settings.push("PreferredAuthentications=password,keyboard-interactive".to_string());
            settings.push("NumberOfPasswordPrompts=1".to_string());
        } else {
            settings.push("BatchMode=yes".to_string());
        }

        let mut opts = Vec::new();
        for setting in settings {
            opts.push("-o".to_string());
            opts.push(setting);
        }
        if let Some(identity) = &self.identity_file {
            opts.push("-i".to_string());
            opts.push(identity.to_string_lossy().into_owned());
        }
        opts
    }

    /// `program` with the shared options and, for password auth, the askpass
    /// environment
    fn command(&self, program: &str) -> Command {
        let mut command = Command::new(program);
        command.args(self.ssh_options());
        if let Some(askpass) = &self.askpass {
            command
                .env("SSH_ASKPASS", &askpass.script)
                .env("SSH_ASKPASS_REQUIRE", "force")
                .env("DISPLAY", std::env::var("DISPLAY").unwrap_or_else(|_| ":0".to_string()))
                .env(PASSWORD_VAR, &askpass.password);
        }
        command
    }

    fn list_command(&self) -> String {
        format!(
            "cd {} && find . -type f -print",
            shell_words::quote(&self.root)
        )
    }

    fn remote_path(&self, path: &RelativePath) -> String {
        let root = self.root.trim_end_matches('/');
        if root.is_empty() || root == "." {
            path.to_string()
        } else {
            format!("{}/{}", root, path)
        }
    }

    async fn list_once(&self) -> Result<String> {
        let output = self
            .command("ssh")
            .arg("-p")
            .arg(self.port.to_string())
            .arg("--")
            .arg(self.destination())
            .arg(self.list_command())
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| RelayError::Transport(format!("failed to execute ssh: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RelayError::Transport(format!(
                "remote listing failed: {}",
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn get_once(&self, path: &RelativePath, target: &Path) -> Result<()> {
        let part = part_path(target);
        let batch = format!(
            "get {} {}\n",
            shell_words::quote(&self.remote_path(path)),
            shell_words::quote(&part.to_string_lossy())
        );

        let mut child = self
            .command("sftp")
            .arg("-P")
            .arg(self.port.to_string())
            .arg("-b")
            .arg("-")
            .arg(self.destination())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RelayError::Transport(format!("failed to execute sftp: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(batch.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;

        if !output.status.success() {
            discard_part(&part).await;
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RelayError::Transport(format!(
                "sftp get {} failed: {}",
                path,
                stderr.trim()
            )));
        }
        finish_part(&part, target).await
    }
}

/// Parse `find . -type f` output into relative paths, skipping unusable lines
pub fn parse_find_output(stdout: &str) -> Vec<RelativePath> {
    stdout
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .filter_map(|line| match RelativePath::new(line) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::debug!(line, error = %e, "ignoring remote entry");
                None
            }
        })
        .collect()
}

#[async_trait]
impl RemoteSource for SftpSource {
    fn describe(&self) -> String {
        format!("sftp://{}:{}/{}", self.destination(), self.port, self.root)
    }

    async fn find(&self, name_filter: Option<&Regex>) -> Result<Vec<RelativePath>> {
        let stdout = self
            .retry
            .run("sftp listing", || self.list_once())
            .await
            .map_err(|_| RelayError::ListingFailed {
                location: self.describe(),
                attempts: self.retry.attempts,
            })?;

        let mut found: Vec<RelativePath> = parse_find_output(&stdout)
            .into_iter()
            .filter(|p| matches_filter(name_filter, p))
            .collect();
        found.sort();
        found.dedup();
        Ok(found)
    }

    async fn download(&self, path: &RelativePath, staging_root: &Path) -> Result<PathBuf> {
        let target = path.under(staging_root);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tracing::debug!(path = %path, target = %target.display(), "downloading");
        self.retry
            .run("sftp download", || self.get_once(path, &target))
            .await
            .map_err(|_| RelayError::DownloadFailed {
                path: path.to_string(),
                attempts: self.retry.attempts,
            })?;
        Ok(target)
    }
}
