//! Client transport - establishes a connection to a remote
//! `scratchpush serve` instance.
//!
//! Provides raw stdin/stdout streams. Protocol handling is done by the
//! client operations in `crate::client`.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};

/// Where the remote server runs.
#[derive(Debug, Clone, Default)]
pub struct SshTarget {
    pub hostname: String,
    pub user: Option<String>,
    pub port: Option<u16>,
}

/// Manages a connection to a remote serve process.
pub struct ClientSession {
    #[allow(dead_code)]
    child: Child,
    stdin: tokio::process::ChildStdin,
    stdout: tokio::process::ChildStdout,
}

impl ClientSession {
    /// Connect to a remote server via SSH.
    pub async fn connect_ssh(
        target: &SshTarget,
        config_path: &Path,
        remote_path: &Path,
    ) -> Result<Self> {
        let mut cmd = Command::new("ssh");

        cmd.arg(&target.hostname);

        if let Some(user) = &target.user {
            cmd.arg("-l").arg(user);
        }
        if let Some(port) = target.port {
            cmd.arg("-p").arg(port.to_string());
        }

        // Remote command: scratchpush serve --config <config> <path>
        cmd.arg("scratchpush");
        cmd.arg("serve");
        cmd.arg("--config").arg(config_path);
        cmd.arg(remote_path);

        Self::spawn(cmd, "SSH")
    }

    /// Connect to a local server process (for testing).
    pub async fn connect_local(config_path: &Path, remote_path: &Path) -> Result<Self> {
        let exe = std::env::current_exe()?;
        let mut cmd = Command::new(exe);
        cmd.arg("serve");
        cmd.arg("--config").arg(config_path);
        cmd.arg(remote_path);

        Self::spawn(cmd, "scratchpush")
    }

    fn spawn(mut cmd: Command, what: &str) -> Result<Self> {
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {} process", what))?;

        let stdin = child.stdin.take().context("Failed to open stdin")?;
        let stdout = child.stdout.take().context("Failed to open stdout")?;

        Ok(Self {
            child,
            stdin,
            stdout,
        })
    }

    /// Split into stdin/stdout for protocol handling.
    pub fn split(self) -> (tokio::process::ChildStdin, tokio::process::ChildStdout) {
        (self.stdin, self.stdout)
    }
}
