//! tmux pane adapter
//!
//! All interaction with the multiplexer goes through the tmux CLI via
//! `tokio::process`. A capture or send failure on a vanished pane surfaces
//! as [`PaneError::PaneGone`], which the owning monitor treats as terminal.

use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Errors surfaced by pane operations.
#[derive(Debug, thiserror::Error)]
pub enum PaneError {
    /// The pane or its session no longer exists
    #[error("pane gone: {0}")]
    PaneGone(String),
    #[error("tmux failed: {0}")]
    Tmux(String),
}

/// The two operations a monitor needs from its pane.
#[async_trait]
pub trait PaneAdapter: Send + Sync {
    /// Return the last `max_lines` lines of scrollback, oldest first.
    async fn capture_recent(&self, max_lines: usize) -> Result<Vec<String>, PaneError>;

    /// Deliver keystrokes into the pane, optionally followed by Enter.
    async fn send(&self, text: &str, press_enter: bool) -> Result<(), PaneError>;

    /// Send an interrupt (Ctrl-C). Best effort; used by undo.
    async fn interrupt(&self) -> Result<(), PaneError>;
}

/// Shared tmux invoker.
#[derive(Debug, Clone)]
pub struct TmuxClient {
    tmux_path: String,
}

impl Default for TmuxClient {
    fn default() -> Self {
        Self::new()
    }
}

impl TmuxClient {
    pub fn new() -> Self {
        Self {
            tmux_path: "tmux".to_string(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new(&self.tmux_path)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to execute tmux {}", args.join(" ")))
    }

    /// Check if a tmux server is reachable at all.
    pub async fn is_server_running(&self) -> bool {
        Command::new(&self.tmux_path)
            .arg("list-sessions")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// List session names currently known to the server.
    pub async fn list_sessions(&self) -> Result<Vec<String>> {
        let output = self
            .run(&["list-sessions", "-F", "#{session_name}"])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("no server running") || stderr.contains("no sessions") {
                return Ok(Vec::new());
            }
            anyhow::bail!("tmux list-sessions failed: {stderr}");
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }

    /// Create a detached session rooted at `working_dir`; returns
    /// `(pane_id, pane_pid)` of its single pane.
    pub async fn create_session(
        &self,
        name: &str,
        working_dir: &str,
    ) -> Result<(String, Option<i64>)> {
        let output = self
            .run(&["new-session", "-d", "-s", name, "-c", working_dir])
            .await?;
        if !output.status.success() {
            anyhow::bail!(
                "failed to create tmux session: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        self.pane_info(name).await
    }

    /// Look up `(pane_id, pane_pid)` for a session's active pane.
    pub async fn pane_info(&self, session: &str) -> Result<(String, Option<i64>)> {
        let output = self
            .run(&[
                "display-message",
                "-p",
                "-t",
                session,
                "#{pane_id}|#{pane_pid}",
            ])
            .await?;
        if !output.status.success() {
            anyhow::bail!(
                "tmux display-message failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        let line = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let mut parts = line.split('|');
        let pane_id = parts.next().unwrap_or_default().to_string();
        let pid = parts.next().and_then(|p| p.parse().ok());
        Ok((pane_id, pid))
    }

    /// Current working directory of a session's active pane.
    pub async fn pane_current_path(&self, session: &str) -> Result<String> {
        let output = self
            .run(&["display-message", "-p", "-t", session, "#{pane_current_path}"])
            .await?;
        if !output.status.success() {
            anyhow::bail!(
                "tmux display-message failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn kill_session(&self, name: &str) -> Result<()> {
        let output = self.run(&["kill-session", "-t", name]).await?;
        if !output.status.success() {
            anyhow::bail!(
                "failed to kill tmux session: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    /// Deliver a signal through `kill(1)`. `signal` is e.g. "STOP",
    /// "CONT", or "0" for a liveness probe.
    pub async fn signal_pid(&self, pid: i64, signal: &str) -> Result<bool> {
        let status = Command::new("kill")
            .arg(format!("-{signal}"))
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .context("failed to execute kill")?;
        Ok(status.success())
    }

    /// Is the process still alive? Signal 0 probes without delivering.
    pub async fn is_pid_alive(&self, pid: i64) -> bool {
        self.signal_pid(pid, "0").await.unwrap_or(false)
    }
}

/// A single addressable pane, identified by its tmux pane id.
#[derive(Debug, Clone)]
pub struct TmuxPane {
    client: TmuxClient,
    pane_id: String,
}

impl TmuxPane {
    pub fn new(client: TmuxClient, pane_id: &str) -> Self {
        Self {
            client,
            pane_id: pane_id.to_string(),
        }
    }

    pub fn pane_id(&self) -> &str {
        &self.pane_id
    }
}

#[async_trait]
impl PaneAdapter for TmuxPane {
    async fn capture_recent(&self, max_lines: usize) -> Result<Vec<String>, PaneError> {
        let start = format!("-{max_lines}");
        let output = self
            .client
            .run(&[
                "capture-pane",
                "-p",
                "-t",
                &self.pane_id,
                "-S",
                &start,
                "-E",
                "-",
            ])
            .await
            .map_err(|e| PaneError::Tmux(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(pane = %self.pane_id, error = %stderr, "capture-pane failed");
            return Err(PaneError::PaneGone(self.pane_id.clone()));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }

    async fn send(&self, text: &str, press_enter: bool) -> Result<(), PaneError> {
        // -l sends the text literally so tmux key names in user input are
        // not interpreted.
        let mut args = vec!["send-keys", "-t", self.pane_id.as_str(), "-l", text];
        if text.is_empty() {
            args = vec!["send-keys", "-t", self.pane_id.as_str()];
        }
        let output = self
            .client
            .run(&args)
            .await
            .map_err(|e| PaneError::Tmux(e.to_string()))?;
        if !output.status.success() {
            return Err(PaneError::PaneGone(self.pane_id.clone()));
        }
        if press_enter {
            let output = self
                .client
                .run(&["send-keys", "-t", &self.pane_id, "Enter"])
                .await
                .map_err(|e| PaneError::Tmux(e.to_string()))?;
            if !output.status.success() {
                return Err(PaneError::PaneGone(self.pane_id.clone()));
            }
        }
        Ok(())
    }

    async fn interrupt(&self) -> Result<(), PaneError> {
        let output = self
            .client
            .run(&["send-keys", "-t", &self.pane_id, "C-c"])
            .await
            .map_err(|e| PaneError::Tmux(e.to_string()))?;
        if !output.status.success() {
            return Err(PaneError::PaneGone(self.pane_id.clone()));
        }
        Ok(())
    }
}
