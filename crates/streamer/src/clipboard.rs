//! Clipboard bridge over the `xsel` CLI.
//!
//! Outbound (desktop → browser) is a 500 ms poll of the X selection;
//! inbound (browser → desktop) writes decoded `cw` payloads. Each CLI
//! invocation is bounded by a 3 second timeout; failures are logged and
//! the cycle skipped.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

const CLI_TIMEOUT: Duration = Duration::from_secs(3);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Which clipboard directions are allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipboardPolicy {
    Disabled,
    InboundOnly,
    OutboundOnly,
    Both,
}

impl ClipboardPolicy {
    /// `true` enables both directions; `in`/`out` one each.
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "true" => Self::Both,
            "in" => Self::InboundOnly,
            "out" => Self::OutboundOnly,
            _ => Self::Disabled,
        }
    }

    pub fn outbound_enabled(self) -> bool {
        matches!(self, Self::Both | Self::OutboundOnly)
    }

    pub fn inbound_enabled(self) -> bool {
        matches!(self, Self::Both | Self::InboundOnly)
    }
}

/// Strip terminal control characters that could execute commands when the
/// payload is pasted into a terminal. Tab, newline, and CR survive.
fn sanitize(text: &str) -> String {
    text.chars()
        .filter(|&c| c == '\t' || c == '\n' || c == '\r' || (c >= ' ' && c != '\x7f'))
        .collect()
}

#[derive(Clone)]
pub struct ClipboardBridge {
    display: Option<String>,
}

impl ClipboardBridge {
    pub fn new(display: Option<String>) -> Self {
        Self { display }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("xsel");
        if let Some(display) = &self.display {
            cmd.env("DISPLAY", display);
        }
        cmd
    }

    /// Read the X clipboard selection.
    pub async fn read(&self) -> Result<String> {
        let mut cmd = self.command();
        cmd.args(["--clipboard", "--output"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let output = tokio::time::timeout(CLI_TIMEOUT, cmd.output())
            .await
            .context("xsel read timed out")?
            .context("failed to run xsel")?;
        if !output.status.success() {
            bail!("xsel exited with {}", output.status);
        }
        String::from_utf8(output.stdout).context("clipboard content is not UTF-8")
    }

    /// Write text to the X clipboard selection.
    pub async fn write(&self, text: &str) -> Result<()> {
        let sanitized = sanitize(text);
        let mut cmd = self.command();
        cmd.args(["--clipboard", "--input"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut child = cmd.spawn().context("failed to spawn xsel")?;
        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(sanitized.as_bytes())
                .await
                .context("failed to write to xsel stdin")?;
        }
        drop(child.stdin.take());
        let status = tokio::time::timeout(CLI_TIMEOUT, child.wait())
            .await
            .context("xsel write timed out")?
            .context("failed to wait for xsel")?;
        if !status.success() {
            bail!("xsel exited with {status}");
        }
        info!(len = text.len(), "Clipboard content written");
        Ok(())
    }
}

/// Poll the selection and send changed contents until `stop` fires.
pub async fn run_outbound_poll(
    bridge: ClipboardBridge,
    tx: mpsc::Sender<String>,
    mut stop: watch::Receiver<bool>,
) {
    info!("Starting clipboard monitor");
    let mut last = String::new();
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
        match bridge.read().await {
            Ok(current) => {
                if !current.is_empty() && current != last {
                    info!(len = current.len(), "Clipboard changed, sending");
                    if tx.send(current.clone()).await.is_err() {
                        break;
                    }
                    last = current;
                }
            }
            Err(e) => warn!("Clipboard read failed: {e:#}"),
        }
    }
    info!("Clipboard monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_parse() {
        assert_eq!(ClipboardPolicy::parse("true"), ClipboardPolicy::Both);
        assert_eq!(ClipboardPolicy::parse("TRUE"), ClipboardPolicy::Both);
        assert_eq!(ClipboardPolicy::parse("in"), ClipboardPolicy::InboundOnly);
        assert_eq!(ClipboardPolicy::parse("out"), ClipboardPolicy::OutboundOnly);
        assert_eq!(ClipboardPolicy::parse("false"), ClipboardPolicy::Disabled);
        assert_eq!(ClipboardPolicy::parse("junk"), ClipboardPolicy::Disabled);
    }

    #[test]
    fn policy_directions() {
        assert!(ClipboardPolicy::Both.outbound_enabled());
        assert!(ClipboardPolicy::Both.inbound_enabled());
        assert!(ClipboardPolicy::OutboundOnly.outbound_enabled());
        assert!(!ClipboardPolicy::OutboundOnly.inbound_enabled());
        assert!(ClipboardPolicy::InboundOnly.inbound_enabled());
        assert!(!ClipboardPolicy::InboundOnly.outbound_enabled());
        assert!(!ClipboardPolicy::Disabled.inbound_enabled());
    }

    #[test]
    fn sanitize_strips_control_characters() {
        assert_eq!(sanitize("plain text"), "plain text");
        assert_eq!(sanitize("tab\tnewline\ncr\r"), "tab\tnewline\ncr\r");
        assert_eq!(sanitize("bell\x07escape\x1b[31m"), "bellescape[31m");
        assert_eq!(sanitize("del\x7f"), "del");
    }
}
