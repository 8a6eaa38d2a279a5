//! Readiness handshake between the daemon and a freshly spawned supervisor.
//!
//! The supervisor's stdout is the readiness pipe: once its pool is online it
//! writes a single JSON line and never touches stdout again.

use serde::{Deserialize, Serialize};
use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;

pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReadyMessage {
    Online,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed handshake message: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub fn encode(message: ReadyMessage) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(&message)?;
    line.push('\n');
    Ok(line)
}

pub fn decode(line: &str) -> Result<ReadyMessage, ProtocolError> {
    Ok(serde_json::from_str(line.trim())?)
}

/// Supervisor side: reports the pool online on stdout.
pub async fn announce_online() -> io::Result<()> {
    let line = encode(ReadyMessage::Online).map_err(io::Error::other)?;
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.flush().await
}

// ---------------------------------------------------------------------------
// Daemon side
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StartOutcome {
    Online,
    Exited(ExitStatus),
    Failed(io::Error),
    Unexpected(String),
    TimedOut,
}

impl std::fmt::Display for StartOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartOutcome::Online => write!(f, "online"),
            StartOutcome::Exited(status) => write!(f, "supervisor exited ({status})"),
            StartOutcome::Failed(e) => write!(f, "readiness pipe failed: {e}"),
            StartOutcome::Unexpected(line) => write!(f, "unexpected handshake message: {line}"),
            StartOutcome::TimedOut => write!(f, "timed out waiting for the app to come online"),
        }
    }
}

enum First {
    Line(io::Result<Option<String>>),
    Exit(io::Result<ExitStatus>),
}

/// Waits for the child's first handshake message, its exit, or `timeout`.
pub async fn await_online(child: &mut Child, timeout: Duration) -> StartOutcome {
    let Some(stdout) = child.stdout.take() else {
        return StartOutcome::Failed(io::Error::other("readiness pipe was not captured"));
    };
    let mut lines = BufReader::new(stdout).lines();

    let wait = async {
        let first = tokio::select! {
            line = lines.next_line() => First::Line(line),
            status = child.wait() => First::Exit(status),
        };
        match first {
            First::Line(Ok(Some(line))) => match decode(&line) {
                Ok(ReadyMessage::Online) => StartOutcome::Online,
                Err(_) => StartOutcome::Unexpected(line),
            },
            // Pipe closed without a message: the supervisor is on its way out
            First::Line(Ok(None)) => match child.wait().await {
                Ok(status) => StartOutcome::Exited(status),
                Err(e) => StartOutcome::Failed(e),
            },
            First::Line(Err(e)) => StartOutcome::Failed(e),
            First::Exit(Ok(status)) => StartOutcome::Exited(status),
            First::Exit(Err(e)) => StartOutcome::Failed(e),
        }
    };

    tokio::time::timeout(timeout, wait)
        .await
        .unwrap_or(StartOutcome::TimedOut)
}
