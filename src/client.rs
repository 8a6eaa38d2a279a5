use crate::paths::Paths;
use crate::pid;
use crate::protocol::Pong;
use crate::uds;
use axum::http::{Method, Request, StatusCode, header};
use color_eyre::eyre::{Context, bail};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use serde::de::DeserializeOwned;
use std::os::unix::process::CommandExt;
use std::time::Duration;

const STARTUP_POLL_ATTEMPTS: u32 = 50;
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Sends one request to the daemon, starting it first if needed. Non-2xx
/// responses become errors carrying the daemon's message.
pub async fn send_request(
    paths: &Paths,
    method: Method,
    uri: &str,
    body: Option<&serde_json::Value>,
) -> color_eyre::Result<(StatusCode, Bytes)> {
    ensure_daemon_running(paths).await?;
    let (status, bytes) = uds::request(&paths.daemon_socket(), method, uri, body).await?;
    if !status.is_success() {
        bail!("{}", uds::error_message(&bytes));
    }
    Ok((status, bytes))
}

pub async fn get_json<T: DeserializeOwned>(paths: &Paths, uri: &str) -> color_eyre::Result<T> {
    let (_, bytes) = send_request(paths, Method::GET, uri, None).await?;
    serde_json::from_slice(&bytes).context("invalid response from daemon")
}

/// Follows a server-sent event stream, calling `on_line` with each `data:`
/// payload until the server closes it.
pub async fn stream_events(
    paths: &Paths,
    uri: &str,
    mut on_line: impl FnMut(&str),
) -> color_eyre::Result<()> {
    ensure_daemon_running(paths).await?;
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header(header::HOST, "localhost")
        .header(header::ACCEPT, "text/event-stream")
        .body(Empty::<Bytes>::new())?;
    let response = uds::send(&paths.daemon_socket(), request).await?;

    let status = response.status();
    let mut body = response.into_body();
    if !status.is_success() {
        let bytes = body.collect().await?.to_bytes();
        bail!("{}", uds::error_message(&bytes));
    }

    let mut pending = String::new();
    while let Some(frame) = body.frame().await {
        let Ok(data) = frame?.into_data() else {
            continue;
        };
        pending.push_str(&String::from_utf8_lossy(&data));
        while let Some(pos) = pending.find('\n') {
            let line: String = pending.drain(..=pos).collect();
            if let Some(payload) = sse_data(&line) {
                on_line(payload);
            }
        }
    }
    Ok(())
}

/// Payload of an SSE `data:` line; other fields and keep-alives yield `None`.
pub fn sse_data(line: &str) -> Option<&str> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let line = line.strip_suffix('\r').unwrap_or(line);
    let data = line.strip_prefix("data:")?;
    Some(data.strip_prefix(' ').unwrap_or(data))
}

// ---------------------------------------------------------------------------
// Daemon bootstrap
// ---------------------------------------------------------------------------

async fn daemon_answers(paths: &Paths) -> bool {
    uds::get_json::<Pong>(&paths.daemon_socket(), "/ping")
        .await
        .is_ok_and(|pong| pong.pong)
}

pub async fn ensure_daemon_running(paths: &Paths) -> color_eyre::Result<()> {
    if pid::is_daemon_running(paths)? && daemon_answers(paths).await {
        return Ok(());
    }

    spawn_daemon()?;

    for _ in 0..STARTUP_POLL_ATTEMPTS {
        if daemon_answers(paths).await {
            return Ok(());
        }
        tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
    }

    bail!("timed out waiting for daemon to start");
}

fn spawn_daemon() -> color_eyre::Result<()> {
    let exe = std::env::current_exe().context("failed to get current executable path")?;

    std::process::Command::new(exe)
        .arg("daemon")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .process_group(0)
        .spawn()
        .context("failed to spawn daemon")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_data_strips_field_name() {
        assert_eq!(sse_data("data: hello\n"), Some("hello"));
        assert_eq!(sse_data("data:hello\r\n"), Some("hello"));
        assert_eq!(sse_data("data:  indented"), Some(" indented"));
    }

    #[test]
    fn test_sse_data_ignores_other_fields() {
        assert_eq!(sse_data(":\n"), None);
        assert_eq!(sse_data("event: ping\n"), None);
        assert_eq!(sse_data("\n"), None);
    }
}
