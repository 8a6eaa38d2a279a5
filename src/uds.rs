//! HTTP/1 client over unix domain sockets.
//!
//! Used by the daemon to reach supervisors and by the CLI to reach the daemon.
//! Every call opens a fresh connection.

use crate::protocol::ErrorBody;
use axum::http::{Method, Request, Response, StatusCode, header};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes, Incoming};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use std::io;
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;

#[derive(Debug, thiserror::Error)]
pub enum UdsError {
    #[error("failed to connect to {}: {source}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
    #[error("invalid request: {0}")]
    Request(#[from] axum::http::Error),
    #[error("{status}: {message}")]
    Status { status: StatusCode, message: String },
    #[error("invalid response body: {0}")]
    Json(#[from] serde_json::Error),
}

impl UdsError {
    /// True when nothing answered on the socket.
    pub fn is_connect(&self) -> bool {
        matches!(self, UdsError::Connect { .. })
    }
}

/// Sends `request` and returns the response with its body still streaming.
pub async fn send<B>(socket: &Path, request: Request<B>) -> Result<Response<Incoming>, UdsError>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let stream = UnixStream::connect(socket)
        .await
        .map_err(|source| UdsError::Connect {
            path: socket.to_path_buf(),
            source,
        })?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!("connection closed: {e}");
        }
    });
    Ok(sender.send_request(request).await?)
}

/// Sends a request with an optional JSON body and collects the response.
pub async fn request(
    socket: &Path,
    method: Method,
    uri: &str,
    body: Option<&serde_json::Value>,
) -> Result<(StatusCode, Bytes), UdsError> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::HOST, "localhost");
    let payload = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Bytes::from(serde_json::to_vec(value)?)
        }
        None => Bytes::new(),
    };
    let response = send(socket, builder.body(Full::new(payload))?).await?;
    let status = response.status();
    let bytes = response.into_body().collect().await?.to_bytes();
    Ok((status, bytes))
}

/// Like [`request`], but non-2xx responses become [`UdsError::Status`].
pub async fn expect_success(
    socket: &Path,
    method: Method,
    uri: &str,
    body: Option<&serde_json::Value>,
) -> Result<Bytes, UdsError> {
    let (status, bytes) = request(socket, method, uri, body).await?;
    if !status.is_success() {
        return Err(UdsError::Status {
            status,
            message: error_message(&bytes),
        });
    }
    Ok(bytes)
}

pub async fn get_json<T: DeserializeOwned>(socket: &Path, uri: &str) -> Result<T, UdsError> {
    let bytes = expect_success(socket, Method::GET, uri, None).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub async fn post(socket: &Path, uri: &str) -> Result<(), UdsError> {
    expect_success(socket, Method::POST, uri, None).await?;
    Ok(())
}

/// Pulls the message out of a `{"error": ...}` body, falling back to the raw text.
pub fn error_message(bytes: &[u8]) -> String {
    match serde_json::from_slice::<ErrorBody>(bytes) {
        Ok(body) => body.error,
        Err(_) => String::from_utf8_lossy(bytes).trim().to_string(),
    }
}
