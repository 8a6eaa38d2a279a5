use crate::config::AppConfig;
use crate::usage::TreeUsage;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Deserializer, Serialize};

// ---------------------------------------------------------------------------
// Status payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupervisorState {
    Starting,
    Online,
    Stopping,
    Stopped,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorState::Starting => write!(f, "starting"),
            SupervisorState::Online => write!(f, "online"),
            SupervisorState::Stopping => write!(f, "stopping"),
            SupervisorState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub online: bool,
    /// Sent a graceful signal and expected to exit.
    pub draining: bool,
    pub uptime: u64,
    pub listening: Vec<String>,
    #[serde(flatten)]
    pub usage: TreeUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStatus {
    pub pid: u32,
    pub uptime: u64,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub mem: u64,
    pub status: SupervisorState,
    pub worker_count: usize,
    pub online_count: usize,
    pub death_count: u64,
    pub kill_count: u64,
    pub reloading: bool,
    pub workers: Vec<WorkerStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppInfo {
    pub id: String,
    pub config: AppConfig,
    pub status: Option<SupervisorStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub pong: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

// ---------------------------------------------------------------------------
// Query strings
// ---------------------------------------------------------------------------

/// Accepts `?force`, `?force=1`, `?force=true` and `?force=yes` as set.
pub fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(match raw.as_deref() {
        None => false,
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "" | "1" | "true" | "yes"),
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct StopQuery {
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub force: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReloadQuery {
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub instant: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddQuery {
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub create_only: bool,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub start: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub names_only: bool,
}

/// Renders a boolean query flag the way `deserialize_flag` reads it back.
pub fn flag_query(name: &str, value: bool) -> String {
    if value {
        format!("?{name}=true")
    } else {
        String::new()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}
