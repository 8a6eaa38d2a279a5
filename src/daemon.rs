use crate::config::{AppConfig, ConfigError};
use crate::paths::Paths;
use crate::pid::PidFile;
use crate::protocol::{AddQuery, ApiError, ListQuery, Pong, ReloadQuery, StopQuery};
use crate::registry::{AddOptions, AddOutcome, Registry};
use crate::sys;
use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::fs;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
pub struct DaemonState {
    pub registry: Arc<Registry>,
    pub shutdown: watch::Sender<bool>,
}

pub async fn run(paths: Paths) -> color_eyre::Result<()> {
    let registry = Registry::new(paths.clone())?;
    serve(paths, registry).await
}

/// Runs the control API until `POST /kill` or SIGINT/SIGTERM.
pub async fn serve(paths: Paths, registry: Registry) -> color_eyre::Result<()> {
    fs::create_dir_all(paths.apps_dir())?;

    let pid_file = PidFile::acquire(&paths)?;
    let listener = sys::bind_unix(&paths.daemon_socket()).await?;
    tracing::info!(pid = std::process::id(), base = %paths.base_dir().display(), "daemon started");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = DaemonState {
        registry: Arc::new(registry),
        shutdown: shutdown_tx,
    };

    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
        .await;

    // Apps keep running; their sockets outlive the daemon
    let _ = fs::remove_file(paths.daemon_socket());
    drop(pid_file);
    tracing::info!("daemon stopped");

    Ok(result?)
}

async fn wait_for_shutdown(mut shutdown_rx: watch::Receiver<bool>) {
    tokio::select! {
        _ = shutdown_rx.wait_for(|stop| *stop) => {}
        signal = sys::shutdown_signal() => {
            if let Ok(signal) = signal {
                tracing::info!("received {}", signal.as_str());
            }
        }
    }
}

pub fn router(state: DaemonState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/kill", post(kill))
        .route("/apps", get(list_apps))
        .route(
            "/apps/{id}",
            get(get_app).put(put_app).delete(delete_app),
        )
        .route("/apps/{id}/start", post(start_app))
        .route("/apps/{id}/stop", post(stop_app))
        .route("/apps/{id}/restart", post(restart_app))
        .route("/apps/{id}/reload", post(reload_app))
        .fallback(proxy)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn ping() -> Json<Pong> {
    Json(Pong { pong: true })
}

async fn kill(State(state): State<DaemonState>) -> StatusCode {
    tracing::info!("shutdown requested");
    let _ = state.shutdown.send(true);
    StatusCode::ACCEPTED
}

async fn list_apps(
    State(state): State<DaemonState>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    if query.names_only {
        return Ok(Json(state.registry.app_ids().await?).into_response());
    }
    Ok(Json(state.registry.list_apps().await?).into_response())
}

async fn get_app(
    State(state): State<DaemonState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    Ok(Json(state.registry.get_app(&id).await?).into_response())
}

async fn put_app(
    State(state): State<DaemonState>,
    Path(id): Path<String>,
    Query(query): Query<AddQuery>,
    Json(mut config): Json<AppConfig>,
) -> Result<StatusCode, ApiError> {
    if config.id.is_empty() {
        config.id = id.clone();
    } else if config.id != id {
        let mismatch = ConfigError::IdMismatch {
            expected: id,
            found: config.id,
        };
        return Err(ApiError::new(StatusCode::BAD_REQUEST, mismatch.to_string()));
    }

    let options = AddOptions {
        create_only: query.create_only,
        start: query.start,
    };
    match state.registry.add_app(config, options).await? {
        AddOutcome::Created => Ok(StatusCode::CREATED),
        AddOutcome::Updated => Ok(StatusCode::NO_CONTENT),
    }
}

async fn delete_app(
    State(state): State<DaemonState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry.remove_app(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_app(
    State(state): State<DaemonState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry.start_app(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stop_app(
    State(state): State<DaemonState>,
    Path(id): Path<String>,
    Query(query): Query<StopQuery>,
) -> Result<StatusCode, ApiError> {
    state.registry.stop_app(&id, query.force).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn restart_app(
    State(state): State<DaemonState>,
    Path(id): Path<String>,
    Query(query): Query<StopQuery>,
) -> Result<StatusCode, ApiError> {
    state.registry.restart_app(&id, query.force).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reload_app(
    State(state): State<DaemonState>,
    Path(id): Path<String>,
    Query(query): Query<ReloadQuery>,
) -> Result<StatusCode, ApiError> {
    state.registry.reload_app(&id, query.instant).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

/// Splits `/apps/<id>/<rest>?<query>` into the app id and `/<rest>?<query>`.
pub fn split_app_uri(uri: &Uri) -> Option<(String, String)> {
    let tail = uri.path().strip_prefix("/apps/")?;
    let (id, rest) = match tail.split_once('/') {
        Some((id, rest)) => (id, format!("/{rest}")),
        None => (tail, "/".to_string()),
    };
    if id.is_empty() {
        return None;
    }
    let forwarded = match uri.query() {
        Some(query) => format!("{rest}?{query}"),
        None => rest,
    };
    Some((id.to_string(), forwarded))
}

async fn proxy(State(state): State<DaemonState>, request: Request) -> Result<Response, ApiError> {
    let Some((id, forwarded)) = split_app_uri(request.uri()) else {
        return Err(ApiError::not_found(format!("no route for {}", request.uri().path())));
    };

    let (mut parts, body) = request.into_parts();
    parts.uri = forwarded
        .parse()
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid uri: {e}")))?;

    let response = state
        .registry
        .proxy(&id, Request::from_parts(parts, body))
        .await?;
    Ok(response.map(Body::new))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn split(uri: &str) -> Option<(String, String)> {
        split_app_uri(&uri.parse::<Uri>().unwrap())
    }

    #[test]
    fn test_split_strips_app_prefix() {
        assert_eq!(
            split("/apps/web/status"),
            Some(("web".to_string(), "/status".to_string()))
        );
        assert_eq!(
            split("/apps/web/log/2"),
            Some(("web".to_string(), "/log/2".to_string()))
        );
    }

    #[test]
    fn test_split_keeps_query() {
        assert_eq!(
            split("/apps/web/reload?instant=true"),
            Some(("web".to_string(), "/reload?instant=true".to_string()))
        );
    }

    #[test]
    fn test_split_bare_app_path_forwards_root() {
        assert_eq!(split("/apps/web"), Some(("web".to_string(), "/".to_string())));
    }

    #[test]
    fn test_split_rejects_other_paths() {
        assert_eq!(split("/status"), None);
        assert_eq!(split("/apps/"), None);
        assert_eq!(split("/applications/web"), None);
    }
}
