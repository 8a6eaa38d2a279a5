//! The per-app supervisor process: one engine plus its control API on the
//! app socket.

use crate::config;
use crate::handshake;
use crate::log;
use crate::paths::Paths;
use crate::protocol::{ApiError, Pong, ReloadQuery, StopQuery, SupervisorStatus};
use crate::supervisor::{Outcome, Supervisor, SupervisorError, SupervisorHandle};
use crate::sys::{self, Signal};
use crate::uds;
use crate::worker::{self, ProcessLauncher, WorkerId};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use color_eyre::eyre::bail;
use futures::Stream;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// How long open connections get to finish once the engine has stopped.
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        let status = match e {
            SupervisorError::ShuttingDown | SupervisorError::Starting => StatusCode::CONFLICT,
            SupervisorError::UnknownWorker(_) => StatusCode::NOT_FOUND,
            SupervisorError::Send(..) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, e.to_string())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub supervisor: SupervisorHandle,
    /// Graceful signal used by `POST /stop` without `force`.
    pub stop_signal: Signal,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/status", get(status))
        .route("/reload", post(reload))
        .route("/stop", post(stop))
        .route("/log", get(app_log))
        .route("/log/{worker}", get(worker_log))
        .route("/workers/{worker}", post(send_to_worker))
        .route("/workers.broadcast", post(broadcast))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn ping() -> Json<Pong> {
    Json(Pong { pong: true })
}

async fn status(State(state): State<AppState>) -> Result<Json<SupervisorStatus>, ApiError> {
    Ok(Json(state.supervisor.status().await?))
}

async fn reload(
    State(state): State<AppState>,
    Query(query): Query<ReloadQuery>,
) -> Result<StatusCode, ApiError> {
    state.supervisor.reload(query.instant).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stop(State(state): State<AppState>, Query(query): Query<StopQuery>) -> StatusCode {
    let signal = (!query.force).then_some(state.stop_signal);
    drop(state.supervisor.shutdown(signal));
    StatusCode::ACCEPTED
}

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;
type LogStream = Sse<KeepAliveStream<EventStream>>;

async fn log_stream(
    supervisor: &SupervisorHandle,
    worker: Option<WorkerId>,
) -> Result<LogStream, ApiError> {
    let feed = supervisor.subscribe(worker).await?;
    // The feed detaches from its ring when the stream is dropped
    let stream = futures::stream::unfold(feed, |mut feed| async move {
        let line = feed.next().await?;
        Some((Ok(Event::default().data(line)), feed))
    });
    let stream: EventStream = Box::pin(stream);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn app_log(State(state): State<AppState>) -> Result<LogStream, ApiError> {
    log_stream(&state.supervisor, None).await
}

async fn worker_log(
    State(state): State<AppState>,
    Path(worker): Path<WorkerId>,
) -> Result<LogStream, ApiError> {
    log_stream(&state.supervisor, Some(worker)).await
}

async fn send_to_worker(
    State(state): State<AppState>,
    Path(worker): Path<WorkerId>,
    Json(message): Json<serde_json::Value>,
) -> Result<StatusCode, ApiError> {
    state.supervisor.send(Some(worker), message).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn broadcast(
    State(state): State<AppState>,
    Json(message): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let sent = state.supervisor.send(None, message).await?;
    Ok(Json(serde_json::json!({ "sent": sent })))
}

// ---------------------------------------------------------------------------
// Process entry point
// ---------------------------------------------------------------------------

/// Serves `state` on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: tokio::net::UnixListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Fails when another supervisor still answers on `socket`. A dead socket
/// file is left for `bind_unix` to replace.
pub async fn ensure_socket_free(socket: &std::path::Path) -> color_eyre::Result<()> {
    if let Ok(pong) = uds::get_json::<Pong>(socket, "/ping").await
        && pong.pong
    {
        bail!("a supervisor is already serving {}", socket.display());
    }
    Ok(())
}

/// Runs the supervisor for app `id` until its engine stops. Fails if the
/// pool never came online.
pub async fn run(paths: Paths, id: String) -> color_eyre::Result<()> {
    let app_dir = paths.app_dir(&id);
    let config = Arc::new(config::load_config(&paths.config_file(&id), &id)?);
    let stop_signal = config.reload_signal()?;
    tracing::info!(app = %id, pid = std::process::id(), instances = config.instances, "supervisor starting");

    let socket = paths.app_socket(&id);
    ensure_socket_free(&socket).await?;

    let notify_path = paths.notify_socket(&id);
    if tokio::fs::try_exists(&notify_path).await.unwrap_or(false) {
        tokio::fs::remove_file(&notify_path).await?;
    }
    let notify = tokio::net::UnixDatagram::bind(&notify_path)?;

    let launcher = ProcessLauncher::new(Arc::clone(&config), notify_path.clone());
    let mut supervisor = Supervisor::new(&config, Box::new(launcher))?
        .with_log_sink(log::spawn_log_writer(paths.app_log(&id)));
    let ready = supervisor.ready_signal();
    worker::spawn_notify_listener(notify, supervisor.event_sender());

    let listener = sys::bind_unix(&socket).await?;
    let (handle, engine) = supervisor.start();

    tokio::spawn(async move {
        if ready.await.is_ok()
            && let Err(e) = handshake::announce_online().await
        {
            tracing::warn!("failed to report readiness: {e}");
        }
    });

    let signals = handle.clone();
    tokio::spawn(async move {
        match sys::shutdown_signal().await {
            Ok(Signal::SIGINT) => drop(signals.shutdown(Some(Signal::SIGINT))),
            Ok(_) => drop(signals.shutdown(None)),
            Err(e) => tracing::warn!("failed to install signal handlers: {e}"),
        }
    });

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let state = AppState {
        supervisor: handle,
        stop_signal,
    };
    let server = tokio::spawn(serve(listener, state, async move {
        let _ = stop_rx.await;
    }));

    let outcome = engine.await?;
    let _ = stop_tx.send(());
    if tokio::time::timeout(SERVER_DRAIN_TIMEOUT, server).await.is_err() {
        tracing::warn!(app = %id, "control connections still open, closing anyway");
    }

    let _ = tokio::fs::remove_file(&socket).await;
    let _ = tokio::fs::remove_file(&notify_path).await;
    tracing::info!(app = %id, dir = %app_dir.display(), ?outcome, "supervisor exiting");

    if outcome == Outcome::BootFailed {
        bail!("app '{id}' failed to come online");
    }
    Ok(())
}
