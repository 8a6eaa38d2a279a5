//! App registry: the on-disk app directories and the lifecycle of each app's
//! supervisor process.

use crate::config::{self, AppConfig, ConfigError};
use crate::handshake::{self, StartOutcome};
use crate::paths::{ENV_HOME, Paths};
use crate::protocol::{ApiError, AppInfo, Pong, SupervisorStatus, flag_query};
use crate::sys::{self, Signal};
use crate::uds::{self, UdsError};
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub const ENV_START_TIMEOUT: &str = "APPVISOR_START_TIMEOUT_MS";
pub const ENV_STOP_TIMEOUT: &str = "APPVISOR_STOP_TIMEOUT_MS";

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("app '{0}' not found")]
    NotFound(String),
    #[error("app '{0}' already exists")]
    AlreadyExists(String),
    #[error("app '{0}' is not running")]
    NotRunning(String),
    #[error("app '{id}' failed to start: {reason}")]
    StartFailed { id: String, reason: String },
    #[error("app '{0}' did not stop within {1:?}")]
    StopTimeout(String, Duration),
    #[error(transparent)]
    Uds(#[from] UdsError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        let status = match &e {
            RegistryError::Config(ConfigError::Io(_) | ConfigError::Json(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            RegistryError::Config(_) => StatusCode::BAD_REQUEST,
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::AlreadyExists(_) => StatusCode::CONFLICT,
            RegistryError::Uds(UdsError::Status { status, .. }) => *status,
            RegistryError::NotRunning(_) | RegistryError::Uds(_) => StatusCode::BAD_GATEWAY,
            RegistryError::StartFailed { .. }
            | RegistryError::StopTimeout(..)
            | RegistryError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, e.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddOptions {
    /// Fail instead of updating an existing app.
    pub create_only: bool,
    pub start: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Created,
    Updated,
}

fn timeout_from_env(var: &str, default: Duration) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Registry {
    paths: Paths,
    /// Executable started as `<program> supervise <id>`.
    program: PathBuf,
    start_timeout: Duration,
    stop_timeout: Duration,
    /// One lock per app id, held for the whole of `start_app`.
    start_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl Registry {
    /// A registry whose supervisors are run by the current executable.
    pub fn new(paths: Paths) -> io::Result<Self> {
        Ok(Self::with_program(paths, std::env::current_exe()?))
    }

    pub fn with_program(paths: Paths, program: impl Into<PathBuf>) -> Self {
        Self {
            paths,
            program: program.into(),
            start_timeout: timeout_from_env(ENV_START_TIMEOUT, handshake::DEFAULT_START_TIMEOUT),
            stop_timeout: timeout_from_env(ENV_STOP_TIMEOUT, DEFAULT_STOP_TIMEOUT),
            start_locks: Arc::default(),
        }
    }

    /// Overrides the handshake and stop-poll bounds.
    pub fn with_timeouts(mut self, start: Duration, stop: Duration) -> Self {
        self.start_timeout = start;
        self.stop_timeout = stop;
        self
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    fn start_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.start_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    fn load(&self, id: &str) -> Result<AppConfig, RegistryError> {
        config::validate_id(id)?;
        let path = self.paths.config_file(id);
        if !path.exists() {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        Ok(config::load_config(&path, id)?)
    }

    // -- liveness -----------------------------------------------------------

    /// Pings the app socket. A socket nobody answers on is deleted.
    pub async fn probe(&self, id: &str) -> bool {
        let socket = self.paths.app_socket(id);
        match uds::get_json::<Pong>(&socket, "/ping").await {
            Ok(pong) => pong.pong,
            Err(e) => {
                tracing::debug!(app = %id, "liveness probe failed: {e}");
                let _ = tokio::fs::remove_file(&socket).await;
                false
            }
        }
    }

    async fn status(&self, id: &str) -> Option<SupervisorStatus> {
        uds::get_json(&self.paths.app_socket(id), "/status")
            .await
            .ok()
    }

    // -- lifecycle ----------------------------------------------------------

    pub async fn add_app(
        &self,
        config: AppConfig,
        options: AddOptions,
    ) -> Result<AddOutcome, RegistryError> {
        config.validate()?;
        let dir = self.paths.app_dir(&config.id);
        let outcome = if tokio::fs::try_exists(&dir).await? {
            if options.create_only {
                return Err(RegistryError::AlreadyExists(config.id));
            }
            AddOutcome::Updated
        } else {
            AddOutcome::Created
        };

        tokio::fs::create_dir_all(&dir).await?;
        config::save_config(&self.paths.config_file(&config.id), &config)?;
        tracing::info!(app = %config.id, ?outcome, "saved app config");

        if options.start {
            self.start_app(&config.id).await?;
        }
        Ok(outcome)
    }

    /// Starts the app's supervisor and waits for its pool to come online.
    /// Already-running apps are left alone.
    pub async fn start_app(&self, id: &str) -> Result<(), RegistryError> {
        let config = self.load(id)?;
        let lock = self.start_lock(id);
        let _starting = lock.lock().await;
        if self.probe(id).await {
            return Ok(());
        }

        let dir = self.paths.app_dir(id);
        let stderr = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.paths.supervisor_log(id))?;

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.arg("supervise")
            .arg(id)
            .current_dir(config.cwd.as_deref().map(PathBuf::from).unwrap_or(dir))
            .env_clear()
            .envs(&config.env)
            .env(ENV_HOME, self.paths.base_dir());
        for inherited in ["PATH", crate::logging::ENV_LOG] {
            if !config.env.contains_key(inherited)
                && let Ok(value) = std::env::var(inherited)
            {
                cmd.env(inherited, value);
            }
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr))
            .process_group(0);

        let mut child = cmd.spawn().map_err(|e| RegistryError::StartFailed {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        // Leader of the group its workers join
        let pgid = child.id();
        tracing::info!(app = %id, pid = ?pgid, "spawned supervisor");

        let outcome = handshake::await_online(&mut child, self.start_timeout).await;
        if let StartOutcome::Online = outcome {
            tracing::info!(app = %id, "app online");
            let app = id.to_string();
            tokio::spawn(async move {
                let status = child.wait().await;
                tracing::info!(%app, ?status, "supervisor exited");
            });
            return Ok(());
        }

        tracing::error!(app = %id, "start failed: {outcome}");
        if let Some(pgid) = pgid
            && let Err(e) = sys::signal_group(pgid, Signal::SIGKILL)
        {
            tracing::warn!(app = %id, pgid, "failed to kill supervisor group: {e}");
        }
        let _ = child.wait().await;

        let reason = match outcome {
            StartOutcome::Exited(_) | StartOutcome::Failed(_) => {
                format!("{outcome}; see {}", self.paths.supervisor_log(id).display())
            }
            _ => outcome.to_string(),
        };
        Err(RegistryError::StartFailed {
            id: id.to_string(),
            reason,
        })
    }

    /// Asks a live app to stop and waits until it is gone. No-op when the app
    /// is not running.
    pub async fn stop_app(&self, id: &str, force: bool) -> Result<(), RegistryError> {
        config::validate_id(id)?;
        if !self.probe(id).await {
            return Ok(());
        }

        let socket = self.paths.app_socket(id);
        if let Err(e) = uds::post(&socket, &format!("/stop{}", flag_query("force", force))).await
            && self.probe(id).await
        {
            return Err(e.into());
        }
        tracing::info!(app = %id, force, "stop requested");

        let deadline = tokio::time::Instant::now() + self.stop_timeout;
        while self.probe(id).await {
            if tokio::time::Instant::now() >= deadline {
                return Err(RegistryError::StopTimeout(id.to_string(), self.stop_timeout));
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
        Ok(())
    }

    pub async fn restart_app(&self, id: &str, force: bool) -> Result<(), RegistryError> {
        self.load(id)?;
        self.stop_app(id, force).await?;
        self.start_app(id).await
    }

    /// Rolls every worker of a live app; starts the app otherwise.
    pub async fn reload_app(&self, id: &str, instant: bool) -> Result<(), RegistryError> {
        self.load(id)?;
        if !self.probe(id).await {
            return self.start_app(id).await;
        }
        let uri = format!("/reload{}", flag_query("instant", instant));
        uds::post(&self.paths.app_socket(id), &uri).await?;
        Ok(())
    }

    /// Force-stops the app and deletes its directory. Unknown apps are fine.
    pub async fn remove_app(&self, id: &str) -> Result<(), RegistryError> {
        self.stop_app(id, true).await?;
        match tokio::fs::remove_dir_all(self.paths.app_dir(id)).await {
            Ok(()) => {
                tracing::info!(app = %id, "removed app");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // -- queries ------------------------------------------------------------

    pub async fn get_app(&self, id: &str) -> Result<AppInfo, RegistryError> {
        let config = self.load(id)?;
        let status = self.status(id).await;
        Ok(AppInfo {
            id: id.to_string(),
            config,
            status,
        })
    }

    /// Ids of every app directory, sorted.
    pub async fn app_ids(&self) -> Result<Vec<String>, RegistryError> {
        let mut entries = match tokio::fs::read_dir(self.paths.apps_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Every app with a readable config, with live status where available.
    pub async fn list_apps(&self) -> Result<Vec<AppInfo>, RegistryError> {
        let mut apps = Vec::new();
        for id in self.app_ids().await? {
            match self.get_app(&id).await {
                Ok(info) => apps.push(info),
                Err(e) => tracing::warn!(app = %id, "skipping app: {e}"),
            }
        }
        Ok(apps)
    }

    // -- proxy --------------------------------------------------------------

    /// Forwards `request` (already stripped of its `/apps/<id>` prefix) to
    /// the app socket.
    pub async fn proxy(
        &self,
        id: &str,
        request: Request<Body>,
    ) -> Result<Response<Incoming>, RegistryError> {
        config::validate_id(id)?;
        if !self.probe(id).await {
            return Err(RegistryError::NotRunning(id.to_string()));
        }
        Ok(uds::send(&self.paths.app_socket(id), request).await?)
    }
}
