use crate::config::{AppConfig, ReadyMode};
use crate::log::LogStream;
use crate::log_ring::LogRing;
use crate::protocol::WorkerStatus;
use crate::sys::{self, Signal};
use crate::usage::ProcessTable;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;

pub type WorkerId = u64;

pub const ENV_APP_ID: &str = "APPVISOR_APP_ID";
pub const ENV_WORKER_ID: &str = "APPVISOR_WORKER_ID";
pub const ENV_NOTIFY_SOCKET: &str = "APPVISOR_NOTIFY_SOCKET";

/// How long an exited worker's output readers get to drain before the exit is reported.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Events reported up to the supervisor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Online(WorkerId),
    Listening(WorkerId, String),
    Output {
        id: WorkerId,
        stream: LogStream,
        line: String,
    },
    Exited {
        id: WorkerId,
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// A graceful signal was sent and the kill timeout elapsed.
    DrainDeadline(WorkerId),
}

pub type EventSender = mpsc::UnboundedSender<WorkerEvent>;

// ---------------------------------------------------------------------------
// OS process seam
// ---------------------------------------------------------------------------

/// Control surface over one live worker process.
pub trait WorkerProcess: Send {
    fn pid(&self) -> Option<u32>;
    fn kill(&mut self, signal: Signal) -> io::Result<()>;
    fn force_kill(&mut self) -> io::Result<()>;
    /// Closes the message channel. Calling it twice is a no-op.
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
    /// Delivers one message line on the worker's stdin.
    fn send(&mut self, message: &str) -> io::Result<()>;
}

/// Starts worker processes. Exit, output and readiness flow back through `events`.
pub trait Launcher: Send {
    fn launch(&mut self, id: WorkerId, events: &EventSender)
    -> io::Result<Box<dyn WorkerProcess>>;
}

// ---------------------------------------------------------------------------
// WorkerHandle
// ---------------------------------------------------------------------------

pub struct WorkerHandle {
    pub id: WorkerId,
    pub listening: Vec<String>,
    pub started_at: Instant,
    pub online: bool,
    pub draining: bool,
    pub log: LogRing,
    process: Box<dyn WorkerProcess>,
}

impl WorkerHandle {
    pub fn new(id: WorkerId, process: Box<dyn WorkerProcess>) -> Self {
        Self {
            id,
            listening: Vec::new(),
            started_at: Instant::now(),
            online: false,
            draining: false,
            log: LogRing::default(),
            process,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn on_listening(&mut self, address: String) {
        self.listening.push(address);
    }

    pub fn kill(&mut self, signal: Signal) -> io::Result<()> {
        self.process.kill(signal)
    }

    pub fn force_kill(&mut self) -> io::Result<()> {
        self.process.force_kill()
    }

    pub fn disconnect(&mut self) {
        if self.process.is_connected() {
            self.process.disconnect();
        }
    }

    pub fn send(&mut self, message: &serde_json::Value) -> io::Result<()> {
        let line = serde_json::to_string(message).map_err(io::Error::other)?;
        self.process.send(&line)
    }

    /// Usage covers the worker and every descendant found in `table`.
    pub fn status(&self, table: Option<&ProcessTable>) -> WorkerStatus {
        let pid = self.pid();
        let usage = match (pid, table) {
            (Some(pid), Some(table)) => table.tree_usage(pid).unwrap_or_default(),
            _ => Default::default(),
        };
        WorkerStatus {
            id: self.id,
            pid,
            online: self.online,
            draining: self.draining,
            uptime: self.started_at.elapsed().as_secs(),
            listening: self.listening.clone(),
            usage,
        }
    }
}

// ---------------------------------------------------------------------------
// Real processes
// ---------------------------------------------------------------------------

pub struct ChildProcess {
    pid: Option<u32>,
    /// Set once the exit waiter has reaped the child; its pid may be reused after that.
    reaped: Arc<AtomicBool>,
    stdin: Option<mpsc::UnboundedSender<String>>,
}

impl ChildProcess {
    fn live_pid(&self) -> Option<u32> {
        self.pid.filter(|_| !self.reaped.load(Ordering::Acquire))
    }
}

impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn kill(&mut self, signal: Signal) -> io::Result<()> {
        match self.live_pid() {
            Some(pid) => sys::send_signal(pid, signal),
            None => Ok(()),
        }
    }

    fn force_kill(&mut self) -> io::Result<()> {
        match self.live_pid() {
            Some(pid) => sys::force_kill(pid),
            None => Ok(()),
        }
    }

    fn disconnect(&mut self) {
        // Dropping the sender ends the stdin writer, which closes the pipe
        self.stdin.take();
    }

    fn is_connected(&self) -> bool {
        self.stdin.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn send(&mut self, message: &str) -> io::Result<()> {
        let Some(tx) = &self.stdin else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "worker is disconnected",
            ));
        };
        tx.send(message.to_string())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker stdin closed"))
    }
}

pub struct ProcessLauncher {
    config: Arc<AppConfig>,
    notify_socket: PathBuf,
}

impl ProcessLauncher {
    pub fn new(config: Arc<AppConfig>, notify_socket: PathBuf) -> Self {
        Self {
            config,
            notify_socket,
        }
    }
}

impl Launcher for ProcessLauncher {
    fn launch(
        &mut self,
        id: WorkerId,
        events: &EventSender,
    ) -> io::Result<Box<dyn WorkerProcess>> {
        let config = &self.config;
        let mut cmd = Command::new(&config.exec_path);
        cmd.args(&config.args);
        if let Some(ref cwd) = config.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(&config.env);
        cmd.env(ENV_APP_ID, &config.id);
        cmd.env(ENV_WORKER_ID, id.to_string());
        cmd.env(ENV_NOTIFY_SOCKET, &self.notify_socket);

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn()?;
        let pid = child.id();

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_output_reader(id, LogStream::Stdout, stdout, events.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_output_reader(id, LogStream::Stderr, stderr, events.clone()));
        }

        let stdin = child.stdin.take().map(spawn_stdin_writer);
        let reaped = Arc::new(AtomicBool::new(false));
        spawn_exit_waiter(id, child, Arc::clone(&reaped), readers, events.clone());

        if config.ready_mode == ReadyMode::Spawn {
            let delay = Duration::from_millis(config.ready_delay_ms);
            let events = events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events.send(WorkerEvent::Online(id));
            });
        }

        Ok(Box::new(ChildProcess { pid, reaped, stdin }))
    }
}

fn spawn_output_reader(
    id: WorkerId,
    stream: LogStream,
    reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    events: EventSender,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if events.send(WorkerEvent::Output { id, stream, line }).is_err() {
                break;
            }
        }
    })
}

fn spawn_stdin_writer(mut stdin: tokio::process::ChildStdin) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(mut message) = rx.recv().await {
            message.push('\n');
            if stdin.write_all(message.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdin.flush().await;
        }
    });
    tx
}

fn spawn_exit_waiter(
    id: WorkerId,
    mut child: Child,
    reaped: Arc<AtomicBool>,
    readers: Vec<tokio::task::JoinHandle<()>>,
    events: EventSender,
) {
    tokio::spawn(async move {
        let status = child.wait().await;
        reaped.store(true, Ordering::Release);
        // Let buffered output land before the exit so it is attributed to this worker
        let _ = tokio::time::timeout(OUTPUT_DRAIN_GRACE, futures::future::join_all(readers)).await;
        let (code, signal) = match status {
            Ok(status) => (status.code(), status.signal()),
            Err(_) => (None, None),
        };
        let _ = events.send(WorkerEvent::Exited { id, code, signal });
    });
}

// ---------------------------------------------------------------------------
// Notify socket
// ---------------------------------------------------------------------------

/// Parses a notify datagram: newline separated `KEY=VALUE` pairs carrying
/// `WORKER=<id>` and any of `READY=1` / `LISTENING=<addr>`.
pub fn parse_notify(datagram: &str) -> Vec<WorkerEvent> {
    let mut worker = None;
    let mut ready = false;
    let mut listening = Vec::new();

    for pair in datagram.lines() {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        match key.trim() {
            "WORKER" => worker = value.trim().parse::<WorkerId>().ok(),
            "READY" => ready = value.trim() == "1",
            "LISTENING" => listening.push(value.trim().to_string()),
            _ => {}
        }
    }

    let Some(id) = worker else {
        return Vec::new();
    };
    let mut out: Vec<WorkerEvent> = listening
        .into_iter()
        .filter(|addr| !addr.is_empty())
        .map(|addr| WorkerEvent::Listening(id, addr))
        .collect();
    if ready {
        out.push(WorkerEvent::Online(id));
    }
    out
}

/// Forwards datagrams received on `socket` as worker events until the
/// supervisor drops its event receiver.
pub fn spawn_notify_listener(socket: tokio::net::UnixDatagram, events: EventSender) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let n = match socket.recv(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!("notify socket error: {e}");
                    return;
                }
            };
            let text = String::from_utf8_lossy(&buf[..n]);
            for event in parse_notify(&text) {
                if events.send(event).is_err() {
                    return;
                }
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
