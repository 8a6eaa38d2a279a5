use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// `tracing` filter directives, e.g. `APPVISOR_LOG=appvisor=debug`.
pub const ENV_LOG: &str = "APPVISOR_LOG";

fn env_filter(default: Level) -> EnvFilter {
    EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(default.into())
            .parse_lossy("")
    })
}

/// Routes `tracing` output to `path`, appending. Used by the daemon and
/// supervisor processes, which have no terminal.
pub fn init_file(path: &Path) -> color_eyre::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(Level::INFO))
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init()
        .map_err(|e| color_eyre::eyre::eyre!("failed to install logger: {e}"))
}

/// CLI logging: warnings and errors on stderr.
pub fn init_stderr() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(Level::WARN))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
