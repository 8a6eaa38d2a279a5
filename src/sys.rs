use std::io;
use std::path::Path;
use std::str::FromStr;

pub use nix::sys::signal::Signal;
use nix::unistd::Pid;

#[derive(Debug, thiserror::Error)]
#[error("invalid signal: {0}")]
pub struct InvalidSignal(pub String);

/// Accepts both `SIGINT` and `INT` spellings.
pub fn parse_signal(name: &str) -> Result<Signal, InvalidSignal> {
    let normalized = if name.starts_with("SIG") {
        name.to_string()
    } else {
        format!("SIG{name}")
    };
    Signal::from_str(&normalized).map_err(|_| InvalidSignal(name.to_string()))
}

pub fn send_signal(pid: u32, signal: Signal) -> io::Result<()> {
    nix::sys::signal::kill(Pid::from_raw(pid as i32), signal).map_err(io::Error::other)
}

pub fn force_kill(pid: u32) -> io::Result<()> {
    send_signal(pid, Signal::SIGKILL)
}

/// Signals every process in group `pgid`. An already empty group is fine.
pub fn signal_group(pgid: u32, signal: Signal) -> io::Result<()> {
    match nix::sys::signal::killpg(Pid::from_raw(pgid as i32), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::other(e)),
    }
}

pub fn check_pid(pid: u32) -> io::Result<bool> {
    match nix::sys::signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => Ok(true),
        Err(nix::errno::Errno::ESRCH) => Ok(false),
        // Process exists but we lack permission to signal it
        Err(nix::errno::Errno::EPERM) => Ok(true),
        Err(e) => Err(io::Error::other(e)),
    }
}

pub fn is_pid_alive(pid: u32) -> bool {
    check_pid(pid).unwrap_or(false)
}

/// Binds a unix listener, replacing whatever file is left at `path`.
pub async fn bind_unix(path: &Path) -> io::Result<tokio::net::UnixListener> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        tokio::fs::remove_file(path).await?;
    }
    tokio::net::UnixListener::bind(path)
}

/// Resolves with the first of SIGINT / SIGTERM delivered to this process.
pub async fn shutdown_signal() -> io::Result<Signal> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => Ok(Signal::SIGTERM),
        _ = sigint.recv() => Ok(Signal::SIGINT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signal_full_name() {
        assert_eq!(parse_signal("SIGTERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("SIGINT").unwrap(), Signal::SIGINT);
        assert_eq!(parse_signal("SIGUSR2").unwrap(), Signal::SIGUSR2);
    }

    #[test]
    fn test_parse_signal_without_prefix() {
        assert_eq!(parse_signal("HUP").unwrap(), Signal::SIGHUP);
    }

    #[test]
    fn test_parse_signal_invalid() {
        assert!(parse_signal("BOGUS").is_err());
        assert!(parse_signal("").is_err());
    }

    #[test]
    fn test_check_pid_self_and_missing() {
        assert!(check_pid(std::process::id()).unwrap());
        assert!(!check_pid(4_194_305).unwrap());
    }

    #[test]
    fn test_signal_group_reaches_the_group() {
        use std::os::unix::process::{CommandExt, ExitStatusExt};

        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        signal_group(child.id(), Signal::SIGKILL).unwrap();
        assert_eq!(child.wait().unwrap().signal(), Some(Signal::SIGKILL as i32));

        // Nothing left in the group
        signal_group(child.id(), Signal::SIGKILL).unwrap();
    }

    #[tokio::test]
    async fn test_bind_unix_replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, "").unwrap();

        let listener = bind_unix(&path).await.unwrap();
        assert!(path.exists());
        drop(listener);
    }
}
