use crate::paths::Paths;
use crate::sys;
use std::fs;
use std::io;
use std::path::PathBuf;

/// The daemon's claim on `daemon.pid`. The file is removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Records this process as the daemon. Fails with `AlreadyExists` while
    /// another live process holds the file; a stale file is replaced.
    pub fn acquire(paths: &Paths) -> io::Result<Self> {
        if let Some(pid) = daemon_pid(paths)? {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("daemon is already running (pid {pid})"),
            ));
        }
        let path = paths.pid_file();
        fs::write(&path, std::process::id().to_string())?;
        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn read_pid(paths: &Paths) -> Option<u32> {
    fs::read_to_string(paths.pid_file())
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// The pid of the live daemon, if any. Clears a stale pid file.
pub fn daemon_pid(paths: &Paths) -> io::Result<Option<u32>> {
    let Some(pid) = read_pid(paths) else {
        return Ok(None);
    };
    if sys::check_pid(pid)? {
        return Ok(Some(pid));
    }
    let _ = fs::remove_file(paths.pid_file());
    Ok(None)
}

pub fn is_daemon_running(paths: &Paths) -> io::Result<bool> {
    Ok(daemon_pid(paths)?.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_paths() -> (tempfile::TempDir, Paths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        (dir, paths)
    }

    #[test]
    fn test_acquire_writes_and_drop_removes() {
        let (_dir, paths) = temp_paths();

        let pid_file = PidFile::acquire(&paths).unwrap();
        assert_eq!(read_pid(&paths), Some(std::process::id()));
        assert!(is_daemon_running(&paths).unwrap());

        drop(pid_file);
        assert!(!paths.pid_file().exists());
        assert!(!is_daemon_running(&paths).unwrap());
    }

    #[test]
    fn test_acquire_refuses_live_holder() {
        let (_dir, paths) = temp_paths();

        let _held = PidFile::acquire(&paths).unwrap();
        let err = PidFile::acquire(&paths).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_stale_pid_file_is_cleared() {
        let (_dir, paths) = temp_paths();

        // Above the kernel's pid_max
        fs::write(paths.pid_file(), "4294967").unwrap();
        assert_eq!(daemon_pid(&paths).unwrap(), None);
        assert!(!paths.pid_file().exists());

        fs::write(paths.pid_file(), "4294967").unwrap();
        let _pid_file = PidFile::acquire(&paths).unwrap();
        assert_eq!(read_pid(&paths), Some(std::process::id()));
    }

    #[test]
    fn test_garbage_pid_file_means_not_running() {
        let (_dir, paths) = temp_paths();

        fs::write(paths.pid_file(), "not a pid").unwrap();
        assert!(!is_daemon_running(&paths).unwrap());
    }
}
