use color_eyre::eyre::bail;
use std::path::{Path, PathBuf};

/// Overrides the base directory (default `~/.appvisor`).
pub const ENV_HOME: &str = "APPVISOR_HOME";

#[derive(Debug, Clone)]
pub struct Paths {
    base_dir: PathBuf,
}

impl Paths {
    pub fn new() -> color_eyre::Result<Self> {
        if let Ok(path) = std::env::var(ENV_HOME) {
            return Ok(Self {
                base_dir: PathBuf::from(path),
            });
        }
        let Some(home) = dirs::home_dir() else {
            bail!("could not determine home directory");
        };
        Ok(Self {
            base_dir: home.join(".appvisor"),
        })
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base_dir: base }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn pid_file(&self) -> PathBuf {
        self.base_dir.join("daemon.pid")
    }

    pub fn daemon_socket(&self) -> PathBuf {
        self.base_dir.join("daemon.sock")
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.base_dir.join("daemon.log")
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.base_dir.join("apps")
    }

    pub fn app_dir(&self, id: &str) -> PathBuf {
        self.apps_dir().join(id)
    }

    pub fn config_file(&self, id: &str) -> PathBuf {
        self.app_dir(id).join("config.json")
    }

    pub fn app_socket(&self, id: &str) -> PathBuf {
        self.app_dir(id).join("socket")
    }

    pub fn notify_socket(&self, id: &str) -> PathBuf {
        self.app_dir(id).join("notify.sock")
    }

    pub fn app_log(&self, id: &str) -> PathBuf {
        self.app_dir(id).join("app.log")
    }

    pub fn supervisor_log(&self, id: &str) -> PathBuf {
        self.app_dir(id).join("supervisor.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_files_under_base() {
        let paths = Paths::with_base(PathBuf::from("/tmp/appvisor-test"));
        assert!(paths.pid_file().starts_with(paths.base_dir()));
        assert!(paths.pid_file().ends_with("daemon.pid"));
        assert!(paths.daemon_socket().ends_with("daemon.sock"));
        assert!(paths.daemon_log().ends_with("daemon.log"));
    }

    #[test]
    fn test_app_dir_layout() {
        let paths = Paths::with_base(PathBuf::from("/tmp/appvisor-test"));
        assert_eq!(
            paths.app_dir("web"),
            PathBuf::from("/tmp/appvisor-test/apps/web")
        );
        assert!(paths.config_file("web").ends_with("apps/web/config.json"));
        assert!(paths.app_socket("web").ends_with("apps/web/socket"));
        assert!(paths.notify_socket("web").ends_with("apps/web/notify.sock"));
        assert!(paths.app_log("web").ends_with("apps/web/app.log"));
        assert!(
            paths
                .supervisor_log("web")
                .ends_with("apps/web/supervisor.log")
        );
    }

    #[test]
    fn test_default_base_ends_with_appvisor() {
        if std::env::var(ENV_HOME).is_ok() {
            return;
        }
        let paths = Paths::new().unwrap();
        assert!(paths.base_dir().ends_with(".appvisor"));
    }
}
