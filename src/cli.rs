use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "appvisor", about = "A supervisor for pools of worker processes", version)]
pub struct Cli {
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the control daemon in the foreground
    Daemon,
    /// Supervise one app's worker pool (started by the daemon)
    #[command(hide = true)]
    Supervise { id: String },
    /// Create or update an app
    Add {
        id: String,
        exec_path: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
        /// Working directory for the workers (defaults to the current one)
        #[arg(long)]
        cwd: Option<String>,
        /// Exported to the workers as PORT
        #[arg(long)]
        port: Option<u16>,
        /// Number of workers (defaults to the CPU count)
        #[arg(short, long)]
        instances: Option<usize>,
        /// Extra environment for the workers
        #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,
        #[arg(long)]
        reload_signal: Option<String>,
        /// Wait for an explicit readiness notification instead of a delay
        #[arg(long)]
        notify: bool,
        /// Start the app once saved
        #[arg(long)]
        start: bool,
        /// Fail if the app already exists
        #[arg(long)]
        create_only: bool,
    },
    /// Start an app and wait for it to come online
    Start { id: String },
    /// Stop an app
    Stop {
        id: String,
        #[arg(short, long)]
        force: bool,
    },
    /// Stop then start an app
    Restart {
        id: String,
        #[arg(short, long)]
        force: bool,
    },
    /// Replace every worker of an app with a fresh one
    Reload {
        id: String,
        /// Replace all workers at once instead of one by one
        #[arg(long)]
        instant: bool,
    },
    /// Stop an app and delete it
    #[command(visible_alias = "rm")]
    Remove { id: String },
    /// Show an app's config and workers
    Status { id: String },
    /// List all apps
    #[command(visible_alias = "ls")]
    List,
    /// Follow an app's log, or one worker's with `<id>:<worker>`
    Logs {
        #[arg(value_parser = parse_log_target)]
        target: LogTarget,
    },
    /// Shut down the daemon
    Kill,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTarget {
    pub id: String,
    pub worker: Option<u64>,
}

impl LogTarget {
    /// Path of the log stream relative to the app.
    pub fn path(&self) -> String {
        match self.worker {
            Some(worker) => format!("/apps/{}/log/{worker}", self.id),
            None => format!("/apps/{}/log", self.id),
        }
    }
}

fn parse_log_target(s: &str) -> Result<LogTarget, String> {
    match s.rsplit_once(':') {
        Some((id, worker)) => {
            let worker = worker
                .parse::<u64>()
                .map_err(|_| format!("invalid worker id '{worker}'"))?;
            Ok(LogTarget {
                id: id.to_string(),
                worker: Some(worker),
            })
        }
        None => Ok(LogTarget {
            id: s.to_string(),
            worker: None,
        }),
    }
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon() {
        let cli = Cli::try_parse_from(["appvisor", "daemon"]).unwrap();
        assert!(matches!(cli.command.unwrap(), Command::Daemon));
    }

    #[test]
    fn test_supervise_is_parseable() {
        let cli = Cli::try_parse_from(["appvisor", "supervise", "web"]).unwrap();
        match cli.command.unwrap() {
            Command::Supervise { id } => assert_eq!(id, "web"),
            _ => panic!("expected Supervise"),
        }
    }

    #[test]
    fn test_add_minimal() {
        let cli = Cli::try_parse_from(["appvisor", "add", "web", "node"]).unwrap();
        match cli.command.unwrap() {
            Command::Add {
                id,
                exec_path,
                args,
                instances,
                start,
                create_only,
                notify,
                ..
            } => {
                assert_eq!(id, "web");
                assert_eq!(exec_path, "node");
                assert!(args.is_empty());
                assert!(instances.is_none());
                assert!(!start && !create_only && !notify);
            }
            _ => panic!("expected Add"),
        }
    }

    #[test]
    fn test_add_with_options_and_worker_args() {
        let cli = Cli::try_parse_from([
            "appvisor",
            "add",
            "-i",
            "2",
            "--env",
            "PORT=8080",
            "--start",
            "web",
            "node",
            "server.js",
            "--port",
            "8080",
        ])
        .unwrap();
        match cli.command.unwrap() {
            Command::Add {
                args,
                instances,
                env,
                start,
                ..
            } => {
                assert_eq!(args, vec!["server.js", "--port", "8080"]);
                assert_eq!(instances, Some(2));
                assert_eq!(env, vec![("PORT".to_string(), "8080".to_string())]);
                assert!(start);
            }
            _ => panic!("expected Add"),
        }
    }

    #[test]
    fn test_add_port_before_the_app_is_an_option() {
        let cli =
            Cli::try_parse_from(["appvisor", "add", "--port", "3000", "web", "./server", "--port", "1"])
                .unwrap();
        match cli.command.unwrap() {
            Command::Add { port, args, .. } => {
                assert_eq!(port, Some(3000));
                assert_eq!(args, vec!["--port", "1"]);
            }
            _ => panic!("expected Add"),
        }
        assert!(Cli::try_parse_from(["appvisor", "add", "--port", "http", "web", "node"]).is_err());
    }

    #[test]
    fn test_add_rejects_bad_env() {
        assert!(Cli::try_parse_from(["appvisor", "add", "-e", "NOPE", "web", "node"]).is_err());
        assert!(Cli::try_parse_from(["appvisor", "add", "-e", "=x", "web", "node"]).is_err());
    }

    #[test]
    fn test_stop_force() {
        let cli = Cli::try_parse_from(["appvisor", "stop", "web", "--force"]).unwrap();
        match cli.command.unwrap() {
            Command::Stop { id, force } => {
                assert_eq!(id, "web");
                assert!(force);
            }
            _ => panic!("expected Stop"),
        }
    }

    #[test]
    fn test_reload_instant() {
        let cli = Cli::try_parse_from(["appvisor", "reload", "web", "--instant"]).unwrap();
        match cli.command.unwrap() {
            Command::Reload { id, instant } => {
                assert_eq!(id, "web");
                assert!(instant);
            }
            _ => panic!("expected Reload"),
        }
    }

    #[test]
    fn test_aliases() {
        let cli = Cli::try_parse_from(["appvisor", "ls"]).unwrap();
        assert!(matches!(cli.command.unwrap(), Command::List));
        let cli = Cli::try_parse_from(["appvisor", "rm", "web"]).unwrap();
        assert!(matches!(cli.command.unwrap(), Command::Remove { .. }));
    }

    #[test]
    fn test_logs_target() {
        let cli = Cli::try_parse_from(["appvisor", "logs", "web:3"]).unwrap();
        match cli.command.unwrap() {
            Command::Logs { target } => {
                assert_eq!(target.id, "web");
                assert_eq!(target.worker, Some(3));
                assert_eq!(target.path(), "/apps/web/log/3");
            }
            _ => panic!("expected Logs"),
        }

        let cli = Cli::try_parse_from(["appvisor", "logs", "web"]).unwrap();
        match cli.command.unwrap() {
            Command::Logs { target } => assert_eq!(target.path(), "/apps/web/log"),
            _ => panic!("expected Logs"),
        }
    }

    #[test]
    fn test_logs_bad_worker() {
        assert!(Cli::try_parse_from(["appvisor", "logs", "web:abc"]).is_err());
    }

    #[test]
    fn test_json_is_global() {
        let cli = Cli::try_parse_from(["appvisor", "list", "--json"]).unwrap();
        assert!(cli.json);
    }

    #[test]
    fn test_unknown_subcommand() {
        assert!(Cli::try_parse_from(["appvisor", "bogus"]).is_err());
    }

    #[test]
    fn test_no_args_no_command() {
        let cli = Cli::try_parse_from(["appvisor"]).unwrap();
        assert!(cli.command.is_none());
    }
}
