use appvisor::cli::{Cli, Command};
use appvisor::client;
use appvisor::config::{AppConfig, ReadyMode};
use appvisor::paths::Paths;
use appvisor::protocol::{AppInfo, SupervisorState, SupervisorStatus};
use axum::http::{Method, StatusCode};
use clap::{CommandFactory, Parser};
use comfy_table::{Attribute, Cell, Color, Table, presets::UTF8_FULL_CONDENSED};
use owo_colors::OwoColorize;
use std::path::Path;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    let paths = Paths::new()?;
    match command {
        Command::Daemon => {
            appvisor::logging::init_file(&paths.daemon_log())?;
            appvisor::daemon::run(paths).await
        }
        Command::Supervise { id } => {
            appvisor::logging::init_file(&paths.supervisor_log(&id))?;
            appvisor::app_server::run(paths, id).await
        }
        command => {
            appvisor::logging::init_stderr();
            run_command(&paths, command, cli.json).await
        }
    }
}

async fn run_command(paths: &Paths, command: Command, json: bool) -> color_eyre::Result<()> {
    let auto_list = should_auto_list(&command);
    match command {
        Command::Daemon | Command::Supervise { .. } => unreachable!("handled in main"),
        Command::Add {
            id,
            exec_path,
            args,
            cwd,
            port,
            instances,
            env,
            reload_signal,
            notify,
            start,
            create_only,
        } => {
            let (cwd, exec_path) = resolve_launch(&std::env::current_dir()?, cwd, exec_path);
            let mut config = AppConfig::new(id.clone(), exec_path);
            config.args = args;
            config.cwd = Some(cwd);
            config.env = env.into_iter().collect();
            if let Some(port) = port {
                config.env.insert("PORT".to_string(), port.to_string());
            }
            if let Some(instances) = instances {
                config.instances = instances;
            }
            if let Some(signal) = reload_signal {
                config.reload_signal = signal;
            }
            if notify {
                config.ready_mode = ReadyMode::Notify;
            }

            let uri = format!("/apps/{id}{}", add_query(create_only, start));
            let body = serde_json::to_value(&config)?;
            let (status, _) = client::send_request(paths, Method::PUT, &uri, Some(&body)).await?;
            let created = status == StatusCode::CREATED;
            if json {
                println!("{}", serde_json::json!({ "id": id, "created": created }));
            } else if created {
                println!("{}", format!("created {id}").green());
            } else {
                println!("{}", format!("updated {id}").green());
            }
        }
        Command::Start { id } => {
            action(paths, &format!("/apps/{id}/start"), json, &format!("started {id}")).await?
        }
        Command::Stop { id, force } => {
            let uri = format!("/apps/{id}/stop{}", appvisor::protocol::flag_query("force", force));
            action(paths, &uri, json, &format!("stopped {id}")).await?
        }
        Command::Restart { id, force } => {
            let uri = format!(
                "/apps/{id}/restart{}",
                appvisor::protocol::flag_query("force", force)
            );
            action(paths, &uri, json, &format!("restarted {id}")).await?
        }
        Command::Reload { id, instant } => {
            let uri = format!(
                "/apps/{id}/reload{}",
                appvisor::protocol::flag_query("instant", instant)
            );
            action(paths, &uri, json, &format!("reloaded {id}")).await?
        }
        Command::Remove { id } => {
            client::send_request(paths, Method::DELETE, &format!("/apps/{id}"), None).await?;
            print_ok(json, &format!("removed {id}"));
        }
        Command::Status { id } => {
            let info: AppInfo = client::get_json(paths, &format!("/apps/{id}")).await?;
            if json {
                println!("{}", serde_json::to_string(&info)?);
            } else {
                print_app_detail(&info);
            }
        }
        Command::List => {
            let apps: Vec<AppInfo> = client::get_json(paths, "/apps").await?;
            if json {
                println!("{}", serde_json::to_string(&apps)?);
            } else {
                print_app_table(&apps);
            }
        }
        Command::Logs { target } => {
            client::stream_events(paths, &target.path(), |line| {
                if json {
                    println!("{}", serde_json::json!({ "line": line }));
                } else {
                    println!("{line}");
                }
            })
            .await?;
        }
        Command::Kill => {
            if !appvisor::pid::is_daemon_running(paths)? {
                print_ok(json, "daemon is not running");
                return Ok(());
            }
            client::send_request(paths, Method::POST, "/kill", None).await?;
            print_ok(json, "daemon shutting down");
        }
    }

    if auto_list && !json {
        let apps: Vec<AppInfo> = client::get_json(paths, "/apps").await?;
        print_app_table(&apps);
    }
    Ok(())
}

fn should_auto_list(command: &Command) -> bool {
    matches!(
        command,
        Command::Start { .. } | Command::Stop { .. } | Command::Restart { .. } | Command::Reload { .. }
    )
}

fn add_query(create_only: bool, start: bool) -> String {
    let mut pairs = Vec::new();
    if create_only {
        pairs.push("createOnly=true");
    }
    if start {
        pairs.push("start=true");
    }
    if pairs.is_empty() {
        String::new()
    } else {
        format!("?{}", pairs.join("&"))
    }
}

/// Pins an app to the directory it was added from. The daemon runs
/// elsewhere, so a relative cwd or a relative exec path containing `/` is
/// made absolute here. Bare program names stay `PATH` lookups.
fn resolve_launch(base: &Path, cwd: Option<String>, exec_path: String) -> (String, String) {
    let cwd = match cwd {
        Some(cwd) => base.join(cwd),
        None => base.to_path_buf(),
    };
    let exec = Path::new(&exec_path);
    let exec_path = if exec.is_relative() && exec_path.contains('/') {
        cwd.join(exec).to_string_lossy().into_owned()
    } else {
        exec_path
    };
    (cwd.to_string_lossy().into_owned(), exec_path)
}

async fn action(paths: &Paths, uri: &str, json: bool, message: &str) -> color_eyre::Result<()> {
    client::send_request(paths, Method::POST, uri, None).await?;
    print_ok(json, message);
    Ok(())
}

fn print_ok(json: bool, message: &str) {
    if json {
        println!("{}", serde_json::json!({ "ok": true, "message": message }));
    } else {
        println!("{}", message.green());
    }
}

// ---------------------------------------------------------------------------
// Human output
// ---------------------------------------------------------------------------

fn state_color(status: Option<&SupervisorStatus>) -> Color {
    match status.map(|s| s.status) {
        Some(SupervisorState::Online) => Color::Green,
        Some(SupervisorState::Starting) => Color::Yellow,
        Some(SupervisorState::Stopping) => Color::Magenta,
        Some(SupervisorState::Stopped) | None => Color::Reset,
    }
}

fn state_label(status: Option<&SupervisorStatus>) -> String {
    match status {
        Some(s) if s.reloading => format!("{} (reloading)", s.status),
        Some(s) => s.status.to_string(),
        None => "stopped".to_string(),
    }
}

fn header(names: &[&str]) -> Vec<Cell> {
    names
        .iter()
        .map(|n| Cell::new(n).add_attribute(Attribute::Bold))
        .collect()
}

fn print_app_table(apps: &[AppInfo]) {
    if apps.is_empty() {
        println!("{}", "no apps".yellow());
        return;
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(header(&[
        "id", "pid", "status", "workers", "cpu", "mem", "uptime", "deaths",
    ]));
    for app in apps {
        let status = app.status.as_ref();
        let workers = status
            .map(|s| format!("{}/{}", s.online_count, app.config.instances))
            .unwrap_or_else(|| format!("0/{}", app.config.instances));
        let deaths = status.map(|s| s.death_count).unwrap_or_default();
        let deaths_cell = if deaths > 0 {
            Cell::new(deaths).fg(Color::Yellow)
        } else {
            Cell::new(deaths)
        };
        table.add_row(vec![
            Cell::new(&app.id).fg(Color::Cyan),
            Cell::new(status.map(|s| s.pid.to_string()).unwrap_or_else(|| "-".to_string())),
            Cell::new(state_label(status)).fg(state_color(status)),
            Cell::new(workers),
            Cell::new(format_cpu(status.map(total_cpu))),
            Cell::new(format_memory_bytes(status.map(total_mem))),
            Cell::new(format_uptime(status.map(|s| s.uptime))),
            deaths_cell,
        ]);
    }
    println!("{table}");
}

/// CPU of the supervisor plus every worker tree.
fn total_cpu(status: &SupervisorStatus) -> f64 {
    status.cpu + status.workers.iter().map(|w| w.usage.total_cpu).sum::<f64>()
}

fn total_mem(status: &SupervisorStatus) -> u64 {
    status.mem + status.workers.iter().map(|w| w.usage.total_mem).sum::<u64>()
}

fn print_app_detail(info: &AppInfo) {
    let status = info.status.as_ref();
    let label = state_label(status);
    let colored = match status.map(|s| s.status) {
        Some(SupervisorState::Online) => label.green().to_string(),
        Some(SupervisorState::Starting) => label.yellow().to_string(),
        Some(SupervisorState::Stopping) => label.magenta().to_string(),
        _ => label,
    };
    let config = &info.config;
    println!("{}: {}", info.id.cyan().bold(), colored);
    println!(
        "  {} {} {}",
        "command:".dimmed(),
        config.exec_path,
        config.args.join(" ")
    );
    if let Some(cwd) = &config.cwd {
        println!("  {} {cwd}", "cwd:".dimmed());
    }
    println!("  {} {}", "instances:".dimmed(), config.instances);
    println!("  {} {}", "reload signal:".dimmed(), config.reload_signal);
    if !config.env.is_empty() {
        println!("  {}", "env:".dimmed());
        let mut env: Vec<_> = config.env.iter().collect();
        env.sort();
        for (k, v) in env {
            println!("    {k}={v}");
        }
    }

    let Some(status) = status else {
        return;
    };
    println!("  {} {}", "pid:".dimmed(), status.pid);
    println!("  {} {}", "uptime:".dimmed(), format_uptime(Some(status.uptime)));
    println!(
        "  {} {} deaths, {} kills",
        "restarts:".dimmed(),
        status.death_count,
        status.kill_count
    );

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(header(&[
        "worker", "pid", "state", "cpu", "mem", "procs", "uptime", "listening",
    ]));
    for worker in &status.workers {
        let state = if worker.draining {
            Cell::new("draining").fg(Color::Magenta)
        } else if worker.online {
            Cell::new("online").fg(Color::Green)
        } else {
            Cell::new("starting").fg(Color::Yellow)
        };
        table.add_row(vec![
            Cell::new(worker.id).fg(Color::Cyan),
            Cell::new(worker.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())),
            state,
            Cell::new(format_cpu(Some(worker.usage.total_cpu))),
            Cell::new(format_memory_bytes(Some(worker.usage.total_mem))),
            Cell::new(worker.usage.total_proc),
            Cell::new(format_uptime(Some(worker.uptime))),
            Cell::new(worker.listening.join(", ")),
        ]);
    }
    println!("{table}");
}

fn format_cpu(cpu: Option<f64>) -> String {
    match cpu {
        Some(v) => format!("{v:.1}%"),
        None => "-".to_string(),
    }
}

fn format_memory_bytes(bytes: Option<u64>) -> String {
    match bytes {
        None => "-".to_string(),
        Some(b) if b < 1024 => format!("{b}B"),
        Some(b) if b < 1024 * 1024 => format!("{:.1}K", b as f64 / 1024.0),
        Some(b) if b < 1024 * 1024 * 1024 => format!("{:.1}M", b as f64 / (1024.0 * 1024.0)),
        Some(b) => format!("{:.1}G", b as f64 / (1024.0 * 1024.0 * 1024.0)),
    }
}

fn format_uptime(seconds: Option<u64>) -> String {
    match seconds {
        None => "-".to_string(),
        Some(s) if s < 60 => format!("{s}s"),
        Some(s) if s < 3600 => format!("{}m {}s", s / 60, s % 60),
        Some(s) if s < 86400 => format!("{}h {}m", s / 3600, (s % 3600) / 60),
        Some(s) => format!("{}d {}h", s / 86400, (s % 86400) / 3600),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_query() {
        assert_eq!(add_query(false, false), "");
        assert_eq!(add_query(true, false), "?createOnly=true");
        assert_eq!(add_query(true, true), "?createOnly=true&start=true");
    }

    #[test]
    fn test_resolve_launch() {
        let base = Path::new("/srv/site");
        assert_eq!(
            resolve_launch(base, None, "./server".to_string()),
            ("/srv/site".to_string(), "/srv/site/./server".to_string())
        );
        assert_eq!(
            resolve_launch(base, Some("api".to_string()), "bin/run".to_string()),
            ("/srv/site/api".to_string(), "/srv/site/api/bin/run".to_string())
        );
        assert_eq!(
            resolve_launch(base, Some("/opt/app".to_string()), "node".to_string()),
            ("/opt/app".to_string(), "node".to_string())
        );
        assert_eq!(
            resolve_launch(base, None, "/usr/bin/env".to_string()),
            ("/srv/site".to_string(), "/usr/bin/env".to_string())
        );
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(None), "-");
        assert_eq!(format_uptime(Some(59)), "59s");
        assert_eq!(format_uptime(Some(90)), "1m 30s");
        assert_eq!(format_uptime(Some(7260)), "2h 1m");
        assert_eq!(format_uptime(Some(90000)), "1d 1h");
    }

    #[test]
    fn test_format_memory_bytes() {
        assert_eq!(format_memory_bytes(None), "-");
        assert_eq!(format_memory_bytes(Some(512)), "512B");
        assert_eq!(format_memory_bytes(Some(1536)), "1.5K");
        assert_eq!(format_memory_bytes(Some(3 * 1024 * 1024)), "3.0M");
    }

    #[test]
    fn test_state_label_marks_reload() {
        let status = SupervisorStatus {
            pid: 1,
            uptime: 0,
            cpu: 0.0,
            mem: 0,
            status: SupervisorState::Online,
            worker_count: 0,
            online_count: 0,
            death_count: 0,
            kill_count: 0,
            reloading: true,
            workers: Vec::new(),
        };
        assert_eq!(state_label(Some(&status)), "online (reloading)");
        assert_eq!(state_label(None), "stopped");
    }
}
