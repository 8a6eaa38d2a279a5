use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// 10 MB rotation threshold
pub const LOG_ROTATION_SIZE: u64 = 10 * 1024 * 1024;

/// Keep up to 3 rotated files (.1, .2, .3)
pub const LOG_ROTATION_KEEP: u32 = 3;

pub const LOG_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogStream::Stdout => write!(f, "out"),
            LogStream::Stderr => write!(f, "err"),
        }
    }
}

/// Tags a raw output line with a timestamp, `<app>:<worker>` and stream.
pub fn format_line(app: &str, worker: u64, stream: LogStream, line: &str) -> String {
    let ts = chrono::Local::now().format(LOG_DATE_FORMAT);
    format!("{ts} [{app}:{worker}] {stream} | {}", line.trim_end())
}

// ---------------------------------------------------------------------------
// rotate_log: shift rotated files and rename current to .1
// ---------------------------------------------------------------------------

pub async fn rotate_log(path: &Path, max_rotations: u32) -> io::Result<()> {
    let oldest = rotated_path(path, max_rotations);
    if tokio::fs::try_exists(&oldest).await.unwrap_or(false) {
        tokio::fs::remove_file(&oldest).await?;
    }

    // Shift .2 -> .3, .1 -> .2, etc.
    for i in (1..max_rotations).rev() {
        let from = rotated_path(path, i);
        let to = rotated_path(path, i + 1);
        if tokio::fs::try_exists(&from).await.unwrap_or(false) {
            tokio::fs::rename(&from, &to).await?;
        }
    }

    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        tokio::fs::rename(path, rotated_path(path, 1)).await?;
    }

    Ok(())
}

pub fn rotated_path(path: &Path, n: u32) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(format!(".{n}"));
    p.into()
}

// ---------------------------------------------------------------------------
// spawn_log_writer: tokio task that appends formatted lines to a file
// ---------------------------------------------------------------------------

/// Returns a sender whose lines are appended to `log_path`, rotating at
/// `LOG_ROTATION_SIZE`. The task ends when every sender is dropped.
pub fn spawn_log_writer(log_path: PathBuf) -> mpsc::UnboundedSender<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        if let Err(e) = run_log_writer(&log_path, rx).await {
            tracing::warn!(path = %log_path.display(), "log writer error: {e}");
        }
    });
    tx
}

async fn open_append(path: &Path) -> io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

async fn run_log_writer(
    log_path: &Path,
    mut rx: mpsc::UnboundedReceiver<String>,
) -> io::Result<()> {
    let mut file = open_append(log_path).await?;
    let mut byte_count = tokio::fs::metadata(log_path).await?.len();

    while let Some(line) = rx.recv().await {
        let mut bytes = line.into_bytes();
        bytes.push(b'\n');

        if byte_count + bytes.len() as u64 > LOG_ROTATION_SIZE {
            file.flush().await?;
            drop(file);
            rotate_log(log_path, LOG_ROTATION_KEEP).await?;
            file = open_append(log_path).await?;
            byte_count = 0;
        }

        file.write_all(&bytes).await?;
        byte_count += bytes.len() as u64;
    }

    file.flush().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_line_tags_identity_and_stream() {
        let line = format_line("web", 3, LogStream::Stderr, "boom\n");
        assert!(line.ends_with("[web:3] err | boom"), "got: {line}");
    }

    #[test]
    fn test_rotated_path_appends_suffix() {
        let path = Path::new("/tmp/app.log");
        assert_eq!(rotated_path(path, 2), PathBuf::from("/tmp/app.log.2"));
    }

    #[tokio::test]
    async fn test_rotate_log_creates_dot1() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "data").unwrap();

        rotate_log(&path, 3).await.unwrap();

        assert!(!path.exists());
        assert_eq!(
            std::fs::read_to_string(rotated_path(&path, 1)).unwrap(),
            "data"
        );
    }

    #[tokio::test]
    async fn test_rotate_log_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "current").unwrap();
        std::fs::write(rotated_path(&path, 1), "one").unwrap();
        std::fs::write(rotated_path(&path, 2), "two").unwrap();

        rotate_log(&path, 2).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(rotated_path(&path, 1)).unwrap(),
            "current"
        );
        assert_eq!(
            std::fs::read_to_string(rotated_path(&path, 2)).unwrap(),
            "one"
        );
        assert!(!rotated_path(&path, 3).exists());
    }

    #[tokio::test]
    async fn test_log_writer_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");

        let tx = spawn_log_writer(path.clone());
        tx.send("first".to_string()).unwrap();
        tx.send("second".to_string()).unwrap();
        drop(tx);

        let mut contents = String::new();
        for _ in 0..50 {
            contents = std::fs::read_to_string(&path).unwrap_or_default();
            if contents.lines().count() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(contents, "first\nsecond\n");
    }
}
