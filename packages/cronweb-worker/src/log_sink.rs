//! Per-shot log file writer. Each shot gets its own bounded queue and a
//! background task that owns the file handle for that shot's lifetime.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};

use cronweb_core::error::CronwebError;
use cronweb_core::time::{log_file_name, now_iso, now_ms};

const QUEUE_DEPTH: usize = 256;

/// One unit of work handed to a shot's writer task.
#[derive(Debug)]
pub enum LogItem {
    Line(String),
    Stop,
}

pub type LogQueue = mpsc::Sender<LogItem>;

/// Owns `log_dir` and the in-flight writer tasks for currently-running shots.
pub struct LogSink {
    log_dir: PathBuf,
    writers: Arc<Mutex<HashMap<String, tokio::task::JoinHandle<()>>>>,
}

impl LogSink {
    pub async fn new(log_dir: impl Into<PathBuf>) -> Result<Self, CronwebError> {
        let log_dir = log_dir.into();
        tokio::fs::create_dir_all(&log_dir).await?;
        Ok(Self {
            log_dir,
            writers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Opens a new log file for `shot_id` and spawns its writer task. Returns
    /// the queue to feed lines into and the file's path.
    pub async fn open_shot(
        &self,
        shot_id: &str,
        idle_timeout: Duration,
    ) -> Result<(LogQueue, String), CronwebError> {
        let file_name = log_file_name(now_ms(), shot_id);
        let path = self.log_dir.join(&file_name);
        let path_str = path.to_string_lossy().into_owned();

        let mut file = File::create(&path).await?;
        file.write_all(format!("#### START {} ####\n", now_iso()).as_bytes())
            .await?;

        let (tx, mut rx) = mpsc::channel::<LogItem>(QUEUE_DEPTH);
        let writers = self.writers.clone();
        let shot_id_owned = shot_id.to_string();
        let task = tokio::spawn(async move {
            loop {
                match tokio::time::timeout(idle_timeout, rx.recv()).await {
                    Ok(Some(LogItem::Line(line))) => {
                        if file.write_all(line.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(LogItem::Stop)) | Ok(None) => break,
                    Err(_) => {
                        tracing::warn!(shot_id = %shot_id_owned, "log writer idle timeout");
                        break;
                    }
                }
            }
            let _ = file.write_all(format!("#### END {} ####\n", now_iso()).as_bytes()).await;
            let _ = file.flush().await;
            writers.lock().await.remove(&shot_id_owned);
        });

        self.writers.lock().await.insert(shot_id.to_string(), task);
        Ok((tx, path_str))
    }

    /// Reads at most `limit_lines` lines from `path`. Returns `None` if the
    /// path is missing or not a regular file.
    pub async fn read_log_by_path(&self, path: &str, limit_lines: usize) -> Option<String> {
        let meta = tokio::fs::metadata(path).await.ok()?;
        if !meta.is_file() {
            return None;
        }
        let file = File::open(path).await.ok()?;
        let mut reader = BufReader::new(file).lines();
        let mut out = String::new();
        let mut count = 0;
        while count < limit_lines {
            match reader.next_line().await {
                Ok(Some(line)) => {
                    out.push_str(&line);
                    out.push('\n');
                    count += 1;
                }
                _ => break,
            }
        }
        Some(out)
    }

    /// Removes a log file. Idempotent: returns `None` if it was already gone.
    pub async fn remove_log_file(&self, path: &str) -> Option<String> {
        if tokio::fs::remove_file(path).await.is_ok() {
            Some(path.to_string())
        } else {
            None
        }
    }

    /// Enumerates every `*.log` file currently under `log_dir`. Used only by
    /// reconciliation, never on the shot hot path.
    pub async fn get_all_log_file_path(&self) -> Vec<String> {
        let mut out = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.log_dir).await else {
            return out;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("log") {
                out.push(path.to_string_lossy().into_owned());
            }
        }
        out
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_shot_writes_header_and_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::new(dir.path()).await.unwrap();
        let (tx, path) = sink.open_shot("shot1", Duration::from_secs(5)).await.unwrap();
        tx.send(LogItem::Line("hi\n".to_string())).await.unwrap();
        tx.send(LogItem::Stop).await.unwrap();
        drop(tx);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let contents = sink.read_log_by_path(&path, 100).await.unwrap();
        assert!(contents.contains("START"));
        assert!(contents.contains("hi"));
        assert!(contents.contains("END"));
    }

    #[tokio::test]
    async fn read_log_by_path_returns_none_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::new(dir.path()).await.unwrap();
        assert!(sink.read_log_by_path("/no/such/file", 10).await.is_none());
    }

    #[tokio::test]
    async fn remove_log_file_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::new(dir.path()).await.unwrap();
        let (tx, path) = sink.open_shot("shot2", Duration::from_secs(5)).await.unwrap();
        tx.send(LogItem::Stop).await.unwrap();
        drop(tx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.remove_log_file(&path).await, Some(path.clone()));
        assert_eq!(sink.remove_log_file(&path).await, None);
    }

    #[tokio::test]
    async fn get_all_log_file_path_enumerates_log_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::new(dir.path()).await.unwrap();
        let (tx, _path) = sink.open_shot("shot3", Duration::from_secs(5)).await.unwrap();
        tx.send(LogItem::Stop).await.unwrap();
        drop(tx);
        tokio::fs::write(dir.path().join("not-a-log.txt"), b"x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let files = sink.get_all_log_file_path().await;
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with(".log"));
    }
}
