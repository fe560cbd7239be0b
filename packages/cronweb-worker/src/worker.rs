//! Subprocess execution: spawns shots, streams their output into `LogSink`,
//! tracks running/kill/retry state, and fans outcomes out to webhook + hooks.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::Mutex;

use cronweb_core::error::CronwebError;
use cronweb_core::ids::new_id;
use cronweb_core::model::{JobState, JobType};
use cronweb_core::time::now_ms;
use cronweb_storage::Storage;

use crate::hooks::{HookEvent, HookHost, HookRegistry};
use crate::log_sink::{LogItem, LogSink};
use crate::webhook::{dispatch, WebhookConfig, WebhookPayload};

const GRACEFUL_KILL_WAIT: Duration = Duration::from_secs(5);
const HOOK_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(unix)]
extern "C" {
    fn kill(pid: i32, sig: i32) -> i32;
}

#[cfg(unix)]
const SIGTERM: i32 = 15;

/// Best-effort graceful terminate; tokio's `Child` has no portable signal API.
#[cfg(unix)]
fn terminate(pid: u32) {
    unsafe {
        kill(pid as i32, SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}

struct RunningShot {
    uuid: String,
    date_start: String,
    child: Arc<Mutex<Child>>,
}

/// Fixed parameters for the Worker, loaded once from configuration.
pub struct WorkerConfig {
    pub work_dir: PathBuf,
    pub times_retry: u32,
    pub wait_retry_base: u64,
    pub webhook: Option<WebhookConfig>,
    pub subprocess_env: Option<HashMap<String, String>>,
}

pub struct Worker {
    storage: Storage,
    log_sink: Arc<LogSink>,
    config: WorkerConfig,
    hook_host: Mutex<HookHost>,
    hook_registry: HookRegistry,
    running: Mutex<HashMap<String, RunningShot>>,
    kill_set: Mutex<HashSet<String>>,
    retry_waiting: Mutex<HashSet<String>>,
}

impl Worker {
    pub async fn new(
        storage: Storage,
        log_sink: Arc<LogSink>,
        config: WorkerConfig,
        hook_registry: HookRegistry,
    ) -> Result<Self, CronwebError> {
        tokio::fs::create_dir_all(&config.work_dir).await?;
        Ok(Self {
            storage,
            log_sink,
            config,
            hook_host: Mutex::new(HookHost::start()),
            hook_registry,
            running: Mutex::new(HashMap::new()),
            kill_set: Mutex::new(HashSet::new()),
            retry_waiting: Mutex::new(HashSet::new()),
        })
    }

    fn command_line(command: &str, param: Option<&str>) -> String {
        match param {
            Some(p) if !p.is_empty() => format!("{command} --param {p} 2>&1"),
            _ => format!("{command} 2>&1"),
        }
    }

    /// Top-level entry point: runs `command` to completion, retrying on
    /// ERROR up to `times_retry` additional times with exponential backoff.
    pub async fn shoot(
        &self,
        command: &str,
        param: Option<&str>,
        uuid: &str,
        timeout: Duration,
        name: &str,
        job_type: JobType,
    ) {
        let mut job_type = job_type;
        let mut root_shot_id: Option<String> = None;
        let max_attempts = self.config.times_retry + 1;

        for k in 0..max_attempts {
            if k >= 1 {
                let backoff = (2u64.pow(k) - 1) * self.config.wait_retry_base;
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                job_type = JobType::Retry;
            }

            let (shot_id, state) = match self
                .run_once(command, param, uuid, timeout, job_type)
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(uuid, error = %e, "shot failed to start");
                    break;
                }
            };
            if root_shot_id.is_none() {
                root_shot_id = Some(shot_id.clone());
            }

            self.dispatch_outcome(name, &shot_id, uuid, state, job_type).await;

            if state != JobState::Error {
                break;
            }
            if let Some(root) = &root_shot_id {
                self.retry_waiting.lock().await.insert(root.clone());
            }
        }

        if let Some(root) = root_shot_id {
            self.retry_waiting.lock().await.remove(&root);
        }
    }

    /// Runs exactly one execution of `command`, streaming output into a fresh
    /// log file and returning the terminal `(shot_id, state)`.
    async fn run_once(
        &self,
        command: &str,
        param: Option<&str>,
        uuid: &str,
        timeout: Duration,
        _job_type: JobType,
    ) -> Result<(String, JobState), CronwebError> {
        let shot_id = new_id();
        let line = Self::command_line(command, param);

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&line)
            .current_dir(&self.config.work_dir)
            .stdout(Stdio::piped())
            .stdin(Stdio::null());
        if let Some(env) = &self.config.subprocess_env {
            cmd.env_clear();
            cmd.envs(env);
        }

        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().expect("stdout was piped");
        let mut lines = BufReader::new(stdout).lines();

        let (queue, log_path) = self.log_sink.open_shot(&shot_id, timeout).await?;
        self.storage.job_log_shoot(&shot_id, uuid, &log_path).await?;

        let child = Arc::new(Mutex::new(child));
        self.running.lock().await.insert(
            shot_id.clone(),
            RunningShot {
                uuid: uuid.to_string(),
                date_start: cronweb_core::time::now_iso(),
                child: child.clone(),
            },
        );

        let header = format!(
            "shot_id: {shot_id}\nuuid: {uuid}\ncommand: {command}\nparam: {}\n#### OUTPUT ####\n",
            param.unwrap_or("")
        );
        let _ = queue.send(LogItem::Line(header)).await;

        let state = loop {
            match tokio::time::timeout(timeout, lines.next_line()).await {
                Ok(Ok(Some(text))) => {
                    let _ = queue.send(LogItem::Line(format!("{}\n", text.trim_end()))).await;
                }
                Ok(Ok(None)) | Ok(Err(_)) => {
                    let exit_status = child.lock().await.wait().await;
                    let code = exit_status.ok().and_then(|s| s.code()).unwrap_or(-1);
                    let _ = queue
                        .send(LogItem::Line(format!("#### OUTPUT END ####\nExit Code: {code}\n")))
                        .await;
                    let was_killed = self.kill_set.lock().await.remove(&shot_id);
                    break if code == 0 {
                        let _ = queue.send(LogItem::Line("Job DONE\n".to_string())).await;
                        JobState::Done
                    } else if was_killed {
                        let _ = queue.send(LogItem::Line("Job KILLED\n".to_string())).await;
                        JobState::Killed
                    } else {
                        let _ = queue.send(LogItem::Line("Job FAILED\n".to_string())).await;
                        JobState::Error
                    };
                }
                Err(_) => {
                    let _ = queue
                        .send(LogItem::Line(format!(
                            "Killed Timeout {}s\nJob TIMEOUT\n",
                            timeout.as_secs()
                        )))
                        .await;
                    Self::force_kill(&child).await;
                    break JobState::Killed;
                }
            }
        };

        let _ = queue.send(LogItem::Stop).await;
        self.storage.job_log_done(&shot_id, state).await?;
        self.running.lock().await.remove(&shot_id);
        Ok((shot_id, state))
    }

    async fn force_kill(child: &Arc<Mutex<Child>>) {
        let mut guard = child.lock().await;
        let _ = guard.start_kill();
    }

    async fn dispatch_outcome(
        &self,
        name: &str,
        shot_id: &str,
        uuid: &str,
        state: JobState,
        job_type: JobType,
    ) {
        let timestamp_ms = now_ms();

        if let Some(webhook) = &self.config.webhook {
            let webhook = webhook.clone();
            let payload = WebhookPayload {
                name: name.to_string(),
                shot_id: shot_id.to_string(),
                state: state.as_str().to_string(),
                job_type: job_type.as_str().to_string(),
                timestamp: timestamp_ms,
            };
            self.hook_host.lock().await.run_coroutine(
                Box::pin(async move { dispatch(&webhook, &payload).await }),
                HOOK_TIMEOUT,
            );
        }

        for (hook_name, hook) in self.hook_registry.iter() {
            let event = HookEvent {
                name: name.to_string(),
                shot_id: shot_id.to_string(),
                uuid: uuid.to_string(),
                state,
                job_type,
                timestamp_ms,
            };
            let hook = hook.clone();
            let hook_name = hook_name.clone();
            self.hook_host.lock().await.run_coroutine(
                Box::pin(async move {
                    hook(event).await;
                    tracing::debug!(hook = %hook_name, "hook ran to completion");
                }),
                HOOK_TIMEOUT,
            );
        }
    }

    pub async fn get_running_jobs(&self) -> HashMap<String, (String, String)> {
        self.running
            .lock()
            .await
            .iter()
            .map(|(shot_id, r)| (shot_id.clone(), (r.uuid.clone(), r.date_start.clone())))
            .collect()
    }

    /// Marks `shot_id` for termination, signals it, and waits up to 5 s for
    /// it to exit on its own before escalating to a forced kill.
    /// Returns `None` if `shot_id` is not currently running.
    pub async fn kill_by_shot_id(&self, shot_id: &str) -> Option<String> {
        let child = {
            let running = self.running.lock().await;
            running.get(shot_id)?.child.clone()
        };
        self.kill_set.lock().await.insert(shot_id.to_string());

        if let Some(pid) = child.lock().await.id() {
            terminate(pid);
        }

        let deadline = tokio::time::Instant::now() + GRACEFUL_KILL_WAIT;
        loop {
            {
                let mut guard = child.lock().await;
                if guard.try_wait().ok().flatten().is_some() {
                    break;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                Self::force_kill(&child).await;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Some(shot_id.to_string())
    }

    pub async fn kill_all_running_jobs(&self) -> HashMap<String, String> {
        let ids: Vec<String> = self.running.lock().await.keys().cloned().collect();
        let mut out = HashMap::new();
        for shot_id in ids {
            if let Some(uuid) = self
                .running
                .lock()
                .await
                .get(&shot_id)
                .map(|r| r.uuid.clone())
            {
                if self.kill_by_shot_id(&shot_id).await.is_some() {
                    out.insert(shot_id, uuid);
                }
            }
        }
        out
    }

    pub async fn stop(&self) {
        self.hook_host.lock().await.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (Worker, tempfile::TempDir, tempfile::TempDir) {
        let db_dir = tempfile::tempdir().unwrap();
        let log_dir = tempfile::tempdir().unwrap();
        let storage = Storage::connect(db_dir.path().join("cw.db").to_str().unwrap(), 2)
            .await
            .unwrap();
        let log_sink = Arc::new(LogSink::new(log_dir.path()).await.unwrap());
        let config = WorkerConfig {
            work_dir: db_dir.path().to_path_buf(),
            times_retry: 0,
            wait_retry_base: 1,
            webhook: None,
            subprocess_env: None,
        };
        let worker = Worker::new(storage, log_sink, config, HookRegistry::new())
            .await
            .unwrap();
        (worker, db_dir, log_dir)
    }

    #[tokio::test]
    async fn successful_command_produces_done_state() {
        let (worker, _db, _log) = setup().await;
        let (shot_id, state) = worker
            .run_once("echo hi", None, "uuid-a", Duration::from_secs(5), JobType::Manual)
            .await
            .unwrap();
        assert_eq!(state, JobState::Done);
        assert!(worker.get_running_jobs().await.get(&shot_id).is_none());
    }

    #[tokio::test]
    async fn failing_command_produces_error_state() {
        let (worker, _db, _log) = setup().await;
        let (_shot_id, state) = worker
            .run_once("false", None, "uuid-b", Duration::from_secs(5), JobType::Manual)
            .await
            .unwrap();
        assert_eq!(state, JobState::Error);
    }

    #[tokio::test]
    async fn idle_timeout_produces_killed_state() {
        let (worker, _db, _log) = setup().await;
        let (_shot_id, state) = worker
            .run_once("sleep 5", None, "uuid-c", Duration::from_millis(200), JobType::Manual)
            .await
            .unwrap();
        assert_eq!(state, JobState::Killed);
    }

    #[tokio::test]
    async fn kill_by_shot_id_marks_running_shot_killed() {
        let (worker, _db, _log) = setup().await;
        let worker = Arc::new(worker);
        let w = worker.clone();
        let handle = tokio::spawn(async move {
            w.run_once("sleep 10", None, "uuid-d", Duration::from_secs(30), JobType::Manual)
                .await
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        let running = worker.get_running_jobs().await;
        let shot_id = running.keys().next().cloned().expect("shot should be running");
        assert!(worker.kill_by_shot_id(&shot_id).await.is_some());
        let (_shot_id, state) = handle.await.unwrap().unwrap();
        assert_eq!(state, JobState::Killed);
    }
}
