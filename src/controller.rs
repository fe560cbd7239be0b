//! Composes Storage, Trigger, Worker, and LogSink behind the single operation
//! surface the HTTP layer calls into. Implements the reconciliation protocol
//! that keeps those collaborators, and the log directory, in agreement.

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{Datelike, Local, TimeZone};
use tokio::sync::{Mutex, OnceCell};
use tokio::task::AbortHandle;

use cronweb_core::error::CronwebError;
use cronweb_core::model::{Job, JobState, JobType, Shot};
use cronweb_storage::Storage;
use cronweb_trigger::{FireEvent, JobSpec, Trigger};
use cronweb_worker::{HookRegistry, LogSink, Worker, WorkerConfig};

const DEFAULT_SHOT_TIMEOUT: Duration = Duration::from_secs(1800);
const EXPIRY_WINDOW_DAYS: i64 = 30;
const PERIODIC_HOUR: u32 = 3;
const PERIODIC_MINUTE: u32 = 9;
const PERIODIC_SECOND: u32 = 4;

/// Owns one instance each of Storage, Trigger, Worker, and LogSink, and the
/// periodic reconciliation timer tying them together.
pub struct Controller {
    storage: Storage,
    trigger: Trigger,
    worker: Worker,
    log_sink: Arc<LogSink>,
    periodic_handle: Mutex<Option<AbortHandle>>,
    self_ref: Arc<OnceCell<Weak<Controller>>>,
}

impl Controller {
    /// Builds the full collaborator graph and wires the Trigger's fire
    /// callback back into `Controller::shoot` via a `Weak` reference set
    /// into `self_ref` once construction completes. Components are spawned
    /// as independent Tokio tasks, so they need an owned handle back to the
    /// Controller rather than a borrow; `Weak` avoids a reference cycle,
    /// since the Controller's `shutdown` already tears every component down
    /// before it would ever need to be dropped.
    pub async fn new(
        storage: Storage,
        log_dir: PathBuf,
        worker_config: WorkerConfig,
        hook_registry: HookRegistry,
    ) -> Result<Arc<Self>, CronwebError> {
        let self_ref: Arc<OnceCell<Weak<Controller>>> = Arc::new(OnceCell::new());

        let callback_ref = self_ref.clone();
        let on_fire: cronweb_trigger::OnFire = Arc::new(move |event: FireEvent| {
            let callback_ref = callback_ref.clone();
            tokio::spawn(async move {
                let Some(weak) = callback_ref.get() else {
                    return;
                };
                if let Some(controller) = weak.upgrade() {
                    controller.shoot_from_event(event, JobType::Schedule).await;
                }
            });
        });

        let trigger = Trigger::new(on_fire);
        let log_sink = Arc::new(LogSink::new(log_dir).await?);
        let worker = Worker::new(storage.clone(), log_sink.clone(), worker_config, hook_registry)
            .await?;

        let controller = Arc::new(Self {
            storage,
            trigger,
            worker,
            log_sink,
            periodic_handle: Mutex::new(None),
            self_ref: self_ref.clone(),
        });

        let _ = self_ref.set(Arc::downgrade(&controller));

        controller.job_check().await?;
        let sweep_handle = controller.clone().spawn_periodic_sweep();
        *controller.periodic_handle.lock().await = Some(sweep_handle);

        Ok(controller)
    }

    async fn shoot_from_event(&self, event: FireEvent, job_type: JobType) {
        self.worker
            .shoot(
                &event.command,
                event.param.as_deref(),
                &event.uuid,
                DEFAULT_SHOT_TIMEOUT,
                &event.name,
                job_type,
            )
            .await;
    }

    // ---- CRUD surface, called by the HTTP layer ----------------------------

    pub async fn add_job(
        &self,
        cron_exp: String,
        command: String,
        param: Option<String>,
        name: String,
    ) -> Result<Job, CronwebError> {
        let spec = JobSpec {
            uuid: None,
            cron_exp,
            command,
            param,
            name,
            active: true,
        };
        let job = self.trigger.add_job(spec, false).await?;
        self.storage.save_job(&job).await?;
        Ok(job)
    }

    pub async fn remove_job(&self, uuid: &str) -> Result<Option<String>, CronwebError> {
        self.trigger.remove_job(uuid).await;
        let removed = self.storage.remove_job(uuid).await?;
        if removed.is_some() {
            self.storage.job_logs_set_deleted(uuid).await?;
        }
        Ok(removed)
    }

    pub async fn update_job_state(&self, uuid: &str, active: bool) -> Result<bool, CronwebError> {
        let ok = if active {
            self.trigger.start_job(uuid).await
        } else {
            self.trigger.stop_job(uuid).await
        };
        if ok {
            self.storage.update_job_state(uuid, active).await?;
        }
        Ok(ok)
    }

    /// Dispatches the shot and returns as soon as it's queued, without
    /// waiting on the subprocess — the same fire-and-forget discipline the
    /// Trigger's `on_fire` callback uses for scheduled firings.
    pub async fn trigger_manual(&self, uuid: &str) -> bool {
        let Some(job) = self.trigger.get_job(uuid).await else {
            return false;
        };
        let event = FireEvent {
            uuid: job.uuid,
            command: job.command,
            param: job.param,
            name: job.name,
        };
        if let Some(controller) = self.self_ref.get().and_then(Weak::upgrade) {
            tokio::spawn(async move {
                controller.shoot_from_event(event, JobType::Manual).await;
            });
        }
        true
    }

    pub async fn get_jobs(&self) -> Result<Vec<Job>, CronwebError> {
        self.storage.get_all_jobs().await
    }

    pub async fn get_running_jobs(&self) -> std::collections::HashMap<String, (String, String)> {
        self.worker.get_running_jobs().await
    }

    pub async fn kill_shot(&self, shot_id: &str) -> Option<String> {
        self.worker.kill_by_shot_id(shot_id).await
    }

    pub async fn get_logs(&self, limit: i64) -> Result<Vec<Shot>, CronwebError> {
        self.storage.job_logs_get_undeleted(limit).await
    }

    pub async fn get_logs_for_job(&self, uuid: &str) -> Result<Vec<Shot>, CronwebError> {
        self.storage.job_logs_get_by_uuid(uuid).await
    }

    pub async fn read_log(
        &self,
        shot_id: &str,
        limit_lines: usize,
    ) -> Result<Option<String>, CronwebError> {
        let Some(shot) = self.storage.job_log_get_record(shot_id).await? else {
            return Ok(None);
        };
        Ok(self.log_sink.read_log_by_path(&shot.log_path, limit_lines).await)
    }

    // ---- reconciliation -----------------------------------------------------

    /// Three-way reconciliation between the Trigger snapshot, the persisted
    /// job set, and the Worker's running-shot table.
    pub async fn job_check(&self) -> Result<(), CronwebError> {
        let trigger_jobs = self.trigger.get_jobs().await;
        let storage_jobs = self.storage.get_all_jobs().await?;

        let trigger_uuids: std::collections::HashSet<&str> =
            trigger_jobs.iter().map(|j| j.uuid.as_str()).collect();
        let storage_uuids: std::collections::HashSet<&str> =
            storage_jobs.iter().map(|j| j.uuid.as_str()).collect();

        for job in &storage_jobs {
            if !trigger_uuids.contains(job.uuid.as_str()) {
                self.trigger.add_from_record(job.clone()).await?;
            }
        }

        for uuid in trigger_uuids.difference(&storage_uuids) {
            self.trigger.remove_job(uuid).await;
        }

        let active_uuids: std::collections::HashSet<&str> = storage_jobs
            .iter()
            .filter(|j| j.active)
            .map(|j| j.uuid.as_str())
            .collect();
        for job in &trigger_jobs {
            if !active_uuids.contains(job.uuid.as_str()) {
                self.trigger.stop_job(&job.uuid).await;
            }
        }

        let running = self.worker.get_running_jobs().await;
        let stuck = self.storage.job_logs_get_by_state(JobState::Running).await?;
        for shot in stuck {
            if !running.contains_key(&shot.shot_id) {
                self.storage.job_log_done(&shot.shot_id, JobState::Unknown).await?;
            }
        }

        Ok(())
    }

    /// Reconciles shot records against current jobs and the log directory.
    pub async fn log_check(&self) -> Result<(), CronwebError> {
        let current_jobs: std::collections::HashSet<String> = self
            .storage
            .get_all_jobs()
            .await?
            .into_iter()
            .map(|j| j.uuid)
            .collect();

        let all_shots = self.storage.job_logs_get_all().await?;
        let mut invalid: Vec<String> = all_shots
            .iter()
            .filter(|s| !current_jobs.contains(&s.uuid))
            .map(|s| s.shot_id.clone())
            .collect();
        let deleted = self.storage.job_logs_get_deleted().await?;
        invalid.extend(deleted.into_iter().map(|s| s.shot_id));
        self.storage.job_logs_remove_shot_ids(&invalid).await?;

        let remaining: std::collections::HashSet<String> = self
            .storage
            .job_logs_get_all()
            .await?
            .into_iter()
            .map(|s| s.shot_id)
            .collect();

        for path in self.log_sink.get_all_log_file_path().await {
            let file_name = std::path::Path::new(&path)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            let Some((_ms, shot_id)) = cronweb_core::time::parse_log_file_name(file_name) else {
                continue;
            };
            if !remaining.contains(&shot_id) && self.log_sink.remove_log_file(&path).await.is_none() {
                tracing::warn!(path, "orphan log file already gone");
            }
        }
        Ok(())
    }

    pub async fn log_expire_check(&self, days: i64) -> Result<u64, CronwebError> {
        self.storage.log_expire_check(days).await
    }

    /// Spawns the one-shot-then-reschedule 03:09:04 timer that drives
    /// `log_expire_check` and `log_check`, returning a handle the caller
    /// stores for cancellation on shutdown.
    fn spawn_periodic_sweep(self: Arc<Self>) -> AbortHandle {
        let task = tokio::spawn(async move {
            loop {
                let wait = seconds_until_next_periodic_fire();
                tokio::time::sleep(Duration::from_secs(wait)).await;
                if let Err(e) = self.log_expire_check(EXPIRY_WINDOW_DAYS).await {
                    tracing::error!(error = %e, "periodic log_expire_check failed");
                }
                if let Err(e) = self.log_check().await {
                    tracing::error!(error = %e, "periodic log_check failed");
                }
            }
        });
        task.abort_handle()
    }

    /// Cancels the periodic timer, disarms every Trigger timer, kills every
    /// running shot, runs a final `job_check`, and closes the store.
    pub async fn shutdown(&self) -> Result<(), CronwebError> {
        if let Some(handle) = self.periodic_handle.lock().await.take() {
            handle.abort();
        }
        self.trigger.stop_all().await;
        self.worker.kill_all_running_jobs().await;
        self.job_check().await?;
        self.worker.stop().await;
        self.storage.stop().await;
        Ok(())
    }
}

/// Seconds from now until the next local 03:09:04, today if still ahead,
/// otherwise tomorrow.
fn seconds_until_next_periodic_fire() -> u64 {
    let now = Local::now();
    let today_fire = Local
        .with_ymd_and_hms(now.year(), now.month(), now.day(), PERIODIC_HOUR, PERIODIC_MINUTE, PERIODIC_SECOND)
        .single();
    let target = match today_fire {
        Some(t) if t > now => t,
        Some(t) => t + chrono::Duration::days(1),
        None => now + chrono::Duration::days(1),
    };
    (target - now).num_seconds().max(1) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_until_next_periodic_fire_is_positive() {
        assert!(seconds_until_next_periodic_fire() >= 1);
    }
}
