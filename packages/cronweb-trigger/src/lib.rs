//! The in-memory set of cron timers. Authoritative for *next-fire times*
//! only — `Storage` remains authoritative for existence and job content.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use cron::Schedule;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use cronweb_core::error::CronwebError;
use cronweb_core::model::Job;
use cronweb_core::time::now_iso;

/// What a fired timer hands back to its owner. The callback is expected to
/// spawn the actual shot itself so the timer loop never awaits it.
#[derive(Debug, Clone)]
pub struct FireEvent {
    pub uuid: String,
    pub command: String,
    pub param: Option<String>,
    pub name: String,
}

pub type OnFire = Arc<dyn Fn(FireEvent) + Send + Sync>;

/// Parameters for registering or updating a scheduled job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub uuid: Option<String>,
    pub cron_exp: String,
    pub command: String,
    pub param: Option<String>,
    pub name: String,
    pub active: bool,
}

struct CronJob {
    cron_exp: String,
    command: String,
    param: Option<String>,
    name: String,
    date_create: String,
    date_update: String,
    active: bool,
    handle: Option<AbortHandle>,
}

impl CronJob {
    fn to_job(&self, uuid: &str) -> Job {
        Job {
            uuid: uuid.to_string(),
            cron_exp: self.cron_exp.clone(),
            command: self.command.clone(),
            param: self.param.clone(),
            name: self.name.clone(),
            date_create: self.date_create.clone(),
            date_update: self.date_update.clone(),
            active: self.active,
        }
    }
}

/// Normalizes a 5-field standard cron expression into the 6-field
/// `sec min hour dom month dow` form the `cron` crate expects. Expressions
/// that already carry six or more fields (e.g. `@daily`-style named presets
/// expanded upstream) pass through unchanged.
fn normalize(cron_exp: &str) -> String {
    let fields = cron_exp.split_whitespace().count();
    if fields <= 5 {
        format!("0 {cron_exp}")
    } else {
        cron_exp.to_string()
    }
}

fn parse_schedule(cron_exp: &str) -> Result<Schedule, CronwebError> {
    Schedule::from_str(&normalize(cron_exp))
        .map_err(|e| CronwebError::InvalidCron(format!("{cron_exp}: {e}")))
}

fn fire_event(uuid: &str, cron_job: &CronJob) -> FireEvent {
    FireEvent {
        uuid: uuid.to_string(),
        command: cron_job.command.clone(),
        param: cron_job.param.clone(),
        name: cron_job.name.clone(),
    }
}

pub struct Trigger {
    jobs: Mutex<HashMap<String, CronJob>>,
    on_fire: OnFire,
}

impl Trigger {
    pub fn new(on_fire: OnFire) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            on_fire,
        }
    }

    pub fn cron_is_valid(cron_exp: &str) -> bool {
        parse_schedule(cron_exp).is_ok()
    }

    /// Registers a new job, or defers to [`Trigger::update_job`] when `uuid`
    /// is given and already present and `update` is true.
    pub async fn add_job(&self, spec: JobSpec, update: bool) -> Result<Job, CronwebError> {
        let schedule = parse_schedule(&spec.cron_exp)?;

        let uuid = spec.uuid.clone().unwrap_or_else(cronweb_core::ids::new_id);

        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&uuid) {
            if update {
                drop(jobs);
                return self.update_job(&uuid, spec).await;
            }
            return Err(CronwebError::DuplicateJob(uuid));
        }

        let now = now_iso();
        let mut cron_job = CronJob {
            cron_exp: spec.cron_exp,
            command: spec.command,
            param: spec.param,
            name: spec.name,
            date_create: now.clone(),
            date_update: now,
            active: spec.active,
            handle: None,
        };
        if cron_job.active {
            let event = fire_event(&uuid, &cron_job);
            cron_job.handle = Some(self.spawn_timer(uuid.clone(), schedule, event));
        }
        let job = cron_job.to_job(&uuid);
        jobs.insert(uuid, cron_job);
        Ok(job)
    }

    /// Adds a job exactly as persisted, including its `date_create`,
    /// preserving it verbatim. Used by reconciliation to re-hydrate jobs that
    /// exist in `Storage` but not in memory.
    pub async fn add_from_record(&self, job: Job) -> Result<(), CronwebError> {
        let schedule = parse_schedule(&job.cron_exp)?;
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.uuid) {
            return Ok(());
        }
        let mut cron_job = CronJob {
            cron_exp: job.cron_exp,
            command: job.command,
            param: job.param,
            name: job.name,
            date_create: job.date_create,
            date_update: job.date_update,
            active: job.active,
            handle: None,
        };
        if cron_job.active {
            let event = fire_event(&job.uuid, &cron_job);
            cron_job.handle = Some(self.spawn_timer(job.uuid.clone(), schedule, event));
        }
        jobs.insert(job.uuid, cron_job);
        Ok(())
    }

    /// Removes then re-adds the job, preserving `date_create`.
    pub async fn update_job(&self, uuid: &str, spec: JobSpec) -> Result<Job, CronwebError> {
        let schedule = parse_schedule(&spec.cron_exp)?;
        let mut jobs = self.jobs.lock().await;
        let date_create = jobs
            .get(uuid)
            .map(|j| j.date_create.clone())
            .unwrap_or_else(now_iso);
        if let Some(mut old) = jobs.remove(uuid) {
            if let Some(handle) = old.handle.take() {
                handle.abort();
            }
        }

        let mut cron_job = CronJob {
            cron_exp: spec.cron_exp,
            command: spec.command,
            param: spec.param,
            name: spec.name,
            date_create,
            date_update: now_iso(),
            active: spec.active,
            handle: None,
        };
        if cron_job.active {
            let event = fire_event(uuid, &cron_job);
            cron_job.handle = Some(self.spawn_timer(uuid.to_string(), schedule, event));
        }
        let job = cron_job.to_job(uuid);
        jobs.insert(uuid.to_string(), cron_job);
        Ok(job)
    }

    pub async fn remove_job(&self, uuid: &str) -> Option<Job> {
        let mut jobs = self.jobs.lock().await;
        let mut cron_job = jobs.remove(uuid)?;
        if let Some(handle) = cron_job.handle.take() {
            handle.abort();
        }
        Some(cron_job.to_job(uuid))
    }

    pub async fn stop_job(&self, uuid: &str) -> bool {
        let mut jobs = self.jobs.lock().await;
        let Some(cron_job) = jobs.get_mut(uuid) else {
            return false;
        };
        if let Some(handle) = cron_job.handle.take() {
            handle.abort();
        }
        cron_job.active = false;
        true
    }

    pub async fn start_job(&self, uuid: &str) -> bool {
        let mut jobs = self.jobs.lock().await;
        let Some(cron_job) = jobs.get_mut(uuid) else {
            return false;
        };
        if cron_job.active && cron_job.handle.is_some() {
            return true;
        }
        let Ok(schedule) = parse_schedule(&cron_job.cron_exp) else {
            return false;
        };
        cron_job.active = true;
        let event = fire_event(uuid, cron_job);
        cron_job.handle = Some(self.spawn_timer(uuid.to_string(), schedule, event));
        true
    }

    pub async fn stop_all(&self) {
        let mut jobs = self.jobs.lock().await;
        for cron_job in jobs.values_mut() {
            if let Some(handle) = cron_job.handle.take() {
                handle.abort();
            }
            cron_job.active = false;
        }
    }

    pub async fn get_jobs(&self) -> Vec<Job> {
        let jobs = self.jobs.lock().await;
        jobs.iter().map(|(uuid, cj)| cj.to_job(uuid)).collect()
    }

    pub async fn get_job(&self, uuid: &str) -> Option<Job> {
        let jobs = self.jobs.lock().await;
        jobs.get(uuid).map(|cj| cj.to_job(uuid))
    }

    /// Fires the job immediately, out of schedule, regardless of whether it
    /// currently has an armed timer.
    pub async fn trigger_manual(&self, uuid: &str) -> bool {
        let jobs = self.jobs.lock().await;
        let Some(cron_job) = jobs.get(uuid) else {
            return false;
        };
        (self.on_fire)(fire_event(uuid, cron_job));
        true
    }

    /// Spawns the fire-and-forget timer loop for `uuid`. The loop owns a
    /// fixed snapshot of command/param/name for the lifetime of the timer;
    /// `update_job` replaces the whole timer rather than mutating it in
    /// place, so this snapshot never goes stale.
    fn spawn_timer(&self, uuid: String, schedule: Schedule, event_template: FireEvent) -> AbortHandle {
        let on_fire = self.on_fire.clone();
        let task = tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let Some(next) = schedule.after(&now).next() else {
                    break;
                };
                let Ok(wait) = (next - now).to_std() else {
                    continue;
                };
                tokio::time::sleep(wait).await;
                tracing::debug!(%uuid, "cron timer fired");
                on_fire(event_template.clone());
            }
        });
        task.abort_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spec(cron_exp: &str, active: bool) -> JobSpec {
        JobSpec {
            uuid: None,
            cron_exp: cron_exp.to_string(),
            command: "echo hi".to_string(),
            param: None,
            name: "job".to_string(),
            active,
        }
    }

    #[test]
    fn normalizes_five_field_expressions() {
        assert_eq!(normalize("* * * * *"), "0 * * * * *");
        assert_eq!(normalize("0 0 * * * *"), "0 0 * * * *");
    }

    #[test]
    fn cron_is_valid_rejects_garbage() {
        assert!(Trigger::cron_is_valid("* * * * *"));
        assert!(!Trigger::cron_is_valid("not a cron expression"));
    }

    #[tokio::test]
    async fn add_job_rejects_duplicate_uuid() {
        let trigger = Trigger::new(Arc::new(|_| {}));
        let job = trigger.add_job(spec("* * * * *", false), false).await.unwrap();
        let mut dup = spec("* * * * *", false);
        dup.uuid = Some(job.uuid.clone());
        let err = trigger.add_job(dup, false).await.unwrap_err();
        assert!(matches!(err, CronwebError::DuplicateJob(_)));
    }

    #[tokio::test]
    async fn add_job_with_update_true_falls_through_to_update() {
        let trigger = Trigger::new(Arc::new(|_| {}));
        let job = trigger.add_job(spec("* * * * *", false), false).await.unwrap();
        let mut again = spec("*/5 * * * *", false);
        again.uuid = Some(job.uuid.clone());
        let updated = trigger.add_job(again, true).await.unwrap();
        assert_eq!(updated.uuid, job.uuid);
        assert_eq!(updated.cron_exp, "*/5 * * * *");
    }

    #[tokio::test]
    async fn stop_and_start_job_toggle_active() {
        let trigger = Trigger::new(Arc::new(|_| {}));
        let job = trigger.add_job(spec("* * * * *", true), false).await.unwrap();
        assert!(trigger.stop_job(&job.uuid).await);
        assert!(!trigger.get_job(&job.uuid).await.unwrap().active);
        assert!(trigger.start_job(&job.uuid).await);
        assert!(trigger.get_job(&job.uuid).await.unwrap().active);
    }

    #[tokio::test]
    async fn trigger_manual_invokes_callback_synchronously() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let trigger = Trigger::new(Arc::new(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));
        let job = trigger.add_job(spec("* * * * *", false), false).await.unwrap();
        assert!(trigger.trigger_manual(&job.uuid).await);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!trigger.trigger_manual("missing").await);
    }

    #[tokio::test]
    async fn remove_job_aborts_timer_and_returns_record() {
        let trigger = Trigger::new(Arc::new(|_| {}));
        let job = trigger.add_job(spec("* * * * *", true), false).await.unwrap();
        let removed = trigger.remove_job(&job.uuid).await.unwrap();
        assert_eq!(removed.uuid, job.uuid);
        assert!(trigger.get_job(&job.uuid).await.is_none());
    }
}
