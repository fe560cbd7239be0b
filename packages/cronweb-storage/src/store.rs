use sqlx::Row;

use cronweb_core::error::CronwebError;
use cronweb_core::model::{Job, JobState, Shot};
use cronweb_core::time::{ms_to_iso, now_iso, parse_log_file_name};

use crate::pool::Pool;

/// Durable store for `jobs` and `job_logs`, backed by a single SQLite file and
/// the bounded [`Pool`].
#[derive(Clone)]
pub struct Storage {
    pool: Pool,
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Job {
    Job {
        uuid: row.get("uuid"),
        cron_exp: row.get("cron_exp"),
        command: row.get("command"),
        param: row.get("param"),
        name: row.get("name"),
        date_create: row.get("date_create"),
        date_update: row.get("date_update"),
        active: row.get::<i64, _>("active") != 0,
    }
}

fn row_to_shot(row: &sqlx::sqlite::SqliteRow) -> Result<Shot, CronwebError> {
    let state: String = row.get("state");
    Ok(Shot {
        shot_id: row.get("shot_id"),
        uuid: row.get("uuid"),
        state: state.parse::<JobState>()?,
        log_path: row.get("log_path"),
        date_start: row.get("date_start"),
        date_end: row.get("date_end"),
        deleted: row.get::<i64, _>("deleted") != 0,
    })
}

fn storage_err(e: sqlx::Error) -> CronwebError {
    CronwebError::Storage(Box::new(e))
}

impl Storage {
    /// Connects to `db_path`, running migrations and opening `pool_size` idle
    /// connections (default 2 when `pool_size` is 0).
    pub async fn connect(db_path: &str, pool_size: usize) -> Result<Self, CronwebError> {
        let db_url = format!("sqlite://{db_path}");
        let pool = Pool::connect(&db_url, pool_size).await?;
        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    async fn migrate(&self) -> Result<(), CronwebError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::migrate!("./migrations/sqlite")
            .run(conn.as_mut())
            .await
            .map_err(|e| CronwebError::Storage(Box::new(e)))?;
        self.pool.release(conn).await;
        Ok(())
    }

    pub async fn stop(&self) {
        self.pool.close().await;
    }

    // ---- jobs ----------------------------------------------------------

    pub async fn get_job(&self, uuid: &str) -> Result<Option<Job>, CronwebError> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query("SELECT * FROM jobs WHERE uuid = ?1 AND deleted = 0")
            .bind(uuid)
            .fetch_optional(conn.as_mut())
            .await
            .map_err(storage_err)?;
        self.pool.release(conn).await;
        Ok(row.as_ref().map(row_to_job))
    }

    pub async fn get_all_jobs(&self) -> Result<Vec<Job>, CronwebError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query("SELECT * FROM jobs WHERE deleted = 0")
            .fetch_all(conn.as_mut())
            .await
            .map_err(storage_err)?;
        self.pool.release(conn).await;
        Ok(rows.iter().map(row_to_job).collect())
    }

    pub async fn save_job(&self, job: &Job) -> Result<(), CronwebError> {
        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query(
            "INSERT INTO jobs (uuid, cron_exp, command, param, name, date_create, date_update, active, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
        )
        .bind(&job.uuid)
        .bind(&job.cron_exp)
        .bind(&job.command)
        .bind(&job.param)
        .bind(&job.name)
        .bind(&job.date_create)
        .bind(&job.date_update)
        .bind(job.active as i64)
        .execute(conn.as_mut())
        .await;
        self.pool.release(conn).await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(CronwebError::DuplicateJob(job.uuid.clone()))
            }
            Err(e) => Err(storage_err(e)),
        }
    }

    pub async fn remove_job(&self, uuid: &str) -> Result<Option<String>, CronwebError> {
        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query("DELETE FROM jobs WHERE uuid = ?1")
            .bind(uuid)
            .execute(conn.as_mut())
            .await
            .map_err(storage_err);
        self.pool.release(conn).await;
        let result = result?;
        Ok((result.rows_affected() > 0).then(|| uuid.to_string()))
    }

    pub async fn update_job_state(&self, uuid: &str, active: bool) -> Result<(), CronwebError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("UPDATE jobs SET active = ?2, date_update = ?3 WHERE uuid = ?1")
            .bind(uuid)
            .bind(active as i64)
            .bind(now_iso())
            .execute(conn.as_mut())
            .await
            .map_err(storage_err)?;
        self.pool.release(conn).await;
        Ok(())
    }

    // ---- job_logs --------------------------------------------------------

    /// Inserts a RUNNING row for a shot that has just started streaming.
    /// `date_start` is derived from the ms-epoch prefix of `log_path`.
    pub async fn job_log_shoot(
        &self,
        shot_id: &str,
        uuid: &str,
        log_path: &str,
    ) -> Result<(), CronwebError> {
        let file_name = std::path::Path::new(log_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let date_start = parse_log_file_name(file_name)
            .map(|(ms, _)| ms_to_iso(ms))
            .unwrap_or_else(now_iso);

        let mut conn = self.pool.acquire().await?;
        sqlx::query(
            "INSERT INTO job_logs (shot_id, uuid, state, log_path, date_start, date_end, deleted)
             VALUES (?1, ?2, 'RUNNING', ?3, ?4, NULL, 0)",
        )
        .bind(shot_id)
        .bind(uuid)
        .bind(log_path)
        .bind(date_start)
        .execute(conn.as_mut())
        .await
        .map_err(storage_err)?;
        self.pool.release(conn).await;
        Ok(())
    }

    pub async fn job_log_done(&self, shot_id: &str, state: JobState) -> Result<(), CronwebError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("UPDATE job_logs SET state = ?2, date_end = ?3 WHERE shot_id = ?1")
            .bind(shot_id)
            .bind(state.as_str())
            .bind(now_iso())
            .execute(conn.as_mut())
            .await
            .map_err(storage_err)?;
        self.pool.release(conn).await;
        Ok(())
    }

    pub async fn job_log_get_record(&self, shot_id: &str) -> Result<Option<Shot>, CronwebError> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query("SELECT * FROM job_logs WHERE shot_id = ?1")
            .bind(shot_id)
            .fetch_optional(conn.as_mut())
            .await
            .map_err(storage_err)?;
        self.pool.release(conn).await;
        row.as_ref().map(row_to_shot).transpose()
    }

    pub async fn job_logs_get_by_uuid(&self, uuid: &str) -> Result<Vec<Shot>, CronwebError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query("SELECT * FROM job_logs WHERE uuid = ?1 AND deleted = 0 ORDER BY date_start DESC")
            .bind(uuid)
            .fetch_all(conn.as_mut())
            .await
            .map_err(storage_err)?;
        self.pool.release(conn).await;
        rows.iter().map(row_to_shot).collect()
    }

    pub async fn job_logs_get_by_state(&self, state: JobState) -> Result<Vec<Shot>, CronwebError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query("SELECT * FROM job_logs WHERE state = ?1 AND deleted = 0")
            .bind(state.as_str())
            .fetch_all(conn.as_mut())
            .await
            .map_err(storage_err)?;
        self.pool.release(conn).await;
        rows.iter().map(row_to_shot).collect()
    }

    pub async fn job_logs_get_all(&self) -> Result<Vec<Shot>, CronwebError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query("SELECT * FROM job_logs")
            .fetch_all(conn.as_mut())
            .await
            .map_err(storage_err)?;
        self.pool.release(conn).await;
        rows.iter().map(row_to_shot).collect()
    }

    pub async fn job_logs_get_deleted(&self) -> Result<Vec<Shot>, CronwebError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query("SELECT * FROM job_logs WHERE deleted = 1")
            .fetch_all(conn.as_mut())
            .await
            .map_err(storage_err)?;
        self.pool.release(conn).await;
        rows.iter().map(row_to_shot).collect()
    }

    pub async fn job_logs_get_undeleted(&self, limit: i64) -> Result<Vec<Shot>, CronwebError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            "SELECT * FROM job_logs WHERE deleted = 0 ORDER BY date_start DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(conn.as_mut())
        .await
        .map_err(storage_err)?;
        self.pool.release(conn).await;
        rows.iter().map(row_to_shot).collect()
    }

    pub async fn job_logs_set_deleted(&self, uuid: &str) -> Result<(), CronwebError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("UPDATE job_logs SET deleted = 1 WHERE uuid = ?1")
            .bind(uuid)
            .execute(conn.as_mut())
            .await
            .map_err(storage_err)?;
        self.pool.release(conn).await;
        Ok(())
    }

    pub async fn job_logs_remove_shot_ids(&self, shot_ids: &[String]) -> Result<u64, CronwebError> {
        if shot_ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.acquire().await?;
        let placeholders = shot_ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let query = format!("DELETE FROM job_logs WHERE shot_id IN ({placeholders})");
        let mut q = sqlx::query(&query);
        for id in shot_ids {
            q = q.bind(id);
        }
        let result = q.execute(conn.as_mut()).await.map_err(storage_err)?;
        self.pool.release(conn).await;
        Ok(result.rows_affected())
    }

    /// Hard-deletes every shot record older than `days` past its `date_end`.
    /// Per-record parse failures are logged and skipped rather than aborting
    /// the sweep.
    pub async fn log_expire_check(&self, days: i64) -> Result<u64, CronwebError> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(days);
        let shots = self.job_logs_get_all().await?;
        let mut expired = Vec::new();
        for shot in shots {
            let Some(date_end) = shot.date_end.as_ref() else {
                continue;
            };
            match chrono::DateTime::parse_from_rfc3339(date_end) {
                Ok(end) => {
                    if end.with_timezone(&chrono::Utc) < cutoff {
                        expired.push(shot.shot_id);
                    }
                }
                Err(e) => {
                    tracing::warn!(shot_id = %shot.shot_id, error = %e, "skipping shot with unparsable date_end");
                }
            }
        }
        self.job_logs_remove_shot_ids(&expired).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (Storage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("cronweb.db");
        let storage = Storage::connect(db_path.to_str().unwrap(), 2).await.unwrap();
        (storage, dir)
    }

    fn sample_job(uuid: &str) -> Job {
        let now = now_iso();
        Job {
            uuid: uuid.to_string(),
            cron_exp: "*/1 * * * *".to_string(),
            command: "echo hi".to_string(),
            param: None,
            name: "sample".to_string(),
            date_create: now.clone(),
            date_update: now,
            active: true,
        }
    }

    #[tokio::test]
    async fn save_and_get_job_round_trips() {
        let (storage, _dir) = setup().await;
        let job = sample_job("a1");
        storage.save_job(&job).await.unwrap();
        let fetched = storage.get_job("a1").await.unwrap().unwrap();
        assert_eq!(fetched, job);
    }

    #[tokio::test]
    async fn duplicate_uuid_is_rejected() {
        let (storage, _dir) = setup().await;
        storage.save_job(&sample_job("dup")).await.unwrap();
        let err = storage.save_job(&sample_job("dup")).await.unwrap_err();
        assert!(matches!(err, CronwebError::DuplicateJob(_)));
    }

    #[tokio::test]
    async fn remove_job_returns_uuid_once() {
        let (storage, _dir) = setup().await;
        storage.save_job(&sample_job("gone")).await.unwrap();
        assert_eq!(
            storage.remove_job("gone").await.unwrap(),
            Some("gone".to_string())
        );
        assert_eq!(storage.remove_job("gone").await.unwrap(), None);
    }

    #[tokio::test]
    async fn shot_lifecycle_is_recorded() {
        let (storage, _dir) = setup().await;
        storage.save_job(&sample_job("owner")).await.unwrap();
        storage
            .job_log_shoot("shot1", "owner", "/var/log/cronweb/1700000000000-shot1.log")
            .await
            .unwrap();
        let running = storage.job_log_get_record("shot1").await.unwrap().unwrap();
        assert_eq!(running.state, JobState::Running);
        assert!(running.date_end.is_none());

        storage.job_log_done("shot1", JobState::Done).await.unwrap();
        let done = storage.job_log_get_record("shot1").await.unwrap().unwrap();
        assert_eq!(done.state, JobState::Done);
        assert!(done.date_end.is_some());
    }

    #[tokio::test]
    async fn set_deleted_then_remove_clears_shots_for_uuid() {
        let (storage, _dir) = setup().await;
        storage.save_job(&sample_job("owner2")).await.unwrap();
        storage
            .job_log_shoot("shot2", "owner2", "/var/log/cronweb/1700000000000-shot2.log")
            .await
            .unwrap();
        storage.job_logs_set_deleted("owner2").await.unwrap();
        let deleted = storage.job_logs_get_deleted().await.unwrap();
        assert_eq!(deleted.len(), 1);
        let removed = storage
            .job_logs_remove_shot_ids(&[deleted[0].shot_id.clone()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(storage.job_log_get_record("shot2").await.unwrap().is_none());
    }
}
