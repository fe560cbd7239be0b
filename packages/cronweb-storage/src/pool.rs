//! A small, bounded connection pool over raw `sqlx::SqliteConnection`s.
//!
//! `sqlx::SqlitePool` already pools connections, but the spec calls for a
//! specific, observable growth policy (idle queue of size N, grown to at most
//! N+2 under an exclusive lock only after a 30s wait times out), so this is a
//! thin pool built directly on `SqliteConnection` rather than on top of sqlx's
//! own pool.

use std::collections::VecDeque;
use std::time::Duration;

use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, SqliteConnection};
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;

use cronweb_core::error::CronwebError;

const DEFAULT_IDLE_SIZE: usize = 2;
const GROW_HEADROOM: usize = 2;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

struct Inner {
    idle: Mutex<VecDeque<SqliteConnection>>,
    /// Total connections, idle + checked out. Guarded by `grow_lock` on writes
    /// from the grow path; `acquire`/`release` only ever move connections
    /// between `idle` and the caller without changing this count.
    total: Mutex<usize>,
    grow_lock: Mutex<()>,
    notify: Notify,
    db_url: String,
    base_size: usize,
}

/// A handle wrapping a checked-out connection; `release` consumes it and
/// returns the connection to the pool.
pub struct PooledConnection {
    conn: Option<SqliteConnection>,
}

impl PooledConnection {
    pub fn as_mut(&mut self) -> &mut SqliteConnection {
        self.conn.as_mut().expect("connection taken twice")
    }
}

#[derive(Clone)]
pub struct Pool {
    inner: std::sync::Arc<Inner>,
}

async fn open_connection(db_url: &str) -> Result<SqliteConnection, CronwebError> {
    let options: SqliteConnectOptions = db_url
        .parse()
        .map_err(|e: sqlx::Error| CronwebError::Storage(Box::new(e)))?;
    let options = options.create_if_missing(true);
    let mut conn = SqliteConnection::connect_with(&options)
        .await
        .map_err(|e| CronwebError::Storage(Box::new(e)))?;

    // Every new connection is configured for UTF-8 text and WAL durability.
    sqlx::query("PRAGMA encoding = 'UTF-8';")
        .execute(&mut conn)
        .await
        .map_err(|e| CronwebError::Storage(Box::new(e)))?;
    sqlx::query("PRAGMA journal_mode = WAL;")
        .execute(&mut conn)
        .await
        .map_err(|e| CronwebError::Storage(Box::new(e)))?;
    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(&mut conn)
        .await
        .map_err(|e| CronwebError::Storage(Box::new(e)))?;

    Ok(conn)
}

impl Pool {
    /// Opens `base_size` idle connections against `db_url` up front.
    pub async fn connect(db_url: &str, base_size: usize) -> Result<Self, CronwebError> {
        let base_size = if base_size == 0 {
            DEFAULT_IDLE_SIZE
        } else {
            base_size
        };
        let mut idle = VecDeque::with_capacity(base_size);
        for _ in 0..base_size {
            idle.push_back(open_connection(db_url).await?);
        }
        Ok(Self {
            inner: std::sync::Arc::new(Inner {
                idle: Mutex::new(idle),
                total: Mutex::new(base_size),
                grow_lock: Mutex::new(()),
                notify: Notify::new(),
                db_url: db_url.to_string(),
                base_size,
            }),
        })
    }

    /// Takes an idle connection, waiting up to 30s for one to free up. If none
    /// frees up in time, attempts to grow the pool (to at most `base_size + 2`)
    /// under the exclusive grow lock; if the pool is already at its cap, fails
    /// with `PoolExhausted`.
    pub async fn acquire(&self) -> Result<PooledConnection, CronwebError> {
        if let Some(conn) = self.try_take_idle().await {
            return Ok(PooledConnection { conn: Some(conn) });
        }

        match timeout(ACQUIRE_TIMEOUT, self.wait_for_idle()).await {
            Ok(conn) => Ok(PooledConnection { conn: Some(conn) }),
            Err(_) => self.grow_or_fail().await,
        }
    }

    async fn try_take_idle(&self) -> Option<SqliteConnection> {
        self.inner.idle.lock().await.pop_front()
    }

    async fn wait_for_idle(&self) -> SqliteConnection {
        loop {
            if let Some(conn) = self.try_take_idle().await {
                return conn;
            }
            self.inner.notify.notified().await;
        }
    }

    async fn grow_or_fail(&self) -> Result<PooledConnection, CronwebError> {
        let _guard = self.inner.grow_lock.lock().await;

        // Another waiter may have freed or grown a connection while we queued
        // for the grow lock.
        if let Some(conn) = self.try_take_idle().await {
            return Ok(PooledConnection { conn: Some(conn) });
        }

        let mut total = self.inner.total.lock().await;
        let cap = self.inner.base_size + GROW_HEADROOM;
        if *total >= cap {
            return Err(CronwebError::PoolExhausted);
        }
        let conn = open_connection(&self.inner.db_url).await?;
        *total += 1;
        Ok(PooledConnection { conn: Some(conn) })
    }

    /// Returns a connection to the idle queue, reopening it first if it has
    /// gone bad (e.g. the underlying file handle was closed out from under
    /// us).
    pub async fn release(&self, mut pooled: PooledConnection) {
        let Some(mut conn) = pooled.conn.take() else {
            return;
        };
        if sqlx::query("SELECT 1").execute(&mut conn).await.is_err() {
            conn = match open_connection(&self.inner.db_url).await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!(error = %e, "failed to reopen unusable pooled connection");
                    let mut total = self.inner.total.lock().await;
                    *total = total.saturating_sub(1);
                    return;
                }
            };
        }
        self.inner.idle.lock().await.push_back(conn);
        self.inner.notify.notify_one();
    }

    /// Drains and closes every connection, serialized by the grow lock so a
    /// concurrent `acquire` cannot grow the pool mid-shutdown.
    pub async fn close(&self) {
        let _guard = self.inner.grow_lock.lock().await;
        let mut idle = self.inner.idle.lock().await;
        while let Some(conn) = idle.pop_front() {
            if let Err(e) = conn.close().await {
                tracing::warn!(error = %e, "error closing pooled sqlite connection");
            }
        }
        *self.inner.total.lock().await = 0;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.conn.is_some() {
            tracing::warn!("pooled connection dropped without being released back to the pool");
        }
    }
}
