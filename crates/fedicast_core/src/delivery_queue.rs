/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::QueueSettings;
use crate::delivery::{DeliveryOutcome, Dispatcher};
use crate::failure_tracker::domain_of;
use crate::model::AccountId;
use crate::social_db::open_conn;
use anyhow::{Context, Result};
use fedicast_protocol::QueueStats;
use rand::{rngs::OsRng, RngCore};
use rusqlite::{params, Connection, TransactionBehavior};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

const STATUS_PENDING: i64 = 0;
const STATUS_DELIVERED: i64 = 1;
const STATUS_DEAD: i64 = 2;
const STATUS_DROPPED: i64 = 3;
const STATUS_IN_FLIGHT: i64 = 4;

/// Durable queue of outbound delivery jobs, one row per (payload, inbox).
#[derive(Clone)]
pub struct DeliveryQueue {
    db_path: PathBuf,
    notify: Arc<Notify>,
}

#[derive(Debug, Clone)]
pub struct OutboundJob {
    pub id: String,
    pub inbox_url: String,
    pub domain: String,
    pub payload: Vec<u8>,
    pub account_id: AccountId,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub inbox_url: String,
    pub domain: String,
    pub state: JobState,
    pub attempt: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    InFlight,
    Delivered,
    Dead,
    Dropped,
}

impl JobState {
    fn from_i64(v: i64) -> Self {
        match v {
            STATUS_DELIVERED => Self::Delivered,
            STATUS_DEAD => Self::Dead,
            STATUS_DROPPED => Self::Dropped,
            STATUS_IN_FLIGHT => Self::InFlight,
            _ => Self::Pending,
        }
    }
}

impl DeliveryQueue {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        init_db(&db_path)?;
        Ok(Self {
            db_path,
            notify: Arc::new(Notify::new()),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Creates one job per distinct inbox. Returns how many were created.
    pub async fn enqueue(&self, payload: Vec<u8>, account_id: AccountId, inboxes: Vec<String>) -> Result<u64> {
        let mut targets: Vec<String> = Vec::new();
        for inbox in inboxes {
            let inbox = inbox.trim().to_string();
            if !inbox.is_empty() && !targets.contains(&inbox) {
                targets.push(inbox);
            }
        }
        if targets.is_empty() {
            return Ok(0);
        }
        let created_at = now_ms();
        let count = tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<u64> {
                let mut conn = open_conn(&db_path)?;
                let tx = conn.transaction()?;
                let mut n = 0u64;
                for inbox in targets {
                    tx.execute(
                        r#"
                        INSERT INTO delivery_jobs (
                          id, created_at_ms, next_attempt_at_ms, attempt, status, inbox_url, domain, payload, account_id, lease_until_ms, last_error
                        ) VALUES (?1, ?2, ?2, 0, 0, ?3, ?4, ?5, ?6, NULL, NULL)
                        "#,
                        params![new_job_id(), created_at, inbox, domain_of(&inbox), payload, account_id],
                    )?;
                    n += 1;
                }
                tx.commit()?;
                Ok(n)
            }
        })
        .await??;

        self.notify.notify_one();
        Ok(count)
    }

    pub fn start_workers(&self, shutdown: watch::Receiver<bool>, dispatcher: Arc<Dispatcher>, settings: QueueSettings) {
        info!(workers = settings.workers, "delivery queue db: {}", self.db_path.display());
        for worker in 0..settings.workers.max(1) {
            let queue = self.clone();
            let shutdown = shutdown.clone();
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                if let Err(e) = queue.run_loop(shutdown, dispatcher, settings).await {
                    warn!(worker, "delivery worker stopped: {e:#}");
                }
            });
        }
    }

    async fn run_loop(&self, mut shutdown: watch::Receiver<bool>, dispatcher: Arc<Dispatcher>, settings: QueueSettings) -> Result<()> {
        let tick = Duration::from_secs(2);
        let lease = Duration::from_secs(settings.lease_secs.max(1));
        loop {
            if *shutdown.borrow() {
                break;
            }

            let jobs = match self.claim_due(10, lease).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("claim delivery jobs: {e:#}");
                    Vec::new()
                }
            };
            if jobs.is_empty() {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(tick) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            for job in jobs {
                let outcome = dispatcher.dispatch(&job).await;
                match self.settle(&job, &outcome, &settings).await {
                    Ok(JobState::Dead) => dispatcher.metrics().dead(),
                    Ok(_) => {}
                    Err(e) => warn!(job_id = %job.id, inbox = %job.inbox_url, "settle delivery job: {e:#}"),
                }
            }
        }
        Ok(())
    }

    /// Claims up to `limit` due jobs for this worker. Pending jobs and jobs whose
    /// in-flight lease has lapsed are both eligible.
    pub async fn claim_due(&self, limit: u32, lease: Duration) -> Result<Vec<OutboundJob>> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<Vec<OutboundJob>> {
                let mut conn = open_conn(&db_path)?;
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let now = now_ms();
                let mut out = Vec::new();
                {
                    let mut stmt = tx.prepare(
                        r#"
                        SELECT id, attempt, inbox_url, domain, payload, account_id
                        FROM delivery_jobs
                        WHERE (status = 0 AND next_attempt_at_ms <= ?1)
                           OR (status = 4 AND lease_until_ms <= ?1)
                        ORDER BY next_attempt_at_ms ASC
                        LIMIT ?2
                        "#,
                    )?;
                    let mut rows = stmt.query(params![now, limit])?;
                    while let Some(row) = rows.next()? {
                        out.push(OutboundJob {
                            id: row.get(0)?,
                            attempt: row.get(1)?,
                            inbox_url: row.get(2)?,
                            domain: row.get(3)?,
                            payload: row.get(4)?,
                            account_id: row.get(5)?,
                        });
                    }
                }
                let lease_until = now.saturating_add(lease.as_millis() as i64);
                for job in &out {
                    tx.execute(
                        "UPDATE delivery_jobs SET status = 4, lease_until_ms = ?2 WHERE id = ?1",
                        params![job.id, lease_until],
                    )?;
                }
                tx.commit()?;
                Ok(out)
            }
        })
        .await?
    }

    /// Persists the dispatcher's verdict for one job and returns the job's new state.
    pub async fn settle(&self, job: &OutboundJob, outcome: &DeliveryOutcome, settings: &QueueSettings) -> Result<JobState> {
        match outcome {
            DeliveryOutcome::Delivered => {
                self.mark_delivered(&job.id).await?;
                Ok(JobState::Delivered)
            }
            DeliveryOutcome::SkippedUnavailable => {
                self.mark_dropped(&job.id, "domain unavailable").await?;
                Ok(JobState::Dropped)
            }
            DeliveryOutcome::Failed { error, retryable } => {
                let attempt_no = job.attempt.saturating_add(1);
                if !*retryable || attempt_no >= settings.max_attempts {
                    debug!(job_id = %job.id, inbox = %job.inbox_url, attempt = attempt_no, "delivery job dead");
                    self.mark_dead(&job.id, error).await?;
                    return Ok(JobState::Dead);
                }
                let delay = next_backoff(attempt_no, settings.base_backoff_secs, settings.max_backoff_secs);
                self.reschedule(&job.id, attempt_no, delay, error).await?;
                Ok(JobState::Pending)
            }
        }
    }

    async fn set_status(&self, id: &str, status: i64, err: Option<&str>) -> Result<()> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let id = id.to_string();
            let err = err.map(str::to_string);
            move || -> Result<()> {
                let conn = open_conn(&db_path)?;
                conn.execute(
                    "UPDATE delivery_jobs SET status = ?2, last_error = ?3, lease_until_ms = NULL WHERE id = ?1",
                    params![id, status, err],
                )?;
                Ok(())
            }
        })
        .await??;
        Ok(())
    }

    async fn mark_delivered(&self, id: &str) -> Result<()> {
        self.set_status(id, STATUS_DELIVERED, None).await
    }

    async fn mark_dead(&self, id: &str, err: &str) -> Result<()> {
        self.set_status(id, STATUS_DEAD, Some(err)).await
    }

    async fn mark_dropped(&self, id: &str, reason: &str) -> Result<()> {
        self.set_status(id, STATUS_DROPPED, Some(reason)).await
    }

    async fn reschedule(&self, id: &str, attempt: u32, delay: Duration, err: &str) -> Result<()> {
        let next = now_ms().saturating_add(delay.as_millis() as i64);
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let id = id.to_string();
            let err = err.to_string();
            move || -> Result<()> {
                let conn = open_conn(&db_path)?;
                conn.execute(
                    "UPDATE delivery_jobs SET status = 0, attempt = ?2, next_attempt_at_ms = ?3, last_error = ?4, lease_until_ms = NULL WHERE id = ?1",
                    params![id, attempt, next, err],
                )?;
                Ok(())
            }
        })
        .await??;
        Ok(())
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<QueueStats> {
                let conn = open_conn(&db_path)?;
                let mut stats = QueueStats::default();
                let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM delivery_jobs GROUP BY status")?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    let n: u64 = row.get(1)?;
                    match row.get::<_, i64>(0)? {
                        STATUS_PENDING => stats.pending = n,
                        STATUS_DELIVERED => stats.delivered = n,
                        STATUS_DEAD => stats.dead = n,
                        STATUS_DROPPED => stats.dropped = n,
                        STATUS_IN_FLIGHT => stats.in_flight = n,
                        _ => {}
                    }
                }
                stats.oldest_due_ms = oldest_due_latency(&conn, now_ms())?;
                Ok(stats)
            }
        })
        .await?
    }

    /// Pending size and oldest-due latency in milliseconds, for load checks.
    pub fn health(&self) -> Result<(u64, u64)> {
        let conn = open_conn(&self.db_path)?;
        let pending: u64 = conn.query_row(
            "SELECT COUNT(*) FROM delivery_jobs WHERE status = 0",
            [],
            |r| r.get(0),
        )?;
        Ok((pending, oldest_due_latency(&conn, now_ms())?))
    }

    pub fn jobs(&self) -> Result<Vec<JobSummary>> {
        let conn = open_conn(&self.db_path)?;
        let mut stmt = conn.prepare(
            "SELECT inbox_url, domain, status, attempt, last_error FROM delivery_jobs ORDER BY created_at_ms, inbox_url",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(JobSummary {
                inbox_url: r.get(0)?,
                domain: r.get(1)?,
                state: JobState::from_i64(r.get(2)?),
                attempt: r.get(3)?,
                last_error: r.get(4)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Deletes finished jobs older than `cutoff_ms`.
    pub fn prune_finished_before(&self, cutoff_ms: i64) -> Result<u64> {
        let conn = open_conn(&self.db_path)?;
        let n = conn.execute(
            "DELETE FROM delivery_jobs WHERE status IN (1, 2, 3) AND created_at_ms < ?1",
            params![cutoff_ms],
        )?;
        Ok(n as u64)
    }
}

fn oldest_due_latency(conn: &Connection, now: i64) -> Result<u64> {
    let oldest: Option<i64> = conn.query_row(
        "SELECT MIN(next_attempt_at_ms) FROM delivery_jobs WHERE status = 0 AND next_attempt_at_ms <= ?1",
        params![now],
        |r| r.get(0),
    )?;
    Ok(oldest.map(|o| now.saturating_sub(o).max(0) as u64).unwrap_or(0))
}

fn init_db(path: &Path) -> Result<()> {
    let conn = Connection::open(path).with_context(|| format!("open db: {}", path.display()))?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS delivery_jobs (
          id TEXT PRIMARY KEY,
          created_at_ms INTEGER NOT NULL,
          next_attempt_at_ms INTEGER NOT NULL,
          attempt INTEGER NOT NULL,
          status INTEGER NOT NULL,
          inbox_url TEXT NOT NULL,
          domain TEXT NOT NULL,
          payload BLOB NOT NULL,
          account_id INTEGER NOT NULL,
          lease_until_ms INTEGER NULL,
          last_error TEXT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_delivery_due ON delivery_jobs(status, next_attempt_at_ms);
        "#,
    )?;
    Ok(())
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn new_job_id() -> String {
    let mut b = [0u8; 16];
    OsRng.fill_bytes(&mut b);
    hex::encode(b)
}

pub(crate) fn next_backoff(attempt: u32, base_secs: u64, max_secs: u64) -> Duration {
    let pow = attempt.saturating_sub(1).min(20);
    let secs = base_secs.saturating_mul(1u64 << pow).min(max_secs);
    // jitter 0..1000ms
    let mut b = [0u8; 2];
    OsRng.fill_bytes(&mut b);
    let jitter_ms = u16::from_le_bytes(b) as u64 % 1000;
    Duration::from_secs(secs) + Duration::from_millis(jitter_ms)
}
