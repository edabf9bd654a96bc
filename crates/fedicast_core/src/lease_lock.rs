/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Advisory locks with an expiring lease, stored next to the data they guard.
//!
//! A holder that dies without releasing blocks the key for at most one lease.

use crate::error::RaceConditionError;
use crate::model::now_ms;
use crate::social_db::{blocking, open_conn};
use anyhow::Result;
use rand::RngCore;
use rusqlite::params;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_LEASE: Duration = Duration::from_secs(15 * 60);
const RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct LeaseLock {
    db_path: PathBuf,
    lease: Duration,
}

impl LeaseLock {
    pub fn open(db_path: impl AsRef<Path>, lease: Duration) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let conn = open_conn(&db_path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS status_locks (
              lock_key TEXT PRIMARY KEY,
              owner TEXT NOT NULL,
              expires_at_ms INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self { db_path, lease })
    }

    /// Takes the lease if it is free or expired. `None` when someone else holds it.
    pub fn try_acquire(&self, key: &str) -> Result<Option<LeaseGuard>> {
        let owner = random_owner();
        let now = now_ms();
        let expires = now + self.lease.as_millis() as i64;
        let conn = open_conn(&self.db_path)?;
        let n = conn.execute(
            r#"
            INSERT INTO status_locks(lock_key, owner, expires_at_ms) VALUES (?1, ?2, ?3)
            ON CONFLICT(lock_key) DO UPDATE SET owner = excluded.owner, expires_at_ms = excluded.expires_at_ms
            WHERE status_locks.expires_at_ms <= ?4
            "#,
            params![key, owner, expires, now],
        )?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(LeaseGuard {
            db_path: self.db_path.clone(),
            key: key.to_string(),
            owner,
            released: false,
        }))
    }

    /// Retries for up to `wait`, then fails with [`RaceConditionError`].
    pub async fn acquire(&self, key: &str, wait: Duration) -> Result<LeaseGuard> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let this = self.clone();
            let k = key.to_string();
            if let Some(guard) = blocking(move || this.try_acquire(&k)).await? {
                return Ok(guard);
            }
            if tokio::time::Instant::now() >= deadline {
                debug!(key, "lease busy");
                return Err(RaceConditionError::new(key).into());
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }
}

/// Releases the lease on drop if [`LeaseGuard::release`] was not called.
pub struct LeaseGuard {
    db_path: PathBuf,
    key: String,
    owner: String,
    released: bool,
}

impl LeaseGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Blocking; async callers go through `blocking`.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        release(&self.db_path, &self.key, &self.owner)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let (db_path, key, owner) = (
            std::mem::take(&mut self.db_path),
            std::mem::take(&mut self.key),
            std::mem::take(&mut self.owner),
        );
        let run = move || {
            if let Err(e) = release(&db_path, &key, &owner) {
                warn!(key = %key, "lease release failed: {e:#}");
            }
        };
        // Dropped on an async worker: keep the SQLite write off it.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(run);
            }
            Err(_) => run(),
        }
    }
}

fn release(db_path: &Path, key: &str, owner: &str) -> Result<()> {
    let conn = open_conn(db_path)?;
    conn.execute(
        "DELETE FROM status_locks WHERE lock_key = ?1 AND owner = ?2",
        params![key, owner],
    )?;
    Ok(())
}

fn random_owner() -> String {
    let mut buf = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}
