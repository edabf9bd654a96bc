/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Periodic background work: budgeted status cleanup and table pruning.
//!
//! Cleanup yields to delivery. When the outbound queue or the follow-up queue is
//! backed up the whole cycle is skipped rather than slowing the hot paths down.

use crate::config::{MaintenanceConfig, QueueThreshold};
use crate::delivery_queue::DeliveryQueue;
use crate::distribution::Distributor;
use crate::model::{now_ms, CleanupPolicy};
use crate::social_db::blocking;
use anyhow::Result;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const LAST_POLICY_KEY: &str = "statuses_cleanup.last_policy_id";
const POLICY_PAGE: u32 = 100;
const INBOX_SEEN_TTL_MS: i64 = 30 * 24 * 3600 * 1000;
const FINISHED_JOB_TTL_MS: i64 = 7 * 24 * 3600 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupRun {
    pub skipped_under_load: bool,
    pub budget: u32,
    pub deleted: u32,
}

#[derive(Clone)]
pub struct StatusesCleanupScheduler {
    distributor: Distributor,
    queue: DeliveryQueue,
    cfg: MaintenanceConfig,
    workers: u32,
}

impl StatusesCleanupScheduler {
    pub fn new(distributor: Distributor, queue: DeliveryQueue, cfg: MaintenanceConfig, workers: usize) -> Self {
        Self {
            distributor,
            queue,
            cfg,
            workers: workers.max(1) as u32,
        }
    }

    pub fn budget(&self) -> u32 {
        self.cfg
            .per_thread_budget
            .saturating_mul(self.workers)
            .min(self.cfg.max_budget)
    }

    pub async fn under_load(&self) -> Result<bool> {
        let queue = self.queue.clone();
        let db = self.distributor.db().clone();
        let cfg = self.cfg.clone();
        blocking(move || {
            let (pending, latency_ms) = queue.health()?;
            if exceeds(&cfg.delivery_threshold, pending, latency_ms) {
                debug!(pending, latency_ms, "delivery queue under load");
                return Ok(true);
            }
            let (due, latency_ms) = db.follow_up_backlog(now_ms())?;
            if exceeds(&cfg.follow_up_threshold, due, latency_ms) {
                debug!(due, latency_ms, "follow-up queue under load");
                return Ok(true);
            }
            Ok(false)
        })
        .await
    }

    /// One cycle. Starts after the policy that used up the previous cycle's budget, wraps
    /// to the first policy and keeps going until the budget is spent or a full pass
    /// deletes nothing.
    pub async fn run_once(&self) -> Result<CleanupRun> {
        let budget = self.budget();
        if self.under_load().await? {
            return Ok(CleanupRun {
                skipped_under_load: true,
                budget,
                deleted: 0,
            });
        }

        let db = self.distributor.db().clone();
        let mut first_id = {
            let db = db.clone();
            blocking(move || db.get_local_meta(LAST_POLICY_KEY)).await?
        }
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0);

        let mut remaining = budget;
        let mut cursor = 0i64;
        'passes: loop {
            let mut pass_deleted = 0u32;
            let mut after = first_id;
            loop {
                let page = {
                    let db = db.clone();
                    blocking(move || db.enabled_cleanup_policies_after(after, POLICY_PAGE)).await?
                };
                let exhausted = (page.len() as u32) < POLICY_PAGE;
                for policy in page {
                    let n = self.invoke_policy(&policy, remaining).await?;
                    pass_deleted += n;
                    remaining = remaining.saturating_sub(n);
                    after = policy.id;
                    if remaining == 0 {
                        cursor = policy.id;
                        break 'passes;
                    }
                }
                if exhausted {
                    break;
                }
            }
            if first_id == 0 && pass_deleted == 0 {
                break;
            }
            first_id = 0;
        }
        let deleted = budget - remaining;

        blocking(move || db.set_local_meta(LAST_POLICY_KEY, &cursor.to_string())).await?;
        if deleted > 0 {
            info!(deleted, budget, "statuses cleanup");
        }
        Ok(CleanupRun {
            skipped_under_load: false,
            budget,
            deleted,
        })
    }

    /// Deletes up to the per-account budget of the policy's eligible statuses.
    async fn invoke_policy(&self, policy: &CleanupPolicy, remaining: u32) -> Result<u32> {
        let limit = self.cfg.per_account_budget.min(remaining);
        let cutoff = now_ms() - (policy.min_status_age_secs as i64).saturating_mul(1000);
        let candidates = {
            let db = self.distributor.db().clone();
            let policy = policy.clone();
            blocking(move || db.statuses_eligible_for_cleanup(&policy, cutoff, limit)).await?
        };
        let mut deleted = 0;
        for status_id in candidates {
            if self.distributor.delete_status(status_id).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Drops old inbox dedup markers and finished delivery jobs.
    pub async fn prune_once(&self) -> Result<(u64, u64)> {
        let db = self.distributor.db().clone();
        let queue = self.queue.clone();
        let now = now_ms();
        let seen = blocking(move || db.prune_inbox_seen_before(now - INBOX_SEEN_TTL_MS)).await?;
        let jobs = blocking(move || queue.prune_finished_before(now - FINISHED_JOB_TTL_MS)).await?;
        if seen > 0 || jobs > 0 {
            info!(inbox_seen = seen, delivery_jobs = jobs, "maintenance pruned");
        }
        Ok((seen, jobs))
    }

    pub fn start(self, mut shutdown: watch::Receiver<bool>) {
        if !self.cfg.enabled {
            info!("maintenance disabled");
            return;
        }
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(self.cfg.interval_secs.max(5)));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                    _ = tick.tick() => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                match self.run_once().await {
                    Ok(run) if run.skipped_under_load => debug!("statuses cleanup skipped under load"),
                    Ok(_) => {}
                    Err(e) => warn!("statuses cleanup error: {e:#}"),
                }
                if let Err(e) = self.prune_once().await {
                    warn!("maintenance prune error: {e:#}");
                }
            }
        });
    }
}

fn exceeds(threshold: &QueueThreshold, size: u64, latency_ms: u64) -> bool {
    size > threshold.max_size || latency_ms > threshold.max_latency_secs.saturating_mul(1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::test_support::distributor;
    use crate::model::{Account, NewStatus, Visibility};
    use crate::social_db::test_support::{local_account, temp_db};
    use crate::social_db::SocialDb;
    use crate::streaming::Streaming;

    const DAY_MS: i64 = 24 * 3600 * 1000;

    fn scheduler(db: &SocialDb, cfg: MaintenanceConfig, workers: usize) -> StatusesCleanupScheduler {
        let d = distributor(db, &Streaming::default());
        let queue = DeliveryQueue::open(db.path()).unwrap();
        StatusesCleanupScheduler::new(d, queue, cfg, workers)
    }

    fn old_statuses(db: &SocialDb, author: &Account, n: usize) -> Vec<i64> {
        (0..n)
            .map(|i| {
                let mut new = NewStatus::new(author.id, format!("old {i}"), Visibility::Public);
                new.created_at_ms = now_ms() - 10 * DAY_MS;
                db.insert_status(&new, "https://local.test").unwrap().id
            })
            .collect()
    }

    fn live(db: &SocialDb, ids: &[i64]) -> usize {
        ids.iter()
            .filter(|id| db.get_status(**id).unwrap().unwrap().deleted_at_ms.is_none())
            .count()
    }

    #[test]
    fn budget_scales_with_workers_up_to_cap() {
        let (_dir, db) = temp_db();
        assert_eq!(scheduler(&db, MaintenanceConfig::default(), 5).budget(), 30);
        assert_eq!(scheduler(&db, MaintenanceConfig::default(), 100).budget(), 150);
    }

    #[tokio::test]
    async fn skips_cycle_when_delivery_queue_is_backed_up() {
        let (_dir, db) = temp_db();
        let mut cfg = MaintenanceConfig::default();
        cfg.delivery_threshold.max_size = 1;
        let s = scheduler(&db, cfg, 4);
        let alice = local_account(&db, "alice");
        let ids = old_statuses(&db, &alice, 2);
        db.upsert_cleanup_policy(alice.id, 3600, true, true).unwrap();
        s.queue
            .enqueue(b"{}".to_vec(), alice.id, vec!["https://a.example/inbox".into(), "https://b.example/inbox".into()])
            .await
            .unwrap();

        let run = s.run_once().await.unwrap();
        assert!(run.skipped_under_load);
        assert_eq!(live(&db, &ids), 2);
    }

    #[tokio::test]
    async fn per_account_budget_and_pinned_statuses() {
        let (_dir, db) = temp_db();
        let s = scheduler(&db, MaintenanceConfig::default(), 4);
        let alice = local_account(&db, "alice");
        let ids = old_statuses(&db, &alice, 7);
        db.set_status_pinned(ids[0], true).unwrap();
        let mut fresh = NewStatus::new(alice.id, "fresh", Visibility::Public);
        fresh.created_at_ms = now_ms();
        let fresh = db.insert_status(&fresh, "https://local.test").unwrap();
        db.upsert_cleanup_policy(alice.id, 7 * 24 * 3600, true, true).unwrap();

        // Five per visit, then a second pass over the same policy picks up the rest.
        let run = s.run_once().await.unwrap();
        assert_eq!(run.deleted, 6);
        assert_eq!(live(&db, &ids), 1);
        assert_eq!(s.run_once().await.unwrap().deleted, 0);
        assert!(db.get_status(ids[0]).unwrap().unwrap().deleted_at_ms.is_none());
        assert!(db.get_status(fresh.id).unwrap().unwrap().deleted_at_ms.is_none());
    }

    #[tokio::test]
    async fn resumes_after_last_processed_policy() {
        let (_dir, db) = temp_db();
        let cfg = MaintenanceConfig {
            per_thread_budget: 5,
            ..MaintenanceConfig::default()
        };
        let s = scheduler(&db, cfg, 1);
        let alice = local_account(&db, "alice");
        let bob = local_account(&db, "bob");
        let a = old_statuses(&db, &alice, 6);
        let b = old_statuses(&db, &bob, 6);
        db.upsert_cleanup_policy(alice.id, 3600, false, true).unwrap();
        let bob_policy = db.upsert_cleanup_policy(bob.id, 3600, false, true).unwrap();

        assert_eq!(s.run_once().await.unwrap().deleted, 5);
        assert_eq!((live(&db, &a), live(&db, &b)), (1, 6));

        assert_eq!(s.run_once().await.unwrap().deleted, 5);
        assert_eq!((live(&db, &a), live(&db, &b)), (1, 1));
        assert_eq!(db.get_local_meta(LAST_POLICY_KEY).unwrap(), Some(bob_policy.to_string()));

        // Nothing after bob: wrap around, then reset the cursor once the budget outlives the work.
        assert_eq!(s.run_once().await.unwrap().deleted, 2);
        assert_eq!((live(&db, &a), live(&db, &b)), (0, 0));
        assert_eq!(db.get_local_meta(LAST_POLICY_KEY).unwrap(), Some("0".to_string()));
    }

    #[tokio::test]
    async fn prune_drops_old_inbox_markers() {
        let (_dir, db) = temp_db();
        let s = scheduler(&db, MaintenanceConfig::default(), 1);
        assert!(db.mark_inbox_seen("urn:test:1").unwrap());
        let (seen, jobs) = s.prune_once().await.unwrap();
        assert_eq!((seen, jobs), (0, 0));
        assert!(!db.mark_inbox_seen("urn:test:1").unwrap());
    }
}
