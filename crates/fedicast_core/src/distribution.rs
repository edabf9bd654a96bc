/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Entry points that turn a stored status into feed pushes, notifications and
//! outbound delivery jobs.

use crate::activity;
use crate::config::FeedSettings;
use crate::delivery_queue::DeliveryQueue;
use crate::fan_out::{FanOut, FanOutKind, FanOutReport};
use crate::feed_store::FeedStore;
use crate::model::{now_ms, Account, AccountId, FollowUpKind, NewStatus, NotificationKind, Status, StatusId, Visibility};
use crate::notify::NotifyService;
use crate::social_db::{blocking, SocialDb};
use crate::streaming::{self, Streaming};
use anyhow::{Context, Result};
use fedicast_protocol::StreamMessage;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Result of publishing a status authored on this server.
#[derive(Debug)]
pub struct LocalPost {
    pub status: Status,
    pub fan_out: Option<FanOutReport>,
    pub delivery_jobs: u64,
}

#[derive(Clone)]
pub struct Distributor {
    db: SocialDb,
    fan_out: FanOut,
    notify: NotifyService,
    streaming: Streaming,
    queue: DeliveryQueue,
    settings: FeedSettings,
    base_url: String,
}

impl Distributor {
    pub fn new(
        feeds: FeedStore,
        streaming: Streaming,
        queue: DeliveryQueue,
        settings: FeedSettings,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            db: feeds.db().clone(),
            notify: NotifyService::new(feeds.clone(), streaming.clone()),
            fan_out: FanOut::new(feeds, streaming.clone(), settings),
            streaming,
            queue,
            settings,
            base_url: base_url.into(),
        }
    }

    pub fn db(&self) -> &SocialDb {
        &self.db
    }

    pub fn feeds(&self) -> &FeedStore {
        self.fan_out.feeds()
    }

    pub fn notify(&self) -> &NotifyService {
        &self.notify
    }

    /// Post-create path for any status. Fan-out is skipped for statuses older
    /// than the real-time window unless `timestamps_overridden` is set.
    pub async fn distribute(&self, status_id: StatusId, timestamps_overridden: bool) -> Result<Option<FanOutReport>> {
        let this = self.clone();
        blocking(move || this.distribute_sync(status_id, timestamps_overridden)).await
    }

    fn distribute_sync(&self, status_id: StatusId, timestamps_overridden: bool) -> Result<Option<FanOutReport>> {
        let status = self
            .db
            .get_status(status_id)?
            .with_context(|| format!("status {status_id} missing"))?;
        if status.deleted_at_ms.is_some() {
            return Ok(None);
        }

        if !status.is_reblog() {
            self.db.enqueue_follow_up(FollowUpKind::LinkCrawl, status.id, now_ms())?;
        }
        if let Err(e) = self.notify_reblogged_author(&status) {
            warn!(status_id, "reblog notification failed: {e:#}");
        }
        self.notify_mentioned(&status);

        let now = now_ms();
        if !timestamps_overridden && !status.within_realtime_window(now, self.settings.realtime_window_ms()) {
            debug!(status_id, "outside real-time window, fan-out skipped");
            return Ok(None);
        }
        self.fan_out.fan_out(&status, FanOutKind::Create).map(Some)
    }

    /// Re-broadcast after an edit: update events to feeds already showing the
    /// status, `update` notifications to local accounts that reblogged it.
    pub async fn distribute_update(&self, status_id: StatusId) -> Result<FanOutReport> {
        let this = self.clone();
        let (status, report) = blocking(move || {
            let status = this
                .db
                .get_status(status_id)?
                .with_context(|| format!("status {status_id} missing"))?;
            let report = this.fan_out.fan_out(&status, FanOutKind::Update)?;
            for reblog_id in this.db.reblog_ids_of(status_id)? {
                let Some(reblog) = this.db.get_status(reblog_id)? else {
                    continue;
                };
                if let Err(e) = this.notify_local(reblog.account_id, NotificationKind::Update, status.account_id, Some(&status)) {
                    warn!(status_id, "update notification failed: {e:#}");
                }
            }
            Ok((status, report))
        })
        .await?;

        if status.local {
            let this = self.clone();
            let st = status.clone();
            let (author, payload) = blocking(move || {
                let author = this.author_of(&st)?;
                let payload = activity::update_activity(&this.db, &st, &author)?;
                Ok((author, payload))
            })
            .await?;
            self.federate(&status, &author, &payload).await?;
        }
        Ok(report)
    }

    /// Stores, distributes and federates a status written on this server.
    pub async fn create_local_status(&self, mut new: NewStatus, mentions: Vec<AccountId>) -> Result<LocalPost> {
        new.local = true;
        let this = self.clone();
        let status = blocking(move || {
            let status = this.db.insert_status(&new, &this.base_url)?;
            if !status.is_reblog() {
                this.db.set_tags(status.id, &activity::extract_hashtags(&new.text))?;
                for account_id in mentions {
                    this.db.add_mention(status.id, account_id, false)?;
                }
            }
            this.db.touch_account_activity(status.account_id, now_ms())?;
            Ok(status)
        })
        .await?;
        info!(status_id = status.id, visibility = ?status.visibility, "local status created");

        let fan_out = self.distribute(status.id, false).await?;

        let this = self.clone();
        let st = status.clone();
        let (author, payload) = blocking(move || {
            let author = this.author_of(&st)?;
            let payload = match st.reblog_of_id {
                Some(original_id) => {
                    let original = this
                        .db
                        .get_status(original_id)?
                        .with_context(|| format!("reblogged status {original_id} missing"))?;
                    activity::announce_activity(&st, &original, &author)
                }
                None => activity::create_activity(&this.db, &st, &author)?,
            };
            Ok((author, payload))
        })
        .await?;
        let delivery_jobs = self.federate(&status, &author, &payload).await?;
        Ok(LocalPost {
            status,
            fan_out,
            delivery_jobs,
        })
    }

    /// Tombstones a status and its reblogs and pulls them from every feed.
    pub async fn delete_status(&self, status_id: StatusId) -> Result<bool> {
        let this = self.clone();
        let deleted = blocking(move || {
            let Some(status) = this.db.get_status(status_id)? else {
                return Ok(None);
            };
            if !this.db.mark_status_deleted(status_id)? {
                return Ok(None);
            }
            for reblog_id in this.db.reblog_ids_of(status_id)? {
                this.db.mark_status_deleted(reblog_id)?;
            }
            let removed = this.fan_out.feeds().remove_status(status_id)?;
            debug!(status_id, removed, "status removed from feeds");
            if status.visibility == Visibility::Public && !status.is_reblog() {
                this.streaming.publish(streaming::PUBLIC, StreamMessage::DELETE, status_id.to_string());
                if status.local {
                    this.streaming.publish(streaming::PUBLIC_LOCAL, StreamMessage::DELETE, status_id.to_string());
                }
            }
            Ok(Some(status))
        })
        .await?;
        let Some(status) = deleted else {
            return Ok(false);
        };

        if status.local {
            let this = self.clone();
            let st = status.clone();
            let author = blocking(move || this.author_of(&st)).await?;
            let payload = activity::delete_activity(&status, &author);
            self.federate(&status, &author, &payload).await?;
        }
        Ok(true)
    }

    /// Enqueues one job per distinct remote inbox that should receive `payload`.
    async fn federate(&self, status: &Status, author: &Account, payload: &serde_json::Value) -> Result<u64> {
        let this = self.clone();
        let st = status.clone();
        let inboxes = blocking(move || this.remote_inboxes(&st)).await?;
        if inboxes.is_empty() {
            debug!(status_id = status.id, "no remote inboxes");
            return Ok(0);
        }
        let body = serde_json::to_vec(payload)?;
        let n = self.queue.enqueue(body, author.id, inboxes).await?;
        debug!(status_id = status.id, jobs = n, "delivery jobs enqueued");
        Ok(n)
    }

    /// Remote followers (shared inbox preferred) plus remote mentions; direct
    /// statuses go to mentions only.
    fn remote_inboxes(&self, status: &Status) -> Result<Vec<String>> {
        let mut out = BTreeSet::new();
        for m in self.db.mentions_of(status.id)? {
            if let Some(acct) = self.db.get_account(m.account_id)? {
                if let (false, Some(inbox)) = (acct.is_local(), acct.preferred_inbox()) {
                    out.insert(inbox.to_string());
                }
            }
        }
        if status.visibility != Visibility::Direct {
            for follower in self.db.remote_followers(status.account_id)? {
                if let Some(inbox) = follower.preferred_inbox() {
                    out.insert(inbox.to_string());
                }
            }
            if let Some(original_id) = status.reblog_of_id {
                if let Some(original) = self.db.get_status(original_id)? {
                    if let Some(acct) = self.db.get_account(original.account_id)? {
                        if let (false, Some(inbox)) = (acct.is_local(), acct.preferred_inbox()) {
                            out.insert(inbox.to_string());
                        }
                    }
                }
            }
        }
        Ok(out.into_iter().collect())
    }

    fn author_of(&self, status: &Status) -> Result<Account> {
        self.db
            .get_account(status.account_id)?
            .with_context(|| format!("author of status {} missing", status.id))
    }

    /// A reblog of a local account's status notifies that account, unless the
    /// reblogger is a group it already follows.
    fn notify_reblogged_author(&self, status: &Status) -> Result<()> {
        let Some(original_id) = status.reblog_of_id else {
            return Ok(());
        };
        let Some(original) = self.db.get_status(original_id)? else {
            return Ok(());
        };
        let reblogger = self.author_of(status)?;
        if reblogger.is_group() && self.db.is_following(original.account_id, reblogger.id)? {
            return Ok(());
        }
        self.notify_local(original.account_id, NotificationKind::Reblog, reblogger.id, Some(status))?;
        Ok(())
    }

    fn notify_mentioned(&self, status: &Status) {
        let mentions = match self.db.mentions_of(status.id) {
            Ok(m) => m,
            Err(e) => {
                warn!(status_id = status.id, "mentions unavailable: {e:#}");
                return;
            }
        };
        for m in mentions.into_iter().filter(|m| !m.silent) {
            if let Err(e) = self.notify_local(m.account_id, NotificationKind::Mention, status.account_id, Some(status)) {
                warn!(status_id = status.id, account_id = m.account_id, "mention notification failed: {e:#}");
            }
        }
    }

    fn notify_local(&self, recipient: AccountId, kind: NotificationKind, from: AccountId, status: Option<&Status>) -> Result<()> {
        match self.db.get_account(recipient)? {
            Some(acct) if acct.is_local() => {
                self.notify.notify(recipient, kind, from, status)?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::feed_store::test_support::feed_store;

    pub fn distributor(db: &SocialDb, streaming: &Streaming) -> Distributor {
        let queue = DeliveryQueue::open(db.path()).unwrap();
        Distributor::new(
            feed_store(db, streaming),
            streaming.clone(),
            queue,
            FeedSettings::default(),
            "https://local.test",
        )
    }
}
