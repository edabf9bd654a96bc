/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Pushes a ready status into every local feed and live channel that should see it.
//!
//! Runs synchronously against the store; callers on the async side wrap it in
//! `spawn_blocking`. Remote followers are reached through delivery jobs, not here.

use crate::config::FeedSettings;
use crate::feed_store::{FeedId, FeedStore, FilterContext, PushOutcome};
use crate::model::{now_ms, Account, Status, StatusId, Visibility};
use crate::render::status_payload;
use crate::social_db::SocialDb;
use crate::streaming::{self, Streaming};
use anyhow::{Context, Result};
use fedicast_protocol::StreamMessage;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOutKind {
    Create,
    Update,
}

impl FanOutKind {
    fn event(self) -> &'static str {
        match self {
            Self::Create => StreamMessage::UPDATE,
            Self::Update => StreamMessage::STATUS_UPDATE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipientResult {
    Delivered,
    /// Filtered out, already present, or (for updates) not shown in that feed.
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct FanOutReport {
    pub status_id: StatusId,
    pub kind: FanOutKind,
    pub feeds: Vec<(FeedId, RecipientResult)>,
    pub channels: Vec<String>,
}

impl FanOutReport {
    fn new(status_id: StatusId, kind: FanOutKind) -> Self {
        Self {
            status_id,
            kind,
            feeds: Vec::new(),
            channels: Vec::new(),
        }
    }

    pub fn delivered(&self) -> usize {
        self.count(|r| matches!(r, RecipientResult::Delivered))
    }

    pub fn skipped(&self) -> usize {
        self.count(|r| matches!(r, RecipientResult::Skipped))
    }

    pub fn failed(&self) -> usize {
        self.count(|r| matches!(r, RecipientResult::Failed(_)))
    }

    pub fn delivered_to(&self, feed: FeedId) -> bool {
        self.feeds
            .iter()
            .any(|(f, r)| *f == feed && *r == RecipientResult::Delivered)
    }

    fn count(&self, pred: impl Fn(&RecipientResult) -> bool) -> usize {
        self.feeds.iter().filter(|(_, r)| pred(r)).count()
    }
}

#[derive(Clone)]
pub struct FanOut {
    feeds: FeedStore,
    streaming: Streaming,
    settings: FeedSettings,
}

impl FanOut {
    pub fn new(feeds: FeedStore, streaming: Streaming, settings: FeedSettings) -> Self {
        Self { feeds, streaming, settings }
    }

    pub fn feeds(&self) -> &FeedStore {
        &self.feeds
    }

    fn db(&self) -> &SocialDb {
        self.feeds.db()
    }

    pub fn fan_out(&self, status: &Status, kind: FanOutKind) -> Result<FanOutReport> {
        let author = self
            .db()
            .get_account(status.account_id)?
            .with_context(|| format!("author of status {} missing", status.id))?;
        let payload = status_payload(self.db(), status)?;
        let mut report = FanOutReport::new(status.id, kind);

        if author.is_local() {
            let result = self.deliver(FeedId::Home(author.id), status, &payload, kind);
            report.feeds.push((FeedId::Home(author.id), result));
        }

        if status.visibility == Visibility::Direct {
            self.to_mentioned_followers(&author, status, &payload, &mut report);
        } else {
            self.to_followers(&author, status, &payload, &mut report)?;
            if !author.silenced && status.visibility == Visibility::Public && !status.is_reblog() {
                self.broadcast(status, &payload, &mut report)?;
            }
        }

        debug!(
            status_id = status.id,
            kind = ?kind,
            delivered = report.delivered(),
            skipped = report.skipped(),
            failed = report.failed(),
            channels = report.channels.len(),
            "fan-out finished"
        );
        Ok(report)
    }

    /// Direct statuses reach mentioned local accounts that follow the author, nobody else.
    fn to_mentioned_followers(&self, author: &Account, status: &Status, payload: &str, report: &mut FanOutReport) {
        let mentions = match self.db().mentions_of(status.id) {
            Ok(m) => m,
            Err(e) => {
                warn!(status_id = status.id, "mentions unavailable: {e:#}");
                return;
            }
        };
        for mention in mentions {
            let feed = FeedId::Home(mention.account_id);
            if mention.account_id == author.id {
                continue;
            }
            let result = match self.db().get_account(mention.account_id) {
                Ok(Some(acct)) if acct.is_local() => match self.db().is_following(acct.id, author.id) {
                    Ok(true) => self.filtered_deliver(feed, acct.id, status, payload, report.kind),
                    Ok(false) => RecipientResult::Skipped,
                    Err(e) => RecipientResult::Failed(format!("{e:#}")),
                },
                Ok(_) => RecipientResult::Skipped,
                Err(e) => RecipientResult::Failed(format!("{e:#}")),
            };
            if let RecipientResult::Failed(e) = &result {
                warn!(status_id = status.id, feed = %feed, "direct push failed: {e}");
            }
            report.feeds.push((feed, result));
        }
    }

    fn to_followers(&self, author: &Account, status: &Status, payload: &str, report: &mut FanOutReport) -> Result<()> {
        let since = now_ms().saturating_sub(self.settings.active_window_ms());
        let followers = self.db().local_followers_active_since(author.id, since)?;
        for follower in followers {
            let feed = FeedId::Home(follower.id);
            let result = self.filtered_deliver(feed, follower.id, status, payload, report.kind);
            if let RecipientResult::Failed(e) = &result {
                warn!(status_id = status.id, feed = %feed, "home push failed: {e}");
            }
            report.feeds.push((feed, result));

            let lists = match self.db().lists_containing(follower.id, author.id) {
                Ok(lists) => lists,
                Err(e) => {
                    warn!(status_id = status.id, account_id = follower.id, "list lookup failed: {e:#}");
                    continue;
                }
            };
            for list in lists {
                let feed = FeedId::List(list);
                let result = self.filtered_deliver(feed, follower.id, status, payload, report.kind);
                if let RecipientResult::Failed(e) = &result {
                    warn!(status_id = status.id, feed = %feed, "list push failed: {e}");
                }
                report.feeds.push((feed, result));
            }
        }
        Ok(())
    }

    fn broadcast(&self, status: &Status, payload: &str, report: &mut FanOutReport) -> Result<()> {
        let event = report.kind.event();
        for tag in self.db().tags_of(status.id)? {
            self.publish(&streaming::hashtag(&tag), event, payload, report);
            if status.local {
                self.publish(&streaming::hashtag_local(&tag), event, payload, report);
            }
        }
        if status.is_reply_to_other_account() {
            return Ok(());
        }
        self.publish(streaming::PUBLIC, event, payload, report);
        if status.local {
            self.publish(streaming::PUBLIC_LOCAL, event, payload, report);
        }
        Ok(())
    }

    fn publish(&self, channel: &str, event: &str, payload: &str, report: &mut FanOutReport) {
        self.streaming.publish(channel, event, payload.to_string());
        report.channels.push(channel.to_string());
    }

    fn filtered_deliver(&self, feed: FeedId, recipient: i64, status: &Status, payload: &str, kind: FanOutKind) -> RecipientResult {
        match self.feeds.filter(FilterContext::Home, status, recipient) {
            Ok(true) => RecipientResult::Skipped,
            Ok(false) => self.deliver(feed, status, payload, kind),
            Err(e) => RecipientResult::Failed(format!("{e:#}")),
        }
    }

    fn deliver(&self, feed: FeedId, status: &Status, payload: &str, kind: FanOutKind) -> RecipientResult {
        let pushed = match kind {
            FanOutKind::Create => self
                .feeds
                .push_with_payload(feed, status, payload)
                .map(|o| matches!(o, PushOutcome::Inserted { .. })),
            FanOutKind::Update => self.feeds.push_update(feed, status, payload),
        };
        match pushed {
            Ok(true) => RecipientResult::Delivered,
            Ok(false) => RecipientResult::Skipped,
            Err(e) => RecipientResult::Failed(format!("{e:#}")),
        }
    }
}
