/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Bounded per-recipient timelines of status references.
//!
//! A feed keeps its entries in arrival order (`seq`). Pushing is idempotent per
//! status id, a reblog displaces earlier entries for the same underlying status,
//! and a feed whose viewer sits at the top is trimmed from the high-water mark
//! down to the low-water mark on the next push.

use crate::config::FeedSettings;
use crate::model::{AccountId, Status, StatusId};
use crate::render::status_payload;
use crate::social_db::SocialDb;
use crate::streaming::{self, Streaming};
use anyhow::{bail, Context, Result};
use fedicast_protocol::StreamMessage;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedId {
    Home(AccountId),
    List(i64),
}

impl FeedId {
    pub fn parse(s: &str) -> Result<Self> {
        let (kind, id) = s.split_once(':').context("feed id without kind")?;
        let id: i64 = id.parse().with_context(|| format!("feed id: {s}"))?;
        match kind {
            "home" => Ok(Self::Home(id)),
            "list" => Ok(Self::List(id)),
            _ => bail!("unknown feed kind: {kind}"),
        }
    }

    /// Streaming channel the feed's live events go to.
    pub fn channel(&self) -> String {
        match self {
            Self::Home(id) => streaming::home(*id),
            Self::List(id) => streaming::list(*id),
        }
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Home(id) => write!(f, "home:{id}"),
            Self::List(id) => write!(f, "list:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterContext {
    Home,
    Mentions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Inserted { at_top: bool },
    AlreadyPresent,
    /// An original arrived while a reblog of it is already shown.
    Redundant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub status_id: StatusId,
    pub reblog_of_id: Option<StatusId>,
    pub account_id: AccountId,
}

#[derive(Clone)]
pub struct FeedStore {
    db: SocialDb,
    streaming: Streaming,
    settings: FeedSettings,
}

impl FeedStore {
    pub fn open(db: SocialDb, streaming: Streaming, settings: FeedSettings) -> Result<Self> {
        let conn = db.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS feed_entries (
              feed_id TEXT NOT NULL,
              status_id INTEGER NOT NULL,
              reblog_of_id INTEGER NULL,
              account_id INTEGER NOT NULL,
              origin_account_id INTEGER NULL,
              seq INTEGER NOT NULL,
              PRIMARY KEY(feed_id, status_id)
            );
            CREATE INDEX IF NOT EXISTS idx_feed_entries_seq ON feed_entries(feed_id, seq);
            CREATE INDEX IF NOT EXISTS idx_feed_entries_status ON feed_entries(status_id);
            CREATE INDEX IF NOT EXISTS idx_feed_entries_reblog ON feed_entries(reblog_of_id);

            CREATE TABLE IF NOT EXISTS feed_state (
              feed_id TEXT PRIMARY KEY,
              at_top INTEGER NOT NULL DEFAULT 1,
              unread INTEGER NOT NULL DEFAULT 0,
              seq INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )?;
        Ok(Self { db, streaming, settings })
    }

    pub fn db(&self) -> &SocialDb {
        &self.db
    }

    pub fn push(&self, feed: FeedId, status: &Status) -> Result<PushOutcome> {
        let payload = status_payload(&self.db, status)?;
        self.push_with_payload(feed, status, &payload)
    }

    /// Same as [`push`](Self::push) with an already-rendered payload, so a
    /// fan-out renders once for every recipient.
    pub fn push_with_payload(&self, feed: FeedId, status: &Status, payload: &str) -> Result<PushOutcome> {
        let key = feed.to_string();
        let origin_account_id = match status.reblog_of_id {
            Some(id) => self.db.get_status(id)?.map(|s| s.account_id),
            None => None,
        };

        let mut conn = self.db.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if entry_exists(&tx, &key, status.id)? {
            return Ok(PushOutcome::AlreadyPresent);
        }
        match status.reblog_of_id {
            Some(original) => {
                tx.execute(
                    "DELETE FROM feed_entries WHERE feed_id = ?1 AND (status_id = ?2 OR reblog_of_id = ?2)",
                    params![key, original],
                )?;
            }
            None => {
                let shown_as_reblog = tx
                    .query_row(
                        "SELECT 1 FROM feed_entries WHERE feed_id = ?1 AND reblog_of_id = ?2",
                        params![key, status.id],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();
                if shown_as_reblog {
                    return Ok(PushOutcome::Redundant);
                }
            }
        }

        let (at_top, seq) = next_seq(&tx, &key)?;
        tx.execute(
            r#"
            INSERT INTO feed_entries(feed_id, status_id, reblog_of_id, account_id, origin_account_id, seq)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![key, status.id, status.reblog_of_id, status.account_id, origin_account_id, seq],
        )?;
        if at_top {
            let count: i64 = tx.query_row(
                "SELECT COUNT(*) FROM feed_entries WHERE feed_id = ?1",
                params![key],
                |r| r.get(0),
            )?;
            if count > self.settings.max_items as i64 {
                trim(&tx, &key, self.settings.trim_to)?;
                debug!(feed = %key, from = count, to = self.settings.trim_to, "feed trimmed");
            }
        } else {
            tx.execute("UPDATE feed_state SET unread = unread + 1 WHERE feed_id = ?1", params![key])?;
        }
        tx.commit()?;

        self.streaming.publish(&feed.channel(), StreamMessage::UPDATE, payload.to_string());
        Ok(PushOutcome::Inserted { at_top })
    }

    /// Announces an edit to a feed that already shows the status. Returns false otherwise.
    pub fn push_update(&self, feed: FeedId, status: &Status, payload: &str) -> Result<bool> {
        let conn = self.db.conn()?;
        let present = conn
            .query_row(
                "SELECT 1 FROM feed_entries WHERE feed_id = ?1 AND (status_id = ?2 OR reblog_of_id = ?2)",
                params![feed.to_string(), status.id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if present {
            self.streaming.publish(&feed.channel(), StreamMessage::STATUS_UPDATE, payload.to_string());
        }
        Ok(present)
    }

    /// Drops the status and every reblog of it from all feeds. Returns removed entry count.
    pub fn remove_status(&self, status_id: StatusId) -> Result<usize> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let affected: Vec<(String, StatusId)> = {
            let mut stmt = tx.prepare(
                "SELECT feed_id, status_id FROM feed_entries WHERE status_id = ?1 OR reblog_of_id = ?1",
            )?;
            let rows = stmt.query_map(params![status_id], |r| Ok((r.get(0)?, r.get(1)?)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.execute(
            "DELETE FROM feed_entries WHERE status_id = ?1 OR reblog_of_id = ?1",
            params![status_id],
        )?;
        tx.commit()?;

        for (feed, removed) in &affected {
            if let Ok(feed) = FeedId::parse(feed) {
                self.streaming.publish(&feed.channel(), StreamMessage::DELETE, removed.to_string());
            }
        }
        Ok(affected.len())
    }

    /// Removes everything authored or reblogged from `account_id`, e.g. after a block.
    pub fn unmerge_account(&self, feed: FeedId, account_id: AccountId) -> Result<usize> {
        let conn = self.db.conn()?;
        let n = conn.execute(
            "DELETE FROM feed_entries WHERE feed_id = ?1 AND (account_id = ?2 OR origin_account_id = ?2)",
            params![feed.to_string(), account_id],
        )?;
        Ok(n)
    }

    pub fn mark_top(&self, feed: FeedId, at_top: bool) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            r#"
            INSERT INTO feed_state(feed_id, at_top, unread, seq) VALUES (?1, ?2, 0, 0)
            ON CONFLICT(feed_id) DO UPDATE SET
              at_top = excluded.at_top,
              unread = CASE WHEN excluded.at_top = 1 THEN 0 ELSE unread END
            "#,
            params![feed.to_string(), at_top],
        )?;
        Ok(())
    }

    pub fn unread(&self, feed: FeedId) -> Result<u64> {
        let conn = self.db.conn()?;
        let n: Option<u64> = conn
            .query_row(
                "SELECT unread FROM feed_state WHERE feed_id = ?1",
                params![feed.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(n.unwrap_or(0))
    }

    /// Newest first.
    pub fn entries(&self, feed: FeedId, limit: u32) -> Result<Vec<FeedEntry>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            "SELECT status_id, reblog_of_id, account_id FROM feed_entries WHERE feed_id = ?1 ORDER BY seq DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![feed.to_string(), limit], |r| {
            Ok(FeedEntry {
                status_id: r.get(0)?,
                reblog_of_id: r.get(1)?,
                account_id: r.get(2)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn contains(&self, feed: FeedId, status_id: StatusId) -> Result<bool> {
        let conn = self.db.conn()?;
        entry_exists(&conn, &feed.to_string(), status_id)
    }

    /// True when `status` must not reach `recipient` in this context.
    pub fn filter(&self, context: FilterContext, status: &Status, recipient: AccountId) -> Result<bool> {
        match context {
            FilterContext::Home => self.filter_from_home(status, recipient),
            FilterContext::Mentions => self.filter_from_mentions(status, recipient),
        }
    }

    fn filter_from_home(&self, status: &Status, recipient: AccountId) -> Result<bool> {
        let db = &self.db;
        let author = status.account_id;
        if recipient == author {
            return Ok(false);
        }
        if db.blocking_either_way(recipient, author)? || db.is_muting(recipient, author)? {
            return Ok(true);
        }
        if self.domain_blocked(recipient, author)? {
            return Ok(true);
        }

        if let Some(original_id) = status.reblog_of_id {
            if db.follow_show_reblogs(recipient, author)? == Some(false) {
                return Ok(true);
            }
            let Some(original) = db.get_status(original_id)? else {
                return Ok(true);
            };
            let origin = original.account_id;
            if origin == recipient {
                return Ok(false);
            }
            return Ok(db.blocking_either_way(recipient, origin)?
                || db.is_muting(recipient, origin)?
                || self.domain_blocked(recipient, origin)?);
        }

        if let Some(target) = status.in_reply_to_account_id {
            if target != author && target != recipient && !db.is_following(recipient, target)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn filter_from_mentions(&self, status: &Status, recipient: AccountId) -> Result<bool> {
        let db = &self.db;
        let author = status.account_id;
        if recipient == author {
            return Ok(true);
        }
        Ok(db.blocking_either_way(recipient, author)?
            || db.is_muting(recipient, author)?
            || self.domain_blocked(recipient, author)?)
    }

    fn domain_blocked(&self, recipient: AccountId, author: AccountId) -> Result<bool> {
        let Some(account) = self.db.get_account(author)? else {
            return Ok(false);
        };
        self.db.is_domain_blocked_by(recipient, account.domain.as_deref())
    }
}

fn entry_exists(conn: &Connection, feed: &str, status_id: StatusId) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM feed_entries WHERE feed_id = ?1 AND status_id = ?2",
            params![feed, status_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

/// Bumps the feed's sequence and returns `(at_top, seq)`. Feeds start at top.
fn next_seq(tx: &Transaction<'_>, feed: &str) -> Result<(bool, i64)> {
    tx.execute(
        "INSERT OR IGNORE INTO feed_state(feed_id, at_top, unread, seq) VALUES (?1, 1, 0, 0)",
        params![feed],
    )?;
    tx.execute("UPDATE feed_state SET seq = seq + 1 WHERE feed_id = ?1", params![feed])?;
    let row = tx.query_row(
        "SELECT at_top, seq FROM feed_state WHERE feed_id = ?1",
        params![feed],
        |r| Ok((r.get::<_, bool>(0)?, r.get::<_, i64>(1)?)),
    )?;
    Ok(row)
}

fn trim(tx: &Transaction<'_>, feed: &str, keep: u32) -> Result<()> {
    tx.execute(
        r#"
        DELETE FROM feed_entries WHERE feed_id = ?1 AND seq NOT IN (
          SELECT seq FROM feed_entries WHERE feed_id = ?1 ORDER BY seq DESC LIMIT ?2
        )
        "#,
        params![feed, keep],
    )?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn feed_store(db: &SocialDb, streaming: &Streaming) -> FeedStore {
        FeedStore::open(db.clone(), streaming.clone(), FeedSettings::default()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::feed_store;
    use super::*;
    use crate::model::{NewStatus, Visibility};
    use crate::social_db::test_support::{local_account, remote_account, temp_db};
    use crate::streaming::test_support::drain;

    fn post(db: &SocialDb, author: AccountId, text: &str) -> Status {
        db.insert_status(&NewStatus::new(author, text, Visibility::Public), "https://local.test").unwrap()
    }

    fn reblog(db: &SocialDb, by: AccountId, of: &Status) -> Status {
        let mut n = NewStatus::new(by, "", Visibility::Public);
        n.reblog_of_id = Some(of.id);
        db.insert_status(&n, "https://local.test").unwrap()
    }

    #[test]
    fn push_is_idempotent() {
        let (_dir, db) = temp_db();
        let s = Streaming::default();
        let store = feed_store(&db, &s);
        let a = local_account(&db, "a");
        let st = post(&db, a.id, "hi");
        let feed = FeedId::Home(a.id);
        assert_eq!(store.push(feed, &st).unwrap(), PushOutcome::Inserted { at_top: true });
        assert_eq!(store.push(feed, &st).unwrap(), PushOutcome::AlreadyPresent);
        assert_eq!(store.entries(feed, 100).unwrap().len(), 1);
    }

    #[test]
    fn reblog_supersedes_original() {
        let (_dir, db) = temp_db();
        let s = Streaming::default();
        let store = feed_store(&db, &s);
        let a = local_account(&db, "a");
        let b = local_account(&db, "b");
        let reader = local_account(&db, "reader");
        let feed = FeedId::Home(reader.id);

        let orig = post(&db, a.id, "original");
        let other = post(&db, a.id, "other");
        store.push(feed, &orig).unwrap();
        store.push(feed, &other).unwrap();
        let rb = reblog(&db, b.id, &orig);
        store.push(feed, &rb).unwrap();

        let entries = store.entries(feed, 100).unwrap();
        assert_eq!(entries.iter().map(|e| e.status_id).collect::<Vec<_>>(), vec![rb.id, other.id]);
        // The original arriving again is redundant while the reblog is shown.
        assert_eq!(store.push(feed, &orig).unwrap(), PushOutcome::Redundant);
    }

    #[test]
    fn trims_from_high_to_low_water_at_top() {
        let (_dir, db) = temp_db();
        let s = Streaming::default();
        let store = feed_store(&db, &s);
        let a = local_account(&db, "a");
        let feed = FeedId::Home(a.id);
        let mut last = None;
        for i in 0..41 {
            let st = post(&db, a.id, &format!("{i}"));
            store.push(feed, &st).unwrap();
            last = Some(st.id);
        }
        let entries = store.entries(feed, 100).unwrap();
        assert_eq!(entries.len(), 20);
        assert_eq!(entries[0].status_id, last.unwrap());
    }

    #[test]
    fn not_at_top_counts_unread_without_trimming() {
        let (_dir, db) = temp_db();
        let s = Streaming::default();
        let store = feed_store(&db, &s);
        let a = local_account(&db, "a");
        let feed = FeedId::Home(a.id);
        store.mark_top(feed, false).unwrap();
        for i in 0..45 {
            let st = post(&db, a.id, &format!("{i}"));
            assert_eq!(store.push(feed, &st).unwrap(), PushOutcome::Inserted { at_top: false });
        }
        assert_eq!(store.unread(feed).unwrap(), 45);
        assert_eq!(store.entries(feed, 100).unwrap().len(), 45);
        store.mark_top(feed, true).unwrap();
        assert_eq!(store.unread(feed).unwrap(), 0);
    }

    #[test]
    fn remove_status_takes_reblogs_along() {
        let (_dir, db) = temp_db();
        let s = Streaming::default();
        let store = feed_store(&db, &s);
        let a = local_account(&db, "a");
        let b = local_account(&db, "b");
        let orig = post(&db, a.id, "x");
        let rb = reblog(&db, b.id, &orig);
        store.push(FeedId::Home(a.id), &orig).unwrap();
        store.push(FeedId::Home(b.id), &rb).unwrap();

        let mut rx = s.subscribe();
        assert_eq!(store.remove_status(orig.id).unwrap(), 2);
        assert!(store.entries(FeedId::Home(a.id), 10).unwrap().is_empty());
        assert!(store.entries(FeedId::Home(b.id), 10).unwrap().is_empty());
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.message.event == StreamMessage::DELETE));
    }

    #[test]
    fn push_publishes_on_feed_channel() {
        let (_dir, db) = temp_db();
        let s = Streaming::default();
        let store = feed_store(&db, &s);
        let a = local_account(&db, "a");
        let list = db.create_list(a.id, "friends").unwrap();
        let st = post(&db, a.id, "hi");
        let mut rx = s.subscribe();
        store.push(FeedId::List(list), &st).unwrap();
        let events = drain(&mut rx);
        assert_eq!(events[0].channel, format!("timeline:list:{list}"));
        assert_eq!(events[0].message.event, StreamMessage::UPDATE);
        assert!(store.push_update(FeedId::List(list), &st, "{}").unwrap());
        assert!(!store.push_update(FeedId::Home(a.id), &st, "{}").unwrap());
    }

    #[test]
    fn unmerge_drops_authored_and_reblogged() {
        let (_dir, db) = temp_db();
        let s = Streaming::default();
        let store = feed_store(&db, &s);
        let reader = local_account(&db, "reader");
        let a = local_account(&db, "a");
        let b = local_account(&db, "b");
        let feed = FeedId::Home(reader.id);
        let from_a = post(&db, a.id, "a");
        let from_b = post(&db, b.id, "b");
        let b_boosts_a = reblog(&db, b.id, &post(&db, a.id, "a2"));
        for st in [&from_a, &from_b, &b_boosts_a] {
            store.push(feed, st).unwrap();
        }
        assert_eq!(store.unmerge_account(feed, a.id).unwrap(), 2);
        assert_eq!(store.entries(feed, 10).unwrap()[0].status_id, from_b.id);
    }

    #[test]
    fn home_filter_rules() {
        let (_dir, db) = temp_db();
        let s = Streaming::default();
        let store = feed_store(&db, &s);
        let reader = local_account(&db, "reader");
        let author = local_account(&db, "author");
        let third = local_account(&db, "third");
        let remote = remote_account(&db, "r", "spam.example", "https://spam.example/inbox");

        let plain = post(&db, author.id, "hi");
        assert!(!store.filter(FilterContext::Home, &plain, reader.id).unwrap());

        // Reply to someone the reader does not follow.
        let mut reply = NewStatus::new(author.id, "@third yes", Visibility::Public);
        reply.in_reply_to_id = Some(1);
        reply.in_reply_to_account_id = Some(third.id);
        let reply = db.insert_status(&reply, "https://local.test").unwrap();
        assert!(store.filter(FilterContext::Home, &reply, reader.id).unwrap());
        db.follow(reader.id, third.id, true).unwrap();
        assert!(!store.filter(FilterContext::Home, &reply, reader.id).unwrap());

        // Reblogs hidden by the follow setting, or of a muted origin.
        db.follow(reader.id, author.id, false).unwrap();
        let rb = reblog(&db, author.id, &post(&db, third.id, "x"));
        assert!(store.filter(FilterContext::Home, &rb, reader.id).unwrap());
        db.follow(reader.id, author.id, true).unwrap();
        assert!(!store.filter(FilterContext::Home, &rb, reader.id).unwrap());
        db.mute(reader.id, third.id, false).unwrap();
        assert!(store.filter(FilterContext::Home, &rb, reader.id).unwrap());

        // Domain block and block either way.
        let from_remote = post(&db, remote.id, "buy");
        db.block_domain(reader.id, "spam.example").unwrap();
        assert!(store.filter(FilterContext::Home, &from_remote, reader.id).unwrap());
        db.block(author.id, reader.id).unwrap();
        assert!(store.filter(FilterContext::Home, &plain, reader.id).unwrap());
        assert!(store.filter(FilterContext::Mentions, &plain, reader.id).unwrap());
    }

    #[test]
    fn feed_ids_round_trip_through_text() {
        assert_eq!(FeedId::parse("home:5").unwrap(), FeedId::Home(5));
        assert_eq!(FeedId::List(9).to_string(), "list:9");
        assert!(FeedId::parse("tag:rust").is_err());
    }
}
