/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Applies remote edits to a stored status.
//!
//! A dated edit is admitted only when its `updated` timestamp is newer than the
//! recorded one; an undated edit is stamped with the local time. All writes for one status happen under its lease lock so
//! two deliveries of competing edits never interleave. Edit history always
//! starts with a snapshot of the pre-edit version.

use crate::activity::{parse_note, ParsedNote};
use crate::distribution::Distributor;
use crate::fan_out::FanOutReport;
use crate::lease_lock::LeaseLock;
use crate::model::{now_ms, FollowUpKind, Status, StatusId};
use crate::social_db::{self, blocking, SocialDb};
use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, TransactionBehavior};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

const MAX_MEDIA_ATTACHMENTS: usize = 4;
const POLL_EXPIRY_NOTIFY_DELAY_MS: i64 = 5 * 60 * 1000;

#[derive(Debug)]
pub enum UpdateOutcome {
    /// Not newer than what is stored; nothing changed.
    Stale,
    Applied {
        edit_recorded: bool,
        fan_out: FanOutReport,
    },
}

/// What the transaction changed; drives the post-commit work.
#[derive(Debug, Default)]
struct AppliedChanges {
    text_changed: bool,
    spoiler_present: bool,
    edit_recorded: bool,
    poll_expiry_to_notify: Option<(i64, i64)>,
    new_media: Vec<i64>,
}

#[derive(Clone)]
pub struct StatusUpdater {
    db: SocialDb,
    locks: LeaseLock,
    distributor: Distributor,
    lock_wait: Duration,
}

impl StatusUpdater {
    pub fn new(distributor: Distributor, locks: LeaseLock) -> Self {
        Self {
            db: distributor.db().clone(),
            locks,
            distributor,
            lock_wait: Duration::ZERO,
        }
    }

    /// How long to wait for a busy lock before reporting a race.
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    /// Merges `object` (a Note/Question) into the status. A concurrent update
    /// of the same status surfaces as [`crate::error::RaceConditionError`].
    pub async fn process_update(&self, status_id: StatusId, object: &Value) -> Result<UpdateOutcome> {
        let parsed = parse_note(object)?;
        let db = self.db.clone();
        let status = blocking(move || db.get_status(status_id))
            .await?
            .with_context(|| format!("status {status_id} missing"))?;
        if parsed.uri != status.uri {
            bail!("object {} does not match status {}", parsed.uri, status.uri);
        }
        if is_stale(&status, &parsed) {
            debug!(status_id, "stale edit ignored");
            return Ok(UpdateOutcome::Stale);
        }

        let guard = self.locks.acquire(&format!("create:{}", status.uri), self.lock_wait).await?;
        let db = self.db.clone();
        let applied = blocking(move || apply_edit(&db, status_id, &parsed)).await;
        blocking(move || guard.release()).await?;
        let Some(changes) = applied? else {
            debug!(status_id, "edit superseded while waiting for lock");
            return Ok(UpdateOutcome::Stale);
        };

        let db = self.db.clone();
        let edit_recorded = blocking(move || {
            let now = now_ms();
            if changes.text_changed || changes.spoiler_present {
                let conn = db.conn()?;
                conn.execute("UPDATE statuses SET preview_card_url = NULL WHERE id = ?1", params![status_id])?;
            }
            if !changes.spoiler_present {
                db.enqueue_follow_up(FollowUpKind::LinkCrawl, status_id, now)?;
            }
            if let Some((poll_id, expires_at)) = changes.poll_expiry_to_notify {
                db.enqueue_follow_up(FollowUpKind::PollExpirationNotify, poll_id, expires_at + POLL_EXPIRY_NOTIFY_DELAY_MS)?;
            }
            for media_id in &changes.new_media {
                db.enqueue_follow_up(FollowUpKind::MediaRedownload, *media_id, now)?;
            }
            Ok(changes.edit_recorded)
        })
        .await?;

        let fan_out = self.distributor.distribute_update(status_id).await?;
        info!(status_id, edit_recorded, "remote edit applied");
        Ok(UpdateOutcome::Applied { edit_recorded, fan_out })
    }
}

fn is_stale(status: &Status, parsed: &ParsedNote) -> bool {
    match (parsed.updated_ms, status.edited_at_ms) {
        (Some(incoming), Some(current)) => incoming <= current,
        (None, _) | (Some(_), None) => false,
    }
}

/// One IMMEDIATE transaction. `None` when a newer edit landed first.
fn apply_edit(db: &SocialDb, status_id: StatusId, parsed: &ParsedNote) -> Result<Option<AppliedChanges>> {
    let mut conn = db.conn()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let before = social_db::load_status(&tx, status_id)?.with_context(|| format!("status {status_id} missing"))?;
    if is_stale(&before, parsed) {
        return Ok(None);
    }
    let edited_at = parsed.updated_ms.unwrap_or_else(now_ms);
    let author = social_db::load_account(&tx, before.account_id)?.context("status author missing")?;

    let media_before = social_db::load_media_for_status(&tx, status_id)?;
    let poll_before = match before.poll_id {
        Some(id) => social_db::load_poll(&tx, id)?,
        None => None,
    };
    if social_db::load_edits(&tx, status_id)?.is_empty() {
        let ids: Vec<i64> = media_before.iter().map(|m| m.id).collect();
        let options = poll_before.as_ref().map(|p| p.options.as_slice());
        social_db::insert_edit(&tx, &before, &ids, options, before.created_at_ms)?;
    }

    let mut changes = AppliedChanges::default();

    // Media: keep rows whose remote URL is unchanged, detach the rest.
    let mut media_ids = Vec::new();
    for m in parsed.media.iter().take(MAX_MEDIA_ATTACHMENTS) {
        match media_before.iter().find(|old| old.remote_url == m.url) {
            Some(old) => {
                tx.execute(
                    "UPDATE media_attachments SET description = ?2, media_type = COALESCE(?3, media_type) WHERE id = ?1",
                    params![old.id, m.description, m.media_type],
                )?;
                media_ids.push(old.id);
            }
            None => {
                let created = social_db::insert_media(
                    &tx,
                    Some(status_id),
                    before.account_id,
                    &m.url,
                    m.media_type.as_deref(),
                    m.description.as_deref(),
                )?;
                changes.new_media.push(created.id);
                media_ids.push(created.id);
            }
        }
    }
    let keep: HashSet<i64> = media_ids.iter().copied().collect();
    for old in media_before.iter().filter(|old| !keep.contains(&old.id)) {
        tx.execute("UPDATE media_attachments SET status_id = NULL WHERE id = ?1", params![old.id])?;
    }
    let media_changed = media_before.iter().map(|m| m.id).collect::<Vec<_>>() != media_ids;

    let poll_id = apply_poll(&tx, &before, poll_before.as_ref(), parsed, &mut changes)?;
    let poll_changed = before.poll_id != poll_id;

    let text_changed = before.text != parsed.text;
    let spoiler_changed = before.spoiler_text != parsed.spoiler_text;
    changes.text_changed = text_changed;
    changes.spoiler_present = !parsed.spoiler_text.is_empty();
    tx.execute(
        r#"
        UPDATE statuses SET text = ?2, spoiler_text = ?3, sensitive = ?4, language = ?5,
          edited_at_ms = ?6, updated_at_ms = ?7, poll_id = ?8
        WHERE id = ?1
        "#,
        params![
            status_id,
            parsed.text,
            parsed.spoiler_text,
            author.sensitized || parsed.sensitive,
            parsed.language.clone().or(before.language.clone()),
            edited_at,
            now_ms(),
            poll_id
        ],
    )?;

    social_db::replace_tags(&tx, status_id, &parsed.tags)?;
    social_db::replace_emojis(&tx, status_id, &parsed.emojis)?;
    update_mentions(&tx, status_id, &parsed.mention_uris)?;

    if text_changed || spoiler_changed || media_changed || poll_changed {
        let after = social_db::load_status(&tx, status_id)?.context("status vanished during edit")?;
        let options = match poll_id {
            Some(id) => social_db::load_poll(&tx, id)?.map(|p| p.options),
            None => None,
        };
        social_db::insert_edit(&tx, &after, &media_ids, options.as_deref(), edited_at)?;
        changes.edit_recorded = true;
    }
    tx.commit()?;
    Ok(Some(changes))
}

/// Replaces the poll, resetting votes only when the option set changed.
fn apply_poll(
    conn: &Connection,
    status: &Status,
    before: Option<&crate::model::Poll>,
    parsed: &ParsedNote,
    changes: &mut AppliedChanges,
) -> Result<Option<i64>> {
    match (before, &parsed.poll) {
        (Some(old), Some(new)) => {
            if old.options != new.options {
                conn.execute("DELETE FROM poll_votes WHERE poll_id = ?1", params![old.id])?;
            }
            conn.execute(
                "UPDATE polls SET options_json = ?2, multiple = ?3, expires_at_ms = ?4 WHERE id = ?1",
                params![old.id, serde_json::to_string(&new.options)?, new.multiple, new.expires_at_ms],
            )?;
            let votes: i64 = conn.query_row(
                "SELECT COUNT(*) FROM poll_votes WHERE poll_id = ?1",
                params![old.id],
                |r| r.get(0),
            )?;
            if let (None, Some(expires)) = (old.expires_at_ms, new.expires_at_ms) {
                if votes > 0 {
                    changes.poll_expiry_to_notify = Some((old.id, expires));
                }
            }
            Ok(Some(old.id))
        }
        (None, Some(new)) => {
            let poll = social_db::create_poll_in(conn, status.id, status.account_id, &new.options, new.multiple, new.expires_at_ms)?;
            Ok(Some(poll.id))
        }
        (Some(old), None) => {
            conn.execute("DELETE FROM poll_votes WHERE poll_id = ?1", params![old.id])?;
            conn.execute("DELETE FROM polls WHERE id = ?1", params![old.id])?;
            Ok(None)
        }
        (None, None) => Ok(None),
    }
}

/// Known mentioned accounts become (or stay) active mentions; dropped ones
/// turn silent so they keep access without a new notification.
fn update_mentions(conn: &Connection, status_id: StatusId, uris: &[String]) -> Result<()> {
    let mut current = HashSet::new();
    for uri in uris {
        if let Some(acct) = social_db::find_account_by_uri(conn, uri)? {
            current.insert(acct.id);
        }
    }
    for m in social_db::load_mentions(conn, status_id)? {
        if !current.contains(&m.account_id) {
            conn.execute(
                "UPDATE mentions SET silent = 1 WHERE status_id = ?1 AND account_id = ?2",
                params![status_id, m.account_id],
            )?;
        }
    }
    for account_id in current {
        conn.execute(
            "INSERT OR REPLACE INTO mentions(status_id, account_id, silent) VALUES (?1, ?2, 0)",
            params![status_id, account_id],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::test_support::distributor;
    use crate::error::is_race_condition;
    use crate::feed_store::FeedId;
    use crate::lease_lock::DEFAULT_LEASE;
    use crate::model::{ms_to_rfc3339, NewStatus, Visibility};
    use crate::social_db::test_support::{local_account, remote_account, temp_db};
    use crate::streaming::test_support::drain;
    use crate::streaming::Streaming;
    use fedicast_protocol::StreamMessage;
    use serde_json::json;

    const URI: &str = "https://remote.example/notes/1";

    struct Fixture {
        _dir: tempfile::TempDir,
        db: SocialDb,
        streaming: Streaming,
        updater: StatusUpdater,
        status: Status,
        reader: i64,
    }

    fn fixture() -> Fixture {
        let (dir, db) = temp_db();
        let streaming = Streaming::default();
        let d = distributor(&db, &streaming);
        let locks = LeaseLock::open(db.path(), DEFAULT_LEASE).unwrap();
        let updater = StatusUpdater::new(d, locks);

        let bob = remote_account(&db, "bob", "remote.example", "https://remote.example/inbox");
        let reader = local_account(&db, "reader");
        db.follow(reader.id, bob.id, true).unwrap();
        let mut n = NewStatus::new(bob.id, "first", Visibility::Public);
        n.uri = Some(URI.into());
        n.local = false;
        let status = db.insert_status(&n, "https://remote.example").unwrap();
        db.insert_media(Some(status.id), bob.id, "https://remote.example/m/old.png", None).unwrap();
        let fo = crate::fan_out::FanOut::new(
            crate::feed_store::test_support::feed_store(&db, &streaming),
            streaming.clone(),
            Default::default(),
        );
        fo.fan_out(&status, crate::fan_out::FanOutKind::Create).unwrap();
        Fixture {
            _dir: dir,
            db,
            streaming,
            updater,
            status,
            reader: reader.id,
        }
    }

    fn note(text: &str, updated_ms: i64, media: &[&str]) -> Value {
        let attachment: Vec<Value> = media.iter().map(|u| json!({"type": "Document", "url": u})).collect();
        json!({
            "id": URI,
            "type": "Note",
            "attributedTo": "https://remote.example/users/bob",
            "content": text,
            "to": ["https://www.w3.org/ns/activitystreams#Public"],
            "updated": ms_to_rfc3339(updated_ms),
            "tag": [{"type": "Hashtag", "name": "#edited"}],
            "attachment": attachment,
        })
    }

    #[tokio::test]
    async fn edit_replaces_text_detaches_media_and_rebroadcasts() {
        let f = fixture();
        let old_media = f.db.media_of(f.status.id).unwrap()[0].clone();
        let mut rx = f.streaming.subscribe();
        let t = now_ms();

        let outcome = f.updater.process_update(f.status.id, &note("second", t, &[])).await.unwrap();
        let UpdateOutcome::Applied { edit_recorded, fan_out } = outcome else {
            panic!("edit not applied");
        };
        assert!(edit_recorded);
        assert!(fan_out.delivered_to(FeedId::Home(f.reader)));

        let after = f.db.get_status(f.status.id).unwrap().unwrap();
        assert_eq!(after.text, "second");
        assert_eq!(after.edited_at_ms, Some(t));
        assert!(f.db.media_of(f.status.id).unwrap().is_empty());
        assert_eq!(f.db.get_media(old_media.id).unwrap().unwrap().status_id, None);
        assert_eq!(f.db.tags_of(f.status.id).unwrap(), vec!["edited"]);

        let edits = f.db.edits_of(f.status.id).unwrap();
        assert_eq!(edits.len(), 2);
        assert_eq!(edits[0].text, "first");
        assert_eq!(edits[0].ordered_media_attachment_ids, vec![old_media.id]);
        assert_eq!(edits[1].text, "second");

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| e.message.event == StreamMessage::STATUS_UPDATE));
        let kinds: Vec<String> = f.db.follow_ups_for(f.status.id).unwrap().into_iter().map(|u| u.kind).collect();
        assert!(kinds.contains(&FollowUpKind::LinkCrawl.as_str().to_string()));
    }

    #[tokio::test]
    async fn stale_edits_are_no_ops() {
        let f = fixture();
        let t = now_ms();
        f.updater.process_update(f.status.id, &note("second", t, &[])).await.unwrap();
        let before = f.db.get_status(f.status.id).unwrap().unwrap();

        let same = f.updater.process_update(f.status.id, &note("older", t, &[])).await.unwrap();
        assert!(matches!(same, UpdateOutcome::Stale));
        let older = f.updater.process_update(f.status.id, &note("older", t - 1, &[])).await.unwrap();
        assert!(matches!(older, UpdateOutcome::Stale));

        assert_eq!(f.db.get_status(f.status.id).unwrap().unwrap(), before);
        assert_eq!(f.db.edits_of(f.status.id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn undated_edit_is_applied_at_local_time() {
        let f = fixture();
        let t = now_ms();
        f.updater.process_update(f.status.id, &note("second", t - 60_000, &[])).await.unwrap();

        let mut undated = note("undated", 0, &[]);
        undated.as_object_mut().unwrap().remove("updated");
        let outcome = f.updater.process_update(f.status.id, &undated).await.unwrap();
        assert!(matches!(outcome, UpdateOutcome::Applied { edit_recorded: true, .. }));

        let after = f.db.get_status(f.status.id).unwrap().unwrap();
        assert_eq!(after.text, "undated");
        assert!(after.edited_at_ms.unwrap() >= t);
        assert_eq!(f.db.edits_of(f.status.id).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn adding_or_removing_a_poll_is_an_edit() {
        let f = fixture();
        let old = "https://remote.example/m/old.png";
        let t = now_ms();
        let mut question = note("first", t, &[old]);
        question["type"] = json!("Question");
        question["oneOf"] = json!([{"name": "yes"}, {"name": "no"}]);

        let outcome = f.updater.process_update(f.status.id, &question).await.unwrap();
        assert!(matches!(outcome, UpdateOutcome::Applied { edit_recorded: true, .. }));
        let with_poll = f.db.get_status(f.status.id).unwrap().unwrap();
        assert!(with_poll.poll_id.is_some());
        assert_eq!(f.db.edits_of(f.status.id).unwrap().len(), 2);

        let outcome = f.updater.process_update(f.status.id, &note("first", t + 1, &[old])).await.unwrap();
        assert!(matches!(outcome, UpdateOutcome::Applied { edit_recorded: true, .. }));
        assert_eq!(f.db.get_status(f.status.id).unwrap().unwrap().poll_id, None);
        assert_eq!(f.db.edits_of(f.status.id).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn spoiler_clears_card_and_skips_link_crawl() {
        let f = fixture();
        f.db.conn()
            .unwrap()
            .execute(
                "UPDATE statuses SET preview_card_url = 'https://remote.example/card' WHERE id = ?1",
                params![f.status.id],
            )
            .unwrap();
        let mut cw = note("first", now_ms(), &["https://remote.example/m/old.png"]);
        cw["summary"] = json!("spoilers");
        f.updater.process_update(f.status.id, &cw).await.unwrap();

        let after = f.db.get_status(f.status.id).unwrap().unwrap();
        assert_eq!(after.text, "first");
        assert_eq!(after.spoiler_text, "spoilers");
        assert_eq!(after.preview_card_url, None);
        let kinds: Vec<String> = f.db.follow_ups_for(f.status.id).unwrap().into_iter().map(|u| u.kind).collect();
        assert!(!kinds.contains(&FollowUpKind::LinkCrawl.as_str().to_string()));
    }

    #[tokio::test]
    async fn history_grows_and_unchanged_media_is_kept() {
        let f = fixture();
        let old = "https://remote.example/m/old.png";
        let t = now_ms();
        for (i, text) in ["a", "b", "c"].iter().enumerate() {
            f.updater.process_update(f.status.id, &note(text, t + i as i64, &[old])).await.unwrap();
        }
        let edits = f.db.edits_of(f.status.id).unwrap();
        assert_eq!(edits.len(), 4);
        assert_eq!(edits.iter().map(|e| e.text.as_str()).collect::<Vec<_>>(), vec!["first", "a", "b", "c"]);
        let media = f.db.media_of(f.status.id).unwrap();
        assert_eq!(media.len(), 1);
        assert_eq!(media[0].remote_url, old);

        // Same text and media: applied, but no history entry.
        let outcome = f.updater.process_update(f.status.id, &note("c", t + 10, &[old])).await.unwrap();
        assert!(matches!(outcome, UpdateOutcome::Applied { edit_recorded: false, .. }));
        assert_eq!(f.db.edits_of(f.status.id).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn concurrent_update_reports_race() {
        let f = fixture();
        let locks = LeaseLock::open(f.db.path(), DEFAULT_LEASE).unwrap();
        let _held = locks.try_acquire(&format!("create:{URI}")).unwrap().unwrap();
        let err = f.updater.process_update(f.status.id, &note("x", now_ms(), &[])).await.unwrap_err();
        assert!(is_race_condition(&err));
        assert_eq!(f.db.get_status(f.status.id).unwrap().unwrap().text, "first");
    }

    #[tokio::test]
    async fn poll_votes_reset_only_when_options_change() {
        let f = fixture();
        let voter = local_account(&f.db, "voter");
        let poll = f.db.create_poll(f.status.id, f.status.account_id, &["a".into(), "b".into()], false, None).unwrap();
        f.db.vote(poll.id, voter.id, 0).unwrap();
        let t = now_ms();
        let question = |text: &str, updated: i64, options: &[&str], end: Option<i64>| {
            let mut v = note(text, updated, &[]);
            v["type"] = json!("Question");
            v["oneOf"] = json!(options.iter().map(|o| json!({"name": o})).collect::<Vec<_>>());
            if let Some(end) = end {
                v["endTime"] = json!(ms_to_rfc3339(end));
            }
            v
        };

        let end = t + 3_600_000;
        f.updater.process_update(f.status.id, &question("q", t, &["a", "b"], Some(end))).await.unwrap();
        assert_eq!(f.db.get_poll(poll.id).unwrap().unwrap().votes_count, 1);
        let expiry = f.db.follow_ups_for(poll.id).unwrap();
        assert_eq!(expiry.len(), 1);
        assert_eq!(expiry[0].run_at_ms, end + POLL_EXPIRY_NOTIFY_DELAY_MS);

        f.updater.process_update(f.status.id, &question("q", t + 1, &["a", "c"], Some(end))).await.unwrap();
        let p = f.db.get_poll(poll.id).unwrap().unwrap();
        assert_eq!(p.votes_count, 0);
        assert_eq!(p.options, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn sensitized_author_forces_sensitive_and_mentions_go_silent() {
        let f = fixture();
        f.db.set_account_sensitized(f.status.account_id, true).unwrap();
        let alice = local_account(&f.db, "alice");
        f.db.add_mention(f.status.id, alice.id, false).unwrap();
        f.updater.process_update(f.status.id, &note("no more alice", now_ms(), &[])).await.unwrap();
        assert!(f.db.get_status(f.status.id).unwrap().unwrap().sensitive);
        let mentions = f.db.mentions_of(f.status.id).unwrap();
        assert_eq!(mentions.len(), 1);
        assert!(mentions[0].silent);
    }
}
