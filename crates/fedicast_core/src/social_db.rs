/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::model::{
    next_id, now_ms, Account, AccountId, CleanupPolicy, CustomEmoji, FollowUp, FollowUpKind, MediaAttachment, Mention,
    NewAccount, NewStatus, Notification, NotificationKind, Poll, Status, StatusEdit, StatusId, Visibility,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone)]
pub struct SocialDb {
    path: PathBuf,
}

const ACCOUNT_COLS: &str = "id, username, domain, uri, inbox_url, shared_inbox_url, actor_type, silenced, sensitized, last_active_at_ms, public_key_pem, private_key_pem";

const STATUS_COLS: &str = "id, uri, url, account_id, text, spoiler_text, visibility, sensitive, language, created_at_ms, updated_at_ms, edited_at_ms, reblog_of_id, in_reply_to_id, in_reply_to_account_id, poll_id, local, pinned, preview_card_url, deleted_at_ms";

impl SocialDb {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn = Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS accounts (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              username TEXT NOT NULL,
              domain TEXT NULL,
              uri TEXT NOT NULL UNIQUE,
              inbox_url TEXT NULL,
              shared_inbox_url TEXT NULL,
              actor_type TEXT NOT NULL DEFAULT 'Person',
              silenced INTEGER NOT NULL DEFAULT 0,
              public_key_pem TEXT NULL,
              private_key_pem TEXT NULL,
              created_at_ms INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_accounts_local_username ON accounts(username) WHERE domain IS NULL;

            CREATE TABLE IF NOT EXISTS follows (
              account_id INTEGER NOT NULL,
              target_account_id INTEGER NOT NULL,
              show_reblogs INTEGER NOT NULL DEFAULT 1,
              created_at_ms INTEGER NOT NULL,
              PRIMARY KEY(account_id, target_account_id)
            );
            CREATE INDEX IF NOT EXISTS idx_follows_target ON follows(target_account_id);

            CREATE TABLE IF NOT EXISTS blocks (
              account_id INTEGER NOT NULL,
              target_account_id INTEGER NOT NULL,
              PRIMARY KEY(account_id, target_account_id)
            );

            CREATE TABLE IF NOT EXISTS mutes (
              account_id INTEGER NOT NULL,
              target_account_id INTEGER NOT NULL,
              hide_notifications INTEGER NOT NULL DEFAULT 1,
              PRIMARY KEY(account_id, target_account_id)
            );

            CREATE TABLE IF NOT EXISTS account_domain_blocks (
              account_id INTEGER NOT NULL,
              domain TEXT NOT NULL,
              PRIMARY KEY(account_id, domain)
            );

            CREATE TABLE IF NOT EXISTS lists (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              account_id INTEGER NOT NULL,
              title TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS list_accounts (
              list_id INTEGER NOT NULL,
              account_id INTEGER NOT NULL,
              PRIMARY KEY(list_id, account_id)
            );

            CREATE TABLE IF NOT EXISTS statuses (
              id INTEGER PRIMARY KEY,
              uri TEXT NOT NULL UNIQUE,
              url TEXT NULL,
              account_id INTEGER NOT NULL,
              text TEXT NOT NULL,
              spoiler_text TEXT NOT NULL,
              visibility INTEGER NOT NULL,
              sensitive INTEGER NOT NULL DEFAULT 0,
              language TEXT NULL,
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              edited_at_ms INTEGER NULL,
              reblog_of_id INTEGER NULL,
              in_reply_to_id INTEGER NULL,
              in_reply_to_account_id INTEGER NULL,
              poll_id INTEGER NULL,
              local INTEGER NOT NULL,
              deleted_at_ms INTEGER NULL
            );
            CREATE INDEX IF NOT EXISTS idx_statuses_reblog ON statuses(reblog_of_id);
            CREATE INDEX IF NOT EXISTS idx_statuses_account ON statuses(account_id, id);

            CREATE TABLE IF NOT EXISTS mentions (
              status_id INTEGER NOT NULL,
              account_id INTEGER NOT NULL,
              silent INTEGER NOT NULL DEFAULT 0,
              PRIMARY KEY(status_id, account_id)
            );

            CREATE TABLE IF NOT EXISTS status_tags (
              status_id INTEGER NOT NULL,
              name TEXT NOT NULL,
              PRIMARY KEY(status_id, name)
            );

            CREATE TABLE IF NOT EXISTS status_emojis (
              status_id INTEGER NOT NULL,
              shortcode TEXT NOT NULL,
              domain TEXT NULL,
              image_url TEXT NOT NULL,
              PRIMARY KEY(status_id, shortcode)
            );

            CREATE TABLE IF NOT EXISTS media_attachments (
              id INTEGER PRIMARY KEY,
              status_id INTEGER NULL,
              account_id INTEGER NOT NULL,
              remote_url TEXT NOT NULL,
              media_type TEXT NULL,
              description TEXT NULL,
              created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_media_status ON media_attachments(status_id);

            CREATE TABLE IF NOT EXISTS polls (
              id INTEGER PRIMARY KEY,
              status_id INTEGER NOT NULL,
              account_id INTEGER NOT NULL,
              options_json TEXT NOT NULL,
              multiple INTEGER NOT NULL DEFAULT 0,
              expires_at_ms INTEGER NULL
            );

            CREATE TABLE IF NOT EXISTS poll_votes (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              poll_id INTEGER NOT NULL,
              account_id INTEGER NOT NULL,
              choice INTEGER NOT NULL,
              created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_poll_votes_poll ON poll_votes(poll_id);

            CREATE TABLE IF NOT EXISTS status_edits (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              status_id INTEGER NOT NULL,
              account_id INTEGER NOT NULL,
              text TEXT NOT NULL,
              spoiler_text TEXT NOT NULL,
              sensitive INTEGER NOT NULL,
              media_ids_json TEXT NOT NULL,
              poll_options_json TEXT NULL,
              created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_status_edits_status ON status_edits(status_id, id);

            CREATE TABLE IF NOT EXISTS notifications (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              account_id INTEGER NOT NULL,
              from_account_id INTEGER NOT NULL,
              kind TEXT NOT NULL,
              status_id INTEGER NULL,
              created_at_ms INTEGER NOT NULL,
              UNIQUE(account_id, from_account_id, kind, status_id)
            );

            CREATE TABLE IF NOT EXISTS follow_ups (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              kind TEXT NOT NULL,
              subject_id INTEGER NOT NULL,
              run_at_ms INTEGER NOT NULL,
              created_at_ms INTEGER NOT NULL,
              UNIQUE(kind, subject_id, run_at_ms)
            );
            CREATE INDEX IF NOT EXISTS idx_follow_ups_due ON follow_ups(run_at_ms);

            CREATE TABLE IF NOT EXISTS inbox_seen (
              activity_id TEXT PRIMARY KEY,
              seen_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS local_meta (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cleanup_policies (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              account_id INTEGER NOT NULL UNIQUE,
              enabled INTEGER NOT NULL DEFAULT 1,
              min_status_age_secs INTEGER NOT NULL,
              keep_pinned INTEGER NOT NULL DEFAULT 1
            );
            "#,
        )?;
        ensure_columns(
            &conn,
            "accounts",
            &[
                ("sensitized", "INTEGER NOT NULL DEFAULT 0"),
                ("last_active_at_ms", "INTEGER NULL"),
            ],
        )?;
        ensure_columns(
            &conn,
            "statuses",
            &[
                ("pinned", "INTEGER NOT NULL DEFAULT 0"),
                ("preview_card_url", "TEXT NULL"),
            ],
        )?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn conn(&self) -> Result<Connection> {
        open_conn(&self.path)
    }

    pub fn health_check(&self) -> Result<()> {
        let conn = self.conn()?;
        let _: i64 = conn.query_row("SELECT 1", [], |r| r.get(0))?;
        Ok(())
    }

    /// Runs `f` inside one IMMEDIATE transaction; commits only when it returns `Ok`.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit().context("commit")?;
        Ok(out)
    }

    // Accounts

    pub fn insert_account(&self, new: &NewAccount) -> Result<Account> {
        let conn = self.conn()?;
        let domain = new.domain.as_ref().map(|d| d.trim().to_ascii_lowercase());
        conn.execute(
            r#"
            INSERT INTO accounts(username, domain, uri, inbox_url, shared_inbox_url, actor_type, public_key_pem, private_key_pem, created_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                new.username,
                domain,
                new.uri,
                new.inbox_url,
                new.shared_inbox_url,
                new.actor_type.as_deref().unwrap_or("Person"),
                new.public_key_pem,
                new.private_key_pem,
                now_ms()
            ],
        )
        .with_context(|| format!("insert account {}", new.uri))?;
        let id = conn.last_insert_rowid();
        load_account(&conn, id)?.ok_or_else(|| anyhow!("account vanished after insert"))
    }

    /// Inserts or refreshes a remote actor keyed by its URI.
    pub fn upsert_remote_account(&self, new: &NewAccount) -> Result<Account> {
        let conn = self.conn()?;
        let domain = new.domain.as_ref().map(|d| d.trim().to_ascii_lowercase());
        conn.execute(
            r#"
            INSERT INTO accounts(username, domain, uri, inbox_url, shared_inbox_url, actor_type, public_key_pem, created_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(uri) DO UPDATE SET
              inbox_url = COALESCE(excluded.inbox_url, accounts.inbox_url),
              shared_inbox_url = COALESCE(excluded.shared_inbox_url, accounts.shared_inbox_url),
              actor_type = excluded.actor_type,
              public_key_pem = COALESCE(excluded.public_key_pem, accounts.public_key_pem)
            "#,
            params![
                new.username,
                domain,
                new.uri,
                new.inbox_url,
                new.shared_inbox_url,
                new.actor_type.as_deref().unwrap_or("Person"),
                new.public_key_pem,
                now_ms()
            ],
        )?;
        find_account_by_uri(&conn, &new.uri)?.ok_or_else(|| anyhow!("account vanished after upsert"))
    }

    pub fn get_account(&self, id: AccountId) -> Result<Option<Account>> {
        load_account(&self.conn()?, id)
    }

    pub fn find_account_by_uri(&self, uri: &str) -> Result<Option<Account>> {
        find_account_by_uri(&self.conn()?, uri)
    }

    pub fn find_local_account(&self, username: &str) -> Result<Option<Account>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {ACCOUNT_COLS} FROM accounts WHERE domain IS NULL AND username = ?1"),
            params![username],
            account_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn touch_account_activity(&self, id: AccountId, at_ms: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE accounts SET last_active_at_ms = ?2 WHERE id = ?1",
            params![id, at_ms],
        )?;
        Ok(())
    }

    pub fn set_account_silenced(&self, id: AccountId, silenced: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("UPDATE accounts SET silenced = ?2 WHERE id = ?1", params![id, silenced])?;
        Ok(())
    }

    pub fn set_account_sensitized(&self, id: AccountId, sensitized: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("UPDATE accounts SET sensitized = ?2 WHERE id = ?1", params![id, sensitized])?;
        Ok(())
    }

    // Relationships

    pub fn follow(&self, account_id: AccountId, target_id: AccountId, show_reblogs: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO follows(account_id, target_account_id, show_reblogs, created_at_ms)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(account_id, target_account_id) DO UPDATE SET show_reblogs = excluded.show_reblogs
            "#,
            params![account_id, target_id, show_reblogs, now_ms()],
        )?;
        Ok(())
    }

    pub fn unfollow(&self, account_id: AccountId, target_id: AccountId) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM follows WHERE account_id = ?1 AND target_account_id = ?2",
            params![account_id, target_id],
        )?;
        Ok(())
    }

    pub fn is_following(&self, account_id: AccountId, target_id: AccountId) -> Result<bool> {
        Ok(self.follow_show_reblogs(account_id, target_id)?.is_some())
    }

    /// `Some(show_reblogs)` when `account_id` follows `target_id`.
    pub fn follow_show_reblogs(&self, account_id: AccountId, target_id: AccountId) -> Result<Option<bool>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT show_reblogs FROM follows WHERE account_id = ?1 AND target_account_id = ?2",
            params![account_id, target_id],
            |r| r.get::<_, bool>(0),
        )
        .optional()
        .map_err(Into::into)
    }

    /// Local followers of `account_id` whose last activity is at or after `active_since_ms`.
    pub fn local_followers_active_since(&self, account_id: AccountId, active_since_ms: i64) -> Result<Vec<Account>> {
        let conn = self.conn()?;
        let cols = prefixed(ACCOUNT_COLS, "a");
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {cols} FROM follows f
            JOIN accounts a ON a.id = f.account_id
            WHERE f.target_account_id = ?1 AND a.domain IS NULL AND a.last_active_at_ms >= ?2
            ORDER BY a.id
            "#
        ))?;
        let rows = stmt.query_map(params![account_id, active_since_ms], account_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn remote_followers(&self, account_id: AccountId) -> Result<Vec<Account>> {
        let conn = self.conn()?;
        let cols = prefixed(ACCOUNT_COLS, "a");
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {cols} FROM follows f
            JOIN accounts a ON a.id = f.account_id
            WHERE f.target_account_id = ?1 AND a.domain IS NOT NULL
            ORDER BY a.id
            "#
        ))?;
        let rows = stmt.query_map(params![account_id], account_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn block(&self, account_id: AccountId, target_id: AccountId) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO blocks(account_id, target_account_id) VALUES (?1, ?2)",
            params![account_id, target_id],
        )?;
        Ok(())
    }

    pub fn is_blocking(&self, account_id: AccountId, target_id: AccountId) -> Result<bool> {
        let conn = self.conn()?;
        exists(
            &conn,
            "SELECT 1 FROM blocks WHERE account_id = ?1 AND target_account_id = ?2",
            params![account_id, target_id],
        )
    }

    pub fn blocking_either_way(&self, a: AccountId, b: AccountId) -> Result<bool> {
        Ok(self.is_blocking(a, b)? || self.is_blocking(b, a)?)
    }

    pub fn mute(&self, account_id: AccountId, target_id: AccountId, hide_notifications: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO mutes(account_id, target_account_id, hide_notifications) VALUES (?1, ?2, ?3)
            ON CONFLICT(account_id, target_account_id) DO UPDATE SET hide_notifications = excluded.hide_notifications
            "#,
            params![account_id, target_id, hide_notifications],
        )?;
        Ok(())
    }

    pub fn is_muting(&self, account_id: AccountId, target_id: AccountId) -> Result<bool> {
        Ok(self.mute_hides_notifications(account_id, target_id)?.is_some())
    }

    /// `Some(hide_notifications)` when `account_id` mutes `target_id`.
    pub fn mute_hides_notifications(&self, account_id: AccountId, target_id: AccountId) -> Result<Option<bool>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT hide_notifications FROM mutes WHERE account_id = ?1 AND target_account_id = ?2",
            params![account_id, target_id],
            |r| r.get::<_, bool>(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn block_domain(&self, account_id: AccountId, domain: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO account_domain_blocks(account_id, domain) VALUES (?1, ?2)",
            params![account_id, domain.trim().to_ascii_lowercase()],
        )?;
        Ok(())
    }

    pub fn is_domain_blocked_by(&self, account_id: AccountId, domain: Option<&str>) -> Result<bool> {
        let Some(domain) = domain else {
            return Ok(false);
        };
        let conn = self.conn()?;
        exists(
            &conn,
            "SELECT 1 FROM account_domain_blocks WHERE account_id = ?1 AND domain = ?2",
            params![account_id, domain.to_ascii_lowercase()],
        )
    }

    // Lists

    pub fn create_list(&self, account_id: AccountId, title: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO lists(account_id, title) VALUES (?1, ?2)",
            params![account_id, title],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn add_list_member(&self, list_id: i64, account_id: AccountId) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO list_accounts(list_id, account_id) VALUES (?1, ?2)",
            params![list_id, account_id],
        )?;
        Ok(())
    }

    /// Lists owned by `owner_id` that include `member_id`.
    pub fn lists_containing(&self, owner_id: AccountId, member_id: AccountId) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT l.id FROM lists l
            JOIN list_accounts la ON la.list_id = l.id
            WHERE l.account_id = ?1 AND la.account_id = ?2
            ORDER BY l.id
            "#,
        )?;
        let rows = stmt.query_map(params![owner_id, member_id], |r| r.get(0))?;
        rows.collect::<rusqlite::Result<Vec<i64>>>().map_err(Into::into)
    }

    // Statuses

    pub fn insert_status(&self, new: &NewStatus, base_url: &str) -> Result<Status> {
        let conn = self.conn()?;
        insert_status(&conn, new, base_url)
    }

    pub fn get_status(&self, id: StatusId) -> Result<Option<Status>> {
        load_status(&self.conn()?, id)
    }

    pub fn find_status_by_uri(&self, uri: &str) -> Result<Option<Status>> {
        find_status_by_uri(&self.conn()?, uri)
    }

    pub fn reblog_ids_of(&self, status_id: StatusId) -> Result<Vec<StatusId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM statuses WHERE reblog_of_id = ?1 AND deleted_at_ms IS NULL")?;
        let rows = stmt.query_map(params![status_id], |r| r.get(0))?;
        rows.collect::<rusqlite::Result<Vec<StatusId>>>().map_err(Into::into)
    }

    pub fn mark_status_deleted(&self, id: StatusId) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE statuses SET deleted_at_ms = ?2 WHERE id = ?1 AND deleted_at_ms IS NULL",
            params![id, now_ms()],
        )?;
        Ok(n > 0)
    }

    pub fn set_status_pinned(&self, id: StatusId, pinned: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("UPDATE statuses SET pinned = ?2 WHERE id = ?1", params![id, pinned])?;
        Ok(())
    }

    pub fn add_mention(&self, status_id: StatusId, account_id: AccountId, silent: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO mentions(status_id, account_id, silent) VALUES (?1, ?2, ?3)",
            params![status_id, account_id, silent],
        )?;
        Ok(())
    }

    pub fn mentions_of(&self, status_id: StatusId) -> Result<Vec<Mention>> {
        load_mentions(&self.conn()?, status_id)
    }

    pub fn set_tags(&self, status_id: StatusId, tags: &[String]) -> Result<()> {
        let conn = self.conn()?;
        replace_tags(&conn, status_id, tags)
    }

    pub fn tags_of(&self, status_id: StatusId) -> Result<Vec<String>> {
        load_tags(&self.conn()?, status_id)
    }

    pub fn emojis_of(&self, status_id: StatusId) -> Result<Vec<CustomEmoji>> {
        load_emojis(&self.conn()?, status_id)
    }

    pub fn insert_media(&self, status_id: Option<StatusId>, account_id: AccountId, remote_url: &str, description: Option<&str>) -> Result<MediaAttachment> {
        let conn = self.conn()?;
        insert_media(&conn, status_id, account_id, remote_url, None, description)
    }

    pub fn media_of(&self, status_id: StatusId) -> Result<Vec<MediaAttachment>> {
        load_media_for_status(&self.conn()?, status_id)
    }

    pub fn get_media(&self, id: i64) -> Result<Option<MediaAttachment>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, status_id, account_id, remote_url, media_type, description, created_at_ms FROM media_attachments WHERE id = ?1",
            params![id],
            media_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn create_poll(&self, status_id: StatusId, account_id: AccountId, options: &[String], multiple: bool, expires_at_ms: Option<i64>) -> Result<Poll> {
        let conn = self.conn()?;
        let poll = insert_poll(&conn, status_id, account_id, options, multiple, expires_at_ms)?;
        conn.execute("UPDATE statuses SET poll_id = ?2 WHERE id = ?1", params![status_id, poll.id])?;
        Ok(poll)
    }

    pub fn get_poll(&self, id: i64) -> Result<Option<Poll>> {
        load_poll(&self.conn()?, id)
    }

    pub fn vote(&self, poll_id: i64, account_id: AccountId, choice: u32) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO poll_votes(poll_id, account_id, choice, created_at_ms) VALUES (?1, ?2, ?3, ?4)",
            params![poll_id, account_id, choice, now_ms()],
        )?;
        Ok(())
    }

    pub fn edits_of(&self, status_id: StatusId) -> Result<Vec<StatusEdit>> {
        load_edits(&self.conn()?, status_id)
    }

    // Notifications

    /// Returns `None` when the same notification already exists.
    pub fn insert_notification(&self, account_id: AccountId, from_account_id: AccountId, kind: NotificationKind, status_id: Option<StatusId>) -> Result<Option<Notification>> {
        let conn = self.conn()?;
        let created_at_ms = now_ms();
        let n = conn.execute(
            r#"
            INSERT OR IGNORE INTO notifications(account_id, from_account_id, kind, status_id, created_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![account_id, from_account_id, kind.as_str(), status_id, created_at_ms],
        )?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(Notification {
            id: conn.last_insert_rowid(),
            account_id,
            from_account_id,
            kind,
            status_id,
            created_at_ms,
        }))
    }

    pub fn notifications_for(&self, account_id: AccountId, limit: u32) -> Result<Vec<Notification>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, account_id, from_account_id, kind, status_id, created_at_ms
            FROM notifications WHERE account_id = ?1 ORDER BY id DESC LIMIT ?2
            "#,
        )?;
        let mut rows = stmt.query(params![account_id, limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let kind: String = row.get(3)?;
            let Some(kind) = NotificationKind::parse(&kind) else {
                continue;
            };
            out.push(Notification {
                id: row.get(0)?,
                account_id: row.get(1)?,
                from_account_id: row.get(2)?,
                kind,
                status_id: row.get(4)?,
                created_at_ms: row.get(5)?,
            });
        }
        Ok(out)
    }

    // Follow-ups

    pub fn enqueue_follow_up(&self, kind: FollowUpKind, subject_id: i64, run_at_ms: i64) -> Result<()> {
        enqueue_follow_up(&self.conn()?, kind, subject_id, run_at_ms)
    }

    pub fn follow_ups_for(&self, subject_id: i64) -> Result<Vec<FollowUp>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, kind, subject_id, run_at_ms FROM follow_ups WHERE subject_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![subject_id], |r| {
            Ok(FollowUp {
                id: r.get(0)?,
                kind: r.get(1)?,
                subject_id: r.get(2)?,
                run_at_ms: r.get(3)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Size and oldest-due latency of the follow-up queue, for load checks.
    pub fn follow_up_backlog(&self, now_ms: i64) -> Result<(u64, u64)> {
        let conn = self.conn()?;
        let (count, oldest): (u64, Option<i64>) = conn.query_row(
            "SELECT COUNT(*), MIN(run_at_ms) FROM follow_ups WHERE run_at_ms <= ?1",
            params![now_ms],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        let latency = oldest.map(|o| now_ms.saturating_sub(o).max(0) as u64).unwrap_or(0);
        Ok((count, latency))
    }

    // Inbox dedup / local meta

    /// True the first time an activity id is seen.
    pub fn mark_inbox_seen(&self, activity_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "INSERT OR IGNORE INTO inbox_seen(activity_id, seen_at_ms) VALUES (?1, ?2)",
            params![activity_id, now_ms()],
        )?;
        Ok(n > 0)
    }

    /// Drops the marker so a redelivery of a failed activity is processed again.
    pub fn forget_inbox_seen(&self, activity_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM inbox_seen WHERE activity_id = ?1", params![activity_id])?;
        Ok(())
    }

    pub fn prune_inbox_seen_before(&self, cutoff_ms: i64) -> Result<u64> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM inbox_seen WHERE seen_at_ms < ?1", params![cutoff_ms])?;
        Ok(n as u64)
    }

    pub fn get_local_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT value FROM local_meta WHERE key=?1",
            params![key],
            |r| r.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn set_local_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO local_meta(key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    // Cleanup policies

    pub fn upsert_cleanup_policy(&self, account_id: AccountId, min_status_age_secs: u64, keep_pinned: bool, enabled: bool) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO cleanup_policies(account_id, enabled, min_status_age_secs, keep_pinned)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(account_id) DO UPDATE SET
              enabled = excluded.enabled,
              min_status_age_secs = excluded.min_status_age_secs,
              keep_pinned = excluded.keep_pinned
            "#,
            params![account_id, enabled, min_status_age_secs as i64, keep_pinned],
        )?;
        let id = conn.query_row(
            "SELECT id FROM cleanup_policies WHERE account_id = ?1",
            params![account_id],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    /// Enabled policies with id greater than `after_id`, in id order.
    pub fn enabled_cleanup_policies_after(&self, after_id: i64, limit: u32) -> Result<Vec<CleanupPolicy>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, account_id, enabled, min_status_age_secs, keep_pinned FROM cleanup_policies
            WHERE enabled = 1 AND id > ?1 ORDER BY id LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![after_id, limit], |r| {
            Ok(CleanupPolicy {
                id: r.get(0)?,
                account_id: r.get(1)?,
                enabled: r.get(2)?,
                min_status_age_secs: r.get::<_, i64>(3)?.max(0) as u64,
                keep_pinned: r.get(4)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Oldest live statuses of the policy's account created before `cutoff_ms`.
    pub fn statuses_eligible_for_cleanup(&self, policy: &CleanupPolicy, cutoff_ms: i64, limit: u32) -> Result<Vec<StatusId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id FROM statuses
            WHERE account_id = ?1 AND deleted_at_ms IS NULL AND created_at_ms < ?2
              AND (?3 = 0 OR pinned = 0)
            ORDER BY id LIMIT ?4
            "#,
        )?;
        let rows = stmt.query_map(params![policy.account_id, cutoff_ms, policy.keep_pinned, limit], |r| r.get(0))?;
        rows.collect::<rusqlite::Result<Vec<StatusId>>>().map_err(Into::into)
    }
}

pub(crate) fn open_conn(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).with_context(|| format!("open db: {}", path.display()))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/// Runs store work on the blocking pool.
pub(crate) async fn blocking<T: Send + 'static>(f: impl FnOnce() -> Result<T> + Send + 'static) -> Result<T> {
    tokio::task::spawn_blocking(f).await?
}

fn prefixed(cols: &str, alias: &str) -> String {
    cols.split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn exists(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<bool> {
    Ok(conn.query_row(sql, params, |_| Ok(())).optional()?.is_some())
}

fn account_from_row(r: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: r.get(0)?,
        username: r.get(1)?,
        domain: r.get(2)?,
        uri: r.get(3)?,
        inbox_url: r.get(4)?,
        shared_inbox_url: r.get(5)?,
        actor_type: r.get(6)?,
        silenced: r.get(7)?,
        sensitized: r.get(8)?,
        last_active_at_ms: r.get(9)?,
        public_key_pem: r.get(10)?,
        private_key_pem: r.get(11)?,
    })
}

fn status_from_row(r: &Row<'_>) -> rusqlite::Result<Status> {
    Ok(Status {
        id: r.get(0)?,
        uri: r.get(1)?,
        url: r.get(2)?,
        account_id: r.get(3)?,
        text: r.get(4)?,
        spoiler_text: r.get(5)?,
        visibility: Visibility::from_i64(r.get(6)?),
        sensitive: r.get(7)?,
        language: r.get(8)?,
        created_at_ms: r.get(9)?,
        updated_at_ms: r.get(10)?,
        edited_at_ms: r.get(11)?,
        reblog_of_id: r.get(12)?,
        in_reply_to_id: r.get(13)?,
        in_reply_to_account_id: r.get(14)?,
        poll_id: r.get(15)?,
        local: r.get(16)?,
        pinned: r.get(17)?,
        preview_card_url: r.get(18)?,
        deleted_at_ms: r.get(19)?,
    })
}

fn media_from_row(r: &Row<'_>) -> rusqlite::Result<MediaAttachment> {
    Ok(MediaAttachment {
        id: r.get(0)?,
        status_id: r.get(1)?,
        account_id: r.get(2)?,
        remote_url: r.get(3)?,
        media_type: r.get(4)?,
        description: r.get(5)?,
        created_at_ms: r.get(6)?,
    })
}

pub(crate) fn load_account(conn: &Connection, id: AccountId) -> Result<Option<Account>> {
    conn.query_row(
        &format!("SELECT {ACCOUNT_COLS} FROM accounts WHERE id = ?1"),
        params![id],
        account_from_row,
    )
    .optional()
    .map_err(Into::into)
}

pub(crate) fn find_account_by_uri(conn: &Connection, uri: &str) -> Result<Option<Account>> {
    conn.query_row(
        &format!("SELECT {ACCOUNT_COLS} FROM accounts WHERE uri = ?1"),
        params![uri],
        account_from_row,
    )
    .optional()
    .map_err(Into::into)
}

pub(crate) fn load_status(conn: &Connection, id: StatusId) -> Result<Option<Status>> {
    conn.query_row(
        &format!("SELECT {STATUS_COLS} FROM statuses WHERE id = ?1"),
        params![id],
        status_from_row,
    )
    .optional()
    .map_err(Into::into)
}

pub(crate) fn find_status_by_uri(conn: &Connection, uri: &str) -> Result<Option<Status>> {
    conn.query_row(
        &format!("SELECT {STATUS_COLS} FROM statuses WHERE uri = ?1"),
        params![uri],
        status_from_row,
    )
    .optional()
    .map_err(Into::into)
}

pub(crate) fn insert_status(conn: &Connection, new: &NewStatus, base_url: &str) -> Result<Status> {
    let id = new.id.unwrap_or_else(next_id);
    let uri = match &new.uri {
        Some(u) => u.clone(),
        None => format!("{}/statuses/{id}", base_url.trim_end_matches('/')),
    };
    conn.execute(
        r#"
        INSERT INTO statuses(id, uri, url, account_id, text, spoiler_text, visibility, sensitive, language,
          created_at_ms, updated_at_ms, reblog_of_id, in_reply_to_id, in_reply_to_account_id, local)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, ?11, ?12, ?13, ?14)
        "#,
        params![
            id,
            uri,
            new.url,
            new.account_id,
            if new.reblog_of_id.is_some() { "" } else { new.text.as_str() },
            new.spoiler_text,
            new.visibility.as_i64(),
            new.sensitive,
            new.language,
            new.created_at_ms,
            new.reblog_of_id,
            new.in_reply_to_id,
            new.in_reply_to_account_id,
            new.local
        ],
    )
    .with_context(|| format!("insert status {uri}"))?;
    load_status(conn, id)?.ok_or_else(|| anyhow!("status vanished after insert"))
}

pub(crate) fn load_mentions(conn: &Connection, status_id: StatusId) -> Result<Vec<Mention>> {
    let mut stmt = conn.prepare("SELECT status_id, account_id, silent FROM mentions WHERE status_id = ?1 ORDER BY account_id")?;
    let rows = stmt.query_map(params![status_id], |r| {
        Ok(Mention {
            status_id: r.get(0)?,
            account_id: r.get(1)?,
            silent: r.get(2)?,
        })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

pub(crate) fn load_tags(conn: &Connection, status_id: StatusId) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM status_tags WHERE status_id = ?1 ORDER BY name")?;
    let rows = stmt.query_map(params![status_id], |r| r.get(0))?;
    rows.collect::<rusqlite::Result<Vec<String>>>().map_err(Into::into)
}

pub(crate) fn replace_tags(conn: &Connection, status_id: StatusId, tags: &[String]) -> Result<()> {
    conn.execute("DELETE FROM status_tags WHERE status_id = ?1", params![status_id])?;
    for tag in tags {
        let name = normalize_tag(tag);
        if name.is_empty() {
            continue;
        }
        conn.execute(
            "INSERT OR IGNORE INTO status_tags(status_id, name) VALUES (?1, ?2)",
            params![status_id, name],
        )?;
    }
    Ok(())
}

pub(crate) fn load_emojis(conn: &Connection, status_id: StatusId) -> Result<Vec<CustomEmoji>> {
    let mut stmt = conn.prepare("SELECT shortcode, domain, image_url FROM status_emojis WHERE status_id = ?1 ORDER BY shortcode")?;
    let rows = stmt.query_map(params![status_id], |r| {
        Ok(CustomEmoji {
            shortcode: r.get(0)?,
            domain: r.get(1)?,
            image_url: r.get(2)?,
        })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

pub(crate) fn replace_emojis(conn: &Connection, status_id: StatusId, emojis: &[CustomEmoji]) -> Result<()> {
    conn.execute("DELETE FROM status_emojis WHERE status_id = ?1", params![status_id])?;
    for e in emojis {
        conn.execute(
            "INSERT OR REPLACE INTO status_emojis(status_id, shortcode, domain, image_url) VALUES (?1, ?2, ?3, ?4)",
            params![status_id, e.shortcode, e.domain, e.image_url],
        )?;
    }
    Ok(())
}

pub(crate) fn insert_media(
    conn: &Connection,
    status_id: Option<StatusId>,
    account_id: AccountId,
    remote_url: &str,
    media_type: Option<&str>,
    description: Option<&str>,
) -> Result<MediaAttachment> {
    let id = next_id();
    let created_at_ms = now_ms();
    conn.execute(
        r#"
        INSERT INTO media_attachments(id, status_id, account_id, remote_url, media_type, description, created_at_ms)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![id, status_id, account_id, remote_url, media_type, description, created_at_ms],
    )?;
    Ok(MediaAttachment {
        id,
        status_id,
        account_id,
        remote_url: remote_url.to_string(),
        media_type: media_type.map(str::to_string),
        description: description.map(str::to_string),
        created_at_ms,
    })
}

pub(crate) fn load_media_for_status(conn: &Connection, status_id: StatusId) -> Result<Vec<MediaAttachment>> {
    let mut stmt = conn.prepare(
        "SELECT id, status_id, account_id, remote_url, media_type, description, created_at_ms FROM media_attachments WHERE status_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![status_id], media_from_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

fn insert_poll(conn: &Connection, status_id: StatusId, account_id: AccountId, options: &[String], multiple: bool, expires_at_ms: Option<i64>) -> Result<Poll> {
    let id = next_id();
    let options_json = serde_json::to_string(options)?;
    conn.execute(
        "INSERT INTO polls(id, status_id, account_id, options_json, multiple, expires_at_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, status_id, account_id, options_json, multiple, expires_at_ms],
    )?;
    Ok(Poll {
        id,
        status_id,
        account_id,
        options: options.to_vec(),
        multiple,
        expires_at_ms,
        votes_count: 0,
    })
}

pub(crate) fn create_poll_in(conn: &Connection, status_id: StatusId, account_id: AccountId, options: &[String], multiple: bool, expires_at_ms: Option<i64>) -> Result<Poll> {
    insert_poll(conn, status_id, account_id, options, multiple, expires_at_ms)
}

pub(crate) fn load_poll(conn: &Connection, id: i64) -> Result<Option<Poll>> {
    let row = conn
        .query_row(
            r#"
            SELECT p.id, p.status_id, p.account_id, p.options_json, p.multiple, p.expires_at_ms,
              (SELECT COUNT(*) FROM poll_votes v WHERE v.poll_id = p.id)
            FROM polls p WHERE p.id = ?1
            "#,
            params![id],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, bool>(4)?,
                    r.get::<_, Option<i64>>(5)?,
                    r.get::<_, u64>(6)?,
                ))
            },
        )
        .optional()?;
    let Some((id, status_id, account_id, options_json, multiple, expires_at_ms, votes_count)) = row else {
        return Ok(None);
    };
    let options: Vec<String> = serde_json::from_str(&options_json).context("decode poll options")?;
    Ok(Some(Poll {
        id,
        status_id,
        account_id,
        options,
        multiple,
        expires_at_ms,
        votes_count,
    }))
}

pub(crate) fn load_edits(conn: &Connection, status_id: StatusId) -> Result<Vec<StatusEdit>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, status_id, account_id, text, spoiler_text, sensitive, media_ids_json, poll_options_json, created_at_ms
        FROM status_edits WHERE status_id = ?1 ORDER BY id
        "#,
    )?;
    let mut rows = stmt.query(params![status_id])?;
    let mut out = Vec::new();
    while let Some(r) = rows.next()? {
        let media_json: String = r.get(6)?;
        let poll_json: Option<String> = r.get(7)?;
        out.push(StatusEdit {
            id: r.get(0)?,
            status_id: r.get(1)?,
            account_id: r.get(2)?,
            text: r.get(3)?,
            spoiler_text: r.get(4)?,
            sensitive: r.get(5)?,
            ordered_media_attachment_ids: serde_json::from_str(&media_json).unwrap_or_default(),
            poll_options: poll_json.and_then(|j| serde_json::from_str(&j).ok()),
            created_at_ms: r.get(8)?,
        });
    }
    Ok(out)
}

pub(crate) fn insert_edit(
    conn: &Connection,
    status: &Status,
    media_ids: &[i64],
    poll_options: Option<&[String]>,
    created_at_ms: i64,
) -> Result<()> {
    let poll_json = match poll_options {
        Some(o) => Some(serde_json::to_string(o)?),
        None => None,
    };
    conn.execute(
        r#"
        INSERT INTO status_edits(status_id, account_id, text, spoiler_text, sensitive, media_ids_json, poll_options_json, created_at_ms)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            status.id,
            status.account_id,
            status.text,
            status.spoiler_text,
            status.sensitive,
            serde_json::to_string(media_ids)?,
            poll_json,
            created_at_ms
        ],
    )?;
    Ok(())
}

pub(crate) fn enqueue_follow_up(conn: &Connection, kind: FollowUpKind, subject_id: i64, run_at_ms: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO follow_ups(kind, subject_id, run_at_ms, created_at_ms) VALUES (?1, ?2, ?3, ?4)",
        params![kind.as_str(), subject_id, run_at_ms, now_ms()],
    )?;
    Ok(())
}

pub fn normalize_tag(tag: &str) -> String {
    tag.trim().trim_start_matches('#').to_lowercase()
}

fn ensure_columns(conn: &Connection, table: &str, cols: &[(&str, &str)]) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut existing = std::collections::HashSet::new();
    for r in rows {
        existing.insert(r?);
    }
    for (name, ty) in cols {
        if !existing.contains(*name) {
            conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {name} {ty}"), [])?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn temp_db() -> (tempfile::TempDir, SocialDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = SocialDb::open(dir.path().join("fedicast.db")).unwrap();
        (dir, db)
    }

    pub fn local_account(db: &SocialDb, username: &str) -> Account {
        let acct = db
            .insert_account(&NewAccount {
                username: username.to_string(),
                uri: format!("https://local.test/users/{username}"),
                inbox_url: Some(format!("https://local.test/users/{username}/inbox")),
                ..Default::default()
            })
            .unwrap();
        db.touch_account_activity(acct.id, now_ms()).unwrap();
        db.get_account(acct.id).unwrap().unwrap()
    }

    pub fn remote_account(db: &SocialDb, username: &str, domain: &str, inbox: &str) -> Account {
        db.upsert_remote_account(&NewAccount {
            username: username.to_string(),
            domain: Some(domain.to_string()),
            uri: format!("https://{domain}/users/{username}"),
            inbox_url: Some(inbox.to_string()),
            ..Default::default()
        })
        .unwrap()
    }
}
