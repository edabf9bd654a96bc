/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

pub type AccountId = i64;
pub type StatusId = i64;

static SNOWFLAKE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Time-sortable id: milliseconds since the epoch in the high bits, a rolling sequence below.
pub fn snowflake_at(ts_ms: i64) -> i64 {
    let seq = SNOWFLAKE_SEQ.fetch_add(1, Ordering::Relaxed) & 0xffff;
    (ts_ms.max(0) << 16) | seq as i64
}

pub fn next_id() -> i64 {
    snowflake_at(now_ms())
}

pub fn snowflake_timestamp_ms(id: i64) -> i64 {
    id >> 16
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn ms_to_rfc3339(ms: i64) -> Option<String> {
    let secs = ms.checked_div(1000)?;
    let nanos = ms.rem_euclid(1000) * 1_000_000;
    let dt = time::OffsetDateTime::from_unix_timestamp(secs).ok()? + time::Duration::nanoseconds(nanos);
    dt.format(&time::format_description::well_known::Rfc3339).ok()
}

pub fn rfc3339_to_ms(s: &str) -> Option<i64> {
    let dt = time::OffsetDateTime::parse(s.trim(), &time::format_description::well_known::Rfc3339).ok()?;
    Some((dt.unix_timestamp_nanos() / 1_000_000) as i64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Unlisted,
    Private,
    Direct,
}

impl Visibility {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Public => 0,
            Self::Unlisted => 1,
            Self::Private => 2,
            Self::Direct => 3,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            0 => Self::Public,
            1 => Self::Unlisted,
            2 => Self::Private,
            _ => Self::Direct,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: AccountId,
    pub username: String,
    /// `None` for local accounts.
    pub domain: Option<String>,
    pub uri: String,
    pub inbox_url: Option<String>,
    pub shared_inbox_url: Option<String>,
    pub actor_type: String,
    pub silenced: bool,
    pub sensitized: bool,
    pub last_active_at_ms: Option<i64>,
    pub public_key_pem: Option<String>,
    pub private_key_pem: Option<String>,
}

impl Account {
    pub fn is_local(&self) -> bool {
        self.domain.is_none()
    }

    pub fn is_group(&self) -> bool {
        self.actor_type.eq_ignore_ascii_case("Group")
    }

    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.uri)
    }

    /// Shared inbox when the remote server advertises one.
    pub fn preferred_inbox(&self) -> Option<&str> {
        self.shared_inbox_url
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.inbox_url.as_deref().filter(|s| !s.is_empty()))
    }

    pub fn acct(&self) -> String {
        match &self.domain {
            Some(d) => format!("{}@{}", self.username, d),
            None => self.username.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewAccount {
    pub username: String,
    pub domain: Option<String>,
    pub uri: String,
    pub inbox_url: Option<String>,
    pub shared_inbox_url: Option<String>,
    pub actor_type: Option<String>,
    pub public_key_pem: Option<String>,
    pub private_key_pem: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub id: StatusId,
    pub uri: String,
    pub url: Option<String>,
    pub account_id: AccountId,
    pub text: String,
    pub spoiler_text: String,
    pub visibility: Visibility,
    pub sensitive: bool,
    pub language: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub edited_at_ms: Option<i64>,
    pub reblog_of_id: Option<StatusId>,
    pub in_reply_to_id: Option<StatusId>,
    pub in_reply_to_account_id: Option<AccountId>,
    pub poll_id: Option<i64>,
    pub local: bool,
    pub pinned: bool,
    pub preview_card_url: Option<String>,
    pub deleted_at_ms: Option<i64>,
}

impl Status {
    pub fn is_reblog(&self) -> bool {
        self.reblog_of_id.is_some()
    }

    pub fn is_reply(&self) -> bool {
        self.in_reply_to_id.is_some() || self.in_reply_to_account_id.is_some()
    }

    /// Replies to the author's own status count as a thread, not a conversation with someone else.
    pub fn is_reply_to_other_account(&self) -> bool {
        match self.in_reply_to_account_id {
            Some(target) => target != self.account_id,
            None => self.in_reply_to_id.is_some(),
        }
    }

    pub fn within_realtime_window(&self, now_ms: i64, window_ms: i64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) <= window_ms
    }
}

/// Fields supplied when a status is first materialized.
#[derive(Debug, Clone)]
pub struct NewStatus {
    pub id: Option<StatusId>,
    pub uri: Option<String>,
    pub url: Option<String>,
    pub account_id: AccountId,
    pub text: String,
    pub spoiler_text: String,
    pub visibility: Visibility,
    pub sensitive: bool,
    pub language: Option<String>,
    pub created_at_ms: i64,
    pub reblog_of_id: Option<StatusId>,
    pub in_reply_to_id: Option<StatusId>,
    pub in_reply_to_account_id: Option<AccountId>,
    pub local: bool,
}

impl NewStatus {
    pub fn new(account_id: AccountId, text: impl Into<String>, visibility: Visibility) -> Self {
        Self {
            id: None,
            uri: None,
            url: None,
            account_id,
            text: text.into(),
            spoiler_text: String::new(),
            visibility,
            sensitive: false,
            language: None,
            created_at_ms: now_ms(),
            reblog_of_id: None,
            in_reply_to_id: None,
            in_reply_to_account_id: None,
            local: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaAttachment {
    pub id: i64,
    pub status_id: Option<StatusId>,
    pub account_id: AccountId,
    pub remote_url: String,
    pub media_type: Option<String>,
    pub description: Option<String>,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Poll {
    pub id: i64,
    pub status_id: StatusId,
    pub account_id: AccountId,
    pub options: Vec<String>,
    pub multiple: bool,
    pub expires_at_ms: Option<i64>,
    pub votes_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEdit {
    pub id: i64,
    pub status_id: StatusId,
    pub account_id: AccountId,
    pub text: String,
    pub spoiler_text: String,
    pub sensitive: bool,
    pub ordered_media_attachment_ids: Vec<i64>,
    pub poll_options: Option<Vec<String>>,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    pub status_id: StatusId,
    pub account_id: AccountId,
    pub silent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomEmoji {
    pub shortcode: String,
    pub domain: Option<String>,
    pub image_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Mention,
    Reblog,
    Poll,
    Update,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mention => "mention",
            Self::Reblog => "reblog",
            Self::Poll => "poll",
            Self::Update => "update",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mention" => Some(Self::Mention),
            "reblog" => Some(Self::Reblog),
            "poll" => Some(Self::Poll),
            "update" => Some(Self::Update),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub id: i64,
    pub account_id: AccountId,
    pub from_account_id: AccountId,
    pub kind: NotificationKind,
    pub status_id: Option<StatusId>,
    pub created_at_ms: i64,
}

/// Deferred work recorded after a commit; executed by external workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUpKind {
    LinkCrawl,
    MediaRedownload,
    PollExpirationNotify,
}

impl FollowUpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LinkCrawl => "link_crawl",
            Self::MediaRedownload => "media_redownload",
            Self::PollExpirationNotify => "poll_expiration_notify",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowUp {
    pub id: i64,
    pub kind: String,
    pub subject_id: i64,
    pub run_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupPolicy {
    pub id: i64,
    pub account_id: AccountId,
    pub enabled: bool,
    pub min_status_age_secs: u64,
    pub keep_pinned: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339_timestamps() {
        assert_eq!(rfc3339_to_ms("2024-01-02T03:04:05.250Z"), Some(1_704_164_645_250));
        assert_eq!(ms_to_rfc3339(1_704_164_645_250).as_deref(), Some("2024-01-02T03:04:05.25Z"));
        assert_eq!(rfc3339_to_ms("yesterday"), None);
    }

    #[test]
    fn snowflakes_sort_by_time() {
        let a = snowflake_at(1_000);
        let b = snowflake_at(1_001);
        assert!(a < b);
        assert_eq!(snowflake_timestamp_ms(a), 1_000);
        assert_ne!(snowflake_at(5_000), snowflake_at(5_000));
    }

    #[test]
    fn self_thread_is_not_reply_to_other() {
        let mut s = Status {
            id: 1,
            uri: "u".into(),
            url: None,
            account_id: 7,
            text: String::new(),
            spoiler_text: String::new(),
            visibility: Visibility::Public,
            sensitive: false,
            language: None,
            created_at_ms: 0,
            updated_at_ms: 0,
            edited_at_ms: None,
            reblog_of_id: None,
            in_reply_to_id: Some(2),
            in_reply_to_account_id: Some(7),
            poll_id: None,
            local: true,
            pinned: false,
            preview_card_url: None,
            deleted_at_ms: None,
        };
        assert!(!s.is_reply_to_other_account());
        s.in_reply_to_account_id = Some(8);
        assert!(s.is_reply_to_other_account());
    }
}
