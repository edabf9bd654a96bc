/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::feed_store::{FeedStore, FilterContext};
use crate::model::{ms_to_rfc3339, AccountId, Notification, NotificationKind, Status};
use crate::streaming::{self, Streaming};
use anyhow::Result;
use fedicast_protocol::StreamMessage;
use serde_json::json;
use tracing::debug;

#[derive(Clone)]
pub struct NotifyService {
    feeds: FeedStore,
    streaming: Streaming,
}

impl NotifyService {
    pub fn new(feeds: FeedStore, streaming: Streaming) -> Self {
        Self { feeds, streaming }
    }

    /// Records and streams a notification unless the recipient should not see it.
    /// Returns `None` when suppressed or already recorded.
    pub fn notify(
        &self,
        recipient: AccountId,
        kind: NotificationKind,
        from: AccountId,
        status: Option<&Status>,
    ) -> Result<Option<Notification>> {
        if self.suppressed(recipient, kind, from, status)? {
            debug!(recipient, from, kind = kind.as_str(), "notification suppressed");
            return Ok(None);
        }
        let db = self.feeds.db();
        let Some(n) = db.insert_notification(recipient, from, kind, status.map(|s| s.id))? else {
            return Ok(None);
        };
        let payload = json!({
            "id": n.id.to_string(),
            "type": n.kind,
            "account_id": n.from_account_id.to_string(),
            "status_id": n.status_id.map(|v| v.to_string()),
            "created_at": ms_to_rfc3339(n.created_at_ms),
        });
        self.streaming.publish(
            &streaming::notifications(recipient),
            StreamMessage::NOTIFICATION,
            payload.to_string(),
        );
        Ok(Some(n))
    }

    fn suppressed(&self, recipient: AccountId, kind: NotificationKind, from: AccountId, status: Option<&Status>) -> Result<bool> {
        let db = self.feeds.db();
        let Some(recipient_acct) = db.get_account(recipient)? else {
            return Ok(true);
        };
        if !recipient_acct.is_local() {
            return Ok(true);
        }
        if recipient == from && kind != NotificationKind::Poll {
            return Ok(true);
        }
        let Some(sender) = db.get_account(from)? else {
            return Ok(true);
        };
        if db.is_blocking(recipient, from)? || db.mute_hides_notifications(recipient, from)? == Some(true) {
            return Ok(true);
        }
        let follows_sender = db.is_following(recipient, from)?;
        if !follows_sender && db.is_domain_blocked_by(recipient, sender.domain.as_deref())? {
            return Ok(true);
        }
        if sender.silenced && !follows_sender {
            return Ok(true);
        }
        if kind == NotificationKind::Mention {
            if let Some(status) = status {
                return self.feeds.filter(FilterContext::Mentions, status, recipient);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed_store::test_support::feed_store;
    use crate::model::{NewStatus, Visibility};
    use crate::social_db::test_support::{local_account, remote_account, temp_db};
    use crate::streaming::test_support::drain;

    #[test]
    fn mention_notifies_and_streams() {
        let (_dir, db) = temp_db();
        let s = Streaming::default();
        let svc = NotifyService::new(feed_store(&db, &s), s.clone());
        let a = local_account(&db, "a");
        let b = local_account(&db, "b");
        let st = db.insert_status(&NewStatus::new(a.id, "@b hi", Visibility::Public), "https://local.test").unwrap();

        let mut rx = s.subscribe();
        let n = svc.notify(b.id, NotificationKind::Mention, a.id, Some(&st)).unwrap().unwrap();
        assert_eq!(n.kind, NotificationKind::Mention);
        let events = drain(&mut rx);
        assert_eq!(events[0].channel, streaming::notifications(b.id));
        assert_eq!(events[0].message.event, StreamMessage::NOTIFICATION);
        // Same notification twice is recorded once.
        assert!(svc.notify(b.id, NotificationKind::Mention, a.id, Some(&st)).unwrap().is_none());
    }

    #[test]
    fn suppression_rules() {
        let (_dir, db) = temp_db();
        let s = Streaming::default();
        let svc = NotifyService::new(feed_store(&db, &s), s.clone());
        let me = local_account(&db, "me");
        let loud = local_account(&db, "loud");
        let quiet = local_account(&db, "quiet");
        let shadow = remote_account(&db, "shadow", "shady.example", "https://shady.example/inbox");
        let st = db.insert_status(&NewStatus::new(loud.id, "x", Visibility::Public), "https://local.test").unwrap();

        assert!(svc.notify(me.id, NotificationKind::Reblog, me.id, None).unwrap().is_none());
        assert!(svc.notify(me.id, NotificationKind::Poll, me.id, None).unwrap().is_some());

        db.mute(me.id, quiet.id, true).unwrap();
        assert!(svc.notify(me.id, NotificationKind::Reblog, quiet.id, None).unwrap().is_none());

        // A mute that keeps notifications still hides mentions.
        db.mute(me.id, loud.id, false).unwrap();
        assert!(svc.notify(me.id, NotificationKind::Reblog, loud.id, None).unwrap().is_some());
        assert!(svc.notify(me.id, NotificationKind::Mention, loud.id, Some(&st)).unwrap().is_none());

        db.set_account_silenced(shadow.id, true).unwrap();
        assert!(svc.notify(me.id, NotificationKind::Update, shadow.id, None).unwrap().is_none());
        db.follow(me.id, shadow.id, true).unwrap();
        assert!(svc.notify(me.id, NotificationKind::Update, shadow.id, None).unwrap().is_some());
    }

    #[test]
    fn domain_block_yields_to_follow() {
        let (_dir, db) = temp_db();
        let s = Streaming::default();
        let svc = NotifyService::new(feed_store(&db, &s), s.clone());
        let me = local_account(&db, "me");
        let r = remote_account(&db, "r", "blocked.example", "https://blocked.example/inbox");
        db.block_domain(me.id, "blocked.example").unwrap();
        assert!(svc.notify(me.id, NotificationKind::Reblog, r.id, None).unwrap().is_none());
        db.follow(me.id, r.id, true).unwrap();
        assert!(svc.notify(me.id, NotificationKind::Reblog, r.id, None).unwrap().is_some());
        assert!(svc.notify(r.id, NotificationKind::Reblog, me.id, None).unwrap().is_none());
    }
}
