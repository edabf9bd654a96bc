/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Dispatch of verified inbound activities to per-type handlers.

use crate::activity::{self, parse_note, ParsedNote};
use crate::distribution::Distributor;
use crate::model::{now_ms, snowflake_at, Account, FollowUpKind, NewStatus, StatusId, Visibility};
use crate::request::RequestSender;
use crate::social_db::{self, blocking, SocialDb};
use crate::status_update::{StatusUpdater, UpdateOutcome};
use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::params;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

const MAX_MEDIA_ATTACHMENTS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityKind {
    Create,
    Update,
    Announce,
    Delete,
    Unknown(String),
}

impl ActivityKind {
    pub fn of(activity: &Value) -> Self {
        match activity.get("type").and_then(Value::as_str).unwrap_or("") {
            "Create" => Self::Create,
            "Update" => Self::Update,
            "Announce" => Self::Announce,
            "Delete" => Self::Delete,
            other => Self::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    Created(StatusId),
    Updated { edit_recorded: bool },
    Announced(StatusId),
    Deleted(StatusId),
    Ignored(&'static str),
}

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    /// `actor` is the authenticated sender, already stored.
    async fn handle(&self, actor: &Account, activity: &Value) -> Result<HandleOutcome>;
}

pub struct InboxProcessor {
    create: Arc<dyn ActivityHandler>,
    update: Arc<dyn ActivityHandler>,
    announce: Arc<dyn ActivityHandler>,
    delete: Arc<dyn ActivityHandler>,
}

impl InboxProcessor {
    /// `fetcher` dereferences objects sent by id only; without it such activities are ignored.
    pub fn new(distributor: Distributor, updater: StatusUpdater, fetcher: Option<RequestSender>) -> Self {
        Self {
            create: Arc::new(CreateHandler {
                distributor: distributor.clone(),
                fetcher,
            }),
            update: Arc::new(UpdateHandler {
                db: distributor.db().clone(),
                updater,
            }),
            announce: Arc::new(AnnounceHandler {
                distributor: distributor.clone(),
            }),
            delete: Arc::new(DeleteHandler { distributor }),
        }
    }

    pub async fn process(&self, actor: &Account, activity: &Value) -> Result<HandleOutcome> {
        let kind = ActivityKind::of(activity);
        let handler = match &kind {
            ActivityKind::Create => &self.create,
            ActivityKind::Update => &self.update,
            ActivityKind::Announce => &self.announce,
            ActivityKind::Delete => &self.delete,
            ActivityKind::Unknown(ty) => {
                debug!(kind = %ty, actor = %actor.uri, "activity type not handled");
                return Ok(HandleOutcome::Ignored("unsupported type"));
            }
        };
        let outcome = handler.handle(actor, activity).await?;
        debug!(kind = ?kind, actor = %actor.uri, outcome = ?outcome, "activity processed");
        Ok(outcome)
    }
}

struct CreateHandler {
    distributor: Distributor,
    fetcher: Option<RequestSender>,
}

#[async_trait]
impl ActivityHandler for CreateHandler {
    async fn handle(&self, actor: &Account, activity: &Value) -> Result<HandleOutcome> {
        let object = match activity.get("object") {
            Some(Value::String(id)) => match &self.fetcher {
                Some(sender) => sender.fetch_json(id, None).await?,
                None => return Ok(HandleOutcome::Ignored("object not embedded")),
            },
            Some(obj @ Value::Object(_)) => obj.clone(),
            _ => return Ok(HandleOutcome::Ignored("missing object")),
        };
        let parsed = match parse_note(&object) {
            Ok(p) => p,
            Err(e) => {
                debug!(actor = %actor.uri, "create ignored: {e:#}");
                return Ok(HandleOutcome::Ignored("unsupported object"));
            }
        };
        if parsed.attributed_to != actor.uri {
            return Ok(HandleOutcome::Ignored("actor mismatch"));
        }

        let db = self.distributor.db().clone();
        let author = actor.clone();
        let created = blocking(move || materialize_note(&db, &author, &parsed)).await?;
        let Some(status_id) = created else {
            return Ok(HandleOutcome::Ignored("duplicate"));
        };
        self.distributor.distribute(status_id, false).await?;
        info!(status_id, actor = %actor.uri, "remote status created");
        Ok(HandleOutcome::Created(status_id))
    }
}

/// Stores a remote note with its tags, emojis, mentions, media and poll.
/// `None` when the URI is already known.
fn materialize_note(db: &SocialDb, author: &Account, parsed: &ParsedNote) -> Result<Option<StatusId>> {
    db.with_transaction(|tx| {
        if social_db::find_status_by_uri(tx, &parsed.uri)?.is_some() {
            return Ok(None);
        }
        let now = now_ms();
        let created_at_ms = parsed.published_ms.unwrap_or(now).min(now);
        let (in_reply_to_id, in_reply_to_account_id) = match &parsed.in_reply_to {
            Some(uri) => match social_db::find_status_by_uri(tx, uri)? {
                Some(parent) => (Some(parent.id), Some(parent.account_id)),
                None => (None, None),
            },
            None => (None, None),
        };
        let new = NewStatus {
            id: Some(snowflake_at(created_at_ms)),
            uri: Some(parsed.uri.clone()),
            url: parsed.url.clone(),
            account_id: author.id,
            text: parsed.text.clone(),
            spoiler_text: parsed.spoiler_text.clone(),
            visibility: parsed.visibility,
            sensitive: parsed.sensitive || author.sensitized,
            language: parsed.language.clone(),
            created_at_ms,
            reblog_of_id: None,
            in_reply_to_id,
            in_reply_to_account_id,
            local: false,
        };
        let status = social_db::insert_status(tx, &new, "")?;
        social_db::replace_tags(tx, status.id, &parsed.tags)?;
        social_db::replace_emojis(tx, status.id, &parsed.emojis)?;
        for uri in &parsed.mention_uris {
            if let Some(acct) = social_db::find_account_by_uri(tx, uri)? {
                tx.execute(
                    "INSERT OR REPLACE INTO mentions(status_id, account_id, silent) VALUES (?1, ?2, 0)",
                    params![status.id, acct.id],
                )?;
            }
        }
        for m in parsed.media.iter().take(MAX_MEDIA_ATTACHMENTS) {
            let media = social_db::insert_media(
                tx,
                Some(status.id),
                author.id,
                &m.url,
                m.media_type.as_deref(),
                m.description.as_deref(),
            )?;
            social_db::enqueue_follow_up(tx, FollowUpKind::MediaRedownload, media.id, now)?;
        }
        if let Some(poll) = &parsed.poll {
            let poll = social_db::create_poll_in(tx, status.id, author.id, &poll.options, poll.multiple, poll.expires_at_ms)?;
            tx.execute("UPDATE statuses SET poll_id = ?2 WHERE id = ?1", params![status.id, poll.id])?;
        }
        Ok(Some(status.id))
    })
}

struct UpdateHandler {
    db: SocialDb,
    updater: StatusUpdater,
}

#[async_trait]
impl ActivityHandler for UpdateHandler {
    async fn handle(&self, actor: &Account, activity: &Value) -> Result<HandleOutcome> {
        let Some(object) = activity.get("object").filter(|o| o.is_object()) else {
            return Ok(HandleOutcome::Ignored("object not embedded"));
        };
        let Some(uri) = activity::extract_object_id(activity) else {
            return Ok(HandleOutcome::Ignored("object without id"));
        };
        let db = self.db.clone();
        let Some(status) = blocking(move || db.find_status_by_uri(&uri)).await? else {
            return Ok(HandleOutcome::Ignored("unknown status"));
        };
        if status.account_id != actor.id {
            return Ok(HandleOutcome::Ignored("actor mismatch"));
        }
        match self.updater.process_update(status.id, object).await? {
            UpdateOutcome::Stale => Ok(HandleOutcome::Ignored("stale")),
            UpdateOutcome::Applied { edit_recorded, .. } => Ok(HandleOutcome::Updated { edit_recorded }),
        }
    }
}

struct AnnounceHandler {
    distributor: Distributor,
}

#[async_trait]
impl ActivityHandler for AnnounceHandler {
    async fn handle(&self, actor: &Account, activity: &Value) -> Result<HandleOutcome> {
        let Some(activity_uri) = activity.get("id").and_then(Value::as_str).map(str::to_string) else {
            return Ok(HandleOutcome::Ignored("announce without id"));
        };
        let Some(object_uri) = activity::extract_object_id(activity) else {
            return Ok(HandleOutcome::Ignored("missing object"));
        };
        let visibility = activity::visibility_of(activity, &actor.uri);
        let published = activity
            .get("published")
            .and_then(Value::as_str)
            .and_then(crate::model::rfc3339_to_ms);

        let db = self.distributor.db().clone();
        let actor_id = actor.id;
        let created = blocking(move || {
            db.with_transaction(|tx| {
                if social_db::find_status_by_uri(tx, &activity_uri)?.is_some() {
                    return Ok(Err("duplicate"));
                }
                let Some(original) = social_db::find_status_by_uri(tx, &object_uri)? else {
                    return Ok(Err("unknown object"));
                };
                if matches!(original.visibility, Visibility::Private | Visibility::Direct) {
                    return Ok(Err("not reblogable"));
                }
                let now = now_ms();
                let created_at_ms = published.unwrap_or(now).min(now);
                let mut new = NewStatus::new(actor_id, "", visibility);
                new.id = Some(snowflake_at(created_at_ms));
                new.uri = Some(activity_uri.clone());
                new.created_at_ms = created_at_ms;
                new.reblog_of_id = Some(original.id);
                new.local = false;
                let status = social_db::insert_status(tx, &new, "")?;
                Ok(Ok(status.id))
            })
        })
        .await?;
        let status_id = match created {
            Ok(id) => id,
            Err(reason) => return Ok(HandleOutcome::Ignored(reason)),
        };
        self.distributor.distribute(status_id, false).await?;
        Ok(HandleOutcome::Announced(status_id))
    }
}

struct DeleteHandler {
    distributor: Distributor,
}

#[async_trait]
impl ActivityHandler for DeleteHandler {
    async fn handle(&self, actor: &Account, activity: &Value) -> Result<HandleOutcome> {
        let Some(uri) = activity::extract_object_id(activity) else {
            return Ok(HandleOutcome::Ignored("missing object"));
        };
        let db = self.distributor.db().clone();
        let Some(status) = blocking(move || db.find_status_by_uri(&uri)).await? else {
            return Ok(HandleOutcome::Ignored("unknown status"));
        };
        if status.account_id != actor.id {
            return Ok(HandleOutcome::Ignored("actor mismatch"));
        }
        let deleted = self
            .distributor
            .delete_status(status.id)
            .await
            .with_context(|| format!("delete status {}", status.id))?;
        if !deleted {
            return Ok(HandleOutcome::Ignored("already deleted"));
        }
        Ok(HandleOutcome::Deleted(status.id))
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::processor;
    use super::*;
    use crate::activity::AS_PUBLIC;
    use crate::feed_store::{FeedId, FeedStore};
    use crate::model::ms_to_rfc3339;
    use crate::social_db::test_support::{local_account, remote_account, temp_db};
    use crate::streaming::Streaming;
    use serde_json::json;

    fn create(actor: &Account, note_id: &str, text: &str) -> Value {
        json!({
            "id": format!("{note_id}/activity"),
            "type": "Create",
            "actor": actor.uri,
            "object": {
                "id": note_id,
                "type": "Note",
                "attributedTo": actor.uri,
                "content": text,
                "published": ms_to_rfc3339(now_ms()),
                "to": [AS_PUBLIC],
                "cc": ["https://local.test/users/me"],
                "tag": [{"type": "Mention", "href": "https://local.test/users/me"}],
                "attachment": [{"type": "Document", "url": "https://remote.example/m/1.png"}]
            }
        })
    }

    fn feeds(db: &SocialDb, s: &Streaming) -> FeedStore {
        crate::feed_store::test_support::feed_store(db, s)
    }

    #[test]
    fn kinds_resolve_once() {
        assert_eq!(ActivityKind::of(&json!({"type": "Create"})), ActivityKind::Create);
        assert_eq!(ActivityKind::of(&json!({"type": "Like"})), ActivityKind::Unknown("Like".into()));
        assert_eq!(ActivityKind::of(&json!({})), ActivityKind::Unknown(String::new()));
    }

    #[tokio::test]
    async fn create_materializes_and_distributes() {
        let (_dir, db) = temp_db();
        let s = Streaming::default();
        let p = processor(&db, &s);
        let me = local_account(&db, "me");
        let bob = remote_account(&db, "bob", "remote.example", "https://remote.example/inbox");
        db.follow(me.id, bob.id, true).unwrap();

        let act = create(&bob, "https://remote.example/notes/1", "hi @me");
        let HandleOutcome::Created(id) = p.process(&bob, &act).await.unwrap() else {
            panic!("not created");
        };
        let st = db.get_status(id).unwrap().unwrap();
        assert!(!st.local);
        assert_eq!(st.visibility, Visibility::Public);
        assert_eq!(db.media_of(id).unwrap().len(), 1);
        assert_eq!(db.mentions_of(id).unwrap()[0].account_id, me.id);
        assert_eq!(db.notifications_for(me.id, 5).unwrap().len(), 1);
        assert_eq!(feeds(&db, &s).entries(FeedId::Home(me.id), 5).unwrap()[0].status_id, id);

        assert_eq!(p.process(&bob, &act).await.unwrap(), HandleOutcome::Ignored("duplicate"));
    }

    #[tokio::test]
    async fn create_for_someone_else_is_ignored() {
        let (_dir, db) = temp_db();
        let s = Streaming::default();
        let p = processor(&db, &s);
        let bob = remote_account(&db, "bob", "remote.example", "https://remote.example/inbox");
        let eve = remote_account(&db, "eve", "evil.example", "https://evil.example/inbox");
        let act = create(&bob, "https://remote.example/notes/2", "forged");
        assert_eq!(p.process(&eve, &act).await.unwrap(), HandleOutcome::Ignored("actor mismatch"));
        assert_eq!(
            p.process(&bob, &json!({"type": "Like", "object": "x"})).await.unwrap(),
            HandleOutcome::Ignored("unsupported type")
        );
    }

    #[tokio::test]
    async fn update_announce_and_delete_round() {
        let (_dir, db) = temp_db();
        let s = Streaming::default();
        let p = processor(&db, &s);
        let me = local_account(&db, "me");
        let bob = remote_account(&db, "bob", "remote.example", "https://remote.example/inbox");
        let carol = remote_account(&db, "carol", "other.example", "https://other.example/inbox");
        db.follow(me.id, carol.id, true).unwrap();

        let note_id = "https://remote.example/notes/3";
        let HandleOutcome::Created(id) = p.process(&bob, &create(&bob, note_id, "v1")).await.unwrap() else {
            panic!("not created");
        };

        let mut update = create(&bob, note_id, "v2");
        update["type"] = json!("Update");
        update["object"]["updated"] = json!(ms_to_rfc3339(now_ms() + 1000));
        assert_eq!(
            p.process(&bob, &update).await.unwrap(),
            HandleOutcome::Updated { edit_recorded: true }
        );
        assert_eq!(db.get_status(id).unwrap().unwrap().text, "v2");
        assert_eq!(p.process(&carol, &update).await.unwrap(), HandleOutcome::Ignored("actor mismatch"));

        let announce = json!({
            "id": "https://other.example/boosts/1",
            "type": "Announce",
            "actor": carol.uri,
            "object": note_id,
            "to": [AS_PUBLIC],
        });
        let HandleOutcome::Announced(rb) = p.process(&carol, &announce).await.unwrap() else {
            panic!("not announced");
        };
        assert_eq!(db.get_status(rb).unwrap().unwrap().reblog_of_id, Some(id));
        assert_eq!(feeds(&db, &s).entries(FeedId::Home(me.id), 5).unwrap()[0].status_id, rb);

        let delete = json!({"type": "Delete", "actor": bob.uri, "object": {"id": note_id, "type": "Tombstone"}});
        assert_eq!(p.process(&bob, &delete).await.unwrap(), HandleOutcome::Deleted(id));
        assert!(feeds(&db, &s).entries(FeedId::Home(me.id), 5).unwrap().is_empty());
        assert_eq!(p.process(&bob, &delete).await.unwrap(), HandleOutcome::Ignored("already deleted"));
    }
}
