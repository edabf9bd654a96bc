/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Compact status JSON carried in streaming events.

use crate::model::{ms_to_rfc3339, Account, Status};
use crate::social_db::SocialDb;
use anyhow::Result;
use serde_json::{json, Value};

pub fn status_payload(db: &SocialDb, status: &Status) -> Result<String> {
    Ok(status_value(db, status, true)?.to_string())
}

fn status_value(db: &SocialDb, status: &Status, follow_reblog: bool) -> Result<Value> {
    let account = db.get_account(status.account_id)?;
    let reblog = match status.reblog_of_id {
        Some(id) if follow_reblog => match db.get_status(id)? {
            Some(orig) => status_value(db, &orig, false)?,
            None => Value::Null,
        },
        _ => Value::Null,
    };
    let media: Vec<Value> = db
        .media_of(status.id)?
        .into_iter()
        .map(|m| {
            json!({
                "id": m.id.to_string(),
                "remote_url": m.remote_url,
                "description": m.description,
            })
        })
        .collect();
    let poll = match status.poll_id {
        Some(id) => db
            .get_poll(id)?
            .map(|p| {
                json!({
                    "id": p.id.to_string(),
                    "options": p.options,
                    "multiple": p.multiple,
                    "expires_at": p.expires_at_ms.and_then(ms_to_rfc3339),
                    "votes_count": p.votes_count,
                })
            })
            .unwrap_or(Value::Null),
        None => Value::Null,
    };
    Ok(json!({
        "id": status.id.to_string(),
        "uri": status.uri,
        "url": status.url,
        "created_at": ms_to_rfc3339(status.created_at_ms),
        "edited_at": status.edited_at_ms.and_then(ms_to_rfc3339),
        "account": account.as_ref().map(account_value),
        "content": status.text,
        "spoiler_text": status.spoiler_text,
        "visibility": status.visibility,
        "sensitive": status.sensitive,
        "language": status.language,
        "in_reply_to_id": status.in_reply_to_id.map(|v| v.to_string()),
        "in_reply_to_account_id": status.in_reply_to_account_id.map(|v| v.to_string()),
        "tags": db.tags_of(status.id)?,
        "media_attachments": media,
        "poll": poll,
        "reblog": reblog,
    }))
}

fn account_value(a: &Account) -> Value {
    json!({
        "id": a.id.to_string(),
        "acct": a.acct(),
        "url": a.uri,
        "group": a.is_group(),
    })
}
