/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! ActivityPub JSON in both directions: reading remote Note/Question objects
//! and building the Create/Update/Announce/Delete payloads we deliver.

use crate::model::{ms_to_rfc3339, rfc3339_to_ms, Account, CustomEmoji, Status, Visibility};
use crate::social_db::{normalize_tag, SocialDb};
use anyhow::{bail, Context, Result};
use serde_json::{json, Map, Value};
use sha2::Digest as _;

pub const AS_PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";
const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

fn is_public_address(s: &str) -> bool {
    s == AS_PUBLIC || s == "as:Public" || s == "Public"
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMedia {
    pub url: String,
    pub media_type: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPoll {
    pub options: Vec<String>,
    pub multiple: bool,
    pub expires_at_ms: Option<i64>,
}

/// The parts of a remote Note (or Question) this server stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedNote {
    pub uri: String,
    pub url: Option<String>,
    pub attributed_to: String,
    pub text: String,
    pub spoiler_text: String,
    pub sensitive: bool,
    pub language: Option<String>,
    pub published_ms: Option<i64>,
    pub updated_ms: Option<i64>,
    pub in_reply_to: Option<String>,
    pub visibility: Visibility,
    pub tags: Vec<String>,
    pub mention_uris: Vec<String>,
    pub emojis: Vec<CustomEmoji>,
    pub media: Vec<ParsedMedia>,
    pub poll: Option<ParsedPoll>,
}

pub fn parse_note(obj: &Value) -> Result<ParsedNote> {
    let ty = obj.get("type").and_then(Value::as_str).unwrap_or("");
    if !matches!(ty, "Note" | "Question" | "Article" | "Page") {
        bail!("unsupported object type: {ty}");
    }
    let uri = str_field(obj, "id").context("object without id")?;
    let attributed_to = first_id(obj.get("attributedTo")).context("object without attributedTo")?;
    let url = match obj.get("url") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(v) => first_href(v),
        None => None,
    };
    let language = obj
        .get("contentMap")
        .and_then(Value::as_object)
        .and_then(|m| m.keys().next().cloned());

    let mut tags = Vec::new();
    let mut mention_uris = Vec::new();
    let mut emojis = Vec::new();
    for tag in as_list(obj.get("tag")) {
        match tag.get("type").and_then(Value::as_str) {
            Some("Hashtag") => {
                if let Some(name) = str_field(tag, "name") {
                    let name = normalize_tag(&name);
                    if !name.is_empty() && !tags.contains(&name) {
                        tags.push(name);
                    }
                }
            }
            Some("Mention") => {
                if let Some(href) = str_field(tag, "href") {
                    if !mention_uris.contains(&href) {
                        mention_uris.push(href);
                    }
                }
            }
            Some("Emoji") => {
                let name = str_field(tag, "name").unwrap_or_default();
                let image = tag.get("icon").and_then(|i| str_field(i, "url"));
                if let Some(image_url) = image {
                    let shortcode = name.trim_matches(':').to_string();
                    if !shortcode.is_empty() {
                        emojis.push(CustomEmoji {
                            shortcode,
                            domain: host_of(&uri),
                            image_url,
                        });
                    }
                }
            }
            _ => {}
        }
    }

    let media = as_list(obj.get("attachment"))
        .into_iter()
        .filter_map(|a| {
            let url = match a.get("url") {
                Some(Value::String(s)) => s.clone(),
                Some(v) => first_href(v)?,
                None => return None,
            };
            Some(ParsedMedia {
                url,
                media_type: str_field(a, "mediaType"),
                description: str_field(a, "name").filter(|s| !s.is_empty()),
            })
        })
        .collect();

    let poll = if ty == "Question" {
        let (choices, multiple) = match obj.get("anyOf") {
            Some(v) => (v, true),
            None => (obj.get("oneOf").unwrap_or(&Value::Null), false),
        };
        let options: Vec<String> = as_list(Some(choices))
            .into_iter()
            .filter_map(|c| str_field(c, "name"))
            .collect();
        (!options.is_empty()).then(|| ParsedPoll {
            options,
            multiple,
            expires_at_ms: obj
                .get("endTime")
                .or_else(|| obj.get("closed"))
                .and_then(Value::as_str)
                .and_then(rfc3339_to_ms),
        })
    } else {
        None
    };

    Ok(ParsedNote {
        visibility: visibility_of(obj, &attributed_to),
        uri,
        url,
        text: str_field(obj, "content").unwrap_or_default(),
        spoiler_text: str_field(obj, "summary").unwrap_or_default(),
        sensitive: obj.get("sensitive").and_then(Value::as_bool).unwrap_or(false),
        language,
        published_ms: obj.get("published").and_then(Value::as_str).and_then(rfc3339_to_ms),
        updated_ms: obj.get("updated").and_then(Value::as_str).and_then(rfc3339_to_ms),
        in_reply_to: first_id(obj.get("inReplyTo")),
        attributed_to,
        tags,
        mention_uris,
        emojis,
        media,
        poll,
    })
}

/// Public in `to` is public, public in `cc` is unlisted, a followers
/// collection is private, anything else is direct.
pub fn visibility_of(obj: &Value, actor: &str) -> Visibility {
    let to = addresses(obj.get("to"));
    let cc = addresses(obj.get("cc"));
    if to.iter().any(|s| is_public_address(s)) {
        return Visibility::Public;
    }
    if cc.iter().any(|s| is_public_address(s)) {
        return Visibility::Unlisted;
    }
    let followers = format!("{}/followers", actor.trim_end_matches('/'));
    if to.iter().chain(cc.iter()).any(|s| *s == followers || s.ends_with("/followers")) {
        return Visibility::Private;
    }
    Visibility::Direct
}

pub fn extract_actor(activity: &Value) -> Option<String> {
    if let Some(actor) = first_id(activity.get("actor")) {
        return Some(actor);
    }
    first_id(activity.get("object")?.get("attributedTo"))
}

pub fn extract_object_id(activity: &Value) -> Option<String> {
    first_id(activity.get("object"))
}

/// The activity `id`, or a content hash for activities that lack one.
pub fn activity_dedup_id(activity: &Value) -> String {
    if let Some(id) = activity.get("id").and_then(Value::as_str) {
        let id = id.trim();
        if !id.is_empty() {
            return id.to_string();
        }
    }
    let bytes = serde_json::to_vec(&canonicalize_json(activity)).unwrap_or_else(|_| b"null".to_vec());
    format!("urn:fedicast:inbox:{}", hex::encode(sha2::Sha256::digest(&bytes)))
}

fn canonicalize_json(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys = map.keys().cloned().collect::<Vec<_>>();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                if let Some(val) = map.get(&k) {
                    out.insert(k, canonicalize_json(val));
                }
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonicalize_json).collect()),
        _ => v.clone(),
    }
}

pub fn extract_hashtags(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut it = text.chars().peekable();
    while let Some(ch) = it.next() {
        if ch != '#' {
            continue;
        }
        let mut tag = String::new();
        while let Some(&c) = it.peek() {
            if c.is_alphanumeric() || c == '_' {
                tag.push(c);
                it.next();
            } else {
                break;
            }
        }
        let tag = normalize_tag(&tag);
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

// Outbound

/// `to`/`cc` for a locally authored status.
fn addressing(author: &Account, visibility: Visibility, mentions: &[String]) -> (Vec<String>, Vec<String>) {
    let followers = format!("{}/followers", author.uri);
    let mut mentions = mentions.to_vec();
    match visibility {
        Visibility::Public => {
            mentions.insert(0, followers);
            (vec![AS_PUBLIC.to_string()], mentions)
        }
        Visibility::Unlisted => {
            mentions.insert(0, AS_PUBLIC.to_string());
            (vec![followers], mentions)
        }
        Visibility::Private => (vec![followers], mentions),
        Visibility::Direct => (mentions, Vec::new()),
    }
}

pub fn note_object(db: &SocialDb, status: &Status) -> Result<Value> {
    let author = db
        .get_account(status.account_id)?
        .with_context(|| format!("author of status {} missing", status.id))?;
    let mut mention_uris = Vec::new();
    let mut tag = Vec::new();
    for m in db.mentions_of(status.id)? {
        if let Some(acct) = db.get_account(m.account_id)? {
            tag.push(json!({"type": "Mention", "href": acct.uri, "name": format!("@{}", acct.acct())}));
            mention_uris.push(acct.uri);
        }
    }
    for name in db.tags_of(status.id)? {
        tag.push(json!({"type": "Hashtag", "name": format!("#{name}")}));
    }
    for e in db.emojis_of(status.id)? {
        tag.push(json!({
            "type": "Emoji",
            "name": format!(":{}:", e.shortcode),
            "icon": {"type": "Image", "url": e.image_url},
        }));
    }
    let attachment: Vec<Value> = db
        .media_of(status.id)?
        .into_iter()
        .map(|m| {
            json!({
                "type": "Document",
                "url": m.remote_url,
                "mediaType": m.media_type,
                "name": m.description,
            })
        })
        .collect();
    let in_reply_to = match status.in_reply_to_id {
        Some(id) => db.get_status(id)?.map(|s| s.uri),
        None => None,
    };
    let (to, cc) = addressing(&author, status.visibility, &mention_uris);

    let mut obj = json!({
        "id": status.uri,
        "type": "Note",
        "attributedTo": author.uri,
        "url": status.url,
        "content": status.text,
        "summary": if status.spoiler_text.is_empty() { Value::Null } else { Value::String(status.spoiler_text.clone()) },
        "sensitive": status.sensitive,
        "published": ms_to_rfc3339(status.created_at_ms),
        "inReplyTo": in_reply_to,
        "to": to,
        "cc": cc,
        "tag": tag,
        "attachment": attachment,
    });
    if let Some(lang) = &status.language {
        let mut content_map = Map::new();
        content_map.insert(lang.clone(), Value::String(status.text.clone()));
        obj["contentMap"] = Value::Object(content_map);
    }
    if let Some(edited) = status.edited_at_ms {
        obj["updated"] = json!(ms_to_rfc3339(edited));
    }
    if let Some(poll_id) = status.poll_id {
        if let Some(poll) = db.get_poll(poll_id)? {
            obj["type"] = json!("Question");
            let choices: Vec<Value> = poll
                .options
                .iter()
                .map(|o| json!({"type": "Note", "name": o, "replies": {"type": "Collection", "totalItems": 0}}))
                .collect();
            obj[if poll.multiple { "anyOf" } else { "oneOf" }] = json!(choices);
            if let Some(end) = poll.expires_at_ms {
                obj["endTime"] = json!(ms_to_rfc3339(end));
            }
        }
    }
    Ok(obj)
}

fn wrap(kind: &str, id: String, actor: &str, object: Value, published_ms: i64) -> Value {
    let to = object.get("to").cloned().unwrap_or_else(|| json!([]));
    let cc = object.get("cc").cloned().unwrap_or_else(|| json!([]));
    json!({
        "@context": AS_CONTEXT,
        "id": id,
        "type": kind,
        "actor": actor,
        "published": ms_to_rfc3339(published_ms),
        "to": to,
        "cc": cc,
        "object": object,
    })
}

pub fn create_activity(db: &SocialDb, status: &Status, actor: &Account) -> Result<Value> {
    let note = note_object(db, status)?;
    Ok(wrap("Create", format!("{}/activity", status.uri), &actor.uri, note, status.created_at_ms))
}

pub fn update_activity(db: &SocialDb, status: &Status, actor: &Account) -> Result<Value> {
    let note = note_object(db, status)?;
    let at = status.edited_at_ms.unwrap_or(status.updated_at_ms);
    Ok(wrap("Update", format!("{}#updates/{at}", status.uri), &actor.uri, note, at))
}

pub fn announce_activity(status: &Status, original: &Status, actor: &Account) -> Value {
    let followers = format!("{}/followers", actor.uri);
    let (to, cc) = match status.visibility {
        Visibility::Public => (vec![AS_PUBLIC.to_string()], vec![followers]),
        Visibility::Unlisted => (vec![followers], vec![AS_PUBLIC.to_string()]),
        _ => (vec![followers], Vec::new()),
    };
    json!({
        "@context": AS_CONTEXT,
        "id": format!("{}/activity", status.uri),
        "type": "Announce",
        "actor": actor.uri,
        "published": ms_to_rfc3339(status.created_at_ms),
        "to": to,
        "cc": cc,
        "object": original.uri,
    })
}

pub fn delete_activity(status: &Status, actor: &Account) -> Value {
    json!({
        "@context": AS_CONTEXT,
        "id": format!("{}#delete", status.uri),
        "type": "Delete",
        "actor": actor.uri,
        "to": [AS_PUBLIC],
        "object": {"id": status.uri, "type": "Tombstone"},
    })
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_string)
}

fn as_list(v: Option<&Value>) -> Vec<&Value> {
    match v {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => vec![other],
    }
}

fn addresses(v: Option<&Value>) -> Vec<String> {
    as_list(v)
        .into_iter()
        .filter_map(|a| match a {
            Value::String(s) => Some(s.clone()),
            other => str_field(other, "id"),
        })
        .collect()
}

/// A string, an object's `id`, or the first such entry of an array.
fn first_id(v: Option<&Value>) -> Option<String> {
    as_list(v).into_iter().find_map(|item| match item {
        Value::String(s) => Some(s.clone()),
        other => str_field(other, "id"),
    })
}

fn first_href(v: &Value) -> Option<String> {
    as_list(Some(v)).into_iter().find_map(|item| match item {
        Value::String(s) => Some(s.clone()),
        other => str_field(other, "href"),
    })
}

fn host_of(uri: &str) -> Option<String> {
    reqwest::Url::parse(uri).ok()?.host_str().map(str::to_ascii_lowercase)
}
