/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! In-process publish side of the streaming channels.

use crate::model::AccountId;
use fedicast_protocol::StreamMessage;
use tokio::sync::broadcast;

pub const PUBLIC: &str = "timeline:public";
pub const PUBLIC_LOCAL: &str = "timeline:public:local";

pub fn hashtag(tag: &str) -> String {
    format!("timeline:hashtag:{tag}")
}

pub fn hashtag_local(tag: &str) -> String {
    format!("timeline:hashtag:{tag}:local")
}

pub fn home(account_id: AccountId) -> String {
    format!("timeline:{account_id}")
}

pub fn list(list_id: i64) -> String {
    format!("timeline:list:{list_id}")
}

pub fn notifications(account_id: AccountId) -> String {
    format!("timeline:{account_id}:notifications")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Published {
    pub channel: String,
    pub message: StreamMessage,
}

#[derive(Clone)]
pub struct Streaming {
    tx: broadcast::Sender<Published>,
}

impl Streaming {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.tx.subscribe()
    }

    /// Fire-and-forget; having no listeners is not an error.
    pub fn publish(&self, channel: &str, event: &str, payload: String) {
        let _ = self.tx.send(Published {
            channel: channel.to_string(),
            message: StreamMessage::new(event, payload),
        });
    }
}

impl Default for Streaming {
    fn default() -> Self {
        Self::new(1024)
    }
}
