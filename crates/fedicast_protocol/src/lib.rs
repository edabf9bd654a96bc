/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};

/// One message published on a streaming channel (`timeline:public`, `timeline:<id>`, ...).
///
/// `payload` is already-serialized JSON so listeners can forward it verbatim.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub event: String,
    pub payload: String,
}

impl StreamMessage {
    pub const UPDATE: &'static str = "update";
    pub const STATUS_UPDATE: &'static str = "status.update";
    pub const DELETE: &'static str = "delete";
    pub const NOTIFICATION: &'static str = "notification";

    pub fn new(event: &str, payload: String) -> Self {
        Self {
            event: event.to_string(),
            payload,
        }
    }
}

/// Delivery health of one remote domain, as shown on the admin surface.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct InstanceHealth {
    pub domain: String,
    pub exhausted_deliveries_days: u32,
    pub unavailable: bool,
    pub stopped: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub in_flight: u64,
    pub delivered: u64,
    pub dead: u64,
    pub dropped: u64,
    /// Age in milliseconds of the oldest job that is due and not yet picked up.
    pub oldest_due_ms: u64,
}

/// Process-lifetime delivery counters.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct DeliveryCounters {
    pub delivered: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub skipped_unavailable: u64,
    pub dead: u64,
}

/// Body of the admin delivery stats endpoint.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub queue: QueueStats,
    pub counters: DeliveryCounters,
}
