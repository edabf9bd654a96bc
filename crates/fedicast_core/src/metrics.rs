/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use fedicast_protocol::DeliveryCounters;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Default)]
pub struct DeliveryMetrics {
    pub delivered: AtomicU64,
    pub failed: AtomicU64,
    pub timeouts: AtomicU64,
    pub skipped_unavailable: AtomicU64,
    pub dead: AtomicU64,
    pub delivery_rtt_ema_ms: AtomicU64,

    pub inbox_accepted: AtomicU64,
    pub inbox_auth_failures: AtomicU64,

    last_error: Mutex<Option<(u64, String)>>,
}

impl DeliveryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self, rtt_ms: u64) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        if rtt_ms == 0 {
            return;
        }
        let prev = self.delivery_rtt_ema_ms.load(Ordering::Relaxed);
        let next = if prev == 0 {
            rtt_ms
        } else {
            (prev.saturating_mul(7).saturating_add(rtt_ms)) / 8
        };
        self.delivery_rtt_ema_ms.store(next, Ordering::Relaxed);
    }

    pub fn failed(&self, err: &str, timeout: bool) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut g) = self.last_error.lock() {
            *g = Some((now_ms(), err.to_string()));
        }
    }

    pub fn skipped_unavailable(&self) {
        self.skipped_unavailable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dead(&self) {
        self.dead.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inbox_accepted(&self) {
        self.inbox_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inbox_auth_failure(&self) {
        self.inbox_auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> DeliveryCounters {
        DeliveryCounters {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            skipped_unavailable: self.skipped_unavailable.load(Ordering::Relaxed),
            dead: self.dead.load(Ordering::Relaxed),
        }
    }

    pub fn snapshot_json(&self) -> serde_json::Value {
        let last_error = self.last_error.lock().ok().and_then(|g| g.clone());
        serde_json::json!({
            "ts_ms": now_ms(),
            "delivery": self.counters(),
            "delivery_rtt_ms": self.delivery_rtt_ema_ms.load(Ordering::Relaxed),
            "last_error": last_error.map(|(ts, msg)| serde_json::json!({ "ts_ms": ts, "error": msg })),
            "inbox": {
                "accepted": self.inbox_accepted.load(Ordering::Relaxed),
                "auth_failures": self.inbox_auth_failures.load(Ordering::Relaxed),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = DeliveryMetrics::new();
        m.delivered(100);
        m.delivered(200);
        m.failed("timed out", true);
        m.failed("status 500", false);
        m.skipped_unavailable();
        let c = m.counters();
        assert_eq!(c.delivered, 2);
        assert_eq!(c.failed, 2);
        assert_eq!(c.timeouts, 1);
        assert_eq!(c.skipped_unavailable, 1);
        assert_eq!(m.delivery_rtt_ema_ms.load(Ordering::Relaxed), 112);
        assert_eq!(m.snapshot_json()["last_error"]["error"], "status 500");
    }
}
