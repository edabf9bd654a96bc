/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Per-domain delivery health with calendar-day granularity.

use crate::social_db::open_conn;
use anyhow::{Context, Result};
use fedicast_protocol::InstanceHealth;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use time::{Date, OffsetDateTime};

#[derive(Clone)]
pub struct DeliveryFailureTracker {
    db_path: PathBuf,
    threshold_days: u32,
}

impl DeliveryFailureTracker {
    pub fn open(db_path: impl AsRef<Path>, threshold_days: u32) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        init_db(&db_path)?;
        Ok(Self {
            db_path,
            threshold_days: threshold_days.max(1),
        })
    }

    pub fn threshold_days(&self) -> u32 {
        self.threshold_days
    }

    /// Records that today had a failure. Repeated failures on one day count once.
    pub fn track_failure(&self, domain: &str) -> Result<()> {
        self.track_failure_on(domain, today())
    }

    pub fn track_failure_on(&self, domain: &str, day: Date) -> Result<()> {
        let domain = normalize_domain(domain);
        if domain.is_empty() {
            return Ok(());
        }
        let conn = open_conn(&self.db_path)?;
        conn.execute(
            "INSERT OR IGNORE INTO delivery_failures(domain, day) VALUES (?1, ?2)",
            params![domain, day.to_julian_day()],
        )?;
        if consecutive_days(&conn, &domain)? >= self.threshold_days {
            conn.execute(
                "INSERT OR IGNORE INTO unavailable_domains(domain, stopped, created_at_ms) VALUES (?1, 0, ?2)",
                params![domain, now_ms()],
            )?;
        }
        Ok(())
    }

    /// Full reset: day records and any unavailable marker are removed.
    pub fn track_success(&self, domain: &str) -> Result<()> {
        let domain = normalize_domain(domain);
        let mut conn = open_conn(&self.db_path)?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM delivery_failures WHERE domain = ?1", params![domain])?;
        tx.execute("DELETE FROM unavailable_domains WHERE domain = ?1", params![domain])?;
        tx.commit()?;
        Ok(())
    }

    /// Clears failure days only; an explicit stop stays in place.
    pub fn clear_failures(&self, domain: &str) -> Result<()> {
        let domain = normalize_domain(domain);
        let conn = open_conn(&self.db_path)?;
        conn.execute("DELETE FROM delivery_failures WHERE domain = ?1", params![domain])?;
        conn.execute(
            "DELETE FROM unavailable_domains WHERE domain = ?1 AND stopped = 0",
            params![domain],
        )?;
        Ok(())
    }

    /// Forces the domain unavailable regardless of the day count.
    pub fn stop_delivery(&self, domain: &str) -> Result<()> {
        let domain = normalize_domain(domain);
        let conn = open_conn(&self.db_path)?;
        conn.execute(
            r#"
            INSERT INTO unavailable_domains(domain, stopped, created_at_ms) VALUES (?1, 1, ?2)
            ON CONFLICT(domain) DO UPDATE SET stopped = 1
            "#,
            params![domain, now_ms()],
        )?;
        Ok(())
    }

    pub fn exhausted_deliveries_days(&self, domain: &str) -> Result<u32> {
        let conn = open_conn(&self.db_path)?;
        consecutive_days(&conn, &normalize_domain(domain))
    }

    pub fn is_unavailable(&self, domain: &str) -> Result<bool> {
        let domain = normalize_domain(domain);
        let conn = open_conn(&self.db_path)?;
        if unavailable_marker(&conn, &domain)?.is_some() {
            return Ok(true);
        }
        Ok(consecutive_days(&conn, &domain)? >= self.threshold_days)
    }

    /// Consecutive failing days for each of `domains` that has any.
    pub fn warning_domains_map(&self, domains: &[String]) -> Result<HashMap<String, u32>> {
        let conn = open_conn(&self.db_path)?;
        let mut out = HashMap::new();
        for d in domains {
            let d = normalize_domain(d);
            let days = consecutive_days(&conn, &d)?;
            if days > 0 {
                out.insert(d, days);
            }
        }
        Ok(out)
    }

    /// Every domain with a failure record or an unavailable marker.
    pub fn known_domains(&self) -> Result<Vec<String>> {
        let conn = open_conn(&self.db_path)?;
        let mut stmt = conn.prepare(
            "SELECT domain FROM delivery_failures UNION SELECT domain FROM unavailable_domains ORDER BY 1",
        )?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        rows.collect::<rusqlite::Result<Vec<String>>>().map_err(Into::into)
    }

    pub fn health(&self, domain: &str) -> Result<InstanceHealth> {
        let domain = normalize_domain(domain);
        let conn = open_conn(&self.db_path)?;
        let days = consecutive_days(&conn, &domain)?;
        let marker = unavailable_marker(&conn, &domain)?;
        Ok(InstanceHealth {
            exhausted_deliveries_days: days,
            unavailable: marker.is_some() || days >= self.threshold_days,
            stopped: marker.unwrap_or(false),
            domain,
        })
    }
}

/// Lowercased host of a URL, or the input itself when it is already a bare domain.
pub fn domain_of(url_or_domain: &str) -> String {
    match reqwest::Url::parse(url_or_domain) {
        Ok(u) => u.host_str().map(normalize_domain).unwrap_or_default(),
        Err(_) => normalize_domain(url_or_domain),
    }
}

fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn today() -> Date {
    OffsetDateTime::now_utc().date()
}

fn unavailable_marker(conn: &Connection, domain: &str) -> Result<Option<bool>> {
    conn.query_row(
        "SELECT stopped FROM unavailable_domains WHERE domain = ?1",
        params![domain],
        |r| r.get::<_, bool>(0),
    )
    .optional()
    .map_err(Into::into)
}

/// Counts back from the most recent failing day until the first gap.
fn consecutive_days(conn: &Connection, domain: &str) -> Result<u32> {
    let mut stmt = conn.prepare("SELECT day FROM delivery_failures WHERE domain = ?1 ORDER BY day DESC")?;
    let days = stmt
        .query_map(params![domain], |r| r.get::<_, i32>(0))?
        .collect::<rusqlite::Result<Vec<i32>>>()?;
    let mut count = 0u32;
    let mut expected: Option<i32> = None;
    for day in days {
        match expected {
            Some(e) if e != day => break,
            _ => {}
        }
        count += 1;
        expected = Some(day - 1);
    }
    Ok(count)
}

fn init_db(path: &Path) -> Result<()> {
    let conn = Connection::open(path).with_context(|| format!("open db: {}", path.display()))?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS delivery_failures (
          domain TEXT NOT NULL,
          day INTEGER NOT NULL,
          PRIMARY KEY(domain, day)
        );
        CREATE TABLE IF NOT EXISTS unavailable_domains (
          domain TEXT PRIMARY KEY,
          stopped INTEGER NOT NULL DEFAULT 0,
          created_at_ms INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration as TimeDuration;

    fn tracker() -> (tempfile::TempDir, DeliveryFailureTracker) {
        let dir = tempfile::tempdir().unwrap();
        let t = DeliveryFailureTracker::open(dir.path().join("fedicast.db"), 7).unwrap();
        (dir, t)
    }

    #[test]
    fn seven_consecutive_days_open_the_circuit_and_success_closes_it() {
        let (_dir, t) = tracker();
        let start = today() - TimeDuration::days(6);
        for i in 0..7 {
            t.track_failure_on("Example.com", start + TimeDuration::days(i)).unwrap();
            // Bursts inside one day count once.
            t.track_failure_on("example.com", start + TimeDuration::days(i)).unwrap();
        }
        assert_eq!(t.exhausted_deliveries_days("example.com").unwrap(), 7);
        assert!(t.is_unavailable("example.com").unwrap());

        t.track_success("example.com").unwrap();
        assert!(!t.is_unavailable("example.com").unwrap());
        assert_eq!(t.exhausted_deliveries_days("example.com").unwrap(), 0);
    }

    #[test]
    fn a_gap_resets_the_streak() {
        let (_dir, t) = tracker();
        let d = today();
        for back in [0, 1, 2, 4, 5, 6, 7, 8] {
            t.track_failure_on("gappy.example", d - TimeDuration::days(back)).unwrap();
        }
        assert_eq!(t.exhausted_deliveries_days("gappy.example").unwrap(), 3);
        assert!(!t.is_unavailable("gappy.example").unwrap());
    }

    #[test]
    fn six_days_is_still_available() {
        let (_dir, t) = tracker();
        for back in 0..6 {
            t.track_failure_on("six.example", today() - TimeDuration::days(back)).unwrap();
        }
        assert!(!t.is_unavailable("six.example").unwrap());
    }

    #[test]
    fn stop_and_restart_controls() {
        let (_dir, t) = tracker();
        t.stop_delivery("stopped.example").unwrap();
        assert!(t.is_unavailable("stopped.example").unwrap());
        assert!(t.health("stopped.example").unwrap().stopped);

        // Clearing errors keeps an explicit stop.
        t.clear_failures("stopped.example").unwrap();
        assert!(t.is_unavailable("stopped.example").unwrap());

        t.track_success("stopped.example").unwrap();
        assert!(!t.is_unavailable("stopped.example").unwrap());
    }

    #[test]
    fn warning_map_only_lists_failing_domains() {
        let (_dir, t) = tracker();
        t.track_failure("a.example").unwrap();
        t.track_failure("b.example").unwrap();
        t.track_failure_on("b.example", today() - TimeDuration::days(1)).unwrap();
        let map = t
            .warning_domains_map(&["a.example".to_string(), "b.example".to_string(), "c.example".to_string()])
            .unwrap();
        assert_eq!(map.get("a.example"), Some(&1));
        assert_eq!(map.get("b.example"), Some(&2));
        assert!(!map.contains_key("c.example"));
        assert_eq!(t.known_domains().unwrap(), vec!["a.example", "b.example"]);
    }

    #[test]
    fn domain_of_urls() {
        assert_eq!(domain_of("https://Remote.Example/users/x/inbox"), "remote.example");
        assert_eq!(domain_of("remote.example"), "remote.example");
    }
}
