/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Outbound HTTP policy handed to [`crate::request::RequestSender`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    /// Hard ceiling on response bodies.
    pub max_body_bytes: usize,
    pub max_redirects: usize,
    /// Operator proxy for all outbound traffic. When set, addresses are not
    /// checked against the private-address policy.
    pub proxy: Option<String>,
    /// Proxy used for `.onion` / `.i2p` hosts.
    pub hidden_service_proxy: Option<String>,
    pub allow_hidden_services: bool,
    pub allow_private_addresses: bool,
    pub user_agent: String,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            read_timeout_secs: 10,
            write_timeout_secs: 10,
            max_body_bytes: 1024 * 1024,
            max_redirects: 2,
            proxy: None,
            hidden_service_proxy: None,
            allow_hidden_services: false,
            allow_private_addresses: false,
            user_agent: format!("fedicast/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl SenderConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs.max(1))
    }

    /// Bound on sending a request: connect, body upload and the response head.
    pub fn send_timeout(&self) -> Duration {
        self.connect_timeout() + self.write_timeout()
    }

    /// Upper bound for one attempt, DNS included: connect plus the slower of read and write.
    pub fn attempt_timeout(&self) -> Duration {
        self.connect_timeout() + self.read_timeout().max(self.write_timeout())
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub max_attempts: u32,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub workers: usize,
    /// In-flight lease; a job claimed by a crashed worker becomes due again after it.
    pub lease_secs: u64,
    /// Consecutive failing days after which a domain is unavailable.
    pub failure_threshold_days: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_backoff_secs: 30,
            max_backoff_secs: 3600,
            workers: 4,
            lease_secs: 60,
            failure_threshold_days: 7,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    /// Trim is triggered once an at-top feed holds more than this many entries.
    pub max_items: u32,
    /// Length a feed is trimmed down to.
    pub trim_to: u32,
    pub active_within_days: u32,
    pub realtime_window_secs: u64,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            max_items: 40,
            trim_to: 20,
            active_within_days: 14,
            realtime_window_secs: 6 * 3600,
        }
    }
}

impl FeedSettings {
    pub fn active_window_ms(&self) -> i64 {
        self.active_within_days as i64 * 24 * 3600 * 1000
    }

    pub fn realtime_window_ms(&self) -> i64 {
        self.realtime_window_secs as i64 * 1000
    }
}

/// Load limits for one queue class; exceeding either skips background work.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct QueueThreshold {
    pub max_size: u64,
    pub max_latency_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub delivery_threshold: QueueThreshold,
    pub follow_up_threshold: QueueThreshold,
    pub max_budget: u32,
    pub per_account_budget: u32,
    pub per_thread_budget: u32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            delivery_threshold: QueueThreshold {
                max_size: 500,
                max_latency_secs: 10,
            },
            follow_up_threshold: QueueThreshold {
                max_size: 200,
                max_latency_secs: 5,
            },
            max_budget: 150,
            per_account_budget: 5,
            per_thread_budget: 6,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FedicastConfig {
    /// Local domain, e.g. `social.example`.
    pub domain: String,
    /// Base for actor and status URIs; defaults to `https://<domain>`.
    pub public_base_url: String,
    pub bind: String,
    pub data_dir: Option<String>,
    pub http: SenderConfig,
    pub delivery: QueueSettings,
    pub feeds: FeedSettings,
    pub maintenance: MaintenanceConfig,
    pub internal_token: Option<String>,
    /// Carried through for the operator's blocklist tooling; not interpreted here.
    pub ip_blocklist_urls: Vec<String>,
    pub max_date_skew_secs: u64,
    pub max_inbox_body_bytes: usize,
}

impl Default for FedicastConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            public_base_url: String::new(),
            bind: "127.0.0.1:8787".to_string(),
            data_dir: None,
            http: SenderConfig::default(),
            delivery: QueueSettings::default(),
            feeds: FeedSettings::default(),
            maintenance: MaintenanceConfig::default(),
            internal_token: None,
            ip_blocklist_urls: Vec::new(),
            max_date_skew_secs: 3600,
            max_inbox_body_bytes: 1024 * 1024,
        }
    }
}

impl FedicastConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let mut cfg: FedicastConfig = serde_json::from_str(text).context("decode FedicastConfig")?;
        cfg.normalize();
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        let mut cfg = Self::from_json(&text)?;
        cfg.apply_env();
        Ok(cfg)
    }

    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("FEDICAST_DATA_DIR") {
            if !v.trim().is_empty() {
                self.data_dir = Some(v.trim().to_string());
            }
        }
        if let Ok(v) = std::env::var("FEDICAST_BIND") {
            if !v.trim().is_empty() {
                self.bind = v.trim().to_string();
            }
        }
    }

    fn normalize(&mut self) {
        self.domain = self.domain.trim().to_ascii_lowercase();
        if self.public_base_url.trim().is_empty() {
            self.public_base_url = format!("https://{}", self.domain);
        }
        self.public_base_url = self.public_base_url.trim_end_matches('/').to_string();
        self.feeds.trim_to = self.feeds.trim_to.min(self.feeds.max_items);
        self.delivery.workers = self.delivery.workers.clamp(1, 64);
        self.delivery.max_attempts = self.delivery.max_attempts.max(1);
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match self.data_dir.as_deref() {
            Some(dir) => Ok(PathBuf::from(dir)),
            None => crate::keys::default_data_dir(),
        }
    }

    pub fn internal_token(&self) -> &str {
        self.internal_token.as_deref().map(str::trim).unwrap_or("")
    }
}

/// `--config <path>`, then `FEDICAST_CONFIG`, then the platform config dir.
pub fn resolve_config_path(args: impl IntoIterator<Item = String>) -> Result<PathBuf> {
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--config" {
            let path = args.next().context("--config requires a path")?;
            return Ok(PathBuf::from(path));
        }
    }
    if let Ok(path) = std::env::var("FEDICAST_CONFIG") {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let proj = directories::ProjectDirs::from("net", "fedicast", "Fedicast")
        .context("unable to determine platform config dir")?;
    Ok(proj.config_dir().join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let cfg = FedicastConfig::from_json(r#"{"domain":"Social.Example"}"#).unwrap();
        assert_eq!(cfg.domain, "social.example");
        assert_eq!(cfg.public_base_url, "https://social.example");
        assert_eq!(cfg.http.connect_timeout_secs, 5);
        assert_eq!(cfg.http.read_timeout_secs, 10);
        assert_eq!(cfg.http.write_timeout_secs, 10);
        assert_eq!(cfg.http.attempt_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.http.send_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.http.max_redirects, 2);
        assert_eq!(cfg.delivery.failure_threshold_days, 7);
        assert_eq!(cfg.feeds.max_items, 40);
        assert_eq!(cfg.feeds.trim_to, 20);
        assert_eq!(cfg.feeds.active_within_days, 14);
    }

    #[test]
    fn nested_sections_override_partially() {
        let cfg = FedicastConfig::from_json(
            r#"{"domain":"a.example","http":{"allow_hidden_services":true},"feeds":{"max_items":10,"trim_to":50}}"#,
        )
        .unwrap();
        assert!(cfg.http.allow_hidden_services);
        assert_eq!(cfg.http.read_timeout_secs, 10);
        assert_eq!(cfg.feeds.max_items, 10);
        assert_eq!(cfg.feeds.trim_to, 10);
    }

    #[test]
    fn config_flag_wins() {
        let path = resolve_config_path(vec!["--config".to_string(), "/tmp/x.json".to_string()]).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/x.json"));
        assert!(resolve_config_path(vec!["--config".to_string()]).is_err());
    }
}
