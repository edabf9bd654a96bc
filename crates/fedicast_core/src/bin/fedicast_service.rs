/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use fedicast_core::config::{resolve_config_path, FedicastConfig};
use fedicast_core::runtime;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

fn hash_text(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

fn load_config(text: &str) -> Result<FedicastConfig> {
    let mut cfg = FedicastConfig::from_json(text)?;
    cfg.apply_env();
    Ok(cfg)
}

/// Watches the config file and restarts the core whenever its content changes.
#[tokio::main]
async fn main() -> Result<()> {
    let cfg_path = resolve_config_path(std::env::args().skip(1))?;
    info!("fedicast service starting");
    info!("config: {}", cfg_path.display());

    let mut handle: Option<u64> = None;
    let mut last_hash: Option<u64> = None;
    let mut last_failed_hash: Option<u64> = None;
    let mut missing_logged = false;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("shutdown requested");
                break;
            }
            _ = sleep(Duration::from_secs(2)) => {}
        }

        let text = match std::fs::read_to_string(&cfg_path) {
            Ok(t) => t,
            Err(e) => {
                if !missing_logged {
                    warn!("config missing: {} ({e})", cfg_path.display());
                    missing_logged = true;
                }
                continue;
            }
        };
        missing_logged = false;

        let hash = hash_text(&text);
        if last_hash == Some(hash) || last_failed_hash == Some(hash) {
            continue;
        }

        match load_config(&text) {
            Ok(cfg) => {
                if let Some(h) = handle.take() {
                    if let Err(e) = runtime::stop(h) {
                        warn!("failed to stop previous core: {e:#}");
                    }
                }
                match runtime::start(cfg) {
                    Ok(h) => {
                        handle = Some(h);
                        last_hash = Some(hash);
                        last_failed_hash = None;
                        info!("core started (handle={h})");
                    }
                    Err(e) => {
                        error!("failed to start core: {e:#}");
                        last_failed_hash = Some(hash);
                    }
                }
            }
            Err(e) => {
                warn!("invalid config: {e:#}");
                last_failed_hash = Some(hash);
            }
        }
    }

    if let Some(h) = handle.take() {
        if let Err(e) = runtime::stop(h) {
            warn!("failed to stop core: {e:#}");
        }
    }
    Ok(())
}
