/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::api::{self, ApiState};
use crate::config::FedicastConfig;
use crate::delivery::Dispatcher;
use crate::delivery_queue::DeliveryQueue;
use crate::distribution::Distributor;
use crate::failure_tracker::DeliveryFailureTracker;
use crate::feed_store::FeedStore;
use crate::http_sig::KeyResolver;
use crate::inbox::InboxProcessor;
use crate::keys::{load_or_generate_instance_key, KeyPair};
use crate::lease_lock::{LeaseLock, DEFAULT_LEASE};
use crate::maintenance::StatusesCleanupScheduler;
use crate::metrics::DeliveryMetrics;
use crate::request::{RequestSender, Signer};
use crate::social_db::SocialDb;
use crate::status_update::StatusUpdater;
use crate::streaming::Streaming;
use anyhow::{anyhow, Context, Result};
use std::{
    net::SocketAddr,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};
use tokio::sync::watch;
use tracing::{error, info};

static HANDLE_SEQ: AtomicU64 = AtomicU64::new(1);
static REGISTRY: Mutex<Vec<(u64, RunningCore)>> = Mutex::new(Vec::new());

const DB_FILE: &str = "fedicast.db";

struct RunningCore {
    shutdown_tx: watch::Sender<bool>,
    join: Option<thread::JoinHandle<()>>,
}

/// Every long-lived component, wired against one data directory.
#[derive(Clone)]
pub struct Core {
    pub db: SocialDb,
    pub streaming: Streaming,
    pub queue: DeliveryQueue,
    pub tracker: DeliveryFailureTracker,
    pub metrics: Arc<DeliveryMetrics>,
    pub sender: RequestSender,
    pub distributor: Distributor,
    pub updater: StatusUpdater,
    pub inbox: Arc<InboxProcessor>,
    pub instance_key: Arc<KeyPair>,
}

impl Core {
    pub fn open(cfg: &FedicastConfig, data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("create data dir: {}", data_dir.display()))?;
        let instance_key = load_or_generate_instance_key(data_dir)?;
        let db_path = data_dir.join(DB_FILE);
        let db = SocialDb::open(&db_path)?;
        let streaming = Streaming::default();
        let queue = DeliveryQueue::open(&db_path)?;
        let tracker = DeliveryFailureTracker::open(&db_path, cfg.delivery.failure_threshold_days)?;
        let metrics = Arc::new(DeliveryMetrics::new());
        let sender = RequestSender::new(cfg.http.clone());

        let feeds = FeedStore::open(db.clone(), streaming.clone(), cfg.feeds)?;
        let distributor = Distributor::new(
            feeds,
            streaming.clone(),
            queue.clone(),
            cfg.feeds,
            cfg.public_base_url.clone(),
        );
        let locks = LeaseLock::open(&db_path, DEFAULT_LEASE)?;
        let updater = StatusUpdater::new(distributor.clone(), locks);
        let inbox = Arc::new(InboxProcessor::new(
            distributor.clone(),
            updater.clone(),
            Some(sender.clone()),
        ));

        Ok(Self {
            db,
            streaming,
            queue,
            tracker,
            metrics,
            sender,
            distributor,
            updater,
            inbox,
            instance_key: Arc::new(instance_key),
        })
    }

    /// Signs authorized fetches (actor lookups) as the instance actor.
    pub fn instance_signer(&self, cfg: &FedicastConfig) -> Signer {
        Signer {
            key_id: format!("{}/actor#main-key", cfg.public_base_url),
            private_key_pem: self.instance_key.private_key_pem.clone(),
        }
    }

    pub fn api_state(&self, cfg: &FedicastConfig) -> ApiState {
        ApiState {
            db: self.db.clone(),
            inbox: self.inbox.clone(),
            key_resolver: Arc::new(KeyResolver::new(self.sender.clone(), Some(self.instance_signer(cfg)))),
            tracker: self.tracker.clone(),
            queue: self.queue.clone(),
            metrics: self.metrics.clone(),
            max_date_skew: Duration::from_secs(cfg.max_date_skew_secs),
            max_body_bytes: cfg.max_inbox_body_bytes,
            internal_token: cfg.internal_token().to_string(),
        }
    }

    pub fn start_workers(&self, cfg: &FedicastConfig, shutdown: watch::Receiver<bool>) {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(self.sender.clone()),
            self.tracker.clone(),
            self.db.clone(),
            self.metrics.clone(),
        ));
        self.queue.start_workers(shutdown.clone(), dispatcher, cfg.delivery);
        StatusesCleanupScheduler::new(
            self.distributor.clone(),
            self.queue.clone(),
            cfg.maintenance.clone(),
            cfg.delivery.workers,
        )
        .start(shutdown);
    }
}

/// Runs the service on a dedicated thread with its own tokio runtime.
pub fn start(cfg: FedicastConfig) -> Result<u64> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .try_init()
        .ok();

    let handle = HANDLE_SEQ.fetch_add(1, Ordering::Relaxed);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let join = thread::spawn(move || {
        if let Err(e) = run_core(cfg, shutdown_rx) {
            error!("core runtime failed: {e:#}");
        }
    });

    let mut reg = REGISTRY.lock().map_err(|_| anyhow!("core registry poisoned"))?;
    reg.push((
        handle,
        RunningCore {
            shutdown_tx,
            join: Some(join),
        },
    ));

    Ok(handle)
}

pub fn stop(handle: u64) -> Result<()> {
    let running = {
        let mut reg = REGISTRY.lock().map_err(|_| anyhow!("core registry poisoned"))?;
        let idx = reg
            .iter()
            .position(|(h, _)| *h == handle)
            .context("invalid handle")?;
        let (_, mut running) = reg.swap_remove(idx);
        let _ = running.shutdown_tx.send(true);
        running.join.take()
    };

    if let Some(j) = running {
        thread::spawn(move || {
            let _ = j.join();
        });
    }
    Ok(())
}

fn run_core(cfg: FedicastConfig, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    rt.block_on(async move {
        let data_dir = cfg.data_dir()?;
        let core = Core::open(&cfg, &data_dir)?;
        info!(data_dir = %data_dir.display(), base_url = %cfg.public_base_url, "core opened");

        core.start_workers(&cfg, shutdown_rx.clone());

        let router = api::router(core.api_state(&cfg));
        let addr: SocketAddr = cfg.bind.parse().context("parse bind")?;
        let listener = tokio::net::TcpListener::bind(addr).await.context("bind")?;
        info!("core local server http://{addr}");

        let shutdown = async move {
            while !*shutdown_rx.borrow() {
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
        };
        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await
            .context("serve")?;
        info!("core stopped");
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::test_keys;
    use crate::model::{NewStatus, Visibility};
    use crate::social_db::test_support::local_account;
    use axum::body::Body;
    use http::{Request, StatusCode};
    use tower::ServiceExt;

    fn core() -> (tempfile::TempDir, FedicastConfig, Core) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("instance_private_key.pem"),
            &test_keys::shared().private_key_pem,
        )
        .unwrap();
        let cfg = FedicastConfig::from_json(r#"{"domain":"Local.Test","internal_token":"tok"}"#).unwrap();
        let core = Core::open(&cfg, dir.path()).unwrap();
        (dir, cfg, core)
    }

    #[tokio::test]
    async fn wired_core_serves_health_and_admin() {
        let (_dir, cfg, core) = core();
        assert_eq!(cfg.public_base_url, "https://local.test");
        assert_eq!(core.instance_signer(&cfg).key_id, "https://local.test/actor#main-key");

        let app = api::router(core.api_state(&cfg));
        let resp = app
            .clone()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = app
            .oneshot(Request::get("/_fedicast/admin/delivery/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn local_post_reaches_author_home_through_wired_core() {
        let (_dir, _cfg, core) = core();
        let alice = local_account(&core.db, "alice");
        let post = core
            .distributor
            .create_local_status(NewStatus::new(alice.id, "hello #Rust", Visibility::Public), Vec::new())
            .await
            .unwrap();
        let report = post.fan_out.unwrap();
        assert_eq!(report.delivered(), 1);
        assert_eq!(core.db.tags_of(post.status.id).unwrap(), vec!["rust".to_string()]);
    }
}
