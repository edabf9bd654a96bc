/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::delivery_queue::OutboundJob;
use crate::error::RequestError;
use crate::failure_tracker::DeliveryFailureTracker;
use crate::metrics::DeliveryMetrics;
use crate::request::{HttpResponse, RequestSender, Signer};
use crate::social_db::{blocking, SocialDb};
use async_trait::async_trait;
use http::StatusCode;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Sends one signed activity to one inbox.
#[async_trait]
pub trait InboxTransport: Send + Sync {
    async fn deliver(&self, inbox_url: &str, body: Vec<u8>, signer: &Signer) -> Result<HttpResponse, RequestError>;
}

#[async_trait]
impl InboxTransport for RequestSender {
    async fn deliver(&self, inbox_url: &str, body: Vec<u8>, signer: &Signer) -> Result<HttpResponse, RequestError> {
        self.post_activity(inbox_url, body, signer).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Domain circuit is open; no request was made and no failure recorded.
    SkippedUnavailable,
    Failed { error: String, retryable: bool },
}

/// Decides per job whether to attempt delivery, performs it, and feeds the
/// result back into the per-domain failure state.
pub struct Dispatcher {
    transport: Arc<dyn InboxTransport>,
    tracker: DeliveryFailureTracker,
    db: SocialDb,
    metrics: Arc<DeliveryMetrics>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn InboxTransport>, tracker: DeliveryFailureTracker, db: SocialDb, metrics: Arc<DeliveryMetrics>) -> Self {
        Self {
            transport,
            tracker,
            db,
            metrics,
        }
    }

    pub fn metrics(&self) -> &DeliveryMetrics {
        &self.metrics
    }

    pub async fn dispatch(&self, job: &OutboundJob) -> DeliveryOutcome {
        let unavailable = blocking({
            let tracker = self.tracker.clone();
            let domain = job.domain.clone();
            move || tracker.is_unavailable(&domain)
        })
        .await;
        match unavailable {
            Ok(true) => {
                debug!(domain = %job.domain, inbox = %job.inbox_url, "domain unavailable, skipping delivery");
                self.metrics.skipped_unavailable();
                return DeliveryOutcome::SkippedUnavailable;
            }
            Ok(false) => {}
            Err(e) => warn!(domain = %job.domain, "availability check failed: {e:#}"),
        }

        let signer = match self.signer_for(job).await {
            Some(s) => s,
            None => {
                return DeliveryOutcome::Failed {
                    error: format!("no signing key for account {}", job.account_id),
                    retryable: false,
                }
            }
        };

        let started = Instant::now();
        match self.transport.deliver(&job.inbox_url, job.payload.clone(), &signer).await {
            Ok(resp) if resp.is_success() => {
                self.record(&job.domain, true).await;
                self.metrics.delivered(started.elapsed().as_millis() as u64);
                debug!(domain = %job.domain, inbox = %job.inbox_url, status = resp.status.as_u16(), "delivered");
                DeliveryOutcome::Delivered
            }
            Ok(resp) => {
                self.record(&job.domain, false).await;
                let error = format!("status {}", resp.status.as_u16());
                self.metrics.failed(&error, false);
                warn!(domain = %job.domain, inbox = %job.inbox_url, attempt = job.attempt + 1, "delivery rejected: {error}");
                DeliveryOutcome::Failed {
                    error,
                    retryable: !is_unsalvageable(resp.status),
                }
            }
            Err(e) if e.is_validation() => {
                self.metrics.failed(&e.to_string(), false);
                warn!(domain = %job.domain, inbox = %job.inbox_url, "delivery refused: {e}");
                DeliveryOutcome::Failed {
                    error: e.to_string(),
                    retryable: false,
                }
            }
            Err(e) => {
                self.record(&job.domain, false).await;
                self.metrics.failed(&e.to_string(), e.is_timeout());
                warn!(domain = %job.domain, inbox = %job.inbox_url, attempt = job.attempt + 1, "delivery failed: {e}");
                DeliveryOutcome::Failed {
                    error: e.to_string(),
                    retryable: true,
                }
            }
        }
    }

    async fn signer_for(&self, job: &OutboundJob) -> Option<Signer> {
        let db = self.db.clone();
        let account_id = job.account_id;
        match blocking(move || db.get_account(account_id)).await {
            Ok(Some(account)) => Signer::for_account(&account),
            Ok(None) => None,
            Err(e) => {
                warn!(account_id, "load signing account: {e:#}");
                None
            }
        }
    }

    async fn record(&self, domain: &str, success: bool) {
        let tracker = self.tracker.clone();
        let d = domain.to_string();
        let res = blocking(move || {
            if success {
                tracker.track_success(&d)
            } else {
                tracker.track_failure(&d)
            }
        })
        .await;
        if let Err(e) = res {
            warn!(domain, "update delivery failure state: {e:#}");
        }
    }
}

/// Client errors that retrying cannot fix. 401, 408 and 429 may succeed later.
fn is_unsalvageable(status: StatusCode) -> bool {
    status.is_client_error() && !matches!(status.as_u16(), 401 | 408 | 429)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;
    use crate::delivery_queue::{DeliveryQueue, JobState};
    use crate::keys::test_keys;
    use crate::model::{Account, NewAccount};
    use crate::request::test_support::{loopback_sender, spawn_server};
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::post;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: SocialDb,
        tracker: DeliveryFailureTracker,
        queue: DeliveryQueue,
        author: Account,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fedicast.db");
        let db = SocialDb::open(&path).unwrap();
        let tracker = DeliveryFailureTracker::open(&path, 7).unwrap();
        let queue = DeliveryQueue::open(&path).unwrap();
        let keys = test_keys::shared();
        let author = db
            .insert_account(&NewAccount {
                username: "alice".into(),
                uri: "https://local.test/users/alice".into(),
                public_key_pem: Some(keys.public_key_pem.clone()),
                private_key_pem: Some(keys.private_key_pem.clone()),
                ..Default::default()
            })
            .unwrap();
        Fixture {
            _dir: dir,
            db,
            tracker,
            queue,
            author,
        }
    }

    fn dispatcher(f: &Fixture) -> Dispatcher {
        Dispatcher::new(
            Arc::new(loopback_sender()),
            f.tracker.clone(),
            f.db.clone(),
            Arc::new(DeliveryMetrics::new()),
        )
    }

    async fn inbox_returning(status: AxumStatus, hits: Arc<AtomicUsize>) -> String {
        let router = Router::new().route(
            "/inbox",
            post(move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    status
                }
            }),
        );
        let addr = spawn_server(router).await;
        format!("http://{addr}/inbox")
    }

    async fn one_job(f: &Fixture, inbox: &str) -> OutboundJob {
        f.queue.enqueue(b"{\"type\":\"Create\"}".to_vec(), f.author.id, vec![inbox.to_string()]).await.unwrap();
        f.queue.claim_due(1, Duration::from_secs(60)).await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn success_resets_failure_state() {
        let f = fixture();
        let hits = Arc::new(AtomicUsize::new(0));
        let inbox = inbox_returning(AxumStatus::OK, hits.clone()).await;
        let job = one_job(&f, &inbox).await;
        f.tracker.track_failure(&job.domain).unwrap();

        let d = dispatcher(&f);
        assert_eq!(d.dispatch(&job).await, DeliveryOutcome::Delivered);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(f.tracker.exhausted_deliveries_days(&job.domain).unwrap(), 0);
        assert_eq!(d.metrics().counters().delivered, 1);
    }

    #[tokio::test]
    async fn server_error_is_tracked_and_retryable() {
        let f = fixture();
        let hits = Arc::new(AtomicUsize::new(0));
        let inbox = inbox_returning(AxumStatus::SERVICE_UNAVAILABLE, hits).await;
        let job = one_job(&f, &inbox).await;

        let outcome = dispatcher(&f).dispatch(&job).await;
        assert_eq!(
            outcome,
            DeliveryOutcome::Failed {
                error: "status 503".into(),
                retryable: true
            }
        );
        assert_eq!(f.tracker.exhausted_deliveries_days(&job.domain).unwrap(), 1);
        let state = f.queue.settle(&job, &outcome, &QueueSettings::default()).await.unwrap();
        assert_eq!(state, JobState::Pending);
    }

    #[tokio::test]
    async fn gone_inbox_is_not_retried() {
        let f = fixture();
        let hits = Arc::new(AtomicUsize::new(0));
        let inbox = inbox_returning(AxumStatus::GONE, hits).await;
        let job = one_job(&f, &inbox).await;
        let outcome = dispatcher(&f).dispatch(&job).await;
        assert!(matches!(outcome, DeliveryOutcome::Failed { retryable: false, .. }));
        let state = f.queue.settle(&job, &outcome, &QueueSettings::default()).await.unwrap();
        assert_eq!(state, JobState::Dead);
    }

    #[tokio::test]
    async fn unavailable_domain_is_skipped_without_request_or_new_failure() {
        let f = fixture();
        let hits = Arc::new(AtomicUsize::new(0));
        let inbox = inbox_returning(AxumStatus::OK, hits.clone()).await;
        let job = one_job(&f, &inbox).await;
        f.tracker.stop_delivery(&job.domain).unwrap();
        f.tracker.track_failure(&job.domain).unwrap();

        let d = dispatcher(&f);
        assert_eq!(d.dispatch(&job).await, DeliveryOutcome::SkippedUnavailable);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(f.tracker.exhausted_deliveries_days(&job.domain).unwrap(), 1);
        assert_eq!(d.metrics().counters().skipped_unavailable, 1);
    }

    #[tokio::test]
    async fn refused_connection_counts_as_failure() {
        let f = fixture();
        let dead = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let job = one_job(&f, &format!("http://{dead}/inbox")).await;
        let outcome = dispatcher(&f).dispatch(&job).await;
        assert!(matches!(outcome, DeliveryOutcome::Failed { retryable: true, .. }));
        assert_eq!(f.tracker.exhausted_deliveries_days("127.0.0.1").unwrap(), 1);
    }

    #[tokio::test]
    async fn private_target_is_dead_without_tracking() {
        let f = fixture();
        let d = Dispatcher::new(
            Arc::new(RequestSender::new(Default::default())),
            f.tracker.clone(),
            f.db.clone(),
            Arc::new(DeliveryMetrics::new()),
        );
        let job = one_job(&f, "http://127.0.0.1:9/inbox").await;
        let outcome = d.dispatch(&job).await;
        assert!(matches!(outcome, DeliveryOutcome::Failed { retryable: false, .. }));
        assert_eq!(f.tracker.exhausted_deliveries_days("127.0.0.1").unwrap(), 0);
    }

    #[test]
    fn unsalvageable_statuses() {
        assert!(is_unsalvageable(StatusCode::GONE));
        assert!(is_unsalvageable(StatusCode::BAD_REQUEST));
        assert!(!is_unsalvageable(StatusCode::UNAUTHORIZED));
        assert!(!is_unsalvageable(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_unsalvageable(StatusCode::INTERNAL_SERVER_ERROR));
    }
}
