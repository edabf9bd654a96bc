/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! HTTP surface: health probe, signed inbox and the internal admin endpoints.

use crate::activity::{activity_dedup_id, extract_actor};
use crate::delivery_queue::DeliveryQueue;
use crate::error::is_race_condition;
use crate::failure_tracker::{domain_of, DeliveryFailureTracker};
use crate::http_sig::{
    build_signing_string, parse_signature_header, verify_date, verify_digest_if_present,
    verify_signature_rsa_sha256, KeyResolver,
};
use crate::inbox::InboxProcessor;
use crate::metrics::DeliveryMetrics;
use crate::social_db::{blocking, SocialDb};
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    routing::any,
    Router,
};
use fedicast_protocol::{DeliveryStats, InstanceHealth};
use http::{HeaderMap, Request, Response, StatusCode};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub const INTERNAL_TOKEN_HEADER: &str = "X-Fedicast-Internal";
const ADMIN_PREFIX: &str = "/_fedicast/admin";

#[derive(Clone)]
pub struct ApiState {
    pub db: SocialDb,
    pub inbox: Arc<InboxProcessor>,
    pub key_resolver: Arc<KeyResolver>,
    pub tracker: DeliveryFailureTracker,
    pub queue: DeliveryQueue,
    pub metrics: Arc<DeliveryMetrics>,
    pub max_date_skew: Duration,
    pub max_body_bytes: usize,
    /// Empty disables the admin gate (loopback-only deployments).
    pub internal_token: String,
}

pub fn router(state: ApiState) -> Router {
    let max_body_bytes = state.max_body_bytes;
    Router::new()
        .fallback(any(move |req| {
            let st = state.clone();
            async move { handle_request(&st, req).await }
        }))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
}

pub async fn handle_request(state: &ApiState, req: Request<Body>) -> Response<Body> {
    let path = req.uri().path().to_string();
    match (req.method().as_str(), path.as_str()) {
        ("GET", "/healthz") => healthz(state),
        ("POST", "/inbox") => inbox_post(state, req, None).await,
        ("POST", p) if p.starts_with("/users/") && p.ends_with("/inbox") => {
            let name = p.trim_start_matches("/users/").trim_end_matches("/inbox").to_string();
            if name.is_empty() || name.contains('/') {
                return simple(StatusCode::NOT_FOUND, "not found");
            }
            inbox_post(state, req, Some(name)).await
        }
        (method, p) if p.starts_with(ADMIN_PREFIX) => {
            if let Err(resp) = require_internal(state, req.headers()) {
                return resp;
            }
            let rest = p[ADMIN_PREFIX.len()..].trim_matches('/').to_string();
            admin(state, method, &rest).await
        }
        _ => simple(StatusCode::NOT_FOUND, "not found"),
    }
}

fn healthz(state: &ApiState) -> Response<Body> {
    match state.db.health_check() {
        Ok(()) => simple(StatusCode::OK, "ok"),
        Err(e) => {
            warn!("health check failed: {e:#}");
            simple(StatusCode::SERVICE_UNAVAILABLE, "db unavailable")
        }
    }
}

async fn inbox_post(state: &ApiState, req: Request<Body>, username: Option<String>) -> Response<Body> {
    if let Some(name) = username {
        let db = state.db.clone();
        match blocking(move || db.find_local_account(&name)).await {
            Ok(Some(_)) => {}
            Ok(None) => return simple(StatusCode::NOT_FOUND, "unknown user"),
            Err(e) => return simple(StatusCode::BAD_GATEWAY, &format!("db error: {e}")),
        }
    }

    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(b) => b,
        Err(_) => return simple(StatusCode::BAD_REQUEST, "invalid body"),
    };

    if let Err(e) = verify_digest_if_present(&parts.headers, &body) {
        return auth_failure(state, &format!("digest: {e}"));
    }
    if let Err(e) = verify_date(&parts.headers, state.max_date_skew) {
        return auth_failure(state, &format!("date: {e}"));
    }
    let Some(sig_header) = parts
        .headers
        .get("Signature")
        .or_else(|| parts.headers.get("signature"))
        .and_then(|v| v.to_str().ok())
    else {
        return auth_failure(state, "missing signature");
    };
    let sig = match parse_signature_header(sig_header) {
        Ok(s) => s,
        Err(e) => return auth_failure(state, &format!("signature: {e}")),
    };
    let signing_string = match build_signing_string(&parts.method, &parts.uri, &parts.headers, &sig.headers) {
        Ok(s) => s,
        Err(e) => return auth_failure(state, &format!("signature: {e}")),
    };
    let actor = match state.key_resolver.resolve_actor_summary_for_key_id(&sig.key_id).await {
        Ok(a) => a,
        Err(e) => {
            debug!(key_id = %sig.key_id, "key resolve failed: {e:#}");
            return auth_failure(state, "key resolve failed");
        }
    };
    if let Err(e) = verify_signature_rsa_sha256(&actor.public_key_pem, &signing_string, &sig.signature) {
        return auth_failure(state, &format!("signature: {e}"));
    }

    let activity: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return simple(StatusCode::BAD_REQUEST, "invalid activity json"),
    };
    if extract_actor(&activity).as_deref() != Some(actor.actor_url.as_str()) {
        return auth_failure(state, "actor does not match key");
    }

    let new_account = match actor.to_new_account() {
        Ok(a) => a,
        Err(e) => return simple(StatusCode::BAD_REQUEST, &format!("actor: {e}")),
    };
    let db = state.db.clone();
    let account = match blocking(move || db.upsert_remote_account(&new_account)).await {
        Ok(a) => a,
        Err(e) => return simple(StatusCode::BAD_GATEWAY, &format!("db error: {e}")),
    };

    let dedup_id = activity_dedup_id(&activity);
    let db = state.db.clone();
    let marker = dedup_id.clone();
    match blocking(move || db.mark_inbox_seen(&marker)).await {
        Ok(true) => {}
        Ok(false) => return simple(StatusCode::ACCEPTED, "duplicate"),
        Err(e) => return simple(StatusCode::BAD_GATEWAY, &format!("db error: {e}")),
    }

    state.metrics.inbox_accepted();
    match state.inbox.process(&account, &activity).await {
        Ok(outcome) => {
            info!(actor = %account.uri, outcome = ?outcome, "inbox activity");
            simple(StatusCode::ACCEPTED, "accepted")
        }
        Err(e) => {
            if is_race_condition(&e) {
                info!(actor = %account.uri, "inbox activity raced a concurrent update: {e:#}");
            } else {
                warn!(actor = %account.uri, "inbox processing failed: {e:#}");
            }
            // A failed activity stays eligible for redelivery.
            let db = state.db.clone();
            if let Err(e) = blocking(move || db.forget_inbox_seen(&dedup_id)).await {
                warn!("inbox marker rollback failed: {e:#}");
            }
            simple(StatusCode::BAD_GATEWAY, "processing error")
        }
    }
}

fn auth_failure(state: &ApiState, reason: &str) -> Response<Body> {
    state.metrics.inbox_auth_failure();
    debug!(reason, "inbox rejected");
    simple(StatusCode::UNAUTHORIZED, reason)
}

#[derive(Serialize)]
struct InstanceList {
    instances: Vec<InstanceHealth>,
    /// Consecutive failing days per domain, only for domains with failures.
    warnings: std::collections::HashMap<String, u32>,
}

async fn admin(state: &ApiState, method: &str, rest: &str) -> Response<Body> {
    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    match (method, segments.as_slice()) {
        ("GET", ["instances"]) => {
            let tracker = state.tracker.clone();
            let res = blocking(move || {
                let domains = tracker.known_domains()?;
                let warnings = tracker.warning_domains_map(&domains)?;
                let instances = domains
                    .iter()
                    .map(|d| tracker.health(d))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                Ok(InstanceList { instances, warnings })
            })
            .await;
            json_or_error(res)
        }
        ("GET", ["instances", domain]) => instance_action(state, domain, InstanceAction::Show).await,
        ("POST", ["instances", domain, "clear_errors"]) => {
            instance_action(state, domain, InstanceAction::RemoveDeliveryErrors).await
        }
        ("POST", ["instances", domain, "restart"]) => instance_action(state, domain, InstanceAction::RestartDelivery).await,
        ("POST", ["instances", domain, "stop"]) => instance_action(state, domain, InstanceAction::StopDelivery).await,
        ("GET", ["delivery", "stats"]) => match state.queue.stats().await {
            Ok(queue) => json_response(&DeliveryStats {
                queue,
                counters: state.metrics.counters(),
            }),
            Err(e) => simple(StatusCode::BAD_GATEWAY, &format!("queue error: {e}")),
        },
        ("GET", ["metrics"]) => json_response(&state.metrics.snapshot_json()),
        _ => simple(StatusCode::NOT_FOUND, "not found"),
    }
}

#[derive(Debug, Clone, Copy)]
enum InstanceAction {
    Show,
    RemoveDeliveryErrors,
    RestartDelivery,
    StopDelivery,
}

async fn instance_action(state: &ApiState, domain: &str, action: InstanceAction) -> Response<Body> {
    let domain = domain_of(&urlencoding::decode(domain).map(|d| d.into_owned()).unwrap_or_default());
    if domain.is_empty() {
        return simple(StatusCode::BAD_REQUEST, "missing domain");
    }
    let tracker = state.tracker.clone();
    let res = blocking(move || {
        match action {
            InstanceAction::Show => {}
            InstanceAction::RemoveDeliveryErrors => tracker.clear_failures(&domain)?,
            InstanceAction::RestartDelivery => tracker.track_success(&domain)?,
            InstanceAction::StopDelivery => tracker.stop_delivery(&domain)?,
        }
        if !matches!(action, InstanceAction::Show) {
            info!(domain = %domain, action = ?action, "instance delivery state changed");
        }
        tracker.health(&domain)
    })
    .await;
    json_or_error(res)
}

fn require_internal(state: &ApiState, headers: &HeaderMap) -> Result<(), Response<Body>> {
    if state.internal_token.is_empty() {
        return Ok(());
    }
    let token = headers
        .get(INTERNAL_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if token != state.internal_token {
        return Err(simple(StatusCode::FORBIDDEN, "forbidden"));
    }
    Ok(())
}

fn json_or_error<T: Serialize>(res: anyhow::Result<T>) -> Response<Body> {
    match res {
        Ok(v) => json_response(&v),
        Err(e) => simple(StatusCode::BAD_GATEWAY, &format!("db error: {e}")),
    }
}

fn json_response<T: Serialize>(value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(bytes) => {
            let mut resp = Response::new(Body::from(bytes));
            resp.headers_mut().insert(
                http::header::CONTENT_TYPE,
                http::HeaderValue::from_static("application/json"),
            );
            resp
        }
        Err(e) => simple(StatusCode::INTERNAL_SERVER_ERROR, &format!("encode error: {e}")),
    }
}

fn simple(status: StatusCode, msg: &str) -> Response<Body> {
    let mut resp = Response::new(Body::from(msg.to_string()));
    *resp.status_mut() = status;
    resp
}
