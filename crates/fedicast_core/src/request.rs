/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::SenderConfig;
use crate::error::RequestError;
use crate::http_sig::{digest_header_value, sign_request_rsa_sha256};
use crate::model::Account;
use crate::net_guard::{connect_order, guarded_lookup, is_hidden_service_host, is_private_address, GuardedResolver};
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::redirect::Policy;
use reqwest::{Proxy, Url};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

pub const ACTIVITY_JSON: &str = "application/activity+json";
const ACCEPT_ACTIVITY: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Signing identity attached to an outbound request.
#[derive(Clone, Debug)]
pub struct Signer {
    pub key_id: String,
    pub private_key_pem: String,
}

impl Signer {
    /// `None` for accounts without local key material.
    pub fn for_account(account: &Account) -> Option<Self> {
        let pem = account.private_key_pem.as_ref()?;
        Some(Self {
            key_id: account.key_id(),
            private_key_pem: pem.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Performs one outbound HTTP call under the configured address, timeout, redirect and size policy.
#[derive(Clone)]
pub struct RequestSender {
    cfg: Arc<SenderConfig>,
    resolver: Arc<GuardedResolver>,
}

impl RequestSender {
    pub fn new(cfg: SenderConfig) -> Self {
        let resolver = Arc::new(GuardedResolver::new(cfg.allow_private_addresses, cfg.connect_timeout()));
        Self {
            cfg: Arc::new(cfg),
            resolver,
        }
    }

    pub fn config(&self) -> &SenderConfig {
        &self.cfg
    }

    pub async fn perform(
        &self,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
        signer: Option<&Signer>,
        extra_headers: HeaderMap,
    ) -> Result<HttpResponse, RequestError> {
        let url = Url::parse(url).map_err(|e| RequestError::InvalidUrl(format!("{url}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RequestError::InvalidUrl(format!("unsupported scheme: {}", url.scheme())));
        }
        let host = url
            .host_str()
            .ok_or_else(|| RequestError::InvalidUrl(format!("missing host: {url}")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_ascii_lowercase();
        let port = url.port_or_known_default().unwrap_or(443);
        let hidden = is_hidden_service_host(&host);
        if hidden && !self.cfg.allow_hidden_services {
            return Err(RequestError::HostValidation(format!("hidden service access disabled: {host}")));
        }

        let mut headers = extra_headers;
        if !headers.contains_key("Date") {
            let date = httpdate::fmt_http_date(std::time::SystemTime::now());
            headers.insert("Date", header_value(&date)?);
        }
        let body = body.unwrap_or_default();
        if !body.is_empty() && !headers.contains_key("Digest") {
            headers.insert("Digest", header_value(&digest_header_value(&body))?);
        }
        if let Some(signer) = signer {
            let uri: Uri = url
                .as_str()
                .parse()
                .map_err(|e| RequestError::InvalidUrl(format!("{url}: {e}")))?;
            let mut signed: Vec<&str> = vec!["(request-target)", "host", "date"];
            if !body.is_empty() {
                signed.push("digest");
            }
            sign_request_rsa_sha256(&signer.private_key_pem, &signer.key_id, &method, &uri, &mut headers, &body, &signed)
                .map_err(|e| RequestError::Signing(format!("{e:#}")))?;
        }

        // Resolve, connect, send and read all count against one attempt deadline.
        let attempt = async {
            let client = self.build_client(&host, port, hidden).await?;
            let mut req = client.request(method.clone(), url.clone()).headers(headers);
            if !body.is_empty() {
                req = req.body(body);
            }
            // reqwest has no write timeout; connect, upload and the response head share the send budget.
            let resp = tokio::time::timeout(self.cfg.send_timeout(), req.send())
                .await
                .map_err(|_| RequestError::Timeout(format!("{method} {url}: send")))?
                .map_err(classify)?;
            let status = resp.status();
            let headers = resp.headers().clone();
            let body = read_limited(resp, self.cfg.max_body_bytes).await?;
            Ok::<_, RequestError>(HttpResponse { status, headers, body })
        };
        let resp = tokio::time::timeout(self.cfg.attempt_timeout(), attempt)
            .await
            .map_err(|_| RequestError::Timeout(format!("{method} {url}: attempt deadline")))??;
        debug!(%method, url = %url, status = resp.status.as_u16(), "outbound request done");
        Ok(resp)
    }

    /// Signed ActivityPub inbox delivery.
    pub async fn post_activity(&self, inbox_url: &str, body: Vec<u8>, signer: &Signer) -> Result<HttpResponse, RequestError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(ACTIVITY_JSON));
        headers.insert(ACCEPT, HeaderValue::from_static(ACTIVITY_JSON));
        self.perform(Method::POST, inbox_url, Some(body), Some(signer), headers).await
    }

    pub async fn fetch_json(&self, url: &str, signer: Option<&Signer>) -> anyhow::Result<serde_json::Value> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_ACTIVITY));
        let resp = self.perform(Method::GET, url, None, signer, headers).await?;
        if !resp.is_success() {
            anyhow::bail!("fetch {url}: status {}", resp.status);
        }
        Ok(serde_json::from_slice(&resp.body)?)
    }

    async fn build_client(&self, host: &str, port: u16, hidden: bool) -> Result<reqwest::Client, RequestError> {
        let cfg = &self.cfg;
        let mut builder = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .connect_timeout(cfg.connect_timeout())
            .read_timeout(cfg.read_timeout());

        if hidden {
            let proxy_url = cfg
                .hidden_service_proxy
                .as_deref()
                .ok_or_else(|| RequestError::HostValidation(format!("no hidden service proxy for {host}")))?;
            let proxy = Proxy::all(proxy_url).map_err(|e| RequestError::InvalidUrl(format!("hidden service proxy: {e}")))?;
            return builder
                .proxy(proxy)
                .redirect(redirect_policy(cfg.max_redirects, true))
                .build()
                .map_err(RequestError::Http);
        }

        if let Some(proxy_url) = cfg.proxy.as_deref() {
            let proxy = Proxy::all(proxy_url).map_err(|e| RequestError::InvalidUrl(format!("proxy: {e}")))?;
            return builder
                .proxy(proxy)
                .redirect(redirect_policy(cfg.max_redirects, true))
                .build()
                .map_err(RequestError::Http);
        }

        // The connector races the vetted candidates itself and keeps the winning connection.
        let candidates = guarded_lookup(host, port, cfg.connect_timeout(), cfg.allow_private_addresses).await?;
        if host.parse::<IpAddr>().is_err() {
            builder = builder.resolve_to_addrs(host, &connect_order(&candidates));
        }
        builder
            .no_proxy()
            .dns_resolver(self.resolver.clone())
            .redirect(redirect_policy(cfg.max_redirects, cfg.allow_private_addresses))
            .build()
            .map_err(RequestError::Http)
    }
}

/// Follows at most `max_hops` redirects; literal private addresses are refused unless allowed.
/// Hostnames go through [`GuardedResolver`].
fn redirect_policy(max_hops: usize, allow_private: bool) -> Policy {
    Policy::custom(move |attempt| {
        if attempt.previous().len() > max_hops {
            return attempt.error("too many redirects");
        }
        let private = attempt
            .url()
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
            .and_then(|h| h.parse::<IpAddr>().ok())
            .map(is_private_address)
            .unwrap_or(false);
        if private && !allow_private {
            return attempt.error("redirect to private address");
        }
        attempt.follow()
    })
}

fn header_value(v: &str) -> Result<HeaderValue, RequestError> {
    HeaderValue::from_str(v).map_err(|e| RequestError::Signing(format!("header value: {e}")))
}

async fn read_limited(mut resp: reqwest::Response, limit: usize) -> Result<Bytes, RequestError> {
    if let Some(len) = resp.content_length() {
        if len > limit as u64 {
            return Err(RequestError::LengthValidation { limit });
        }
    }
    let mut buf = BytesMut::new();
    while let Some(chunk) = resp.chunk().await.map_err(classify)? {
        if buf.len() + chunk.len() > limit {
            return Err(RequestError::LengthValidation { limit });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

fn classify(e: reqwest::Error) -> RequestError {
    let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(&e);
    while let Some(s) = source {
        if let Some(RequestError::HostValidation(msg)) = s.downcast_ref::<RequestError>() {
            return RequestError::HostValidation(msg.clone());
        }
        source = s.source();
    }
    if e.is_timeout() {
        return RequestError::Timeout(e.to_string());
    }
    if e.is_connect() {
        return RequestError::Connect(e.to_string());
    }
    RequestError::Http(e)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::net::SocketAddr;

    /// Serves `router` on an ephemeral loopback port.
    pub async fn spawn_server(router: axum::Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        addr
    }

    pub fn loopback_sender() -> RequestSender {
        RequestSender::new(SenderConfig {
            allow_private_addresses: true,
            ..SenderConfig::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::http_sig::{build_signing_string, parse_signature_header, verify_signature_rsa_sha256};
    use crate::keys::test_keys;
    use axum::routing::{get, post};
    use axum::Router;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn signed_post_carries_digest_and_verifiable_signature() {
        let captured: Arc<Mutex<Option<(HeaderMap, Bytes)>>> = Arc::new(Mutex::new(None));
        let cap = captured.clone();
        let router = Router::new().route(
            "/users/bob/inbox",
            post(move |headers: HeaderMap, body: Bytes| {
                let cap = cap.clone();
                async move {
                    *cap.lock().unwrap() = Some((headers, body));
                    StatusCode::ACCEPTED
                }
            }),
        );
        let addr = spawn_server(router).await;
        let keys = test_keys::shared();
        let signer = Signer {
            key_id: "https://local.test/users/alice#main-key".to_string(),
            private_key_pem: keys.private_key_pem.clone(),
        };

        let url = format!("http://{addr}/users/bob/inbox");
        let resp = loopback_sender()
            .post_activity(&url, br#"{"type":"Create"}"#.to_vec(), &signer)
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::ACCEPTED);

        let (headers, body) = captured.lock().unwrap().take().unwrap();
        assert_eq!(&body[..], br#"{"type":"Create"}"#);
        assert!(headers.get("digest").unwrap().to_str().unwrap().starts_with("SHA-256="));
        let sig = parse_signature_header(headers.get("signature").unwrap().to_str().unwrap()).unwrap();
        assert_eq!(sig.headers, vec!["(request-target)", "host", "date", "digest"]);
        let uri: Uri = "/users/bob/inbox".parse().unwrap();
        let signing_string = build_signing_string(&Method::POST, &uri, &headers, &sig.headers).unwrap();
        verify_signature_rsa_sha256(&keys.public_key_pem, &signing_string, &sig.signature).unwrap();
    }

    /// Plain HTTP/1.1 responder that counts accepted TCP connections.
    async fn counting_server() -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = accepts.clone();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        match sock.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let _ = sock
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                        .await;
                });
            }
        });
        (addr, accepts)
    }

    #[tokio::test]
    async fn one_request_opens_one_connection() {
        let (addr, accepts) = counting_server().await;
        let resp = loopback_sender()
            .perform(Method::GET, &format!("http://{addr}/x"), None, None, HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(&resp.body[..], b"ok");
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hostname_targets_connect_once_through_vetted_candidates() {
        let (addr, accepts) = counting_server().await;
        let url = format!("http://localhost:{}/x", addr.port());
        let resp = loopback_sender()
            .perform(Method::GET, &url, None, None, HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn private_target_is_rejected_without_io() {
        let sender = RequestSender::new(SenderConfig::default());
        let err = sender
            .perform(Method::GET, "http://127.0.0.1:9/x", None, None, HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::HostValidation(_)));
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn hidden_services_need_opt_in_and_proxy() {
        let sender = RequestSender::new(SenderConfig::default());
        let err = sender
            .perform(Method::GET, "http://abcdef.onion/", None, None, HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::HostValidation(_)));

        let sender = RequestSender::new(SenderConfig {
            allow_hidden_services: true,
            ..SenderConfig::default()
        });
        let err = sender
            .perform(Method::GET, "http://abcdef.onion/", None, None, HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::HostValidation(_)));
    }

    #[tokio::test]
    async fn unsupported_scheme_is_invalid() {
        let err = loopback_sender()
            .perform(Method::GET, "ftp://remote.example/file", None, None, HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn oversized_body_is_a_length_violation() {
        let router = Router::new().route("/big", get(|| async { vec![b'x'; 4096] }));
        let addr = spawn_server(router).await;
        let sender = RequestSender::new(SenderConfig {
            allow_private_addresses: true,
            max_body_bytes: 1024,
            ..SenderConfig::default()
        });
        let err = sender
            .perform(Method::GET, &format!("http://{addr}/big"), None, None, HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::LengthValidation { limit: 1024 }));
    }

    #[tokio::test]
    async fn redirect_loops_stop_after_the_hop_limit() {
        let router = Router::new().route(
            "/loop",
            get(|| async { (StatusCode::FOUND, [(http::header::LOCATION, "/loop")]) }),
        );
        let addr = spawn_server(router).await;
        let err = loopback_sender()
            .perform(Method::GET, &format!("http://{addr}/loop"), None, None, HeaderMap::new())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let router = Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let addr = spawn_server(router).await;
        let sender = RequestSender::new(SenderConfig {
            allow_private_addresses: true,
            connect_timeout_secs: 1,
            read_timeout_secs: 1,
            write_timeout_secs: 1,
            ..SenderConfig::default()
        });
        let err = sender
            .perform(Method::GET, &format!("http://{addr}/slow"), None, None, HeaderMap::new())
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "{err}");
        assert!(err.is_transient());
    }
}
