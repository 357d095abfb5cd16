//! Peer authorisation against the local node-identity daemon.
//!
//! Every request except `/health` resolves its peer address to a node
//! identity and checks it against the configured allowlist. Loopback is
//! always allowed; an empty allowlist disables the gate entirely; when the
//! gate is enabled and the daemon is unreachable the request is denied.

use anyhow::{bail, Context, Result};
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UnixStream;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::ApiError;

/// How long a verification outcome is cached, positive or negative.
pub const CACHE_TTL: Duration = Duration::from_secs(300);

struct CacheEntry {
    allowed: bool,
    inserted_at: Instant,
}

struct PeerAuthInner {
    /// Lowercased allowed identities; empty disables the gate.
    allowlist: Vec<String>,
    socket_path: PathBuf,
    ttl: Duration,
    cache: RwLock<HashMap<IpAddr, CacheEntry>>,
}

/// Shared verification gate.
#[derive(Clone)]
pub struct PeerAuth {
    inner: Arc<PeerAuthInner>,
}

/// Identity attributed to a peer by the node daemon.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub node_name: String,
    pub login_name: String,
}

impl PeerAuth {
    pub fn new(allowed_nodes: &[String], socket_path: PathBuf) -> Self {
        Self {
            inner: Arc::new(PeerAuthInner {
                allowlist: allowed_nodes
                    .iter()
                    .map(|n| n.trim().to_ascii_lowercase())
                    .filter(|n| !n.is_empty())
                    .collect(),
                socket_path,
                ttl: CACHE_TTL,
                cache: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Whether the allowlist gate is active at all.
    pub fn enabled(&self) -> bool {
        !self.inner.allowlist.is_empty()
    }

    /// Verify a peer address. Fail-open when unconfigured, fail-closed on
    /// daemon errors when enabled.
    pub async fn verify(&self, peer: SocketAddr) -> bool {
        if peer.ip().is_loopback() {
            return true;
        }
        if !self.enabled() {
            return true;
        }

        let ip = peer.ip();
        {
            let cache = self.inner.cache.read().await;
            if let Some(entry) = cache.get(&ip) {
                if entry.inserted_at.elapsed() < self.inner.ttl {
                    return entry.allowed;
                }
            }
        }

        let allowed = match self.whois(peer).await {
            Ok(identity) => {
                let allowed = self.matches(&identity);
                if !allowed {
                    warn!(
                        "peer {} ({} / {}) not in allowlist",
                        peer, identity.node_name, identity.login_name
                    );
                }
                allowed
            }
            Err(err) => {
                warn!("node identity lookup failed for {}: {:#}", peer, err);
                false
            }
        };

        self.inner.cache.write().await.insert(
            ip,
            CacheEntry { allowed, inserted_at: Instant::now() },
        );
        allowed
    }

    /// Resolve the identity the node daemon attributes to this peer, if
    /// the gate is enabled and the peer is known. Used to label client
    /// sessions; failures are soft here.
    pub async fn identity(&self, peer: SocketAddr) -> Option<String> {
        if !self.enabled() || peer.ip().is_loopback() {
            return None;
        }
        self.whois(peer).await.ok().map(|i| i.node_name)
    }

    fn matches(&self, identity: &PeerIdentity) -> bool {
        let node = identity.node_name.trim_end_matches('.').to_ascii_lowercase();
        let short = node.split('.').next().unwrap_or("").to_string();
        let login = identity.login_name.to_ascii_lowercase();
        self.inner
            .allowlist
            .iter()
            .any(|entry| *entry == node || *entry == short || *entry == login)
    }

    /// `GET /localapi/v0/whois?addr=<ip:port>` over the daemon's Unix
    /// socket, HTTP/1 via hyper.
    async fn whois(&self, peer: SocketAddr) -> Result<PeerIdentity> {
        let stream = UnixStream::connect(&self.inner.socket_path)
            .await
            .with_context(|| {
                format!("Failed to connect to node daemon at {}", self.inner.socket_path.display())
            })?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .context("Node daemon handshake failed")?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!("whois connection closed with error: {}", err);
            }
        });

        let request = hyper::Request::builder()
            .uri(format!("/localapi/v0/whois?addr={}", peer))
            .header(hyper::header::HOST, "local-node")
            .body(Empty::<Bytes>::new())
            .context("Failed to build whois request")?;

        let response = sender
            .send_request(request)
            .await
            .context("whois request failed")?;
        if !response.status().is_success() {
            bail!("whois returned {}", response.status());
        }

        let body = response
            .into_body()
            .collect()
            .await
            .context("Failed to read whois body")?
            .to_bytes();
        let whois: WhoisResponse =
            serde_json::from_slice(&body).context("Failed to parse whois response")?;

        Ok(PeerIdentity {
            node_name: whois.node.map(|n| n.name).unwrap_or_default(),
            login_name: whois.user.map(|u| u.login_name).unwrap_or_default(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct WhoisResponse {
    #[serde(rename = "Node", default)]
    node: Option<WhoisNode>,
    #[serde(rename = "UserProfile", default)]
    user: Option<WhoisUser>,
}

#[derive(Debug, Deserialize)]
struct WhoisNode {
    #[serde(rename = "Name", default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct WhoisUser {
    #[serde(rename = "LoginName", default)]
    login_name: String,
}

/// Middleware rejecting unauthorised peers before routing.
pub async fn peer_auth_middleware(
    State(auth): State<PeerAuth>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if auth.verify(peer).await {
        next.run(request).await
    } else {
        ApiError::AuthDenied.into_response()
    }
}
