//! Outbound connector: direct dial with ordered fallback, or DNS-over-HTTPS.
//!
//! A TCP request is first dialed directly. On any failure (refused, resolution
//! error, per-attempt timeout) each configured fallback endpoint is tried in
//! list order until one succeeds. UDP is only accepted for port 53, which is
//! served by the DoH forwarder instead of a socket.

use super::policy::{ConnectionGuard, ConnectionTracker};
use crate::config::ProxyEndpoint;
use edgegate_core::{Command, GatewayError, GatewayResult, RequestHeader};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// The only UDP destination port the gateway serves.
pub const DNS_PORT: u16 = 53;

/// Opens raw outbound connections.
pub trait Dialer: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn dial<'a>(
        &'a self,
        host: &'a str,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = io::Result<Self::Stream>> + Send + 'a>>;
}

/// Production dialer: `tokio::net::TcpStream::connect`, which also resolves names.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    type Stream = TcpStream;

    fn dial<'a>(
        &'a self,
        host: &'a str,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send + 'a>> {
        Box::pin(async move {
            let stream = TcpStream::connect((host, port)).await?;
            stream.set_nodelay(true)?;
            Ok(stream)
        })
    }
}

/// Ordered fallback policy: the direct target first, then every configured
/// endpoint in order, each attempt bounded by `attempt_timeout`.
#[derive(Debug, Clone)]
pub struct FallbackPolicy {
    endpoints: Vec<ProxyEndpoint>,
    attempt_timeout: Duration,
}

impl FallbackPolicy {
    pub fn new(endpoints: Vec<ProxyEndpoint>, attempt_timeout: Duration) -> Self {
        Self {
            endpoints,
            attempt_timeout,
        }
    }

    /// Candidates for a target, in attempt order.
    pub fn candidates(&self, host: &str, port: u16) -> Vec<ProxyEndpoint> {
        std::iter::once(ProxyEndpoint::new(host, port))
            .chain(self.endpoints.iter().cloned())
            .collect()
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }
}

/// An established outbound TCP connection.
///
/// Counted as open in the [`ConnectionTracker`] until dropped.
pub struct Connected<S> {
    pub stream: S,
    /// The endpoint that accepted the connection (direct target or fallback).
    pub endpoint: ProxyEndpoint,
    /// 0 for the direct target, n for the n-th fallback endpoint.
    pub attempt: usize,
    pub(crate) guard: ConnectionGuard,
}

/// What the relay talks to.
pub enum Outbound<S> {
    Tcp(Connected<S>),
    /// DNS over UDP/53, forwarded as DoH requests.
    Dns,
}

/// Establishes the outbound side of a session.
pub struct Connector<D: Dialer> {
    dialer: Arc<D>,
    policy: FallbackPolicy,
    tracker: Arc<ConnectionTracker>,
}

impl<D: Dialer> Connector<D> {
    pub fn new(dialer: Arc<D>, policy: FallbackPolicy, tracker: Arc<ConnectionTracker>) -> Self {
        Self {
            dialer,
            policy,
            tracker,
        }
    }

    /// Pick the outbound for an authenticated header.
    pub async fn open(&self, header: &RequestHeader) -> GatewayResult<Outbound<D::Stream>> {
        match header.command {
            Command::Tcp => {
                let connected = self.connect_tcp(&header.host(), header.port).await?;
                Ok(Outbound::Tcp(connected))
            }
            Command::Udp if header.port == DNS_PORT => {
                debug!(target = %header.target(), "UDP request routed to DoH");
                Ok(Outbound::Dns)
            }
            Command::Udp => Err(GatewayError::Protocol(format!(
                "UDP only supports DNS (port {DNS_PORT}), got port {}",
                header.port
            ))),
        }
    }

    /// Dial `host:port`, falling back through the configured endpoints.
    pub async fn connect_tcp(&self, host: &str, port: u16) -> GatewayResult<Connected<D::Stream>> {
        let timeout = self.policy.attempt_timeout();
        let mut failures = Vec::new();

        for (attempt, candidate) in self.policy.candidates(host, port).into_iter().enumerate() {
            let outcome =
                tokio::time::timeout(timeout, self.dialer.dial(&candidate.host, candidate.port))
                    .await;
            match outcome {
                Ok(Ok(stream)) => {
                    info!(endpoint = %candidate, attempt, "TCP connection established");
                    return Ok(Connected {
                        stream,
                        endpoint: candidate,
                        attempt,
                        guard: self.tracker.acquire_outbound(),
                    });
                }
                Ok(Err(e)) => {
                    warn!(endpoint = %candidate, attempt, error = %e, "TCP connect failed");
                    failures.push(format!("{candidate} ({e})"));
                }
                Err(_) => {
                    warn!(endpoint = %candidate, attempt, timeout_ms = timeout.as_millis() as u64, "TCP connect timed out");
                    failures.push(format!("{candidate} (timed out)"));
                }
            }
        }

        warn!(attempted = ?failures, "all connect attempts failed");
        Err(GatewayError::Connect(format!(
            "no endpoint reachable: {}",
            failures.join(", ")
        )))
    }
}
