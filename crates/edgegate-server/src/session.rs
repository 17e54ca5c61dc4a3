//! Session lifecycle: authenticate, connect, relay, close.
//!
//! ```text
//! INIT → AUTHENTICATING → CONNECTING → RELAYING → CLOSED
//! ```
//!
//! Any failure jumps straight to CLOSED; there are no backward transitions.

use crate::config::ProxyEndpoint;
use crate::gateway::{Connector, Dialer, DnsExchange, Outbound};
use crate::relay::{relay_dns, relay_tcp, RelayStats};
use edgegate_core::{
    read_header, ChunkSink, ChunkSource, GatewayError, GatewayResult, RequestHeader, UserId,
};
use std::fmt;
use tracing::{debug, info, warn};

/// Lifecycle state of a session. Ordered: transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Init,
    Authenticating,
    Connecting,
    Relaying,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Init => "init",
            SessionState::Authenticating => "authenticating",
            SessionState::Connecting => "connecting",
            SessionState::Relaying => "relaying",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// One tunneled connection, owned by the task serving it.
#[derive(Debug)]
pub struct Session {
    /// Random id, for log correlation only.
    pub id: String,
    state: SessionState,
    /// Set once authentication succeeds.
    pub header: Option<RequestHeader>,
    /// The endpoint that accepted the outbound TCP connection.
    pub endpoint: Option<ProxyEndpoint>,
}

impl Session {
    pub fn new() -> Self {
        Self::with_id(generate_session_id())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: SessionState::Init,
            header: None,
            endpoint: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`, which must be strictly later than the current state.
    pub fn advance(&mut self, next: SessionState) -> GatewayResult<()> {
        if next <= self.state {
            return Err(GatewayError::Other(format!(
                "invalid session transition {} -> {}",
                self.state, next
            )));
        }
        debug!(session = %self.id, from = %self.state, to = %next, "session state");
        self.state = next;
        Ok(())
    }

    /// Jump to CLOSED from wherever the session is. Closing twice is a no-op.
    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            debug!(session = %self.id, from = %self.state, "session closed");
            self.state = SessionState::Closed;
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_session_id() -> String {
    hex::encode(rand::random::<[u8; 6]>())
}

/// Runs sessions against a shared connector and DoH forwarder.
pub struct SessionHandler<D: Dialer, N: DnsExchange> {
    user_id: UserId,
    connector: Connector<D>,
    dns: N,
}

impl<D: Dialer, N: DnsExchange> SessionHandler<D, N> {
    pub fn new(user_id: UserId, connector: Connector<D>, dns: N) -> Self {
        Self {
            user_id,
            connector,
            dns,
        }
    }

    /// Drive one session to completion. The sink is always closed on return.
    pub async fn run<Src, Snk>(
        &self,
        session: &mut Session,
        source: &mut Src,
        sink: &mut Snk,
    ) -> GatewayResult<RelayStats>
    where
        Src: ChunkSource + ?Sized,
        Snk: ChunkSink + ?Sized,
    {
        let result = self.drive(session, source, sink).await;
        let _ = sink.close().await;

        match &result {
            Ok(stats) => info!(
                session = %session.id,
                uplink = stats.uplink_bytes,
                downlink = stats.downlink_bytes,
                "session finished"
            ),
            Err(e) => warn!(
                session = %session.id,
                state = %session.state(),
                kind = e.kind(),
                error = %e,
                "session failed"
            ),
        }
        session.close();
        result
    }

    async fn drive<Src, Snk>(
        &self,
        session: &mut Session,
        source: &mut Src,
        sink: &mut Snk,
    ) -> GatewayResult<RelayStats>
    where
        Src: ChunkSource + ?Sized,
        Snk: ChunkSink + ?Sized,
    {
        session.advance(SessionState::Authenticating)?;
        let (header, mut leftover) = read_header(source, self.user_id).await?;
        info!(
            session = %session.id,
            target = %header.target(),
            command = %header.command,
            "request authenticated"
        );
        let version = header.version;

        session.advance(SessionState::Connecting)?;
        // The client may keep sending or hang up while the dial is in flight.
        // Early payload joins the leftover; a hang-up cancels every pending attempt.
        let opened = {
            let open = self.connector.open(&header);
            tokio::pin!(open);
            loop {
                tokio::select! {
                    biased;
                    outbound = &mut open => break outbound.map(Some),
                    next = source.next_chunk() => match next {
                        Ok(Some(chunk)) => leftover.extend_from_slice(&chunk),
                        Ok(None) => break Ok(None),
                        Err(e) => break Err(e),
                    },
                }
            }
        };
        session.header = Some(header);
        let outbound = match opened? {
            Some(outbound) => outbound,
            None => {
                debug!(session = %session.id, "client closed while connecting");
                return Ok(RelayStats::default());
            }
        };

        match outbound {
            Outbound::Tcp(connected) => {
                debug!(
                    session = %session.id,
                    endpoint = %connected.endpoint,
                    attempt = connected.attempt,
                    "outbound ready"
                );
                session.endpoint = Some(connected.endpoint.clone());
                session.advance(SessionState::Relaying)?;
                let guard = connected.guard;
                let stats = relay_tcp(source, sink, connected.stream, version, leftover).await;
                drop(guard);
                stats
            }
            Outbound::Dns => {
                session.advance(SessionState::Relaying)?;
                relay_dns(source, sink, &self.dns, version, leftover).await
            }
        }
    }
}
