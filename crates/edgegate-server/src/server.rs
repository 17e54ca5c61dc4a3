//! Core server: accepts WebSocket connections and runs one session per connection.
//!
//! Owns the connection tracker, the outbound connector, the DoH forwarder and
//! the HTTP router. Every accepted connection is admitted against
//! `max_sessions`, then served on its own task until either side ends.

use crate::config::GatewayConfig;
use crate::gateway::{ConnectionTracker, Connector, DohForwarder, FallbackPolicy, TcpDialer};
use crate::router::HttpRouter;
use crate::session::{Session, SessionHandler};
use crate::transport::{start_listener, WebSocketConnection};
use edgegate_core::GatewayResult;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// The edgegate server instance.
pub struct GatewayServer {
    config: GatewayConfig,
    tracker: Arc<ConnectionTracker>,
    handler: SessionHandler<TcpDialer, DohForwarder>,
    router: Arc<HttpRouter>,
}

impl GatewayServer {
    /// Create a new server instance.
    pub fn new(config: GatewayConfig) -> GatewayResult<Self> {
        let tracker = Arc::new(ConnectionTracker::new(config.max_sessions));

        let policy = FallbackPolicy::new(config.proxy_endpoints.clone(), config.connect_timeout);
        let connector = Connector::new(Arc::new(TcpDialer), policy, tracker.clone());
        let doh = DohForwarder::new(&config.doh_url, config.doh_timeout)?;
        info!(
            doh = doh.url(),
            fallbacks = config.proxy_endpoints.len(),
            "gateway configured"
        );

        let handler = SessionHandler::new(config.user_id, connector, doh);
        let router = Arc::new(HttpRouter::new(config.user_id));

        Ok(Self {
            config,
            tracker,
            handler,
            router,
        })
    }

    /// Run the server until the listener stops.
    pub async fn run(self) -> GatewayResult<()> {
        let server = Arc::new(self);
        let (addr, rx) = server.bind().await?;

        info!(
            addr = %addr,
            max_sessions = server.config.max_sessions,
            "edgegate ready"
        );

        server.serve(rx).await;
        Ok(())
    }

    pub(crate) async fn bind(
        &self,
    ) -> GatewayResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
        start_listener(self.config.listen_addr, self.router.clone()).await
    }

    /// Accept loop: admit each connection and spawn its session.
    pub(crate) async fn serve(self: Arc<Self>, mut rx: mpsc::Receiver<WebSocketConnection>) {
        while let Some(conn) = rx.recv().await {
            let guard = match self.tracker.try_admit() {
                Ok(guard) => guard,
                Err(reason) => {
                    warn!(remote = %conn.remote_addr, reason = %reason, "rejecting WebSocket connection");
                    tokio::spawn(async move {
                        let mut ws = conn.ws_stream;
                        let _ = ws.close(None).await;
                    });
                    continue;
                }
            };

            let srv = self.clone();
            tokio::spawn(async move {
                let _guard = guard;
                srv.handle_websocket(conn).await;
            });
        }
        info!("listener closed, shutting down");
    }

    async fn handle_websocket(&self, conn: WebSocketConnection) {
        let remote = conn.remote_addr;
        let mut session = Session::new();
        info!(session = %session.id, remote = %remote, "handling WebSocket connection");

        let (mut ingress, mut egress) = conn.split();
        // outcome is logged by the handler
        let _ = self
            .handler
            .run(&mut session, &mut ingress, &mut egress)
            .await;
        debug!(
            session = %session.id,
            active = self.tracker.active_sessions().saturating_sub(1),
            outbound = self.tracker.open_connections(),
            "WebSocket connection done"
        );
    }

    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }
}
