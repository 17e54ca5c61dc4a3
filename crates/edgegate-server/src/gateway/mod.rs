//! Gateway module: outbound connections, DNS-over-HTTPS and connection accounting.
//!
//! # Submodule Architecture
//!
//! - **[`connector`]**: the [`Connector`] turns an authenticated request
//!   header into an [`Outbound`]: a TCP connection (direct, then each
//!   fallback endpoint in order under a per-attempt timeout) or the DNS marker
//!   for UDP/53. Dialing goes through the [`Dialer`] seam.
//!
//! - **[`doh`]**: the [`DohForwarder`] sends each DNS query as one HTTPS
//!   `POST` to the configured resolver, behind the [`DnsExchange`] seam.
//!
//! - **[`policy`]**: the [`ConnectionTracker`] counts live sessions (bounded
//!   by `max_sessions`) and open outbound connections with RAII guards.
//!
//! # Data Flow
//!
//! ```text
//! RequestHeader
//!   → Connector::open
//!       → Tcp: FallbackPolicy::candidates → Dialer::dial (each under timeout)
//!              → ConnectionTracker::acquire_outbound
//!       → Udp/53: Outbound::Dns → relay_dns → DnsExchange::exchange
//! ```

pub mod connector;
pub mod doh;
pub mod policy;

pub use connector::{Connected, Connector, Dialer, FallbackPolicy, Outbound, TcpDialer};
pub use doh::{DnsExchange, DohForwarder};
pub use policy::ConnectionTracker;
