//! edgegate-core: protocol library for the edgegate tunnel gateway.
//!
//! Provides the request header parser and authenticator, the response header,
//! UDP datagram framing, user-id parsing, the shared error type and the
//! abstract chunk transport traits.

pub mod codec;
pub mod error;
pub mod header;
pub mod identity;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{udp_frame_encode, UdpFrameDecoder};
pub use error::{GatewayError, GatewayResult};
pub use header::{
    read_header, response_header, Address, Command, HeaderDecoder, RequestHeader,
};
pub use identity::UserId;
pub use transport::{ChunkSink, ChunkSource};
