//! Abstract chunk transport traits for edgegate.
//!
//! The WebSocket ingress and any in-memory test double implement these, so
//! header parsing and relaying never see the underlying connection type.

use crate::error::GatewayResult;
use std::future::Future;
use std::pin::Pin;

/// An ordered source of byte chunks, finite until close.
pub trait ChunkSource: Send {
    /// Next chunk in arrival order. `Ok(None)` = clean end of stream.
    ///
    /// Must be cancel-safe: dropping the future before it resolves loses no data.
    fn next_chunk(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<Option<Vec<u8>>>> + Send + '_>>;
}

/// An ordered sink of byte chunks (the client side of a session).
pub trait ChunkSink: Send {
    /// Send one chunk. Resolves once the chunk has been handed to the transport.
    fn send_chunk(
        &mut self,
        data: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<()>> + Send + '_>>;

    /// Close the sink. Closing twice is a no-op.
    fn close(&mut self) -> Pin<Box<dyn Future<Output = GatewayResult<()>> + Send + '_>>;
}
