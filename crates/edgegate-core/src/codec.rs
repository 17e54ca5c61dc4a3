//! Length-prefixed framing for UDP datagrams carried over the tunnel.
//!
//! Wire format: `[2-byte big-endian length][datagram]`

use crate::error::{GatewayError, GatewayResult};

/// Encode one datagram into a length-prefixed frame.
pub fn udp_frame_encode(datagram: &[u8]) -> GatewayResult<Vec<u8>> {
    let len = u16::try_from(datagram.len()).map_err(|_| {
        GatewayError::Protocol(format!("datagram too large: {} bytes", datagram.len()))
    })?;

    let mut frame = Vec::with_capacity(2 + datagram.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(datagram);
    Ok(frame)
}

/// Streaming frame decoder: accumulates bytes and yields complete datagrams.
#[derive(Debug, Default)]
pub struct UdpFrameDecoder {
    buffer: Vec<u8>,
}

impl UdpFrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed bytes and return every datagram completed by them, in order.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();
        let mut consumed = 0;

        loop {
            let rest = &self.buffer[consumed..];
            if rest.len() < 2 {
                break;
            }
            let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
            if rest.len() < 2 + len {
                break;
            }
            frames.push(rest[2..2 + len].to_vec());
            consumed += 2 + len;
        }

        self.buffer.drain(..consumed);
        frames
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
