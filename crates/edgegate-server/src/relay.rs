//! Relay engine: pumps bytes between the client and the outbound side.
//!
//! Every write is awaited before the next chunk is pulled from the opposite
//! side, so at most one chunk per direction is in flight. The 2-byte response
//! header is prepended to the first reply chunk only. When either side ends,
//! the other is torn down and the client sink is closed.

use crate::gateway::DnsExchange;
use edgegate_core::{
    response_header, udp_frame_encode, ChunkSink, ChunkSource, GatewayError, GatewayResult,
    UdpFrameDecoder,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Read buffer for outbound → client copies.
const READ_BUF_SIZE: usize = 16 * 1024;

/// Most uplink bytes buffered behind a pending DoH exchange: one full frame.
const MAX_DNS_BACKLOG: usize = 2 + u16::MAX as usize;

/// Byte counts for one relayed session (payload only, no headers or framing).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub uplink_bytes: u64,
    pub downlink_bytes: u64,
}

/// Prefixes the response header onto the first chunk sent to the client.
struct ReplyFramer {
    header: Option<[u8; 2]>,
}

impl ReplyFramer {
    fn new(version: u8) -> Self {
        Self {
            header: Some(response_header(version)),
        }
    }

    fn frame(&mut self, data: &[u8]) -> Vec<u8> {
        match self.header.take() {
            Some(h) => {
                let mut out = Vec::with_capacity(h.len() + data.len());
                out.extend_from_slice(&h);
                out.extend_from_slice(data);
                out
            }
            None => data.to_vec(),
        }
    }
}

/// Relay between the client and a TCP-like outbound stream.
///
/// `leftover` holds payload bytes that arrived together with the header; they
/// are written before anything else is pulled from `source`.
pub async fn relay_tcp<Src, Snk, S>(
    source: &mut Src,
    sink: &mut Snk,
    stream: S,
    version: u8,
    leftover: Vec<u8>,
) -> GatewayResult<RelayStats>
where
    Src: ChunkSource + ?Sized,
    Snk: ChunkSink + ?Sized,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut stats = RelayStats::default();

    let result = {
        let uplink = pump_uplink(source, &mut writer, leftover, &mut stats.uplink_bytes);
        let downlink = pump_downlink(&mut reader, sink, version, &mut stats.downlink_bytes);
        tokio::select! {
            r = uplink => {
                debug!(ok = r.is_ok(), "client side ended, closing outbound");
                r
            }
            r = downlink => {
                debug!(ok = r.is_ok(), "outbound side ended, closing client");
                r
            }
        }
    };

    let _ = writer.shutdown().await;
    drop(reader);
    drop(writer);
    let _ = sink.close().await;

    result.map(|()| stats)
}

async fn pump_uplink<Src, W>(
    source: &mut Src,
    writer: &mut W,
    leftover: Vec<u8>,
    counter: &mut u64,
) -> GatewayResult<()>
where
    Src: ChunkSource + ?Sized,
    W: AsyncWrite + Unpin,
{
    let mut next = Some(leftover);
    while let Some(chunk) = next {
        if !chunk.is_empty() {
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| GatewayError::Transport(format!("outbound write failed: {e}")))?;
            writer
                .flush()
                .await
                .map_err(|e| GatewayError::Transport(format!("outbound flush failed: {e}")))?;
            *counter += chunk.len() as u64;
        }
        next = source.next_chunk().await?;
    }
    Ok(())
}

async fn pump_downlink<R, Snk>(
    reader: &mut R,
    sink: &mut Snk,
    version: u8,
    counter: &mut u64,
) -> GatewayResult<()>
where
    R: AsyncRead + Unpin,
    Snk: ChunkSink + ?Sized,
{
    let mut framer = ReplyFramer::new(version);
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| GatewayError::Transport(format!("outbound read failed: {e}")))?;
        if n == 0 {
            return Ok(());
        }
        sink.send_chunk(framer.frame(&buf[..n])).await?;
        *counter += n as u64;
    }
}

/// Relay DNS queries (length-prefixed UDP frames) through DoH.
///
/// Queries are answered strictly in order, one exchange per frame. While an
/// exchange is pending the client side is still watched, so a client that
/// goes away cancels the in-flight request.
pub async fn relay_dns<Src, Snk, D>(
    source: &mut Src,
    sink: &mut Snk,
    dns: &D,
    version: u8,
    leftover: Vec<u8>,
) -> GatewayResult<RelayStats>
where
    Src: ChunkSource + ?Sized,
    Snk: ChunkSink + ?Sized,
    D: DnsExchange + ?Sized,
{
    let mut stats = RelayStats::default();
    let result = pump_dns(source, sink, dns, version, leftover, &mut stats).await;
    let _ = sink.close().await;
    result.map(|()| stats)
}

async fn pump_dns<Src, Snk, D>(
    source: &mut Src,
    sink: &mut Snk,
    dns: &D,
    version: u8,
    leftover: Vec<u8>,
    stats: &mut RelayStats,
) -> GatewayResult<()>
where
    Src: ChunkSource + ?Sized,
    Snk: ChunkSink + ?Sized,
    D: DnsExchange + ?Sized,
{
    let mut decoder = UdpFrameDecoder::new();
    let mut framer = ReplyFramer::new(version);
    let mut pending = leftover;

    loop {
        // bytes that arrive while an exchange is in flight; once full the
        // source is left alone until the exchange finishes
        let mut backlog = Vec::new();

        for query in decoder.feed(&pending) {
            stats.uplink_bytes += query.len() as u64;

            let mut exchange = dns.exchange(&query);
            let answer = loop {
                tokio::select! {
                    biased;
                    answer = &mut exchange => break answer?,
                    next = source.next_chunk(), if backlog.len() < MAX_DNS_BACKLOG => match next? {
                        Some(chunk) => backlog.extend_from_slice(&chunk),
                        None => {
                            debug!("client closed during DoH exchange");
                            return Ok(());
                        }
                    },
                }
            };

            if answer.is_empty() {
                debug!("empty DoH answer, nothing to relay");
                continue;
            }
            let frame = udp_frame_encode(&answer)?;
            sink.send_chunk(framer.frame(&frame)).await?;
            stats.downlink_bytes += answer.len() as u64;
        }

        if !backlog.is_empty() {
            pending = backlog;
            continue;
        }
        match source.next_chunk().await? {
            Some(chunk) => pending = chunk,
            None => {
                if decoder.pending() > 0 {
                    debug!(bytes = decoder.pending(), "client closed with a partial DNS frame");
                }
                return Ok(());
            }
        }
    }
}
