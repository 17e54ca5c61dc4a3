//! WebSocket listener using tokio-tungstenite.
//!
//! Each accepted TCP connection has its request head read first. Plain HTTP
//! requests go to the [`HttpRouter`]; upgrade requests get the WebSocket
//! handshake, with the `sec-websocket-protocol` value echoed back and decoded
//! as early data. Accepted connections are split into a [`WsIngress`] chunk
//! source and a [`WsEgress`] chunk sink.

use super::prefixed::PrefixedStream;
use crate::router::{head_end, read_request_head, HttpResponse, HttpRouter, RequestHead, HEAD_READ_TIMEOUT};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use edgegate_core::{ChunkSink, ChunkSource, GatewayError, GatewayResult};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Maximum frame size for WebSocket messages (1 MiB).
pub const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// Server-side WebSocket stream as produced by the listener.
pub type WsStream = WebSocketStream<PrefixedStream<TcpStream>>;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WsStream,
    pub remote_addr: SocketAddr,
    /// Decoded `sec-websocket-protocol` payload, if it was valid base64.
    pub early_data: Option<Vec<u8>>,
}

impl WebSocketConnection {
    pub fn split(self) -> (WsIngress<PrefixedStream<TcpStream>>, WsEgress<PrefixedStream<TcpStream>>) {
        split_connection(self.ws_stream, self.early_data)
    }
}

/// Start the listener.
///
/// Returns the bound address and a receiver that yields upgraded connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
    router: Arc<HttpRouter>,
) -> GatewayResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| GatewayError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(accept_connection(stream, addr, router.clone(), tx.clone()));
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
            if tx.is_closed() {
                debug!("connection receiver dropped, listener stopping");
                break;
            }
        }
    });

    Ok((local_addr, rx))
}

async fn accept_connection(
    mut stream: TcpStream,
    remote: SocketAddr,
    router: Arc<HttpRouter>,
    tx: mpsc::Sender<WebSocketConnection>,
) {
    let raw = match tokio::time::timeout(HEAD_READ_TIMEOUT, read_request_head(&mut stream)).await {
        Ok(Ok(raw)) => raw,
        Ok(Err(e)) => {
            debug!(remote = %remote, error = %e, "failed to read request head");
            return;
        }
        Err(_) => {
            debug!(remote = %remote, "request head timed out");
            return;
        }
    };

    let end = head_end(&raw).unwrap_or(raw.len());
    let response = match RequestHead::parse(&raw[..end]) {
        Ok(head) if head.is_websocket_upgrade() => {
            upgrade(PrefixedStream::new(raw, stream), remote, tx).await;
            return;
        }
        Ok(head) => {
            let response = router.route(&head);
            info!(remote = %remote, method = %head.method, path = %head.path, status = response.status, "HTTP request");
            response
        }
        Err(e) => {
            warn!(remote = %remote, error = %e, "malformed HTTP request");
            HttpResponse::internal_error()
        }
    };

    if let Err(e) = stream.write_all(&response.to_bytes()).await {
        debug!(remote = %remote, error = %e, "HTTP response write failed");
    }
    let _ = stream.shutdown().await;
}

async fn upgrade(
    stream: PrefixedStream<TcpStream>,
    remote: SocketAddr,
    tx: mpsc::Sender<WebSocketConnection>,
) {
    let mut protocol: Option<HeaderValue> = None;
    let callback = |req: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        if let Some(value) = req.headers().get(SEC_WEBSOCKET_PROTOCOL) {
            response
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, value.clone());
            protocol = Some(value.clone());
        }
        Ok(response)
    };

    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(remote = %remote, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let early_data = protocol
        .as_ref()
        .and_then(|v| v.to_str().ok())
        .and_then(decode_early_data);
    debug!(
        remote = %remote,
        early_data = early_data.as_ref().map_or(0, Vec::len),
        "WebSocket connection accepted"
    );

    let conn = WebSocketConnection {
        ws_stream,
        remote_addr: remote,
        early_data,
    };
    if tx.send(conn).await.is_err() {
        warn!("WebSocket connection channel closed");
    }
}

/// Decode early data carried in `sec-websocket-protocol`.
///
/// Accepts base64url or standard base64, padded or not. Empty or malformed
/// input is treated as absent.
pub fn decode_early_data(value: &str) -> Option<Vec<u8>> {
    let normalized: String = value
        .trim()
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            c => c,
        })
        .collect();
    if normalized.is_empty() {
        return None;
    }
    match URL_SAFE_NO_PAD.decode(normalized.as_bytes()) {
        Ok(bytes) if !bytes.is_empty() => Some(bytes),
        Ok(_) => None,
        Err(e) => {
            debug!(error = %e, "ignoring undecodable early data");
            None
        }
    }
}

/// Split a WebSocket into the chunk source/sink pair the session runs on.
pub fn split_connection<S>(
    ws_stream: WebSocketStream<S>,
    early_data: Option<Vec<u8>>,
) -> (WsIngress<S>, WsEgress<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (sink, stream) = ws_stream.split();
    (
        WsIngress {
            early_data,
            stream,
        },
        WsEgress {
            sink,
            closed: false,
        },
    )
}

/// Client → gateway chunks: early data first, then binary frames.
pub struct WsIngress<S> {
    early_data: Option<Vec<u8>>,
    stream: SplitStream<WebSocketStream<S>>,
}

impl<S> ChunkSource for WsIngress<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn next_chunk(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<Option<Vec<u8>>>> + Send + '_>> {
        Box::pin(async move {
            if let Some(early) = self.early_data.take() {
                return Ok(Some(early));
            }
            loop {
                match self.stream.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        if data.len() > MAX_WS_FRAME_SIZE {
                            return Err(GatewayError::Transport(format!(
                                "WS frame too large: {} bytes (max {})",
                                data.len(),
                                MAX_WS_FRAME_SIZE
                            )));
                        }
                        if data.is_empty() {
                            continue;
                        }
                        return Ok(Some(data));
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(None),
                    // Text, ping and pong carry no tunnel data
                    Some(Ok(_)) => continue,
                    Some(Err(WsError::ConnectionClosed)) => return Ok(None),
                    Some(Err(e)) => {
                        return Err(GatewayError::Transport(format!("WS recv failed: {e}")));
                    }
                }
            }
        })
    }
}

/// Gateway → client chunks, one binary frame each.
pub struct WsEgress<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
    closed: bool,
}

impl<S> ChunkSink for WsEgress<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn send_chunk(
        &mut self,
        data: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<()>> + Send + '_>> {
        Box::pin(async move {
            if self.closed {
                return Err(GatewayError::Transport("WS already closed".into()));
            }
            self.sink
                .send(Message::Binary(data))
                .await
                .map_err(|e| GatewayError::Transport(format!("WS send failed: {e}")))
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = GatewayResult<()>> + Send + '_>> {
        Box::pin(async move {
            if self.closed {
                return Ok(());
            }
            self.closed = true;
            match self.sink.close().await {
                Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
                Err(e) => Err(GatewayError::Transport(format!("WS close failed: {e}"))),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::user;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (a, b) = tokio::io::duplex(4 * 1024 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (server, client)
    }

    #[test]
    fn early_data_accepts_both_alphabets() {
        let bytes = vec![0xfb, 0xff, 0xfe, 0x00, 0x01];
        assert_eq!(decode_early_data("-__-AAE"), Some(bytes.clone()));
        assert_eq!(decode_early_data("+//+AAE="), Some(bytes));
        assert_eq!(decode_early_data("aGVsbG8"), Some(b"hello".to_vec()));
    }

    #[test]
    fn early_data_absent_on_empty_or_invalid() {
        assert_eq!(decode_early_data(""), None);
        assert_eq!(decode_early_data("   "), None);
        assert_eq!(decode_early_data("not base64!"), None);
        assert_eq!(decode_early_data("A"), None);
    }

    #[tokio::test]
    async fn ingress_yields_early_data_then_binary_frames() {
        let (server, mut client) = ws_pair().await;
        let (mut ingress, _egress) = split_connection(server, Some(b"early".to_vec()));

        client.send(Message::Text("ignored".into())).await.unwrap();
        client.send(Message::Binary(b"one".to_vec().into())).await.unwrap();
        client.send(Message::Binary(b"two".to_vec().into())).await.unwrap();
        client.close(None).await.unwrap();

        assert_eq!(ingress.next_chunk().await.unwrap(), Some(b"early".to_vec()));
        assert_eq!(ingress.next_chunk().await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(ingress.next_chunk().await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(ingress.next_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frame_is_transport_error() {
        let (server, mut client) = ws_pair().await;
        let (mut ingress, _egress) = split_connection(server, None);

        let big = vec![0u8; MAX_WS_FRAME_SIZE + 1];
        let sender = tokio::spawn(async move {
            let _ = client.send(Message::Binary(big.into())).await;
            client
        });

        let err = ingress.next_chunk().await.unwrap_err();
        assert!(matches!(err, GatewayError::Transport(_)));
        drop(sender.await.unwrap());
    }

    #[tokio::test]
    async fn egress_sends_binary_and_closes_once() {
        let (server, mut client) = ws_pair().await;
        let (_ingress, mut egress) = split_connection(server, None);

        egress.send_chunk(b"\x00\x00reply".to_vec()).await.unwrap();
        match client.next().await.unwrap().unwrap() {
            Message::Binary(data) => assert_eq!(data.to_vec(), b"\x00\x00reply"),
            other => panic!("expected binary frame, got {other:?}"),
        }

        egress.close().await.unwrap();
        egress.close().await.unwrap();
        assert!(egress.send_chunk(b"late".to_vec()).await.is_err());
        assert!(matches!(client.next().await, Some(Ok(Message::Close(_)))));
    }

    #[tokio::test]
    async fn listener_upgrades_and_captures_early_data() {
        let router = Arc::new(HttpRouter::new(user()));
        let (addr, mut rx) = start_listener("127.0.0.1:0".parse().unwrap(), router)
            .await
            .unwrap();

        let mut request = format!("ws://{addr}/?ed=2560").into_client_request().unwrap();
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("aGVsbG8"));
        let (mut client, response) = tokio_tungstenite::connect_async(request).await.unwrap();
        assert_eq!(
            response.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(),
            "aGVsbG8"
        );

        let conn = rx.recv().await.unwrap();
        assert_eq!(conn.early_data.as_deref(), Some(&b"hello"[..]));

        let (mut ingress, mut egress) = conn.split();
        assert_eq!(ingress.next_chunk().await.unwrap(), Some(b"hello".to_vec()));

        client.send(Message::Binary(b"ping".to_vec().into())).await.unwrap();
        assert_eq!(ingress.next_chunk().await.unwrap(), Some(b"ping".to_vec()));

        egress.send_chunk(b"pong".to_vec()).await.unwrap();
        match client.next().await.unwrap().unwrap() {
            Message::Binary(data) => assert_eq!(data.to_vec(), b"pong"),
            other => panic!("expected binary frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn listener_serves_plain_http() {
        let router = Arc::new(HttpRouter::new(user()));
        let (addr, _rx) = start_listener("127.0.0.1:0".parse().unwrap(), router)
            .await
            .unwrap();

        let mut sock = TcpStream::connect(addr).await.unwrap();
        sock.write_all(b"GET /nope HTTP/1.1\r\nHost: edge.test\r\n\r\n")
            .await
            .unwrap();
        let mut reply = String::new();
        sock.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }
}
