//! Plain HTTP handling for requests that are not WebSocket upgrades.
//!
//! The listener reads the request head itself so it can decide between the
//! WebSocket handshake and these routes:
//!
//! - `GET /` → short status line
//! - `GET /{userId}` → `vless://` share link for this gateway
//! - anything else → 404

use edgegate_core::{GatewayError, GatewayResult, UserId};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest request head accepted before the connection is dropped.
pub const MAX_HEAD_SIZE: usize = 8 * 1024;

/// Time allowed for a client to send its request head.
pub const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Path advertised in share links; `ed` is the early-data budget clients use.
const SHARE_PATH: &str = "%2F%3Fed%3D2560";

/// Parsed request line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parse a head ending in `\r\n\r\n`. Header names are kept lowercase.
    pub fn parse(raw: &[u8]) -> GatewayResult<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| GatewayError::Protocol("request head is not UTF-8".into()))?;
        let mut lines = text.split("\r\n");

        let request_line = lines
            .next()
            .ok_or_else(|| GatewayError::Protocol("empty request".into()))?;
        let mut parts = request_line.split_whitespace();
        let (method, path) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(p), Some(v)) if v.starts_with("HTTP/") => (m, p),
            _ => {
                return Err(GatewayError::Protocol(format!(
                    "malformed request line: {request_line}"
                )))
            }
        };

        let mut headers = Vec::new();
        for line in lines.take_while(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| GatewayError::Protocol(format!("malformed header: {line}")))?;
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }

        Ok(Self {
            method: method.to_string(),
            path: path.to_string(),
            headers,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    }

    /// Host name from the `Host` header, without port.
    pub fn host(&self) -> Option<&str> {
        let host = self.header("host")?;
        let name = match host.strip_prefix('[') {
            Some(rest) => rest.split(']').next().unwrap_or(""),
            None => host.split(':').next().unwrap_or(host),
        };
        (!name.is_empty()).then_some(name)
    }

    fn path_without_query(&self) -> &str {
        self.path.split('?').next().unwrap_or(&self.path)
    }
}

/// Read from `reader` until the end of the request head.
///
/// Returns every byte read, which may include data past the head.
pub async fn read_request_head<R: AsyncRead + Unpin>(reader: &mut R) -> GatewayResult<Vec<u8>> {
    let mut raw = Vec::with_capacity(1024);
    let mut buf = [0u8; 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(GatewayError::Protocol(
                "connection closed before request head".into(),
            ));
        }
        raw.extend_from_slice(&buf[..n]);
        if head_end(&raw).is_some() {
            return Ok(raw);
        }
        if raw.len() > MAX_HEAD_SIZE {
            return Err(GatewayError::Protocol(format!(
                "request head exceeds {MAX_HEAD_SIZE} bytes"
            )));
        }
    }
}

/// Offset just past `\r\n\r\n`, if present.
pub fn head_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// A complete plain-text response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: &'static str,
    pub body: String,
}

impl HttpResponse {
    fn text(status: u16, reason: &'static str, body: impl Into<String>) -> Self {
        Self {
            status,
            reason,
            body: body.into(),
        }
    }

    pub fn not_found() -> Self {
        Self::text(404, "Not Found", "not found\n")
    }

    pub fn internal_error() -> Self {
        Self::text(500, "Internal Server Error", "internal error\n")
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!(
            "HTTP/1.1 {} {}\r\ncontent-type: text/plain; charset=utf-8\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            self.status,
            self.reason,
            self.body.len(),
            self.body
        )
        .into_bytes()
    }
}

/// Routes non-upgrade requests.
#[derive(Debug, Clone)]
pub struct HttpRouter {
    user_id: UserId,
}

impl HttpRouter {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }

    pub fn route(&self, head: &RequestHead) -> HttpResponse {
        if head.method != "GET" {
            return HttpResponse::not_found();
        }
        let path = head.path_without_query();
        if path == "/" {
            return HttpResponse::text(200, "OK", "edgegate is running\n");
        }

        let id = self.user_id.to_string();
        match path.strip_prefix('/') {
            Some(p) if p.eq_ignore_ascii_case(&id) => match head.host() {
                Some(host) => HttpResponse::text(200, "OK", share_link(&id, host) + "\n"),
                None => HttpResponse::text(400, "Bad Request", "missing host header\n"),
            },
            _ => HttpResponse::not_found(),
        }
    }
}

/// Client share link for a gateway reachable at `host` over TLS on 443.
pub fn share_link(user_id: &str, host: &str) -> String {
    format!(
        "vless://{user_id}@{host}:443?encryption=none&security=tls&sni={host}&fp=random&type=ws&host={host}&path={SHARE_PATH}#{host}"
    )
}
