//! DNS-over-HTTPS forwarding.
//!
//! Each DNS query datagram becomes one `POST` carrying the raw wire-format
//! message (`application/dns-message`); the response body is the answer
//! datagram. There is no retry beyond what the HTTP client does itself.

use edgegate_core::{GatewayError, GatewayResult};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

const DNS_MESSAGE: &str = "application/dns-message";

/// One DNS query in, one DNS answer out.
pub trait DnsExchange: Send + Sync {
    fn exchange<'a>(
        &'a self,
        query: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = GatewayResult<Vec<u8>>> + Send + 'a>>;
}

impl<T: DnsExchange + ?Sized> DnsExchange for std::sync::Arc<T> {
    fn exchange<'a>(
        &'a self,
        query: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = GatewayResult<Vec<u8>>> + Send + 'a>> {
        (**self).exchange(query)
    }
}

/// DoH client bound to a single resolver URL.
#[derive(Debug, Clone)]
pub struct DohForwarder {
    client: reqwest::Client,
    url: reqwest::Url,
}

impl DohForwarder {
    /// Create a forwarder for `url`; `timeout` bounds each whole request.
    pub fn new(url: &str, timeout: Duration) -> GatewayResult<Self> {
        let url = reqwest::Url::parse(url)
            .map_err(|e| GatewayError::Config(format!("invalid DoH url {url}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }
}

impl DnsExchange for DohForwarder {
    fn exchange<'a>(
        &'a self,
        query: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = GatewayResult<Vec<u8>>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .client
                .post(self.url.clone())
                .header(CONTENT_TYPE, DNS_MESSAGE)
                .header(ACCEPT, DNS_MESSAGE)
                .body(query.to_vec())
                .send()
                .await
                .map_err(|e| GatewayError::Doh(format!("request failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                return Err(GatewayError::Doh(format!("resolver returned {status}")));
            }

            let body = response
                .bytes()
                .await
                .map_err(|e| GatewayError::Doh(format!("reading response failed: {e}")))?;
            debug!(query_len = query.len(), answer_len = body.len(), "DoH exchange done");
            Ok(body.to_vec())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Serve exactly one HTTP request; report (request head, body) and reply.
    async fn one_shot_resolver(
        status_line: &'static str,
        answer: &'static [u8],
    ) -> (String, oneshot::Receiver<(String, Vec<u8>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 1024];
            let head_end = loop {
                let n = sock.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            let head = String::from_utf8_lossy(&raw[..head_end]).to_lowercase();
            let len: usize = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .map(|v| v.trim().parse().unwrap())
                .unwrap_or(0);
            while raw.len() < head_end + len {
                let n = sock.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
            }
            let body = raw[head_end..head_end + len].to_vec();

            let reply = format!(
                "{status_line}\r\ncontent-type: application/dns-message\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                answer.len()
            );
            sock.write_all(reply.as_bytes()).await.unwrap();
            sock.write_all(answer).await.unwrap();
            let _ = tx.send((head, body));
        });

        (format!("http://{addr}/dns-query"), rx)
    }

    #[tokio::test]
    async fn posts_raw_query_and_returns_body() {
        let (url, seen) = one_shot_resolver("HTTP/1.1 200 OK", b"\x12\x34answer").await;
        let doh = DohForwarder::new(&url, Duration::from_secs(5)).unwrap();

        let answer = doh.exchange(b"\x12\x34query").await.unwrap();
        assert_eq!(answer, b"\x12\x34answer");

        let (head, body) = seen.await.unwrap();
        assert!(head.starts_with("post /dns-query"));
        assert!(head.contains("content-type: application/dns-message"));
        assert_eq!(body, b"\x12\x34query");
    }

    #[tokio::test]
    async fn non_success_status_is_doh_error() {
        let (url, _seen) = one_shot_resolver("HTTP/1.1 502 Bad Gateway", b"").await;
        let doh = DohForwarder::new(&url, Duration::from_secs(5)).unwrap();

        let err = doh.exchange(b"q").await.unwrap_err();
        assert!(matches!(err, GatewayError::Doh(_)));
    }

    #[tokio::test]
    async fn unreachable_resolver_is_doh_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let doh = DohForwarder::new(&format!("http://{addr}/dns-query"), Duration::from_secs(2))
            .unwrap();
        assert!(matches!(doh.exchange(b"q").await, Err(GatewayError::Doh(_))));
    }

    #[test]
    fn rejects_invalid_url() {
        assert!(DohForwarder::new("::::", Duration::from_secs(1)).is_err());
    }
}
