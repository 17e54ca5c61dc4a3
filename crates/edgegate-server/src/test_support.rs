//! In-memory doubles shared by the unit tests.

use crate::gateway::{DnsExchange, Dialer};
use edgegate_core::{ChunkSink, ChunkSource, GatewayError, GatewayResult, UserId};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

pub const USER_ID: &str = "86c50e3a-5b87-49dd-bd20-03c7f2735e40";

pub fn user() -> UserId {
    UserId::parse(USER_ID).unwrap()
}

/// Dialer that records every attempt and hands the far end of each
/// successful connection to the test.
///
/// Hosts starting with `hang` never complete; hosts not listed as reachable
/// are refused.
pub struct RecordingDialer {
    reachable: Vec<(String, u16)>,
    attempts: Mutex<Vec<(String, u16)>>,
    peers: mpsc::UnboundedSender<DuplexStream>,
}

impl RecordingDialer {
    pub fn new(reachable: &[(&str, u16)]) -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dialer = Self {
            reachable: reachable
                .iter()
                .map(|(h, p)| (h.to_string(), *p))
                .collect(),
            attempts: Mutex::new(Vec::new()),
            peers: tx,
        };
        (dialer, rx)
    }

    pub fn attempts(&self) -> Vec<(String, u16)> {
        self.attempts.lock().unwrap().clone()
    }
}

impl Dialer for RecordingDialer {
    type Stream = DuplexStream;

    fn dial<'a>(
        &'a self,
        host: &'a str,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = io::Result<DuplexStream>> + Send + 'a>> {
        self.attempts.lock().unwrap().push((host.to_string(), port));
        let reachable = self.reachable.iter().any(|(h, p)| h == host && *p == port);
        let hang = host.starts_with("hang");
        Box::pin(async move {
            if hang {
                std::future::pending::<()>().await;
            }
            if !reachable {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            let (near, far) = tokio::io::duplex(64 * 1024);
            let _ = self.peers.send(far);
            Ok(near)
        })
    }
}

/// Chunk source fed from a channel; dropping the sender ends the stream.
pub struct ChannelSource(pub mpsc::UnboundedReceiver<GatewayResult<Vec<u8>>>);

impl ChannelSource {
    pub fn new() -> (mpsc::UnboundedSender<GatewayResult<Vec<u8>>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self(rx))
    }
}

impl ChunkSource for ChannelSource {
    fn next_chunk(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<Option<Vec<u8>>>> + Send + '_>> {
        Box::pin(async move { self.0.recv().await.transpose() })
    }
}

/// Chunk sink that forwards into a channel; `close` drops the sender.
pub struct ChannelSink {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    pub closes: usize,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(tx),
                closes: 0,
            },
            rx,
        )
    }
}

impl ChunkSink for ChannelSink {
    fn send_chunk(
        &mut self,
        data: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<()>> + Send + '_>> {
        let result = match &self.tx {
            Some(tx) => tx
                .send(data)
                .map_err(|_| GatewayError::Transport("client gone".into())),
            None => Err(GatewayError::Transport("sink closed".into())),
        };
        Box::pin(async move { result })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = GatewayResult<()>> + Send + '_>> {
        self.closes += 1;
        self.tx = None;
        Box::pin(async { Ok(()) })
    }
}

/// DoH double: answers each query with `answer-of:` + query, counting requests.
///
/// With `stall` set, every exchange is counted and then never resolves.
#[derive(Default)]
pub struct FakeDns {
    pub requests: AtomicUsize,
    pub fail: bool,
    pub stall: bool,
}

impl FakeDns {
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl DnsExchange for FakeDns {
    fn exchange<'a>(
        &'a self,
        query: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = GatewayResult<Vec<u8>>> + Send + 'a>> {
        Box::pin(async move {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if self.stall {
                std::future::pending::<()>().await;
            }
            if self.fail {
                return Err(GatewayError::Doh("resolver returned 502 Bad Gateway".into()));
            }
            let mut answer = b"answer-of:".to_vec();
            answer.extend_from_slice(query);
            Ok(answer)
        })
    }
}
