use thiserror::Error;

/// Errors produced by the edgegate protocol and gateway layers.
///
/// Every error is local to the session that produced it.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// userId mismatch or a header prefix that never arrived.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Unsupported command, unknown address type, UDP to a non-DNS port.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The direct target and every fallback endpoint failed.
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("DNS-over-HTTPS error: {0}")]
    Doh(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    /// Short label used in structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Auth(_) => "auth",
            GatewayError::Protocol(_) => "protocol",
            GatewayError::Connect(_) => "connect",
            GatewayError::Transport(_) => "transport",
            GatewayError::Doh(_) => "doh",
            GatewayError::Config(_) => "config",
            GatewayError::Io(_) => "io",
            GatewayError::Other(_) => "other",
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
