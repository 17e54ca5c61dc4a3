//! Tunnel request header: parsing, authentication and the response header.
//!
//! Wire format (integers big-endian):
//!
//! ```text
//! [version:1][user_id:16][opt_len:1][options:opt_len]
//! [command:1][port:2][addr_type:1][address:4 | 1+len | 16][payload...]
//! ```
//!
//! The decoder accumulates bytes across chunks, so the header may be split at
//! any byte boundary. The user id is checked as soon as the 18-byte prefix is
//! available, before waiting for the rest of the header.

use crate::error::{GatewayError, GatewayResult};
use crate::identity::UserId;
use crate::transport::ChunkSource;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// version + user id + options length.
pub const PREFIX_LEN: usize = 1 + UserId::LEN + 1;

pub const COMMAND_TCP: u8 = 1;
pub const COMMAND_UDP: u8 = 2;
/// Multiplexed sub-connections. Recognised only to be rejected.
pub const COMMAND_MUX: u8 = 3;

pub const ADDR_TYPE_IPV4: u8 = 1;
pub const ADDR_TYPE_DOMAIN: u8 = 2;
pub const ADDR_TYPE_IPV6: u8 = 3;

/// What the client asks the gateway to do with the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Tcp,
    Udp,
}

impl Command {
    pub fn from_byte(b: u8) -> GatewayResult<Self> {
        match b {
            COMMAND_TCP => Ok(Command::Tcp),
            COMMAND_UDP => Ok(Command::Udp),
            COMMAND_MUX => Err(GatewayError::Protocol(
                "multiplexed connections are not supported".into(),
            )),
            other => Err(GatewayError::Protocol(format!(
                "unsupported command: {other}"
            ))),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Command::Tcp => COMMAND_TCP,
            Command::Udp => COMMAND_UDP,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Tcp => f.write_str("tcp"),
            Command::Udp => f.write_str("udp"),
        }
    }
}

/// Destination address. Its wire length is fixed by the variant alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Domain(String),
    Ipv6(Ipv6Addr),
}

impl Address {
    /// Host string suitable for dialing (IPv6 without brackets).
    pub fn host(&self) -> String {
        match self {
            Address::Ipv4(ip) => ip.to_string(),
            Address::Domain(name) => name.clone(),
            Address::Ipv6(ip) => ip.to_string(),
        }
    }

    pub fn address_type(&self) -> u8 {
        match self {
            Address::Ipv4(_) => ADDR_TYPE_IPV4,
            Address::Domain(_) => ADDR_TYPE_DOMAIN,
            Address::Ipv6(_) => ADDR_TYPE_IPV6,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip) => write!(f, "{ip}"),
            Address::Domain(name) => f.write_str(name),
            Address::Ipv6(ip) => write!(f, "[{ip}]"),
        }
    }
}

/// A fully parsed request header. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub version: u8,
    pub user_id: UserId,
    pub command: Command,
    pub port: u16,
    pub address: Address,
}

impl RequestHeader {
    pub fn host(&self) -> String {
        self.address.host()
    }

    /// `host:port` for logging (IPv6 bracketed).
    pub fn target(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Serialize into wire form, with the given reserved option bytes.
    pub fn encode(&self, options: &[u8]) -> GatewayResult<Vec<u8>> {
        if options.len() > u8::MAX as usize {
            return Err(GatewayError::Protocol(format!(
                "options too long: {} bytes",
                options.len()
            )));
        }

        let mut out = Vec::with_capacity(PREFIX_LEN + options.len() + 4 + 17);
        out.push(self.version);
        out.extend_from_slice(self.user_id.as_bytes());
        out.push(options.len() as u8);
        out.extend_from_slice(options);
        out.push(self.command.as_byte());
        out.extend_from_slice(&self.port.to_be_bytes());
        out.push(self.address.address_type());
        match &self.address {
            Address::Ipv4(ip) => out.extend_from_slice(&ip.octets()),
            Address::Domain(name) => {
                if name.is_empty() || name.len() > u8::MAX as usize {
                    return Err(GatewayError::Protocol(format!(
                        "domain length out of range: {}",
                        name.len()
                    )));
                }
                out.push(name.len() as u8);
                out.extend_from_slice(name.as_bytes());
            }
            Address::Ipv6(ip) => out.extend_from_slice(&ip.octets()),
        }
        Ok(out)
    }
}

/// The fixed 2-byte header sent once before the first reply byte.
pub fn response_header(version: u8) -> [u8; 2] {
    [version, 0]
}

/// Incremental header decoder.
///
/// Feed chunks as they arrive; yields the header plus any payload bytes that
/// followed it in the same chunk.
#[derive(Debug)]
pub struct HeaderDecoder {
    expected: UserId,
    buffer: Vec<u8>,
    authenticated: bool,
}

impl HeaderDecoder {
    pub fn new(expected: UserId) -> Self {
        Self {
            expected,
            buffer: Vec::new(),
            authenticated: false,
        }
    }

    /// Feed bytes. `Ok(None)` means more bytes are needed.
    pub fn feed(&mut self, data: &[u8]) -> GatewayResult<Option<(RequestHeader, Vec<u8>)>> {
        self.buffer.extend_from_slice(data);

        if self.buffer.len() < PREFIX_LEN {
            return Ok(None);
        }

        if !self.authenticated {
            if !self.expected.matches(&self.buffer[1..1 + UserId::LEN]) {
                return Err(GatewayError::Auth("user id mismatch".into()));
            }
            self.authenticated = true;
        }

        let buf = &self.buffer;
        let version = buf[0];
        let mut pos = PREFIX_LEN + buf[PREFIX_LEN - 1] as usize;

        // command, port, address type
        let Some(fixed) = buf.get(pos..pos + 4) else {
            return Ok(None);
        };
        let command = Command::from_byte(fixed[0])?;
        let port = u16::from_be_bytes([fixed[1], fixed[2]]);
        let addr_type = fixed[3];
        pos += 4;

        let address = match addr_type {
            ADDR_TYPE_IPV4 => {
                let Some(raw) = buf.get(pos..pos + 4) else {
                    return Ok(None);
                };
                pos += 4;
                Address::Ipv4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))
            }
            ADDR_TYPE_DOMAIN => {
                let Some(&len) = buf.get(pos) else {
                    return Ok(None);
                };
                if len == 0 {
                    return Err(GatewayError::Protocol("empty domain name".into()));
                }
                let Some(raw) = buf.get(pos + 1..pos + 1 + len as usize) else {
                    return Ok(None);
                };
                pos += 1 + len as usize;
                let name = std::str::from_utf8(raw).map_err(|_| {
                    GatewayError::Protocol("domain name is not valid UTF-8".into())
                })?;
                Address::Domain(name.to_string())
            }
            ADDR_TYPE_IPV6 => {
                let Some(raw) = buf.get(pos..pos + 16) else {
                    return Ok(None);
                };
                pos += 16;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(raw);
                Address::Ipv6(Ipv6Addr::from(octets))
            }
            other => {
                return Err(GatewayError::Protocol(format!(
                    "unknown address type: {other}"
                )));
            }
        };

        let header = RequestHeader {
            version,
            user_id: self.expected,
            command,
            port,
            address,
        };
        let leftover = self.buffer.split_off(pos);
        self.buffer.clear();
        Ok(Some((header, leftover)))
    }

    /// The error to report when the stream ends before the header is complete.
    pub fn truncated(&self) -> GatewayError {
        if self.authenticated {
            GatewayError::Protocol(format!(
                "stream ended inside header after {} bytes",
                self.buffer.len()
            ))
        } else {
            GatewayError::Auth(format!(
                "malformed header prefix ({} of {} bytes)",
                self.buffer.len(),
                PREFIX_LEN
            ))
        }
    }
}

/// Read and authenticate the header from the front of `source`.
///
/// Returns the header and the payload bytes that arrived along with it.
pub async fn read_header<S: ChunkSource + ?Sized>(
    source: &mut S,
    expected: UserId,
) -> GatewayResult<(RequestHeader, Vec<u8>)> {
    let mut decoder = HeaderDecoder::new(expected);
    loop {
        match source.next_chunk().await? {
            Some(chunk) => {
                if let Some(parsed) = decoder.feed(&chunk)? {
                    return Ok(parsed);
                }
            }
            None => return Err(decoder.truncated()),
        }
    }
}
