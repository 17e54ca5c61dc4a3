//! Gateway configuration: TOML file + CLI / environment overrides.
//!
//! Resolved once at startup into an immutable [`GatewayConfig`] that is shared
//! read-only by every session.

use edgegate_core::{GatewayError, GatewayResult, UserId};
use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Port assumed for a proxy endpoint written without one.
pub const DEFAULT_ENDPOINT_PORT: u16 = 443;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub dns: DnsSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            max_sessions: default_max_sessions(),
        }
    }
}

/// `[gateway]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub proxy_endpoints: Vec<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            user_id: None,
            proxy_endpoints: Vec::new(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// `[dns]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsSection {
    #[serde(default = "default_doh_url")]
    pub doh_url: String,
    #[serde(default = "default_doh_timeout")]
    pub timeout_secs: u64,
}

impl Default for DnsSection {
    fn default() -> Self {
        Self {
            doh_url: default_doh_url(),
            timeout_secs: default_doh_timeout(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_sessions() -> usize {
    1024
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_doh_url() -> String {
    "https://cloudflare-dns.com/dns-query".to_string()
}
fn default_doh_timeout() -> u64 {
    10
}

/// A fallback destination tried when the direct connection fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`. The port defaults to 443.
    pub fn parse(s: &str) -> GatewayResult<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(GatewayError::Config("empty proxy endpoint".into()));
        }

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(|| {
                GatewayError::Config(format!("unterminated IPv6 literal in endpoint: {s}"))
            })?;
            let port = match after {
                "" => None,
                p => Some(p.strip_prefix(':').ok_or_else(|| {
                    GatewayError::Config(format!("invalid proxy endpoint: {s}"))
                })?),
            };
            (host, port)
        } else if s.matches(':').count() > 1 {
            // bare IPv6 literal, no port
            (s, None)
        } else {
            match s.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        };

        if host.is_empty() {
            return Err(GatewayError::Config(format!("missing host in endpoint: {s}")));
        }
        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|e| GatewayError::Config(format!("invalid port in endpoint {s}: {e}")))?,
            None => DEFAULT_ENDPOINT_PORT,
        };

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Values supplied on the command line or through the environment.
///
/// Each one that is set replaces the file value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub listen: Option<String>,
    pub port: Option<u16>,
    pub max_sessions: Option<usize>,
    pub user_id: Option<String>,
    pub proxy_endpoints: Vec<String>,
    pub connect_timeout_secs: Option<u64>,
    pub doh_url: Option<String>,
}

/// Resolved gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub max_sessions: usize,
    pub user_id: UserId,
    pub proxy_endpoints: Vec<ProxyEndpoint>,
    pub connect_timeout: Duration,
    pub doh_url: String,
    pub doh_timeout: Duration,
}

impl GatewayConfig {
    /// Load config from TOML file, then apply overrides.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> GatewayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| GatewayError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, overrides)
    }

    /// Merge overrides into a parsed file and validate the result.
    pub fn resolve(file: ConfigFile, overrides: ConfigOverrides) -> GatewayResult<Self> {
        let listen = overrides.listen.unwrap_or(file.server.listen);
        let listen_ip: IpAddr = listen
            .parse()
            .map_err(|e| GatewayError::Config(format!("invalid listen address {listen}: {e}")))?;
        let port = overrides.port.unwrap_or(file.server.port);

        let user_id_str = overrides
            .user_id
            .or(file.gateway.user_id)
            .ok_or_else(|| GatewayError::Config("gateway.user_id must be set".into()))?;
        let user_id = UserId::parse(&user_id_str)?;

        let endpoint_strs = if overrides.proxy_endpoints.is_empty() {
            file.gateway.proxy_endpoints
        } else {
            overrides.proxy_endpoints
        };
        let proxy_endpoints = endpoint_strs
            .iter()
            .flat_map(|s| s.split(','))
            .filter(|s| !s.trim().is_empty())
            .map(ProxyEndpoint::parse)
            .collect::<GatewayResult<Vec<_>>>()?;

        let doh_url = overrides.doh_url.unwrap_or(file.dns.doh_url);
        reqwest::Url::parse(&doh_url)
            .map_err(|e| GatewayError::Config(format!("invalid DoH url {doh_url}: {e}")))?;

        let connect_timeout_secs = overrides
            .connect_timeout_secs
            .unwrap_or(file.gateway.connect_timeout_secs);
        if connect_timeout_secs == 0 {
            return Err(GatewayError::Config("connect timeout must be positive".into()));
        }

        Ok(Self {
            listen_addr: SocketAddr::new(listen_ip, port),
            max_sessions: overrides.max_sessions.unwrap_or(file.server.max_sessions),
            user_id,
            proxy_endpoints,
            connect_timeout: Duration::from_secs(connect_timeout_secs),
            doh_url,
            doh_timeout: Duration::from_secs(file.dns.timeout_secs),
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "86c50e3a-5b87-49dd-bd20-03c7f2735e40";

    fn with_user() -> ConfigOverrides {
        ConfigOverrides {
            user_id: Some(ID.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn endpoint_forms() {
        assert_eq!(
            ProxyEndpoint::parse("ts.hpc.tw").unwrap(),
            ProxyEndpoint::new("ts.hpc.tw", 443)
        );
        assert_eq!(
            ProxyEndpoint::parse("10.0.0.1:2053").unwrap(),
            ProxyEndpoint::new("10.0.0.1", 2053)
        );
        assert_eq!(
            ProxyEndpoint::parse("[2001:db8::1]:8443").unwrap(),
            ProxyEndpoint::new("2001:db8::1", 8443)
        );
        assert_eq!(
            ProxyEndpoint::parse("[2001:db8::1]").unwrap(),
            ProxyEndpoint::new("2001:db8::1", 443)
        );
        assert_eq!(
            ProxyEndpoint::parse("2001:db8::1").unwrap(),
            ProxyEndpoint::new("2001:db8::1", 443)
        );
    }

    #[test]
    fn endpoint_errors() {
        assert!(ProxyEndpoint::parse("").is_err());
        assert!(ProxyEndpoint::parse("host:notaport").is_err());
        assert!(ProxyEndpoint::parse("[::1").is_err());
        assert!(ProxyEndpoint::parse("[::1]x").is_err());
        assert!(ProxyEndpoint::parse(":443").is_err());
    }

    #[test]
    fn endpoint_display_brackets_v6() {
        assert_eq!(ProxyEndpoint::new("::1", 443).to_string(), "[::1]:443");
        assert_eq!(ProxyEndpoint::new("a.test", 80).to_string(), "a.test:80");
    }

    #[test]
    fn defaults_apply() {
        let cfg = GatewayConfig::resolve(ConfigFile::default(), with_user()).unwrap();
        assert_eq!(cfg.listen_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(cfg.connect_timeout, Duration::from_secs(5));
        assert_eq!(cfg.doh_url, "https://cloudflare-dns.com/dns-query");
        assert!(cfg.proxy_endpoints.is_empty());
        assert_eq!(cfg.user_id.to_string(), ID);
    }

    #[test]
    fn toml_file_is_parsed() {
        let file: ConfigFile = toml::from_str(
            r#"
            [server]
            port = 9000

            [gateway]
            user_id = "86c50e3a-5b87-49dd-bd20-03c7f2735e40"
            proxy_endpoints = ["a.test", "[::1]:8443"]
            connect_timeout_secs = 2

            [dns]
            doh_url = "https://dns.example/dns-query"
            "#,
        )
        .unwrap();
        let cfg = GatewayConfig::resolve(file, ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.listen_addr.port(), 9000);
        assert_eq!(
            cfg.proxy_endpoints,
            vec![ProxyEndpoint::new("a.test", 443), ProxyEndpoint::new("::1", 8443)]
        );
        assert_eq!(cfg.connect_timeout, Duration::from_secs(2));
        assert_eq!(cfg.doh_url, "https://dns.example/dns-query");
    }

    #[test]
    fn overrides_win_and_split_on_commas() {
        let file: ConfigFile = toml::from_str(
            r#"
            [gateway]
            proxy_endpoints = ["file.test"]
            "#,
        )
        .unwrap();
        let overrides = ConfigOverrides {
            port: Some(1234),
            proxy_endpoints: vec!["a.test:1, b.test:2".to_string()],
            ..with_user()
        };
        let cfg = GatewayConfig::resolve(file, overrides).unwrap();
        assert_eq!(cfg.listen_addr.port(), 1234);
        assert_eq!(
            cfg.proxy_endpoints,
            vec![ProxyEndpoint::new("a.test", 1), ProxyEndpoint::new("b.test", 2)]
        );
    }

    #[test]
    fn missing_or_invalid_user_id_fails() {
        assert!(matches!(
            GatewayConfig::resolve(ConfigFile::default(), ConfigOverrides::default()),
            Err(GatewayError::Config(_))
        ));
        let bad = ConfigOverrides {
            user_id: Some("550e8400-e29b-11d4-a716-446655440000".into()),
            ..Default::default()
        };
        assert!(GatewayConfig::resolve(ConfigFile::default(), bad).is_err());
    }

    #[test]
    fn invalid_doh_url_fails() {
        let overrides = ConfigOverrides {
            doh_url: Some("not a url".into()),
            ..with_user()
        };
        assert!(GatewayConfig::resolve(ConfigFile::default(), overrides).is_err());
    }

    #[test]
    fn missing_file_uses_defaults() {
        let path = Path::new("/nonexistent/edgegate/config.toml");
        let cfg = GatewayConfig::load(Some(path), with_user()).unwrap();
        assert_eq!(cfg.max_sessions, 1024);
    }
}
