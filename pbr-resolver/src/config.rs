//! Validated configuration consumed by [`Service`](crate::Service).
//!
//! The daemon deserializes this from a TOML file; tests construct it
//! literally. `validate` must pass before the config reaches the core.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use url::{Host, Url};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "defaults::listen_address")]
    pub listen_address: IpAddr,
    #[serde(default = "defaults::listen_port")]
    pub listen_port: u16,
    /// Default upstreams: `udp://host[:port]`, `doh://host/path` or the
    /// scheme-only `keenetic://` selecting the router-provided upstreams.
    pub upstreams: Vec<UpstreamUrl>,
    /// Strip AAAA answer records before any processing.
    #[serde(default)]
    pub drop_aaaa: bool,
    /// Added to the answer TTL for derived IP-set entries; 0 keeps the
    /// original TTL.
    #[serde(default)]
    pub ipset_additional_ttl_sec: u32,
    /// Cache TTL override for listed domains so clients re-resolve often and
    /// name-to-address churn is re-observed; 0 keeps the answer TTL.
    #[serde(default)]
    pub listed_domain_cache_ttl_sec: u32,
    #[serde(default = "defaults::max_cache_domains")]
    pub max_cache_domains: usize,
    #[serde(default)]
    pub lists: Vec<ListConfig>,
    #[serde(default)]
    pub ipsets: Vec<IpSetConfig>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: defaults::listen_address(),
            listen_port: defaults::listen_port(),
            upstreams: Vec::new(),
            drop_aaaa: false,
            ipset_additional_ttl_sec: 0,
            listed_domain_cache_ttl_sec: 0,
            max_cache_domains: defaults::max_cache_domains(),
            lists: Vec::new(),
            ipsets: Vec::new(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Config {
    pub fn listen(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, self.listen_port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstreams.is_empty() {
            return Err(ConfigError::NoUpstreams);
        }

        for list in &self.lists {
            let sources = [
                !list.hosts.is_empty(),
                list.file.is_some(),
                list.url.is_some(),
            ]
            .iter()
            .filter(|source| **source)
            .count();
            if sources != 1 {
                return Err(ConfigError::AmbiguousListSource(list.name.clone()));
            }
        }

        for ipset in &self.ipsets {
            for list_name in &ipset.lists {
                if !self.lists.iter().any(|list| &list.name == list_name) {
                    return Err(ConfigError::UnknownList {
                        ipset: ipset.name.clone(),
                        list: list_name.clone(),
                    });
                }
            }

            if ipset.dns.as_ref().is_some_and(|dns| dns.upstreams.is_empty()) {
                return Err(ConfigError::EmptyUpstreamOverride(ipset.name.clone()));
            }
        }

        Ok(())
    }

    /// Whether any configured upstream needs the router client.
    pub fn needs_router(&self) -> bool {
        let overrides = self
            .ipsets
            .iter()
            .filter_map(|ipset| ipset.dns.as_ref())
            .flat_map(|dns| &dns.upstreams);

        self.upstreams
            .iter()
            .chain(overrides)
            .any(|url| matches!(url, UpstreamUrl::Router))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListConfig {
    pub name: String,
    /// Inline entries; alternative to `file` and `url`.
    #[serde(default)]
    pub hosts: Vec<String>,
    pub file: Option<PathBuf>,
    /// Download source; the list store resolves this to an on-disk file
    /// maintained by the list updater.
    pub url: Option<Url>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IpSetConfig {
    pub name: String,
    pub family: IpFamily,
    pub lists: Vec<String>,
    pub dns: Option<IpSetDnsConfig>,
}

/// Per-IP-set DNS overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IpSetDnsConfig {
    /// Consulted instead of the default upstreams for names matching this
    /// IP set's patterns.
    pub upstreams: Vec<UpstreamUrl>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn matches(&self, ip: IpAddr) -> bool {
        match self {
            IpFamily::V4 => ip.is_ipv4(),
            IpFamily::V6 => ip.is_ipv6(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    #[serde(default = "defaults::upstream_query_sec")]
    pub upstream_query_sec: u64,
    #[serde(default = "defaults::tcp_connection_sec")]
    pub tcp_connection_sec: u64,
    #[serde(default = "defaults::cleanup_interval_sec")]
    pub cleanup_interval_sec: u64,
    #[serde(default = "defaults::provider_refresh_sec")]
    pub provider_refresh_sec: u64,
    #[serde(default = "defaults::max_message_size")]
    pub max_message_size: usize,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            upstream_query_sec: defaults::upstream_query_sec(),
            tcp_connection_sec: defaults::tcp_connection_sec(),
            cleanup_interval_sec: defaults::cleanup_interval_sec(),
            provider_refresh_sec: defaults::provider_refresh_sec(),
            max_message_size: defaults::max_message_size(),
        }
    }
}

impl TimeoutConfig {
    pub fn upstream_query(&self) -> Duration {
        Duration::from_secs(self.upstream_query_sec)
    }

    pub fn tcp_connection(&self) -> Duration {
        Duration::from_secs(self.tcp_connection_sec)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_sec)
    }

    pub fn provider_refresh(&self) -> Duration {
        Duration::from_secs(self.provider_refresh_sec)
    }
}

mod defaults {
    use std::net::{IpAddr, Ipv6Addr};

    pub(super) fn listen_address() -> IpAddr {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    }

    pub(super) fn listen_port() -> u16 {
        15353
    }

    pub(super) fn max_cache_domains() -> usize {
        1000
    }

    pub(super) fn upstream_query_sec() -> u64 {
        10
    }

    pub(super) fn tcp_connection_sec() -> u64 {
        15
    }

    pub(super) fn cleanup_interval_sec() -> u64 {
        60
    }

    pub(super) fn provider_refresh_sec() -> u64 {
        60
    }

    pub(super) fn max_message_size() -> usize {
        4096
    }
}

/// A parsed upstream URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamUrl {
    Udp { server: SocketAddr },
    Doh { url: Url },
    /// Expand the router's own upstreams at runtime.
    Router,
}

impl FromStr for UpstreamUrl {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.strip_prefix("keenetic://").is_some() {
            return Ok(UpstreamUrl::Router);
        }

        if s.starts_with("udp://") {
            let url = Url::parse(s).map_err(|source| ConfigError::InvalidUrl {
                url: s.to_owned(),
                source,
            })?;

            // Resolving a hostname for our own upstream would need a
            // bootstrap resolver, so only IP literals are accepted.
            let ip = match url.host() {
                Some(Host::Ipv4(ip)) => IpAddr::V4(ip),
                Some(Host::Ipv6(ip)) => IpAddr::V6(ip),
                Some(Host::Domain(domain)) => domain
                    .parse::<IpAddr>()
                    .map_err(|_| ConfigError::HostNotIp(s.to_owned()))?,
                None => return Err(ConfigError::HostNotIp(s.to_owned())),
            };

            return Ok(UpstreamUrl::Udp {
                server: SocketAddr::new(ip, url.port().unwrap_or(53)),
            });
        }

        if let Some(rest) = s.strip_prefix("doh") {
            let https = format!("https{rest}");
            let url = Url::parse(&https).map_err(|source| ConfigError::InvalidUrl {
                url: s.to_owned(),
                source,
            })?;

            if url.host_str().is_none() {
                return Err(ConfigError::InvalidUrl {
                    url: s.to_owned(),
                    source: url::ParseError::EmptyHost,
                });
            }

            return Ok(UpstreamUrl::Doh { url });
        }

        Err(ConfigError::UnsupportedScheme(s.to_owned()))
    }
}

impl fmt::Display for UpstreamUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamUrl::Udp { server } => write!(f, "udp://{server}"),
            UpstreamUrl::Doh { url } => write!(f, "{url}"),
            UpstreamUrl::Router => write!(f, "keenetic://"),
        }
    }
}

impl<'de> Deserialize<'de> for UpstreamUrl {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        String::deserialize(deserializer)?
            .parse::<Self>()
            .map_err(D::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no upstreams configured")]
    NoUpstreams,
    #[error("upstream URL '{0}' has an unsupported scheme")]
    UnsupportedScheme(String),
    #[error("upstream URL '{url}' is invalid: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("udp:// upstream host must be an IP literal: '{0}'")]
    HostNotIp(String),
    #[error("list '{0}' must declare exactly one of hosts, file or url")]
    AmbiguousListSource(String),
    #[error("ipset '{ipset}' references unknown list '{list}'")]
    UnknownList { ipset: String, list: String },
    #[error("ipset '{0}' declares a dns override without upstreams")]
    EmptyUpstreamOverride(String),
}
