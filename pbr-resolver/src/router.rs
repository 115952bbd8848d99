//! Seam to the router's configuration interface, used to discover the DNS
//! upstreams the router itself forwards to.

use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamKind {
    Plain,
    PlainV6,
    DoT,
    DoH,
}

impl fmt::Display for UpstreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamKind::Plain => write!(f, "dns"),
            UpstreamKind::PlainV6 => write!(f, "dns6"),
            UpstreamKind::DoT => write!(f, "dot"),
            UpstreamKind::DoH => write!(f, "doh"),
        }
    }
}

/// One upstream as reported by the router.
///
/// DoT and DoH upstreams are terminated by a proxy on the router itself;
/// `proxy_host`/`port` point at that local proxy and `endpoint` names the
/// real destination for display purposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamDescriptor {
    pub kind: UpstreamKind,
    pub proxy_host: IpAddr,
    pub port: Option<u16>,
    pub endpoint: String,
    pub restricted_domain: Option<String>,
}

#[async_trait]
pub trait RouterClient: Send + Sync {
    async fn list_upstreams(&self) -> anyhow::Result<Vec<UpstreamDescriptor>>;
}
