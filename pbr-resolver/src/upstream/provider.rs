//! Dynamic upstream discovery.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;

use super::{UdpUpstream, Upstream};
use crate::router::{RouterClient, UpstreamDescriptor, UpstreamKind};

/// A source of upstreams that changes over time; expanded on start and then
/// on every refresh tick.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn expand(&self) -> anyhow::Result<Vec<Arc<dyn Upstream>>>;

    fn describe(&self) -> String;
}

/// Expands the DNS upstreams configured on the router itself.
///
/// Encrypted upstreams (DoT/DoH) are terminated by a proxy on the router, so
/// everything this provider yields is a plain UDP upstream.
pub struct RouterUpstreamProvider {
    client: Arc<dyn RouterClient>,
}

impl RouterUpstreamProvider {
    pub fn new(client: Arc<dyn RouterClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Provider for RouterUpstreamProvider {
    async fn expand(&self) -> anyhow::Result<Vec<Arc<dyn Upstream>>> {
        let descriptors = self.client.list_upstreams().await?;

        let mut upstreams: Vec<Arc<dyn Upstream>> = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let Some(upstream) = upstream_from_descriptor(&descriptor) else {
                continue;
            };

            upstreams.push(Arc::new(upstream));
        }

        Ok(upstreams)
    }

    fn describe(&self) -> String {
        "keenetic://".to_owned()
    }
}

fn upstream_from_descriptor(descriptor: &UpstreamDescriptor) -> Option<UdpUpstream> {
    let restriction = descriptor
        .restricted_domain
        .as_deref()
        .map(dns_types::normalize);

    match descriptor.kind {
        UpstreamKind::Plain | UpstreamKind::PlainV6 => {
            let Some(server) = parse_endpoint(&descriptor.endpoint) else {
                tracing::warn!(endpoint = %descriptor.endpoint, "Unparseable upstream endpoint, skipping");
                return None;
            };

            Some(UdpUpstream::new(server).with_restriction(restriction))
        }
        UpstreamKind::DoT | UpstreamKind::DoH => {
            let Some(port) = descriptor.port else {
                tracing::warn!(
                    kind = %descriptor.kind,
                    endpoint = %descriptor.endpoint,
                    "Proxied upstream without a local port, skipping"
                );
                return None;
            };

            let server = SocketAddr::new(descriptor.proxy_host, port);
            let label = format!("udp://{server} ({} {})", descriptor.kind, descriptor.endpoint);

            Some(
                UdpUpstream::new(server)
                    .with_restriction(restriction)
                    .with_label(label),
            )
        }
    }
}

fn parse_endpoint(endpoint: &str) -> Option<SocketAddr> {
    if let Ok(server) = endpoint.parse::<SocketAddr>() {
        return Some(server);
    }

    endpoint
        .parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, 53))
}
