//! Router client speaking the Keenetic RCI: the router's `show/dns-proxy`
//! JSON names the upstreams (and local DoT/DoH proxies) it forwards to.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use pbr_resolver::{RouterClient, UpstreamDescriptor, UpstreamKind};
use serde::Deserialize;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RciClient {
    base: Url,
    http: reqwest::Client,
}

impl RciClient {
    pub fn new(base: Url) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build RCI HTTP client")?;

        Ok(Self { base, http })
    }
}

#[derive(Debug, Deserialize)]
struct DnsProxyStatus {
    #[serde(default, rename = "proxy-server")]
    servers: Vec<ProxyServer>,
}

#[derive(Debug, Deserialize)]
struct ProxyServer {
    /// `dns`, `dns6`, `dot` or `doh`.
    #[serde(rename = "type")]
    kind: String,
    /// Local proxy endpoint for encrypted upstreams, `host:port`.
    #[serde(default)]
    proxy: Option<String>,
    /// Upstream endpoint as configured on the router.
    endpoint: String,
    /// Restrict this upstream to one domain and its subdomains.
    #[serde(default)]
    domain: Option<String>,
}

#[async_trait]
impl RouterClient for RciClient {
    async fn list_upstreams(&self) -> Result<Vec<UpstreamDescriptor>> {
        let url = self
            .base
            .join("show/dns-proxy")
            .context("Failed to build RCI URL")?;

        let status: DnsProxyStatus = self
            .http
            .get(url)
            .send()
            .await
            .context("RCI request failed")?
            .error_for_status()
            .context("RCI request rejected")?
            .json()
            .await
            .context("Failed to parse RCI response")?;

        Ok(status
            .servers
            .iter()
            .filter_map(descriptor_from_server)
            .collect())
    }
}

fn descriptor_from_server(server: &ProxyServer) -> Option<UpstreamDescriptor> {
    let kind = match server.kind.as_str() {
        "dns" => UpstreamKind::Plain,
        "dns6" => UpstreamKind::PlainV6,
        "dot" => UpstreamKind::DoT,
        "doh" => UpstreamKind::DoH,
        other => {
            tracing::warn!(kind = %other, "Unknown dns-proxy upstream type, skipping");
            return None;
        }
    };

    let (proxy_host, port) = match &server.proxy {
        Some(proxy) => {
            let (host, port) = proxy.rsplit_once(':')?;
            (host.parse::<IpAddr>().ok()?, port.parse::<u16>().ok())
        }
        None => (IpAddr::from([127, 0, 0, 1]), None),
    };

    Some(UpstreamDescriptor {
        kind,
        proxy_host,
        port,
        endpoint: server.endpoint.clone(),
        restricted_domain: server.domain.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_dns_proxy_status() {
        let json = r#"{
            "proxy-server": [
                { "type": "dns", "endpoint": "1.1.1.1" },
                { "type": "doh", "proxy": "127.0.0.1:40500", "endpoint": "https://dns.example/dns-query" },
                { "type": "dns", "endpoint": "10.0.0.1:5353", "domain": "corp.example.com" },
                { "type": "mystery", "endpoint": "whatever" }
            ]
        }"#;

        let status: DnsProxyStatus = serde_json::from_str(json).unwrap();
        let descriptors: Vec<_> = status.servers.iter().filter_map(descriptor_from_server).collect();

        assert_eq!(descriptors.len(), 3);
        assert_eq!(descriptors[0].kind, UpstreamKind::Plain);
        assert_eq!(descriptors[1].kind, UpstreamKind::DoH);
        assert_eq!(descriptors[1].port, Some(40500));
        assert_eq!(
            descriptors[2].restricted_domain.as_deref(),
            Some("corp.example.com")
        );
    }
}
