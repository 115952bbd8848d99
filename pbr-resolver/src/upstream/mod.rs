//! Upstream resolvers the interceptor forwards to: plain UDP, DNS over
//! HTTPS, and provider-discovered upstreams grouped into an [`UpstreamSet`].

mod doh;
mod provider;
mod set;
mod udp;

pub use doh::DohUpstream;
pub use provider::{Provider, RouterUpstreamProvider};
pub use set::UpstreamSet;
pub use udp::UdpUpstream;

use async_trait::async_trait;
use dns_types::{Query, Response};

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("transport failed: {0}")]
    Transport(#[from] std::io::Error),
    #[error("query timed out")]
    Timeout,
    #[error("malformed response: {0}")]
    Protocol(#[from] dns_types::Error),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),
    #[error("HTTP response is not a DNS message")]
    NotADnsMessage,
    #[error("all upstreams failed")]
    AllFailed,
}

#[async_trait]
pub trait Upstream: Send + Sync {
    /// Forwards `query` and returns the upstream's response. Bounded by the
    /// transport's own timeout; the pipeline adds the overall deadline.
    async fn query(&self, query: &Query) -> Result<Response, UpstreamError>;

    /// Domain restriction; `None` matches every query.
    fn restriction(&self) -> Option<&str>;

    /// Stable identifiers for logs.
    fn describe(&self) -> Vec<String>;

    /// Releases resources. Default is a no-op.
    fn close(&self) {}
}

/// A restriction matches the name itself and dot-bounded subdomains.
pub(crate) fn restriction_matches(restriction: &str, name: &str) -> bool {
    if name == restriction {
        return true;
    }

    name.len() > restriction.len()
        && name.ends_with(restriction)
        && name.as_bytes()[name.len() - restriction.len() - 1] == b'.'
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("example.com", "example.com", true; "exact")]
    #[test_case("example.com", "sub.example.com", true; "subdomain")]
    #[test_case("example.com", "deep.sub.example.com", true; "deep subdomain")]
    #[test_case("example.com", "notexample.com", false; "no dot boundary")]
    #[test_case("example.com", "example.org", false; "different domain")]
    #[test_case("example.com", "com", false; "shorter name")]
    fn restriction_matching(restriction: &str, name: &str, expected: bool) {
        assert_eq!(restriction_matches(restriction, name), expected);
    }
}
