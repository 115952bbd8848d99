//! Per-query processing: parse, intercept the check domain, pick an
//! upstream set, forward, and turn answer records into IP-set entries.

pub(crate) mod records;
pub(crate) mod tcp;
pub(crate) mod udp;

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use dns_types::{AnswerData, Query, RecordType, Response, ResponseBuilder, ResponseCode, records as rr};

use crate::cache::RecordsCache;
use crate::ipset::IpSetManager;
use crate::matcher::DomainMatcher;
use crate::subscribers::Subscribers;
use crate::upstream::UpstreamSet;

/// Reserved zone answered by the interceptor itself. Clients query a name
/// under this zone to verify their resolver path goes through us.
pub const CHECK_DOMAIN: &str = "dns-check.pbr.internal";

/// Fixed answer for intercepted check queries. From the RFC 2544 benchmark
/// block, never routed.
pub const CHECK_SENTINEL: Ipv4Addr = Ipv4Addr::new(198, 18, 0, 53);

pub struct QueryPipeline {
    cache: Arc<RecordsCache>,
    matcher: Arc<DomainMatcher>,
    ipsets: Arc<dyn IpSetManager>,
    default_upstreams: Arc<UpstreamSet>,
    /// Per-IP-set upstream overrides, consulted before the default set when
    /// the query name falls under that IP set's patterns.
    overrides: Vec<(String, Arc<UpstreamSet>)>,
    subscribers: Arc<Subscribers>,
    drop_aaaa: bool,
    /// Cache-TTL override for listed domains; `None` keeps answer TTLs.
    listed_cache_ttl: Option<Duration>,
    query_timeout: Duration,
}

impl QueryPipeline {
    pub fn new(
        cache: Arc<RecordsCache>,
        matcher: Arc<DomainMatcher>,
        ipsets: Arc<dyn IpSetManager>,
        default_upstreams: Arc<UpstreamSet>,
        overrides: Vec<(String, Arc<UpstreamSet>)>,
        subscribers: Arc<Subscribers>,
        drop_aaaa: bool,
        listed_domain_cache_ttl_sec: u32,
        query_timeout: Duration,
    ) -> Self {
        let listed_cache_ttl = (listed_domain_cache_ttl_sec > 0)
            .then(|| Duration::from_secs(listed_domain_cache_ttl_sec.into()));

        Self {
            cache,
            matcher,
            ipsets,
            default_upstreams,
            overrides,
            subscribers,
            drop_aaaa,
            listed_cache_ttl,
            query_timeout,
        }
    }

    /// Processes one wire-format query and returns the wire-format response.
    ///
    /// `None` means "no response": the packet was unparseable, or every
    /// upstream failed. The client times out and retries; we never
    /// synthesize SERVFAIL because clients may cache it or switch resolvers.
    pub async fn handle(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let query = match Query::parse(packet) {
            Ok(query) => query,
            Err(e) => {
                tracing::debug!("Dropping unparseable query: {e}");
                return None;
            }
        };

        let domain = query
            .domain()
            .map(|domain| dns_types::normalize(&domain.to_string()));

        if let Some(name) = domain.as_deref() {
            if is_check_domain(name) {
                return Some(self.answer_check_query(&query, name));
            }
        }

        let upstreams = self.select_upstreams(domain.as_deref());

        let response =
            match tokio::time::timeout(self.query_timeout, upstreams.query(&query)).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    tracing::warn!(?domain, "Dropping query, upstreams failed: {e}");
                    return None;
                }
                Err(_) => {
                    tracing::warn!(?domain, "Dropping query, upstream deadline exceeded");
                    return None;
                }
            };

        let response = self.post_process(response).await;

        Some(response.with_id(query.id()).into_bytes())
    }

    /// Answers an intercepted check-domain query authoritatively and tells
    /// all subscribers which name was asked for.
    fn answer_check_query(&self, query: &Query, name: &str) -> Vec<u8> {
        self.subscribers.broadcast(name);

        let builder = ResponseBuilder::for_query(query, ResponseCode::NOERROR).authoritative();

        let response = if query.qtype() == Some(RecordType::A) {
            let owner = query.domain().expect("check queries carry a question");
            builder
                .with_records([rr::answer(owner, 1, rr::a(CHECK_SENTINEL))])
                .build()
        } else {
            builder.build()
        };

        response.into_bytes()
    }

    fn select_upstreams(&self, name: Option<&str>) -> &Arc<UpstreamSet> {
        if let Some(name) = name {
            if !self.overrides.is_empty() {
                let matching = self.matcher.match_any(name);
                for (ipset, set) in &self.overrides {
                    if matching.iter().any(|m| m == ipset) {
                        return set;
                    }
                }
            }
        }

        &self.default_upstreams
    }

    /// Post-processes an upstream response: optional AAAA suppression, then
    /// record handlers in arrival order, then at most one IP-set submission.
    async fn post_process(&self, response: Response) -> Response {
        let response = if self.drop_aaaa && response.has_answer_rtype(RecordType::AAAA) {
            response.without_answer_rtype(RecordType::AAAA)
        } else {
            response
        };

        if response.response_code() != ResponseCode::NOERROR {
            return response;
        }

        let mut entries = Vec::new();
        for answer in response.answers() {
            match answer.data {
                AnswerData::A(ip) => {
                    entries.extend(self.handle_address(&answer.owner, ip.into(), answer.ttl));
                }
                AnswerData::Aaaa(ip) => {
                    entries.extend(self.handle_address(&answer.owner, ip.into(), answer.ttl));
                }
                AnswerData::Cname(target) => {
                    entries.extend(self.handle_cname(&answer.owner, &target, answer.ttl));
                }
                AnswerData::Other(_) => {}
            }
        }

        // Aliases mapping to the same set can produce the same prefix twice.
        let mut seen = HashSet::new();
        entries.retain(|entry| seen.insert((entry.set.clone(), entry.ip)));

        if !entries.is_empty() {
            if let Err(e) = self.ipsets.batch_add(&entries).await {
                tracing::warn!("Failed to submit IP set entries: {e:#}");
            }
        }

        response
    }
}

fn is_check_domain(name: &str) -> bool {
    name == CHECK_DOMAIN
        || name
            .strip_suffix(CHECK_DOMAIN)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("dns-check.pbr.internal", true; "zone apex")]
    #[test_case("client1.dns-check.pbr.internal", true; "name under zone")]
    #[test_case("a.b.dns-check.pbr.internal", true; "deep name under zone")]
    #[test_case("notdns-check.pbr.internal", false; "no dot boundary")]
    #[test_case("dns-check.pbr.internal.example.com", false; "zone in the middle")]
    #[test_case("example.com", false; "unrelated")]
    fn check_domain_detection(name: &str, expected: bool) {
        assert_eq!(is_check_domain(name), expected);
    }
}
