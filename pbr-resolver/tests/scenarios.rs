//! End-to-end record-tracking scenarios, driven through the query pipeline
//! with a scripted upstream and a recording IP-set manager.

mod common;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::RecordingIpSets;
use dns_types::{
    AnswerData, DomainName, OwnedRecordData, Query, RecordType, Response, ResponseBuilder,
    ResponseCode, records,
};
use pbr_resolver::config::{Config, IpFamily, IpSetConfig, ListConfig};
use pbr_resolver::pipeline::{CHECK_DOMAIN, CHECK_SENTINEL};
use pbr_resolver::subscribers::Subscribers;
use pbr_resolver::upstream::{Upstream, UpstreamError, UpstreamSet};
use pbr_resolver::{DomainMatcher, InlineListStore, QueryPipeline, RecordsCache};
use tokio_util::sync::CancellationToken;

/// Answers every query with a fixed record sequence, echoing the question.
struct ScriptedUpstream {
    answers: Vec<(String, u32, OwnedRecordData)>,
    fail: bool,
    queries: AtomicUsize,
}

impl ScriptedUpstream {
    fn new(answers: Vec<(&str, u32, OwnedRecordData)>) -> Arc<Self> {
        Arc::new(Self {
            answers: answers
                .into_iter()
                .map(|(owner, ttl, data)| (owner.to_owned(), ttl, data))
                .collect(),
            fail: false,
            queries: AtomicUsize::new(0),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            answers: Vec::new(),
            fail: true,
            queries: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn query(&self, query: &Query) -> Result<Response, UpstreamError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(UpstreamError::Timeout);
        }

        let records = self.answers.iter().map(|(owner, ttl, data)| {
            records::answer(
                DomainName::vec_from_str(owner).expect("scripted owners are valid"),
                *ttl,
                data.clone(),
            )
        });

        Ok(ResponseBuilder::for_query(query, ResponseCode::NOERROR)
            .with_records(records)
            .build())
    }

    fn restriction(&self) -> Option<&str> {
        None
    }

    fn describe(&self) -> Vec<String> {
        vec!["scripted://".to_owned()]
    }
}

struct Harness {
    pipeline: QueryPipeline,
    ipsets: Arc<RecordingIpSets>,
    subscribers: Arc<Subscribers>,
    upstream: Arc<ScriptedUpstream>,
}

fn harness(
    listed: &[(&str, &[&str], IpFamily)],
    additional_ttl: u32,
    drop_aaaa: bool,
    upstream: Arc<ScriptedUpstream>,
) -> Harness {
    let config = Config {
        ipset_additional_ttl_sec: additional_ttl,
        lists: listed
            .iter()
            .map(|(name, hosts, _)| ListConfig {
                name: format!("list-{name}"),
                hosts: hosts.iter().map(|h| (*h).to_owned()).collect(),
                file: None,
                url: None,
            })
            .collect(),
        ipsets: listed
            .iter()
            .map(|(name, _, family)| IpSetConfig {
                name: (*name).to_owned(),
                family: *family,
                lists: vec![format!("list-{name}")],
                dns: None,
            })
            .collect(),
        ..Config::default()
    };

    let matcher = Arc::new(DomainMatcher::new());
    matcher.rebuild(&config, &InlineListStore).unwrap();

    let ipsets = Arc::new(RecordingIpSets::default());
    let subscribers = Arc::new(Subscribers::new(CancellationToken::new()));
    let upstreams = Arc::new(UpstreamSet::new(
        vec![upstream.clone() as Arc<dyn Upstream>],
        Vec::new(),
    ));

    let pipeline = QueryPipeline::new(
        Arc::new(RecordsCache::new(config.max_cache_domains)),
        matcher,
        ipsets.clone(),
        upstreams,
        Vec::new(),
        subscribers.clone(),
        drop_aaaa,
        0,
        Duration::from_secs(10),
    );

    Harness {
        pipeline,
        ipsets,
        subscribers,
        upstream,
    }
}

impl Harness {
    async fn query(&self, name: &str, rtype: RecordType) -> Option<Response> {
        let query = Query::new(DomainName::vec_from_str(name).unwrap(), rtype);
        let bytes = self.pipeline.handle(query.as_bytes()).await?;

        Some(Response::parse(&bytes).unwrap())
    }
}

fn entry(set: &str, ip: &str, ttl: u32) -> (String, IpAddr, u32) {
    (set.to_owned(), ip.parse().unwrap(), ttl)
}

fn recorded(ipsets: &RecordingIpSets) -> Vec<(String, IpAddr, u32)> {
    ipsets
        .entries()
        .into_iter()
        .map(|e| (e.set, e.ip, e.ttl))
        .collect()
}

#[tokio::test]
async fn exact_match_a_record_feeds_the_ipset_once() {
    let upstream = ScriptedUpstream::new(vec![(
        "example.com",
        300,
        records::a(Ipv4Addr::new(1, 2, 3, 4)),
    )]);
    let h = harness(
        &[("vpn4", &["example.com"], IpFamily::V4)],
        120,
        false,
        upstream,
    );

    let response = h.query("example.com", RecordType::A).await.unwrap();

    assert_eq!(h.ipsets.calls().len(), 1);
    assert_eq!(recorded(&h.ipsets), vec![entry("vpn4", "1.2.3.4", 420)]);
    assert!(response.answers().any(|a| a.data == AnswerData::A(Ipv4Addr::new(1, 2, 3, 4))));
}

#[tokio::test]
async fn wildcard_suffix_matches_deep_subdomains() {
    let upstream = ScriptedUpstream::new(vec![(
        "deep.sub.example.com",
        120,
        records::a(Ipv4Addr::new(5, 6, 7, 8)),
    )]);
    let h = harness(
        &[("vpn4", &["example.com"], IpFamily::V4)],
        60,
        false,
        upstream,
    );

    h.query("deep.sub.example.com", RecordType::A).await.unwrap();

    assert_eq!(recorded(&h.ipsets), vec![entry("vpn4", "5.6.7.8", 180)]);
}

#[tokio::test]
async fn cname_then_a_adds_once_and_second_lookup_adds_nothing() {
    let upstream = ScriptedUpstream::new(vec![
        (
            "alias.svc",
            60,
            records::cname(DomainName::vec_from_str("target.node").unwrap()),
        ),
        ("target.node", 60, records::a(Ipv4Addr::new(10, 0, 0, 1))),
    ]);
    let h = harness(
        &[("vpn4", &["target.node"], IpFamily::V4)],
        30,
        false,
        upstream,
    );

    h.query("alias.svc", RecordType::A).await.unwrap();

    assert_eq!(h.ipsets.calls().len(), 1);
    assert_eq!(recorded(&h.ipsets), vec![entry("vpn4", "10.0.0.1", 90)]);

    h.ipsets.clear();
    h.query("alias.svc", RecordType::A).await.unwrap();

    assert_eq!(h.ipsets.calls().len(), 0);
}

#[tokio::test]
async fn a_then_cname_adds_once_and_second_lookup_adds_nothing() {
    let upstream = ScriptedUpstream::new(vec![
        ("target.node", 60, records::a(Ipv4Addr::new(10, 0, 0, 1))),
        (
            "alias.svc",
            60,
            records::cname(DomainName::vec_from_str("target.node").unwrap()),
        ),
    ]);
    let h = harness(
        &[("vpn4", &["target.node"], IpFamily::V4)],
        30,
        false,
        upstream,
    );

    h.query("alias.svc", RecordType::A).await.unwrap();

    assert_eq!(h.ipsets.calls().len(), 1);
    assert_eq!(recorded(&h.ipsets), vec![entry("vpn4", "10.0.0.1", 90)]);

    h.ipsets.clear();
    h.query("alias.svc", RecordType::A).await.unwrap();

    assert_eq!(h.ipsets.calls().len(), 0);
}

#[tokio::test]
async fn aaaa_records_are_stripped_before_any_processing() {
    let upstream = ScriptedUpstream::new(vec![
        ("example.com", 300, records::a(Ipv4Addr::new(1, 2, 3, 4))),
        (
            "example.com",
            300,
            records::aaaa("2001:db8::1".parse().unwrap()),
        ),
    ]);
    let h = harness(
        &[
            ("vpn4", &["example.com"], IpFamily::V4),
            ("vpn6", &["example.com"], IpFamily::V6),
        ],
        0,
        true,
        upstream,
    );

    let response = h.query("example.com", RecordType::A).await.unwrap();

    assert!(!response.has_answer_rtype(RecordType::AAAA));
    assert!(response.has_answer_rtype(RecordType::A));
    assert!(recorded(&h.ipsets).iter().all(|(set, _, _)| set != "vpn6"));
    assert!(recorded(&h.ipsets).contains(&entry("vpn4", "1.2.3.4", 300)));
}

#[tokio::test]
async fn most_specific_pattern_wins() {
    let upstream = ScriptedUpstream::new(vec![(
        "v2.api.example.com",
        300,
        records::a(Ipv4Addr::new(9, 9, 9, 9)),
    )]);
    let h = harness(
        &[
            ("set_generic", &["example.com"], IpFamily::V4),
            ("set_api", &["api.example.com"], IpFamily::V4),
        ],
        0,
        false,
        upstream,
    );

    h.query("v2.api.example.com", RecordType::A).await.unwrap();

    assert_eq!(recorded(&h.ipsets), vec![entry("set_api", "9.9.9.9", 300)]);
}

#[tokio::test]
async fn unlisted_domains_add_nothing() {
    let upstream = ScriptedUpstream::new(vec![(
        "other.org",
        300,
        records::a(Ipv4Addr::new(8, 8, 8, 8)),
    )]);
    let h = harness(
        &[("vpn4", &["example.com"], IpFamily::V4)],
        0,
        false,
        upstream,
    );

    let response = h.query("other.org", RecordType::A).await.unwrap();

    assert!(h.ipsets.calls().is_empty());
    assert_eq!(response.answers().count(), 1);
}

#[tokio::test]
async fn check_domain_is_answered_locally() {
    let upstream = ScriptedUpstream::new(Vec::new());
    let h = harness(
        &[("vpn4", &["example.com"], IpFamily::V4)],
        0,
        false,
        upstream,
    );
    let (_id, mut events) = h.subscribers.subscribe();

    let name = format!("client1.{CHECK_DOMAIN}");
    let response = h.query(&name, RecordType::A).await.unwrap();

    let answers: Vec<_> = response.answers().collect();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].data, AnswerData::A(CHECK_SENTINEL));
    assert_eq!(answers[0].ttl, 1);

    assert_eq!(events.recv().await.as_deref(), Some(name.as_str()));
    assert_eq!(h.upstream.queries.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn check_domain_non_a_queries_get_an_empty_answer() {
    let upstream = ScriptedUpstream::new(Vec::new());
    let h = harness(&[], 0, false, upstream);

    let response = h
        .query(&format!("client1.{CHECK_DOMAIN}"), RecordType::TXT)
        .await
        .unwrap();

    assert_eq!(response.response_code(), ResponseCode::NOERROR);
    assert_eq!(response.answers().count(), 0);
    assert_eq!(h.upstream.queries.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn upstream_failure_drops_the_query() {
    let h = harness(
        &[("vpn4", &["example.com"], IpFamily::V4)],
        0,
        false,
        ScriptedUpstream::failing(),
    );

    assert!(h.query("example.com", RecordType::A).await.is_none());
    assert!(h.ipsets.calls().is_empty());
}

#[tokio::test]
async fn error_responses_skip_ipset_processing() {
    struct NxUpstream;

    #[async_trait]
    impl Upstream for NxUpstream {
        async fn query(&self, query: &Query) -> Result<Response, UpstreamError> {
            Ok(ResponseBuilder::for_query(query, ResponseCode::NXDOMAIN).build())
        }

        fn restriction(&self) -> Option<&str> {
            None
        }

        fn describe(&self) -> Vec<String> {
            vec!["nx://".to_owned()]
        }
    }

    let config = Config {
        lists: vec![ListConfig {
            name: "main".to_owned(),
            hosts: vec!["example.com".to_owned()],
            file: None,
            url: None,
        }],
        ipsets: vec![IpSetConfig {
            name: "vpn4".to_owned(),
            family: IpFamily::V4,
            lists: vec!["main".to_owned()],
            dns: None,
        }],
        ..Config::default()
    };
    let matcher = Arc::new(DomainMatcher::new());
    matcher.rebuild(&config, &InlineListStore).unwrap();
    let ipsets = Arc::new(RecordingIpSets::default());

    let pipeline = QueryPipeline::new(
        Arc::new(RecordsCache::new(1000)),
        matcher,
        ipsets.clone(),
        Arc::new(UpstreamSet::new(
            vec![Arc::new(NxUpstream) as Arc<dyn Upstream>],
            Vec::new(),
        )),
        Vec::new(),
        Arc::new(Subscribers::new(CancellationToken::new())),
        false,
        0,
        Duration::from_secs(10),
    );

    let query = Query::new(
        DomainName::vec_from_str("example.com").unwrap(),
        RecordType::A,
    );
    let bytes = pipeline.handle(query.as_bytes()).await.unwrap();
    let response = Response::parse(&bytes).unwrap();

    assert_eq!(response.response_code(), ResponseCode::NXDOMAIN);
    assert!(ipsets.calls().is_empty());
}
