//! Thin wrappers around the `domain` crate for the message shapes the
//! interceptor deals with: client queries, upstream responses and the
//! synthesized answers we build ourselves.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use domain::base::iana::Class;
use domain::base::message_builder::AnswerBuilder;
use domain::base::name::FlattenInto as _;
use domain::base::{Message, MessageBuilder, ParsedName, Question, RecordSection};
use domain::dep::octseq::OctetsInto as _;
use domain::rdata::AllRecordData;

pub type RecordType = domain::base::iana::Rtype;
pub type ResponseCode = domain::base::iana::Rcode;
pub type Ttl = domain::base::Ttl;

pub type DomainName = domain::base::Name<Vec<u8>>;
pub type OwnedRecordData = AllRecordData<Vec<u8>, DomainName>;
pub type OwnedRecord = domain::base::Record<DomainName, OwnedRecordData>;

/// Normalizes a domain name: ASCII lowercase, no trailing dot.
///
/// Every map key in the interceptor uses this form.
pub fn normalize(name: &str) -> String {
    name.strip_suffix('.').unwrap_or(name).to_ascii_lowercase()
}

/// A DNS query as received from a client.
#[derive(Clone)]
pub struct Query {
    inner: Message<Vec<u8>>,
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("qid", &self.inner.header().id())
            .field("type", &self.qtype())
            .field("domain", &self.domain())
            .finish()
    }
}

impl Query {
    /// Parses a query from wire format.
    ///
    /// Messages with an empty Question section are accepted: the pipeline
    /// still forwards those upstream verbatim.
    pub fn parse(slice: &[u8]) -> Result<Self, Error> {
        let message = Message::from_octets(slice).map_err(|_| Error::TooShort)?;

        if message.header().qr() {
            return Err(Error::NotAQuery);
        }

        // Verify that all questions parse so accessors can't fail later.
        for question in message.question() {
            question?;
        }

        Ok(Self {
            inner: message.octets_into(),
        })
    }

    pub fn new(domain: DomainName, rtype: RecordType) -> Self {
        let mut inner = MessageBuilder::new_vec().question();
        inner.header_mut().set_qr(false);
        inner.header_mut().set_rd(true); // Default to recursion desired.
        inner.header_mut().set_random_id();

        inner
            .push((domain, rtype))
            .expect("Vec-backed message builder never fails");

        Self {
            inner: inner.into_message(),
        }
    }

    pub fn with_id(mut self, id: u16) -> Self {
        self.inner.header_mut().set_id(id);

        self
    }

    pub fn id(&self) -> u16 {
        self.inner.header().id()
    }

    /// The name of the first question, if there is one.
    pub fn domain(&self) -> Option<DomainName> {
        Some(self.question()?.into_qname().flatten_into())
    }

    pub fn qtype(&self) -> Option<RecordType> {
        Some(self.question()?.qtype())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.inner.into_octets()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_slice()
    }

    fn question(&self) -> Option<Question<ParsedName<&[u8]>>> {
        self.inner
            .question()
            .next()
            .map(|q| q.expect("verified in ctor"))
    }
}

/// An answer record the interceptor understands.
///
/// Anything that is not an A, AAAA or CNAME record is carried as
/// [`AnswerData::Other`] so callers can still count and preserve it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    /// Owner name, normalized.
    pub owner: String,
    pub ttl: u32,
    pub data: AnswerData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    /// Canonical name, normalized.
    Cname(String),
    Other(RecordType),
}

/// A DNS response, either from an upstream or synthesized locally.
#[derive(Clone)]
pub struct Response {
    inner: Message<Vec<u8>>,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("qid", &self.inner.header().id())
            .field("response_code", &self.response_code())
            .finish_non_exhaustive()
    }
}

impl Response {
    pub fn parse(slice: &[u8]) -> Result<Self, Error> {
        let message = Message::from_octets(slice).map_err(|_| Error::TooShort)?;

        if !message.header().qr() {
            return Err(Error::NotAResponse);
        }

        // Verify that all answer records parse so `answers` can't fail later.
        for record in message.answer()? {
            record?.into_any_record::<AllRecordData<_, _>>()?;
        }

        Ok(Self {
            inner: message.octets_into(),
        })
    }

    pub fn with_id(mut self, id: u16) -> Self {
        self.inner.header_mut().set_id(id);

        self
    }

    pub fn id(&self) -> u16 {
        self.inner.header().id()
    }

    pub fn response_code(&self) -> ResponseCode {
        self.inner.header().rcode()
    }

    /// Answer records in arrival order.
    pub fn answers(&self) -> impl Iterator<Item = Answer> + '_ {
        self.answer_section().into_iter().map(|record| {
            let record = record
                .expect("verified in ctor")
                .into_any_record::<AllRecordData<_, _>>()
                .expect("verified in ctor");

            let data = match record.data() {
                AllRecordData::A(a) => AnswerData::A(a.addr()),
                AllRecordData::Aaaa(aaaa) => AnswerData::Aaaa(aaaa.addr()),
                AllRecordData::Cname(cname) => {
                    AnswerData::Cname(normalize(&cname.cname().to_string()))
                }
                _ => AnswerData::Other(record.rtype()),
            };

            Answer {
                owner: normalize(&record.owner().to_string()),
                ttl: record.ttl().as_secs(),
                data,
            }
        })
    }

    pub fn has_answer_rtype(&self, rtype: RecordType) -> bool {
        self.answer_section()
            .into_iter()
            .any(|record| record.as_ref().is_ok_and(|r| r.rtype() == rtype))
    }

    /// Returns a copy of this response with all answer records of `rtype`
    /// removed. The question, authority and additional sections survive.
    pub fn without_answer_rtype(&self, rtype: RecordType) -> Self {
        let mut answer = MessageBuilder::new_vec()
            .start_answer(&self.inner, self.response_code())
            .expect("Vec-backed message builder never fails");

        // `start_answer` only carries id, rd and the question over.
        answer.header_mut().set_aa(self.inner.header().aa());
        answer.header_mut().set_ra(self.inner.header().ra());

        for record in self.answer_section() {
            let record = record
                .expect("verified in ctor")
                .into_any_record::<AllRecordData<_, _>>()
                .expect("verified in ctor");

            if record.rtype() == rtype {
                continue;
            }

            let record: OwnedRecord = record.flatten_into();
            answer
                .push(record)
                .expect("Vec-backed message builder never fails");
        }

        let mut authority = answer.authority();
        if let Ok(section) = self.inner.authority() {
            for record in section {
                let Ok(Ok(record)) =
                    record.map(|r| r.into_any_record::<AllRecordData<_, _>>())
                else {
                    continue;
                };

                let record: OwnedRecord = record.flatten_into();
                authority
                    .push(record)
                    .expect("Vec-backed message builder never fails");
            }
        }

        let mut additional = authority.additional();
        if let Ok(section) = self.inner.additional() {
            for record in section {
                let Ok(Ok(record)) =
                    record.map(|r| r.into_any_record::<AllRecordData<_, _>>())
                else {
                    continue;
                };

                let record: OwnedRecord = record.flatten_into();
                additional
                    .push(record)
                    .expect("Vec-backed message builder never fails");
            }
        }

        Self {
            inner: additional.into_message(),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.inner.into_octets()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_slice()
    }

    fn answer_section(&self) -> RecordSection<'_, Vec<u8>> {
        self.inner.answer().expect("verified in ctor")
    }
}

pub struct ResponseBuilder {
    inner: AnswerBuilder<Vec<u8>>,
}

impl ResponseBuilder {
    pub fn for_query(query: &Query, code: ResponseCode) -> Self {
        let inner = MessageBuilder::new_vec()
            .start_answer(&query.inner, code)
            .expect("Vec-backed message builder never fails");

        Self { inner }
    }

    pub fn authoritative(mut self) -> Self {
        self.inner.header_mut().set_aa(true);

        self
    }

    pub fn with_records(mut self, records: impl IntoIterator<Item: Into<OwnedRecord>>) -> Self {
        for record in records {
            self.inner
                .push(record.into())
                .expect("Vec-backed message builder never fails");
        }

        self
    }

    pub fn build(self) -> Response {
        Response {
            inner: self.inner.into_message(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Bytes slice is too short to contain a message")]
    TooShort,
    #[error("DNS message is not a query")]
    NotAQuery,
    #[error("DNS message is not a response")]
    NotAResponse,
    #[error(transparent)]
    Parse(#[from] domain::base::wire::ParseError),
}

pub mod records {
    use domain::rdata::{A, Aaaa, Cname};

    use super::*;

    pub fn a(ip: Ipv4Addr) -> OwnedRecordData {
        OwnedRecordData::A(A::new(ip))
    }

    pub fn aaaa(ip: Ipv6Addr) -> OwnedRecordData {
        OwnedRecordData::Aaaa(Aaaa::new(ip))
    }

    pub fn cname(target: DomainName) -> OwnedRecordData {
        OwnedRecordData::Cname(Cname::new(target))
    }

    pub fn ip(ip: IpAddr) -> OwnedRecordData {
        match ip {
            IpAddr::V4(ip) => a(ip),
            IpAddr::V6(ip) => aaaa(ip),
        }
    }

    /// An owned answer record with class IN.
    pub fn answer(owner: DomainName, ttl: u32, data: OwnedRecordData) -> OwnedRecord {
        OwnedRecord::new(owner, Class::IN, Ttl::from_secs(ttl), data)
    }
}
