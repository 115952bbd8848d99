//! DNS over HTTPS upstream: wire-format POST per RFC 8484.
//!
//! All DoH upstreams share one pooled HTTP client owned by the service, so
//! idle connections stay bounded on small targets.

use std::time::Duration;

use async_trait::async_trait;
use dns_types::{Query, Response};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use url::Url;

use super::{Upstream, UpstreamError};

const DNS_MESSAGE_MEDIA_TYPE: &str = "application/dns-message";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct DohUpstream {
    url: Url,
    client: reqwest::Client,
    restriction: Option<String>,
}

impl DohUpstream {
    pub fn new(client: &reqwest::Client, url: Url) -> Self {
        Self {
            url,
            client: client.clone(),
            restriction: None,
        }
    }

    pub fn with_restriction(mut self, restriction: Option<String>) -> Self {
        self.restriction = restriction;

        self
    }
}

#[async_trait]
impl Upstream for DohUpstream {
    async fn query(&self, query: &Query) -> Result<Response, UpstreamError> {
        let response = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, DNS_MESSAGE_MEDIA_TYPE)
            .header(ACCEPT, DNS_MESSAGE_MEDIA_TYPE)
            .body(query.as_bytes().to_vec())
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout
                } else {
                    UpstreamError::Http(e)
                }
            })?;

        if !response.status().is_success() {
            return Err(UpstreamError::HttpStatus(response.status().as_u16()));
        }

        let is_dns_message = response
            .headers()
            .get(CONTENT_TYPE)
            .is_some_and(|content_type| content_type == DNS_MESSAGE_MEDIA_TYPE);
        if !is_dns_message {
            return Err(UpstreamError::NotADnsMessage);
        }

        let body = response.bytes().await.map_err(UpstreamError::Http)?;

        Ok(Response::parse(&body)?)
    }

    fn restriction(&self) -> Option<&str> {
        self.restriction.as_deref()
    }

    fn describe(&self) -> Vec<String> {
        vec![self.url.to_string()]
    }
}
