//! Plain UDP upstream: one datagram exchange per query.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dns_types::{Query, Response};
use tokio::net::UdpSocket;

use super::{Upstream, UpstreamError};

/// Shorter than the overall query deadline so context cancellation still
/// wins over a dead upstream.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(3);

const MAX_RESPONSE_SIZE: usize = 4096;

pub struct UdpUpstream {
    server: SocketAddr,
    restriction: Option<String>,
    label: String,
}

impl UdpUpstream {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            restriction: None,
            label: format!("udp://{server}"),
        }
    }

    pub fn with_restriction(mut self, restriction: Option<String>) -> Self {
        self.restriction = restriction;

        self
    }

    pub fn with_label(mut self, label: String) -> Self {
        self.label = label;

        self
    }
}

#[async_trait]
impl Upstream for UdpUpstream {
    async fn query(&self, query: &Query) -> Result<Response, UpstreamError> {
        let bind: SocketAddr = match self.server {
            SocketAddr::V4(_) => (IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).into(),
            SocketAddr::V6(_) => (IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0).into(),
        };

        let socket = UdpSocket::bind(bind).await?;
        socket.connect(self.server).await?;
        socket.send(query.as_bytes()).await?;

        let deadline = Instant::now() + EXCHANGE_TIMEOUT;
        let mut buffer = vec![0u8; MAX_RESPONSE_SIZE];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let len = tokio::time::timeout(remaining, socket.recv(&mut buffer))
                .await
                .map_err(|_| UpstreamError::Timeout)??;

            let response = Response::parse(&buffer[..len])?;

            // A stray datagram for an earlier query; keep waiting.
            if response.id() != query.id() {
                tracing::debug!(upstream = %self.label, "Ignoring response with mismatched id");
                continue;
            }

            return Ok(response);
        }
    }

    fn restriction(&self) -> Option<&str> {
        self.restriction.as_deref()
    }

    fn describe(&self) -> Vec<String> {
        vec![self.label.clone()]
    }
}

#[cfg(test)]
mod tests {
    use dns_types::{DomainName, RecordType, ResponseBuilder, ResponseCode, records};

    use super::*;

    async fn fake_server(answer_ip: Ipv4Addr) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_RESPONSE_SIZE];
            let (len, from) = socket.recv_from(&mut buffer).await.unwrap();
            let query = Query::parse(&buffer[..len]).unwrap();
            let domain = query.domain().unwrap();

            let response = ResponseBuilder::for_query(&query, ResponseCode::NOERROR)
                .with_records([records::answer(domain, 300, records::a(answer_ip))])
                .build();

            socket.send_to(response.as_bytes(), from).await.unwrap();
        });

        addr
    }

    #[tokio::test]
    async fn exchanges_a_single_datagram() {
        let server = fake_server(Ipv4Addr::new(1, 2, 3, 4)).await;
        let upstream = UdpUpstream::new(server);

        let query = Query::new(
            DomainName::vec_from_str("example.com").unwrap(),
            RecordType::A,
        );
        let response = upstream.query(&query).await.unwrap();

        assert_eq!(response.id(), query.id());
        assert_eq!(response.answers().count(), 1);
    }

    #[tokio::test]
    async fn times_out_without_a_server() {
        // Bind and drop so nothing listens on the port.
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        drop(socket);

        let upstream = UdpUpstream::new(addr);
        let query = Query::new(
            DomainName::vec_from_str("example.com").unwrap(),
            RecordType::A,
        );

        let result = tokio::time::timeout(Duration::from_secs(5), upstream.query(&query)).await;

        assert!(matches!(
            result,
            Ok(Err(UpstreamError::Timeout | UpstreamError::Transport(_)))
        ));
    }
}
