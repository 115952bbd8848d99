//! TCP listener: length-prefixed DNS per RFC 1035 §4.2.2, one task per
//! connection, bounded by a per-connection total timeout.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::QueryPipeline;

pub(crate) async fn serve(
    listener: TcpListener,
    pipeline: Arc<QueryPipeline>,
    cancel: CancellationToken,
    connection_timeout: Duration,
    max_message_size: usize,
) {
    loop {
        let (stream, peer) = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("TCP accept failed: {e}");
                    continue;
                }
            },
        };

        let pipeline = Arc::clone(&pipeline);

        tokio::spawn(async move {
            let result = tokio::time::timeout(
                connection_timeout,
                serve_connection(stream, peer, pipeline, max_message_size),
            )
            .await;

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(client = %peer, "TCP connection failed: {e}"),
                Err(_) => tracing::debug!(client = %peer, "TCP connection timed out"),
            }
        });
    }

    tracing::debug!("TCP listener stopped");
}

/// Serves queries on one stream until the client closes it. Clients may
/// pipeline multiple queries over a single connection.
async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    pipeline: Arc<QueryPipeline>,
    max_message_size: usize,
) -> io::Result<()> {
    loop {
        let mut len_prefix = [0u8; 2];
        match stream.read_exact(&mut len_prefix).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }

        let len = u16::from_be_bytes(len_prefix) as usize;
        if len == 0 || len > max_message_size {
            // Close without reading further; an attacker-controlled length
            // must not make us buffer arbitrary data.
            tracing::warn!(client = %peer, %len, "TCP message length out of bounds, closing connection");
            return Ok(());
        }

        let mut message = vec![0u8; len];
        stream.read_exact(&mut message).await?;

        let Some(response) = pipeline.handle(&message).await else {
            // Unanswerable query; closing lets the client retry elsewhere.
            return Ok(());
        };

        let response_len =
            u16::try_from(response.len()).map_err(|_| io::Error::other("response too large"))?;
        stream.write_all(&response_len.to_be_bytes()).await?;
        stream.write_all(&response).await?;
    }
}
