//! QUIC transport -- dials dispatchers and maps link operations to streams.
//!
//! Stream usage:
//!   bidirectional   exchange (ping, api, request1): descriptor out, reply frames back
//!   unidirectional  client -> server: activity hints
//!   unidirectional  server -> client: pushes (ready, shutdown)

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use switchboard_protocol::codec::{encode_json_frame, split_frames};
use switchboard_protocol::{tls, StreamDescriptor, MAX_FRAME_BYTES, MAX_REPLY_BYTES};

use crate::config::TransportSection;
use crate::transport::{BoxFuture, Connector, Link, LinkError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Client endpoint shared by every dispatcher connection.
pub struct QuicConnector {
    endpoint: quinn::Endpoint,
    client_config: quinn::ClientConfig,
    server_name: String,
}

impl QuicConnector {
    /// Bind a client endpoint per the `[transport]` section.
    pub fn new(transport: &TransportSection) -> Result<Self, BoxError> {
        let bind: SocketAddr = transport.bind_addr.parse()?;
        let ca_der = match &transport.ca_cert {
            Some(path) => Some(std::fs::read(crate::expand_tilde(path))?),
            None => {
                tracing::warn!("no ca_cert configured, dispatcher certificates will not be verified");
                None
            }
        };
        let client_config = tls::build_client_config(ca_der, transport.timings())?;
        let endpoint = quinn::Endpoint::client(bind)?;

        Ok(Self {
            endpoint,
            client_config,
            server_name: transport.server_name.clone(),
        })
    }

    /// Dial a dispatcher by `host:port`.
    async fn dial(&self, authority: &str) -> Result<quinn::Connection, LinkError> {
        let fail = |reason: String| LinkError::Connect {
            authority: authority.to_string(),
            reason,
        };

        let addr = tokio::net::lookup_host(authority)
            .await
            .map_err(|e| fail(e.to_string()))?
            .next()
            .ok_or_else(|| fail("no addresses resolved".into()))?;

        let host = host_of(authority);
        let server_name = if host.parse::<IpAddr>().is_ok() {
            self.server_name.as_str()
        } else {
            host
        };

        let conn = self
            .endpoint
            .connect_with(self.client_config.clone(), addr, server_name)
            .map_err(|e| fail(e.to_string()))?
            .await
            .map_err(|e| fail(e.to_string()))?;
        tracing::debug!(authority, remote = %conn.remote_address(), "quic connection established");
        Ok(conn)
    }
}

impl Connector for QuicConnector {
    fn connect(&self, authority: &str) -> BoxFuture<'_, Result<Arc<dyn Link>, LinkError>> {
        let authority = authority.to_string();
        Box::pin(async move {
            let conn = self.dial(&authority).await?;
            Ok(Arc::new(QuicLink { conn }) as Arc<dyn Link>)
        })
    }
}

/// Host part of an authority, without port or IPv6 brackets.
fn host_of(authority: &str) -> &str {
    let host = match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

pub struct QuicLink {
    conn: quinn::Connection,
}

fn closed(e: quinn::ConnectionError) -> LinkError {
    LinkError::Closed(e.to_string())
}

fn stream_err(e: impl std::fmt::Display) -> LinkError {
    LinkError::Stream(e.to_string())
}

async fn write_descriptor(
    send: &mut quinn::SendStream,
    descriptor: &StreamDescriptor,
) -> Result<(), LinkError> {
    let mut buf = BytesMut::new();
    encode_json_frame(descriptor, &mut buf)?;
    send.write_all(&buf).await.map_err(stream_err)?;
    send.finish().map_err(stream_err)?;
    Ok(())
}

impl Link for QuicLink {
    fn exchange(&self, descriptor: StreamDescriptor) -> BoxFuture<'_, Result<Vec<Bytes>, LinkError>> {
        Box::pin(async move {
            let (mut send, mut recv) = self.conn.open_bi().await.map_err(closed)?;
            write_descriptor(&mut send, &descriptor).await?;
            let body = recv.read_to_end(MAX_REPLY_BYTES).await.map_err(stream_err)?;
            Ok(split_frames(&body)?)
        })
    }

    fn notify(&self, descriptor: StreamDescriptor) -> BoxFuture<'_, Result<(), LinkError>> {
        Box::pin(async move {
            let mut send = self.conn.open_uni().await.map_err(closed)?;
            write_descriptor(&mut send, &descriptor).await
        })
    }

    fn accept_push(&self) -> BoxFuture<'_, Result<StreamDescriptor, LinkError>> {
        Box::pin(async move {
            let mut recv = self.conn.accept_uni().await.map_err(closed)?;
            let body = recv
                .read_to_end(MAX_FRAME_BYTES + 4)
                .await
                .map_err(stream_err)?;
            let frames = split_frames(&body)?;
            let first = frames
                .first()
                .ok_or_else(|| LinkError::Protocol("push stream without descriptor".into()))?;
            serde_json::from_slice(first).map_err(|e| LinkError::Protocol(e.to_string()))
        })
    }

    fn close(&self, code: u32, reason: &str) {
        self.conn
            .close(quinn::VarInt::from_u32(code), reason.as_bytes());
    }
}
