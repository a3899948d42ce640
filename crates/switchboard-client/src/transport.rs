//! Transport seam between connections and the wire.
//!
//! A `Link` is one established multiplexed connection to a dispatcher. Every
//! exchange runs on its own stream, so a slow reply never blocks a ping.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use switchboard_protocol::StreamDescriptor;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LinkError {
    #[error("connect to {authority} failed: {reason}")]
    Connect { authority: String, reason: String },
    #[error("connection closed: {0}")]
    Closed(String),
    #[error("stream failed: {0}")]
    Stream(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<switchboard_protocol::ProtocolError> for LinkError {
    fn from(e: switchboard_protocol::ProtocolError) -> Self {
        LinkError::Protocol(e.to_string())
    }
}

/// One live connection to a dispatcher node.
pub trait Link: Send + Sync {
    /// Open a stream, send `descriptor` as its only outbound frame and
    /// collect every frame of the reply until the peer ends the stream.
    fn exchange(&self, descriptor: StreamDescriptor) -> BoxFuture<'_, Result<Vec<Bytes>, LinkError>>;

    /// Fire-and-forget stream carrying just `descriptor`.
    fn notify(&self, descriptor: StreamDescriptor) -> BoxFuture<'_, Result<(), LinkError>>;

    /// Next stream pushed by the server. Errors once the connection is gone.
    fn accept_push(&self) -> BoxFuture<'_, Result<StreamDescriptor, LinkError>>;

    fn close(&self, code: u32, reason: &str);
}

/// Dials dispatcher nodes by `host:port` authority.
pub trait Connector: Send + Sync {
    fn connect(&self, authority: &str) -> BoxFuture<'_, Result<Arc<dyn Link>, LinkError>>;
}
