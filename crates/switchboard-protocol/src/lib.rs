//! Switchboard Protocol -- wire types, frame codec, TLS setup.
//!
//! One QUIC connection per dispatcher node. Every call opens its own stream.
//! Streams carry 4-byte big-endian length-prefixed frames; the first frame
//! sent on a stream is a JSON descriptor tagged with its `class`.

pub mod codec;
pub mod error;
pub mod messages;
pub mod tls;

pub use codec::FrameCodec;
pub use error::{ApiError, ErrorCode};
pub use messages::*;

/// Close code sent when we finish a graceful local shutdown.
pub const SHUTDOWN_CLOSE_CODE: u32 = 4901;

/// Close reason paired with [`SHUTDOWN_CLOSE_CODE`].
pub const SHUTDOWN_CLOSE_REASON: &str = "shutting down";

/// Maximum size of a single frame on the wire.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Maximum total bytes read from one reply stream.
pub const MAX_REPLY_BYTES: usize = 64 * 1024 * 1024;

/// Default per-request timeout in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 120_000;

/// Timeout for the one-shot API listing fetch in milliseconds.
pub const API_FETCH_TIMEOUT_MS: u64 = 30_000;

/// Request id used for the API listing stream. Never subject to shutdown cutoff.
pub const API_FETCH_REQUEST_ID: u64 = 0;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("truncated frame: {remaining} trailing bytes")]
    Truncated { remaining: usize },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
