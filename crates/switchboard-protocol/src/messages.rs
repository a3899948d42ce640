//! Wire message types: stream descriptors, request envelopes, reply frames
//! and node-discovery payloads.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ApiError, ErrorCode};

// ============================================================================
// Stream descriptors
// ============================================================================

/// First frame of every stream, in both directions. Tagged by `class`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum StreamDescriptor {
    /// Liveness probe; any reply counts as a round trip.
    Ping {
        #[serde(default)]
        cookie: String,
    },
    /// One-shot listing of callable actions.
    Api,
    /// A numbered API call.
    #[serde(rename = "request1")]
    Request { id: u64, request: RequestEnvelope },
    /// Hint that this connection is (or is no longer) the client's chosen one.
    Activity { active: bool },
    /// Server push: node finished starting. Ignored.
    Ready,
    /// Server push: node is draining. Requests with id <= `last_id` will still be answered.
    Shutdown { last_id: u64 },
}

impl StreamDescriptor {
    pub fn ping() -> Self {
        StreamDescriptor::Ping {
            cookie: String::new(),
        }
    }

    pub fn request(id: u64, request: RequestEnvelope) -> Self {
        StreamDescriptor::Request { id, request }
    }

    pub fn activity(active: bool) -> Self {
        StreamDescriptor::Activity { active }
    }

    /// Wire name of the descriptor class, for logging.
    pub fn class(&self) -> &'static str {
        match self {
            StreamDescriptor::Ping { .. } => "ping",
            StreamDescriptor::Api => "api",
            StreamDescriptor::Request { .. } => "request1",
            StreamDescriptor::Activity { .. } => "activity",
            StreamDescriptor::Ready => "ready",
            StreamDescriptor::Shutdown { .. } => "shutdown",
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    #[default]
    Json,
    /// Store-shaped replies for data-store backed callers.
    JsonStore,
}

/// Everything sent with a single API call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub action: String,
    pub version: u32,
    pub params: Value,
    #[serde(rename = "envelope", default)]
    pub kind: EnvelopeKind,
    #[serde(default)]
    pub terminal: Option<String>,
    #[serde(default)]
    pub session: Option<String>,
}

// ============================================================================
// Replies
// ============================================================================

/// First frame of a reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplyHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_data: Option<Value>,
}

/// Last frame of a reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplyTrailer {
    #[serde(default, alias = "txerr", skip_serializing_if = "Option::is_none")]
    pub transport_error: Option<String>,
}

/// Interpret the frames of a finished request stream.
///
/// Layout: header, zero or more payload frames, trailer. The payload frames
/// are concatenated and decoded as one JSON document.
pub fn decode_reply(frames: Vec<Bytes>) -> Result<Value, ApiError> {
    let mut frames = frames.into_iter();

    let header: ReplyHeader = match frames.next() {
        Some(frame) => serde_json::from_slice(&frame)
            .map_err(|e| ApiError::transport(format!("malformed reply header: {e}")))?,
        None => return Err(ApiError::transport("reply stream ended without a header")),
    };

    if let Some(code) = header.error_code.filter(|c| !c.is_empty()) {
        return Err(ApiError {
            code: ErrorCode::from(code),
            message: header.error.unwrap_or_default(),
            data: header.error_data,
        });
    }

    let mut body: Vec<Bytes> = frames.collect();
    let trailer: ReplyTrailer = match body.pop() {
        Some(frame) => serde_json::from_slice(&frame)
            .map_err(|e| ApiError::transport(format!("malformed reply trailer: {e}")))?,
        None => return Err(ApiError::transport("reply stream ended without a trailer")),
    };

    if let Some(err) = trailer.transport_error.filter(|e| !e.is_empty()) {
        return Err(ApiError::transport(err));
    }

    let payload: Vec<u8> = body.concat();
    let text = std::str::from_utf8(&payload)
        .map_err(|e| ApiError::transport(format!("UTF8 decode failed {e}")))?;
    serde_json::from_str(text).map_err(|_| ApiError::transport("JSON decode of payload failed"))
}

// ============================================================================
// API listing
// ============================================================================

/// One callable action as advertised by the `api` stream: `[name, version]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApiAction(pub String, pub u32);

impl ApiAction {
    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn version(&self) -> u32 {
        self.1
    }
}

// ============================================================================
// Node discovery
// ============================================================================

/// Discovery payload: zones of interchangeable dispatcher nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    pub zones: Vec<Zone>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    #[serde(default)]
    pub name: String,
    pub nodes: Vec<ZoneNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneNode {
    /// `host:port`
    pub authority: String,
    #[serde(default)]
    pub shortname: String,
}
