//! Length-delimited frame codec for QUIC streams.
//!
//! Wire format: 4-byte big-endian length prefix + frame body. Bodies are
//! opaque here; descriptors, reply headers and trailers happen to be JSON.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use crate::{ProtocolError, MAX_FRAME_BYTES};

/// Length prefix size in bytes.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Codec for framing raw byte frames over a byte stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_BYTES,
            });
        }

        let total = LENGTH_PREFIX_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge {
                size: item.len(),
                max: MAX_FRAME_BYTES,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Serialize `value` as JSON and append it to `dst` as one frame.
pub fn encode_json_frame<T: Serialize>(value: &T, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let body = serde_json::to_vec(value)?;
    FrameCodec.encode(Bytes::from(body), dst)
}

/// Split a fully received stream body into frames.
///
/// A partial frame left over at end-of-stream is an error.
pub fn split_frames(body: &[u8]) -> Result<Vec<Bytes>, ProtocolError> {
    let mut buf = BytesMut::from(body);
    let mut codec = FrameCodec;
    let mut frames = Vec::new();
    while let Some(frame) = codec.decode(&mut buf)? {
        frames.push(frame);
    }
    if !buf.is_empty() {
        return Err(ProtocolError::Truncated {
            remaining: buf.len(),
        });
    }
    Ok(frames)
}
