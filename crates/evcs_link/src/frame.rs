//! Length-prefixed framing: `[type u8][len u32 BE][payload]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::LinkError;

/// Largest payload either side may send.
pub const MAX_PAYLOAD: usize = 1 << 20;

const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(message_type: u8, payload: impl Into<Bytes>) -> Self {
        Frame {
            message_type,
            payload: payload.into(),
        }
    }

    pub fn empty(message_type: u8) -> Self {
        Frame::new(message_type, Bytes::new())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = LinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, LinkError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let message_type = src[0];
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(LinkError::FrameTooLarge { len });
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame {
            message_type,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = LinkError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), LinkError> {
        let len = frame.payload.len();
        if len > MAX_PAYLOAD {
            return Err(LinkError::FrameTooLarge { len });
        }
        dst.reserve(HEADER_LEN + len);
        dst.put_u8(frame.message_type);
        dst.put_u32(len as u32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
