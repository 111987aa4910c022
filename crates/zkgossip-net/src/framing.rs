//! Message framing for network transport
//!
//! Every protocol message travels as a length-prefixed frame. A datagram may
//! carry several frames back to back: the primary message followed by
//! piggybacked broadcasts.

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (16 MB)
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Bytes a frame adds on top of its payload (length prefix + type)
pub const FRAME_OVERHEAD: usize = 5;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Truncated packet: {0} trailing bytes")]
    Truncated(usize),
}

impl From<postcard::Error> for FrameError {
    fn from(e: postcard::Error) -> Self {
        FrameError::Serialization(e.to_string())
    }
}

/// A framed message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Payload bytes
    pub payload: Vec<u8>,
}

/// Frame types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Direct probe
    Ping = 0,
    /// Probe on behalf of another node
    IndirectPing = 1,
    /// Probe acknowledgement
    Ack = 2,
    /// Intermediary could not reach the target
    Nack = 3,
    /// Membership update
    Update = 10,
    /// Application message (proof envelope)
    User = 20,
    /// Full state exchange
    PushPull = 30,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ping),
            1 => Ok(Self::IndirectPing),
            2 => Ok(Self::Ack),
            3 => Ok(Self::Nack),
            10 => Ok(Self::Update),
            20 => Ok(Self::User),
            30 => Ok(Self::PushPull),
            _ => Err(FrameError::Serialization(format!("Unknown frame type: {}", value))),
        }
    }
}

/// Codec for length-prefixed frames
///
/// Wire format:
/// - 4 bytes: length (big-endian, includes type byte)
/// - 1 byte: frame type
/// - N bytes: payload
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 5 bytes (4 length + 1 type)
        if src.len() < FRAME_OVERHEAD {
            return Ok(None);
        }

        // Peek at length
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        if length == 0 {
            return Err(FrameError::Serialization("zero-length frame".into()));
        }

        // Need full frame
        if src.len() < 4 + length {
            return Ok(None);
        }

        // Consume length prefix
        src.advance(4);

        // Read frame type
        let frame_type = FrameType::try_from(src[0])?;
        src.advance(1);

        // Read payload
        let payload_len = length - 1;
        let payload = src.split_to(payload_len).to_vec();

        Ok(Some(Frame { frame_type, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = 1 + item.payload.len();
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }

        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u8(item.frame_type as u8);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

impl Frame {
    /// Create a new frame
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self { frame_type, payload }
    }

    /// Serialize `message` into a frame of the given type
    pub fn encode_message<T: Serialize>(frame_type: FrameType, message: &T) -> Result<Self, FrameError> {
        Ok(Self::new(frame_type, postcard::to_allocvec(message)?))
    }

    /// Deserialize the payload
    pub fn decode_message<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        Ok(postcard::from_bytes(&self.payload)?)
    }

    /// Size of the frame on the wire
    pub fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    /// Encode into a standalone byte vector
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        FrameCodec.encode(self.clone(), &mut buf)?;
        Ok(buf.to_vec())
    }
}

/// Split a datagram into its frames.
///
/// A datagram must contain only whole frames; trailing bytes are an error.
pub fn decode_packet(bytes: &[u8]) -> Result<Vec<Frame>, FrameError> {
    let mut codec = FrameCodec;
    let mut buf = BytesMut::from(bytes);
    let mut frames = Vec::new();

    while let Some(frame) = codec.decode(&mut buf)? {
        frames.push(frame);
    }
    if !buf.is_empty() {
        return Err(FrameError::Truncated(buf.len()));
    }
    Ok(frames)
}

/// Concatenate a primary frame with already-encoded piggyback frames.
pub fn encode_packet(primary: &Frame, piggyback: &[Vec<u8>]) -> Result<Vec<u8>, FrameError> {
    let extra: usize = piggyback.iter().map(Vec::len).sum();
    let mut buf = BytesMut::with_capacity(primary.encoded_len() + extra);
    FrameCodec.encode(primary.clone(), &mut buf)?;
    for encoded in piggyback {
        buf.put_slice(encoded);
    }
    Ok(buf.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use zkgossip_core::types::{Ack, Ping};

    #[test]
    fn test_frame_roundtrip() {
        let mut codec = FrameCodec::new();
        let frame = Frame::new(FrameType::User, vec![1, 2, 3, 4, 5]);

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_compound_packet() {
        let ping = Ping {
            seq_no: 9,
            target: "b".into(),
            source: "a".into(),
            source_addr: "127.0.0.1:7000".parse().unwrap(),
        };
        let primary = Frame::encode_message(FrameType::Ping, &ping).unwrap();
        let extra = vec![
            Frame::new(FrameType::Update, vec![1, 2]).to_bytes().unwrap(),
            Frame::encode_message(FrameType::Ack, &Ack { seq_no: 3 })
                .unwrap()
                .to_bytes()
                .unwrap(),
        ];

        let packet = encode_packet(&primary, &extra).unwrap();
        assert_eq!(packet.len(), primary.encoded_len() + extra[0].len() + extra[1].len());

        let frames = decode_packet(&packet).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].decode_message::<Ping>().unwrap(), ping);
        assert_eq!(frames[1].payload, vec![1, 2]);
        assert_eq!(frames[2].decode_message::<Ack>().unwrap().seq_no, 3);
    }

    #[test]
    fn test_truncated_packet() {
        let mut bytes = Frame::new(FrameType::User, vec![9; 10]).to_bytes().unwrap();
        bytes.truncate(8);
        assert!(matches!(decode_packet(&bytes), Err(FrameError::Truncated(8))));
    }

    #[test]
    fn test_unknown_frame_type() {
        let bytes = [0, 0, 0, 1, 99];
        assert!(decode_packet(&bytes).is_err());
    }
}
