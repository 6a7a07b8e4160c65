//! Length-prefixed protobuf framing for the signaling exchange.
//!
//! Each frame is an unsigned varint byte length followed by a protobuf
//! message with two fields: `type` (1, enum) and `data` (2, string).

use std::fmt;

use bytes::{Buf, Bytes, BytesMut};
use prost::Message as _;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single frame body. SDP blobs are a few KiB at most.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

// A u64 varint never needs more than ten bytes.
const MAX_VARINT_LEN: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MessageKind {
    SdpOffer = 0,
    SdpAnswer = 1,
    IceCandidate = 2,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::SdpOffer => "SDP_OFFER",
            MessageKind::SdpAnswer => "SDP_ANSWER",
            MessageKind::IceCandidate => "ICE_CANDIDATE",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub data: String,
}

impl Message {
    pub fn new(kind: MessageKind, data: impl Into<String>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    pub fn offer(sdp: impl Into<String>) -> Self {
        Self::new(MessageKind::SdpOffer, sdp)
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self::new(MessageKind::SdpAnswer, sdp)
    }

    pub fn candidate(json: impl Into<String>) -> Self {
        Self::new(MessageKind::IceCandidate, json)
    }

    /// The empty candidate that tells the remote no more candidates follow.
    pub fn end_of_candidates() -> Self {
        Self::new(MessageKind::IceCandidate, String::new())
    }
}

// Both fields are optional on the wire so frames from peers that omit
// default values still decode.
#[derive(Clone, PartialEq, prost::Message)]
struct WireMessage {
    #[prost(enumeration = "MessageKind", optional, tag = "1")]
    r#type: Option<i32>,
    #[prost(string, optional, tag = "2")]
    data: Option<String>,
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        Self {
            r#type: Some(message.kind as i32),
            data: Some(message.data.clone()),
        }
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = DecodeError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let raw = wire.r#type.ok_or(DecodeError::MissingKind)?;
        let kind = MessageKind::try_from(raw).map_err(|_| DecodeError::UnknownKind(raw))?;
        Ok(Self {
            kind,
            data: wire.data.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid length prefix")]
    InvalidLength,
    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },
    #[error("invalid message body: {0}")]
    Body(#[from] prost::DecodeError),
    #[error("message has no type")]
    MissingKind,
    #[error("unknown message type {0}")]
    UnknownKind(i32),
    #[error("stream ended inside a frame ({0} bytes buffered)")]
    Truncated(usize),
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
    #[error("bootstrap stream i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Encodes one complete frame.
pub fn encode(message: &Message) -> Bytes {
    Bytes::from(WireMessage::from(message).encode_length_delimited_to_vec())
}

/// Decodes exactly one complete frame; leftover bytes are an error.
pub fn decode(frame: &[u8]) -> Result<Message, DecodeError> {
    let mut buf = BytesMut::from(frame);
    let mut codec = SignalingCodec::default();
    let message = codec
        .decode_eof(&mut buf)?
        .ok_or(DecodeError::Truncated(0))?;
    if !buf.is_empty() {
        return Err(DecodeError::TrailingBytes(buf.len()));
    }
    Ok(message)
}

/// `tokio_util` codec so the bootstrap stream can be driven through `Framed`.
#[derive(Clone, Copy, Debug)]
pub struct SignalingCodec {
    max_frame_len: usize,
}

impl Default for SignalingCodec {
    fn default() -> Self {
        Self {
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

impl SignalingCodec {
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

/// Returns `(body_len, prefix_len)` once the whole varint prefix is buffered.
fn peek_length(src: &[u8]) -> Result<Option<(usize, usize)>, DecodeError> {
    let Some(end) = src
        .iter()
        .take(MAX_VARINT_LEN)
        .position(|byte| byte & 0x80 == 0)
    else {
        if src.len() >= MAX_VARINT_LEN {
            return Err(DecodeError::InvalidLength);
        }
        return Ok(None);
    };
    let prefix_len = end + 1;
    let mut prefix = &src[..prefix_len];
    let len = prost::encoding::decode_varint(&mut prefix)
        .map_err(|_| DecodeError::InvalidLength)?;
    let len = usize::try_from(len).map_err(|_| DecodeError::InvalidLength)?;
    Ok(Some((len, prefix_len)))
}

impl Decoder for SignalingCodec {
    type Item = Message;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some((len, prefix_len)) = peek_length(src)? else {
            return Ok(None);
        };
        if len > self.max_frame_len {
            return Err(DecodeError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        let frame_len = prefix_len + len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }
        src.advance(prefix_len);
        let body = src.split_to(len);
        let wire = WireMessage::decode(body.freeze())?;
        Message::try_from(wire).map(Some)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() => Ok(None),
            None => Err(DecodeError::Truncated(src.len())),
        }
    }
}

impl Encoder<Message> for SignalingCodec {
    type Error = DecodeError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = WireMessage::from(&item);
        let len = wire.encoded_len();
        if len > self.max_frame_len {
            return Err(DecodeError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        dst.reserve(len + prost::length_delimiter_len(len));
        wire.encode_length_delimited(dst)
            .map_err(|err| std::io::Error::other(err.to_string()))?;
        Ok(())
    }
}
