//! Peer-to-peer byte streams over WebRTC data channels.
//!
//! Two peers that already share a duplex byte stream negotiate a peer
//! connection over it ([`signaling`]), then multiplex any number of logical
//! streams onto its data channels ([`muxer`]).

pub mod channel;
pub mod codec;
pub mod config;
pub mod muxer;
pub mod signaling;
pub mod stream;
pub mod vnet;

pub use codec::{DecodeError, Message, MessageKind, SignalingCodec};
pub use config::{IceTimeouts, RtcConfig, runtime_config};
pub use muxer::{
    DataChannelMuxer, DataChannelMuxerFactory, MuxerError, MuxerInit, NopDuplex,
    WEBRTC_PROTOCOL_NAME,
};
pub use signaling::{
    ConnectionContext, PeerConnectionFactory, PeerConnectionHook, SignalingError, initiate,
    respond, respond_with_cancel,
};
pub use stream::{Direction, StreamError, StreamId, StreamState, StreamStat, WebRtcStream};
