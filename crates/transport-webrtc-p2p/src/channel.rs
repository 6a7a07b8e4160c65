use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;

use crate::stream::WebRtcStream;

/// The slice of a native data channel that a [`WebRtcStream`] drives.
#[async_trait]
pub trait NativeChannel: Send + Sync + 'static {
    fn label(&self) -> String;

    fn ready_state(&self) -> RTCDataChannelState;

    async fn send(&self, chunk: &Bytes) -> Result<usize, webrtc::Error>;

    async fn close(&self) -> Result<(), webrtc::Error>;
}

#[async_trait]
impl NativeChannel for RTCDataChannel {
    fn label(&self) -> String {
        RTCDataChannel::label(self).to_string()
    }

    fn ready_state(&self) -> RTCDataChannelState {
        RTCDataChannel::ready_state(self)
    }

    async fn send(&self, chunk: &Bytes) -> Result<usize, webrtc::Error> {
        RTCDataChannel::send(self, chunk).await
    }

    async fn close(&self) -> Result<(), webrtc::Error> {
        RTCDataChannel::close(self).await
    }
}

/// Routes the channel's native events into `stream`. Handlers hold a weak
/// handle so the channel does not keep the stream alive.
pub(crate) fn attach(stream: &WebRtcStream, dc: &Arc<RTCDataChannel>) {
    let weak = stream.downgrade();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            if let Some(stream) = weak.upgrade() {
                stream.handle_open();
            }
        })
    }));

    let weak = stream.downgrade();
    dc.on_message(Box::new(move |message: DataChannelMessage| {
        let weak = weak.clone();
        Box::pin(async move {
            if let Some(stream) = weak.upgrade() {
                stream.deliver(message.data);
            }
        })
    }));

    let weak = stream.downgrade();
    dc.on_close(Box::new(move || {
        let weak = weak.clone();
        Box::pin(async move {
            if let Some(stream) = weak.upgrade() {
                stream.handle_remote_close().await;
            }
        })
    }));

    let weak = stream.downgrade();
    dc.on_error(Box::new(move |err: webrtc::Error| {
        let weak = weak.clone();
        Box::pin(async move {
            if let Some(stream) = weak.upgrade() {
                stream.abort(err.to_string()).await;
            }
        })
    }));
}
