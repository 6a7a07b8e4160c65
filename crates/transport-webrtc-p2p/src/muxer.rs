use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::mem;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::config::RtcConfig;
use crate::stream::{CloseHook, Direction, StreamId, StreamInit, WebRtcStream};

pub const WEBRTC_PROTOCOL_NAME: &str = "/webrtc";

/// How long a rejected inbound channel gets to open before it is closed
/// anyway.
const REJECTED_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

pub type StreamCallback = Arc<dyn Fn(WebRtcStream) + Send + Sync>;

#[derive(Clone, Default)]
pub struct MuxerInit {
    /// Called for every inbound stream the muxer adopts, including the ones
    /// that were buffered before it existed.
    pub on_incoming_stream: Option<StreamCallback>,
    /// Called once per stream after it closed and left the muxer.
    pub on_stream_end: Option<StreamCallback>,
}

impl MuxerInit {
    pub fn on_incoming_stream(mut self, f: impl Fn(WebRtcStream) + Send + Sync + 'static) -> Self {
        self.on_incoming_stream = Some(Arc::new(f));
        self
    }

    pub fn on_stream_end(mut self, f: impl Fn(WebRtcStream) + Send + Sync + 'static) -> Self {
        self.on_stream_end = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for MuxerInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxerInit")
            .field("on_incoming_stream", &self.on_incoming_stream.is_some())
            .field("on_stream_end", &self.on_stream_end.is_some())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum MuxerError {
    #[error("failed to create data channel: {0}")]
    CreateChannel(#[source] webrtc::Error),
    #[error("muxer is closed")]
    Closed,
}

enum MuxEvent {
    Incoming(WebRtcStream),
    ConnectionLost(RTCPeerConnectionState),
}

/// Removes the stream from `shared` as part of its close, so the collection
/// is up to date by the time `close()` returns.
fn close_hook(shared: &Arc<Shared>) -> CloseHook {
    let shared: Weak<Shared> = Arc::downgrade(shared);
    Arc::new(move |id| {
        if let Some(shared) = shared.upgrade() {
            shared.remove(id);
        }
    })
}

enum Inbound {
    Pending(VecDeque<WebRtcStream>),
    Live(mpsc::UnboundedSender<MuxEvent>),
}

/// Where inbound streams go: a bounded buffer until a muxer exists, then the
/// muxer's event channel. The switch happens under one lock so no stream is
/// lost or seen twice.
struct InboundRoute {
    capacity: usize,
    inbound: Mutex<Inbound>,
}

impl InboundRoute {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inbound: Mutex::new(Inbound::Pending(VecDeque::new())),
        }
    }

    /// Hands the stream back when there is nowhere to put it.
    fn accept(&self, stream: WebRtcStream) -> Result<(), WebRtcStream> {
        let mut inbound = self.inbound.lock();
        match &mut *inbound {
            Inbound::Pending(buffer) => {
                buffer.retain(|pending| !pending.is_closed());
                if buffer.len() >= self.capacity {
                    return Err(stream);
                }
                buffer.push_back(stream);
                Ok(())
            }
            Inbound::Live(events) => events
                .send(MuxEvent::Incoming(stream.clone()))
                .map_err(|_| stream),
        }
    }

    fn go_live(&self, events: mpsc::UnboundedSender<MuxEvent>) -> VecDeque<WebRtcStream> {
        match mem::replace(&mut *self.inbound.lock(), Inbound::Live(events)) {
            Inbound::Pending(buffer) => buffer,
            Inbound::Live(_) => VecDeque::new(),
        }
    }

    fn pending(&self) -> Vec<WebRtcStream> {
        match &*self.inbound.lock() {
            Inbound::Pending(buffer) => buffer.iter().cloned().collect(),
            Inbound::Live(_) => Vec::new(),
        }
    }
}

/// A native channel only opens after the `on_data_channel` handler returns,
/// and closing it before then never reaches the remote. Wait for the open,
/// then close.
async fn close_rejected(stream: WebRtcStream) {
    match tokio::time::timeout(REJECTED_OPEN_TIMEOUT, stream.ready()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => trace!(
            target = "transport_webrtc_p2p::muxer",
            stream_id = %stream.id(),
            error = %err,
            "rejected stream never opened"
        ),
        Err(_) => trace!(
            target = "transport_webrtc_p2p::muxer",
            stream_id = %stream.id(),
            "rejected stream did not open in time"
        ),
    }
    stream.close().await;
}

/// Takes ownership of a negotiated peer connection and buffers the data
/// channels the remote opens until [`create_muxer`](Self::create_muxer) runs.
pub struct DataChannelMuxerFactory {
    pc: Arc<RTCPeerConnection>,
    config: RtcConfig,
    protocol: String,
    route: Arc<InboundRoute>,
    shared: Arc<Shared>,
    events_tx: mpsc::UnboundedSender<MuxEvent>,
    events_rx: mpsc::UnboundedReceiver<MuxEvent>,
}

impl DataChannelMuxerFactory {
    pub fn new(pc: Arc<RTCPeerConnection>, config: RtcConfig) -> Self {
        let route = Arc::new(InboundRoute::new(config.max_pending_streams));
        let shared = Arc::new(Shared::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inbound_route = route.clone();
        let inbound_shared = shared.clone();
        let max_msg_size = config.max_message_size;
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let route = inbound_route.clone();
            let on_close = close_hook(&inbound_shared);
            Box::pin(async move {
                let stream = WebRtcStream::from_data_channel(
                    dc,
                    StreamInit {
                        direction: Direction::Inbound,
                        max_msg_size,
                        on_close: Some(on_close),
                    },
                );
                trace!(
                    target = "transport_webrtc_p2p::muxer",
                    stream_id = %stream.id(),
                    label = stream.label(),
                    "inbound data channel"
                );
                if let Err(stream) = route.accept(stream) {
                    warn!(
                        target = "transport_webrtc_p2p::muxer",
                        stream_id = %stream.id(),
                        capacity = route.capacity,
                        "no room for inbound stream; closing it"
                    );
                    tokio::spawn(close_rejected(stream));
                }
            })
        }));

        let state_events = events_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            if matches!(
                state,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
            ) {
                let _ = state_events.send(MuxEvent::ConnectionLost(state));
            }
            Box::pin(async {})
        }));

        Self {
            pc,
            config,
            protocol: WEBRTC_PROTOCOL_NAME.to_string(),
            route,
            shared,
            events_tx,
            events_rx,
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    /// Snapshot of the inbound streams still waiting for a muxer.
    pub fn pending_streams(&self) -> Vec<WebRtcStream> {
        self.route.pending()
    }

    /// Builds the muxer and hands it every buffered stream that is still
    /// open, in arrival order. Must be called inside a Tokio runtime.
    pub fn create_muxer(self, init: MuxerInit) -> DataChannelMuxer {
        let Self {
            pc,
            config,
            protocol,
            route,
            shared,
            events_tx,
            events_rx,
        } = self;
        // The factory is consumed here, so this is the only set.
        let _ = shared.callbacks.set(init);

        let mut adopted = 0usize;
        for stream in route.go_live(events_tx) {
            if stream.is_closed() {
                trace!(
                    target = "transport_webrtc_p2p::muxer",
                    stream_id = %stream.id(),
                    "dropping pending stream that already closed"
                );
                continue;
            }
            if shared.adopt_incoming(stream) {
                adopted += 1;
            }
        }
        debug!(
            target = "transport_webrtc_p2p::muxer",
            protocol = %protocol,
            adopted,
            "muxer created"
        );

        let task = tokio::spawn(run_events(shared.clone(), pc.clone(), events_rx));
        DataChannelMuxer {
            pc,
            shared,
            protocol,
            max_msg_size: config.max_message_size,
            task,
        }
    }
}

struct Shared {
    streams: Mutex<Vec<WebRtcStream>>,
    closed: AtomicBool,
    callbacks: OnceCell<MuxerInit>,
}

impl Shared {
    fn new() -> Self {
        Self {
            streams: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            callbacks: OnceCell::new(),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn track(&self, stream: WebRtcStream) -> bool {
        let mut streams = self.streams.lock();
        // Checked under the lock: a close that lands after this point waits
        // for the lock in `remove` and finds the entry.
        if self.is_closed() || stream.is_closed() {
            return false;
        }
        if !streams.contains(&stream) {
            streams.push(stream);
        }
        true
    }

    fn adopt_incoming(&self, stream: WebRtcStream) -> bool {
        if !self.track(stream.clone()) {
            return false;
        }
        if let Some(on_incoming) = self
            .callbacks
            .get()
            .and_then(|init| init.on_incoming_stream.as_ref())
        {
            on_incoming(stream);
        }
        true
    }

    /// Drops a closed stream from the collection. Only the first call for a
    /// given stream reports it.
    fn remove(&self, id: StreamId) {
        let removed = {
            let mut streams = self.streams.lock();
            streams
                .iter()
                .position(|stream| stream.id() == id && stream.is_closed())
                .map(|index| streams.remove(index))
        };
        let Some(stream) = removed else {
            return;
        };
        debug!(
            target = "transport_webrtc_p2p::muxer",
            stream_id = %id,
            direction = ?stream.direction(),
            "stream ended"
        );
        if let Some(on_stream_end) = self
            .callbacks
            .get()
            .and_then(|init| init.on_stream_end.as_ref())
        {
            on_stream_end(stream);
        }
    }

    fn snapshot(&self) -> Vec<WebRtcStream> {
        self.streams.lock().clone()
    }

    /// Every tracked stream has left the collection by the time this
    /// returns.
    async fn shutdown(&self, pc: &RTCPeerConnection, reason: Option<String>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let streams = self.snapshot();
        debug!(
            target = "transport_webrtc_p2p::muxer",
            streams = streams.len(),
            reason = reason.as_deref().unwrap_or(""),
            "closing muxer"
        );
        for stream in streams {
            match &reason {
                Some(reason) => stream.abort(reason.clone()).await,
                None => stream.close().await,
            }
            // Covers a close already in flight whose hook has not run yet.
            self.remove(stream.id());
        }
        if let Err(err) = pc.close().await {
            warn!(
                target = "transport_webrtc_p2p::muxer",
                error = %err,
                "closing peer connection failed"
            );
        }
    }
}

async fn run_events(
    shared: Arc<Shared>,
    pc: Arc<RTCPeerConnection>,
    mut events: mpsc::UnboundedReceiver<MuxEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            MuxEvent::Incoming(stream) => {
                if !shared.adopt_incoming(stream.clone()) && !stream.is_closed() {
                    stream.abort("muxer closed").await;
                }
            }
            MuxEvent::ConnectionLost(state) => {
                if !shared.is_closed() {
                    warn!(
                        target = "transport_webrtc_p2p::muxer",
                        %state,
                        "peer connection lost; closing muxer"
                    );
                }
                shared
                    .shutdown(&pc, Some(format!("peer connection {state}")))
                    .await;
            }
        }
    }
}

/// Multiplexes logical streams over the data channels of one peer
/// connection.
pub struct DataChannelMuxer {
    pc: Arc<RTCPeerConnection>,
    shared: Arc<Shared>,
    protocol: String,
    max_msg_size: usize,
    task: JoinHandle<()>,
}

impl DataChannelMuxer {
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    /// Opens a new outbound stream. The channel may still be connecting when
    /// this returns; use [`WebRtcStream::ready`] before the first write.
    pub async fn new_stream(&self) -> Result<WebRtcStream, MuxerError> {
        if self.shared.is_closed() {
            return Err(MuxerError::Closed);
        }
        let dc = self
            .pc
            .create_data_channel("", None)
            .await
            .map_err(MuxerError::CreateChannel)?;
        let stream = WebRtcStream::from_data_channel(
            dc,
            StreamInit {
                direction: Direction::Outbound,
                max_msg_size: self.max_msg_size,
                on_close: Some(close_hook(&self.shared)),
            },
        );
        if !self.shared.track(stream.clone()) {
            stream.abort("muxer closed").await;
            return Err(MuxerError::Closed);
        }
        debug!(
            target = "transport_webrtc_p2p::muxer",
            stream_id = %stream.id(),
            "outbound stream created"
        );
        Ok(stream)
    }

    /// Live streams in the order the muxer learned about them.
    pub fn streams(&self) -> Vec<WebRtcStream> {
        self.shared.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Aborts every stream with `reason`, or closes them gracefully without
    /// one, then closes the peer connection. Later calls do nothing.
    pub async fn close(&self, reason: Option<String>) {
        self.shared.shutdown(&self.pc, reason).await;
    }

    /// The muxer carries no data of its own.
    pub fn io(&self) -> NopDuplex {
        NopDuplex
    }
}

impl Drop for DataChannelMuxer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Reads as EOF and swallows writes.
#[derive(Clone, Copy, Debug, Default)]
pub struct NopDuplex;

impl AsyncRead for NopDuplex {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for NopDuplex {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
