use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::pin::pin;
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, trace};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;

use crate::channel::{self, NativeChannel};

/// Identity of a stream: the address of the native channel it wraps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(usize);

impl StreamId {
    fn of(channel: &Arc<dyn NativeChannel>) -> Self {
        Self(Arc::as_ptr(channel) as *const () as usize)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Open,
    ReadClosed,
    WriteClosed,
    Closed,
}

impl StreamState {
    pub fn is_readable(self) -> bool {
        matches!(self, StreamState::Open | StreamState::WriteClosed)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, StreamState::Open | StreamState::ReadClosed)
    }

    fn close_read(self) -> Self {
        match self {
            StreamState::Open => StreamState::ReadClosed,
            StreamState::WriteClosed => StreamState::Closed,
            other => other,
        }
    }

    fn close_write(self) -> Self {
        match self {
            StreamState::Open => StreamState::WriteClosed,
            StreamState::ReadClosed => StreamState::Closed,
            other => other,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeline {
    pub open: SystemTime,
    pub close: Option<SystemTime>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamStat {
    pub direction: Direction,
    pub timeline: Timeline,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream not writable: stream is {stream:?}, channel is {channel}")]
    State {
        stream: StreamState,
        channel: RTCDataChannelState,
    },
    #[error("stream aborted: {0}")]
    Aborted(String),
    #[error("data channel send failed: {0}")]
    Channel(#[from] webrtc::Error),
}

/// Invoked once with the stream's id when it reaches [`StreamState::Closed`].
pub type CloseHook = Arc<dyn Fn(StreamId) + Send + Sync>;

pub struct StreamInit {
    pub direction: Direction,
    pub max_msg_size: usize,
    pub on_close: Option<CloseHook>,
}

/// Splits `data` into pieces of at most `max_msg_size` bytes. An empty
/// payload yields a single empty piece so zero-length writes still reach the
/// wire.
pub fn chunk_message(data: Bytes, max_msg_size: usize) -> impl Iterator<Item = Bytes> {
    let max = max_msg_size.max(1);
    let count = data.len().div_ceil(max).max(1);
    (0..count).map(move |index| {
        let start = index * max;
        let end = (start + max).min(data.len());
        data.slice(start..end)
    })
}

#[derive(Debug)]
struct Lifecycle {
    state: StreamState,
    close: Option<SystemTime>,
    abort_reason: Option<String>,
}

struct Inner {
    id: StreamId,
    channel: Arc<dyn NativeChannel>,
    label: String,
    direction: Direction,
    opened_at: SystemTime,
    max_msg_size: usize,
    lifecycle: Mutex<Lifecycle>,
    inbound: Mutex<VecDeque<Bytes>>,
    readable: Notify,
    opened: Notify,
    write_lock: AsyncMutex<()>,
    on_close: Option<CloseHook>,
}

/// A logical byte stream carried by exactly one native data channel.
///
/// Handles are cheap to clone and compare equal when they wrap the same
/// channel. Each native message is one read item; nothing is reassembled.
#[derive(Clone)]
pub struct WebRtcStream {
    inner: Arc<Inner>,
}

#[derive(Clone)]
pub(crate) struct WeakStream(Weak<Inner>);

impl WeakStream {
    pub(crate) fn upgrade(&self) -> Option<WebRtcStream> {
        self.0.upgrade().map(|inner| WebRtcStream { inner })
    }
}

impl WebRtcStream {
    pub fn new(channel: Arc<dyn NativeChannel>, init: StreamInit) -> Self {
        let id = StreamId::of(&channel);
        let label = channel.label();
        Self {
            inner: Arc::new(Inner {
                id,
                channel,
                label,
                direction: init.direction,
                opened_at: SystemTime::now(),
                max_msg_size: init.max_msg_size.max(1),
                lifecycle: Mutex::new(Lifecycle {
                    state: StreamState::Open,
                    close: None,
                    abort_reason: None,
                }),
                inbound: Mutex::new(VecDeque::new()),
                readable: Notify::new(),
                opened: Notify::new(),
                write_lock: AsyncMutex::new(()),
                on_close: init.on_close,
            }),
        }
    }

    /// Wraps a webrtc-rs channel and subscribes to its events.
    pub fn from_data_channel(dc: Arc<RTCDataChannel>, init: StreamInit) -> Self {
        let native: Arc<dyn NativeChannel> = dc.clone();
        let stream = Self::new(native, init);
        channel::attach(&stream, &dc);
        stream
    }

    pub fn id(&self) -> StreamId {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn state(&self) -> StreamState {
        self.inner.lifecycle.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == StreamState::Closed
    }

    pub fn channel_state(&self) -> RTCDataChannelState {
        self.inner.channel.ready_state()
    }

    pub fn stat(&self) -> StreamStat {
        StreamStat {
            direction: self.inner.direction,
            timeline: Timeline {
                open: self.inner.opened_at,
                close: self.inner.lifecycle.lock().close,
            },
        }
    }

    /// Waits until the native channel is open. Fails if the stream or the
    /// channel closes first.
    pub async fn ready(&self) -> Result<(), StreamError> {
        loop {
            let mut opened = pin!(self.inner.opened.notified());
            opened.as_mut().enable();
            let channel = self.inner.channel.ready_state();
            if channel == RTCDataChannelState::Open {
                return Ok(());
            }
            let stream = self.state();
            if matches!(
                channel,
                RTCDataChannelState::Closing | RTCDataChannelState::Closed
            ) || !stream.is_writable()
            {
                return Err(self.abort_error().unwrap_or(StreamError::State { stream, channel }));
            }
            opened.await;
        }
    }

    /// Writes one logical message, split into as many native messages as
    /// `max_msg_size` requires. Concurrent sends on the same stream queue up
    /// behind each other.
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<(), StreamError> {
        let data = data.into();
        let _write = self.inner.write_lock.lock().await;
        self.ensure_writable()?;
        let total = data.len();
        for chunk in chunk_message(data, self.inner.max_msg_size) {
            // An abort between chunks drops the rest of the message.
            self.ensure_writable()?;
            let len = chunk.len();
            self.inner.channel.send(&chunk).await?;
            trace!(
                target = "transport_webrtc_p2p::stream",
                stream_id = %self.inner.id,
                len,
                total,
                "sent chunk"
            );
        }
        Ok(())
    }

    /// Next inbound message, or `None` once the read half is closed and the
    /// queue is drained.
    pub async fn recv(&self) -> Result<Option<Bytes>, StreamError> {
        loop {
            let mut readable = pin!(self.inner.readable.notified());
            readable.as_mut().enable();
            {
                let lifecycle = self.inner.lifecycle.lock();
                if let Some(reason) = &lifecycle.abort_reason {
                    return Err(StreamError::Aborted(reason.clone()));
                }
                if let Some(message) = self.inner.inbound.lock().pop_front() {
                    return Ok(Some(message));
                }
                if !lifecycle.state.is_readable() {
                    return Ok(None);
                }
            }
            readable.await;
        }
    }

    pub async fn close_write(&self) {
        self.transition(StreamState::close_write, None).await;
    }

    pub async fn close_read(&self) {
        self.transition(StreamState::close_read, None).await;
    }

    pub async fn close(&self) {
        self.transition(|_| StreamState::Closed, None).await;
    }

    /// Closes both halves immediately and drops anything not yet read.
    pub async fn abort(&self, reason: impl Into<String>) {
        self.transition(|_| StreamState::Closed, Some(reason.into()))
            .await;
    }

    pub(crate) fn downgrade(&self) -> WeakStream {
        WeakStream(Arc::downgrade(&self.inner))
    }

    pub(crate) fn deliver(&self, message: Bytes) {
        let readable = self.inner.lifecycle.lock().state.is_readable();
        if !readable {
            trace!(
                target = "transport_webrtc_p2p::stream",
                stream_id = %self.inner.id,
                len = message.len(),
                "dropping message for closed read half"
            );
            return;
        }
        self.inner.inbound.lock().push_back(message);
        self.inner.readable.notify_waiters();
    }

    pub(crate) fn handle_open(&self) {
        trace!(
            target = "transport_webrtc_p2p::stream",
            stream_id = %self.inner.id,
            "data channel open"
        );
        self.inner.opened.notify_waiters();
    }

    /// The remote closed the channel: both halves end, queued data stays
    /// readable.
    pub(crate) async fn handle_remote_close(&self) {
        self.transition(|_| StreamState::Closed, None).await;
    }

    fn abort_error(&self) -> Option<StreamError> {
        self.inner
            .lifecycle
            .lock()
            .abort_reason
            .clone()
            .map(StreamError::Aborted)
    }

    fn ensure_writable(&self) -> Result<(), StreamError> {
        let stream = self.state();
        let channel = self.inner.channel.ready_state();
        if let Some(err) = self.abort_error() {
            return Err(err);
        }
        if !stream.is_writable() || channel != RTCDataChannelState::Open {
            return Err(StreamError::State { stream, channel });
        }
        Ok(())
    }

    async fn transition(&self, next: impl FnOnce(StreamState) -> StreamState, abort: Option<String>) {
        let (from, to) = {
            let mut lifecycle = self.inner.lifecycle.lock();
            let from = lifecycle.state;
            let to = next(from);
            if from == to {
                return;
            }
            lifecycle.state = to;
            if let Some(reason) = abort {
                lifecycle.abort_reason = Some(reason);
                self.inner.inbound.lock().clear();
            }
            if to == StreamState::Closed {
                lifecycle.close = Some(SystemTime::now());
            }
            (from, to)
        };
        debug!(
            target = "transport_webrtc_p2p::stream",
            stream_id = %self.inner.id,
            direction = ?self.inner.direction,
            ?from,
            ?to,
            "stream state changed"
        );
        self.inner.readable.notify_waiters();
        self.inner.opened.notify_waiters();
        if to != StreamState::Closed {
            return;
        }
        if let Err(err) = self.inner.channel.close().await {
            debug!(
                target = "transport_webrtc_p2p::stream",
                stream_id = %self.inner.id,
                error = %err,
                "closing data channel failed"
            );
        }
        if let Some(on_close) = &self.inner.on_close {
            on_close(self.inner.id);
        }
    }
}

impl PartialEq for WebRtcStream {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for WebRtcStream {}

impl Hash for WebRtcStream {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for WebRtcStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebRtcStream")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("direction", &self.inner.direction)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rand::Rng;

    use super::*;
    use crate::channel::testing::RecordingChannel;

    fn stream_over(channel: &Arc<RecordingChannel>, max_msg_size: usize) -> WebRtcStream {
        WebRtcStream::new(
            channel.clone(),
            StreamInit {
                direction: Direction::Outbound,
                max_msg_size,
                on_close: None,
            },
        )
    }

    fn counting_stream(channel: &Arc<RecordingChannel>) -> (WebRtcStream, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        let stream = WebRtcStream::new(
            channel.clone(),
            StreamInit {
                direction: Direction::Inbound,
                max_msg_size: 16,
                on_close: Some(Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            },
        );
        (stream, closes)
    }

    #[test]
    fn chunking_covers_payload() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let len: usize = rng.gen_range(0..5000);
            let max = rng.gen_range(1..700);
            let payload: Vec<u8> = (0..len).map(|_| rng.r#gen()).collect();
            let chunks: Vec<Bytes> = chunk_message(Bytes::from(payload.clone()), max).collect();

            assert_eq!(chunks.len(), len.div_ceil(max).max(1));
            assert!(chunks.iter().all(|chunk| chunk.len() <= max));
            assert_eq!(chunks.concat(), payload);
        }
    }

    #[test]
    fn chunking_at_default_boundary() {
        let exact: Vec<_> = chunk_message(Bytes::from(vec![1u8; 16384]), 16384).collect();
        assert_eq!(exact.len(), 1);

        let over: Vec<_> = chunk_message(Bytes::from(vec![1u8; 16385]), 16384).collect();
        let sizes: Vec<_> = over.iter().map(Bytes::len).collect();
        assert_eq!(sizes, vec![16384, 1]);
    }

    #[tokio::test]
    async fn one_byte_message_is_one_send() {
        let channel = RecordingChannel::open();
        let stream = stream_over(&channel, 16 * 1024);
        stream.send(vec![7u8]).await.unwrap();
        assert_eq!(channel.sent(), vec![Bytes::from_static(&[7])]);
    }

    #[tokio::test]
    async fn small_max_size_splits_message() {
        let channel = RecordingChannel::open();
        let stream = stream_over(&channel, 1);
        stream.send(vec![1u8, 2]).await.unwrap();
        assert_eq!(
            channel.sent(),
            vec![Bytes::from_static(&[1]), Bytes::from_static(&[2])]
        );
    }

    #[tokio::test]
    async fn empty_write_sends_one_empty_message() {
        let channel = RecordingChannel::open();
        let stream = stream_over(&channel, 16);
        stream.send(Bytes::new()).await.unwrap();
        assert_eq!(channel.sent(), vec![Bytes::new()]);
    }

    #[tokio::test]
    async fn send_on_unopened_channel_fails() {
        let channel = RecordingChannel::with_state(RTCDataChannelState::Connecting);
        let stream = stream_over(&channel, 16);
        let err = stream.send(vec![1u8]).await.unwrap_err();
        assert!(matches!(
            err,
            StreamError::State {
                channel: RTCDataChannelState::Connecting,
                ..
            }
        ));
        assert!(channel.sent().is_empty());
    }

    #[tokio::test]
    async fn send_after_close_write_fails() {
        let channel = RecordingChannel::open();
        let stream = stream_over(&channel, 16);
        stream.close_write().await;
        assert_eq!(stream.state(), StreamState::WriteClosed);
        let err = stream.send(vec![1u8]).await.unwrap_err();
        assert!(matches!(
            err,
            StreamError::State {
                stream: StreamState::WriteClosed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn concurrent_sends_do_not_interleave() {
        let channel = RecordingChannel::open();
        let stream = stream_over(&channel, 2);
        let (a, b) = tokio::join!(
            stream.send(Bytes::from_static(b"aaaaaa")),
            stream.send(Bytes::from_static(b"bbbbbb"))
        );
        a.unwrap();
        b.unwrap();

        let sent = channel.sent();
        assert_eq!(sent.len(), 6);
        let first = sent[0][0];
        assert!(sent[..3].iter().all(|chunk| chunk[0] == first));
        assert!(sent[3..].iter().all(|chunk| chunk[0] != first));
    }

    #[tokio::test]
    async fn delivered_messages_are_read_verbatim_in_order() {
        let channel = RecordingChannel::open();
        let stream = stream_over(&channel, 16);
        stream.deliver(Bytes::from_static(b"one"));
        stream.deliver(Bytes::new());
        stream.deliver(Bytes::from_static(b"three"));

        assert_eq!(stream.recv().await.unwrap(), Some(Bytes::from_static(b"one")));
        assert_eq!(stream.recv().await.unwrap(), Some(Bytes::new()));
        assert_eq!(stream.recv().await.unwrap(), Some(Bytes::from_static(b"three")));
    }

    #[tokio::test]
    async fn recv_wakes_on_delivery() {
        let channel = RecordingChannel::open();
        let stream = stream_over(&channel, 16);
        let reader = stream.clone();
        let pending = tokio::spawn(async move { reader.recv().await });
        tokio::task::yield_now().await;
        stream.deliver(Bytes::from_static(b"late"));
        assert_eq!(
            pending.await.unwrap().unwrap(),
            Some(Bytes::from_static(b"late"))
        );
    }

    #[tokio::test]
    async fn remote_close_drains_then_ends() {
        let channel = RecordingChannel::open();
        let (stream, closes) = counting_stream(&channel);
        stream.deliver(Bytes::from_static(b"last"));
        stream.handle_remote_close().await;

        assert_eq!(stream.recv().await.unwrap(), Some(Bytes::from_static(b"last")));
        assert_eq!(stream.recv().await.unwrap(), None);
        assert!(stream.stat().timeline.close.is_some());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn half_closes_reach_closed_once() {
        let channel = RecordingChannel::open();
        let (stream, closes) = counting_stream(&channel);

        stream.close_read().await;
        assert_eq!(stream.state(), StreamState::ReadClosed);
        assert!(stream.stat().timeline.close.is_none());
        assert_eq!(channel.close_calls(), 0);

        stream.close_write().await;
        assert_eq!(stream.state(), StreamState::Closed);
        stream.close().await;
        stream.close_write().await;

        assert_eq!(channel.close_calls(), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn local_and_remote_close_race_notifies_once() {
        let channel = RecordingChannel::open();
        let (stream, closes) = counting_stream(&channel);
        tokio::join!(stream.close(), stream.handle_remote_close(), stream.close());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(channel.close_calls(), 1);
    }

    #[tokio::test]
    async fn abort_discards_queue_and_fails_reads() {
        let channel = RecordingChannel::open();
        let (stream, closes) = counting_stream(&channel);
        stream.deliver(Bytes::from_static(b"unread"));
        stream.abort("peer went away").await;

        match stream.recv().await {
            Err(StreamError::Aborted(reason)) => assert_eq!(reason, "peer went away"),
            other => panic!("unexpected read result: {other:?}"),
        }
        assert!(matches!(
            stream.send(vec![1u8]).await,
            Err(StreamError::Aborted(_))
        ));
        // Aborting a closed stream changes nothing.
        stream.abort("again").await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ready_resolves_on_open_and_fails_on_close() {
        let channel = RecordingChannel::with_state(RTCDataChannelState::Connecting);
        let stream = stream_over(&channel, 16);

        let waiter = stream.clone();
        let ready = tokio::spawn(async move { waiter.ready().await });
        tokio::task::yield_now().await;
        channel.set_state(RTCDataChannelState::Open);
        stream.handle_open();
        ready.await.unwrap().unwrap();

        let closing = RecordingChannel::with_state(RTCDataChannelState::Connecting);
        let stream = stream_over(&closing, 16);
        let waiter = stream.clone();
        let ready = tokio::spawn(async move { waiter.ready().await });
        tokio::task::yield_now().await;
        stream.close().await;
        assert!(ready.await.unwrap().is_err());
    }

    #[test]
    fn equality_follows_channel_identity() {
        let channel = RecordingChannel::open();
        let other = RecordingChannel::open();
        let a = stream_over(&channel, 16);
        let b = a.clone();
        let c = stream_over(&other, 16);

        assert_eq!(a, b);
        assert_eq!(a.id(), b.id());
        assert_ne!(a, c);
    }
}
