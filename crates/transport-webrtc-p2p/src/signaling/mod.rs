//! SDP offer/answer and trickle-ICE exchange over a bootstrap byte stream.

mod initiator;
mod responder;

pub use initiator::initiate;
pub use responder::{respond, respond_with_cancel};

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::codec::{DecodeError, Message, MessageKind, SignalingCodec};
use crate::config::RtcConfig;

pub(crate) const REMOTE_DESCRIPTION_FAILED: &str = "Failed to set remoteDescription";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("malformed signaling message: {0}")]
    Decode(DecodeError),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("{context}{}", .source.as_ref().map(|err| format!(": {err}")).unwrap_or_default())]
    Negotiation {
        context: String,
        #[source]
        source: Option<BoxError>,
    },
    #[error("webrtc setup failed: {0}")]
    Setup(String),
    #[error("negotiation cancelled")]
    Cancelled,
    #[error("bootstrap stream i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

impl SignalingError {
    pub(crate) fn negotiation(context: impl Into<String>) -> Self {
        Self::Negotiation {
            context: context.into(),
            source: None,
        }
    }

    pub(crate) fn negotiation_with(
        context: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Negotiation {
            context: context.into(),
            source: Some(source.into()),
        }
    }
}

impl From<DecodeError> for SignalingError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Io(err) => SignalingError::Io(err),
            other => SignalingError::Decode(other),
        }
    }
}

pub(crate) fn to_setup_error<E: fmt::Display>(err: E) -> SignalingError {
    SignalingError::Setup(err.to_string())
}

/// Who the responder is talking to; only used to tag logs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionContext {
    pub remote_peer: String,
}

impl ConnectionContext {
    pub fn new(remote_peer: impl Into<String>) -> Self {
        Self {
            remote_peer: remote_peer.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Role {
    Initiator,
    Responder,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }
}

fn build_api(setting: SettingEngine) -> Result<API, SignalingError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

pub type PeerConnectionHook = Arc<dyn Fn(&Arc<RTCPeerConnection>) + Send + Sync>;

/// Builds peer connections that share one webrtc-rs `API` and ICE setup.
pub struct PeerConnectionFactory {
    api: API,
    config: RtcConfig,
    on_peer_connection: Option<PeerConnectionHook>,
}

impl PeerConnectionFactory {
    pub fn new(config: RtcConfig) -> Result<Self, SignalingError> {
        Self::with_setting_engine(SettingEngine::default(), config)
    }

    /// Uses `setting` as the base engine, e.g. one bound to a virtual
    /// network. ICE timeouts from `config` are applied on top.
    pub fn with_setting_engine(
        mut setting: SettingEngine,
        config: RtcConfig,
    ) -> Result<Self, SignalingError> {
        let timeouts = config.ice_timeouts;
        setting.set_ice_timeouts(
            Some(timeouts.disconnected),
            Some(timeouts.failed),
            Some(timeouts.keepalive),
        );
        Ok(Self {
            api: build_api(setting)?,
            config,
            on_peer_connection: None,
        })
    }

    /// Called with every peer connection this factory builds, before
    /// negotiation touches it. Do not replace its event handlers.
    pub fn on_peer_connection(
        mut self,
        f: impl Fn(&Arc<RTCPeerConnection>) + Send + Sync + 'static,
    ) -> Self {
        self.on_peer_connection = Some(Arc::new(f));
        self
    }

    pub fn config(&self) -> &RtcConfig {
        &self.config
    }

    pub(crate) async fn new_peer_connection(
        &self,
        role: Role,
    ) -> Result<PendingPeer, SignalingError> {
        let configuration = RTCConfiguration {
            ice_servers: self.config.ice_servers.clone(),
            ..Default::default()
        };
        trace!(
            target = "transport_webrtc_p2p::signaling",
            role = role.as_str(),
            await = "api.new_peer_connection",
            state = "start"
        );
        let pc_result = self.api.new_peer_connection(configuration).await;
        trace!(
            target = "transport_webrtc_p2p::signaling",
            role = role.as_str(),
            await = "api.new_peer_connection",
            state = "end",
            ok = pc_result.is_ok()
        );
        let pc = Arc::new(pc_result.map_err(to_setup_error)?);
        if let Some(on_peer_connection) = &self.on_peer_connection {
            on_peer_connection(&pc);
        }
        Ok(PendingPeer::new(pc))
    }
}

/// Closes the peer connection unless negotiation got far enough to
/// [`disarm`](Self::disarm) it. Covers early returns, cancellation and a
/// dropped future alike.
pub(crate) struct PendingPeer {
    pc: Arc<RTCPeerConnection>,
    armed: bool,
}

impl PendingPeer {
    fn new(pc: Arc<RTCPeerConnection>) -> Self {
        Self { pc, armed: true }
    }

    pub(crate) fn disarm(mut self) -> Arc<RTCPeerConnection> {
        self.armed = false;
        Arc::clone(&self.pc)
    }
}

impl Deref for PendingPeer {
    type Target = Arc<RTCPeerConnection>;

    fn deref(&self) -> &Self::Target {
        &self.pc
    }
}

impl Drop for PendingPeer {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let pc = Arc::clone(&self.pc);
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = pc.close().await {
                        debug!(
                            target = "transport_webrtc_p2p::signaling",
                            error = %err,
                            "closing abandoned peer connection failed"
                        );
                    }
                });
            }
            Err(_) => debug!(
                target = "transport_webrtc_p2p::signaling",
                "no runtime to close abandoned peer connection"
            ),
        }
    }
}

/// The bootstrap stream wrapped in the signaling codec.
pub(crate) struct SignalingChannel<S> {
    framed: Framed<S, SignalingCodec>,
    role: Role,
}

impl<S> SignalingChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(stream: S, role: Role) -> Self {
        Self {
            framed: Framed::new(stream, SignalingCodec::default()),
            role,
        }
    }

    pub(crate) async fn send(&mut self, message: Message) -> Result<(), SignalingError> {
        trace!(
            target = "transport_webrtc_p2p::signaling",
            role = self.role.as_str(),
            kind = %message.kind,
            len = message.data.len(),
            "sending signaling message"
        );
        self.framed.send(message).await.map_err(SignalingError::from)
    }

    /// `Ok(None)` when the remote closed the stream.
    pub(crate) async fn next(&mut self) -> Result<Option<Message>, SignalingError> {
        match self.framed.next().await {
            Some(Ok(message)) => {
                trace!(
                    target = "transport_webrtc_p2p::signaling",
                    role = self.role.as_str(),
                    kind = %message.kind,
                    len = message.data.len(),
                    "received signaling message"
                );
                Ok(Some(message))
            }
            Some(Err(err)) => Err(err.into()),
            None => Ok(None),
        }
    }
}

/// Local ICE candidates and connection-state changes of one peer
/// connection, captured from its callbacks.
pub(crate) struct PeerEvents {
    candidates: mpsc::UnboundedReceiver<Option<RTCIceCandidateInit>>,
    state: watch::Receiver<RTCPeerConnectionState>,
}

impl PeerEvents {
    /// Must run before the local description is set so no candidate is
    /// missed.
    pub(crate) fn subscribe(pc: &RTCPeerConnection) -> Self {
        let (candidate_tx, candidates) = mpsc::unbounded_channel();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                let init = match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => Some(init),
                        Err(err) => {
                            warn!(
                                target = "transport_webrtc_p2p::signaling",
                                error = %err,
                                "failed to serialize local candidate"
                            );
                            return;
                        }
                    },
                    None => None,
                };
                let _ = candidate_tx.send(init);
            })
        }));

        let (state_tx, state) = watch::channel(pc.connection_state());
        pc.on_peer_connection_state_change(Box::new(move |next| {
            let _ = state_tx.send(next);
            Box::pin(async {})
        }));

        Self { candidates, state }
    }

    fn current(&self) -> RTCPeerConnectionState {
        *self.state.borrow()
    }
}

/// Drops the negotiation-time callbacks once the connection is handed on.
fn unsubscribe(pc: &RTCPeerConnection) {
    pc.on_ice_candidate(Box::new(|_| Box::pin(async {})));
    pc.on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));
}

/// Races `negotiation` against `cancel`. Losing the race drops the
/// negotiation future, which releases the bootstrap stream and closes the
/// half-built peer connection.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    negotiation: impl Future<Output = Result<T, SignalingError>>,
) -> Result<T, SignalingError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SignalingError::Cancelled),
        result = negotiation => result,
    }
}

/// Trickles candidates both ways until the connection is up.
pub(crate) async fn exchange_candidates<S>(
    channel: &mut SignalingChannel<S>,
    pc: &RTCPeerConnection,
    mut events: PeerEvents,
    eof_grace: Duration,
) -> Result<(), SignalingError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let role = channel.role;
    let mut local_done = false;
    let result = loop {
        match events.current() {
            RTCPeerConnectionState::Connected => break Ok(()),
            state @ (RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed) => {
                break Err(SignalingError::negotiation(format!(
                    "peer connection {state} during negotiation"
                )));
            }
            _ => {}
        }

        enum Step {
            State(bool),
            Local(Option<Option<RTCIceCandidateInit>>),
            Remote(Result<Option<Message>, SignalingError>),
        }

        // Remote before local: once the remote hung up there is no one left
        // to send candidates to.
        let step = tokio::select! {
            biased;
            changed = events.state.changed() => Step::State(changed.is_ok()),
            remote = channel.next() => Step::Remote(remote),
            local = events.candidates.recv(), if !local_done => Step::Local(local),
        };

        match step {
            Step::State(true) => {}
            Step::State(false) => {
                break Err(SignalingError::negotiation(
                    "peer connection dropped during negotiation",
                ));
            }
            Step::Local(Some(Some(candidate))) => {
                let json = match serde_json::to_string(&candidate) {
                    Ok(json) => json,
                    Err(err) => {
                        break Err(SignalingError::negotiation_with(
                            "Failed to encode ICE candidate",
                            err,
                        ));
                    }
                };
                match channel.send(Message::candidate(json)).await {
                    Ok(()) => {}
                    Err(SignalingError::Io(err)) => {
                        break remote_hung_up(&mut events, role, eof_grace, err).await;
                    }
                    Err(err) => break Err(err),
                }
            }
            Step::Local(Some(None)) | Step::Local(None) => {
                local_done = true;
                trace!(
                    target = "transport_webrtc_p2p::signaling",
                    role = role.as_str(),
                    "local candidate gathering complete"
                );
                match channel.send(Message::end_of_candidates()).await {
                    Ok(()) => {}
                    Err(SignalingError::Io(err)) => {
                        break remote_hung_up(&mut events, role, eof_grace, err).await;
                    }
                    Err(err) => break Err(err),
                }
            }
            Step::Remote(Ok(Some(message))) => {
                if let Err(err) = apply_remote_candidate(pc, role, message).await {
                    break Err(err);
                }
            }
            Step::Remote(Ok(None)) => {
                break wait_after_eof(&mut events, role, eof_grace).await;
            }
            Step::Remote(Err(err)) => break Err(err),
        }
    };
    unsubscribe(pc);
    result
}

async fn apply_remote_candidate(
    pc: &RTCPeerConnection,
    role: Role,
    message: Message,
) -> Result<(), SignalingError> {
    if message.kind != MessageKind::IceCandidate {
        return Err(SignalingError::Protocol(format!(
            "expected {} during ICE exchange, received {}",
            MessageKind::IceCandidate,
            message.kind
        )));
    }
    let data = message.data.trim();
    if data.is_empty() || data == "null" {
        trace!(
            target = "transport_webrtc_p2p::signaling",
            role = role.as_str(),
            "remote finished gathering candidates"
        );
        return Ok(());
    }
    let candidate: RTCIceCandidateInit = serde_json::from_str(data)
        .map_err(|err| SignalingError::negotiation_with("Failed to parse ICE candidate", err))?;
    trace!(
        target = "transport_webrtc_p2p::signaling",
        role = role.as_str(),
        candidate = %candidate.candidate,
        "adding remote candidate"
    );
    pc.add_ice_candidate(candidate)
        .await
        .map_err(|err| SignalingError::negotiation_with("Failed to add ICE candidate", err))
}

/// A write to the bootstrap stream failed. The remote most likely connected
/// and dropped its end, so this gets the same grace as a read EOF.
async fn remote_hung_up(
    events: &mut PeerEvents,
    role: Role,
    grace: Duration,
    err: std::io::Error,
) -> Result<(), SignalingError> {
    debug!(
        target = "transport_webrtc_p2p::signaling",
        role = role.as_str(),
        error = %err,
        "bootstrap stream write failed"
    );
    wait_after_eof(events, role, grace).await
}

/// The remote hung up. That is fine if our side is already connected or
/// gets there within `grace`; the remote may simply have finished first.
async fn wait_after_eof(
    events: &mut PeerEvents,
    role: Role,
    grace: Duration,
) -> Result<(), SignalingError> {
    let closed = || {
        SignalingError::negotiation("bootstrap stream closed before the connection was established")
    };
    match events.current() {
        RTCPeerConnectionState::Connected => return Ok(()),
        RTCPeerConnectionState::Connecting => {}
        _ => return Err(closed()),
    }
    debug!(
        target = "transport_webrtc_p2p::signaling",
        role = role.as_str(),
        grace_ms = grace.as_millis() as u64,
        "bootstrap stream closed while connecting; waiting for connection"
    );
    let wait = async {
        loop {
            match events.current() {
                RTCPeerConnectionState::Connected => return Ok(()),
                RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting => {}
                _ => return Err(closed()),
            }
            if events.state.changed().await.is_err() {
                return Err(closed());
            }
        }
    };
    tokio::time::timeout(grace, wait)
        .await
        .unwrap_or_else(|_| Err(closed()))
}

pub(crate) fn log_failure(role: Role, remote: &str, err: &SignalingError) {
    match err {
        SignalingError::Cancelled => debug!(
            target = "transport_webrtc_p2p::signaling",
            role = role.as_str(),
            remote,
            "negotiation cancelled"
        ),
        err => warn!(
            target = "transport_webrtc_p2p::signaling",
            role = role.as_str(),
            remote,
            error = %err,
            "negotiation failed"
        ),
    }
}
