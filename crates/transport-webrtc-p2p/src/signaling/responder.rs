use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{
    ConnectionContext, PeerConnectionFactory, PeerEvents, REMOTE_DESCRIPTION_FAILED, Role,
    SignalingChannel, SignalingError, cancellable, exchange_candidates, log_failure,
};
use crate::codec::{Message, MessageKind};

/// Answers the offer the remote sends over `stream` and returns the
/// connected peer connection.
pub async fn respond<S>(
    factory: &PeerConnectionFactory,
    stream: S,
    context: &ConnectionContext,
) -> Result<Arc<RTCPeerConnection>, SignalingError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    respond_with_cancel(factory, stream, context, CancellationToken::new()).await
}

pub async fn respond_with_cancel<S>(
    factory: &PeerConnectionFactory,
    stream: S,
    context: &ConnectionContext,
    cancel: CancellationToken,
) -> Result<Arc<RTCPeerConnection>, SignalingError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = cancellable(&cancel, negotiate(factory, stream, context)).await;
    if let Err(err) = &result {
        log_failure(Role::Responder, &context.remote_peer, err);
    }
    result
}

async fn negotiate<S>(
    factory: &PeerConnectionFactory,
    stream: S,
    context: &ConnectionContext,
) -> Result<Arc<RTCPeerConnection>, SignalingError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let remote = context.remote_peer.as_str();
    let mut channel = SignalingChannel::new(stream, Role::Responder);

    let offer = match channel.next().await? {
        Some(Message {
            kind: MessageKind::SdpOffer,
            data,
        }) => data,
        Some(message) => {
            return Err(SignalingError::Protocol(format!(
                "remote should send an SDP offer, received {}",
                message.kind
            )));
        }
        None => {
            return Err(SignalingError::negotiation(
                "bootstrap stream closed before an SDP offer arrived",
            ));
        }
    };
    debug!(
        target = "transport_webrtc_p2p::signaling",
        role = "responder",
        remote,
        "received offer"
    );

    let pc = factory.new_peer_connection(Role::Responder).await?;
    let events = PeerEvents::subscribe(&pc);

    let description = RTCSessionDescription::offer(offer)
        .map_err(|err| SignalingError::negotiation_with(REMOTE_DESCRIPTION_FAILED, err))?;
    pc.set_remote_description(description)
        .await
        .map_err(|err| SignalingError::negotiation_with(REMOTE_DESCRIPTION_FAILED, err))?;

    let answer = pc
        .create_answer(None)
        .await
        .map_err(|err| SignalingError::negotiation_with("Failed to create answer", err))?;
    let sdp = answer.sdp.clone();
    pc.set_local_description(answer)
        .await
        .map_err(|err| SignalingError::negotiation_with("Failed to set localDescription", err))?;
    debug!(
        target = "transport_webrtc_p2p::signaling",
        role = "responder",
        remote,
        "sending answer"
    );
    channel.send(Message::answer(sdp)).await?;

    exchange_candidates(&mut channel, &pc, events, factory.config().eof_grace).await?;

    debug!(
        target = "transport_webrtc_p2p::signaling",
        role = "responder",
        remote,
        "peer connection established"
    );
    Ok(pc.disarm())
}
