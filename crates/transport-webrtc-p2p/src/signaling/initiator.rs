use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{
    PeerConnectionFactory, PeerEvents, REMOTE_DESCRIPTION_FAILED, Role, SignalingChannel,
    SignalingError, cancellable, exchange_candidates, log_failure,
};
use crate::codec::{Message, MessageKind};

const INIT_CHANNEL_LABEL: &str = "init";
// Pre-negotiated so the remote never surfaces it as an inbound channel.
const INIT_CHANNEL_ID: u16 = 1023;

/// Dials: offers over `stream`, applies the answer, trickles ICE and
/// returns the connected peer connection.
pub async fn initiate<S>(
    factory: &PeerConnectionFactory,
    stream: S,
    cancel: CancellationToken,
) -> Result<Arc<RTCPeerConnection>, SignalingError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = cancellable(&cancel, negotiate(factory, stream)).await;
    if let Err(err) = &result {
        log_failure(Role::Initiator, "", err);
    }
    result
}

async fn negotiate<S>(
    factory: &PeerConnectionFactory,
    stream: S,
) -> Result<Arc<RTCPeerConnection>, SignalingError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut channel = SignalingChannel::new(stream, Role::Initiator);
    let pc = factory.new_peer_connection(Role::Initiator).await?;
    let events = PeerEvents::subscribe(&pc);

    // Without at least one channel the offer has no application section and
    // ICE never starts gathering.
    let init_channel = pc
        .create_data_channel(
            INIT_CHANNEL_LABEL,
            Some(RTCDataChannelInit {
                negotiated: Some(INIT_CHANNEL_ID),
                ..Default::default()
            }),
        )
        .await
        .map_err(|err| SignalingError::negotiation_with("Failed to create data channel", err))?;

    let offer = pc
        .create_offer(None)
        .await
        .map_err(|err| SignalingError::negotiation_with("Failed to create offer", err))?;
    let sdp = offer.sdp.clone();
    pc.set_local_description(offer)
        .await
        .map_err(|err| SignalingError::negotiation_with("Failed to set localDescription", err))?;
    debug!(
        target = "transport_webrtc_p2p::signaling",
        role = "initiator",
        "sending offer"
    );
    channel.send(Message::offer(sdp)).await?;

    let answer = match channel.next().await? {
        Some(Message {
            kind: MessageKind::SdpAnswer,
            data,
        }) => data,
        Some(message) => {
            return Err(SignalingError::Protocol(format!(
                "remote should send an SDP answer, received {}",
                message.kind
            )));
        }
        None => {
            return Err(SignalingError::negotiation(
                "bootstrap stream closed before an SDP answer arrived",
            ));
        }
    };
    debug!(
        target = "transport_webrtc_p2p::signaling",
        role = "initiator",
        "received answer"
    );
    let description = RTCSessionDescription::answer(answer)
        .map_err(|err| SignalingError::negotiation_with(REMOTE_DESCRIPTION_FAILED, err))?;
    pc.set_remote_description(description)
        .await
        .map_err(|err| SignalingError::negotiation_with(REMOTE_DESCRIPTION_FAILED, err))?;

    exchange_candidates(&mut channel, &pc, events, factory.config().eof_grace).await?;

    if let Err(err) = init_channel.close().await {
        debug!(
            target = "transport_webrtc_p2p::signaling",
            role = "initiator",
            error = %err,
            "closing init channel failed"
        );
    }
    debug!(
        target = "transport_webrtc_p2p::signaling",
        role = "initiator",
        "peer connection established"
    );
    Ok(pc.disarm())
}
