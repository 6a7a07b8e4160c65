mod common;

use std::sync::Arc;
use std::time::Duration;

use common::eventually;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use transport_webrtc_p2p::vnet::factory_pair;
use transport_webrtc_p2p::{
    ConnectionContext, Message, MessageKind, PeerConnectionFactory, RtcConfig, SignalingCodec,
    SignalingError, initiate, respond, respond_with_cancel,
};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

async fn one_factory() -> (transport_webrtc_p2p::vnet::VirtualNetwork, PeerConnectionFactory) {
    let (network, factory, _) = factory_pair(RtcConfig::local())
        .await
        .expect("virtual network");
    (network, factory)
}

fn context() -> ConnectionContext {
    ConnectionContext::new("test-peer")
}

#[test_timeout::tokio_timeout_test]
async fn pair_connects_over_bootstrap_stream() {
    let pair = common::connected_pair(RtcConfig::local()).await;

    assert_eq!(
        pair.dialer.connection_state(),
        RTCPeerConnectionState::Connected
    );
    assert_eq!(
        pair.listener.connection_state(),
        RTCPeerConnectionState::Connected
    );

    pair.dialer.close().await.unwrap();
    pair.listener.close().await.unwrap();
}

#[test_timeout::tokio_timeout_test]
async fn unparseable_answer_fails_remote_description() {
    let (_network, factory) = one_factory().await;
    let (local, remote) = tokio::io::duplex(64 * 1024);

    let fake_responder = async move {
        let mut framed = Framed::new(remote, SignalingCodec::default());
        let offer = framed.next().await.unwrap().unwrap();
        assert_eq!(offer.kind, MessageKind::SdpOffer);
        assert!(offer.data.starts_with("v=0"));
        framed.send(Message::answer("bad")).await.unwrap();
        framed
    };
    let (result, _framed) = tokio::join!(
        initiate(&factory, local, CancellationToken::new()),
        fake_responder
    );

    let err = result.unwrap_err();
    assert!(matches!(err, SignalingError::Negotiation { .. }));
    assert!(err.to_string().contains("Failed to set remoteDescription"));
}

#[test_timeout::tokio_timeout_test]
async fn candidate_before_answer_is_a_protocol_error() {
    let (_network, factory) = one_factory().await;
    let (local, remote) = tokio::io::duplex(64 * 1024);

    let fake_responder = async move {
        let mut framed = Framed::new(remote, SignalingCodec::default());
        framed.next().await.unwrap().unwrap();
        framed
            .send(Message::candidate(
                r#"{"candidate":"candidate:1 1 udp 2130706431 10.0.0.9 5000 typ host","sdpMid":"0","sdpMLineIndex":0}"#,
            ))
            .await
            .unwrap();
        framed
    };
    let (result, _framed) = tokio::join!(
        initiate(&factory, local, CancellationToken::new()),
        fake_responder
    );

    match result.unwrap_err() {
        SignalingError::Protocol(reason) => {
            assert!(reason.contains("remote should send an SDP answer"), "{reason}")
        }
        other => panic!("expected protocol error, got {other}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn unparseable_offer_fails_remote_description() {
    let (_network, factory) = one_factory().await;
    let (local, remote) = tokio::io::duplex(64 * 1024);

    let fake_initiator = async move {
        let mut framed = Framed::new(local, SignalingCodec::default());
        framed.send(Message::offer("bad")).await.unwrap();
        framed
    };
    let ctx = context();
    let (result, _framed) = tokio::join!(respond(&factory, remote, &ctx), fake_initiator);

    let err = result.unwrap_err();
    assert!(err.to_string().contains("Failed to set remoteDescription"));
}

#[test_timeout::tokio_timeout_test]
async fn responder_requires_an_offer_first() {
    let (_network, factory) = one_factory().await;
    let (local, remote) = tokio::io::duplex(64 * 1024);

    let fake_initiator = async move {
        let mut framed = Framed::new(local, SignalingCodec::default());
        framed.send(Message::answer("v=0")).await.unwrap();
        framed
    };
    let ctx = context();
    let (result, _framed) = tokio::join!(respond(&factory, remote, &ctx), fake_initiator);

    match result.unwrap_err() {
        SignalingError::Protocol(reason) => {
            assert!(reason.contains("remote should send an SDP offer"), "{reason}")
        }
        other => panic!("expected protocol error, got {other}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn bootstrap_closed_before_answer_is_a_negotiation_error() {
    let (_network, factory) = one_factory().await;
    let (local, remote) = tokio::io::duplex(64 * 1024);

    let fake_responder = async move {
        let mut framed = Framed::new(remote, SignalingCodec::default());
        framed.next().await.unwrap().unwrap();
        // Hanging up without answering.
    };
    let (result, ()) = tokio::join!(
        initiate(&factory, local, CancellationToken::new()),
        fake_responder
    );

    let err = result.unwrap_err();
    assert!(matches!(err, SignalingError::Negotiation { .. }), "{err}");
    assert!(err.to_string().contains("closed before an SDP answer"));
}

#[test_timeout::tokio_timeout_test]
async fn malformed_frame_is_a_decode_error() {
    let (_network, factory) = one_factory().await;
    let (mut local, remote) = tokio::io::duplex(64 * 1024);

    local.write_all(&[0x02, 0xff, 0xff]).await.unwrap();
    let err = respond(&factory, remote, &context()).await.unwrap_err();
    assert!(matches!(err, SignalingError::Decode(_)), "{err}");
}

#[test_timeout::tokio_timeout_test]
async fn cancelling_initiator_releases_bootstrap_stream() {
    let (_network, factory) = one_factory().await;
    let created = Arc::new(Mutex::new(Vec::<Arc<RTCPeerConnection>>::new()));
    let record = created.clone();
    let factory = factory.on_peer_connection(move |pc| record.lock().push(pc.clone()));
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    let silent_responder = async move {
        let mut framed = Framed::new(remote, SignalingCodec::default());
        let offer = framed.next().await.unwrap().unwrap();
        assert_eq!(offer.kind, MessageKind::SdpOffer);
        trigger.cancel();
        // Whatever else was queued, the stream must end once the initiator
        // gives up.
        while framed.next().await.is_some() {}
    };
    let (result, ()) = tokio::join!(initiate(&factory, local, cancel), silent_responder);

    assert!(matches!(result, Err(SignalingError::Cancelled)));
    let pc = created.lock().pop().expect("initiator built a peer connection");
    eventually(|| pc.connection_state() == RTCPeerConnectionState::Closed).await;
}

#[test_timeout::tokio_timeout_test]
async fn pre_cancelled_responder_returns_immediately() {
    let (_network, factory) = one_factory().await;
    let (_local, remote) = tokio::io::duplex(1024);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = tokio::time::timeout(
        Duration::from_secs(1),
        respond_with_cancel(&factory, remote, &context(), cancel),
    )
    .await
    .expect("cancelled responder must not wait for an offer");
    assert!(matches!(result, Err(SignalingError::Cancelled)));
}
