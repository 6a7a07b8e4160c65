#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use transport_webrtc_p2p::vnet::{VirtualNetwork, factory_pair};
use transport_webrtc_p2p::{ConnectionContext, RtcConfig, initiate, respond};
use webrtc::peer_connection::RTCPeerConnection;

pub struct ConnectedPair {
    // Dropping the network tears down the peers' only route.
    pub network: VirtualNetwork,
    pub dialer: Arc<RTCPeerConnection>,
    pub listener: Arc<RTCPeerConnection>,
}

pub async fn connected_pair(config: RtcConfig) -> ConnectedPair {
    let (network, dialer_factory, listener_factory) =
        factory_pair(config).await.expect("virtual network");
    let (left, right) = tokio::io::duplex(64 * 1024);
    let context = ConnectionContext::new("dialer");
    let (dialer, listener) = tokio::join!(
        initiate(&dialer_factory, left, CancellationToken::new()),
        respond(&listener_factory, right, &context)
    );
    ConnectedPair {
        network,
        dialer: dialer.expect("initiator connects"),
        listener: listener.expect("responder connects"),
    }
}

/// Polls `check` until it holds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    while !check() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
