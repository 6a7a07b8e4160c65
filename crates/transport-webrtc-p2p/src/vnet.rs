//! In-process virtual network so peers can negotiate without touching the
//! host's network stack.

use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::util::vnet::net::{Net, NetConfig};
use webrtc::util::vnet::router::{Router, RouterConfig};

use crate::config::RtcConfig;
use crate::signaling::{PeerConnectionFactory, SignalingError, to_setup_error};

pub const DEFAULT_CIDR: &str = "10.0.0.0/24";

/// One virtual LAN. Keep it alive for as long as its peers talk.
pub struct VirtualNetwork {
    router: Arc<AsyncMutex<Router>>,
}

impl VirtualNetwork {
    pub fn new(cidr: &str) -> Result<Self, SignalingError> {
        let router = Router::new(RouterConfig {
            cidr: cidr.to_owned(),
            ..Default::default()
        })
        .map_err(to_setup_error)?;
        Ok(Self {
            router: Arc::new(AsyncMutex::new(router)),
        })
    }

    /// Adds a host with a static address and returns a `SettingEngine` bound
    /// to it. Add every host before calling [`start`](Self::start).
    pub async fn add_host(&self, ip: &str) -> Result<SettingEngine, SignalingError> {
        let net = Arc::new(Net::new(Some(NetConfig {
            static_ips: vec![ip.to_owned()],
            ..Default::default()
        })));
        let nic = net.get_nic().map_err(to_setup_error)?;
        {
            let mut router = self.router.lock().await;
            router
                .add_net(Arc::clone(&nic))
                .await
                .map_err(to_setup_error)?;
        }
        {
            let nic = nic.lock().await;
            nic.set_router(Arc::clone(&self.router))
                .await
                .map_err(to_setup_error)?;
        }

        let mut setting = SettingEngine::default();
        setting.set_vnet(Some(net));
        Ok(setting)
    }

    pub async fn start(&self) -> Result<(), SignalingError> {
        let mut router = self.router.lock().await;
        router.start().await.map_err(to_setup_error)
    }

    pub async fn stop(&self) -> Result<(), SignalingError> {
        let mut router = self.router.lock().await;
        router.stop().await.map_err(to_setup_error)
    }
}

/// Two factories on a fresh, started network. STUN servers are dropped from
/// `config` since nothing on the virtual LAN could reach them.
pub async fn factory_pair(
    config: RtcConfig,
) -> Result<(VirtualNetwork, PeerConnectionFactory, PeerConnectionFactory), SignalingError> {
    let config = RtcConfig {
        ice_servers: Vec::new(),
        ..config
    };
    let network = VirtualNetwork::new(DEFAULT_CIDR)?;
    let first = network.add_host("10.0.0.2").await?;
    let second = network.add_host("10.0.0.3").await?;
    network.start().await?;
    Ok((
        network,
        PeerConnectionFactory::with_setting_engine(first, config.clone())?,
        PeerConnectionFactory::with_setting_engine(second, config)?,
    ))
}
