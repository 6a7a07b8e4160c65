use std::time::Duration;

use once_cell::sync::Lazy;
use tracing::warn;
use webrtc::ice_transport::ice_server::RTCIceServer;

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024;
pub const DEFAULT_MAX_PENDING_STREAMS: usize = 64;
pub const DEFAULT_EOF_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

const MAX_MESSAGE_SIZE_ENV: &str = "P2P_WEBRTC_MAX_MSG_SIZE";
const MAX_PENDING_STREAMS_ENV: &str = "P2P_WEBRTC_MAX_PENDING_STREAMS";
const EOF_GRACE_ENV: &str = "P2P_WEBRTC_EOF_GRACE_MS";
const DISABLE_STUN_ENV: &str = "P2P_WEBRTC_DISABLE_STUN";

static RUNTIME_CONFIG: Lazy<RtcConfig> = Lazy::new(RtcConfig::from_env);

/// Process-wide configuration, read from the environment on first use.
pub fn runtime_config() -> &'static RtcConfig {
    &RUNTIME_CONFIG
}

/// ICE agent timers handed to every `SettingEngine` we build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IceTimeouts {
    pub disconnected: Duration,
    pub failed: Duration,
    pub keepalive: Duration,
}

impl Default for IceTimeouts {
    fn default() -> Self {
        Self {
            disconnected: Duration::from_secs(3),
            failed: Duration::from_secs(10),
            keepalive: Duration::from_millis(500),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RtcConfig {
    /// Largest payload handed to a single data-channel `send`.
    pub max_message_size: usize,
    /// Inbound channels buffered before a muxer exists to adopt them.
    pub max_pending_streams: usize,
    /// How long a side keeps waiting for `Connected` after the remote hung up
    /// the bootstrap stream mid-handshake.
    pub eof_grace: Duration,
    pub ice_servers: Vec<RTCIceServer>,
    pub ice_timeouts: IceTimeouts,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_pending_streams: DEFAULT_MAX_PENDING_STREAMS,
            eof_grace: DEFAULT_EOF_GRACE,
            ice_servers: default_ice_servers(),
            ice_timeouts: IceTimeouts::default(),
        }
    }
}

impl RtcConfig {
    pub fn from_env() -> Self {
        let max_message_size =
            parse_usize_env(MAX_MESSAGE_SIZE_ENV, DEFAULT_MAX_MESSAGE_SIZE, 1);
        let max_pending_streams =
            parse_usize_env(MAX_PENDING_STREAMS_ENV, DEFAULT_MAX_PENDING_STREAMS, 1);
        let eof_grace_ms = parse_usize_env(
            EOF_GRACE_ENV,
            DEFAULT_EOF_GRACE.as_millis() as usize,
            0,
        );
        let ice_servers = if env_flag(DISABLE_STUN_ENV) {
            Vec::new()
        } else {
            default_ice_servers()
        };
        Self {
            max_message_size,
            max_pending_streams,
            eof_grace: Duration::from_millis(eof_grace_ms as u64),
            ice_servers,
            ice_timeouts: IceTimeouts::default(),
        }
    }

    /// No STUN servers; host candidates only. Used on loopback and virtual
    /// networks.
    pub fn local() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Self::default()
        }
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size.max(1);
        self
    }

    pub fn with_max_pending_streams(mut self, max_pending_streams: usize) -> Self {
        self.max_pending_streams = max_pending_streams.max(1);
        self
    }

    pub fn with_eof_grace(mut self, eof_grace: Duration) -> Self {
        self.eof_grace = eof_grace;
        self
    }

    pub fn with_ice_timeouts(mut self, ice_timeouts: IceTimeouts) -> Self {
        self.ice_timeouts = ice_timeouts;
        self
    }
}

fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![DEFAULT_STUN_SERVER.to_string()],
        ..Default::default()
    }]
}

fn env_flag(var: &str) -> bool {
    std::env::var(var)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}

fn parse_usize_env(var: &str, default: usize, min: usize) -> usize {
    match std::env::var(var) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if parsed >= min => parsed,
            Ok(parsed) => {
                warn!(
                    target = "transport_webrtc_p2p::config",
                    var, parsed, min, default, "rtc config below minimum; using default"
                );
                default
            }
            Err(err) => {
                warn!(
                    target = "transport_webrtc_p2p::config",
                    var,
                    error = %err,
                    default,
                    "failed to parse rtc config from env; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{LazyLock, Mutex};

    // Environment variables are process-global.
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const ALL_VARS: [&str; 4] = [
        MAX_MESSAGE_SIZE_ENV,
        MAX_PENDING_STREAMS_ENV,
        EOF_GRACE_ENV,
        DISABLE_STUN_ENV,
    ];

    fn clear_env() {
        for var in ALL_VARS {
            unsafe {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn defaults_without_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();

        let config = RtcConfig::from_env();
        assert_eq!(config, RtcConfig::default());
        assert_eq!(config.max_message_size, 16384);
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls, vec![DEFAULT_STUN_SERVER]);
    }

    #[test]
    fn env_overrides_are_applied() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var(MAX_MESSAGE_SIZE_ENV, "1024");
            env::set_var(MAX_PENDING_STREAMS_ENV, " 4 ");
            env::set_var(EOF_GRACE_ENV, "250");
            env::set_var(DISABLE_STUN_ENV, "true");
        }

        let config = RtcConfig::from_env();
        clear_env();

        assert_eq!(config.max_message_size, 1024);
        assert_eq!(config.max_pending_streams, 4);
        assert_eq!(config.eof_grace, Duration::from_millis(250));
        assert!(config.ice_servers.is_empty());
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var(MAX_MESSAGE_SIZE_ENV, "0");
            env::set_var(MAX_PENDING_STREAMS_ENV, "lots");
            env::set_var(DISABLE_STUN_ENV, "nope");
        }

        let config = RtcConfig::from_env();
        clear_env();

        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert_eq!(config.max_pending_streams, DEFAULT_MAX_PENDING_STREAMS);
        assert_eq!(config.ice_servers.len(), 1);
    }

    #[test]
    fn builders_clamp_to_minimum() {
        let config = RtcConfig::local()
            .with_max_message_size(0)
            .with_max_pending_streams(0);
        assert_eq!(config.max_message_size, 1);
        assert_eq!(config.max_pending_streams, 1);
        assert!(config.ice_servers.is_empty());
    }
}
