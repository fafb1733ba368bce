use std::env;
use std::net::SocketAddr;

use crate::negotiation::engine::{EngineConfig, MediaConstraints};
use crate::negotiation::session::SessionConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the relay server listens on.
    pub relay_bind: SocketAddr,
    /// WebSocket endpoint peers connect to.
    pub relay_url: String,
    /// Local address for each peer connection's UDP socket.
    pub rtc_udp_bind: SocketAddr,
    pub candidate_queue_capacity: usize,
    pub media_audio: bool,
    pub media_video: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            relay_bind: env::var("RELAY_BIND")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000))),
            relay_url: env::var("RELAY_URL").unwrap_or_else(|_| "ws://127.0.0.1:3000/ws".into()),
            rtc_udp_bind: env::var("RTC_UDP_BIND")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0))),
            candidate_queue_capacity: env::var("CANDIDATE_QUEUE_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(64),
            media_audio: flag("MEDIA_AUDIO", false),
            media_video: flag("MEDIA_VIDEO", true),
        }
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            engine: EngineConfig {
                bind_addr: self.rtc_udp_bind,
            },
            constraints: MediaConstraints {
                audio: self.media_audio,
                video: self.media_video,
            },
            candidate_capacity: self.candidate_queue_capacity,
        }
    }
}

fn flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_config_carries_media_and_queue_settings() {
        let config = Config {
            relay_bind: "127.0.0.1:3000".parse().unwrap(),
            relay_url: "ws://127.0.0.1:3000/ws".into(),
            rtc_udp_bind: "10.0.0.5:0".parse().unwrap(),
            candidate_queue_capacity: 8,
            media_audio: true,
            media_video: false,
        };

        let session = config.session();
        assert_eq!(session.candidate_capacity, 8);
        assert_eq!(session.engine.bind_addr, config.rtc_udp_bind);
        assert!(session.constraints.audio);
        assert!(!session.constraints.video);
    }
}
