use std::time::Duration;

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::track_controller::ScreenShareQuality;

/// Configuration for [`crate::session::VoiceSession`] and both engines.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// ICE servers as delivered by the application. They are normalized before use.
    pub ice_servers: Vec<IceServerConfig>,
    pub signal: SignalConfig,
    /// How long a disconnected peer is kept before it is torn down.
    pub grace_period: Duration,
    /// Upper bound for a single connect attempt.
    pub connect_timeout: Duration,
    /// Period of [`crate::event::SessionEvent::TrackQuality`] reports.
    pub quality_interval: Duration,
    pub activity: ActivityConfig,
    pub screen_share: ScreenShareBitrates,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig {
                urls: IceUrls::One("stun:stun.l.google.com:19302".to_string()),
                username: None,
                credential: None,
            }],
            signal: SignalConfig::default(),
            grace_period: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(30),
            quality_interval: Duration::from_secs(2),
            activity: ActivityConfig::default(),
            screen_share: ScreenShareBitrates::default(),
        }
    }
}

impl SessionConfig {
    pub fn transport_config(&self) -> WebRTCTransportConfig {
        WebRTCTransportConfig {
            ice_servers: normalize_ice_servers(&self.ice_servers),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub ping_interval: Duration,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    /// Close codes which mean the credentials were rejected. The channel never reconnects after these.
    pub fatal_close_codes: Vec<u16>,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(30),
            max_reconnect_attempts: Some(10),
            fatal_close_codes: vec![1008, 4001, 4003, 4401, 4403],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActivityConfig {
    /// Rounded RMS level at or above which a participant counts as speaking.
    pub speaking_threshold: f32,
    pub sample_interval: Duration,
    /// Number of PCM samples analysed per tick.
    pub window_size: usize,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            speaking_threshold: 0.05,
            sample_interval: Duration::from_millis(20),
            window_size: 1024,
        }
    }
}

/// Bitrate ceilings in bits per second for screen-share tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenShareBitrates {
    pub low: u64,
    pub medium: u64,
    pub high: u64,
}

impl Default for ScreenShareBitrates {
    fn default() -> Self {
        Self {
            low: 500_000,
            medium: 1_500_000,
            high: 3_000_000,
        }
    }
}

impl ScreenShareBitrates {
    pub fn cap_for(&self, quality: ScreenShareQuality) -> u64 {
        match quality {
            ScreenShareQuality::Low => self.low,
            ScreenShareQuality::Medium => self.medium,
            ScreenShareQuality::High => self.high,
        }
    }
}

/// Configuration for the webrtc-rs peer connections.
#[derive(Debug, Clone)]
pub struct WebRTCTransportConfig {
    pub ice_servers: Vec<RTCIceServer>,
}

impl Default for WebRTCTransportConfig {
    fn default() -> Self {
        SessionConfig::default().transport_config()
    }
}

/// ICE server entry as returned by the application's REST endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: IceUrls,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IceUrls {
    One(String),
    Many(Vec<String>),
}

impl IceUrls {
    fn iter(&self) -> Box<dyn Iterator<Item = &String> + '_> {
        match self {
            IceUrls::One(url) => Box::new(std::iter::once(url)),
            IceUrls::Many(urls) => Box::new(urls.iter()),
        }
    }
}

const ICE_SCHEMES: [&str; 4] = ["stun:", "stuns:", "turn:", "turns:"];

/// Trims, filters unknown schemes and removes duplicated URLs while keeping the original order.
pub fn normalize_ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    let mut seen: Vec<(String, String, String)> = Vec::new();
    let mut result = Vec::new();

    for server in servers {
        let username = server
            .username
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        let credential = server
            .credential
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_string();

        let mut urls = Vec::new();
        for url in server.urls.iter() {
            let url = url.trim();
            if url.is_empty() {
                continue;
            }
            let lower = url.to_ascii_lowercase();
            if !ICE_SCHEMES.iter().any(|scheme| lower.starts_with(scheme)) {
                tracing::warn!("Ignoring ICE server url with unknown scheme: {}", url);
                continue;
            }
            let key = (url.to_string(), username.clone(), credential.clone());
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            urls.push(url.to_string());
        }

        if urls.is_empty() {
            continue;
        }
        result.push(RTCIceServer {
            urls,
            username: username.clone(),
            credential: credential.clone(),
            ..Default::default()
        });
    }

    result
}
