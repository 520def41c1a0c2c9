use serde_json::{Map, Value};

use crate::{
    error::{Error, RouterErrorKind},
    receiver::AUDIO_LEVEL_URI,
    signaling::router_message::{
        RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpHeaderExtensionCapability,
    },
    track::MediaKind,
};

pub(crate) const MID_URI: &str = "urn:ietf:params:rtp-hdrext:sdes:mid";
pub(crate) const OPUS_PAYLOAD_TYPE: u8 = 111;
pub(crate) const VP8_PAYLOAD_TYPE: u8 = 96;

/// Codecs and header extensions this endpoint can send and receive.
pub fn local_capabilities() -> RtpCapabilities {
    let mut opus_parameters = Map::new();
    opus_parameters.insert("minptime".to_string(), Value::from(10));
    opus_parameters.insert("useinbandfec".to_string(), Value::from(1));

    RtpCapabilities {
        codecs: vec![
            RtpCodecCapability {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".to_string(),
                preferred_payload_type: Some(OPUS_PAYLOAD_TYPE),
                clock_rate: 48000,
                channels: Some(2),
                parameters: opus_parameters,
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_string(),
                preferred_payload_type: Some(VP8_PAYLOAD_TYPE),
                clock_rate: 90000,
                channels: None,
                parameters: Map::new(),
            },
        ],
        header_extensions: vec![
            RtpHeaderExtensionCapability {
                kind: Some(MediaKind::Audio),
                uri: MID_URI.to_string(),
                preferred_id: 1,
            },
            RtpHeaderExtensionCapability {
                kind: Some(MediaKind::Video),
                uri: MID_URI.to_string(),
                preferred_id: 1,
            },
            RtpHeaderExtensionCapability {
                kind: Some(MediaKind::Audio),
                uri: AUDIO_LEVEL_URI.to_string(),
                preferred_id: 10,
            },
        ],
    }
}

fn codec_matches(local: &RtpCodecCapability, remote: &RtpCodecCapability) -> bool {
    local.kind == remote.kind
        && local.mime_type.eq_ignore_ascii_case(&remote.mime_type)
        && local.clock_rate == remote.clock_rate
        && (local.kind == MediaKind::Video
            || local.channels.unwrap_or(1) == remote.channels.unwrap_or(1))
}

/// Media capabilities negotiated against one router.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    rtp_capabilities: RtpCapabilities,
}

impl Device {
    /// Keeps the router codecs this endpoint supports. Fails when no audio codec is left.
    pub fn load(router: &RtpCapabilities) -> Result<Self, Error> {
        let local = local_capabilities();
        let codecs: Vec<RtpCodecCapability> = router
            .codecs
            .iter()
            .filter(|codec| local.codecs.iter().any(|l| codec_matches(l, codec)))
            .cloned()
            .collect();
        if !codecs.iter().any(|codec| codec.kind == MediaKind::Audio) {
            return Err(Error::new_router(
                "Router offers no supported audio codec".to_string(),
                RouterErrorKind::UnsupportedCapabilitiesError,
            ));
        }
        let header_extensions = router
            .header_extensions
            .iter()
            .filter(|ext| {
                local.header_extensions.iter().any(|l| {
                    l.uri == ext.uri && (ext.kind.is_none() || ext.kind == l.kind)
                })
            })
            .cloned()
            .collect();

        let rtp_capabilities = RtpCapabilities {
            codecs,
            header_extensions,
        };
        tracing::debug!("Device is loaded: {:?}", rtp_capabilities);
        Ok(Self { rtp_capabilities })
    }

    pub fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.rtp_capabilities
    }

    pub fn codec(&self, kind: MediaKind) -> Option<&RtpCodecCapability> {
        self.rtp_capabilities
            .codecs
            .iter()
            .find(|codec| codec.kind == kind)
    }

    pub fn can_produce(&self, kind: MediaKind) -> bool {
        self.codec(kind).is_some()
    }

    pub fn codec_parameters(
        &self,
        kind: MediaKind,
        payload_type: u8,
    ) -> Result<RtpCodecParameters, Error> {
        let codec = self.codec(kind).ok_or_else(|| {
            Error::new_router(
                format!("Router cannot receive {}", kind),
                RouterErrorKind::UnsupportedCapabilitiesError,
            )
        })?;
        Ok(RtpCodecParameters {
            mime_type: codec.mime_type.clone(),
            payload_type,
            clock_rate: codec.clock_rate,
            channels: codec.channels,
            parameters: codec.parameters.clone(),
        })
    }
}
