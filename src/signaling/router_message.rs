use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{signaling::client::SignalProtocol, track::MediaKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtensionCapability {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MediaKind>,
    pub uri: String,
    pub preferred_id: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtensionCapability>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    #[serde(alias = "ip")]
    pub address: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

impl IceCandidate {
    /// SDP `candidate:` attribute value.
    pub fn to_sdp(&self) -> String {
        let tcp_type = self
            .tcp_type
            .as_ref()
            .map(|t| format!(" tcptype {}", t))
            .unwrap_or_default();
        format!(
            "candidate:{} 1 {} {} {} {} typ {}{}",
            self.foundation,
            self.protocol.to_ascii_lowercase(),
            self.priority,
            self.address,
            self.port,
            self.candidate_type,
            tcp_type
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsParameters {
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpHeaderExtensionParameters {
    pub uri: String,
    pub id: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtensionParameters>,
    #[serde(default)]
    pub encodings: Vec<RtpEncodingParameters>,
    #[serde(default)]
    pub rtcp: RtcpParameters,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: String,
    pub kind: MediaKind,
    pub peer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RouterRequest {
    #[serde(rename_all = "camelCase")]
    Join { room_id: String, peer_id: String },
    #[serde(rename_all = "camelCase")]
    CreateWebRtcTransport { direction: TransportDirection },
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: String,
        direction: TransportDirection,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        paused: bool,
    },
    #[serde(rename_all = "camelCase")]
    Consume {
        transport_id: String,
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
    },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer { consumer_id: String },
    #[serde(rename_all = "camelCase")]
    PauseConsumer { consumer_id: String },
    #[serde(rename_all = "camelCase")]
    PauseProducer { producer_id: String },
    #[serde(rename_all = "camelCase")]
    ResumeProducer { producer_id: String },
    #[serde(rename_all = "camelCase")]
    CloseProducer { producer_id: String },
    Leave,
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RouterResponse {
    #[serde(rename_all = "camelCase")]
    Joined {
        rtp_capabilities: RtpCapabilities,
        #[serde(default)]
        existing_producers: Vec<ProducerInfo>,
    },
    #[serde(rename_all = "camelCase")]
    TransportCreated {
        #[serde(alias = "transportId")]
        id: String,
        direction: TransportDirection,
        ice_parameters: IceParameters,
        #[serde(default)]
        ice_candidates: Vec<IceCandidate>,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    TransportConnected { transport_id: String },
    #[serde(rename_all = "camelCase")]
    Produced { producer_id: String },
    #[serde(rename_all = "camelCase")]
    Consumed {
        consumer_id: String,
        producer_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(default)]
        peer_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ConsumerResumed {
        #[serde(default)]
        consumer_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    NewProducer {
        producer_id: String,
        kind: MediaKind,
        peer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        producer_id: String,
        #[serde(default)]
        peer_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    PeerJoined { peer_id: String },
    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: String },
    Error {
        #[serde(default)]
        detail: Option<String>,
    },
    Pong,
}

/// Router signaling vocabulary used by the routed engine.
#[derive(Debug)]
pub struct RouterProtocol;

impl SignalProtocol for RouterProtocol {
    type Incoming = RouterResponse;
    type Outgoing = RouterRequest;

    fn ping() -> Option<RouterRequest> {
        Some(RouterRequest::Ping)
    }
}
