use serde_json::Value;

use crate::{
    error::{Error, RouterErrorKind},
    routed::device::{Device, MID_URI},
    signaling::{
        router_message::{DtlsParameters, DtlsRole, IceParameters, TransportDirection},
        sdp_session::MediaSection,
    },
    track::MediaKind,
};

/// SSRC announced for one consumer on the receive side, bound to the m-section
/// of its own transceiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSsrc {
    pub mid: String,
    pub kind: MediaKind,
    pub ssrc: u32,
    pub cname: String,
}

fn render_parameters(parameters: &serde_json::Map<String, Value>) -> String {
    parameters
        .iter()
        .map(|(key, value)| match value {
            Value::String(value) => format!("{}={}", key, value),
            other => format!("{}={}", key, other),
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Builds the router's answer to a local offer from the parameters the router handed out.
pub fn remote_answer(
    ice: &IceParameters,
    dtls: &DtlsParameters,
    direction: TransportDirection,
    sections: &[MediaSection],
    device: &Device,
    consumers: &[ConsumerSsrc],
) -> Result<String, Error> {
    // webrtc-rs only verifies sha-256 fingerprints.
    let fingerprint = dtls
        .fingerprints
        .iter()
        .find(|fp| fp.algorithm.eq_ignore_ascii_case("sha-256"))
        .ok_or_else(|| {
            Error::new_router(
                "Router did not provide a sha-256 fingerprint".to_string(),
                RouterErrorKind::SdpError,
            )
        })?;
    let setup = match dtls.role {
        DtlsRole::Client => "active",
        DtlsRole::Server | DtlsRole::Auto => "passive",
    };

    let mids: Vec<&str> = sections.iter().filter_map(|s| s.mid.as_deref()).collect();
    let mut sdp = "v=0\r\n\
         o=- 0 0 IN IP4 0.0.0.0\r\n\
         s=-\r\n\
         t=0 0\r\n"
        .to_string();
    if !mids.is_empty() {
        sdp.push_str(&format!("a=group:BUNDLE {}\r\n", mids.join(" ")));
    }
    sdp.push_str(&format!(
        "a=msid-semantic: WMS *\r\n\
         a=fingerprint:{} {}\r\n\
         a=ice-ufrag:{}\r\n\
         a=ice-pwd:{}\r\n",
        fingerprint.algorithm, fingerprint.value, ice.username_fragment, ice.password,
    ));
    if ice.ice_lite {
        sdp.push_str("a=ice-lite\r\n");
    }

    for section in sections {
        let mid = section.mid.as_deref().unwrap_or_default();
        let codec = device.codec(section.kind);
        let payload_type = section.payload_types.first().copied();
        let (Some(codec), Some(payload_type)) = (codec, payload_type) else {
            // The router cannot carry this kind: reject the section.
            sdp.push_str(&format!(
                "m={} 0 UDP/TLS/RTP/SAVPF {}\r\n\
                 c=IN IP4 0.0.0.0\r\n\
                 a=mid:{}\r\n\
                 a=inactive\r\n",
                section.kind,
                payload_type.unwrap_or(0),
                mid
            ));
            continue;
        };

        let consumer = consumers
            .iter()
            .find(|consumer| consumer.mid == mid && consumer.kind == section.kind);
        let media_direction = match (direction, consumer) {
            (TransportDirection::Send, _) => "recvonly",
            (TransportDirection::Recv, None) => "inactive",
            (TransportDirection::Recv, Some(_)) => "sendonly",
        };
        let codec_name = codec
            .mime_type
            .split_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&codec.mime_type);
        let rtpmap = match codec.channels {
            Some(channels) if section.kind == MediaKind::Audio => {
                format!("{}/{}/{}", codec_name, codec.clock_rate, channels)
            }
            _ => format!("{}/{}", codec_name, codec.clock_rate),
        };

        sdp.push_str(&format!(
            "m={} 9 UDP/TLS/RTP/SAVPF {}\r\n\
             c=IN IP4 0.0.0.0\r\n\
             a=rtcp:9 IN IP4 0.0.0.0\r\n\
             a=rtcp-mux\r\n\
             a=mid:{}\r\n\
             a={}\r\n\
             a=rtpmap:{} {}\r\n",
            section.kind, payload_type, mid, media_direction, payload_type, rtpmap
        ));
        let fmtp = render_parameters(&codec.parameters);
        if !fmtp.is_empty() {
            sdp.push_str(&format!("a=fmtp:{} {}\r\n", payload_type, fmtp));
        }
        sdp.push_str(&format!(
            "a=extmap:1 {}\r\n\
             a=fingerprint:{} {}\r\n\
             a=setup:{}\r\n",
            MID_URI, fingerprint.algorithm, fingerprint.value, setup
        ));
        if let Some(consumer) = consumer {
            sdp.push_str(&format!(
                "a=msid:{} {}-{}\r\n\
                 a=ssrc:{} cname:{}\r\n",
                consumer.cname, consumer.kind, consumer.ssrc, consumer.ssrc, consumer.cname
            ));
        }
    }

    Ok(sdp)
}
