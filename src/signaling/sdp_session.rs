use webrtc_sdp::{
    attribute_type::{SdpAttribute, SdpAttributeFingerprint, SdpAttributeType},
    media_type::{SdpFormatList, SdpMedia, SdpMediaValue},
    parse_sdp, SdpSession,
};

use crate::{
    error::{Error, RouterErrorKind},
    signaling::router_message::DtlsFingerprint,
    track::MediaKind,
};

fn parse_local(sdp: &str) -> Result<SdpSession, Error> {
    parse_sdp(sdp, false).map_err(|e| {
        Error::new_router(
            format!("Failed to parse local SDP: {}", e),
            RouterErrorKind::SdpError,
        )
    })
}

fn to_dtls_fingerprint(fingerprint: &SdpAttributeFingerprint) -> DtlsFingerprint {
    DtlsFingerprint {
        algorithm: fingerprint.hash_algorithm.to_string().to_ascii_lowercase(),
        value: fingerprint
            .fingerprint
            .iter()
            .map(|byte| format!("{:02X}", byte))
            .collect::<Vec<_>>()
            .join(":"),
    }
}

/// The session fingerprint of an SDP, or the first media-level one.
pub fn get_fingerprint(sdp: &str) -> Result<DtlsFingerprint, Error> {
    let parsed = parse_local(sdp)?;
    let attribute = parsed
        .get_attribute(SdpAttributeType::Fingerprint)
        .or_else(|| {
            parsed
                .media
                .iter()
                .find_map(|media| media.get_attribute(SdpAttributeType::Fingerprint))
        })
        .ok_or_else(|| {
            Error::new_router(
                "Missing fingerprint in local SDP".to_string(),
                RouterErrorKind::SdpError,
            )
        })?;
    match attribute {
        SdpAttribute::Fingerprint(fingerprint) => Ok(to_dtls_fingerprint(fingerprint)),
        _ => Err(Error::new_router(
            "Invalid fingerprint attribute type".to_string(),
            RouterErrorKind::SdpError,
        )),
    }
}

/// One m-section of a local description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    pub kind: MediaKind,
    pub mid: Option<String>,
    pub payload_types: Vec<u8>,
    pub ssrc: Option<u32>,
    pub cname: Option<String>,
}

impl MediaSection {
    fn from_media(media: &SdpMedia) -> Option<Self> {
        let kind = match media.get_type() {
            SdpMediaValue::Audio => MediaKind::Audio,
            SdpMediaValue::Video => MediaKind::Video,
            _ => return None,
        };
        let payload_types = match media.get_formats() {
            SdpFormatList::Integers(formats) => formats
                .iter()
                .filter_map(|pt| u8::try_from(*pt).ok())
                .collect(),
            SdpFormatList::Strings(_) => Vec::new(),
        };
        let mut section = MediaSection {
            kind,
            mid: None,
            payload_types,
            ssrc: None,
            cname: None,
        };
        for attribute in media.get_attributes() {
            match attribute {
                SdpAttribute::Mid(mid) => section.mid = Some(mid.clone()),
                SdpAttribute::Ssrc(ssrc) => {
                    if section.ssrc.is_none() {
                        section.ssrc = Some(ssrc.id);
                    }
                    if section.cname.is_none() && ssrc.attribute.as_deref() == Some("cname") {
                        section.cname = ssrc.value.clone();
                    }
                }
                _ => {}
            }
        }
        Some(section)
    }
}

/// Audio and video m-sections of a local description, in order.
pub fn media_sections(sdp: &str) -> Result<Vec<MediaSection>, Error> {
    let parsed = parse_local(sdp)?;
    Ok(parsed
        .media
        .iter()
        .filter_map(MediaSection::from_media)
        .collect())
}
