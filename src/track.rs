use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use derivative::Derivative;
use uuid::Uuid;
use webrtc::{
    api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8},
    media::Sample,
    rtp_transceiver::{rtp_codec::RTCRtpCodecCapability, rtp_codec::RTPCodecType},
    track::track_local::track_local_static_sample::TrackLocalStaticSample,
};

use crate::{
    audio_monitor::SampleBuffer,
    error::{Error, MediaErrorKind},
};

const PCM_TAP_CAPACITY: usize = 4096;
const SCREEN_LABEL_KEYWORDS: [&str; 3] = ["screen", "display", "window"];
const SCREEN_CONTENT_HINTS: [&str; 4] = ["detail", "text", "screen", "motion-screen"];

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn codec_type(&self) -> RTPCodecType {
        match self {
            MediaKind::Audio => RTPCodecType::Audio,
            MediaKind::Video => RTPCodecType::Video,
        }
    }

    pub fn from_codec_type(codec_type: RTPCodecType) -> Option<Self> {
        match codec_type {
            RTPCodecType::Audio => Some(MediaKind::Audio),
            RTPCodecType::Video => Some(MediaKind::Video),
            _ => None,
        }
    }

    pub(crate) fn default_capability(&self) -> RTCRtpCodecCapability {
        match self {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: "".to_owned(),
                rtcp_feedback: vec![],
            },
        }
    }
}

/// One local capture track. Encoded samples are written through [`MediaTrack::write_sample`].
#[derive(Derivative)]
#[derivative(Debug)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
    pub label: String,
    pub content_hint: Option<String>,
    enabled: AtomicBool,
    stopped: AtomicBool,
    max_bitrate: AtomicU64,
    #[derivative(Debug = "ignore")]
    rtc_track: Arc<TrackLocalStaticSample>,
    pcm: Arc<SampleBuffer>,
}

impl MediaTrack {
    pub fn new(kind: MediaKind, label: &str, stream_id: &str) -> Self {
        let id = Uuid::new_v4().to_string();
        let rtc_track = Arc::new(TrackLocalStaticSample::new(
            kind.default_capability(),
            id.clone(),
            stream_id.to_string(),
        ));
        tracing::debug!("MediaTrack id={} kind={} is created", id, kind);
        Self {
            id,
            kind,
            label: label.to_string(),
            content_hint: None,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            max_bitrate: AtomicU64::new(0),
            rtc_track,
            pcm: Arc::new(SampleBuffer::new(PCM_TAP_CAPACITY)),
        }
    }

    pub fn with_content_hint(mut self, hint: &str) -> Self {
        self.content_hint = Some(hint.to_string());
        self
    }

    /// Video tracks that carry a display capture rather than a camera.
    pub fn is_screen_share(&self) -> bool {
        if self.kind != MediaKind::Video {
            return false;
        }
        if let Some(hint) = &self.content_hint {
            if SCREEN_CONTENT_HINTS.contains(&hint.to_ascii_lowercase().as_str()) {
                return true;
            }
        }
        let label = self.label.to_ascii_lowercase();
        SCREEN_LABEL_KEYWORDS
            .iter()
            .any(|keyword| label.contains(keyword))
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::Relaxed) {
            self.pcm.clear();
            tracing::debug!("MediaTrack id={} is stopped", self.id);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    /// Advisory ceiling for the encoder feeding this track. `None` means unlimited.
    pub fn max_bitrate(&self) -> Option<u64> {
        match self.max_bitrate.load(Ordering::Relaxed) {
            0 => None,
            bitrate => Some(bitrate),
        }
    }

    pub fn set_max_bitrate(&self, bitrate: Option<u64>) {
        self.max_bitrate
            .store(bitrate.unwrap_or_default(), Ordering::Relaxed);
    }

    /// Writes an encoded sample. Samples are dropped while the track is disabled.
    pub async fn write_sample(&self, sample: &Sample) -> Result<(), Error> {
        if self.is_stopped() {
            return Err(Error::new_media(
                format!("MediaTrack {} is stopped", self.id),
                MediaErrorKind::TrackStoppedError,
            ));
        }
        if !self.enabled() {
            return Ok(());
        }
        self.rtc_track.write_sample(sample).await?;
        Ok(())
    }

    /// Feeds decoded PCM to the local activity monitor.
    pub fn push_pcm(&self, samples: &[f32]) {
        if self.is_stopped() {
            return;
        }
        if self.enabled() {
            self.pcm.push(samples);
        } else {
            self.pcm.push(&vec![0.0; samples.len()]);
        }
    }

    pub fn pcm(&self) -> Arc<SampleBuffer> {
        self.pcm.clone()
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        self.rtc_track.clone()
    }
}

impl Drop for MediaTrack {
    fn drop(&mut self) {
        tracing::debug!("MediaTrack id={} is dropped", self.id);
    }
}

/// The local capture stream: at most one track per kind.
#[derive(Debug)]
pub struct LocalStream {
    pub id: String,
    tracks: Vec<Arc<MediaTrack>>,
}

impl LocalStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        let id = Uuid::new_v4().to_string();
        let mut kept: Vec<Arc<MediaTrack>> = Vec::new();
        for track in tracks {
            if kept.iter().any(|t| t.kind == track.kind) {
                tracing::warn!(
                    "LocalStream {} ignores extra {} track {}",
                    id,
                    track.kind,
                    track.id
                );
                continue;
            }
            kept.push(Arc::new(track));
        }
        Self { id, tracks: kept }
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn track(&self, kind: MediaKind) -> Option<Arc<MediaTrack>> {
        self.tracks.iter().find(|t| t.kind == kind).cloned()
    }

    pub fn audio_track(&self) -> Option<Arc<MediaTrack>> {
        self.track(MediaKind::Audio)
    }

    pub fn video_track(&self) -> Option<Arc<MediaTrack>> {
        self.track(MediaKind::Video)
    }

    pub fn stop(&self) {
        for track in self.tracks.iter() {
            track.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::{str::FromStr, time::Duration};

    #[test]
    fn test_screen_share_detection() {
        let camera = MediaTrack::new(MediaKind::Video, "FaceTime HD Camera", "s");
        assert!(!camera.is_screen_share());

        let screen = MediaTrack::new(MediaKind::Video, "Screen 1", "s");
        assert!(screen.is_screen_share());

        let window = MediaTrack::new(MediaKind::Video, "Entire Window", "s");
        assert!(window.is_screen_share());

        let hinted = MediaTrack::new(MediaKind::Video, "capture", "s").with_content_hint("detail");
        assert!(hinted.is_screen_share());

        let audio = MediaTrack::new(MediaKind::Audio, "screen audio", "s");
        assert!(!audio.is_screen_share());
    }

    #[test]
    fn test_media_kind_strings() {
        assert_eq!(MediaKind::Audio.to_string(), "audio");
        assert_eq!(MediaKind::from_str("video").unwrap(), MediaKind::Video);
        assert_eq!(
            serde_json::to_string(&MediaKind::Video).unwrap(),
            "\"video\""
        );
    }

    #[test]
    fn test_local_stream_keeps_one_track_per_kind() {
        let stream = LocalStream::new(vec![
            MediaTrack::new(MediaKind::Audio, "mic", "s"),
            MediaTrack::new(MediaKind::Audio, "mic 2", "s"),
            MediaTrack::new(MediaKind::Video, "cam", "s"),
        ]);
        assert_eq!(stream.tracks().len(), 2);
        assert_eq!(stream.audio_track().unwrap().label, "mic");
    }

    #[tokio::test]
    async fn test_write_sample_after_stop() {
        let track = MediaTrack::new(MediaKind::Audio, "mic", "s");
        track.set_enabled(false);
        let sample = Sample {
            data: Bytes::from_static(&[0u8; 4]),
            duration: Duration::from_millis(20),
            ..Default::default()
        };
        assert!(track.write_sample(&sample).await.is_ok());

        track.stop();
        track.stop();
        let result = track.write_sample(&sample).await;
        println!("{:?}", result);
        assert!(result.is_err());
    }

    #[test]
    fn test_max_bitrate() {
        let track = MediaTrack::new(MediaKind::Video, "screen", "s");
        assert_eq!(track.max_bitrate(), None);
        track.set_max_bitrate(Some(1_500_000));
        assert_eq!(track.max_bitrate(), Some(1_500_000));
        track.set_max_bitrate(None);
        assert_eq!(track.max_bitrate(), None);
    }
}
