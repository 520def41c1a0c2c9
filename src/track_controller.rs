use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    config::ScreenShareBitrates,
    track::{LocalStream, MediaKind, MediaTrack},
};

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ScreenShareQuality {
    Low,
    #[default]
    Medium,
    High,
}

/// Desired local media state. It survives reconnects and is re-applied once a connection completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalMediaState {
    pub muted: bool,
    pub deafened: bool,
    pub video_enabled: bool,
}

/// Owns the local stream. Engines only receive shared handles to it when attaching tracks.
#[derive(Debug, Default)]
pub struct TrackController {
    stream: Option<Arc<LocalStream>>,
    state: LocalMediaState,
    quality: ScreenShareQuality,
    bitrates: ScreenShareBitrates,
}

impl TrackController {
    pub fn new(bitrates: ScreenShareBitrates) -> Self {
        Self {
            bitrates,
            ..Default::default()
        }
    }

    pub fn stream(&self) -> Option<Arc<LocalStream>> {
        self.stream.clone()
    }

    pub fn state(&self) -> LocalMediaState {
        self.state
    }

    pub fn quality(&self) -> ScreenShareQuality {
        self.quality
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.state.muted = muted;
        self.apply();
    }

    pub fn set_deafened(&mut self, deafened: bool) {
        self.state.deafened = deafened;
    }

    pub fn set_video_enabled(&mut self, video_enabled: bool) {
        self.state.video_enabled = video_enabled;
        self.apply();
    }

    /// Applies mute and video flags to the tracks of the current stream. Other tracks are left alone.
    pub fn apply_local_state(&mut self, muted: bool, video_enabled: bool) {
        self.state.muted = muted;
        self.state.video_enabled = video_enabled;
        self.apply();
    }

    fn apply(&self) {
        if let Some(stream) = &self.stream {
            apply_state_to_stream(stream, &self.state);
            self.apply_bitrates(stream);
        }
    }

    /// Swaps in a new stream with the current state applied and returns the previous one.
    /// The previous stream is not stopped here: the caller stops it after engines switched over.
    pub fn replace_stream(&mut self, stream: Arc<LocalStream>) -> Option<Arc<LocalStream>> {
        apply_state_to_stream(&stream, &self.state);
        self.apply_bitrates(&stream);
        self.stream.replace(stream)
    }

    /// Puts back a stream after a failed replacement.
    pub fn restore_stream(&mut self, stream: Option<Arc<LocalStream>>) {
        if let Some(stream) = &stream {
            apply_state_to_stream(stream, &self.state);
        }
        self.stream = stream;
    }

    pub fn take_stream(&mut self) -> Option<Arc<LocalStream>> {
        self.stream.take()
    }

    pub fn set_screen_share_quality(&mut self, quality: ScreenShareQuality) {
        self.quality = quality;
        if let Some(stream) = &self.stream {
            self.apply_bitrates(stream);
        }
    }

    pub fn bitrate_cap(&self, track: &MediaTrack) -> Option<u64> {
        bitrate_cap(track, self.quality, &self.bitrates)
    }

    fn apply_bitrates(&self, stream: &LocalStream) {
        for track in stream.tracks() {
            track.set_max_bitrate(self.bitrate_cap(track));
        }
    }
}

pub(crate) fn apply_state_to_stream(stream: &LocalStream, state: &LocalMediaState) {
    for track in stream.tracks() {
        match track.kind {
            MediaKind::Audio => track.set_enabled(!state.muted),
            MediaKind::Video => track.set_enabled(state.video_enabled),
        }
    }
}

/// Bitrate ceiling for a track. Only screen-share tracks are capped.
pub fn bitrate_cap(
    track: &MediaTrack,
    quality: ScreenShareQuality,
    bitrates: &ScreenShareBitrates,
) -> Option<u64> {
    if track.is_screen_share() {
        Some(bitrates.cap_for(quality))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(video_label: &str) -> Arc<LocalStream> {
        Arc::new(LocalStream::new(vec![
            MediaTrack::new(MediaKind::Audio, "mic", "s"),
            MediaTrack::new(MediaKind::Video, video_label, "s"),
        ]))
    }

    #[test]
    fn test_apply_local_state() {
        let mut controller = TrackController::default();
        let first = stream("camera");
        controller.replace_stream(first.clone());
        controller.apply_local_state(true, false);

        assert!(!first.audio_track().unwrap().enabled());
        assert!(!first.video_track().unwrap().enabled());

        controller.set_muted(false);
        assert!(first.audio_track().unwrap().enabled());
        assert!(!first.video_track().unwrap().enabled());
    }

    #[test]
    fn test_replace_stream_applies_state_and_keeps_old_alive() {
        let mut controller = TrackController::default();
        controller.apply_local_state(true, true);
        let first = stream("camera");
        assert!(controller.replace_stream(first.clone()).is_none());

        let second = stream("camera 2");
        let previous = controller.replace_stream(second.clone()).unwrap();
        assert!(Arc::ptr_eq(&previous, &first));
        assert!(!previous.audio_track().unwrap().is_stopped());
        assert!(!second.audio_track().unwrap().enabled());
        assert!(second.video_track().unwrap().enabled());

        controller.restore_stream(Some(previous));
        assert!(Arc::ptr_eq(&controller.stream().unwrap(), &first));
    }

    #[test]
    fn test_screen_share_caps() {
        let mut controller = TrackController::new(ScreenShareBitrates::default());
        let screen = stream("Screen 1");
        controller.replace_stream(screen.clone());
        let video = screen.video_track().unwrap();
        assert_eq!(video.max_bitrate(), Some(1_500_000));
        assert_eq!(screen.audio_track().unwrap().max_bitrate(), None);

        controller.set_screen_share_quality(ScreenShareQuality::High);
        assert_eq!(video.max_bitrate(), Some(3_000_000));
        assert_eq!(controller.bitrate_cap(&video), Some(3_000_000));

        controller.replace_stream(stream("camera"));
        assert_eq!(
            controller.stream().unwrap().video_track().unwrap().max_bitrate(),
            None
        );
    }
}
