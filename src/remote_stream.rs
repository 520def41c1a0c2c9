use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};

use derivative::Derivative;
use serde::Serialize;
use tokio::time::Instant;
use webrtc::track::track_remote::TrackRemote;

use crate::{audio_monitor::SampleBuffer, track::MediaKind};

const PCM_CAPACITY: usize = 4096;

/// Inbound track from one remote participant.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
    pub participant_id: String,
    /// Router consumer which delivers this track. Empty in mesh mode.
    pub consumer_id: Option<String>,
    playback_enabled: AtomicBool,
    pcm: Arc<SampleBuffer>,
    stats: TrackStats,
    #[derivative(Debug = "ignore")]
    source: Mutex<Option<Arc<TrackRemote>>>,
}

impl RemoteTrack {
    pub fn new(id: String, kind: MediaKind, participant_id: String) -> Self {
        tracing::debug!(
            "RemoteTrack id={} kind={} participant={} is created",
            id,
            kind,
            participant_id
        );
        Self {
            id,
            kind,
            participant_id,
            consumer_id: None,
            playback_enabled: AtomicBool::new(true),
            pcm: Arc::new(SampleBuffer::new(PCM_CAPACITY)),
            stats: TrackStats::default(),
            source: Mutex::new(None),
        }
    }

    pub fn with_consumer(mut self, consumer_id: String) -> Self {
        self.consumer_id = Some(consumer_id);
        self
    }

    /// Whether the embedder should render this track. Cleared for audio while deafened.
    pub fn playback_enabled(&self) -> bool {
        self.playback_enabled.load(Ordering::Relaxed)
    }

    pub fn set_playback_enabled(&self, enabled: bool) {
        self.playback_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Decoded PCM pushed by the embedder's decoder feeds the activity monitor.
    pub fn push_pcm(&self, samples: &[f32]) {
        self.pcm.push(samples);
    }

    pub fn pcm(&self) -> Arc<SampleBuffer> {
        self.pcm.clone()
    }

    pub fn stats(&self) -> &TrackStats {
        &self.stats
    }

    pub(crate) fn attach_source(&self, track: Arc<TrackRemote>) {
        if let Ok(mut source) = self.source.lock() {
            *source = Some(track);
        }
    }

    /// The underlying webrtc track, once RTP has started flowing.
    pub fn source(&self) -> Option<Arc<TrackRemote>> {
        self.source.lock().ok().and_then(|source| source.clone())
    }
}

impl Drop for RemoteTrack {
    fn drop(&mut self) {
        tracing::debug!("RemoteTrack id={} is dropped", self.id);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityMetrics {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_lost: u64,
    /// Loss ratio over the last reporting period.
    pub fraction_lost: f32,
    /// Receive bitrate over the last reporting period.
    pub bitrate: u64,
}

/// RTP receive counters, updated from the read loop.
#[derive(Debug, Default)]
pub struct TrackStats {
    packets: AtomicU64,
    bytes: AtomicU64,
    lost: AtomicU64,
    last_sequence: Mutex<Option<u16>>,
    last_report: Mutex<Option<(Instant, u64, u64, u64)>>,
}

impl TrackStats {
    pub fn record(&self, sequence_number: u16, payload_len: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(payload_len as u64, Ordering::Relaxed);

        let Ok(mut last) = self.last_sequence.lock() else {
            return;
        };
        match *last {
            None => *last = Some(sequence_number),
            Some(previous) => {
                let delta = sequence_number.wrapping_sub(previous);
                // Deltas in the upper half are late or duplicated packets.
                if delta > 0 && delta < 0x8000 {
                    self.lost
                        .fetch_add(u64::from(delta - 1), Ordering::Relaxed);
                    *last = Some(sequence_number);
                }
            }
        }
    }

    /// Cumulative counters plus rates since the previous call.
    pub fn report(&self) -> QualityMetrics {
        let packets = self.packets.load(Ordering::Relaxed);
        let bytes = self.bytes.load(Ordering::Relaxed);
        let lost = self.lost.load(Ordering::Relaxed);
        let now = Instant::now();

        let mut metrics = QualityMetrics {
            packets_received: packets,
            bytes_received: bytes,
            packets_lost: lost,
            fraction_lost: 0.0,
            bitrate: 0,
        };

        if let Ok(mut last_report) = self.last_report.lock() {
            let (since, prev_packets, prev_bytes, prev_lost) =
                last_report.unwrap_or((now, 0, 0, 0));
            let period_packets = packets.saturating_sub(prev_packets);
            let period_lost = lost.saturating_sub(prev_lost);
            let expected = period_packets + period_lost;
            if expected > 0 {
                metrics.fraction_lost = period_lost as f32 / expected as f32;
            }
            let elapsed = now.duration_since(since).as_secs_f64();
            if elapsed > 0.0 {
                metrics.bitrate = ((bytes.saturating_sub(prev_bytes) * 8) as f64 / elapsed) as u64;
            }
            *last_report = Some((now, packets, bytes, lost));
        }

        metrics
    }
}

/// Everything one remote participant currently sends, composed from one or more inbound tracks.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    pub participant_id: String,
    tracks: Vec<Arc<RemoteTrack>>,
}

impl RemoteStream {
    pub fn new(participant_id: String) -> Self {
        Self {
            participant_id,
            tracks: Vec::new(),
        }
    }

    /// Adds a track. A track id that is already present is left untouched.
    pub fn add_track(&mut self, track: Arc<RemoteTrack>) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    pub fn remove_track(&mut self, track_id: &str) -> Option<Arc<RemoteTrack>> {
        let index = self.tracks.iter().position(|t| t.id == track_id)?;
        Some(self.tracks.remove(index))
    }

    pub fn tracks(&self) -> &[Arc<RemoteTrack>] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<RemoteTrack>> {
        self.tracks.iter().filter(|t| t.kind == MediaKind::Audio)
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn set_audio_playback(&self, enabled: bool) {
        for track in self.audio_tracks() {
            track.set_playback_enabled(enabled);
        }
    }
}
