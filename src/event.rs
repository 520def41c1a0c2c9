use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    remote_stream::{QualityMetrics, RemoteStream},
    track::MediaKind,
};

/// Callbacks into the application state store.
pub type SessionEventSender = mpsc::UnboundedSender<SessionEvent>;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display, strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Disconnected,
}

/// Identity assigned to the local participant by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSession {
    pub participant_id: String,
    pub name: Option<String>,
    pub role: Option<String>,
    pub features: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub deafened: bool,
    #[serde(default)]
    pub video_enabled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub speaking: u32,
    #[serde(default)]
    pub listening: u32,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConnectionStateChanged(ConnectionState),
    Welcome(LocalSession),
    Participants {
        participants: Vec<Participant>,
        stats: RoomStats,
    },
    ParticipantUpdated {
        participant: Participant,
        stats: Option<RoomStats>,
    },
    PeerJoined(String),
    PeerLeft(String),
    StreamAdded {
        participant_id: String,
        stream: RemoteStream,
    },
    StreamRemoved {
        participant_id: String,
    },
    /// `participant_id` is `None` for the local participant.
    AudioActivity {
        participant_id: Option<String>,
        level: f32,
        speaking: bool,
    },
    RecordingStateChanged {
        recording: bool,
    },
    TrackQuality {
        participant_id: String,
        track_id: String,
        kind: MediaKind,
        metrics: QualityMetrics,
    },
    Error(String),
}

pub(crate) fn emit(sender: &SessionEventSender, event: SessionEvent) {
    if let Err(err) = sender.send(event) {
        tracing::debug!("SessionEvent receiver is gone: {:?}", err.0);
    }
}
