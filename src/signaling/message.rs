use serde::{Deserialize, Serialize};
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::sdp::session_description::RTCSessionDescription,
};

use crate::{
    event::{Participant, RoomStats},
    signaling::client::SignalProtocol,
};

/// Negotiation payload relayed between two participants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Signal {
    Offer { description: RTCSessionDescription },
    Answer { description: RTCSessionDescription },
    Candidate { candidate: RTCIceCandidateInit },
    Bye,
}

/// Servers send either a bare id or a user object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserRef {
    Id(String),
    User {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

impl UserRef {
    pub fn id(&self) -> &str {
        match self {
            UserRef::Id(id) => id,
            UserRef::User { id, .. } => id,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            UserRef::Id(_) => None,
            UserRef::User { name, .. } => name.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "welcome")]
    Welcome {
        user: UserRef,
        #[serde(default)]
        role: Option<String>,
        #[serde(default)]
        features: Vec<String>,
    },
    #[serde(rename = "state:participants")]
    Participants {
        participants: Vec<Participant>,
        #[serde(default)]
        stats: RoomStats,
    },
    #[serde(rename = "state:participant-updated")]
    ParticipantUpdated {
        participant: Participant,
        #[serde(default)]
        stats: Option<RoomStats>,
    },
    #[serde(rename = "state:recording")]
    Recording { recording: bool },
    #[serde(rename = "system:peer-joined")]
    PeerJoined { user: UserRef },
    #[serde(rename = "system:peer-left")]
    PeerLeft { user: UserRef },
    #[serde(rename = "signal")]
    Signal { signal: Signal, from: String },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        detail: Option<String>,
    },
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "signal")]
    Signal { to: String, signal: Signal },
    #[serde(rename = "set-muted")]
    SetMuted { muted: bool },
    #[serde(rename = "set-deafened")]
    SetDeafened { deafened: bool },
    #[serde(rename = "media")]
    Media {
        #[serde(rename = "videoEnabled")]
        video_enabled: bool,
    },
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
}

/// Room signaling vocabulary used by the mesh engine.
#[derive(Debug)]
pub struct RoomProtocol;

impl SignalProtocol for RoomProtocol {
    type Incoming = ServerMessage;
    type Outgoing = ClientMessage;

    fn ping() -> Option<ClientMessage> {
        Some(ClientMessage::Ping)
    }
}
