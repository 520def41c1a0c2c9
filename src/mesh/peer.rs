use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use tokio::task::JoinHandle;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::{
    audio_monitor::AudioActivityMonitor,
    mesh::negotiation::{is_polite, NegotiationState},
    remote_stream::RemoteStream,
    track::MediaKind,
    transport::PeerTransport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum PeerLifecycle {
    Negotiating,
    Connected,
    Disconnected,
    Closed,
}

/// Outbound sender for one media kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OutboundSender {
    pub id: String,
    pub track_id: String,
}

/// Pending teardown of a disconnected peer.
#[derive(Debug)]
pub(crate) struct GraceTimer {
    pub token: u64,
    pub handle: JoinHandle<()>,
}

/// Everything the mesh engine keeps for one remote participant.
#[derive(Debug)]
pub(crate) struct PeerEntry {
    pub participant_id: String,
    pub transport: Arc<dyn PeerTransport>,
    pub negotiation: NegotiationState,
    pub ignore_offer: bool,
    pub polite: bool,
    pub stream: Option<RemoteStream>,
    pub monitor: Option<AudioActivityMonitor>,
    pub pending_candidates: VecDeque<RTCIceCandidateInit>,
    pub remote_description_set: bool,
    pub pending_teardown: Option<GraceTimer>,
    pub lifecycle: PeerLifecycle,
    pub senders: HashMap<MediaKind, OutboundSender>,
}

impl PeerEntry {
    pub fn new(local_id: &str, participant_id: &str, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            transport,
            negotiation: NegotiationState::Idle,
            ignore_offer: false,
            polite: is_polite(local_id, participant_id),
            stream: None,
            monitor: None,
            pending_candidates: VecDeque::new(),
            remote_description_set: false,
            pending_teardown: None,
            lifecycle: PeerLifecycle::Negotiating,
            senders: HashMap::new(),
        }
    }

    pub fn cancel_grace_timer(&mut self) -> bool {
        match self.pending_teardown.take() {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Drops inbound media and the grace timer. Returns the stream if there was one.
    pub fn reset_media(&mut self) -> Option<RemoteStream> {
        self.cancel_grace_timer();
        if let Some(monitor) = self.monitor.take() {
            monitor.stop();
        }
        self.lifecycle = PeerLifecycle::Negotiating;
        self.stream.take()
    }

    /// Releases every resource except the transport, which needs an await to close.
    pub fn release(&mut self) -> Option<RemoteStream> {
        let stream = self.reset_media();
        self.pending_candidates.clear();
        self.lifecycle = PeerLifecycle::Closed;
        stream
    }
}

impl Drop for PeerEntry {
    fn drop(&mut self) {
        tracing::debug!("PeerEntry {} is dropped", self.participant_id);
    }
}
