use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::{
    ice_transport::{ice_candidate::RTCIceCandidateInit, ice_connection_state::RTCIceConnectionState},
    peer_connection::{
        sdp::session_description::RTCSessionDescription, signaling_state::RTCSignalingState,
    },
};

use crate::{error::Error, remote_stream::RemoteTrack, track::MediaTrack};

#[derive(Debug, Clone)]
pub enum TransportEvent {
    IceCandidate(RTCIceCandidateInit),
    IceConnectionState(RTCIceConnectionState),
    NegotiationNeeded,
    Track(Arc<RemoteTrack>),
}

/// A [`TransportEvent`] tagged with the peer and the transport it came from.
#[derive(Debug, Clone)]
pub struct PeerTransportEvent {
    pub peer_id: String,
    pub transport_id: String,
    pub event: TransportEvent,
}

pub type TransportEventSender = mpsc::UnboundedSender<PeerTransportEvent>;

/// One encrypted media transport to a single remote participant.
#[async_trait]
pub trait PeerTransport: Send + Sync + Debug {
    fn id(&self) -> String;
    async fn create_offer(&self) -> Result<RTCSessionDescription, Error>;
    async fn create_answer(&self) -> Result<RTCSessionDescription, Error>;
    async fn set_local_description(&self, description: RTCSessionDescription)
        -> Result<(), Error>;
    async fn set_remote_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), Error>;
    async fn local_description(&self) -> Option<RTCSessionDescription>;
    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error>;
    fn signaling_state(&self) -> RTCSignalingState;
    /// Starts sending a track and returns the sender id.
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<String, Error>;
    /// Swaps the track of an existing sender without renegotiation.
    async fn replace_track(&self, sender_id: &str, track: Arc<MediaTrack>) -> Result<(), Error>;
    async fn remove_track(&self, sender_id: &str) -> Result<(), Error>;
    async fn set_max_bitrate(&self, sender_id: &str, bitrate: Option<u64>) -> Result<(), Error>;
    async fn close(&self) -> Result<(), Error>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync + Debug {
    async fn create(
        &self,
        peer_id: &str,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, Error>;
}
