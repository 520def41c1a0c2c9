use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::{
    error::Error,
    remote_stream::RemoteTrack,
    routed::device::Device,
    signaling::router_message::{
        DtlsParameters, IceCandidate, IceParameters, RtpParameters, TransportDirection,
    },
    track::{MediaKind, MediaTrack},
};

/// Parameters of a transport the router created for us.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTransportParams {
    pub id: String,
    pub direction: TransportDirection,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerParams {
    pub consumer_id: String,
    pub producer_id: String,
    pub participant_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone)]
pub struct RouterTransportEvent {
    pub transport_id: String,
    pub direction: TransportDirection,
    pub state: RTCPeerConnectionState,
}

pub type RouterTransportEventSender = mpsc::UnboundedSender<RouterTransportEvent>;

/// One direction of media between this endpoint and the router.
#[async_trait]
pub trait RouterTransport: Send + Sync + Debug {
    fn id(&self) -> String;
    fn direction(&self) -> TransportDirection;
    /// Local DTLS parameters for `connectTransport`.
    async fn dtls_parameters(&self) -> Result<DtlsParameters, Error>;
    /// Applies the router's ICE and DTLS parameters.
    async fn connect(&self) -> Result<(), Error>;
    /// Binds `track` to the sender of its kind and returns the parameters to produce with.
    async fn produce(&self, track: Arc<MediaTrack>, device: &Device)
        -> Result<RtpParameters, Error>;
    /// Swaps the track on an existing sender without touching the producer.
    async fn replace_track(&self, track: Arc<MediaTrack>) -> Result<(), Error>;
    async fn stop_producing(&self, kind: MediaKind) -> Result<(), Error>;
    async fn consume(&self, consumer: ConsumerParams, track: Arc<RemoteTrack>)
        -> Result<(), Error>;
    async fn close_consumer(&self, consumer_id: &str) -> Result<(), Error>;
    async fn close(&self) -> Result<(), Error>;
}

#[async_trait]
pub trait RouterTransportFactory: Send + Sync + Debug {
    async fn create(
        &self,
        params: RemoteTransportParams,
        device: &Device,
        events: RouterTransportEventSender,
    ) -> Result<Arc<dyn RouterTransport>, Error>;
}
