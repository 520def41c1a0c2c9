use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::mpsc, time::Instant};
use url::Url;
use webrtc::{
    ice_transport::{ice_candidate::RTCIceCandidateInit, ice_connection_state::RTCIceConnectionState},
    peer_connection::{
        peer_connection_state::RTCPeerConnectionState,
        sdp::{sdp_type::RTCSdpType, session_description::RTCSessionDescription},
        signaling_state::RTCSignalingState,
    },
};

use crate::{
    error::{Error, NegotiationErrorKind, SignalErrorKind},
    remote_stream::RemoteTrack,
    routed::{
        device::Device,
        transport::{
            ConsumerParams, RemoteTransportParams, RouterTransport, RouterTransportEvent,
            RouterTransportEventSender, RouterTransportFactory,
        },
    },
    signaling::{
        client::{ChannelEvent, Frame, SignalChannel, SignalConnector},
        router_message::{
            DtlsFingerprint, DtlsParameters, DtlsRole, RtcpParameters, RtpEncodingParameters,
            RtpParameters, TransportDirection,
        },
    },
    track::{MediaKind, MediaTrack},
    transport::{
        PeerTransport, PeerTransportEvent, TransportEvent, TransportEventSender, TransportFactory,
    },
};

pub(crate) fn description(sdp_type: RTCSdpType, sdp: &str) -> RTCSessionDescription {
    let mut description = RTCSessionDescription::default();
    description.sdp_type = sdp_type;
    description.sdp = sdp.to_string();
    description
}

pub(crate) fn candidate(value: &str) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: value.to_string(),
        ..Default::default()
    }
}

/// Honors `RUST_LOG` when set.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Lets spawned actors run.
pub(crate) async fn settle() {
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[derive(Debug)]
pub(crate) struct FakeTransportState {
    pub signaling: RTCSignalingState,
    pub local: Option<RTCSessionDescription>,
    pub remote: Option<RTCSessionDescription>,
    pub applied_candidates: Vec<String>,
    pub senders: HashMap<String, (MediaKind, String)>,
    pub audio_sender_counts: Vec<usize>,
    pub bitrates: HashMap<String, Option<u64>>,
    pub offers: u32,
    pub closed: bool,
    pub connected: bool,
    next_id: u32,
}

/// In-memory transport which follows the signaling state machine and reports
/// ICE connected once both descriptions and one remote candidate are in place.
#[derive(Debug)]
pub(crate) struct FakeTransport {
    pub id: String,
    pub peer_id: String,
    events: TransportEventSender,
    fail_replace: bool,
    pub state: Mutex<FakeTransportState>,
}

impl FakeTransport {
    pub fn new(peer_id: &str, events: TransportEventSender, fail_replace: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            peer_id: peer_id.to_string(),
            events,
            fail_replace,
            state: Mutex::new(FakeTransportState {
                signaling: RTCSignalingState::Stable,
                local: None,
                remote: None,
                applied_candidates: Vec::new(),
                senders: HashMap::new(),
                audio_sender_counts: Vec::new(),
                bitrates: HashMap::new(),
                offers: 0,
                closed: false,
                connected: false,
                next_id: 0,
            }),
        }
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(PeerTransportEvent {
            peer_id: self.peer_id.clone(),
            transport_id: self.id.clone(),
            event,
        });
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.state.lock().unwrap().applied_candidates.clone()
    }

    fn invalid(&self, message: &str) -> Error {
        Error::new_negotiation(
            format!("FakeTransport {}: {}", self.id, message),
            NegotiationErrorKind::SignalingStateInvalidError,
        )
    }

    fn record_senders(state: &mut FakeTransportState) {
        let audio = state
            .senders
            .values()
            .filter(|(kind, _)| *kind == MediaKind::Audio)
            .count();
        state.audio_sender_counts.push(audio);
    }

    fn maybe_connected(&self, state: &mut FakeTransportState) {
        if !state.connected
            && state.signaling == RTCSignalingState::Stable
            && state.local.is_some()
            && state.remote.is_some()
            && !state.applied_candidates.is_empty()
        {
            state.connected = true;
            self.emit(TransportEvent::IceConnectionState(
                RTCIceConnectionState::Connected,
            ));
        }
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn create_offer(&self) -> Result<RTCSessionDescription, Error> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(self.invalid("closed"));
        }
        state.offers += 1;
        Ok(description(
            RTCSdpType::Offer,
            &format!("offer {} {}", self.id, state.offers),
        ))
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription, Error> {
        let state = self.state.lock().unwrap();
        if state.signaling != RTCSignalingState::HaveRemoteOffer {
            return Err(self.invalid("no remote offer"));
        }
        Ok(description(RTCSdpType::Answer, &format!("answer {}", self.id)))
    }

    async fn set_local_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        match (description.sdp_type, state.signaling) {
            (RTCSdpType::Offer, RTCSignalingState::Stable) => {
                state.signaling = RTCSignalingState::HaveLocalOffer;
            }
            (RTCSdpType::Answer, RTCSignalingState::HaveRemoteOffer) => {
                state.signaling = RTCSignalingState::Stable;
            }
            _ => return Err(self.invalid("unexpected local description")),
        }
        state.local = Some(description);
        state.next_id += 1;
        let value = format!(
            "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
            self.peer_id,
            5000 + state.next_id
        );
        self.emit(TransportEvent::IceCandidate(candidate(&value)));
        self.maybe_connected(&mut state);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        match (description.sdp_type, state.signaling) {
            (RTCSdpType::Offer, RTCSignalingState::Stable) => {
                state.signaling = RTCSignalingState::HaveRemoteOffer;
            }
            (RTCSdpType::Answer, RTCSignalingState::HaveLocalOffer) => {
                state.signaling = RTCSignalingState::Stable;
            }
            _ => return Err(self.invalid("unexpected remote description")),
        }
        state.remote = Some(description);
        self.maybe_connected(&mut state);
        Ok(())
    }

    async fn local_description(&self) -> Option<RTCSessionDescription> {
        self.state.lock().unwrap().local.clone()
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.remote.is_none() {
            return Err(self.invalid("no remote description"));
        }
        state.applied_candidates.push(candidate.candidate);
        self.maybe_connected(&mut state);
        Ok(())
    }

    fn signaling_state(&self) -> RTCSignalingState {
        self.state.lock().unwrap().signaling
    }

    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<String, Error> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let sender_id = format!("{}-sender-{}", self.id, state.next_id);
        state
            .senders
            .insert(sender_id.clone(), (track.kind, track.id.clone()));
        Self::record_senders(&mut state);
        Ok(sender_id)
    }

    async fn replace_track(&self, sender_id: &str, track: Arc<MediaTrack>) -> Result<(), Error> {
        if self.fail_replace {
            return Err(self.invalid("replace failed"));
        }
        let mut state = self.state.lock().unwrap();
        let Some(sender) = state.senders.get_mut(sender_id) else {
            return Err(self.invalid("unknown sender"));
        };
        sender.1 = track.id.clone();
        Self::record_senders(&mut state);
        Ok(())
    }

    async fn remove_track(&self, sender_id: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.senders.remove(sender_id);
        Self::record_senders(&mut state);
        Ok(())
    }

    async fn set_max_bitrate(&self, sender_id: &str, bitrate: Option<u64>) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .bitrates
            .insert(sender_id.to_string(), bitrate);
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeTransportFactory {
    pub transports: Mutex<Vec<Arc<FakeTransport>>>,
    pub fail_replace: AtomicBool,
}

impl FakeTransportFactory {
    /// Latest transport created for a peer.
    pub fn transport(&self, peer_id: &str) -> Option<Arc<FakeTransport>> {
        self.transports
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|t| t.peer_id == peer_id)
            .cloned()
    }

    pub fn created(&self) -> usize {
        self.transports.lock().unwrap().len()
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        peer_id: &str,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, Error> {
        let transport = Arc::new(FakeTransport::new(
            peer_id,
            events,
            self.fail_replace.load(Ordering::Relaxed),
        ));
        self.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

/// Server side of a fake signal channel.
#[derive(Debug)]
pub(crate) struct ServerEnd {
    pub frames: mpsc::UnboundedReceiver<Frame>,
    pub events: mpsc::UnboundedSender<ChannelEvent>,
}

impl ServerEnd {
    pub fn send_json(&self, value: serde_json::Value) {
        let _ = self.events.send(ChannelEvent::Text(value.to_string()));
    }

    pub fn send_text(&self, text: &str) {
        let _ = self.events.send(ChannelEvent::Text(text.to_string()));
    }

    pub fn close(&self, code: u16) {
        let _ = self.events.send(ChannelEvent::Closed {
            code,
            reason: "test".to_string(),
        });
    }

    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }

    pub async fn next_json(&mut self) -> Option<serde_json::Value> {
        while let Some(frame) = self.frames.recv().await {
            if let Frame::Text(text) = frame {
                return serde_json::from_str(&text).ok();
            }
        }
        None
    }

    /// Every text frame received so far.
    pub fn drain_json(&mut self) -> Vec<serde_json::Value> {
        let mut values = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            if let Frame::Text(text) = frame {
                if let Ok(value) = serde_json::from_str(&text) {
                    values.push(value);
                }
            }
        }
        values
    }
}

#[derive(Debug)]
pub(crate) struct FakeConnector {
    attempts: Mutex<Vec<Instant>>,
    refuse: AtomicBool,
    servers: mpsc::UnboundedSender<ServerEnd>,
}

impl FakeConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (servers, receiver) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                attempts: Mutex::new(Vec::new()),
                refuse: AtomicBool::new(false),
                servers,
            }),
            receiver,
        )
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::Relaxed);
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl SignalConnector for FakeConnector {
    async fn connect(&self, _url: &Url) -> Result<SignalChannel, Error> {
        self.attempts.lock().unwrap().push(Instant::now());
        if self.refuse.load(Ordering::Relaxed) {
            return Err(Error::new_signal(
                "connection refused".to_string(),
                SignalErrorKind::ConnectionError,
            ));
        }
        let (frame_sender, frames) = mpsc::unbounded_channel();
        let (events, event_receiver) = mpsc::unbounded_channel();
        let _ = self.servers.send(ServerEnd { frames, events });
        Ok(SignalChannel {
            sender: frame_sender,
            receiver: event_receiver,
        })
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeRouterState {
    pub connected: bool,
    /// Track id currently bound per kind.
    pub sending: HashMap<MediaKind, String>,
    pub produced: Vec<MediaKind>,
    pub replaced: Vec<MediaKind>,
    pub stopped: Vec<MediaKind>,
    pub consumers: Vec<String>,
    pub closed_consumers: Vec<String>,
    pub closed: bool,
}

/// In-memory router transport that records what the engine asked of it.
#[derive(Debug)]
pub(crate) struct FakeRouterTransport {
    pub id: String,
    pub direction: TransportDirection,
    events: RouterTransportEventSender,
    pub state: Mutex<FakeRouterState>,
}

impl FakeRouterTransport {
    pub fn emit(&self, state: RTCPeerConnectionState) {
        let _ = self.events.send(RouterTransportEvent {
            transport_id: self.id.clone(),
            direction: self.direction,
            state,
        });
    }

    pub fn sending(&self, kind: MediaKind) -> Option<String> {
        self.state.lock().unwrap().sending.get(&kind).cloned()
    }
}

#[async_trait]
impl RouterTransport for FakeRouterTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn direction(&self) -> TransportDirection {
        self.direction
    }

    async fn dtls_parameters(&self) -> Result<DtlsParameters, Error> {
        Ok(DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AA:BB:CC".to_string(),
            }],
        })
    }

    async fn connect(&self) -> Result<(), Error> {
        self.state.lock().unwrap().connected = true;
        Ok(())
    }

    async fn produce(
        &self,
        track: Arc<MediaTrack>,
        device: &Device,
    ) -> Result<RtpParameters, Error> {
        let payload_type = match track.kind {
            MediaKind::Audio => 111,
            MediaKind::Video => 96,
        };
        let codec = device.codec_parameters(track.kind, payload_type)?;
        let mut state = self.state.lock().unwrap();
        state.sending.insert(track.kind, track.id.clone());
        state.produced.push(track.kind);
        let ssrc = 1000 + state.produced.len() as u32;
        Ok(RtpParameters {
            mid: Some(state.produced.len().to_string()),
            codecs: vec![codec],
            header_extensions: vec![],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(ssrc),
                max_bitrate: track.max_bitrate(),
            }],
            rtcp: RtcpParameters {
                cname: Some("local".to_string()),
            },
        })
    }

    async fn replace_track(&self, track: Arc<MediaTrack>) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.sending.insert(track.kind, track.id.clone());
        state.replaced.push(track.kind);
        Ok(())
    }

    async fn stop_producing(&self, kind: MediaKind) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.sending.remove(&kind);
        state.stopped.push(kind);
        Ok(())
    }

    async fn consume(&self, consumer: ConsumerParams, _track: Arc<RemoteTrack>) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .consumers
            .push(consumer.consumer_id);
        Ok(())
    }

    async fn close_consumer(&self, consumer_id: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.consumers.retain(|id| id != consumer_id);
        state.closed_consumers.push(consumer_id.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeRouterTransportFactory {
    pub transports: Mutex<Vec<Arc<FakeRouterTransport>>>,
}

impl FakeRouterTransportFactory {
    /// Latest transport created for a direction.
    pub fn transport(&self, direction: TransportDirection) -> Option<Arc<FakeRouterTransport>> {
        self.transports
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|t| t.direction == direction)
            .cloned()
    }
}

#[async_trait]
impl RouterTransportFactory for FakeRouterTransportFactory {
    async fn create(
        &self,
        params: RemoteTransportParams,
        _device: &Device,
        events: RouterTransportEventSender,
    ) -> Result<Arc<dyn RouterTransport>, Error> {
        let transport = Arc::new(FakeRouterTransport {
            id: params.id,
            direction: params.direction,
            events,
            state: Mutex::new(FakeRouterState::default()),
        });
        self.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}
