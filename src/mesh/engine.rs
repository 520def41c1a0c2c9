use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use enclose::enc;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use uuid::Uuid;
use webrtc::{
    ice_transport::{ice_candidate::RTCIceCandidateInit, ice_connection_state::RTCIceConnectionState},
    peer_connection::{
        sdp::{sdp_type::RTCSdpType, session_description::RTCSessionDescription},
        signaling_state::RTCSignalingState,
    },
};

use crate::{
    audio_monitor::activity_monitor,
    config::{ScreenShareBitrates, SessionConfig},
    engine::{ConnectParams, VoiceEngine},
    error::{Error, NegotiationErrorKind, SessionErrorKind, SignalErrorKind},
    event::{emit, ConnectionState, LocalSession, SessionEvent, SessionEventSender},
    mesh::{
        negotiation::{decide_on_offer, NegotiationState, OfferDecision},
        peer::{GraceTimer, OutboundSender, PeerEntry, PeerLifecycle},
    },
    peer_transport::RtcTransportFactory,
    remote_stream::{RemoteStream, RemoteTrack},
    signaling::{
        client::{SignalClient, SignalConnector, SignalEndpoint, SignalEvent},
        message::{ClientMessage, RoomProtocol, ServerMessage, Signal},
        websocket::WebSocketConnector,
    },
    track::{LocalStream, MediaKind},
    track_controller::{bitrate_cap, LocalMediaState, ScreenShareQuality},
    transport::{PeerTransport, PeerTransportEvent, TransportEvent, TransportFactory},
};

#[derive(Debug)]
enum MeshEvent {
    Connect(ConnectParams, oneshot::Sender<Result<(), Error>>),
    Disconnect(oneshot::Sender<()>),
    SetMuted(bool),
    SetDeafened(bool),
    SetVideoEnabled(bool),
    SetScreenShareQuality(ScreenShareQuality),
    ReplaceLocalStream(Arc<LocalStream>, oneshot::Sender<Result<(), Error>>),
    /// Signal channel event tagged with the connect attempt that opened the channel.
    Signal(u64, SignalEvent<ServerMessage>),
    Transport(PeerTransportEvent),
    GraceExpired { peer_id: String, token: u64 },
    ConnectTimeout(u64),
    QualityTick,
    Shutdown,
}

/// Full-mesh engine: one peer transport per remote participant, negotiated with perfect negotiation.
#[derive(Debug)]
pub struct MeshEngine {
    pub id: String,
    event_sender: mpsc::UnboundedSender<MeshEvent>,
    state: watch::Receiver<ConnectionState>,
}

impl MeshEngine {
    pub fn new(
        endpoint: SignalEndpoint,
        config: SessionConfig,
        connector: Arc<dyn SignalConnector>,
        factory: Arc<dyn TransportFactory>,
        events: SessionEventSender,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let (state_sender, state) = watch::channel(ConnectionState::Idle);
        let (transport_sender, mut transport_receiver) =
            mpsc::unbounded_channel::<PeerTransportEvent>();

        tokio::spawn(enc!((event_sender) async move {
            while let Some(event) = transport_receiver.recv().await {
                if event_sender.send(MeshEvent::Transport(event)).is_err() {
                    break;
                }
            }
        }));

        let mesh = MeshState {
            id: id.clone(),
            endpoint,
            config,
            connector,
            factory,
            events,
            event_sender: event_sender.clone(),
            transport_sender,
            state_sender,
            peers: HashMap::new(),
            roster: Vec::new(),
            local_session: None,
            stream: None,
            local_state: LocalMediaState::default(),
            quality: ScreenShareQuality::default(),
            signal: None,
            attempt: 0,
            pending_connect: None,
            connect_timer: None,
            quality_ticker: None,
            grace_tokens: 0,
        };

        tokio::spawn(async move {
            mesh_event_loop(mesh, event_receiver).await;
        });

        tracing::debug!("MeshEngine {} is created", id);

        Self {
            id,
            event_sender,
            state,
        }
    }

    /// Engine wired to a real WebSocket signal channel and webrtc-rs peer connections.
    pub fn with_webrtc(
        endpoint: SignalEndpoint,
        config: SessionConfig,
        events: SessionEventSender,
    ) -> Result<Self, Error> {
        let factory = RtcTransportFactory::new(config.transport_config())?;
        Ok(Self::new(
            endpoint,
            config,
            Arc::new(WebSocketConnector::default()),
            Arc::new(factory),
            events,
        ))
    }

    fn send(&self, event: MeshEvent) -> Result<(), Error> {
        self.event_sender
            .send(event)
            .map_err(|_| engine_stopped(&self.id))
    }
}

fn peer_not_found(peer_id: &str) -> Error {
    Error::new_negotiation(
        format!("Peer {} is not found", peer_id),
        NegotiationErrorKind::PeerNotFoundError,
    )
}

fn engine_stopped(id: &str) -> Error {
    Error::new_session(
        format!("MeshEngine {} is stopped", id),
        SessionErrorKind::EngineStoppedError,
    )
}

#[async_trait]
impl VoiceEngine for MeshEngine {
    async fn connect(&self, params: ConnectParams) -> Result<(), Error> {
        let (reply, response) = oneshot::channel();
        self.send(MeshEvent::Connect(params, reply))?;
        response.await.map_err(|_| engine_stopped(&self.id))?
    }

    async fn disconnect(&self) {
        let (reply, response) = oneshot::channel();
        if self.send(MeshEvent::Disconnect(reply)).is_ok() {
            let _ = response.await;
        }
    }

    async fn set_muted(&self, muted: bool) {
        let _ = self.send(MeshEvent::SetMuted(muted));
    }

    async fn set_deafened(&self, deafened: bool) {
        let _ = self.send(MeshEvent::SetDeafened(deafened));
    }

    async fn set_video_enabled(&self, enabled: bool) {
        let _ = self.send(MeshEvent::SetVideoEnabled(enabled));
    }

    async fn set_screen_share_quality(&self, quality: ScreenShareQuality) {
        let _ = self.send(MeshEvent::SetScreenShareQuality(quality));
    }

    async fn replace_local_stream(&self, stream: Arc<LocalStream>) -> Result<(), Error> {
        let (reply, response) = oneshot::channel();
        self.send(MeshEvent::ReplaceLocalStream(stream, reply))?;
        response.await.map_err(|_| engine_stopped(&self.id))?
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

impl Drop for MeshEngine {
    fn drop(&mut self) {
        let _ = self.event_sender.send(MeshEvent::Shutdown);
        tracing::debug!("MeshEngine {} is dropped", self.id);
    }
}

struct MeshState {
    id: String,
    endpoint: SignalEndpoint,
    config: SessionConfig,
    connector: Arc<dyn SignalConnector>,
    factory: Arc<dyn TransportFactory>,
    events: SessionEventSender,
    event_sender: mpsc::UnboundedSender<MeshEvent>,
    transport_sender: mpsc::UnboundedSender<PeerTransportEvent>,
    state_sender: watch::Sender<ConnectionState>,
    peers: HashMap<String, PeerEntry>,
    /// Ids of the last roster snapshot.
    roster: Vec<String>,
    local_session: Option<LocalSession>,
    stream: Option<Arc<LocalStream>>,
    local_state: LocalMediaState,
    quality: ScreenShareQuality,
    signal: Option<SignalClient<RoomProtocol>>,
    attempt: u64,
    pending_connect: Option<oneshot::Sender<Result<(), Error>>>,
    connect_timer: Option<JoinHandle<()>>,
    quality_ticker: Option<JoinHandle<()>>,
    grace_tokens: u64,
}

async fn mesh_event_loop(
    mut mesh: MeshState,
    mut event_receiver: mpsc::UnboundedReceiver<MeshEvent>,
) {
    while let Some(event) = event_receiver.recv().await {
        match event {
            MeshEvent::Connect(params, reply) => mesh.connect(params, reply).await,
            MeshEvent::Disconnect(reply) => {
                mesh.teardown().await;
                mesh.set_state(ConnectionState::Disconnected);
                let _ = reply.send(());
            }
            MeshEvent::SetMuted(muted) => mesh.set_muted(muted),
            MeshEvent::SetDeafened(deafened) => mesh.set_deafened(deafened),
            MeshEvent::SetVideoEnabled(enabled) => mesh.set_video_enabled(enabled),
            MeshEvent::SetScreenShareQuality(quality) => {
                mesh.set_screen_share_quality(quality).await
            }
            MeshEvent::ReplaceLocalStream(stream, reply) => {
                let result = mesh.replace_local_stream(stream).await;
                let _ = reply.send(result);
            }
            MeshEvent::Signal(attempt, event) => {
                if attempt != mesh.attempt {
                    tracing::debug!("Drop signal event from stale attempt {}", attempt);
                    continue;
                }
                mesh.handle_signal_event(event).await;
            }
            MeshEvent::Transport(event) => mesh.handle_transport_event(event).await,
            MeshEvent::GraceExpired { peer_id, token } => {
                mesh.grace_expired(&peer_id, token).await
            }
            MeshEvent::ConnectTimeout(attempt) => {
                if attempt == mesh.attempt && mesh.pending_connect.is_some() {
                    mesh.fail(Error::new_session(
                        format!("Connect did not complete within {:?}", mesh.config.connect_timeout),
                        SessionErrorKind::ConnectTimeoutError,
                    ))
                    .await;
                }
            }
            MeshEvent::QualityTick => mesh.report_quality(),
            MeshEvent::Shutdown => {
                mesh.teardown().await;
                break;
            }
        }
    }
    tracing::debug!("MeshEngine {} event loop has finished", mesh.id);
}

impl MeshState {
    fn set_state(&self, state: ConnectionState) {
        if *self.state_sender.borrow() == state {
            return;
        }
        tracing::info!("MeshEngine {} connection state: {}", self.id, state);
        self.state_sender.send_replace(state);
        emit(&self.events, SessionEvent::ConnectionStateChanged(state));
    }

    fn send(&self, message: ClientMessage) {
        if let Some(signal) = &self.signal {
            signal.send(&message);
        }
    }

    fn send_signal(&self, peer_id: &str, signal: Signal) {
        self.send(ClientMessage::Signal {
            to: peer_id.to_string(),
            signal,
        });
    }

    async fn connect(&mut self, params: ConnectParams, reply: oneshot::Sender<Result<(), Error>>) {
        self.teardown().await;
        self.attempt += 1;
        self.stream = Some(params.stream);
        self.local_state = params.state;
        self.quality = params.quality;

        let url = match self.endpoint.resolve() {
            Ok(url) => url,
            Err(err) => {
                self.set_state(ConnectionState::Failed);
                let _ = reply.send(Err(err));
                return;
            }
        };
        self.pending_connect = Some(reply);
        self.set_state(ConnectionState::Connecting);

        let attempt = self.attempt;
        let (signal_sender, mut signal_receiver) = mpsc::unbounded_channel();
        let event_sender = self.event_sender.clone();
        tokio::spawn(enc!((event_sender) async move {
            while let Some(event) = signal_receiver.recv().await {
                if event_sender.send(MeshEvent::Signal(attempt, event)).is_err() {
                    break;
                }
            }
        }));
        self.signal = Some(SignalClient::open(
            self.connector.clone(),
            url,
            self.config.signal.clone(),
            signal_sender,
        ));

        let timeout = self.config.connect_timeout;
        self.connect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = event_sender.send(MeshEvent::ConnectTimeout(attempt));
        }));
    }

    /// Closes every peer and the signal channel. The local stream is kept.
    async fn teardown(&mut self) {
        if let Some(timer) = self.connect_timer.take() {
            timer.abort();
        }
        if let Some(ticker) = self.quality_ticker.take() {
            ticker.abort();
        }
        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(Err(Error::new_session(
                "Connect attempt was superseded".to_string(),
                SessionErrorKind::DisconnectedError,
            )));
        }
        let ids: Vec<String> = self.peers.keys().cloned().collect();
        for id in ids {
            self.close_peer(&id, "session teardown").await;
        }
        if let Some(signal) = self.signal.take() {
            signal.close();
        }
        self.roster.clear();
        self.local_session = None;
    }

    async fn fail(&mut self, err: Error) {
        tracing::error!("MeshEngine {} failed: {}", self.id, err);
        emit(&self.events, SessionEvent::Error(err.to_string()));
        let reply = self.pending_connect.take();
        self.teardown().await;
        self.set_state(ConnectionState::Failed);
        if let Some(reply) = reply {
            let _ = reply.send(Err(err));
        }
    }

    async fn handle_signal_event(&mut self, event: SignalEvent<ServerMessage>) {
        match event {
            SignalEvent::Open => {
                tracing::debug!("MeshEngine {} signal channel is open", self.id);
            }
            SignalEvent::Message(message) => self.handle_server_message(message).await,
            SignalEvent::Closed {
                code,
                reason,
                will_reconnect,
            } => {
                tracing::info!(
                    "MeshEngine {} signal channel closed: code={} reason={}",
                    self.id,
                    code,
                    reason
                );
                if will_reconnect {
                    self.set_state(ConnectionState::Reconnecting);
                } else {
                    self.teardown().await;
                    self.set_state(ConnectionState::Disconnected);
                }
            }
            SignalEvent::Reconnecting { attempt, delay } => {
                tracing::debug!(
                    "MeshEngine {} signal reconnect attempt {} in {:?}",
                    self.id,
                    attempt,
                    delay
                );
                if self.pending_connect.is_none() {
                    self.set_state(ConnectionState::Reconnecting);
                }
            }
            SignalEvent::Fatal(err) => self.fail(err).await,
        }
    }

    async fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Welcome {
                user,
                role,
                features,
            } => {
                let session = LocalSession {
                    participant_id: user.id().to_string(),
                    name: user.name().map(str::to_string),
                    role,
                    features,
                };
                self.welcome(session).await;
            }
            ServerMessage::Participants {
                participants,
                stats,
            } => {
                let roster: HashSet<String> = participants.iter().map(|p| p.id.clone()).collect();
                emit(
                    &self.events,
                    SessionEvent::Participants {
                        participants,
                        stats,
                    },
                );
                let stale: Vec<String> = self
                    .peers
                    .keys()
                    .filter(|id| !roster.contains(*id))
                    .cloned()
                    .collect();
                for id in stale {
                    self.close_peer(&id, "left the roster").await;
                }
                let mut ids: Vec<String> = roster.into_iter().collect();
                ids.sort();
                self.roster = ids.clone();
                for id in ids {
                    self.ensure_peer(&id, true).await;
                }
            }
            ServerMessage::ParticipantUpdated { participant, stats } => {
                let id = participant.id.clone();
                emit(
                    &self.events,
                    SessionEvent::ParticipantUpdated { participant, stats },
                );
                self.ensure_peer(&id, true).await;
            }
            ServerMessage::Recording { recording } => {
                emit(
                    &self.events,
                    SessionEvent::RecordingStateChanged { recording },
                );
            }
            ServerMessage::PeerJoined { user } => {
                emit(&self.events, SessionEvent::PeerJoined(user.id().to_string()));
                self.ensure_peer(user.id(), true).await;
            }
            ServerMessage::PeerLeft { user } => {
                emit(&self.events, SessionEvent::PeerLeft(user.id().to_string()));
                self.close_peer(user.id(), "left the room").await;
            }
            ServerMessage::Signal { signal, from } => self.handle_signal(&from, signal).await,
            ServerMessage::Error { detail } => {
                let message = detail.unwrap_or_else(|| "Server reported an error".to_string());
                self.fail(Error::new_signal(message, SignalErrorKind::ServerError))
                    .await;
            }
            ServerMessage::Ping => self.send(ClientMessage::Pong),
            ServerMessage::Pong => {}
        }
    }

    async fn welcome(&mut self, session: LocalSession) {
        tracing::info!(
            "MeshEngine {} joined as {}",
            self.id,
            session.participant_id
        );
        self.local_session = Some(session.clone());
        // The server learns the local state before anyone observes the session as connected.
        self.push_local_state();
        if let Some(timer) = self.connect_timer.take() {
            timer.abort();
        }
        self.set_state(ConnectionState::Connected);
        emit(&self.events, SessionEvent::Welcome(session));
        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(Ok(()));
        }
        self.start_quality_ticker();
        // A snapshot may arrive ahead of the welcome.
        for id in self.roster.clone() {
            self.ensure_peer(&id, true).await;
        }
    }

    fn push_local_state(&self) {
        self.send(ClientMessage::SetMuted {
            muted: self.local_state.muted,
        });
        self.send(ClientMessage::SetDeafened {
            deafened: self.local_state.deafened,
        });
        self.send(ClientMessage::Media {
            video_enabled: self.local_state.video_enabled,
        });
    }

    fn start_quality_ticker(&mut self) {
        if let Some(ticker) = self.quality_ticker.take() {
            ticker.abort();
        }
        let period = self.config.quality_interval;
        let event_sender = self.event_sender.clone();
        self.quality_ticker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if event_sender.send(MeshEvent::QualityTick).is_err() {
                    break;
                }
            }
        }));
    }

    fn report_quality(&self) {
        for entry in self.peers.values() {
            let Some(stream) = &entry.stream else {
                continue;
            };
            for track in stream.tracks() {
                emit(
                    &self.events,
                    SessionEvent::TrackQuality {
                        participant_id: entry.participant_id.clone(),
                        track_id: track.id.clone(),
                        kind: track.kind,
                        metrics: track.stats().report(),
                    },
                );
            }
        }
    }

    /// Makes sure a transport exists for `peer_id`. Returns whether the peer is usable.
    async fn ensure_peer(&mut self, peer_id: &str, initiate: bool) -> bool {
        let Some(session) = &self.local_session else {
            return false;
        };
        if peer_id == session.participant_id {
            return false;
        }
        if self.peers.contains_key(peer_id) {
            return true;
        }
        let Some(stream) = self.stream.clone() else {
            return false;
        };
        let local_id = session.participant_id.clone();

        let transport = match self
            .factory
            .create(peer_id, self.transport_sender.clone())
            .await
        {
            Ok(transport) => transport,
            Err(err) => {
                tracing::error!("failed to create transport for peer {}: {}", peer_id, err);
                return false;
            }
        };
        let mut entry = PeerEntry::new(&local_id, peer_id, transport);
        if let Err(err) = sync_senders(&mut entry, &stream).await {
            tracing::error!("failed to attach local tracks for peer {}: {}", peer_id, err);
        }
        apply_caps(&entry, &stream, self.quality, &self.config.screen_share).await;
        tracing::info!("Peer {} is added, polite={}", peer_id, entry.polite);
        self.peers.insert(peer_id.to_string(), entry);

        if initiate {
            self.negotiate(peer_id).await;
        }
        true
    }

    async fn negotiate(&mut self, peer_id: &str) {
        let Some(entry) = self.peers.get_mut(peer_id) else {
            return;
        };
        if entry.negotiation.is_making_offer() {
            tracing::debug!("Peer {} already has an offer in flight", peer_id);
            return;
        }
        let transport = entry.transport.clone();
        if transport.signaling_state() != RTCSignalingState::Stable {
            tracing::debug!(
                "Peer {} is not stable ({}), skip negotiation",
                peer_id,
                transport.signaling_state()
            );
            return;
        }
        let previous = entry.negotiation;
        entry.negotiation = NegotiationState::OfferSent;

        match make_offer(&transport).await {
            Ok(description) => self.send_signal(peer_id, Signal::Offer { description }),
            Err(err) => {
                tracing::error!("failed to create offer for peer {}: {}", peer_id, err);
                if let Some(entry) = self.peers.get_mut(peer_id) {
                    entry.negotiation = previous;
                }
            }
        }
    }

    async fn handle_signal(&mut self, from: &str, signal: Signal) {
        match signal {
            Signal::Bye => self.close_peer(from, "bye").await,
            Signal::Offer { description } | Signal::Answer { description } => {
                if !self.ensure_peer(from, false).await {
                    tracing::debug!("Drop description from unknown peer {}", from);
                    return;
                }
                if let Err(err) = self.handle_description(from, description).await {
                    tracing::error!("failed to apply description from peer {}: {}", from, err);
                    if let Some(entry) = self.peers.get_mut(from) {
                        if entry.transport.signaling_state() == RTCSignalingState::Stable {
                            entry.negotiation = NegotiationState::Stable;
                        }
                    }
                }
            }
            Signal::Candidate { candidate } => {
                if !self.ensure_peer(from, false).await {
                    tracing::debug!("Drop candidate from unknown peer {}", from);
                    return;
                }
                self.handle_candidate(from, candidate).await;
            }
        }
    }

    async fn handle_description(
        &mut self,
        peer_id: &str,
        description: RTCSessionDescription,
    ) -> Result<(), Error> {
        let Some(entry) = self.peers.get_mut(peer_id) else {
            return Err(peer_not_found(peer_id));
        };
        let is_offer = description.sdp_type == RTCSdpType::Offer;
        let mut restarted = false;

        if is_offer {
            let signaling = entry.transport.signaling_state();
            match decide_on_offer(entry.polite, entry.negotiation, signaling) {
                OfferDecision::Ignore => {
                    entry.ignore_offer = true;
                    tracing::debug!("Peer {} ignores a colliding offer", peer_id);
                    return Ok(());
                }
                OfferDecision::Accept { discard_local_offer } => {
                    entry.ignore_offer = false;
                    if discard_local_offer {
                        tracing::debug!("Peer {} discards its local offer", peer_id);
                        self.restart_transport(peer_id).await?;
                        restarted = true;
                    }
                }
            }
        } else if entry.negotiation != NegotiationState::OfferSent {
            tracing::debug!("Peer {} got an answer without a pending offer", peer_id);
            return Ok(());
        }

        let Some(entry) = self.peers.get_mut(peer_id) else {
            return Err(peer_not_found(peer_id));
        };
        let transport = entry.transport.clone();
        transport.set_remote_description(description).await?;
        entry.remote_description_set = true;
        entry.negotiation = if is_offer {
            NegotiationState::AnswerPending
        } else {
            NegotiationState::Stable
        };

        let pending: Vec<RTCIceCandidateInit> = entry.pending_candidates.drain(..).collect();
        for candidate in pending {
            if let Err(err) = transport.add_ice_candidate(candidate).await {
                tracing::warn!("failed to apply buffered candidate for peer {}: {}", peer_id, err);
            }
        }

        if !is_offer {
            return Ok(());
        }

        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        let answer = transport.local_description().await.unwrap_or(answer);
        entry.negotiation = NegotiationState::Stable;
        self.send_signal(peer_id, Signal::Answer { description: answer });

        if restarted {
            self.negotiate(peer_id).await;
        }
        Ok(())
    }

    /// webrtc-rs cannot roll a local offer back, so the polite side drops the
    /// transport that made the offer and answers on a fresh one with the same senders.
    async fn restart_transport(&mut self, peer_id: &str) -> Result<(), Error> {
        let transport = self
            .factory
            .create(peer_id, self.transport_sender.clone())
            .await?;
        let stream = self.stream.clone();
        let Some(entry) = self.peers.get_mut(peer_id) else {
            return Err(peer_not_found(peer_id));
        };
        let previous = std::mem::replace(&mut entry.transport, transport);
        entry.senders.clear();
        entry.negotiation = NegotiationState::Idle;
        entry.remote_description_set = false;
        let dropped = entry.reset_media();
        if let Some(stream) = &stream {
            sync_senders(entry, stream).await?;
            apply_caps(entry, stream, self.quality, &self.config.screen_share).await;
        }
        tracing::info!(
            "Peer {} moved from transport {} to {}",
            peer_id,
            previous.id(),
            entry.transport.id()
        );
        if let Err(err) = previous.close().await {
            tracing::debug!("failed to close transport for peer {}: {}", peer_id, err);
        }
        if dropped.is_some() {
            emit(
                &self.events,
                SessionEvent::StreamRemoved {
                    participant_id: peer_id.to_string(),
                },
            );
        }
        Ok(())
    }

    async fn handle_candidate(&mut self, peer_id: &str, candidate: RTCIceCandidateInit) {
        let Some(entry) = self.peers.get_mut(peer_id) else {
            return;
        };
        if !entry.remote_description_set {
            tracing::trace!("Peer {} buffers a candidate", peer_id);
            entry.pending_candidates.push_back(candidate);
            return;
        }
        if let Err(err) = entry.transport.add_ice_candidate(candidate).await {
            if entry.ignore_offer {
                tracing::debug!("Peer {} dropped a candidate of an ignored offer", peer_id);
            } else {
                tracing::warn!("failed to add candidate for peer {}: {}", peer_id, err);
            }
        }
    }

    async fn handle_transport_event(&mut self, event: PeerTransportEvent) {
        let PeerTransportEvent {
            peer_id,
            transport_id,
            event,
        } = event;
        match self.peers.get(&peer_id) {
            Some(entry) if entry.transport.id() == transport_id => {}
            _ => {
                tracing::debug!("Drop event of stale transport {} for peer {}", transport_id, peer_id);
                return;
            }
        }

        match event {
            TransportEvent::IceCandidate(candidate) => {
                self.send_signal(&peer_id, Signal::Candidate { candidate })
            }
            TransportEvent::NegotiationNeeded => self.negotiate(&peer_id).await,
            TransportEvent::IceConnectionState(state) => {
                self.handle_ice_state(&peer_id, state).await
            }
            TransportEvent::Track(track) => self.add_remote_track(&peer_id, track),
        }
    }

    async fn handle_ice_state(&mut self, peer_id: &str, state: RTCIceConnectionState) {
        match state {
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                if let Some(entry) = self.peers.get_mut(peer_id) {
                    if entry.cancel_grace_timer() {
                        tracing::info!("Peer {} recovered within the grace period", peer_id);
                    }
                    entry.lifecycle = PeerLifecycle::Connected;
                }
            }
            RTCIceConnectionState::Disconnected => {
                self.grace_tokens += 1;
                let token = self.grace_tokens;
                let grace = self.config.grace_period;
                let event_sender = self.event_sender.clone();
                let Some(entry) = self.peers.get_mut(peer_id) else {
                    return;
                };
                if entry.pending_teardown.is_some() {
                    return;
                }
                tracing::info!("Peer {} is disconnected, waiting {:?}", peer_id, grace);
                let id = peer_id.to_string();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let _ = event_sender.send(MeshEvent::GraceExpired { peer_id: id, token });
                });
                entry.pending_teardown = Some(GraceTimer { token, handle });
                entry.lifecycle = PeerLifecycle::Disconnected;
            }
            RTCIceConnectionState::Failed | RTCIceConnectionState::Closed => {
                self.close_peer(peer_id, "ice connection ended").await;
            }
            _ => {}
        }
    }

    async fn grace_expired(&mut self, peer_id: &str, token: u64) {
        let current = self
            .peers
            .get(peer_id)
            .and_then(|entry| entry.pending_teardown.as_ref())
            .map(|timer| timer.token);
        if current == Some(token) {
            self.close_peer(peer_id, "grace period expired").await;
        }
    }

    fn add_remote_track(&mut self, peer_id: &str, track: Arc<RemoteTrack>) {
        let Some(entry) = self.peers.get_mut(peer_id) else {
            return;
        };
        let stream = entry
            .stream
            .get_or_insert_with(|| RemoteStream::new(peer_id.to_string()));
        if !stream.add_track(track.clone()) {
            return;
        }
        if track.kind == MediaKind::Audio {
            if self.local_state.deafened {
                track.set_playback_enabled(false);
            }
            if entry.monitor.is_none() {
                entry.monitor = Some(activity_monitor(
                    Some(peer_id.to_string()),
                    track.pcm(),
                    &self.config.activity,
                    self.events.clone(),
                ));
            }
        }
        emit(
            &self.events,
            SessionEvent::StreamAdded {
                participant_id: peer_id.to_string(),
                stream: stream.clone(),
            },
        );
    }

    async fn close_peer(&mut self, peer_id: &str, reason: &str) {
        let Some(mut entry) = self.peers.remove(peer_id) else {
            return;
        };
        tracing::info!("Peer {} is closed: {}", peer_id, reason);
        let stream = entry.release();
        if let Err(err) = entry.transport.close().await {
            tracing::debug!("failed to close transport for peer {}: {}", peer_id, err);
        }
        if stream.is_some() {
            emit(
                &self.events,
                SessionEvent::StreamRemoved {
                    participant_id: peer_id.to_string(),
                },
            );
        }
    }

    fn set_muted(&mut self, muted: bool) {
        self.local_state.muted = muted;
        if self.local_session.is_some() {
            self.send(ClientMessage::SetMuted { muted });
        }
    }

    fn set_deafened(&mut self, deafened: bool) {
        self.local_state.deafened = deafened;
        for entry in self.peers.values() {
            if let Some(stream) = &entry.stream {
                stream.set_audio_playback(!deafened);
            }
        }
        if self.local_session.is_some() {
            self.send(ClientMessage::SetDeafened { deafened });
        }
    }

    fn set_video_enabled(&mut self, enabled: bool) {
        self.local_state.video_enabled = enabled;
        if self.local_session.is_some() {
            self.send(ClientMessage::Media {
                video_enabled: enabled,
            });
        }
    }

    async fn set_screen_share_quality(&mut self, quality: ScreenShareQuality) {
        self.quality = quality;
        let Some(stream) = self.stream.clone() else {
            return;
        };
        for entry in self.peers.values() {
            apply_caps(entry, &stream, quality, &self.config.screen_share).await;
        }
    }

    async fn replace_local_stream(&mut self, stream: Arc<LocalStream>) -> Result<(), Error> {
        self.stream = Some(stream.clone());
        let ids: Vec<String> = self.peers.keys().cloned().collect();
        for id in ids {
            let Some(entry) = self.peers.get_mut(&id) else {
                continue;
            };
            let changed = sync_senders(entry, &stream).await?;
            apply_caps(entry, &stream, self.quality, &self.config.screen_share).await;
            if changed {
                self.negotiate(&id).await;
            }
        }
        Ok(())
    }
}

async fn make_offer(transport: &Arc<dyn PeerTransport>) -> Result<RTCSessionDescription, Error> {
    let offer = transport.create_offer().await?;
    transport.set_local_description(offer.clone()).await?;
    Ok(transport.local_description().await.unwrap_or(offer))
}

/// Points one sender per kind at the tracks of `stream`. Existing senders are
/// switched in place so audio never drops out. Returns whether senders were
/// added or removed, which requires a renegotiation.
async fn sync_senders(entry: &mut PeerEntry, stream: &LocalStream) -> Result<bool, Error> {
    let mut changed = false;
    for kind in [MediaKind::Audio, MediaKind::Video] {
        match (stream.track(kind), entry.senders.get(&kind).cloned()) {
            (Some(track), Some(sender)) => {
                if sender.track_id != track.id {
                    entry.transport.replace_track(&sender.id, track.clone()).await?;
                    entry.senders.insert(
                        kind,
                        OutboundSender {
                            id: sender.id,
                            track_id: track.id.clone(),
                        },
                    );
                }
            }
            (Some(track), None) => {
                let id = entry.transport.add_track(track.clone()).await?;
                entry.senders.insert(
                    kind,
                    OutboundSender {
                        id,
                        track_id: track.id.clone(),
                    },
                );
                changed = true;
            }
            (None, Some(sender)) => {
                entry.transport.remove_track(&sender.id).await?;
                entry.senders.remove(&kind);
                changed = true;
            }
            (None, None) => {}
        }
    }
    Ok(changed)
}

async fn apply_caps(
    entry: &PeerEntry,
    stream: &LocalStream,
    quality: ScreenShareQuality,
    bitrates: &ScreenShareBitrates,
) {
    for (kind, sender) in entry.senders.iter() {
        let Some(track) = stream.track(*kind) else {
            continue;
        };
        let cap = bitrate_cap(&track, quality, bitrates);
        if let Err(err) = entry.transport.set_max_bitrate(&sender.id, cap).await {
            tracing::warn!(
                "failed to cap sender {} for peer {}: {}",
                sender.id,
                entry.participant_id,
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::WebRTCTransportConfig,
        testing::{init_tracing, settle, FakeConnector, FakeTransportFactory, ServerEnd},
        track::MediaTrack,
        transport::TransportEventSender,
    };
    use serde_json::{json, Value};
    use std::time::Duration;

    struct Harness {
        engine: Arc<MeshEngine>,
        factory: Arc<FakeTransportFactory>,
        server: ServerEnd,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    }

    fn audio_video_stream() -> Arc<LocalStream> {
        Arc::new(LocalStream::new(vec![
            MediaTrack::new(MediaKind::Audio, "mic", "local"),
            MediaTrack::new(MediaKind::Video, "camera", "local"),
        ]))
    }

    async fn start(local_id: &str, state: LocalMediaState, stream: Arc<LocalStream>) -> Harness {
        let factory = Arc::new(FakeTransportFactory::default());
        let (engine, server, events) = start_with(local_id, state, stream, factory.clone()).await;
        Harness {
            engine,
            factory,
            server,
            events,
        }
    }

    async fn start_with(
        local_id: &str,
        state: LocalMediaState,
        stream: Arc<LocalStream>,
        factory: Arc<dyn TransportFactory>,
    ) -> (
        Arc<MeshEngine>,
        ServerEnd,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        init_tracing();
        let (connector, mut servers) = FakeConnector::new();
        let (events_sender, events) = mpsc::unbounded_channel();
        let engine = Arc::new(MeshEngine::new(
            SignalEndpoint::new("ws://localhost/ws"),
            SessionConfig::default(),
            connector,
            factory,
            events_sender,
        ));
        let connecting = tokio::spawn(enc!((engine) async move {
            engine
                .connect(ConnectParams {
                    stream,
                    state,
                    quality: ScreenShareQuality::default(),
                })
                .await
        }));
        let server = servers.recv().await.unwrap();
        server.send_json(json!({"type": "welcome", "user": {"id": local_id}}));
        connecting.await.unwrap().unwrap();
        (engine, server, events)
    }

    fn signals(values: Vec<Value>) -> Vec<Value> {
        values
            .into_iter()
            .filter(|value| value["type"] == "signal")
            .collect()
    }

    fn signal_from(from: &str, signal: Value) -> Value {
        json!({"type": "signal", "from": from, "signal": signal})
    }

    fn drain_events(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut collected = Vec::new();
        while let Ok(event) = events.try_recv() {
            collected.push(event);
        }
        collected
    }

    #[tokio::test]
    async fn test_muted_connect_announces_state_first() {
        let (connector, mut servers) = FakeConnector::new();
        let factory = Arc::new(FakeTransportFactory::default());
        let (events_sender, mut events) = mpsc::unbounded_channel();
        let engine = Arc::new(MeshEngine::new(
            SignalEndpoint::new("ws://localhost/ws"),
            SessionConfig::default(),
            connector,
            factory,
            events_sender,
        ));
        let connecting = tokio::spawn(enc!((engine) async move {
            engine
                .connect(ConnectParams {
                    stream: audio_video_stream(),
                    state: LocalMediaState {
                        muted: true,
                        ..Default::default()
                    },
                    quality: ScreenShareQuality::default(),
                })
                .await
        }));
        let mut server = servers.recv().await.unwrap();
        server.send_json(json!({"type": "welcome", "user": "alice"}));

        loop {
            match events.recv().await.unwrap() {
                SessionEvent::ConnectionStateChanged(ConnectionState::Connected) => break,
                SessionEvent::ConnectionStateChanged(state) => {
                    assert_eq!(state, ConnectionState::Connecting)
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        // Already on the wire when Connected was observed.
        let sent = server.drain_json();
        assert_eq!(sent[0], json!({"type": "set-muted", "muted": true}));
        assert_eq!(sent[1], json!({"type": "set-deafened", "deafened": false}));
        assert_eq!(sent[2], json!({"type": "media", "videoEnabled": false}));

        connecting.await.unwrap().unwrap();
        assert_eq!(engine.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_impolite_side_ignores_colliding_offer() {
        let mut h = start("alice", LocalMediaState::default(), audio_video_stream()).await;
        h.server.send_json(json!({"type": "system:peer-joined", "user": "bob"}));
        settle().await;

        let sent = signals(h.server.drain_json());
        assert_eq!(sent[0]["to"], "bob");
        assert_eq!(sent[0]["signal"]["kind"], "offer");
        let transport = h.factory.transport("bob").unwrap();
        assert_eq!(transport.signaling_state(), RTCSignalingState::HaveLocalOffer);

        h.server.send_json(signal_from(
            "bob",
            json!({"kind": "offer", "description": {"type": "offer", "sdp": "bob offer"}}),
        ));
        h.server.send_json(signal_from(
            "bob",
            json!({"kind": "candidate", "candidate": {"candidate": "candidate:bob-1"}}),
        ));
        settle().await;

        assert!(signals(h.server.drain_json())
            .iter()
            .all(|value| value["signal"]["kind"] != "answer"));
        assert_eq!(transport.signaling_state(), RTCSignalingState::HaveLocalOffer);
        assert!(transport.applied_candidates().is_empty());

        h.server.send_json(signal_from(
            "bob",
            json!({"kind": "answer", "description": {"type": "answer", "sdp": "bob answer"}}),
        ));
        settle().await;

        assert_eq!(transport.signaling_state(), RTCSignalingState::Stable);
        assert_eq!(transport.applied_candidates(), vec!["candidate:bob-1"]);
        assert!(transport.is_connected());
        drop(h.events);
    }

    #[tokio::test]
    async fn test_polite_side_restarts_and_answers() {
        let mut h = start("bob", LocalMediaState::default(), audio_video_stream()).await;
        h.server.send_json(json!({"type": "system:peer-joined", "user": "alice"}));
        settle().await;
        let sent = signals(h.server.drain_json());
        assert_eq!(sent[0]["signal"]["kind"], "offer");
        let first = h.factory.transport("alice").unwrap();

        h.server.send_json(signal_from(
            "alice",
            json!({"kind": "candidate", "candidate": {"candidate": "candidate:alice-1"}}),
        ));
        h.server.send_json(signal_from(
            "alice",
            json!({"kind": "offer", "description": {"type": "offer", "sdp": "alice offer"}}),
        ));
        settle().await;

        let kinds: Vec<Value> = signals(h.server.drain_json())
            .into_iter()
            .map(|value| value["signal"]["kind"].clone())
            .filter(|kind| kind != "candidate")
            .collect();
        assert_eq!(kinds, vec![json!("answer"), json!("offer")]);

        assert!(first.is_closed());
        assert_eq!(h.factory.created(), 2);
        let transport = h.factory.transport("alice").unwrap();
        assert_eq!(transport.signaling_state(), RTCSignalingState::HaveLocalOffer);
        assert_eq!(transport.applied_candidates(), vec!["candidate:alice-1"]);
        let kinds: HashSet<MediaKind> = transport
            .state
            .lock()
            .unwrap()
            .senders
            .values()
            .map(|(kind, _)| *kind)
            .collect();
        assert_eq!(kinds, HashSet::from([MediaKind::Audio, MediaKind::Video]));
    }

    #[tokio::test]
    async fn test_roster_before_welcome_creates_peers() {
        init_tracing();
        let (connector, mut servers) = FakeConnector::new();
        let factory = Arc::new(FakeTransportFactory::default());
        let (events_sender, _events) = mpsc::unbounded_channel();
        let engine = Arc::new(MeshEngine::new(
            SignalEndpoint::new("ws://localhost/ws"),
            SessionConfig::default(),
            connector,
            factory.clone(),
            events_sender,
        ));
        let connecting = tokio::spawn(enc!((engine) async move {
            engine
                .connect(ConnectParams {
                    stream: audio_video_stream(),
                    state: LocalMediaState::default(),
                    quality: ScreenShareQuality::default(),
                })
                .await
        }));
        let mut server = servers.recv().await.unwrap();
        server.send_json(json!({
            "type": "state:participants",
            "participants": [{"id": "alice"}, {"id": "bob"}, {"id": "carol"}],
            "stats": {"total": 3}
        }));
        settle().await;
        assert_eq!(factory.created(), 0);

        server.send_json(json!({"type": "welcome", "user": "alice"}));
        connecting.await.unwrap().unwrap();
        settle().await;

        assert!(factory.transport("bob").is_some());
        assert!(factory.transport("carol").is_some());
        assert_eq!(factory.created(), 2);
        let offered: HashSet<String> = signals(server.drain_json())
            .into_iter()
            .filter(|value| value["signal"]["kind"] == "offer")
            .filter_map(|value| value["to"].as_str().map(str::to_string))
            .collect();
        assert_eq!(
            offered,
            HashSet::from(["bob".to_string(), "carol".to_string()])
        );
    }

    #[tokio::test]
    async fn test_candidates_before_offer_are_applied_in_order() {
        let mut h = start("alice", LocalMediaState::default(), audio_video_stream()).await;
        for value in ["candidate:1", "candidate:2", "candidate:3"] {
            h.server.send_json(signal_from(
                "bob",
                json!({"kind": "candidate", "candidate": {"candidate": value}}),
            ));
        }
        settle().await;
        let transport = h.factory.transport("bob").unwrap();
        assert!(transport.applied_candidates().is_empty());

        h.server.send_json(signal_from(
            "bob",
            json!({"kind": "offer", "description": {"type": "offer", "sdp": "bob offer"}}),
        ));
        settle().await;

        assert_eq!(
            transport.applied_candidates(),
            vec!["candidate:1", "candidate:2", "candidate:3"]
        );
        let sent = signals(h.server.drain_json());
        assert!(sent
            .iter()
            .any(|value| value["to"] == "bob" && value["signal"]["kind"] == "answer"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period() {
        let mut h = start("alice", LocalMediaState::default(), audio_video_stream()).await;
        h.server.send_json(json!({"type": "system:peer-joined", "user": "bob"}));
        settle().await;
        let transport = h.factory.transport("bob").unwrap();
        transport.emit(TransportEvent::Track(Arc::new(RemoteTrack::new(
            "bob-audio".to_string(),
            MediaKind::Audio,
            "bob".to_string(),
        ))));
        settle().await;

        transport.emit(TransportEvent::IceConnectionState(
            RTCIceConnectionState::Disconnected,
        ));
        tokio::time::sleep(Duration::from_secs(3)).await;
        transport.emit(TransportEvent::IceConnectionState(
            RTCIceConnectionState::Connected,
        ));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!transport.is_closed());

        transport.emit(TransportEvent::IceConnectionState(
            RTCIceConnectionState::Disconnected,
        ));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(transport.is_closed());

        transport.emit(TransportEvent::IceConnectionState(
            RTCIceConnectionState::Failed,
        ));
        settle().await;

        let events = drain_events(&mut h.events);
        let added = events
            .iter()
            .filter(|event| matches!(event, SessionEvent::StreamAdded { .. }))
            .count();
        let removed = events
            .iter()
            .filter(|event| matches!(event, SessionEvent::StreamRemoved { participant_id } if participant_id == "bob"))
            .count();
        assert_eq!(added, 1);
        assert_eq!(removed, 1);
        assert_eq!(h.factory.created(), 1);
    }

    #[tokio::test]
    async fn test_replace_stream_keeps_audio_sender() {
        let mut h = start("alice", LocalMediaState::default(), audio_video_stream()).await;
        h.server.send_json(json!({"type": "system:peer-joined", "user": "bob"}));
        settle().await;
        let transport = h.factory.transport("bob").unwrap();
        let offers = transport.state.lock().unwrap().offers;

        let next = Arc::new(LocalStream::new(vec![
            MediaTrack::new(MediaKind::Audio, "headset", "local"),
            MediaTrack::new(MediaKind::Video, "Screen 1", "local").with_content_hint("detail"),
        ]));
        h.engine.replace_local_stream(next.clone()).await.unwrap();

        let state = transport.state.lock().unwrap();
        assert!(state.audio_sender_counts.iter().all(|count| *count == 1));
        let track_ids: HashSet<String> =
            state.senders.values().map(|(_, id)| id.clone()).collect();
        let expected: HashSet<String> = next.tracks().iter().map(|t| t.id.clone()).collect();
        assert_eq!(track_ids, expected);
        assert_eq!(state.offers, offers);
        assert!(state.bitrates.values().any(|cap| *cap == Some(1_500_000)));
    }

    #[tokio::test]
    async fn test_server_error_fails_session() {
        let mut h = start("alice", LocalMediaState::default(), audio_video_stream()).await;
        h.server.send_json(json!({"type": "error", "detail": "room closed"}));
        settle().await;
        assert_eq!(h.engine.connection_state(), ConnectionState::Failed);
        let events = drain_events(&mut h.events);
        assert!(events
            .iter()
            .any(|event| matches!(event, SessionEvent::Error(message) if message.contains("room closed"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let (connector, _servers) = FakeConnector::new();
        let (events_sender, _events) = mpsc::unbounded_channel();
        let engine = MeshEngine::new(
            SignalEndpoint::new("ws://localhost/ws"),
            SessionConfig::default(),
            connector,
            Arc::new(FakeTransportFactory::default()),
            events_sender,
        );
        let result = engine
            .connect(ConnectParams {
                stream: audio_video_stream(),
                state: LocalMediaState::default(),
                quality: ScreenShareQuality::default(),
            })
            .await;
        match result {
            Err(Error::SessionError(err)) => {
                assert_eq!(err.kind, SessionErrorKind::ConnectTimeoutError)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(engine.connection_state(), ConnectionState::Failed);
    }

    /// Relays signals between two engines, delivering candidates ahead of descriptions.
    fn relay(from: &str, values: Vec<Value>, to: &ServerEnd) {
        let (candidates, descriptions): (Vec<Value>, Vec<Value>) = signals(values)
            .into_iter()
            .partition(|value| value["signal"]["kind"] == "candidate");
        for value in candidates.into_iter().chain(descriptions) {
            to.send_json(signal_from(from, value["signal"].clone()));
        }
    }

    #[tokio::test]
    async fn test_two_peers_connect_with_reordered_signals() {
        let mut alice = start("alice", LocalMediaState::default(), audio_video_stream()).await;
        let mut bob = start("bob", LocalMediaState::default(), audio_video_stream()).await;
        let roster = json!({
            "type": "state:participants",
            "participants": [{"id": "alice"}, {"id": "bob"}],
            "stats": {"total": 2}
        });
        alice.server.send_json(roster.clone());
        bob.server.send_json(roster);

        for _ in 0..10 {
            settle().await;
            let from_alice = alice.server.drain_json();
            let from_bob = bob.server.drain_json();
            relay("alice", from_alice, &bob.server);
            relay("bob", from_bob, &alice.server);
        }

        let alice_transport = alice.factory.transport("bob").unwrap();
        let bob_transport = bob.factory.transport("alice").unwrap();
        assert!(alice_transport.is_connected());
        assert!(bob_transport.is_connected());
        assert_eq!(alice_transport.signaling_state(), RTCSignalingState::Stable);
        assert_eq!(bob_transport.signaling_state(), RTCSignalingState::Stable);
        assert_eq!(alice.factory.created(), 1);
        // bob is polite and answered alice's offer on a fresh transport.
        assert_eq!(bob.factory.created(), 2);
    }

    /// Keeps every webrtc-rs transport it hands out.
    #[derive(Debug)]
    struct RecordingFactory {
        inner: RtcTransportFactory,
        created: std::sync::Mutex<Vec<Arc<dyn PeerTransport>>>,
    }

    impl RecordingFactory {
        fn new() -> Arc<Self> {
            let config = WebRTCTransportConfig {
                ice_servers: Vec::new(),
            };
            Arc::new(Self {
                inner: RtcTransportFactory::new(config).unwrap(),
                created: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn latest(&self) -> Arc<dyn PeerTransport> {
            self.created.lock().unwrap().last().cloned().unwrap()
        }

        fn count(&self) -> usize {
            self.created.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TransportFactory for RecordingFactory {
        async fn create(
            &self,
            peer_id: &str,
            events: TransportEventSender,
        ) -> Result<Arc<dyn PeerTransport>, Error> {
            let transport = self.inner.create(peer_id, events).await?;
            self.created.lock().unwrap().push(transport.clone());
            Ok(transport)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_glare_resolves_on_webrtc_transports() {
        let alice_factory = RecordingFactory::new();
        let bob_factory = RecordingFactory::new();
        let (_alice, mut alice_server, _alice_events) = start_with(
            "alice",
            LocalMediaState::default(),
            audio_video_stream(),
            alice_factory.clone(),
        )
        .await;
        let (_bob, mut bob_server, _bob_events) = start_with(
            "bob",
            LocalMediaState::default(),
            audio_video_stream(),
            bob_factory.clone(),
        )
        .await;
        let roster = json!({
            "type": "state:participants",
            "participants": [{"id": "alice"}, {"id": "bob"}],
            "stats": {"total": 2}
        });
        alice_server.send_json(roster.clone());
        bob_server.send_json(roster);

        let mut quiet_rounds = 0;
        for _ in 0..250 {
            settle().await;
            let from_alice = signals(alice_server.drain_json());
            let from_bob = signals(bob_server.drain_json());
            let quiet = from_alice.is_empty() && from_bob.is_empty();
            for value in from_alice {
                bob_server.send_json(signal_from("alice", value["signal"].clone()));
            }
            for value in from_bob {
                alice_server.send_json(signal_from("bob", value["signal"].clone()));
            }
            let stable = alice_factory.count() > 0
                && bob_factory.count() > 0
                && alice_factory.latest().signaling_state() == RTCSignalingState::Stable
                && bob_factory.latest().signaling_state() == RTCSignalingState::Stable;
            quiet_rounds = if quiet && stable { quiet_rounds + 1 } else { 0 };
            if quiet_rounds == 3 {
                break;
            }
        }

        assert_eq!(quiet_rounds, 3);
        assert_eq!(alice_factory.count(), 1);
        assert_eq!(bob_factory.count(), 2);
        let bob_transport = bob_factory.latest();
        let answer = bob_transport.local_description().await.unwrap();
        assert!(answer.sdp.contains("m=audio"));
        assert!(answer.sdp.contains("m=video"));
    }
}
