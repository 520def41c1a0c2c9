use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use enclose::enc;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use uuid::Uuid;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::{
    audio_monitor::{activity_monitor, AudioActivityMonitor},
    config::SessionConfig,
    engine::{ConnectParams, VoiceEngine},
    error::{Error, RouterErrorKind, SessionErrorKind, SignalError, SignalErrorKind},
    event::{emit, ConnectionState, LocalSession, SessionEvent, SessionEventSender},
    remote_stream::RemoteTrack,
    routed::{
        device::Device,
        registry::{ConsumerEntry, ConsumerRegistry, ProducerEntry, ProducerRegistry},
        requester::{closed, Expect, LinkStatus, RouterLink, RouterRequester},
        rtc_transport::RtcRouterTransportFactory,
        transport::{
            ConsumerParams, RemoteTransportParams, RouterTransport, RouterTransportEvent,
            RouterTransportFactory,
        },
    },
    signaling::{
        client::{SignalClient, SignalConnector, SignalEndpoint, SignalEvent},
        router_message::{
            ProducerInfo, RouterProtocol, RouterRequest, RouterResponse, TransportDirection,
        },
        websocket::WebSocketConnector,
    },
    track::{LocalStream, MediaKind, MediaTrack},
    track_controller::{bitrate_cap, LocalMediaState, ScreenShareQuality},
};

/// What the link forwarder hands to the engine. Responses to pending requests never get here.
#[derive(Debug)]
enum LinkSignal {
    Open(u64),
    Closed { epoch: u64, will_reconnect: bool },
    Fatal(Error),
    Notification(RouterResponse),
}

#[derive(Debug)]
enum RoutedEvent {
    Connect(ConnectParams, oneshot::Sender<Result<(), Error>>),
    Disconnect(oneshot::Sender<()>),
    SetMuted(bool),
    SetDeafened(bool),
    SetVideoEnabled(bool),
    SetScreenShareQuality(ScreenShareQuality),
    ReplaceLocalStream(Arc<LocalStream>, oneshot::Sender<Result<(), Error>>),
    /// Link signal tagged with the connect attempt that opened the link.
    Link(u64, LinkSignal),
    Transport(RouterTransportEvent),
    QualityTick,
    Shutdown,
}

/// Engine that sends every track once to a media router and receives the
/// other participants' tracks from it.
#[derive(Debug)]
pub struct RoutedEngine {
    pub id: String,
    event_sender: mpsc::UnboundedSender<RoutedEvent>,
    state: watch::Receiver<ConnectionState>,
}

impl RoutedEngine {
    pub fn new(
        endpoint: SignalEndpoint,
        room_id: &str,
        peer_id: &str,
        config: SessionConfig,
        connector: Arc<dyn SignalConnector>,
        factory: Arc<dyn RouterTransportFactory>,
        events: SessionEventSender,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let (state_sender, state) = watch::channel(ConnectionState::Idle);
        let (transport_sender, mut transport_receiver) =
            mpsc::unbounded_channel::<RouterTransportEvent>();

        tokio::spawn(enc!((event_sender) async move {
            while let Some(event) = transport_receiver.recv().await {
                if event_sender.send(RoutedEvent::Transport(event)).is_err() {
                    break;
                }
            }
        }));

        let routed = RoutedState {
            id: id.clone(),
            endpoint,
            room_id: room_id.to_string(),
            peer_id: peer_id.to_string(),
            config,
            connector,
            factory,
            events,
            event_sender: event_sender.clone(),
            transport_sender,
            state_sender,
            link: None,
            attempt: 0,
            joined_epoch: None,
            device: None,
            send_transport: None,
            recv_transport: None,
            producers: ProducerRegistry::default(),
            consumers: ConsumerRegistry::default(),
            monitors: HashMap::new(),
            stream: None,
            local_state: LocalMediaState::default(),
            quality: ScreenShareQuality::default(),
            quality_ticker: None,
        };

        tokio::spawn(async move {
            routed_event_loop(routed, event_receiver).await;
        });

        tracing::debug!("RoutedEngine {} is created", id);

        Self {
            id,
            event_sender,
            state,
        }
    }

    /// Engine wired to a real WebSocket signal channel and webrtc-rs transports.
    pub fn with_webrtc(
        endpoint: SignalEndpoint,
        room_id: &str,
        peer_id: &str,
        config: SessionConfig,
        events: SessionEventSender,
    ) -> Result<Self, Error> {
        let factory = RtcRouterTransportFactory::new(config.transport_config())?;
        Ok(Self::new(
            endpoint,
            room_id,
            peer_id,
            config,
            Arc::new(WebSocketConnector::default()),
            Arc::new(factory),
            events,
        ))
    }

    fn send(&self, event: RoutedEvent) -> Result<(), Error> {
        self.event_sender
            .send(event)
            .map_err(|_| engine_stopped(&self.id))
    }
}

fn engine_stopped(id: &str) -> Error {
    Error::new_session(
        format!("RoutedEngine {} is stopped", id),
        SessionErrorKind::EngineStoppedError,
    )
}

fn unexpected(response: RouterResponse) -> Error {
    Error::new_router(
        format!("Unexpected router response: {:?}", response),
        RouterErrorKind::UnexpectedResponseError,
    )
}

fn is_closed(err: &Error) -> bool {
    matches!(err, Error::SignalError(err) if err.kind == SignalErrorKind::ClosedError)
}

#[async_trait]
impl VoiceEngine for RoutedEngine {
    async fn connect(&self, params: ConnectParams) -> Result<(), Error> {
        let (reply, response) = oneshot::channel();
        self.send(RoutedEvent::Connect(params, reply))?;
        response.await.map_err(|_| engine_stopped(&self.id))?
    }

    async fn disconnect(&self) {
        let (reply, response) = oneshot::channel();
        if self.send(RoutedEvent::Disconnect(reply)).is_ok() {
            let _ = response.await;
        }
    }

    async fn set_muted(&self, muted: bool) {
        let _ = self.send(RoutedEvent::SetMuted(muted));
    }

    async fn set_deafened(&self, deafened: bool) {
        let _ = self.send(RoutedEvent::SetDeafened(deafened));
    }

    async fn set_video_enabled(&self, enabled: bool) {
        let _ = self.send(RoutedEvent::SetVideoEnabled(enabled));
    }

    async fn set_screen_share_quality(&self, quality: ScreenShareQuality) {
        let _ = self.send(RoutedEvent::SetScreenShareQuality(quality));
    }

    async fn replace_local_stream(&self, stream: Arc<LocalStream>) -> Result<(), Error> {
        let (reply, response) = oneshot::channel();
        self.send(RoutedEvent::ReplaceLocalStream(stream, reply))?;
        response.await.map_err(|_| engine_stopped(&self.id))?
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

impl Drop for RoutedEngine {
    fn drop(&mut self) {
        let _ = self.event_sender.send(RoutedEvent::Shutdown);
        tracing::debug!("RoutedEngine {} is dropped", self.id);
    }
}

struct RoutedState {
    id: String,
    endpoint: SignalEndpoint,
    room_id: String,
    peer_id: String,
    config: SessionConfig,
    connector: Arc<dyn SignalConnector>,
    factory: Arc<dyn RouterTransportFactory>,
    events: SessionEventSender,
    event_sender: mpsc::UnboundedSender<RoutedEvent>,
    transport_sender: mpsc::UnboundedSender<RouterTransportEvent>,
    state_sender: watch::Sender<ConnectionState>,
    link: Option<Arc<RouterLink>>,
    attempt: u64,
    /// Channel epoch the current join belongs to.
    joined_epoch: Option<u64>,
    device: Option<Device>,
    send_transport: Option<Arc<dyn RouterTransport>>,
    recv_transport: Option<Arc<dyn RouterTransport>>,
    producers: ProducerRegistry,
    consumers: ConsumerRegistry,
    monitors: HashMap<String, AudioActivityMonitor>,
    stream: Option<Arc<LocalStream>>,
    local_state: LocalMediaState,
    quality: ScreenShareQuality,
    quality_ticker: Option<JoinHandle<()>>,
}

async fn routed_event_loop(
    mut routed: RoutedState,
    mut event_receiver: mpsc::UnboundedReceiver<RoutedEvent>,
) {
    while let Some(event) = event_receiver.recv().await {
        match event {
            RoutedEvent::Connect(params, reply) => routed.connect(params, reply).await,
            RoutedEvent::Disconnect(reply) => {
                routed.teardown().await;
                routed.set_state(ConnectionState::Disconnected);
                let _ = reply.send(());
            }
            RoutedEvent::SetMuted(muted) => routed.set_muted(muted),
            RoutedEvent::SetDeafened(deafened) => routed.set_deafened(deafened),
            RoutedEvent::SetVideoEnabled(enabled) => routed.set_video_enabled(enabled),
            RoutedEvent::SetScreenShareQuality(quality) => {
                routed.set_screen_share_quality(quality)
            }
            RoutedEvent::ReplaceLocalStream(stream, reply) => {
                let result = routed.replace_local_stream(stream).await;
                let _ = reply.send(result);
            }
            RoutedEvent::Link(attempt, signal) => {
                if attempt != routed.attempt {
                    tracing::debug!("Drop link signal from stale attempt {}", attempt);
                    continue;
                }
                routed.handle_link_signal(signal).await;
            }
            RoutedEvent::Transport(event) => routed.handle_transport_event(event).await,
            RoutedEvent::QualityTick => routed.report_quality(),
            RoutedEvent::Shutdown => {
                routed.teardown().await;
                break;
            }
        }
    }
    tracing::debug!("RoutedEngine {} event loop has finished", routed.id);
}

impl RoutedState {
    fn set_state(&self, state: ConnectionState) {
        if *self.state_sender.borrow() == state {
            return;
        }
        tracing::info!("RoutedEngine {} connection state: {}", self.id, state);
        self.state_sender.send_replace(state);
        emit(&self.events, SessionEvent::ConnectionStateChanged(state));
    }

    fn state(&self) -> ConnectionState {
        *self.state_sender.borrow()
    }

    fn notify(&self, request: RouterRequest) {
        if let Some(link) = &self.link {
            link.notify(request);
        }
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
        self.set_state(ConnectionState::Connecting);
        self.open_link(url);

        match self.establish().await {
            Ok(()) => {
                self.joined();
                let _ = reply.send(Ok(()));
            }
            Err(err) => {
                self.fail(&err).await;
                let _ = reply.send(Err(err));
            }
        }
    }

    /// Opens the router channel. A forwarder task settles request responses and
    /// passes everything else on as [`LinkSignal`]s.
    fn open_link(&mut self, url: url::Url) {
        let attempt = self.attempt;
        let requester = Arc::new(Mutex::new(RouterRequester::default()));
        let (status_sender, status) = watch::channel(LinkStatus::Waiting);
        let (signal_sender, mut signal_receiver) = mpsc::unbounded_channel();
        let event_sender = self.event_sender.clone();
        let id = self.id.clone();

        tokio::spawn(enc!((requester) async move {
            let mut epoch = 0;
            while let Some(event) = signal_receiver.recv().await {
                let signal = match event {
                    SignalEvent::Open => {
                        epoch += 1;
                        status_sender.send_replace(LinkStatus::Open(epoch));
                        Some(LinkSignal::Open(epoch))
                    }
                    SignalEvent::Message(response) => requester
                        .lock()
                        .ok()
                        .and_then(|mut requester| requester.resolve(response))
                        .map(LinkSignal::Notification),
                    SignalEvent::Closed {
                        code,
                        reason,
                        will_reconnect,
                    } => {
                        let err = SignalError {
                            kind: SignalErrorKind::ClosedError,
                            message: format!("Router channel closed with {}: {}", code, reason),
                        };
                        status_sender.send_replace(if will_reconnect {
                            LinkStatus::Waiting
                        } else {
                            LinkStatus::Gone(err.kind.clone(), err.message.clone())
                        });
                        if let Ok(mut requester) = requester.lock() {
                            requester.fail_all(&err);
                        }
                        Some(LinkSignal::Closed {
                            epoch,
                            will_reconnect,
                        })
                    }
                    SignalEvent::Reconnecting { attempt, delay } => {
                        tracing::debug!(
                            "RoutedEngine {} router reconnect attempt {} in {:?}",
                            id,
                            attempt,
                            delay
                        );
                        None
                    }
                    SignalEvent::Fatal(err) => {
                        let err_ref = match &err {
                            Error::SignalError(err) => err.clone(),
                            other => SignalError {
                                kind: SignalErrorKind::ConnectionError,
                                message: other.to_string(),
                            },
                        };
                        status_sender.send_replace(LinkStatus::Gone(
                            err_ref.kind.clone(),
                            err_ref.message.clone(),
                        ));
                        if let Ok(mut requester) = requester.lock() {
                            requester.fail_all(&err_ref);
                        }
                        Some(LinkSignal::Fatal(err))
                    }
                };
                if let Some(signal) = signal {
                    if event_sender.send(RoutedEvent::Link(attempt, signal)).is_err() {
                        break;
                    }
                }
            }
        }));

        let client = SignalClient::<RouterProtocol>::open(
            self.connector.clone(),
            url,
            self.config.signal.clone(),
            signal_sender,
        );
        self.link = Some(Arc::new(RouterLink::new(
            client,
            requester,
            status,
            self.config.connect_timeout,
        )));
    }

    /// Joins within the connect timeout. A channel drop mid-way restarts the join on the next open.
    async fn establish(&mut self) -> Result<(), Error> {
        let timeout = self.config.connect_timeout;
        match tokio::time::timeout(timeout, self.join_with_retry()).await {
            Ok(result) => result,
            Err(_) => Err(Error::new_session(
                format!("Router join did not complete within {:?}", timeout),
                SessionErrorKind::ConnectTimeoutError,
            )),
        }
    }

    async fn join_with_retry(&mut self) -> Result<(), Error> {
        loop {
            let link = self
                .link
                .clone()
                .ok_or_else(|| closed("Router link is not open".to_string()))?;
            match self.join(&link).await {
                Err(err) if is_closed(&err) && !link.is_gone() => {
                    tracing::info!("RoutedEngine {} join was interrupted: {}", self.id, err);
                    self.release_media().await;
                    if let Some(epoch) = link.epoch() {
                        link.wait_left(epoch).await;
                    }
                }
                result => return result,
            }
        }
    }

    async fn join(&mut self, link: &RouterLink) -> Result<(), Error> {
        link.wait_open().await?;
        let epoch = link.epoch();

        let response = link
            .request(
                RouterRequest::Join {
                    room_id: self.room_id.clone(),
                    peer_id: self.peer_id.clone(),
                },
                Expect::Joined,
            )
            .await?;
        let (rtp_capabilities, existing_producers) = match response {
            RouterResponse::Joined {
                rtp_capabilities,
                existing_producers,
            } => (rtp_capabilities, existing_producers),
            other => return Err(unexpected(other)),
        };
        let device = Device::load(&rtp_capabilities)?;
        self.device = Some(device.clone());
        tracing::info!(
            "RoutedEngine {} joined room {} as {}",
            self.id,
            self.room_id,
            self.peer_id
        );

        let send = self
            .create_transport(link, &device, TransportDirection::Send)
            .await?;
        self.send_transport = Some(send.clone());
        let recv = self
            .create_transport(link, &device, TransportDirection::Recv)
            .await?;
        self.recv_transport = Some(recv.clone());
        for transport in [&send, &recv] {
            connect_transport(link, transport).await?;
        }

        if let Some(stream) = self.stream.clone() {
            for track in stream.tracks() {
                self.produce(link, track).await?;
            }
        }

        for producer in existing_producers {
            if producer.peer_id == self.peer_id {
                continue;
            }
            if let Err(err) = self.consume(link, producer).await {
                if is_closed(&err) {
                    return Err(err);
                }
                tracing::warn!("RoutedEngine {} failed to consume: {}", self.id, err);
            }
        }

        self.joined_epoch = epoch;
        Ok(())
    }

    fn joined(&mut self) {
        self.set_state(ConnectionState::Connected);
        emit(
            &self.events,
            SessionEvent::Welcome(LocalSession {
                participant_id: self.peer_id.clone(),
                name: None,
                role: None,
                features: vec![],
            }),
        );
        self.start_quality_ticker();
    }

    async fn create_transport(
        &self,
        link: &RouterLink,
        device: &Device,
        direction: TransportDirection,
    ) -> Result<Arc<dyn RouterTransport>, Error> {
        let response = link
            .request(
                RouterRequest::CreateWebRtcTransport { direction },
                Expect::TransportCreated(direction),
            )
            .await?;
        let params = match response {
            RouterResponse::TransportCreated {
                id,
                direction,
                ice_parameters,
                ice_candidates,
                dtls_parameters,
            } => RemoteTransportParams {
                id,
                direction,
                ice_parameters,
                ice_candidates,
                dtls_parameters,
            },
            other => return Err(unexpected(other)),
        };
        tracing::debug!(
            "RoutedEngine {} got {} transport {}",
            self.id,
            params.direction,
            params.id
        );
        self.factory
            .create(params, device, self.transport_sender.clone())
            .await
    }

    /// Registers `track` as a producer. Tracks the local state wants silent are produced paused.
    async fn produce(&mut self, link: &RouterLink, track: &Arc<MediaTrack>) -> Result<(), Error> {
        let (Some(send), Some(device)) = (self.send_transport.clone(), self.device.clone()) else {
            return Err(Error::new_router(
                "Send transport is not ready".to_string(),
                RouterErrorKind::TransportNotFoundError,
            ));
        };
        if !device.can_produce(track.kind) {
            tracing::warn!(
                "RoutedEngine {} cannot produce {}, the router has no codec for it",
                self.id,
                track.kind
            );
            return Ok(());
        }
        let paused = match track.kind {
            MediaKind::Audio => self.local_state.muted,
            MediaKind::Video => !self.local_state.video_enabled,
        };
        track.set_max_bitrate(bitrate_cap(
            track,
            self.quality,
            &self.config.screen_share,
        ));
        let rtp_parameters = send.produce(track.clone(), &device).await?;
        let response = link
            .request(
                RouterRequest::Produce {
                    transport_id: send.id(),
                    kind: track.kind,
                    rtp_parameters,
                    paused,
                },
                Expect::Produced,
            )
            .await?;
        let producer_id = match response {
            RouterResponse::Produced { producer_id } => producer_id,
            other => return Err(unexpected(other)),
        };
        if paused {
            link.notify(RouterRequest::PauseProducer {
                producer_id: producer_id.clone(),
            });
        }
        tracing::info!(
            "RoutedEngine {} produces {} as {} paused={}",
            self.id,
            track.kind,
            producer_id,
            paused
        );
        self.producers.insert(ProducerEntry {
            producer_id,
            kind: track.kind,
            track_id: track.id.clone(),
            paused,
        });
        Ok(())
    }

    async fn consume(&mut self, link: &RouterLink, producer: ProducerInfo) -> Result<(), Error> {
        if self.consumers.has_producer(&producer.producer_id) {
            return Ok(());
        }
        let (Some(recv), Some(device)) = (self.recv_transport.clone(), self.device.clone()) else {
            return Err(Error::new_router(
                "Receive transport is not ready".to_string(),
                RouterErrorKind::TransportNotFoundError,
            ));
        };
        let response = link
            .request(
                RouterRequest::Consume {
                    transport_id: recv.id(),
                    producer_id: producer.producer_id.clone(),
                    rtp_capabilities: device.rtp_capabilities().clone(),
                },
                Expect::Consumed(producer.producer_id.clone()),
            )
            .await?;
        let (consumer_id, producer_id, kind, rtp_parameters, peer_id) = match response {
            RouterResponse::Consumed {
                consumer_id,
                producer_id,
                kind,
                rtp_parameters,
                peer_id,
            } => (consumer_id, producer_id, kind, rtp_parameters, peer_id),
            other => return Err(unexpected(other)),
        };
        let participant_id = peer_id.unwrap_or(producer.peer_id);
        let track = Arc::new(
            RemoteTrack::new(consumer_id.clone(), kind, participant_id.clone())
                .with_consumer(consumer_id.clone()),
        );
        recv.consume(
            ConsumerParams {
                consumer_id: consumer_id.clone(),
                producer_id: producer_id.clone(),
                participant_id: participant_id.clone(),
                kind,
                rtp_parameters,
            },
            track.clone(),
        )
        .await?;

        // Audio stays paused at the router while deafened.
        let paused = kind == MediaKind::Audio && self.local_state.deafened;
        if paused {
            track.set_playback_enabled(false);
        } else {
            link.request(
                RouterRequest::ResumeConsumer {
                    consumer_id: consumer_id.clone(),
                },
                Expect::ConsumerResumed(consumer_id.clone()),
            )
            .await?;
        }
        tracing::info!(
            "RoutedEngine {} consumes {} of {} as {}",
            self.id,
            kind,
            participant_id,
            consumer_id
        );
        self.consumers.insert(ConsumerEntry {
            consumer_id,
            producer_id,
            participant_id: participant_id.clone(),
            kind,
            track,
            paused,
        });
        self.publish_stream(&participant_id);
        Ok(())
    }

    /// Emits the participant's composed stream, or its removal once nothing is left.
    fn publish_stream(&mut self, participant_id: &str) {
        match self.consumers.compose(participant_id) {
            Some(stream) => {
                let audio = stream.audio_tracks().next().cloned();
                match audio {
                    Some(track) => {
                        if !self.monitors.contains_key(participant_id) {
                            self.monitors.insert(
                                participant_id.to_string(),
                                activity_monitor(
                                    Some(participant_id.to_string()),
                                    track.pcm(),
                                    &self.config.activity,
                                    self.events.clone(),
                                ),
                            );
                        }
                    }
                    None => {
                        self.monitors.remove(participant_id);
                    }
                }
                emit(
                    &self.events,
                    SessionEvent::StreamAdded {
                        participant_id: participant_id.to_string(),
                        stream,
                    },
                );
            }
            None => {
                self.monitors.remove(participant_id);
                emit(
                    &self.events,
                    SessionEvent::StreamRemoved {
                        participant_id: participant_id.to_string(),
                    },
                );
            }
        }
    }

    async fn close_consumer(&self, entry: &ConsumerEntry) {
        if let Some(recv) = &self.recv_transport {
            if let Err(err) = recv.close_consumer(&entry.consumer_id).await {
                tracing::debug!(
                    "RoutedEngine {} failed to close consumer {}: {}",
                    self.id,
                    entry.consumer_id,
                    err
                );
            }
        }
    }

    async fn handle_link_signal(&mut self, signal: LinkSignal) {
        match signal {
            LinkSignal::Open(epoch) => {
                if self.state() != ConnectionState::Reconnecting || self.joined_epoch.is_some() {
                    return;
                }
                tracing::info!("RoutedEngine {} rejoins on channel epoch {}", self.id, epoch);
                match self.establish().await {
                    Ok(()) => self.joined(),
                    Err(err) => self.fail(&err).await,
                }
            }
            LinkSignal::Closed {
                epoch,
                will_reconnect,
            } => {
                if self.joined_epoch != Some(epoch) {
                    tracing::debug!("RoutedEngine {} ignores close of epoch {}", self.id, epoch);
                    return;
                }
                self.joined_epoch = None;
                if will_reconnect {
                    // The router forgets us with the channel, so everything is rebuilt on rejoin.
                    self.release_media().await;
                    self.set_state(ConnectionState::Reconnecting);
                } else {
                    self.teardown().await;
                    self.set_state(ConnectionState::Disconnected);
                }
            }
            LinkSignal::Fatal(err) => {
                if self.link.is_some() {
                    self.fail(&err).await;
                }
            }
            LinkSignal::Notification(response) => self.handle_notification(response).await,
        }
    }

    async fn handle_notification(&mut self, response: RouterResponse) {
        let Some(link) = self.link.clone() else {
            return;
        };
        match response {
            RouterResponse::NewProducer {
                producer_id,
                kind,
                peer_id,
            } => {
                if peer_id == self.peer_id {
                    return;
                }
                let producer = ProducerInfo {
                    producer_id,
                    kind,
                    peer_id,
                };
                if let Err(err) = self.consume(&link, producer).await {
                    tracing::warn!("RoutedEngine {} failed to consume: {}", self.id, err);
                }
            }
            RouterResponse::ProducerClosed { producer_id, .. } => {
                let Some(entry) = self.consumers.remove_by_producer(&producer_id) else {
                    return;
                };
                tracing::info!(
                    "RoutedEngine {} closes consumer {} of {}",
                    self.id,
                    entry.consumer_id,
                    entry.participant_id
                );
                self.close_consumer(&entry).await;
                self.publish_stream(&entry.participant_id);
            }
            RouterResponse::PeerJoined { peer_id } => {
                emit(&self.events, SessionEvent::PeerJoined(peer_id));
            }
            RouterResponse::PeerLeft { peer_id } => {
                emit(&self.events, SessionEvent::PeerLeft(peer_id.clone()));
                let entries = self.consumers.remove_participant(&peer_id);
                for entry in entries.iter() {
                    self.close_consumer(entry).await;
                }
                if !entries.is_empty() {
                    self.publish_stream(&peer_id);
                }
            }
            RouterResponse::Error { detail } => {
                let message = detail.unwrap_or_else(|| "Router reported an error".to_string());
                let err = Error::new_signal(message, SignalErrorKind::ServerError);
                self.fail(&err).await;
            }
            other => {
                tracing::trace!("RoutedEngine {} ignores {:?}", self.id, other);
            }
        }
    }

    async fn handle_transport_event(&mut self, event: RouterTransportEvent) {
        let current = [&self.send_transport, &self.recv_transport]
            .iter()
            .any(|transport| {
                transport
                    .as_ref()
                    .map(|transport| transport.id() == event.transport_id)
                    .unwrap_or(false)
            });
        if !current {
            tracing::debug!("Drop event of stale transport {}", event.transport_id);
            return;
        }
        match event.state {
            RTCPeerConnectionState::Failed => {
                let err = Error::new_router(
                    format!("{} transport {} failed", event.direction, event.transport_id),
                    RouterErrorKind::TransportFailedError,
                );
                self.fail(&err).await;
            }
            state => {
                tracing::debug!(
                    "RoutedEngine {} {} transport is {}",
                    self.id,
                    event.direction,
                    state
                );
            }
        }
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
                if event_sender.send(RoutedEvent::QualityTick).is_err() {
                    break;
                }
            }
        }));
    }

    fn report_quality(&self) {
        for entry in self.consumers.values() {
            emit(
                &self.events,
                SessionEvent::TrackQuality {
                    participant_id: entry.participant_id.clone(),
                    track_id: entry.track.id.clone(),
                    kind: entry.kind,
                    metrics: entry.track.stats().report(),
                },
            );
        }
    }

    /// Drops every producer, consumer and transport. The link stays.
    async fn release_media(&mut self) {
        for participant_id in self.consumers.participants() {
            emit(
                &self.events,
                SessionEvent::StreamRemoved { participant_id },
            );
        }
        self.consumers.drain();
        self.monitors.clear();
        self.producers.clear();
        for transport in [self.send_transport.take(), self.recv_transport.take()]
            .into_iter()
            .flatten()
        {
            if let Err(err) = transport.close().await {
                tracing::debug!(
                    "RoutedEngine {} failed to close transport {}: {}",
                    self.id,
                    transport.id(),
                    err
                );
            }
        }
        self.device = None;
    }

    async fn teardown(&mut self) {
        if let Some(ticker) = self.quality_ticker.take() {
            ticker.abort();
        }
        self.release_media().await;
        if let Some(link) = self.link.take() {
            link.notify(RouterRequest::Leave);
            link.close();
        }
        self.joined_epoch = None;
    }

    async fn fail(&mut self, err: &Error) {
        tracing::error!("RoutedEngine {} failed: {}", self.id, err);
        emit(&self.events, SessionEvent::Error(err.to_string()));
        self.teardown().await;
        self.set_state(ConnectionState::Failed);
    }

    fn set_muted(&mut self, muted: bool) {
        self.local_state.muted = muted;
        self.set_producer_paused(MediaKind::Audio, muted);
    }

    fn set_video_enabled(&mut self, enabled: bool) {
        self.local_state.video_enabled = enabled;
        self.set_producer_paused(MediaKind::Video, !enabled);
    }

    fn set_producer_paused(&mut self, kind: MediaKind, paused: bool) {
        let Some(entry) = self.producers.get_mut(kind) else {
            return;
        };
        if entry.paused == paused {
            return;
        }
        entry.paused = paused;
        let producer_id = entry.producer_id.clone();
        self.notify(if paused {
            RouterRequest::PauseProducer { producer_id }
        } else {
            RouterRequest::ResumeProducer { producer_id }
        });
    }

    fn set_deafened(&mut self, deafened: bool) {
        self.local_state.deafened = deafened;
        let mut requests = Vec::new();
        for entry in self.consumers.audio_consumers_mut() {
            entry.track.set_playback_enabled(!deafened);
            if entry.paused == deafened {
                continue;
            }
            entry.paused = deafened;
            let consumer_id = entry.consumer_id.clone();
            requests.push(if deafened {
                RouterRequest::PauseConsumer { consumer_id }
            } else {
                RouterRequest::ResumeConsumer { consumer_id }
            });
        }
        for request in requests {
            self.notify(request);
        }
    }

    fn set_screen_share_quality(&mut self, quality: ScreenShareQuality) {
        self.quality = quality;
        if let Some(stream) = &self.stream {
            for track in stream.tracks() {
                track.set_max_bitrate(bitrate_cap(track, quality, &self.config.screen_share));
            }
        }
    }

    /// Moves producers onto the tracks of `stream` without leaving a kind unsent:
    /// kept kinds switch tracks in place, new kinds are produced, vanished kinds are closed last.
    async fn replace_local_stream(&mut self, stream: Arc<LocalStream>) -> Result<(), Error> {
        self.stream = Some(stream.clone());
        for track in stream.tracks() {
            track.set_max_bitrate(bitrate_cap(track, self.quality, &self.config.screen_share));
        }
        let (Some(link), Some(send)) = (self.link.clone(), self.send_transport.clone()) else {
            return Ok(());
        };

        for kind in [MediaKind::Audio, MediaKind::Video] {
            let Some(track) = stream.track(kind) else {
                continue;
            };
            match self.producers.get(kind).cloned() {
                Some(entry) if entry.track_id == track.id => {}
                Some(_) => {
                    send.replace_track(track.clone()).await?;
                    if let Some(entry) = self.producers.get_mut(kind) {
                        entry.track_id = track.id.clone();
                    }
                }
                None => self.produce(&link, &track).await?,
            }
        }

        for kind in [MediaKind::Audio, MediaKind::Video] {
            if stream.track(kind).is_some() {
                continue;
            }
            let Some(entry) = self.producers.remove(kind) else {
                continue;
            };
            if let Err(err) = send.stop_producing(kind).await {
                tracing::debug!("RoutedEngine {} failed to stop {}: {}", self.id, kind, err);
            }
            link.notify(RouterRequest::CloseProducer {
                producer_id: entry.producer_id,
            });
        }
        Ok(())
    }
}

async fn connect_transport(
    link: &RouterLink,
    transport: &Arc<dyn RouterTransport>,
) -> Result<(), Error> {
    let dtls_parameters = transport.dtls_parameters().await?;
    let transport_id = transport.id();
    link.request(
        RouterRequest::ConnectTransport {
            transport_id: transport_id.clone(),
            direction: transport.direction(),
            dtls_parameters,
        },
        Expect::TransportConnected(transport_id),
    )
    .await?;
    transport.connect().await
}
