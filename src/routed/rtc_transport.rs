use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use derivative::Derivative;
use enclose::enc;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine,
        APIBuilder, API,
    },
    ice_transport::ice_candidate::RTCIceCandidateInit,
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_codec::{RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability, RTPCodecType},
        rtp_receiver::RTCRtpReceiver,
        rtp_sender::RTCRtpSender,
        rtp_transceiver_direction::RTCRtpTransceiverDirection,
        RTCRtpTransceiver, RTCRtpTransceiverInit,
    },
    track::{
        track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
        track_remote::TrackRemote,
    },
};

use crate::{
    config::WebRTCTransportConfig,
    error::{Error, NegotiationErrorKind, RouterErrorKind},
    peer_transport::rtcp_reader_loop,
    receiver::{TrackReceiver, AUDIO_LEVEL_URI},
    remote_stream::RemoteTrack,
    routed::{
        device::{Device, MID_URI, OPUS_PAYLOAD_TYPE, VP8_PAYLOAD_TYPE},
        sdp::{remote_answer, ConsumerSsrc},
        transport::{
            ConsumerParams, RemoteTransportParams, RouterTransport, RouterTransportEvent,
            RouterTransportEventSender, RouterTransportFactory,
        },
    },
    signaling::{
        router_message::{
            DtlsParameters, DtlsRole, RtcpParameters, RtpEncodingParameters, RtpParameters,
            TransportDirection,
        },
        sdp_session::{get_fingerprint, media_sections},
    },
    track::{MediaKind, MediaTrack},
};

/// Media engine limited to the codecs the router speaks, at fixed payload types.
pub(crate) fn build_router_api() -> Result<API, Error> {
    let mut media_engine = MediaEngine::default();
    for (kind, payload_type) in [
        (MediaKind::Audio, OPUS_PAYLOAD_TYPE),
        (MediaKind::Video, VP8_PAYLOAD_TYPE),
    ] {
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: kind.default_capability(),
                payload_type,
                ..Default::default()
            },
            kind.codec_type(),
        )?;
        media_engine.register_header_extension(
            RTCRtpHeaderExtensionCapability {
                uri: MID_URI.to_owned(),
            },
            kind.codec_type(),
            None,
        )?;
    }
    media_engine.register_header_extension(
        RTCRtpHeaderExtensionCapability {
            uri: AUDIO_LEVEL_URI.to_owned(),
        },
        RTPCodecType::Audio,
        None,
    )?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

#[derive(Derivative, Clone)]
#[derivative(Debug)]
struct ConsumerSlot {
    consumer_id: String,
    ssrc: ConsumerSsrc,
    track: Arc<RemoteTrack>,
    #[derivative(Debug = "ignore")]
    transceiver: Arc<RTCRtpTransceiver>,
}

/// [`RouterTransport`] backed by a webrtc-rs [`RTCPeerConnection`]. The router
/// never sends an SDP, so its answer is synthesized from the transport parameters.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct RtcRouterTransport {
    pub id: String,
    direction: TransportDirection,
    #[derivative(Debug = "ignore")]
    peer_connection: Arc<RTCPeerConnection>,
    remote: RemoteTransportParams,
    device: Device,
    #[derivative(Debug = "ignore")]
    senders: Mutex<HashMap<MediaKind, Arc<RTCRtpSender>>>,
    consumers: Arc<Mutex<Vec<ConsumerSlot>>>,
    candidates_added: AtomicBool,
    closed_sender: broadcast::Sender<bool>,
}

impl RtcRouterTransport {
    pub(crate) async fn new(
        api: &API,
        config: &WebRTCTransportConfig,
        params: RemoteTransportParams,
        device: &Device,
        events: RouterTransportEventSender,
    ) -> Result<Self, Error> {
        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.clone(),
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await?);
        let (closed_sender, _) = broadcast::channel(1);

        let transport = Self {
            id: params.id.clone(),
            direction: params.direction,
            peer_connection,
            remote: params,
            device: device.clone(),
            senders: Mutex::new(HashMap::new()),
            consumers: Arc::new(Mutex::new(Vec::new())),
            candidates_added: AtomicBool::new(false),
            closed_sender,
        };
        transport.hooks(events);
        transport.prepare_media().await?;

        tracing::debug!(
            "RtcRouterTransport {} direction={} is created",
            transport.id,
            transport.direction
        );
        Ok(transport)
    }

    /// The send side gets one sender per kind up front. The receive side adds a
    /// transceiver per consumer in [`RouterTransport::consume`].
    async fn prepare_media(&self) -> Result<(), Error> {
        match self.direction {
            TransportDirection::Send => {
                let mut senders = self.senders.lock().await;
                for kind in [MediaKind::Audio, MediaKind::Video] {
                    if !self.device.can_produce(kind) {
                        continue;
                    }
                    let placeholder = Arc::new(TrackLocalStaticSample::new(
                        kind.default_capability(),
                        format!("{}-{}", kind, Uuid::new_v4()),
                        format!("router-{}", self.id),
                    ));
                    let sender = self
                        .peer_connection
                        .add_track(placeholder as Arc<dyn TrackLocal + Send + Sync>)
                        .await?;
                    rtcp_reader_loop(sender.clone(), format!("router transport {} {}", self.id, kind));
                    senders.insert(kind, sender);
                }
            }
            TransportDirection::Recv => {}
        }
        Ok(())
    }

    fn hooks(&self, events: RouterTransportEventSender) {
        let peer = self.peer_connection.clone();
        let transport_id = self.id.clone();
        let direction = self.direction;

        peer.on_peer_connection_state_change(Box::new(
            enc!((events, transport_id) move |state: RTCPeerConnectionState| {
                tracing::debug!("RtcRouterTransport {} state changed: {}", transport_id, state);
                let _ = events.send(RouterTransportEvent {
                    transport_id: transport_id.clone(),
                    direction,
                    state,
                });
                Box::pin(async {})
            }),
        ));

        let consumers = self.consumers.clone();
        let closed_sender = self.closed_sender.clone();
        peer.on_track(Box::new(enc!((consumers, closed_sender, transport_id)
            move |track: Arc<TrackRemote>,
                  receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                Box::pin(enc!((consumers, closed_sender, transport_id) async move {
                    let ssrc = track.ssrc();
                    let slot = consumers
                        .lock()
                        .await
                        .iter()
                        .find(|slot| slot.ssrc.ssrc == ssrc)
                        .cloned();
                    let Some(slot) = slot else {
                        tracing::warn!("RtcRouterTransport {} got track with unknown ssrc={}", transport_id, ssrc);
                        return;
                    };
                    tracing::info!("RtcRouterTransport {} receives consumer {} ssrc={}", transport_id, slot.consumer_id, ssrc);
                    TrackReceiver::spawn(track, receiver, slot.track, closed_sender.subscribe()).await;
                }))
            }
        )));
    }

    async fn ensure_local_description(&self) -> Result<RTCSessionDescription, Error> {
        if let Some(description) = self.peer_connection.local_description().await {
            return Ok(description);
        }
        self.renegotiate_local().await
    }

    async fn renegotiate_local(&self) -> Result<RTCSessionDescription, Error> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection.set_local_description(offer).await?;
        self.peer_connection.local_description().await.ok_or_else(|| {
            Error::new_negotiation(
                format!("RtcRouterTransport {} has no local description", self.id),
                NegotiationErrorKind::LocalDescriptionError,
            )
        })
    }

    async fn apply_answer(&self, local: &RTCSessionDescription) -> Result<(), Error> {
        let consumers: Vec<ConsumerSsrc> = self
            .consumers
            .lock()
            .await
            .iter()
            .map(|slot| slot.ssrc.clone())
            .collect();
        let sdp = remote_answer(
            &self.remote.ice_parameters,
            &self.remote.dtls_parameters,
            self.direction,
            &media_sections(&local.sdp)?,
            &self.device,
            &consumers,
        )?;
        self.peer_connection
            .set_remote_description(RTCSessionDescription::answer(sdp)?)
            .await?;
        Ok(())
    }

    async fn renegotiate(&self) -> Result<(), Error> {
        let local = self.renegotiate_local().await?;
        self.apply_answer(&local).await
    }

    async fn sender(&self, kind: MediaKind) -> Result<Arc<RTCRtpSender>, Error> {
        self.senders.lock().await.get(&kind).cloned().ok_or_else(|| {
            Error::new_negotiation(
                format!("RtcRouterTransport {} has no {} sender", self.id, kind),
                NegotiationErrorKind::SenderNotFoundError,
            )
        })
    }
}

#[async_trait]
impl RouterTransport for RtcRouterTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn direction(&self) -> TransportDirection {
        self.direction
    }

    async fn dtls_parameters(&self) -> Result<DtlsParameters, Error> {
        let local = self.ensure_local_description().await?;
        let fingerprint = get_fingerprint(&local.sdp)?;
        // We always take the active side; the router stays passive.
        Ok(DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![fingerprint],
        })
    }

    async fn connect(&self) -> Result<(), Error> {
        let local = self.ensure_local_description().await?;
        self.apply_answer(&local).await?;
        if !self.candidates_added.swap(true, Ordering::SeqCst) {
            for candidate in &self.remote.ice_candidates {
                self.peer_connection
                    .add_ice_candidate(RTCIceCandidateInit {
                        candidate: candidate.to_sdp(),
                        ..Default::default()
                    })
                    .await?;
            }
        }
        tracing::info!("RtcRouterTransport {} is connecting", self.id);
        Ok(())
    }

    async fn produce(
        &self,
        track: Arc<MediaTrack>,
        device: &Device,
    ) -> Result<RtpParameters, Error> {
        self.replace_track(track.clone()).await?;
        let local = self.ensure_local_description().await?;
        let section = media_sections(&local.sdp)?
            .into_iter()
            .find(|section| section.kind == track.kind)
            .ok_or_else(|| {
                Error::new_router(
                    format!("Local offer has no {} section", track.kind),
                    RouterErrorKind::SdpError,
                )
            })?;
        let payload_type = section.payload_types.first().copied().unwrap_or(match track.kind {
            MediaKind::Audio => OPUS_PAYLOAD_TYPE,
            MediaKind::Video => VP8_PAYLOAD_TYPE,
        });
        Ok(RtpParameters {
            mid: section.mid,
            codecs: vec![device.codec_parameters(track.kind, payload_type)?],
            header_extensions: vec![],
            encodings: vec![RtpEncodingParameters {
                ssrc: section.ssrc,
                max_bitrate: track.max_bitrate(),
            }],
            rtcp: RtcpParameters {
                cname: section.cname,
            },
        })
    }

    async fn replace_track(&self, track: Arc<MediaTrack>) -> Result<(), Error> {
        let sender = self.sender(track.kind).await?;
        sender
            .replace_track(Some(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>))
            .await?;
        tracing::debug!("RtcRouterTransport {} sends track {}", self.id, track.id);
        Ok(())
    }

    async fn stop_producing(&self, kind: MediaKind) -> Result<(), Error> {
        let sender = self.sender(kind).await?;
        sender.replace_track(None).await?;
        Ok(())
    }

    async fn consume(&self, consumer: ConsumerParams, track: Arc<RemoteTrack>) -> Result<(), Error> {
        let ssrc = consumer
            .rtp_parameters
            .encodings
            .first()
            .and_then(|encoding| encoding.ssrc)
            .ok_or_else(|| {
                Error::new_router(
                    format!("Consumer {} has no ssrc", consumer.consumer_id),
                    RouterErrorKind::UnexpectedResponseError,
                )
            })?;
        let cname = consumer
            .rtp_parameters
            .rtcp
            .cname
            .clone()
            .unwrap_or_else(|| consumer.participant_id.clone());
        let transceiver = self
            .peer_connection
            .add_transceiver_from_kind(
                consumer.kind.codec_type(),
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        let local = self.renegotiate_local().await?;
        let mid = transceiver.mid().ok_or_else(|| {
            Error::new_negotiation(
                format!(
                    "RtcRouterTransport {} has no mid for consumer {}",
                    self.id, consumer.consumer_id
                ),
                NegotiationErrorKind::LocalDescriptionError,
            )
        })?;
        tracing::debug!(
            "RtcRouterTransport {} receives consumer {} on mid={}",
            self.id,
            consumer.consumer_id,
            mid
        );
        self.consumers.lock().await.push(ConsumerSlot {
            consumer_id: consumer.consumer_id.clone(),
            ssrc: ConsumerSsrc {
                mid: mid.to_string(),
                kind: consumer.kind,
                ssrc,
                cname,
            },
            track,
            transceiver,
        });
        self.apply_answer(&local).await
    }

    async fn close_consumer(&self, consumer_id: &str) -> Result<(), Error> {
        let removed = {
            let mut consumers = self.consumers.lock().await;
            consumers
                .iter()
                .position(|slot| slot.consumer_id == consumer_id)
                .map(|index| consumers.remove(index))
        };
        if let Some(slot) = removed {
            // The m-section stays in the offer and is answered as inactive.
            slot.transceiver
                .set_direction(RTCRtpTransceiverDirection::Inactive)
                .await;
            self.renegotiate().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        let _ = self.closed_sender.send(true);
        self.peer_connection.close().await?;
        Ok(())
    }
}

impl Drop for RtcRouterTransport {
    fn drop(&mut self) {
        tracing::debug!("RtcRouterTransport {} is dropped", self.id);
    }
}

/// Creates [`RtcRouterTransport`]s that share one webrtc-rs API instance.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct RtcRouterTransportFactory {
    #[derivative(Debug = "ignore")]
    api: Arc<API>,
    config: WebRTCTransportConfig,
}

impl RtcRouterTransportFactory {
    pub fn new(config: WebRTCTransportConfig) -> Result<Self, Error> {
        Ok(Self {
            api: Arc::new(build_router_api()?),
            config,
        })
    }
}

#[async_trait]
impl RouterTransportFactory for RtcRouterTransportFactory {
    async fn create(
        &self,
        params: RemoteTransportParams,
        device: &Device,
        events: RouterTransportEventSender,
    ) -> Result<Arc<dyn RouterTransport>, Error> {
        let transport =
            RtcRouterTransport::new(&self.api, &self.config, params, device, events).await?;
        Ok(Arc::new(transport))
    }
}
