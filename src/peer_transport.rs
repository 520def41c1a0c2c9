use std::{collections::HashMap, sync::Arc};

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
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_connection_state::RTCIceConnectionState,
    },
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration,
        sdp::session_description::RTCSessionDescription,
        signaling_state::RTCSignalingState,
        RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_codec::{RTCRtpHeaderExtensionCapability, RTPCodecType},
        rtp_receiver::RTCRtpReceiver,
        rtp_sender::RTCRtpSender,
        RTCRtpTransceiver,
    },
    track::{track_local::TrackLocal, track_remote::TrackRemote},
};

use crate::{
    config::WebRTCTransportConfig,
    error::{Error, NegotiationErrorKind},
    receiver::{TrackReceiver, AUDIO_LEVEL_URI},
    remote_stream::RemoteTrack,
    track::{MediaKind, MediaTrack},
    transport::{
        PeerTransport, PeerTransportEvent, TransportEvent, TransportEventSender, TransportFactory,
    },
};

/// Media engine with the default codecs plus the audio level header extension.
pub(crate) fn build_api() -> Result<API, Error> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
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

/// Drains RTCP from a sender so that interceptors keep working.
pub(crate) fn rtcp_reader_loop(sender: Arc<RTCRtpSender>, label: String) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while let Ok((_, _)) = sender.read(&mut buf).await {}
        tracing::debug!("RTCP reader loop for {} has finished", label);
    });
}

/// [`PeerTransport`] backed by a webrtc-rs [`RTCPeerConnection`].
#[derive(Derivative)]
#[derivative(Debug)]
pub struct RtcPeerTransport {
    pub id: String,
    peer_id: String,
    #[derivative(Debug = "ignore")]
    peer_connection: Arc<RTCPeerConnection>,
    #[derivative(Debug = "ignore")]
    senders: Mutex<HashMap<String, (Arc<RTCRtpSender>, Arc<MediaTrack>)>>,
    closed_sender: broadcast::Sender<bool>,
}

impl RtcPeerTransport {
    pub(crate) async fn new(
        api: &API,
        config: &WebRTCTransportConfig,
        peer_id: &str,
        events: TransportEventSender,
    ) -> Result<Self, Error> {
        let id = Uuid::new_v4().to_string();
        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.clone(),
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await?);
        let (closed_sender, _) = broadcast::channel(1);

        let transport = Self {
            id,
            peer_id: peer_id.to_string(),
            peer_connection,
            senders: Mutex::new(HashMap::new()),
            closed_sender,
        };
        transport.ice_state_hooks(events);

        tracing::debug!(
            "RtcPeerTransport {} for peer {} is created",
            transport.id,
            transport.peer_id
        );

        Ok(transport)
    }

    fn ice_state_hooks(&self, events: TransportEventSender) {
        let peer = self.peer_connection.clone();
        let peer_id = self.peer_id.clone();
        let transport_id = self.id.clone();

        peer.on_ice_candidate(Box::new(
            enc!((events, peer_id, transport_id) move |candidate: Option<RTCIceCandidate>| {
                Box::pin(enc!((events, peer_id, transport_id) async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    tracing::debug!("on ice candidate for peer {}: {}", peer_id, candidate);
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events.send(PeerTransportEvent {
                                peer_id,
                                transport_id,
                                event: TransportEvent::IceCandidate(init),
                            });
                        }
                        Err(err) => {
                            tracing::error!("failed to serialize ice candidate: {}", err);
                        }
                    }
                }))
            }),
        ));

        peer.on_ice_connection_state_change(Box::new(
            enc!((events, peer_id, transport_id) move |state: RTCIceConnectionState| {
                tracing::debug!("ICE connection state for peer {} changed: {}", peer_id, state);
                let _ = events.send(PeerTransportEvent {
                    peer_id: peer_id.clone(),
                    transport_id: transport_id.clone(),
                    event: TransportEvent::IceConnectionState(state),
                });
                Box::pin(async {})
            }),
        ));

        peer.on_negotiation_needed(Box::new(enc!((events, peer_id, transport_id) move || {
            let _ = events.send(PeerTransportEvent {
                peer_id: peer_id.clone(),
                transport_id: transport_id.clone(),
                event: TransportEvent::NegotiationNeeded,
            });
            Box::pin(async {})
        })));

        let closed_sender = self.closed_sender.clone();
        peer.on_track(Box::new(enc!((events, peer_id, transport_id, closed_sender)
            move |track: Arc<TrackRemote>,
                  receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                Box::pin(enc!((events, peer_id, transport_id, closed_sender) async move {
                    let Some(kind) = MediaKind::from_codec_type(track.kind()) else {
                        tracing::warn!("Ignoring track {} with unknown kind", track.id());
                        return;
                    };
                    tracing::info!("Track received from peer {}: track_id={}, ssrc={}, kind={}", peer_id, track.id(), track.ssrc(), kind);
                    let remote = Arc::new(RemoteTrack::new(track.id(), kind, peer_id.clone()));
                    TrackReceiver::spawn(track, receiver, remote.clone(), closed_sender.subscribe()).await;
                    let _ = events.send(PeerTransportEvent {
                        peer_id,
                        transport_id,
                        event: TransportEvent::Track(remote),
                    });
                }))
            }
        )));

        peer.on_signaling_state_change(Box::new(enc!((peer_id) move |state| {
            tracing::debug!("Signaling state for peer {} changed: {}", peer_id, state);
            Box::pin(async {})
        })));
    }

    async fn sender(&self, sender_id: &str) -> Result<(Arc<RTCRtpSender>, Arc<MediaTrack>), Error> {
        self.senders
            .lock()
            .await
            .get(sender_id)
            .cloned()
            .ok_or_else(|| {
                Error::new_negotiation(
                    format!("Sender {} is not found", sender_id),
                    NegotiationErrorKind::SenderNotFoundError,
                )
            })
    }
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn create_offer(&self) -> Result<RTCSessionDescription, Error> {
        Ok(self.peer_connection.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription, Error> {
        Ok(self.peer_connection.create_answer(None).await?)
    }

    async fn set_local_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), Error> {
        self.peer_connection
            .set_local_description(description)
            .await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), Error> {
        self.peer_connection
            .set_remote_description(description)
            .await?;
        Ok(())
    }

    async fn local_description(&self) -> Option<RTCSessionDescription> {
        self.peer_connection.local_description().await
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        self.peer_connection.add_ice_candidate(candidate).await?;
        Ok(())
    }

    fn signaling_state(&self) -> RTCSignalingState {
        self.peer_connection.signaling_state()
    }

    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<String, Error> {
        let sender = self
            .peer_connection
            .add_track(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        let sender_id = Uuid::new_v4().to_string();
        rtcp_reader_loop(sender.clone(), format!("peer {} sender {}", self.peer_id, sender_id));
        tracing::debug!(
            "RtcPeerTransport {} sends track {} as sender {}",
            self.id,
            track.id,
            sender_id
        );
        self.senders
            .lock()
            .await
            .insert(sender_id.clone(), (sender, track));
        Ok(sender_id)
    }

    async fn replace_track(&self, sender_id: &str, track: Arc<MediaTrack>) -> Result<(), Error> {
        let (sender, _previous) = self.sender(sender_id).await?;
        sender
            .replace_track(Some(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>))
            .await?;
        self.senders
            .lock()
            .await
            .insert(sender_id.to_string(), (sender, track));
        Ok(())
    }

    async fn remove_track(&self, sender_id: &str) -> Result<(), Error> {
        let (sender, _track) = self.sender(sender_id).await?;
        self.peer_connection.remove_track(&sender).await?;
        self.senders.lock().await.remove(sender_id);
        Ok(())
    }

    async fn set_max_bitrate(&self, sender_id: &str, bitrate: Option<u64>) -> Result<(), Error> {
        // Encoders read the ceiling from the track.
        let (_sender, track) = self.sender(sender_id).await?;
        track.set_max_bitrate(bitrate);
        tracing::debug!(
            "RtcPeerTransport {} caps sender {} at {:?}",
            self.id,
            sender_id,
            bitrate
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        let _ = self.closed_sender.send(true);
        self.peer_connection.close().await?;
        Ok(())
    }
}

impl Drop for RtcPeerTransport {
    fn drop(&mut self) {
        tracing::debug!("RtcPeerTransport {} is dropped", self.id);
    }
}

/// Creates [`RtcPeerTransport`]s that share one webrtc-rs API instance.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct RtcTransportFactory {
    #[derivative(Debug = "ignore")]
    api: Arc<API>,
    config: WebRTCTransportConfig,
}

impl RtcTransportFactory {
    pub fn new(config: WebRTCTransportConfig) -> Result<Self, Error> {
        Ok(Self {
            api: Arc::new(build_api()?),
            config,
        })
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        peer_id: &str,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, Error> {
        let transport = RtcPeerTransport::new(&self.api, &self.config, peer_id, events).await?;
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn transport(peer_id: &str) -> Arc<dyn PeerTransport> {
        let factory = RtcTransportFactory::new(WebRTCTransportConfig {
            ice_servers: vec![],
        })
        .unwrap();
        let (events, _events) = mpsc::unbounded_channel();
        factory.create(peer_id, events).await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_max_bitrate_lands_on_the_track() {
        let transport = transport("bob").await;
        let track = Arc::new(MediaTrack::new(MediaKind::Video, "camera", "local"));
        let sender_id = transport.add_track(track.clone()).await.unwrap();

        transport
            .set_max_bitrate(&sender_id, Some(1_500_000))
            .await
            .unwrap();
        assert_eq!(track.max_bitrate(), Some(1_500_000));
        transport.set_max_bitrate(&sender_id, None).await.unwrap();
        assert_eq!(track.max_bitrate(), None);

        let err = transport
            .set_max_bitrate("missing", Some(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::NegotiationError(ref e) if e.kind == NegotiationErrorKind::SenderNotFoundError
        ));
        transport.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_offer_is_refused_while_local_offer_is_pending() {
        let alice = transport("bob").await;
        let bob = transport("alice").await;
        for side in [&alice, &bob] {
            side.add_track(Arc::new(MediaTrack::new(MediaKind::Audio, "mic", "local")))
                .await
                .unwrap();
        }
        let alice_offer = alice.create_offer().await.unwrap();
        alice.set_local_description(alice_offer.clone()).await.unwrap();
        let bob_offer = bob.create_offer().await.unwrap();
        bob.set_local_description(bob_offer).await.unwrap();
        assert_eq!(bob.signaling_state(), RTCSignalingState::HaveLocalOffer);

        assert!(bob.set_remote_description(alice_offer).await.is_err());
        assert_eq!(bob.signaling_state(), RTCSignalingState::HaveLocalOffer);
        alice.close().await.unwrap();
        bob.close().await.unwrap();
    }
}
