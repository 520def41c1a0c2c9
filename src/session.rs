use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    audio_monitor::{activity_monitor, AudioActivityMonitor},
    config::{ActivityConfig, SessionConfig},
    engine::{ConnectParams, VoiceEngine},
    error::{Error, SessionErrorKind},
    event::{ConnectionState, SessionEventSender},
    mesh::MeshEngine,
    routed::RoutedEngine,
    signaling::client::SignalEndpoint,
    track::LocalStream,
    track_controller::{ScreenShareQuality, TrackController},
};

/// The application's handle on a call. Lifecycle calls go to one engine; the
/// local stream and the local activity monitor live here.
#[derive(Debug)]
pub struct VoiceSession {
    pub id: String,
    engine: Arc<dyn VoiceEngine>,
    controller: Mutex<TrackController>,
    connected_once: Mutex<bool>,
    local_monitor: Mutex<Option<AudioActivityMonitor>>,
    activity: ActivityConfig,
    events: SessionEventSender,
}

impl VoiceSession {
    pub fn new(engine: Arc<dyn VoiceEngine>, config: &SessionConfig, events: SessionEventSender) -> Self {
        let id = Uuid::new_v4().to_string();
        tracing::debug!("VoiceSession {} is created", id);
        Self {
            id,
            engine,
            controller: Mutex::new(TrackController::new(config.screen_share)),
            connected_once: Mutex::new(false),
            local_monitor: Mutex::new(None),
            activity: config.activity.clone(),
            events,
        }
    }

    /// Session on the peer-to-peer engine.
    pub fn mesh(
        endpoint: SignalEndpoint,
        config: SessionConfig,
        events: SessionEventSender,
    ) -> Result<Self, Error> {
        let engine = MeshEngine::with_webrtc(endpoint, config.clone(), events.clone())?;
        Ok(Self::new(Arc::new(engine), &config, events))
    }

    /// Session on the routed engine.
    pub fn routed(
        endpoint: SignalEndpoint,
        room_id: &str,
        peer_id: &str,
        config: SessionConfig,
        events: SessionEventSender,
    ) -> Result<Self, Error> {
        let engine =
            RoutedEngine::with_webrtc(endpoint, room_id, peer_id, config.clone(), events.clone())?;
        Ok(Self::new(Arc::new(engine), &config, events))
    }

    /// Adopts `stream` and joins. Resolves once the engine reports the session usable.
    pub async fn connect(
        &self,
        stream: Arc<LocalStream>,
        muted: bool,
        video_enabled: bool,
    ) -> Result<(), Error> {
        let params = {
            let mut controller = self.controller.lock().await;
            if let Some(previous) = controller.replace_stream(stream.clone()) {
                if !Arc::ptr_eq(&previous, &stream) {
                    previous.stop();
                }
            }
            controller.apply_local_state(muted, video_enabled);
            ConnectParams {
                stream: stream.clone(),
                state: controller.state(),
                quality: controller.quality(),
            }
        };
        *self.connected_once.lock().await = true;
        self.watch_local_audio(&stream).await;
        tracing::info!("VoiceSession {} connects, muted={} video={}", self.id, muted, video_enabled);
        self.engine.connect(params).await
    }

    /// Connects again with the stream and state of the last connect.
    pub async fn retry(&self) -> Result<(), Error> {
        let params = {
            let controller = self.controller.lock().await;
            let stream = match (*self.connected_once.lock().await, controller.stream()) {
                (true, Some(stream)) => stream,
                _ => {
                    return Err(Error::new_session(
                        format!("VoiceSession {} has never connected", self.id),
                        SessionErrorKind::NoPreviousConnectionError,
                    ))
                }
            };
            ConnectParams {
                stream,
                state: controller.state(),
                quality: controller.quality(),
            }
        };
        tracing::info!("VoiceSession {} retries", self.id);
        self.engine.connect(params).await
    }

    pub async fn set_muted(&self, muted: bool) {
        self.controller.lock().await.set_muted(muted);
        self.engine.set_muted(muted).await;
    }

    pub async fn set_deafened(&self, deafened: bool) {
        self.controller.lock().await.set_deafened(deafened);
        self.engine.set_deafened(deafened).await;
    }

    pub async fn set_video_enabled(&self, enabled: bool) {
        self.controller.lock().await.set_video_enabled(enabled);
        self.engine.set_video_enabled(enabled).await;
    }

    pub async fn set_screen_share_quality(&self, quality: ScreenShareQuality) {
        self.controller
            .lock()
            .await
            .set_screen_share_quality(quality);
        self.engine.set_screen_share_quality(quality).await;
    }

    /// Switches to `stream`. The old stream is stopped only after every sender moved over;
    /// on failure the old stream stays in place and keeps running.
    pub async fn replace_local_stream(&self, stream: Arc<LocalStream>) -> Result<(), Error> {
        let mut controller = self.controller.lock().await;
        let previous = controller.replace_stream(stream.clone());
        match self.engine.replace_local_stream(stream.clone()).await {
            Ok(()) => {
                drop(controller);
                if let Some(previous) = previous {
                    if !Arc::ptr_eq(&previous, &stream) {
                        previous.stop();
                    }
                }
                self.watch_local_audio(&stream).await;
                Ok(())
            }
            Err(err) => {
                tracing::warn!("VoiceSession {} failed to replace the local stream: {}", self.id, err);
                controller.restore_stream(previous.clone());
                if let Some(previous) = previous {
                    if let Err(err) = self.engine.replace_local_stream(previous).await {
                        tracing::error!(
                            "VoiceSession {} failed to restore the local stream: {}",
                            self.id,
                            err
                        );
                    }
                }
                Err(err)
            }
        }
    }

    /// Leaves the call and stops every local track.
    pub async fn destroy(&self) {
        self.engine.disconnect().await;
        if let Some(monitor) = self.local_monitor.lock().await.take() {
            monitor.stop();
        }
        if let Some(stream) = self.controller.lock().await.take_stream() {
            stream.stop();
        }
        *self.connected_once.lock().await = false;
        tracing::info!("VoiceSession {} is destroyed", self.id);
    }

    pub async fn local_stream(&self) -> Option<Arc<LocalStream>> {
        self.controller.lock().await.stream()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.engine.connection_state()
    }

    async fn watch_local_audio(&self, stream: &LocalStream) {
        let monitor = stream.audio_track().map(|track| {
            activity_monitor(None, track.pcm(), &self.activity, self.events.clone())
        });
        let mut local_monitor = self.local_monitor.lock().await;
        if let Some(previous) = local_monitor.take() {
            previous.stop();
        }
        *local_monitor = monitor;
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        tracing::debug!("VoiceSession {} is dropped", self.id);
    }
}
