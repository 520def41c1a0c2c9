use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;

use crate::{
    error::Error,
    event::ConnectionState,
    track::LocalStream,
    track_controller::{LocalMediaState, ScreenShareQuality},
};

/// What an engine needs to bring a session up.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub stream: Arc<LocalStream>,
    pub state: LocalMediaState,
    pub quality: ScreenShareQuality,
}

/// Contract shared by the mesh and routed engines.
#[async_trait]
pub trait VoiceEngine: Send + Sync + Debug {
    /// Resolves once the session is usable. A new call supersedes any attempt in flight.
    async fn connect(&self, params: ConnectParams) -> Result<(), Error>;
    async fn disconnect(&self);
    async fn set_muted(&self, muted: bool);
    async fn set_deafened(&self, deafened: bool);
    async fn set_video_enabled(&self, enabled: bool);
    async fn set_screen_share_quality(&self, quality: ScreenShareQuality);
    /// Switches every outbound sender to the tracks of `stream`. The old stream is left running.
    async fn replace_local_stream(&self, stream: Arc<LocalStream>) -> Result<(), Error>;
    fn connection_state(&self) -> ConnectionState;
}
