use std::sync::Arc;

use tokio::sync::broadcast;
use webrtc::{
    rtp_transceiver::rtp_receiver::RTCRtpReceiver, track::track_remote::TrackRemote,
};

use crate::{remote_stream::RemoteTrack, track::MediaKind};

pub(crate) const AUDIO_LEVEL_URI: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";
/// 20ms of 48kHz audio, the usual opus frame.
const LEVEL_BLOCK_LEN: usize = 960;

/// Reads RTP from a webrtc remote track and feeds the counters and audio level of a [`RemoteTrack`].
#[derive(Debug)]
pub(crate) struct TrackReceiver;

impl TrackReceiver {
    pub(crate) async fn spawn(
        track: Arc<TrackRemote>,
        receiver: Arc<RTCRtpReceiver>,
        remote: Arc<RemoteTrack>,
        closed: broadcast::Receiver<bool>,
    ) {
        let audio_level_id = if remote.kind == MediaKind::Audio {
            receiver
                .get_parameters()
                .await
                .header_extensions
                .iter()
                .find(|ext| ext.uri == AUDIO_LEVEL_URI)
                .map(|ext| ext.id as u8)
        } else {
            None
        };
        remote.attach_source(track.clone());

        tokio::spawn(async move {
            Self::rtp_event_loop(track, remote, audio_level_id, closed).await;
        });
    }

    async fn rtp_event_loop(
        track: Arc<TrackRemote>,
        remote: Arc<RemoteTrack>,
        audio_level_id: Option<u8>,
        mut closed: broadcast::Receiver<bool>,
    ) {
        let ssrc = track.ssrc();
        tracing::debug!(
            "RemoteTrack id={} ssrc={} RTP event loop has started, mime_type={}, audio_level_id={:?}",
            remote.id,
            ssrc,
            track.codec().capability.mime_type,
            audio_level_id
        );

        loop {
            tokio::select! {
                _closed = closed.recv() => {
                    break;
                }
                res = track.read_rtp() => {
                    match res {
                        Ok((rtp, _attr)) => {
                            remote.stats().record(rtp.header.sequence_number, rtp.payload.len());
                            if let Some(id) = audio_level_id {
                                if let Some(level) = rtp.header.get_extension(id).and_then(|ext| parse_audio_level(&ext)) {
                                    remote.pcm().push_level(level, LEVEL_BLOCK_LEN);
                                }
                            }
                        }
                        Err(webrtc::error::Error::ErrDataChannelNotOpen) => {
                            break;
                        }
                        Err(webrtc::error::Error::ErrClosedPipe) => {
                            break;
                        }
                        Err(webrtc::error::Error::Interceptor(webrtc::interceptor::Error::Srtp(webrtc_srtp::Error::Util(webrtc_util::Error::ErrBufferClosed)))) => {
                            break;
                        }
                        Err(err) => {
                            tracing::error!("RemoteTrack id={} ssrc={} failed to read rtp: {:#?}", remote.id, ssrc, err);
                            break;
                        }
                    }
                }
            }
        }

        tracing::debug!(
            "RemoteTrack id={} ssrc={} RTP event loop has finished",
            remote.id,
            ssrc
        );
    }
}

/// RFC 6464 one byte payload: voice activity bit followed by the level in -dBov.
pub(crate) fn parse_audio_level(ext: &[u8]) -> Option<u8> {
    ext.first().map(|b| b & 0x7f)
}
