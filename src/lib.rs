#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Voicemesh
//! Voicemesh is a real-time voice and video session library built on webrtc-rs. A [`session::VoiceSession`] joins a room through one of two engines:
//! - [`mesh::MeshEngine`] connects every participant to every other one and negotiates with perfect negotiation.
//! - [`routed::RoutedEngine`] sends and receives through a media router over one send and one receive transport.
//!
//! Both engines report what happens in the room as [`event::SessionEvent`] values on a channel owned by the application.

/// Speaking detection for local and remote audio.
pub mod audio_monitor;
/// Configuration for [`session::VoiceSession`] and both engines.
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod mesh;
/// [`webrtc::peer_connection::RTCPeerConnection`] binding of [`transport::PeerTransport`].
pub mod peer_transport;
pub(crate) mod receiver;
/// Inbound media of remote participants.
pub mod remote_stream;
pub mod routed;
pub mod session;
pub mod signaling;
/// Local capture tracks.
pub mod track;
pub mod track_controller;
pub mod transport;

#[cfg(test)]
mod testing;
