//! Routed engine. Every participant keeps one send and one receive transport to a media router.

pub mod device;
pub mod engine;
pub mod registry;
pub(crate) mod requester;
/// [`webrtc::peer_connection::RTCPeerConnection`] binding of [`transport::RouterTransport`].
pub mod rtc_transport;
/// Remote SDP for router transports.
pub mod sdp;
pub mod transport;

pub use engine::RoutedEngine;
