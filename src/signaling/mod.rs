/// Reconnecting signal channel.
pub mod client;
/// Room signaling messages.
pub mod message;
/// Router signaling messages.
pub mod router_message;
pub mod sdp_session;
/// WebSocket implementation of [`client::SignalConnector`].
pub mod websocket;
