//! Peer-to-peer engine. Every participant holds one transport per remote participant.

pub mod engine;
/// Offer collision rules.
pub mod negotiation;
pub(crate) mod peer;

pub use engine::MeshEngine;
