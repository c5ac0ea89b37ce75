//! The mutually-authenticated peer channel.
//!
//! Composes the TLS layer (handshake against the zone root, peer identity
//! extraction, allow-list policy) with the AMQP engine into long-lived
//! channels: a [`server::PeerServer`] accepting inbound peers and a
//! [`client::PeerClient`] that maintains one outbound connection across an
//! ordered list of candidate addresses with exponential-backoff failover.

/// The failover client channel.
pub mod client;
/// The per-connection event loop bridging socket and engine.
mod connection;
/// Channel event types.
pub mod events;
/// The accepting server channel.
pub mod server;
/// TLS presets, credential loading, and identity verifiers.
pub mod tls;

#[cfg(test)]
mod integration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("a peer client needs at least one candidate address")]
    NoCandidateAddresses,
    #[error(transparent)]
    Tls(#[from] tls::TlsError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
