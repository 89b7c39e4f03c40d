use rdv_protocol::{HandshakeId, PeerId};
use thiserror::Error;

/// Adapter-level errors, surfaced to the caller immediately.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("transport not started")]
    NotStarted,
    #[error("transport already started")]
    AlreadyStarted,
    #[error("transport closed")]
    Closed,
    #[error("handshake id collision: {0}")]
    HandshakeIdCollision(HandshakeId),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("peer connection error: {0}")]
    Peer(#[from] PeerError),
    #[error("timeout: {0}")]
    Timeout(String),
}

/// Per-handshake failures. These are contained: one failed handshake degrades
/// to closure of that handshake only and is reported through its
/// [`DeliveryTicket`](crate::transport::DeliveryTicket) and the event stream,
/// never as a failure of the adapter itself.
#[derive(Debug, Clone, Error)]
pub enum HandshakeError {
    #[error("handshake was not established in time")]
    EstablishTimeout,
    #[error("connection closed before the payload was delivered")]
    ConnectionClosed,
    #[error("peer connection error: {0}")]
    Peer(String),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

/// Errors reported by a signal bus implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("no subscriber registered for peer {0}")]
    UnknownPeer(PeerId),
    #[error("bus channel closed")]
    Closed,
}

/// Errors reported by a peer connection facade implementation.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer connection closed")]
    Closed,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
