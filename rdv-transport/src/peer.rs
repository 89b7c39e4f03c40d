use crate::error::PeerError;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

/// Which side of the negotiation this connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// The side that opens the handshake and sends the payload.
    Initiator,
    /// The side created in response to an inbound signal; it surfaces the
    /// first received payload and tears the connection down.
    Responder,
}

impl PeerRole {
    pub fn is_initiator(self) -> bool {
        matches!(self, Self::Initiator)
    }
}

/// Events emitted by a peer connection over its broadcast channel.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Connection-setup metadata produced locally, to be relayed to the
    /// remote side of the handshake.
    Signal(serde_json::Value),
    /// Payload received from the remote side.
    Data(Bytes),
    /// The connection is established and ready to transfer payloads.
    Connected,
    /// The connection is gone, whether closed locally, remotely, or by error.
    /// Emitted at most once; no further events follow.
    Closed,
}

/// One direct, ephemeral connection to a remote participant.
///
/// Implementations must make `close` idempotent and emit [`PeerEvent::Closed`]
/// exactly once, no matter how the connection ends.
#[async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    /// Feeds connection-setup metadata received from the remote side.
    /// Signals arriving after the connection has advanced past negotiation
    /// must be tolerated, not treated as fatal.
    async fn apply_signal(&self, signal: serde_json::Value) -> Result<(), PeerError>;

    /// Sends a payload over the established connection.
    async fn send(&self, payload: Bytes) -> Result<(), PeerError>;

    /// Closes the connection. Idempotent.
    async fn close(&self);
}

/// Factory for peer connections, one per handshake.
#[async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    type Connection: PeerConnection;

    /// Creates a fresh connection for the given role, returning it together
    /// with the receiver of its event stream. The receiver is created before
    /// any event can be emitted, so callers never miss the first signal.
    async fn create(
        &self,
        role: PeerRole,
    ) -> Result<(Self::Connection, broadcast::Receiver<PeerEvent>), PeerError>;
}
