use crate::peer::{PeerConnection, PeerRole};
use rdv_protocol::{HandshakeId, PeerId};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

/// Lifecycle of one negotiation attempt.
///
/// Transitions are monotonic; a handshake never moves backwards. Signals
/// arriving after the state has advanced are still fed to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandshakeState {
    /// Connection constructed, no signal exchanged yet.
    Created,
    /// At least one signal has been produced or consumed.
    Signaling,
    /// The peer connection reported readiness.
    Connected,
    /// The single payload of this handshake was sent (initiator) or surfaced
    /// inbound (responder).
    Delivered,
    /// Terminal. The registry entry is removed when this state is reached.
    Closed,
}

/// One negotiation attempt tracked by the registry.
pub struct Handshake<C> {
    id: HandshakeId,
    remote: PeerId,
    role: PeerRole,
    connection: Arc<C>,
    created_at: Instant,
    state_tx: watch::Sender<HandshakeState>,
}

impl<C: PeerConnection> Handshake<C> {
    pub(crate) fn new(id: HandshakeId, remote: PeerId, role: PeerRole, connection: C) -> Arc<Self> {
        let (state_tx, _) = watch::channel(HandshakeState::Created);
        Arc::new(Self {
            id,
            remote,
            role,
            connection: Arc::new(connection),
            created_at: Instant::now(),
            state_tx,
        })
    }

    pub fn id(&self) -> HandshakeId {
        self.id
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn state(&self) -> HandshakeState {
        *self.state_tx.borrow()
    }

    /// Subscribes to state transitions of this handshake.
    pub fn subscribe_state(&self) -> watch::Receiver<HandshakeState> {
        self.state_tx.subscribe()
    }

    /// Advances the state machine, ignoring transitions that would move
    /// backwards. Returns whether the state changed.
    pub(crate) fn advance(&self, next: HandshakeState) -> bool {
        self.state_tx.send_if_modified(|state| {
            if next > *state {
                tracing::trace!(id = %self.id, from = ?state, to = ?next, "Handshake state advanced");
                *state = next;
                true
            } else {
                false
            }
        })
    }
}

impl<C> std::fmt::Debug for Handshake<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("role", &self.role)
            .field("state", &*self.state_tx.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock::{MockConnector, MockHub};
    use crate::peer::PeerConnector;
    use pretty_assertions::assert_eq;
    use test_log::test;

    async fn handshake() -> Arc<Handshake<crate::test_utils::mock::MockPeer>> {
        let connector = MockConnector::new(MockHub::new());
        let (connection, _events_rx) = connector.create(PeerRole::Initiator).await.unwrap();
        Handshake::new(
            HandshakeId::generate(),
            PeerId::from("remote"),
            PeerRole::Initiator,
            connection,
        )
    }

    #[test(tokio::test)]
    async fn starts_in_created_state() {
        let handshake = handshake().await;
        assert_eq!(handshake.state(), HandshakeState::Created);
        assert!(handshake.role().is_initiator());
    }

    #[test(tokio::test)]
    async fn advances_monotonically() {
        let handshake = handshake().await;

        assert!(handshake.advance(HandshakeState::Signaling));
        assert!(handshake.advance(HandshakeState::Connected));
        assert_eq!(handshake.state(), HandshakeState::Connected);

        // Late transitions backwards are ignored.
        assert!(!handshake.advance(HandshakeState::Signaling));
        assert_eq!(handshake.state(), HandshakeState::Connected);

        assert!(handshake.advance(HandshakeState::Closed));
        assert!(!handshake.advance(HandshakeState::Delivered));
        assert_eq!(handshake.state(), HandshakeState::Closed);
    }

    #[test(tokio::test)]
    async fn state_subscription_observes_transitions() {
        let handshake = handshake().await;
        let mut state_rx = handshake.subscribe_state();

        handshake.advance(HandshakeState::Connected);
        state_rx.changed().await.unwrap();
        assert_eq!(*state_rx.borrow(), HandshakeState::Connected);
    }
}
