use crate::bus::SignalBus;
use crate::config::TransportConfig;
use crate::error::{HandshakeError, TransportError};
use crate::handshake::{Handshake, HandshakeState};
use crate::peer::{PeerConnection, PeerConnector, PeerEvent, PeerRole};
use crate::transport::TransportEvent;
use bytes::Bytes;
use parking_lot::Mutex;
use rdv_protocol::{HandshakeId, PeerId, SignalEnvelope};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};

/// A deadline far enough in the future that it effectively never fires.
/// Mirrors `tokio::time::Instant::far_future`, which is crate-private.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}

/// What the adapter wants out of a handshake. The intent also fixes the role:
/// delivering a payload makes the connection the initiator, accepting an
/// inbound handshake makes it the responder.
pub(crate) enum HandshakeIntent {
    /// Send `payload` once the connection is up, resolve the ticket, then
    /// close after the linger delay.
    Deliver {
        payload: Bytes,
        ticket: Option<oneshot::Sender<Result<(), HandshakeError>>>,
    },
    /// Surface the first received payload as an inbound transport event and
    /// close immediately. Each handshake carries exactly one payload in one
    /// direction.
    Accept,
}

impl HandshakeIntent {
    fn role(&self) -> PeerRole {
        match self {
            Self::Deliver { .. } => PeerRole::Initiator,
            Self::Accept => PeerRole::Responder,
        }
    }
}

/// Owns every in-flight handshake of one adapter instance.
///
/// Creation wires signal forwarding to the bus and removal-on-close; entries
/// are removed the moment their connection dies, so the registry never grows
/// unboundedly for completed or abandoned handshakes.
pub struct HandshakeRegistry<B: SignalBus, C: PeerConnector> {
    inner: Arc<RegistryInner<B, C>>,
}

impl<B: SignalBus, C: PeerConnector> Clone for HandshakeRegistry<B, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct RegistryInner<B: SignalBus, C: PeerConnector> {
    bus: Arc<B>,
    connector: Arc<C>,
    identity: PeerId,
    config: TransportConfig,
    events_tx: broadcast::Sender<TransportEvent>,
    entries: Mutex<HashMap<HandshakeId, Arc<Handshake<C::Connection>>>>,
    cancel: CancellationToken,
}

impl<B: SignalBus, C: PeerConnector> HandshakeRegistry<B, C> {
    pub(crate) fn new(
        bus: Arc<B>,
        connector: Arc<C>,
        identity: PeerId,
        config: TransportConfig,
        events_tx: broadcast::Sender<TransportEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                bus,
                connector,
                identity,
                config,
                events_tx,
                entries: Mutex::new(HashMap::new()),
                cancel,
            }),
        }
    }

    /// Creates a handshake towards `remote` and registers it under `id`.
    ///
    /// A fresh connection is constructed with the role implied by the intent;
    /// every signal it produces is published to `remote` tagged with the local
    /// identity and `id`, and the entry is removed as soon as the connection
    /// closes. An id already present in the registry rejects the new handshake
    /// rather than overwriting the existing entry.
    #[instrument(level = "debug", skip(self, intent), fields(identity = %self.inner.identity), err)]
    pub(crate) async fn create(
        &self,
        remote: PeerId,
        id: HandshakeId,
        intent: HandshakeIntent,
    ) -> Result<Arc<Handshake<C::Connection>>, TransportError> {
        if self.inner.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if self.inner.entries.lock().contains_key(&id) {
            return Err(TransportError::HandshakeIdCollision(id));
        }

        let role = intent.role();
        tracing::debug!(?role, "Creating handshake");
        let (connection, events_rx) = self.inner.connector.create(role).await?;
        let handshake = Handshake::new(id, remote, role, connection);

        let inserted = {
            let mut entries = self.inner.entries.lock();
            if entries.contains_key(&id) {
                false
            } else {
                entries.insert(id, Arc::clone(&handshake));
                true
            }
        };
        if !inserted {
            handshake.connection().close().await;
            return Err(TransportError::HandshakeIdCollision(id));
        }

        tokio::spawn(
            Self::pump(Arc::clone(&self.inner), Arc::clone(&handshake), events_rx, intent)
                .instrument(tracing::Span::current()),
        );

        Ok(handshake)
    }

    pub(crate) fn lookup(&self, id: &HandshakeId) -> Option<Arc<Handshake<C::Connection>>> {
        self.inner.entries.lock().get(id).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Forcibly closes every live connection and clears the registry.
    /// Idempotent; called once at adapter shutdown.
    #[instrument(level = "debug", skip(self), fields(identity = %self.inner.identity))]
    pub(crate) async fn close_all(&self) {
        let handshakes: Vec<_> = {
            let mut entries = self.inner.entries.lock();
            entries.drain().map(|(_, handshake)| handshake).collect()
        };
        if handshakes.is_empty() {
            return;
        }

        tracing::debug!(count = handshakes.len(), "Closing all live handshakes");
        for handshake in handshakes {
            handshake.connection().close().await;
        }
    }

    /// Drives one handshake from creation to teardown: forwards produced
    /// signals to the bus, performs the role-specific delivery step, enforces
    /// the establishment timeout and the post-send linger delay, and removes
    /// the registry entry when the connection closes.
    async fn pump(
        inner: Arc<RegistryInner<B, C>>,
        handshake: Arc<Handshake<C::Connection>>,
        mut events_rx: broadcast::Receiver<PeerEvent>,
        mut intent: HandshakeIntent,
    ) {
        let mut establish_deadline = Instant::now() + inner.config.establish_timeout;
        let mut linger_deadline: Option<Instant> = None;

        let outcome = loop {
            tokio::select! {
                biased;

                _ = inner.cancel.cancelled() => {
                    tracing::debug!(id = %handshake.id(), "Shutdown signalled, closing handshake");
                    handshake.connection().close().await;
                    break Some(HandshakeError::ConnectionClosed);
                }

                _ = tokio::time::sleep_until(establish_deadline) => {
                    tracing::warn!(id = %handshake.id(), "Handshake was not established in time, closing");
                    handshake.connection().close().await;
                    break Some(HandshakeError::EstablishTimeout);
                }

                _ = tokio::time::sleep_until(linger_deadline.unwrap_or_else(far_future)) => {
                    tracing::trace!(id = %handshake.id(), "Linger delay elapsed, closing connection");
                    handshake.connection().close().await;
                    break None;
                }

                event = events_rx.recv() => match event {
                    Ok(PeerEvent::Signal(signal)) => {
                        handshake.advance(HandshakeState::Signaling);
                        let envelope = SignalEnvelope {
                            sender: inner.identity.clone(),
                            handshake_id: handshake.id(),
                            signal,
                        };
                        if let Err(err) = inner.bus.publish(handshake.remote(), envelope) {
                            tracing::warn!(id = %handshake.id(), ?err, "Failed to publish signal, closing handshake");
                            handshake.connection().close().await;
                            break Some(HandshakeError::Bus(err));
                        }
                    }
                    Ok(PeerEvent::Connected) => {
                        handshake.advance(HandshakeState::Connected);
                        establish_deadline = far_future();

                        if let HandshakeIntent::Deliver { payload, ticket } = &mut intent {
                            tracing::debug!(id = %handshake.id(), "Connection established, sending payload");
                            match handshake.connection().send(payload.clone()).await {
                                Ok(()) => {
                                    handshake.advance(HandshakeState::Delivered);
                                    if let Some(ticket) = ticket.take() {
                                        let _ = ticket.send(Ok(()));
                                    }
                                    linger_deadline = Some(Instant::now() + inner.config.linger);
                                }
                                Err(err) => {
                                    tracing::warn!(id = %handshake.id(), ?err, "Failed to send payload, closing handshake");
                                    handshake.connection().close().await;
                                    break Some(HandshakeError::Peer(err.to_string()));
                                }
                            }
                        }
                    }
                    Ok(PeerEvent::Data(payload)) => match &intent {
                        HandshakeIntent::Accept if handshake.state() < HandshakeState::Delivered => {
                            tracing::debug!(id = %handshake.id(), "Surfacing inbound payload");
                            handshake.advance(HandshakeState::Delivered);
                            if inner.events_tx.send(TransportEvent::Inbound { payload }).is_err() {
                                tracing::warn!(id = %handshake.id(), "No subscribers for inbound payload");
                            }
                            handshake.connection().close().await;
                            break None;
                        }
                        _ => {
                            tracing::trace!(id = %handshake.id(), "Ignoring payload on handshake");
                        }
                    },
                    Ok(PeerEvent::Closed) | Err(broadcast::error::RecvError::Closed) => {
                        tracing::trace!(id = %handshake.id(), "Connection closed");
                        if handshake.state() >= HandshakeState::Delivered {
                            break None;
                        }
                        break Some(HandshakeError::ConnectionClosed);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(id = %handshake.id(), skipped, "Peer event stream lagged");
                    }
                }
            }
        };

        Self::finish(&inner, &handshake, intent, outcome);
    }

    /// Tears down the bookkeeping for a finished handshake: removes the
    /// registry entry, resolves a still-pending delivery ticket, and reports
    /// the contained failure on the event stream.
    fn finish(
        inner: &RegistryInner<B, C>,
        handshake: &Handshake<C::Connection>,
        intent: HandshakeIntent,
        outcome: Option<HandshakeError>,
    ) {
        handshake.advance(HandshakeState::Closed);
        inner.entries.lock().remove(&handshake.id());

        if let HandshakeIntent::Deliver {
            ticket: Some(ticket),
            ..
        } = intent
        {
            let error = outcome.clone().unwrap_or(HandshakeError::ConnectionClosed);
            let _ = ticket.send(Err(error));
        }

        if let Some(error) = outcome {
            let _ = inner.events_tx.send(TransportEvent::HandshakeFailed {
                handshake_id: handshake.id(),
                remote: handshake.remote().clone(),
                error,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::test_utils::mock::{MockConnector, MockHub};
    use pretty_assertions::assert_matches;
    use test_log::test;

    fn registry() -> HandshakeRegistry<MemoryBus, MockConnector> {
        let (events_tx, _) = broadcast::channel(16);
        HandshakeRegistry::new(
            Arc::new(MemoryBus::new()),
            Arc::new(MockConnector::new(MockHub::new())),
            PeerId::from("local"),
            TransportConfig::default(),
            events_tx,
            CancellationToken::new(),
        )
    }

    #[test(tokio::test)]
    async fn create_registers_entry() {
        let registry = registry();
        let id = HandshakeId::generate();

        let handshake = registry
            .create(PeerId::from("remote"), id, HandshakeIntent::Accept)
            .await
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.lookup(&id).unwrap(), &handshake));
    }

    #[test(tokio::test)]
    async fn create_rejects_duplicate_id() {
        let registry = registry();
        let id = HandshakeId::generate();

        registry
            .create(PeerId::from("remote"), id, HandshakeIntent::Accept)
            .await
            .unwrap();
        let result = registry
            .create(PeerId::from("remote"), id, HandshakeIntent::Accept)
            .await;

        assert_matches!(result, Err(TransportError::HandshakeIdCollision(collided)) if collided == id);
        assert_eq!(registry.len(), 1);
    }

    #[test(tokio::test)]
    async fn close_all_clears_registry_and_is_idempotent() {
        let registry = registry();
        for _ in 0..3 {
            registry
                .create(
                    PeerId::from("remote"),
                    HandshakeId::generate(),
                    HandshakeIntent::Accept,
                )
                .await
                .unwrap();
        }
        assert_eq!(registry.len(), 3);

        registry.close_all().await;
        assert_eq!(registry.len(), 0);

        registry.close_all().await;
        assert_eq!(registry.len(), 0);
    }
}
