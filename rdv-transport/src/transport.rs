use crate::bus::{BusSubscription, SignalBus};
use crate::config::TransportConfig;
use crate::error::{HandshakeError, TransportError};
use crate::registry::{HandshakeIntent, HandshakeRegistry};
use crate::peer::{PeerConnection, PeerConnector};
use bytes::Bytes;
use parking_lot::Mutex;
use rdv_protocol::{HandshakeId, PeerId, SignalEnvelope};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Default state, not bound to an identity yet. Messages cannot be sent
    /// or received.
    Idle,
    /// Bound to an identity and subscribed on the bus. Outbound sends open
    /// handshakes and inbound handshakes surface payloads on the event
    /// stream.
    Listening,
    /// Terminal state after [`RtcTransport::stop`]. Every further send fails
    /// with [`TransportError::Closed`]; the transport cannot be restarted.
    Stopped,
}

/// Events emitted by the transport over its broadcast channel.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A payload received from a completed inbound handshake. Emitted exactly
    /// once per handshake.
    Inbound { payload: Bytes },
    /// A handshake failed and was torn down. Failures are contained to the
    /// one handshake; this event exists for observability only.
    HandshakeFailed {
        handshake_id: HandshakeId,
        remote: PeerId,
        error: HandshakeError,
    },
}

/// Resolution of one outbound send, detached from the `send` call itself.
///
/// `send` stays fire-and-forget: it returns before the handshake completes and
/// never reports handshake failures. The ticket is the explicit way to observe
/// the outcome; dropping it is fine and keeps best-effort semantics.
#[derive(Debug)]
pub struct DeliveryTicket {
    rx: oneshot::Receiver<Result<(), HandshakeError>>,
}

impl DeliveryTicket {
    /// Waits until the payload was handed to the established connection, or
    /// the handshake failed.
    pub async fn wait(self) -> Result<(), HandshakeError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(HandshakeError::ConnectionClosed),
        }
    }
}

/// The signaling-relay transport adapter.
///
/// Exposes a fleet of ephemeral peer connections, negotiated out-of-band over
/// a rendezvous bus, as one logical duplex message channel: every outbound
/// send opens its own handshake towards the target identity, and completed
/// inbound handshakes surface their payload on the event stream. Generic over
/// the bus and the peer-connection implementation.
pub struct RtcTransport<B: SignalBus, C: PeerConnector> {
    inner: Arc<TransportInner<B, C>>,
}

impl<B: SignalBus, C: PeerConnector> std::fmt::Debug for RtcTransport<B, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcTransport")
            .field("state", &self.state())
            .field("active_handshakes", &self.active_handshakes())
            .finish_non_exhaustive()
    }
}

struct TransportInner<B: SignalBus, C: PeerConnector> {
    bus: Arc<B>,
    connector: Arc<C>,
    config: TransportConfig,

    state_tx: watch::Sender<State>,
    state_rx: watch::Receiver<State>,

    events_tx: broadcast::Sender<TransportEvent>,

    registry: Mutex<Option<HandshakeRegistry<B, C>>>,
    router_task: Mutex<Option<JoinHandle<()>>>,

    shutdown: CancellationToken,
}

impl<B: SignalBus, C: PeerConnector> RtcTransport<B, C> {
    /// Creates a transport over the given bus and connector. The configuration
    /// is validated here; an invalid configuration prevents construction.
    #[instrument(level = "debug", skip_all, err)]
    pub fn new(
        bus: Arc<B>,
        connector: Arc<C>,
        config: TransportConfig,
        shutdown_token: CancellationToken,
    ) -> Result<Self, TransportError> {
        config.validate()?;

        let (state_tx, state_rx) = watch::channel(State::Idle);
        let (events_tx, _) = broadcast::channel(config.events_capacity);

        Ok(Self {
            inner: Arc::new(TransportInner {
                bus,
                connector,
                config,
                state_tx,
                state_rx,
                events_tx,
                registry: Mutex::new(None),
                router_task: Mutex::new(None),
                shutdown: shutdown_token,
            }),
        })
    }

    pub fn state(&self) -> State {
        *self.inner.state_rx.borrow()
    }

    /// Subscribes to a watch containing the current [`State`].
    pub fn subscribe_state(&self) -> watch::Receiver<State> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribes to the broadcast channel emitting [`TransportEvent`]s.
    /// Inbound payloads are only observed by subscriptions that exist when
    /// the handshake completes; re-subscribing restarts the stream from that
    /// point.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Number of handshakes currently tracked in the registry.
    pub fn active_handshakes(&self) -> usize {
        self.inner
            .registry
            .lock()
            .as_ref()
            .map_or(0, HandshakeRegistry::len)
    }

    /// Binds the transport to `identity`: subscribes on the bus under that
    /// identity and starts routing inbound signals. May be called at most
    /// once per instance; a second call fails fast.
    #[instrument(level = "debug", skip(self), err)]
    pub fn start(&self, identity: PeerId) -> Result<(), TransportError> {
        let mut claimed = false;
        self.inner.state_tx.send_if_modified(|state| {
            if *state == State::Idle {
                *state = State::Listening;
                claimed = true;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(match self.state() {
                State::Stopped => TransportError::Closed,
                _ => TransportError::AlreadyStarted,
            });
        }

        tracing::debug!("Subscribing on the signal bus");
        let subscription = match self.inner.bus.subscribe(&identity) {
            Ok(subscription) => subscription,
            Err(err) => {
                self.inner.state_tx.send_replace(State::Idle);
                return Err(err.into());
            }
        };

        let registry = HandshakeRegistry::new(
            Arc::clone(&self.inner.bus),
            Arc::clone(&self.inner.connector),
            identity,
            self.inner.config.clone(),
            self.inner.events_tx.clone(),
            self.inner.shutdown.child_token(),
        );
        *self.inner.registry.lock() = Some(registry.clone());

        let handle = tokio::spawn(
            Self::router_task(Arc::clone(&self.inner), registry, subscription)
                .instrument(tracing::Span::current()),
        );
        *self.inner.router_task.lock() = Some(handle);

        Ok(())
    }

    /// Opens an outbound handshake towards `target` and returns immediately.
    ///
    /// The payload is sent once the negotiated connection reports readiness;
    /// the connection is then closed after the configured linger delay.
    /// Handshake failures never surface here, only on the returned ticket and
    /// the event stream.
    #[instrument(level = "debug", skip(self, payload), err)]
    pub async fn send(
        &self,
        target: PeerId,
        payload: Bytes,
    ) -> Result<DeliveryTicket, TransportError> {
        match self.state() {
            State::Idle => return Err(TransportError::NotStarted),
            State::Stopped => return Err(TransportError::Closed),
            State::Listening => {}
        }

        let registry = self
            .inner
            .registry
            .lock()
            .clone()
            .ok_or(TransportError::NotStarted)?;

        let handshake_id = HandshakeId::generate();
        tracing::debug!(%handshake_id, "Opening outbound handshake");

        let (ticket_tx, ticket_rx) = oneshot::channel();
        registry
            .create(
                target,
                handshake_id,
                HandshakeIntent::Deliver {
                    payload,
                    ticket: Some(ticket_tx),
                },
            )
            .await?;

        Ok(DeliveryTicket { rx: ticket_rx })
    }

    /// Waits for the next inbound payload with a timeout.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn recv_with_timeout(&self, timeout: Duration) -> Result<Bytes, TransportError> {
        let mut events_rx = self.subscribe();

        match self.state() {
            State::Idle => return Err(TransportError::NotStarted),
            State::Stopped => return Err(TransportError::Closed),
            State::Listening => {}
        }

        let recv_result = tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => {
                tracing::debug!("Shutdown signal received, aborting receive");
                return Err(TransportError::Closed);
            }
            result = tokio::time::timeout(timeout, async {
                loop {
                    match events_rx.recv().await {
                        Ok(TransportEvent::Inbound { payload }) => return Ok(payload),
                        Ok(_) => continue,
                        Err(err) => return Err(err),
                    }
                }
            }) => result,
        };

        match recv_result {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                tracing::debug!("Timeout waiting for inbound payload");
                Err(TransportError::Timeout(
                    "Timeout waiting for inbound payload".to_string(),
                ))
            }
        }
    }

    /// Stops the transport: revokes the bus subscription and closes every
    /// live handshake. Safe to call multiple times; only the first call does
    /// any work. After `stop`, every `send` fails with
    /// [`TransportError::Closed`] and never touches the registry.
    #[instrument(level = "debug", skip(self))]
    pub async fn stop(&self) {
        let mut first = false;
        self.inner.state_tx.send_if_modified(|state| {
            if *state == State::Stopped {
                false
            } else {
                *state = State::Stopped;
                first = true;
                true
            }
        });
        if !first {
            tracing::trace!("Transport already stopped");
            return;
        }

        tracing::debug!("Stopping transport");
        self.inner.shutdown.cancel();

        let router_task = self.inner.router_task.lock().take();
        if let Some(handle) = router_task {
            if let Err(err) = handle.await
                && !err.is_cancelled()
            {
                tracing::warn!(?err, "Failed to join router task");
            }
        }

        let registry = self.inner.registry.lock().clone();
        if let Some(registry) = registry {
            registry.close_all().await;
        }

        tracing::debug!("Transport stopped");
    }

    /// Drains the bus subscription and routes every envelope. Dropping the
    /// subscription on exit revokes the bus registration.
    async fn router_task(
        inner: Arc<TransportInner<B, C>>,
        registry: HandshakeRegistry<B, C>,
        mut subscription: BusSubscription,
    ) {
        tracing::debug!("Starting signal router task");

        loop {
            tokio::select! {
                biased;

                _ = inner.shutdown.cancelled() => {
                    tracing::debug!("Shutdown signal received, exiting signal router task");
                    break;
                }

                envelope = subscription.recv() => match envelope {
                    Some(envelope) => Self::route(&registry, envelope).await,
                    None => {
                        tracing::warn!("Bus subscription ended, exiting signal router task");
                        break;
                    }
                }
            }
        }

        tracing::debug!("Signal router task finished");
    }

    /// Dispatches one inbound envelope: an unknown handshake id creates a
    /// responder handshake, a known one routes to the existing connection.
    /// Signals for one id are fed in arrival order to the same instance.
    async fn route(registry: &HandshakeRegistry<B, C>, envelope: SignalEnvelope) {
        let SignalEnvelope {
            sender,
            handshake_id,
            signal,
        } = envelope;
        tracing::trace!(%handshake_id, %sender, "Routing inbound signal");

        let handshake = match registry.lookup(&handshake_id) {
            Some(handshake) => handshake,
            None => match registry
                .create(sender, handshake_id, HandshakeIntent::Accept)
                .await
            {
                Ok(handshake) => handshake,
                Err(err) => {
                    tracing::warn!(%handshake_id, ?err, "Failed to create responder handshake");
                    return;
                }
            },
        };

        if let Err(err) = handshake.connection().apply_signal(signal).await {
            tracing::warn!(%handshake_id, ?err, "Failed to apply inbound signal");
        }
    }
}

impl<B: SignalBus, C: PeerConnector> Drop for RtcTransport<B, C> {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::test_utils::mock::{MockConnector, MockHub};
    use pretty_assertions::assert_matches;
    use test_log::test;

    fn transport() -> RtcTransport<MemoryBus, MockConnector> {
        transport_on(Arc::new(MemoryBus::new()), MockHub::new())
    }

    fn transport_on(bus: Arc<MemoryBus>, hub: Arc<MockHub>) -> RtcTransport<MemoryBus, MockConnector> {
        RtcTransport::new(
            bus,
            Arc::new(MockConnector::new(hub)),
            TransportConfig::default(),
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[test(tokio::test)]
    async fn new_rejects_invalid_config() {
        let config = TransportConfig {
            linger: Duration::ZERO,
            ..Default::default()
        };
        let result = RtcTransport::new(
            Arc::new(MemoryBus::new()),
            Arc::new(MockConnector::new(MockHub::new())),
            config,
            CancellationToken::new(),
        );
        assert_matches!(result, Err(TransportError::InvalidConfig(_)));
    }

    #[test(tokio::test)]
    async fn start_binds_identity_once() {
        let transport = transport();
        assert_matches!(transport.state(), State::Idle);

        transport.start(PeerId::from("node1")).unwrap();
        assert_matches!(transport.state(), State::Listening);

        let result = transport.start(PeerId::from("node1"));
        assert_matches!(result, Err(TransportError::AlreadyStarted));
    }

    #[test(tokio::test)]
    async fn send_without_start_fails() {
        let transport = transport();
        let result = transport
            .send(PeerId::from("node2"), Bytes::from_static(b"payload"))
            .await;
        assert_matches!(result, Err(TransportError::NotStarted));
    }

    #[test(tokio::test)]
    async fn send_after_stop_fails_without_touching_registry() {
        let transport = transport();
        transport.start(PeerId::from("node1")).unwrap();
        transport.stop().await;
        assert_matches!(transport.state(), State::Stopped);

        let result = transport
            .send(PeerId::from("node2"), Bytes::from_static(b"payload"))
            .await;
        assert_matches!(result, Err(TransportError::Closed));
        assert_eq!(transport.active_handshakes(), 0);
    }

    #[test(tokio::test)]
    async fn stop_is_idempotent() {
        let transport = transport();
        transport.start(PeerId::from("node1")).unwrap();

        transport.stop().await;
        transport.stop().await;
        transport.stop().await;
        assert_matches!(transport.state(), State::Stopped);
    }

    #[test(tokio::test)]
    async fn start_after_stop_fails() {
        let transport = transport();
        transport.start(PeerId::from("node1")).unwrap();
        transport.stop().await;

        let result = transport.start(PeerId::from("node1"));
        assert_matches!(result, Err(TransportError::Closed));
    }

    #[test(tokio::test)]
    async fn stop_revokes_bus_registration() {
        let bus = Arc::new(MemoryBus::new());
        let transport = transport_on(Arc::clone(&bus), MockHub::new());
        transport.start(PeerId::from("node1")).unwrap();
        transport.stop().await;

        let result = bus.publish(
            &PeerId::from("node1"),
            SignalEnvelope {
                sender: PeerId::from("node2"),
                handshake_id: HandshakeId::generate(),
                signal: serde_json::Value::Null,
            },
        );
        assert_matches!(result, Err(crate::error::BusError::UnknownPeer(_)));
    }

    #[test(tokio::test)]
    async fn recv_before_start_fails() {
        let transport = transport();
        let result = transport.recv_with_timeout(Duration::from_millis(10)).await;
        assert_matches!(result, Err(TransportError::NotStarted));
    }

    #[test(tokio::test)]
    async fn recv_times_out_without_inbound_payload() {
        let transport = transport();
        transport.start(PeerId::from("node1")).unwrap();

        let result = transport.recv_with_timeout(Duration::from_millis(10)).await;
        assert_matches!(result, Err(TransportError::Timeout(_)));
    }
}
