use crate::error::BusError;
use parking_lot::Mutex;
use rdv_protocol::{PeerId, SignalEnvelope};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::instrument;

/// Addressable publish/subscribe rendezvous bus.
///
/// Participants subscribe under their own identity and publish envelopes to a
/// remote identity. Delivery is at-least-once with per-key ordering; both are
/// properties of the bus implementation, not enforced here.
pub trait SignalBus: Send + Sync + 'static {
    /// Registers the given identity and returns a handle yielding every
    /// envelope published to it. The registration is revoked when the handle
    /// is dropped.
    fn subscribe(&self, identity: &PeerId) -> Result<BusSubscription, BusError>;

    /// Publishes an envelope to the subscriber registered under `target`.
    fn publish(&self, target: &PeerId, envelope: SignalEnvelope) -> Result<(), BusError>;
}

/// Active registration on a [`SignalBus`]. Dropping the subscription revokes
/// the registration.
pub struct BusSubscription {
    rx: mpsc::UnboundedReceiver<SignalEnvelope>,
    unregister: Option<Box<dyn FnOnce() + Send>>,
}

impl BusSubscription {
    pub fn new(
        rx: mpsc::UnboundedReceiver<SignalEnvelope>,
        unregister: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            rx,
            unregister: Some(Box::new(unregister)),
        }
    }

    /// Receives the next envelope, or `None` once the bus side is gone.
    pub async fn recv(&mut self) -> Option<SignalEnvelope> {
        self.rx.recv().await
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        if let Some(unregister) = self.unregister.take() {
            unregister();
        }
    }
}

struct Route {
    token: u64,
    tx: mpsc::UnboundedSender<SignalEnvelope>,
}

/// In-process [`SignalBus`] connecting every adapter registered on the same
/// instance. Used by tests and single-process deployments; a remote relay
/// plugs in through the same trait.
#[derive(Default, Clone)]
pub struct MemoryBus {
    routes: Arc<Mutex<HashMap<PeerId, Route>>>,
    next_token: Arc<AtomicU64>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SignalBus for MemoryBus {
    #[instrument(level = "debug", skip(self))]
    fn subscribe(&self, identity: &PeerId) -> Result<BusSubscription, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        let previous = self
            .routes
            .lock()
            .insert(identity.clone(), Route { token, tx });
        if previous.is_some() {
            tracing::debug!(%identity, "Replacing stale bus registration");
        }

        let routes = Arc::clone(&self.routes);
        let identity = identity.clone();
        Ok(BusSubscription::new(rx, move || {
            let mut routes = routes.lock();
            // A newer subscription under the same identity keeps its route.
            if routes.get(&identity).is_some_and(|route| route.token == token) {
                routes.remove(&identity);
            }
        }))
    }

    #[instrument(level = "trace", skip(self, envelope), err)]
    fn publish(&self, target: &PeerId, envelope: SignalEnvelope) -> Result<(), BusError> {
        let routes = self.routes.lock();
        let route = routes
            .get(target)
            .ok_or_else(|| BusError::UnknownPeer(target.clone()))?;
        route.tx.send(envelope).map_err(|_| BusError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::{assert_eq, assert_matches};
    use rdv_protocol::HandshakeId;
    use test_log::test;

    fn envelope(sender: &str, signal: serde_json::Value) -> SignalEnvelope {
        SignalEnvelope {
            sender: PeerId::from(sender),
            handshake_id: HandshakeId::generate(),
            signal,
        }
    }

    #[test(tokio::test)]
    async fn publish_reaches_subscriber() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe(&PeerId::from("a")).unwrap();

        let sent = envelope("b", serde_json::json!("hello"));
        bus.publish(&PeerId::from("a"), sent.clone()).unwrap();

        assert_eq!(sub.recv().await, Some(sent));
    }

    #[test(tokio::test)]
    async fn publish_preserves_per_key_order() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe(&PeerId::from("a")).unwrap();

        for i in 0..10 {
            bus.publish(&PeerId::from("a"), envelope("b", serde_json::json!(i)))
                .unwrap();
        }

        for i in 0..10 {
            let received = sub.recv().await.unwrap();
            assert_eq!(received.signal, serde_json::json!(i));
        }
    }

    #[test(tokio::test)]
    async fn publish_to_unknown_peer_fails() {
        let bus = MemoryBus::new();
        let result = bus.publish(&PeerId::from("nobody"), envelope("b", serde_json::Value::Null));
        assert_matches!(result, Err(BusError::UnknownPeer(peer)) if peer.as_str() == "nobody");
    }

    #[test(tokio::test)]
    async fn dropping_subscription_revokes_registration() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe(&PeerId::from("a")).unwrap();
        drop(sub);

        let result = bus.publish(&PeerId::from("a"), envelope("b", serde_json::Value::Null));
        assert_matches!(result, Err(BusError::UnknownPeer(_)));
    }

    #[test(tokio::test)]
    async fn resubscribing_replaces_previous_registration() {
        let bus = MemoryBus::new();
        let stale = bus.subscribe(&PeerId::from("a")).unwrap();
        let mut fresh = bus.subscribe(&PeerId::from("a")).unwrap();

        // Dropping the stale handle must not tear down the fresh route.
        drop(stale);

        let sent = envelope("b", serde_json::json!("still routed"));
        bus.publish(&PeerId::from("a"), sent.clone()).unwrap();
        assert_eq!(fresh.recv().await, Some(sent));
    }
}
