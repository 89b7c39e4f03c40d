use crate::error::PeerError;
use crate::peer::{PeerConnection, PeerConnector, PeerEvent, PeerRole};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

const MOCK_EVENTS_CAPACITY: usize = 32;

struct Link {
    outbound: mpsc::UnboundedSender<Bytes>,
    inbound: mpsc::UnboundedReceiver<Bytes>,
}

struct PendingLink {
    link_tx: oneshot::Sender<Link>,
}

/// Observable counters for one created mock peer, in creation order.
#[derive(Clone)]
pub struct MockPeerProbe {
    pub role: PeerRole,
    signals_applied: Arc<AtomicUsize>,
}

impl MockPeerProbe {
    pub fn signals_applied(&self) -> usize {
        self.signals_applied.load(Ordering::SeqCst)
    }
}

/// Shared rendezvous state linking initiator and responder mock peers, the
/// in-memory stand-in for the connection library's out-of-band machinery.
pub struct MockHub {
    next_endpoint: AtomicU64,
    pending: Mutex<HashMap<u64, PendingLink>>,
    probes: Mutex<Vec<MockPeerProbe>>,
}

impl MockHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_endpoint: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            probes: Mutex::new(Vec::new()),
        })
    }

    /// One probe per peer ever created through this hub.
    pub fn probes(&self) -> Vec<MockPeerProbe> {
        self.probes.lock().clone()
    }
}

/// Connector producing linked in-memory peers: a created initiator emits one
/// rendezvous signal; feeding that signal to a responder wires both ends
/// together, after which both report [`PeerEvent::Connected`] and payloads
/// sent on one side surface as [`PeerEvent::Data`] on the other.
pub struct MockConnector {
    hub: Arc<MockHub>,
    muted: bool,
}

impl MockConnector {
    pub fn new(hub: Arc<MockHub>) -> Self {
        Self { hub, muted: false }
    }

    /// Peers created by a muted connector never produce signals, so their
    /// handshakes can only run into the establishment timeout.
    pub fn muted(hub: Arc<MockHub>) -> Self {
        Self { hub, muted: true }
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    type Connection = MockPeer;

    async fn create(
        &self,
        role: PeerRole,
    ) -> Result<(MockPeer, broadcast::Receiver<PeerEvent>), PeerError> {
        let (events_tx, events_rx) = broadcast::channel(MOCK_EVENTS_CAPACITY);
        let peer = MockPeer {
            role,
            hub: Arc::clone(&self.hub),
            events_tx,
            outbound: Arc::new(Mutex::new(None)),
            closed: CancellationToken::new(),
            closed_flag: Arc::new(AtomicBool::new(false)),
            signals_applied: Arc::new(AtomicUsize::new(0)),
        };
        self.hub.probes.lock().push(MockPeerProbe {
            role,
            signals_applied: Arc::clone(&peer.signals_applied),
        });

        if role.is_initiator() && !self.muted {
            let endpoint = self.hub.next_endpoint.fetch_add(1, Ordering::Relaxed);
            let (link_tx, link_rx) = oneshot::channel();
            self.hub.pending.lock().insert(endpoint, PendingLink { link_tx });

            // Rendezvous offer; the responder completes the link on intake.
            let _ = peer.events_tx.send(PeerEvent::Signal(serde_json::json!({
                "type": "offer",
                "endpoint": endpoint,
            })));

            let outbound = Arc::clone(&peer.outbound);
            let events_tx = peer.events_tx.clone();
            let closed = peer.closed.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = closed.cancelled() => {}
                    link = link_rx => {
                        if let Ok(link) = link {
                            MockPeer::attach(&outbound, &events_tx, &closed, link);
                        }
                    }
                }
            });
        }

        Ok((peer, events_rx))
    }
}

/// In-memory [`PeerConnection`] used by unit and integration tests.
pub struct MockPeer {
    role: PeerRole,
    hub: Arc<MockHub>,
    events_tx: broadcast::Sender<PeerEvent>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<Bytes>>>>,
    closed: CancellationToken,
    closed_flag: Arc<AtomicBool>,
    signals_applied: Arc<AtomicUsize>,
}

impl MockPeer {
    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn signals_applied(&self) -> usize {
        self.signals_applied.load(Ordering::SeqCst)
    }

    /// Wires one side of a completed link: stores the outbound channel, pumps
    /// inbound payloads into the event stream, and reports readiness.
    fn attach(
        outbound: &Arc<Mutex<Option<mpsc::UnboundedSender<Bytes>>>>,
        events_tx: &broadcast::Sender<PeerEvent>,
        closed: &CancellationToken,
        link: Link,
    ) {
        *outbound.lock() = Some(link.outbound);

        let events = events_tx.clone();
        let closed = closed.clone();
        let mut inbound = link.inbound;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = closed.cancelled() => break,
                    payload = inbound.recv() => match payload {
                        Some(payload) => {
                            let _ = events.send(PeerEvent::Data(payload));
                        }
                        None => {
                            let _ = events.send(PeerEvent::Closed);
                            break;
                        }
                    }
                }
            }
        });

        let _ = events_tx.send(PeerEvent::Connected);
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn apply_signal(&self, signal: serde_json::Value) -> Result<(), PeerError> {
        self.signals_applied.fetch_add(1, Ordering::SeqCst);
        if self.closed_flag.load(Ordering::SeqCst) {
            return Ok(());
        }

        if signal.get("type").and_then(serde_json::Value::as_str) == Some("offer")
            && let Some(endpoint) = signal.get("endpoint").and_then(serde_json::Value::as_u64)
        {
            let pending = self.hub.pending.lock().remove(&endpoint);
            if let Some(PendingLink { link_tx }) = pending {
                let (initiator_tx, initiator_rx) = mpsc::unbounded_channel();
                let (responder_tx, responder_rx) = mpsc::unbounded_channel();
                Self::attach(
                    &self.outbound,
                    &self.events_tx,
                    &self.closed,
                    Link {
                        outbound: responder_tx,
                        inbound: initiator_rx,
                    },
                );
                let _ = link_tx.send(Link {
                    outbound: initiator_tx,
                    inbound: responder_rx,
                });
            }
            // A second offer for an already-consumed endpoint is tolerated,
            // like any other late signal.
        }
        Ok(())
    }

    async fn send(&self, payload: Bytes) -> Result<(), PeerError> {
        let outbound = self.outbound.lock().clone().ok_or(PeerError::Closed)?;
        outbound.send(payload).map_err(|_| PeerError::Closed)
    }

    async fn close(&self) {
        if self.closed_flag.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.cancel();
        self.outbound.lock().take();
        let _ = self.events_tx.send(PeerEvent::Closed);
    }
}
