use crate::bus::MemoryBus;
use crate::config::TransportConfig;
use crate::test_utils::mock::{MockConnector, MockHub};
use crate::transport::{RtcTransport, TransportEvent};
use bytes::Bytes;
use rdv_protocol::PeerId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// One started transport in a [`TestRig`].
pub struct TestNode {
    pub identity: PeerId,
    pub transport: Arc<RtcTransport<MemoryBus, MockConnector>>,
    pub events_rx: broadcast::Receiver<TransportEvent>,
}

impl TestNode {
    /// Waits for the next inbound payload delivered to this node.
    pub async fn recv_inbound(&mut self, timeout: Duration) -> Option<Bytes> {
        loop {
            match tokio::time::timeout(timeout, self.events_rx.recv()).await {
                Ok(Ok(TransportEvent::Inbound { payload })) => return Some(payload),
                Ok(Ok(_)) => continue,
                _ => return None,
            }
        }
    }
}

/// N started transports sharing one in-memory bus and one mock hub,
/// addressable as `node0`, `node1`, ...
pub struct TestRig {
    bus: Arc<MemoryBus>,
    hub: Arc<MockHub>,
    nodes: Vec<TestNode>,
    shutdown_token: CancellationToken,
}

impl TestRig {
    pub fn new(num_nodes: usize) -> anyhow::Result<Self> {
        Self::with_config(num_nodes, TransportConfig::default())
    }

    pub fn with_config(num_nodes: usize, config: TransportConfig) -> anyhow::Result<Self> {
        let bus = Arc::new(MemoryBus::new());
        let hub = MockHub::new();
        let shutdown_token = CancellationToken::new();

        let mut nodes = Vec::with_capacity(num_nodes);
        for i in 0..num_nodes {
            let identity = PeerId::new(format!("node{i}"));
            let transport = RtcTransport::new(
                Arc::clone(&bus),
                Arc::new(MockConnector::new(Arc::clone(&hub))),
                config.clone(),
                shutdown_token.child_token(),
            )?;
            let events_rx = transport.subscribe();
            transport.start(identity.clone())?;

            nodes.push(TestNode {
                identity,
                transport: Arc::new(transport),
                events_rx,
            });
        }

        Ok(Self {
            bus,
            hub,
            nodes,
            shutdown_token,
        })
    }

    pub fn bus(&self) -> &Arc<MemoryBus> {
        &self.bus
    }

    pub fn hub(&self) -> &Arc<MockHub> {
        &self.hub
    }

    pub fn node(&self, index: usize) -> &TestNode {
        assert!(
            index < self.nodes.len(),
            "Node index {index} out of bounds",
        );
        &self.nodes[index]
    }

    pub fn node_mut(&mut self, index: usize) -> &mut TestNode {
        assert!(
            index < self.nodes.len(),
            "Node index {index} out of bounds",
        );
        &mut self.nodes[index]
    }

    pub fn nodes_mut(&mut self) -> &mut [TestNode] {
        &mut self.nodes
    }

    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }
}

impl Drop for TestRig {
    fn drop(&mut self) {
        self.shutdown();
    }
}
