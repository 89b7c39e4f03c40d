use bytes::Bytes;
use pretty_assertions::assert_eq;
use rdv_protocol::PeerId;
use rdv_transport::{
    MemoryBus, PeerConnection, PeerConnector, PeerEvent, PeerRole, RtcTransport, TransportConfig,
};
use rdv_webrtc::{IceConfig, RtcConnector, RtcPeer};
use std::sync::Arc;
use std::time::Duration;
use test_log::test;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Forwards signals to the remote peer and reports connectivity and data.
fn pump(
    mut events: broadcast::Receiver<PeerEvent>,
    remote: Arc<RtcPeer>,
    connected_tx: mpsc::Sender<()>,
    data_tx: mpsc::Sender<Bytes>,
) {
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PeerEvent::Signal(signal) => {
                    if let Err(err) = remote.apply_signal(signal).await {
                        tracing::warn!(?err, "Failed to apply signal");
                    }
                }
                PeerEvent::Connected => {
                    let _ = connected_tx.send(()).await;
                }
                PeerEvent::Data(payload) => {
                    let _ = data_tx.send(payload).await;
                }
                PeerEvent::Closed => break,
            }
        }
    });
}

#[test(tokio::test(flavor = "multi_thread"))]
async fn data_channel_round_trip() {
    let connector = RtcConnector::new(IceConfig::default());

    let (initiator, initiator_events) = connector.create(PeerRole::Initiator).await.unwrap();
    let (responder, responder_events) = connector.create(PeerRole::Responder).await.unwrap();
    let initiator = Arc::new(initiator);
    let responder = Arc::new(responder);

    let (connected_tx, mut connected_rx) = mpsc::channel(4);
    let (initiator_data_tx, mut initiator_data_rx) = mpsc::channel(4);
    let (responder_data_tx, mut responder_data_rx) = mpsc::channel(4);

    pump(
        initiator_events,
        Arc::clone(&responder),
        connected_tx.clone(),
        initiator_data_tx,
    );
    pump(
        responder_events,
        Arc::clone(&initiator),
        connected_tx,
        responder_data_tx,
    );

    // Both sides must report an open data channel.
    for _ in 0..2 {
        tokio::time::timeout(NEGOTIATION_TIMEOUT, connected_rx.recv())
            .await
            .expect("Timed out waiting for connection")
            .expect("Connected channel closed");
    }

    initiator.send(Bytes::from_static(b"ping")).await.unwrap();
    let received = tokio::time::timeout(NEGOTIATION_TIMEOUT, responder_data_rx.recv())
        .await
        .expect("Timed out waiting for payload")
        .expect("Data channel closed");
    assert_eq!(received, Bytes::from_static(b"ping"));

    responder.send(Bytes::from_static(b"pong")).await.unwrap();
    let received = tokio::time::timeout(NEGOTIATION_TIMEOUT, initiator_data_rx.recv())
        .await
        .expect("Timed out waiting for payload")
        .expect("Data channel closed");
    assert_eq!(received, Bytes::from_static(b"pong"));

    initiator.close().await;
    responder.close().await;
}

#[test(tokio::test(flavor = "multi_thread"))]
async fn transport_end_to_end_over_webrtc() {
    let bus = Arc::new(MemoryBus::new());
    let shutdown_token = CancellationToken::new();

    let node_a = RtcTransport::new(
        Arc::clone(&bus),
        Arc::new(RtcConnector::new(IceConfig::default())),
        TransportConfig::default(),
        shutdown_token.child_token(),
    )
    .unwrap();
    let node_b = RtcTransport::new(
        Arc::clone(&bus),
        Arc::new(RtcConnector::new(IceConfig::default())),
        TransportConfig::default(),
        shutdown_token.child_token(),
    )
    .unwrap();

    node_a.start(PeerId::from("a")).unwrap();
    node_b.start(PeerId::from("b")).unwrap();

    let ticket = node_a
        .send(PeerId::from("b"), Bytes::from_static(b"hello over webrtc"))
        .await
        .unwrap();

    let payload = node_b.recv_with_timeout(NEGOTIATION_TIMEOUT).await.unwrap();
    assert_eq!(payload, Bytes::from_static(b"hello over webrtc"));
    ticket.wait().await.unwrap();

    node_a.stop().await;
    node_b.stop().await;
}
