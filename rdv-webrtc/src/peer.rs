use crate::config::{DATA_CHANNEL_LABEL, IceConfig, IntoRtc, PEER_EVENTS_CAPACITY};
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rdv_transport::{PeerConnection, PeerConnector, PeerError, PeerEvent, PeerRole};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::instrument;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// [`PeerConnector`] producing WebRTC data-channel connections.
#[derive(Debug, Clone, Default)]
pub struct RtcConnector {
    ice: IceConfig,
}

impl RtcConnector {
    pub fn new(ice: IceConfig) -> Self {
        Self { ice }
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    type Connection = RtcPeer;

    async fn create(
        &self,
        role: PeerRole,
    ) -> Result<(RtcPeer, broadcast::Receiver<PeerEvent>), PeerError> {
        let (peer, events_rx) = RtcPeer::new(self.ice.clone(), role).await?;
        Ok((peer, events_rx))
    }
}

/// One ephemeral WebRTC connection carrying a single data channel.
///
/// The initiator creates the channel and emits an SDP offer as its first
/// signal; the responder answers on intake. ICE candidates trickle as further
/// signals. The connection reports readiness once the data channel opens.
pub struct RtcPeer {
    role: PeerRole,
    peer_connection: RTCPeerConnection,
    data_channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    events_tx: broadcast::Sender<PeerEvent>,
    closed: Arc<AtomicBool>,
}

impl RtcPeer {
    #[instrument(level = "debug", skip(ice), err)]
    pub async fn new(
        ice: IceConfig,
        role: PeerRole,
    ) -> Result<(Self, broadcast::Receiver<PeerEvent>), PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("Failed to register default codecs")?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .context("Failed to register default interceptors")?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = api
            .new_peer_connection(ice.into_rtc())
            .await
            .context("Failed to create peer connection")?;

        let (events_tx, events_rx) = broadcast::channel(PEER_EVENTS_CAPACITY);
        let data_channel = Arc::new(Mutex::new(None));
        let closed = Arc::new(AtomicBool::new(false));

        {
            let events_tx = events_tx.clone();
            let closed = Arc::clone(&closed);
            peer_connection.on_peer_connection_state_change(Box::new(
                move |state: RTCPeerConnectionState| {
                    tracing::trace!(?state, "Peer connection state changed");
                    if matches!(
                        state,
                        RTCPeerConnectionState::Closed
                            | RTCPeerConnectionState::Failed
                            | RTCPeerConnectionState::Disconnected
                    ) {
                        Self::emit_closed(&events_tx, &closed);
                    }
                    Box::pin(async {})
                },
            ));
        }

        {
            let events_tx = events_tx.clone();
            peer_connection.on_ice_candidate(Box::new(
                move |candidate: Option<RTCIceCandidate>| {
                    if let Some(candidate) = candidate {
                        tracing::trace!(?candidate, "Produced ICE candidate");
                        match candidate.to_json() {
                            Ok(init) => match serde_json::to_value(&init) {
                                Ok(init) => {
                                    let signal = serde_json::json!({ "candidate": init });
                                    if events_tx.send(PeerEvent::Signal(signal)).is_err() {
                                        tracing::warn!("Failed to emit ICE candidate signal");
                                    }
                                }
                                Err(err) => {
                                    tracing::warn!(?err, "Failed to serialize ICE candidate");
                                }
                            },
                            Err(err) => {
                                tracing::warn!(?err, "Failed to serialize ICE candidate");
                            }
                        }
                    }
                    Box::pin(async {})
                },
            ));
        }

        match role {
            PeerRole::Initiator => {
                let channel = peer_connection
                    .create_data_channel(DATA_CHANNEL_LABEL, None)
                    .await
                    .context("Failed to create data channel")?;
                Self::wire_data_channel(channel, &data_channel, &events_tx, &closed);

                let offer = peer_connection
                    .create_offer(None)
                    .await
                    .context("Failed to create offer")?;
                peer_connection
                    .set_local_description(offer)
                    .await
                    .context("Failed to set offer as local description")?;
                let local_description = peer_connection
                    .local_description()
                    .await
                    .context("Failed to get local description")?;

                let signal = serde_json::to_value(&local_description)
                    .context("Failed to serialize local description")?;
                if events_tx.send(PeerEvent::Signal(signal)).is_err() {
                    tracing::warn!("Failed to emit offer signal");
                }
            }
            PeerRole::Responder => {
                let data_channel = Arc::clone(&data_channel);
                let events_tx = events_tx.clone();
                let closed = Arc::clone(&closed);
                peer_connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                    tracing::trace!(label = channel.label(), "Remote data channel announced");
                    Self::wire_data_channel(channel, &data_channel, &events_tx, &closed);
                    Box::pin(async {})
                }));
            }
        }

        Ok((
            Self {
                role,
                peer_connection,
                data_channel,
                events_tx,
                closed,
            },
            events_rx,
        ))
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    fn emit_closed(events_tx: &broadcast::Sender<PeerEvent>, closed: &Arc<AtomicBool>) {
        if closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = events_tx.send(PeerEvent::Closed);
    }

    fn wire_data_channel(
        channel: Arc<RTCDataChannel>,
        slot: &Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
        events_tx: &broadcast::Sender<PeerEvent>,
        closed: &Arc<AtomicBool>,
    ) {
        *slot.lock() = Some(Arc::clone(&channel));

        {
            let events_tx = events_tx.clone();
            channel.on_open(Box::new(move || {
                tracing::trace!("Data channel open");
                if events_tx.send(PeerEvent::Connected).is_err() {
                    tracing::warn!("Failed to emit connected event");
                }
                Box::pin(async {})
            }));
        }

        {
            let events_tx = events_tx.clone();
            channel.on_message(Box::new(move |message: DataChannelMessage| {
                tracing::trace!(len = message.data.len(), "Data channel message received");
                if events_tx.send(PeerEvent::Data(message.data)).is_err() {
                    tracing::warn!("Failed to emit data event");
                }
                Box::pin(async {})
            }));
        }

        {
            let events_tx = events_tx.clone();
            let closed = Arc::clone(closed);
            channel.on_close(Box::new(move || {
                tracing::trace!("Data channel closed");
                Self::emit_closed(&events_tx, &closed);
                Box::pin(async {})
            }));
        }
    }

    #[instrument(level = "trace", skip(self, description), err)]
    async fn accept_offer(&self, description: RTCSessionDescription) -> Result<(), PeerError> {
        self.peer_connection
            .set_remote_description(description)
            .await
            .context("Failed to set offer as remote description")?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .context("Failed to create answer")?;
        self.peer_connection
            .set_local_description(answer)
            .await
            .context("Failed to set answer as local description")?;

        let answer = self
            .peer_connection
            .local_description()
            .await
            .context("Failed to get local description for answer")?;
        let signal =
            serde_json::to_value(&answer).context("Failed to serialize local description")?;
        if self.events_tx.send(PeerEvent::Signal(signal)).is_err() {
            tracing::warn!("Failed to emit answer signal");
        }

        Ok(())
    }

    #[instrument(level = "trace", skip(self, description), err)]
    async fn accept_answer(&self, description: RTCSessionDescription) -> Result<(), PeerError> {
        self.peer_connection
            .set_remote_description(description)
            .await
            .context("Failed to set answer as remote description")?;
        Ok(())
    }

    #[instrument(level = "trace", skip(self, candidate), err)]
    async fn add_remote_candidate(&self, candidate: serde_json::Value) -> Result<(), PeerError> {
        let init: RTCIceCandidateInit =
            serde_json::from_value(candidate).context("Failed to deserialize candidate")?;
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .context("Failed to add remote ICE candidate")?;
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    #[instrument(level = "trace", skip(self, signal), err)]
    async fn apply_signal(&self, signal: serde_json::Value) -> Result<(), PeerError> {
        if signal.get("sdp").is_some() && signal.get("type").is_some() {
            let description: RTCSessionDescription = serde_json::from_value(signal)
                .context("Failed to deserialize session description")?;
            return match description.sdp_type {
                RTCSdpType::Offer => self.accept_offer(description).await,
                RTCSdpType::Answer => self.accept_answer(description).await,
                other => {
                    tracing::debug!(?other, "Ignoring unsupported session description");
                    Ok(())
                }
            };
        }

        if let Some(candidate) = signal.get("candidate") {
            return self.add_remote_candidate(candidate.clone()).await;
        }

        tracing::debug!("Ignoring unrecognized signal");
        Ok(())
    }

    #[instrument(level = "trace", skip(self, payload), err)]
    async fn send(&self, payload: Bytes) -> Result<(), PeerError> {
        let channel = self.data_channel.lock().clone().ok_or(PeerError::Closed)?;
        channel
            .send(&payload)
            .await
            .context("Failed to send over data channel")?;
        Ok(())
    }

    #[instrument(level = "trace", skip(self))]
    async fn close(&self) {
        if let Err(err) = self.peer_connection.close().await {
            tracing::warn!(?err, "Failed to close peer connection");
        }
        Self::emit_closed(&self.events_tx, &self.closed);
    }
}
