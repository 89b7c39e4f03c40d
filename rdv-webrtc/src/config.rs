use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

/// Label of the single data channel carrying the handshake's payload.
pub const DATA_CHANNEL_LABEL: &str = "rdv";

pub const PEER_EVENTS_CAPACITY: usize = 64;

/// ICE servers used for candidate gathering. An empty configuration limits
/// negotiation to host candidates, which is enough for same-host setups and
/// tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceConfig {
    pub servers: Vec<IceServer>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

pub(crate) trait IntoRtc {
    fn into_rtc(self) -> RTCConfiguration;
}

impl IntoRtc for IceConfig {
    fn into_rtc(self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .servers
                .into_iter()
                .map(|server| RTCIceServer {
                    urls: server.urls,
                    username: server.username,
                    credential: server.credential,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}
