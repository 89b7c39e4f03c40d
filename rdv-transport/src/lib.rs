//! Signaling-relay transport adapter.
//!
//! Two participants that cannot yet exchange data directly negotiate an
//! ephemeral peer connection by relaying opaque signals over an
//! already-connected rendezvous bus. Each logical message gets its own
//! connection: outbound sends open a fresh handshake towards the target
//! identity, inbound handshakes surface exactly one payload and are torn
//! down. The whole machinery is exposed as a single duplex message channel to
//! the enclosing request/response layer.

pub mod bus;
pub mod config;
pub mod error;
pub mod handshake;
pub mod peer;
mod registry;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use bus::{BusSubscription, MemoryBus, SignalBus};
pub use config::TransportConfig;
pub use error::{BusError, HandshakeError, PeerError, TransportError};
pub use handshake::{Handshake, HandshakeState};
pub use peer::{PeerConnection, PeerConnector, PeerEvent, PeerRole};
pub use transport::{DeliveryTicket, RtcTransport, State, TransportEvent};
