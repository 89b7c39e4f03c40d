pub mod signal;

pub use signal::{HandshakeId, PeerId, SignalEnvelope};
