pub mod events;
pub mod mock;
pub mod rig;

pub use events::AwaitTransportEventExt;
pub use mock::{MockConnector, MockHub, MockPeer, MockPeerProbe};
pub use rig::{TestNode, TestRig};
