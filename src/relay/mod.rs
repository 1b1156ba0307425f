pub mod peers;
pub mod server;

pub use peers::{Classifier, ConnId, Membership, Peers, Role};
pub use server::{RelayHandle, RelayServer, RelaySettings};
