//! Networking: wire protocol, framing, connections and the connection registry

pub mod connection;
pub mod framing;
pub mod protocol;
pub mod registry;

pub use connection::{Connection, ConnectionId, ConnectionStats, Disconnect, SendError};
pub use protocol::{Packet, PacketHeader};
pub use registry::{ConnectionRegistry, IdGenerator, RegistryError};
