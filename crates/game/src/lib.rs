pub mod config;
pub mod net;
pub mod physics;
pub mod prediction;
pub mod replication;
pub mod session;

pub use config::{Backoff, NetConfig};
pub use net::{
    ClientConnection, ConnectionEvent, ConnectionManager, ConnectionState, DEFAULT_PORT,
    DEFAULT_TICK_RATE, DisconnectReason, HostConnection, LinkVerdict, NetworkEndpoint,
    NetworkSimulator, NetworkStats, Packet, PacketError, PacketHeader, PacketLossSimulation,
    Payload, ReliabilityLayer,
};
pub use physics::{PhysicsShipSimulation, PhysicsWorld, ShipMovement, ShipSimulation};
pub use prediction::{
    ClientGameData, FrameInput, HostGameData, PlayerStateSnapshot, ShipInput, ShipState,
};
pub use replication::{
    ReplicationError, ReplicationFlags, ReplicationManager, ReplicationPayload,
    ReplicationReceiver, Rpc, RpcId,
};
pub use session::{ClientSession, HostEvent, HostSession, SessionError};
