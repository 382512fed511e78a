mod connection;
mod endpoint;
mod host;
mod protocol;
mod reliability;
mod simulator;
mod stats;

pub use connection::{ClientConnection, ConnectionEvent, ConnectionState, DisconnectReason};
pub use endpoint::NetworkEndpoint;
pub use host::{ConnectionManager, FrameReport, HostConnection};
pub use protocol::{ArchivedPacket, sequence_greater_than, sequence_less_than};
pub use protocol::{
    DEFAULT_PORT, DEFAULT_TICK_RATE, DeliveryOutcome, MAX_PACKET_SIZE, OutgoingPacket,
    PROTOCOL_MAGIC, PROTOCOL_VERSION, Packet, PacketError, PacketHeader, PacketListener,
    PacketNotification, Payload,
};
pub use reliability::{InFlightPacket, ReliabilityLayer};
pub use simulator::{LinkVerdict, NetworkSimulator};
pub use stats::{NetworkStats, PacketLossSimulation};
