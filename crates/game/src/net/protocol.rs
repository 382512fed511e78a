use rkyv::{Archive, Deserialize, Serialize, rancor};

use crate::prediction::{FrameInput, PlayerStateSnapshot};
use crate::replication::ReplicationPayload;

pub const MAX_PACKET_SIZE: usize = 1200;
pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x4452_4654;
pub const DEFAULT_PORT: u16 = 27015;
pub const DEFAULT_TICK_RATE: u32 = 60;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[inline]
pub fn sequence_less_than(s1: u32, s2: u32) -> bool {
    sequence_greater_than(s2, s1)
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct PacketHeader {
    pub magic: u32,
    pub version: u32,
    /// Sender-scoped sequence number. Meaningless when `only_contains_ack` is set.
    pub tag: u32,
    pub ack_tags: Vec<u32>,
    pub only_contains_ack: bool,
}

impl PacketHeader {
    pub fn new(tag: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            tag,
            ack_tags: Vec::new(),
            only_contains_ack: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }
}

impl Default for PacketHeader {
    fn default() -> Self {
        Self::new(0)
    }
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum Payload {
    Hello { name: String },
    LoginSuccess { player_id: u32, ship_id: u32 },
    Disconnect,
    Ping { ping_id: u32, previous_rtt_ms: f32 },
    PingAck { ping_id: u32, client_frame: u32 },
    Replication(ReplicationPayload),
    PlayerInputs(Vec<FrameInput>),
    PlayerState(PlayerStateSnapshot),
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Packet {
    pub header: PacketHeader,
    pub payloads: Vec<Payload>,
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("bad packet header (magic {magic:#x}, version {version})")]
    InvalidHeader { magic: u32, version: u32 },
    #[error("packet of {size} bytes exceeds the {limit} byte MTU")]
    Oversized { size: usize, limit: usize },
}

impl Packet {
    pub fn new(header: PacketHeader, payloads: Vec<Payload>) -> Self {
        Self { header, payloads }
    }

    pub fn tag(&self) -> u32 {
        self.header.tag
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty() && self.header.ack_tags.is_empty()
    }

    /// Size of the archived packet, exactly as [`Self::serialize`] emits it.
    pub fn encoded_len(&self) -> Result<usize, rancor::Error> {
        rkyv::to_bytes::<rancor::Error>(self).map(|bytes| bytes.len())
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        let bytes = rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(PacketError::Serialize)?;

        if bytes.len() > MAX_PACKET_SIZE {
            return Err(PacketError::Oversized {
                size: bytes.len(),
                limit: MAX_PACKET_SIZE,
            });
        }
        Ok(bytes)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        // Datagram buffers carry no alignment guarantee.
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);
        let packet =
            rkyv::from_bytes::<Self, rancor::Error>(&aligned).map_err(PacketError::Deserialize)?;

        if !packet.header.is_valid() {
            return Err(PacketError::InvalidHeader {
                magic: packet.header.magic,
                version: packet.header.version,
            });
        }
        Ok(packet)
    }
}

/// Subsystem that wants to hear whether the packet carrying its data arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketListener {
    Hello,
    LoginSuccess,
    Replication,
    Inputs { last_frame: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketNotification {
    pub tag: u32,
    pub outcome: DeliveryOutcome,
    pub listener: PacketListener,
}

/// A packet being assembled during one send cycle, together with the
/// listeners that fire once its tag is acknowledged or given up on.
#[derive(Debug, Clone, Default)]
pub struct OutgoingPacket {
    pub packet: Packet,
    pub listeners: Vec<PacketListener>,
}

impl Default for Packet {
    fn default() -> Self {
        Self::new(PacketHeader::default(), Vec::new())
    }
}

impl OutgoingPacket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(&self) -> u32 {
        self.packet.header.tag
    }

    pub fn push(&mut self, payload: Payload) {
        self.packet.payloads.push(payload);
    }

    /// Appends `payload` unless the archived packet would then exceed
    /// `budget` bytes, in which case the payload is handed back.
    pub fn push_within(&mut self, payload: Payload, budget: usize) -> Result<(), Payload> {
        self.packet.payloads.push(payload);
        if self
            .packet
            .encoded_len()
            .is_ok_and(|len| len <= budget)
        {
            return Ok(());
        }
        self.packet.payloads.pop().map_or(Ok(()), Err)
    }

    pub fn listen(&mut self, listener: PacketListener) {
        if !self.listeners.contains(&listener) {
            self.listeners.push(listener);
        }
    }

    pub fn has_payloads(&self) -> bool {
        !self.packet.payloads.is_empty()
    }

    pub fn into_packet(self) -> Packet {
        self.packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_comparison_wraps() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(1, 2));
        assert!(!sequence_greater_than(1, 1));
        assert!(sequence_greater_than(0, u32::MAX));
        assert!(!sequence_greater_than(u32::MAX, 0));
        assert!(sequence_less_than(u32::MAX, 0));
    }

    #[test]
    fn packet_survives_serialization() {
        let mut header = PacketHeader::new(7);
        header.ack_tags = vec![3, 4, 6];
        let packet = Packet::new(
            header,
            vec![
                Payload::Hello {
                    name: "pilot".to_string(),
                },
                Payload::PingAck {
                    ping_id: 2,
                    client_frame: 120,
                },
            ],
        );

        let serialized = packet.serialize().unwrap();
        let deserialized = Packet::deserialize(&serialized).unwrap();

        assert_eq!(packet, deserialized);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut packet = Packet::default();
        packet.header.magic = 0xDEAD_BEEF;

        let serialized = packet.serialize().unwrap();
        assert!(matches!(
            Packet::deserialize(&serialized),
            Err(PacketError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn oversized_packet_refused() {
        let packet = Packet::new(
            PacketHeader::new(0),
            vec![Payload::Hello {
                name: "x".repeat(MAX_PACKET_SIZE * 2),
            }],
        );

        assert!(matches!(
            packet.serialize(),
            Err(PacketError::Oversized { .. })
        ));
    }

    #[test]
    fn listener_registered_once() {
        let mut outgoing = OutgoingPacket::new();
        outgoing.listen(PacketListener::Replication);
        outgoing.listen(PacketListener::Replication);
        outgoing.listen(PacketListener::Hello);

        assert_eq!(outgoing.listeners.len(), 2);
    }

    #[test]
    fn push_within_measures_the_archived_packet() {
        let mut outgoing = OutgoingPacket::new();
        let blob = || Payload::Hello {
            name: "x".repeat(400),
        };

        assert!(outgoing.push_within(blob(), MAX_PACKET_SIZE).is_ok());
        assert!(outgoing.push_within(blob(), MAX_PACKET_SIZE).is_ok());
        assert!(outgoing.push_within(blob(), MAX_PACKET_SIZE).is_err());

        assert_eq!(outgoing.packet.payloads.len(), 2);
        let len = outgoing.packet.encoded_len().unwrap();
        assert!(len > 800 && len <= MAX_PACKET_SIZE);
        outgoing.into_packet().serialize().unwrap();
    }
}
