use bitflags::bitflags;
use rkyv::{Archive, Deserialize, Serialize};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ReplicationFlags: u8 {
        /// Requeue on presumed loss until one transmission is acknowledged.
        const RESEND_UNTIL_REPLICATED = 1 << 0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ComponentState {
    pub type_id: u32,
    pub state: Vec<u8>,
}

/// Replicated data carried inside a `Payload::Replication`. The enum
/// discriminant is the leading type tag on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum ReplicationPayload {
    Component {
        net_id: u32,
        component: ComponentState,
    },
    SingletonComponent {
        static_type_id: u32,
        state: Vec<u8>,
    },
    Entity {
        net_id: u32,
        components: Vec<ComponentState>,
    },
    /// First four bytes are the RPC id, the rest its arguments.
    Rpc(Vec<u8>),
}

impl ReplicationPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Component { .. } => "component",
            Self::SingletonComponent { .. } => "singleton",
            Self::Entity { .. } => "entity",
            Self::Rpc(_) => "rpc",
        }
    }
}
