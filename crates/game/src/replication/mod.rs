mod linking;
mod manager;
mod payload;
mod receiver;
mod rpc;
mod singleton;

pub use linking::{EntityHandle, LinkingContext, NetId};
pub use manager::{ReplicationEvent, ReplicationHandle, ReplicationLocation, ReplicationManager};
pub use payload::{ComponentState, ReplicationFlags, ReplicationPayload};
pub use receiver::{EntityStore, ReplicatedEntities, ReplicationReceiver};
pub use rpc::{Rpc, RpcContext, RpcHandler, RpcId, RpcTable};
pub use singleton::{MatchState, Singleton, SingletonStore, singleton_payload};

use rkyv::rancor;

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("no handler registered for rpc {0}")]
    UnknownRpc(RpcId),
    #[error("rpc blob of {len} bytes has no id")]
    TruncatedRpc { len: usize },
    #[error("rpc {id} expects {expected} argument bytes, got {actual}")]
    RpcArguments {
        id: RpcId,
        expected: usize,
        actual: usize,
    },
    #[error("no singleton registered for type {0:#x}")]
    UnknownSingleton(u32),
    #[error("{kind} replication of {size} bytes exceeds the {budget} byte packet budget")]
    Oversized {
        kind: &'static str,
        size: usize,
        budget: usize,
    },
    #[error("failed to encode state: {0}")]
    Encode(rancor::Error),
    #[error("failed to decode state: {0}")]
    Decode(rancor::Error),
}
