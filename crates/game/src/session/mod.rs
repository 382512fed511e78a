mod client;
mod host;

use std::net::SocketAddr;

pub use client::ClientSession;
pub use host::{HostEvent, HostPeer, HostSession};

use crate::replication::{EntityHandle, ReplicationError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("server is full ({max} players)")]
    ServerFull { max: usize },
    #[error("packet from unknown peer {0}")]
    UnknownPeer(SocketAddr),
    #[error("no connected player with id {0}")]
    UnknownPlayer(u32),
    #[error("entity {0:?} is not linked to a network id")]
    UnlinkedEntity(EntityHandle),
    #[error(transparent)]
    Replication(#[from] ReplicationError),
}
