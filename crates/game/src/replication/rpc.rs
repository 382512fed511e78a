use std::collections::HashMap;
use std::fmt;

use super::ReplicationError;
use super::payload::ReplicationPayload;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RpcId(pub [u8; 4]);

impl RpcId {
    pub const SYNC: RpcId = RpcId(*b"SYNC");
    pub const SPWN: RpcId = RpcId(*b"SPWN");
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &byte in &self.0 {
            if byte.is_ascii_graphic() {
                write!(f, "{}", byte as char)?;
            } else {
                write!(f, "\\x{:02x}", byte)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RpcId({})", self)
    }
}

/// Receiver-side effects of the built-in RPCs.
pub trait RpcContext {
    fn shift_frame_index(&mut self, delta: i32);

    fn spawn_notice(&mut self, net_id: u32, valid_from_frame: u32);
}

/// Built-in RPC calls, encoded as `id ++ little-endian arguments`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rpc {
    Sync { delta: i32 },
    Spawn { net_id: u32, valid_from_frame: u32 },
}

impl Rpc {
    pub fn id(&self) -> RpcId {
        match self {
            Rpc::Sync { .. } => RpcId::SYNC,
            Rpc::Spawn { .. } => RpcId::SPWN,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut blob = self.id().0.to_vec();
        match *self {
            Rpc::Sync { delta } => blob.extend_from_slice(&delta.to_le_bytes()),
            Rpc::Spawn {
                net_id,
                valid_from_frame,
            } => {
                blob.extend_from_slice(&net_id.to_le_bytes());
                blob.extend_from_slice(&valid_from_frame.to_le_bytes());
            }
        }
        blob
    }

    pub fn payload(&self) -> ReplicationPayload {
        ReplicationPayload::Rpc(self.encode())
    }
}

pub type RpcHandler<C> = fn(&mut C, &[u8]) -> Result<(), ReplicationError>;

/// Dispatch table from RPC id to handler. Filled once at startup.
pub struct RpcTable<C> {
    handlers: HashMap<RpcId, RpcHandler<C>>,
}

impl<C> Default for RpcTable<C> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<C> fmt::Debug for RpcTable<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

impl<C> RpcTable<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: RpcId, handler: RpcHandler<C>) -> Self {
        self.handlers.insert(id, handler);
        self
    }

    pub fn contains(&self, id: RpcId) -> bool {
        self.handlers.contains_key(&id)
    }

    /// Splits off the id and runs the matching handler on the arguments.
    pub fn dispatch(&self, ctx: &mut C, blob: &[u8]) -> Result<RpcId, ReplicationError> {
        let Some((id, args)) = blob.split_first_chunk::<4>() else {
            return Err(ReplicationError::TruncatedRpc { len: blob.len() });
        };
        let id = RpcId(*id);
        let handler = self
            .handlers
            .get(&id)
            .ok_or(ReplicationError::UnknownRpc(id))?;
        handler(ctx, args)?;
        Ok(id)
    }
}

impl<C: RpcContext> RpcTable<C> {
    pub fn with_builtins() -> Self {
        Self::new()
            .with(RpcId::SYNC, unwrap_sync::<C>)
            .with(RpcId::SPWN, unwrap_spawn::<C>)
    }
}

fn arguments<const N: usize>(id: RpcId, args: &[u8]) -> Result<[u8; N], ReplicationError> {
    args.try_into().map_err(|_| ReplicationError::RpcArguments {
        id,
        expected: N,
        actual: args.len(),
    })
}

fn unwrap_sync<C: RpcContext>(ctx: &mut C, args: &[u8]) -> Result<(), ReplicationError> {
    let delta = i32::from_le_bytes(arguments::<4>(RpcId::SYNC, args)?);
    ctx.shift_frame_index(delta);
    Ok(())
}

fn unwrap_spawn<C: RpcContext>(ctx: &mut C, args: &[u8]) -> Result<(), ReplicationError> {
    let bytes = arguments::<8>(RpcId::SPWN, args)?;
    let (net_id, frame) = bytes.split_at(4);
    let net_id = u32::from_le_bytes(arguments::<4>(RpcId::SPWN, net_id)?);
    let valid_from_frame = u32::from_le_bytes(arguments::<4>(RpcId::SPWN, frame)?);
    ctx.spawn_notice(net_id, valid_from_frame);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        shifts: Vec<i32>,
        spawns: Vec<(u32, u32)>,
    }

    impl RpcContext for Recorder {
        fn shift_frame_index(&mut self, delta: i32) {
            self.shifts.push(delta);
        }

        fn spawn_notice(&mut self, net_id: u32, valid_from_frame: u32) {
            self.spawns.push((net_id, valid_from_frame));
        }
    }

    #[test]
    fn builtins_reach_the_context() {
        let table = RpcTable::<Recorder>::with_builtins();
        let mut recorder = Recorder::default();

        let id = table
            .dispatch(&mut recorder, &Rpc::Sync { delta: -3 }.encode())
            .unwrap();
        assert_eq!(id, RpcId::SYNC);
        table
            .dispatch(
                &mut recorder,
                &Rpc::Spawn {
                    net_id: 12,
                    valid_from_frame: 400,
                }
                .encode(),
            )
            .unwrap();

        assert_eq!(recorder.shifts, vec![-3]);
        assert_eq!(recorder.spawns, vec![(12, 400)]);
    }

    #[test]
    fn sync_blob_layout() {
        assert_eq!(
            Rpc::Sync { delta: 1 }.encode(),
            vec![b'S', b'Y', b'N', b'C', 1, 0, 0, 0]
        );
    }

    #[test]
    fn unknown_and_malformed_rpcs_are_rejected() {
        let table = RpcTable::<Recorder>::with_builtins();
        let mut recorder = Recorder::default();

        assert!(matches!(
            table.dispatch(&mut recorder, b"NOPE"),
            Err(ReplicationError::UnknownRpc(RpcId(id))) if &id == b"NOPE"
        ));
        assert!(matches!(
            table.dispatch(&mut recorder, b"SY"),
            Err(ReplicationError::TruncatedRpc { len: 2 })
        ));
        assert!(matches!(
            table.dispatch(&mut recorder, b"SYNC\x01"),
            Err(ReplicationError::RpcArguments { expected: 4, actual: 1, .. })
        ));
        assert!(recorder.shifts.is_empty());
    }

    #[test]
    fn display_escapes_binary_ids() {
        assert_eq!(RpcId::SPWN.to_string(), "SPWN");
        assert_eq!(RpcId([b'A', 0, b'B', b'C']).to_string(), "A\\x00BC");
    }
}
