use std::collections::{BTreeMap, HashMap};

use super::ReplicationError;
use super::payload::{ComponentState, ReplicationPayload};
use super::rpc::RpcTable;
use super::singleton::SingletonStore;

/// Destination for replicated entity state on the client.
pub trait EntityStore {
    fn apply_entity(
        &mut self,
        net_id: u32,
        components: Vec<ComponentState>,
    ) -> Result<(), ReplicationError>;
}

/// Opaque component bytes per replicated entity, keyed by component type.
#[derive(Debug, Default)]
pub struct ReplicatedEntities {
    entities: BTreeMap<u32, HashMap<u32, Vec<u8>>>,
}

impl ReplicatedEntities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, net_id: u32) -> bool {
        self.entities.contains_key(&net_id)
    }

    pub fn component(&self, net_id: u32, type_id: u32) -> Option<&[u8]> {
        self.entities.get(&net_id)?.get(&type_id).map(Vec::as_slice)
    }

    pub fn net_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.entities.keys().copied()
    }

    pub fn remove(&mut self, net_id: u32) -> bool {
        self.entities.remove(&net_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl EntityStore for ReplicatedEntities {
    fn apply_entity(
        &mut self,
        net_id: u32,
        components: Vec<ComponentState>,
    ) -> Result<(), ReplicationError> {
        let entity = self.entities.entry(net_id).or_default();
        for component in components {
            entity.insert(component.type_id, component.state);
        }
        Ok(())
    }
}

/// Buffers replication payloads as they arrive and applies them when the
/// simulation loop asks for it.
#[derive(Debug, Default)]
pub struct ReplicationReceiver {
    rpc_list: Vec<Vec<u8>>,
    singleton_list: Vec<(u32, Vec<u8>)>,
    entity_list: Vec<(u32, Vec<ComponentState>)>,
}

impl ReplicationReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_payload(&mut self, payload: ReplicationPayload) {
        match payload {
            ReplicationPayload::Rpc(blob) => self.rpc_list.push(blob),
            ReplicationPayload::SingletonComponent {
                static_type_id,
                state,
            } => self.singleton_list.push((static_type_id, state)),
            ReplicationPayload::Entity { net_id, components } => {
                self.entity_list.push((net_id, components))
            }
            ReplicationPayload::Component { net_id, component } => {
                self.entity_list.push((net_id, vec![component]))
            }
        }
    }

    pub fn buffered(&self) -> usize {
        self.rpc_list.len() + self.singleton_list.len() + self.entity_list.len()
    }

    /// Runs every buffered RPC in arrival order. A resent RPC whose first
    /// copy already arrived runs again.
    pub fn replicate_rpcs<C>(&mut self, table: &RpcTable<C>, ctx: &mut C) -> usize {
        let mut applied = 0;
        for blob in self.rpc_list.drain(..) {
            match table.dispatch(ctx, &blob) {
                Ok(id) => {
                    log::trace!("applied rpc {}", id);
                    applied += 1;
                }
                Err(e) => log::warn!("rpc dispatch failed: {}", e),
            }
        }
        applied
    }

    /// Later states for the same type overwrite earlier ones.
    pub fn replicate_singletons(&mut self, store: &mut SingletonStore) -> usize {
        let mut applied = 0;
        for (type_id, state) in self.singleton_list.drain(..) {
            match store.load(type_id, &state) {
                Ok(()) => applied += 1,
                Err(e) => log::warn!("singleton {:#x} not applied: {}", type_id, e),
            }
        }
        applied
    }

    pub fn replicate_entities(&mut self, store: &mut impl EntityStore) -> usize {
        let mut applied = 0;
        for (net_id, components) in self.entity_list.drain(..) {
            match store.apply_entity(net_id, components) {
                Ok(()) => applied += 1,
                Err(e) => log::warn!("entity {} not applied: {}", net_id, e),
            }
        }
        applied
    }

    pub fn clear(&mut self) {
        self.rpc_list.clear();
        self.singleton_list.clear();
        self.entity_list.clear();
    }
}
