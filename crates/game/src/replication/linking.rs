use std::collections::HashMap;

use super::payload::{ComponentState, ReplicationPayload};

/// Host-local entity handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityHandle(pub u32);

/// Identifier shared by host and clients for a replicated entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetId(pub u32);

/// Bidirectional `EntityHandle` <-> `NetId` table.
#[derive(Debug, Default)]
pub struct LinkingContext {
    net_ids: HashMap<EntityHandle, NetId>,
    handles: HashMap<NetId, EntityHandle>,
    next_net_id: u32,
}

impl LinkingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing net id of `handle`, allocating one if needed.
    pub fn link(&mut self, handle: EntityHandle) -> NetId {
        if let Some(&net_id) = self.net_ids.get(&handle) {
            return net_id;
        }
        let net_id = NetId(self.next_net_id);
        self.next_net_id += 1;
        self.net_ids.insert(handle, net_id);
        self.handles.insert(net_id, handle);
        net_id
    }

    pub fn unlink(&mut self, handle: EntityHandle) -> Option<NetId> {
        let net_id = self.net_ids.remove(&handle)?;
        self.handles.remove(&net_id);
        Some(net_id)
    }

    pub fn net_id(&self, handle: EntityHandle) -> Option<NetId> {
        self.net_ids.get(&handle).copied()
    }

    pub fn handle(&self, net_id: NetId) -> Option<EntityHandle> {
        self.handles.get(&net_id).copied()
    }

    pub fn len(&self) -> usize {
        self.net_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.net_ids.is_empty()
    }

    /// Full-entity payload, or `None` for an unlinked handle.
    pub fn entity_payload(
        &self,
        handle: EntityHandle,
        components: Vec<ComponentState>,
    ) -> Option<ReplicationPayload> {
        let NetId(net_id) = self.net_id(handle)?;
        if components.len() > u8::MAX as usize {
            log::warn!(
                "entity {} carries {} components, only {} are replicated",
                net_id,
                components.len(),
                u8::MAX
            );
        }
        Some(ReplicationPayload::Entity {
            net_id,
            components: components.into_iter().take(u8::MAX as usize).collect(),
        })
    }

    pub fn component_payload(
        &self,
        handle: EntityHandle,
        component: ComponentState,
    ) -> Option<ReplicationPayload> {
        let NetId(net_id) = self.net_id(handle)?;
        Some(ReplicationPayload::Component { net_id, component })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_is_stable_and_reversible() {
        let mut linking = LinkingContext::new();
        let a = linking.link(EntityHandle(10));
        let b = linking.link(EntityHandle(11));

        assert_ne!(a, b);
        assert_eq!(linking.link(EntityHandle(10)), a);
        assert_eq!(linking.handle(b), Some(EntityHandle(11)));

        assert_eq!(linking.unlink(EntityHandle(10)), Some(a));
        assert_eq!(linking.handle(a), None);
        assert_eq!(linking.len(), 1);
    }

    #[test]
    fn unlinked_handle_produces_nothing() {
        let linking = LinkingContext::new();
        assert!(linking.entity_payload(EntityHandle(3), Vec::new()).is_none());
    }

    #[test]
    fn entity_payload_uses_net_id() {
        let mut linking = LinkingContext::new();
        linking.link(EntityHandle(0));
        let NetId(net_id) = linking.link(EntityHandle(5));

        let payload = linking
            .entity_payload(
                EntityHandle(5),
                vec![ComponentState {
                    type_id: 2,
                    state: vec![1, 2, 3],
                }],
            )
            .unwrap();

        assert!(matches!(
            payload,
            ReplicationPayload::Entity { net_id: id, ref components } if id == net_id && components.len() == 1
        ));
    }
}
