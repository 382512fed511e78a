use std::any::Any;
use std::collections::HashMap;

use rkyv::{Archive, Deserialize, Serialize, rancor};

use super::ReplicationError;
use super::payload::ReplicationPayload;

/// World-unique state replicated wholesale, addressed by a static type id.
pub trait Singleton: Any {
    const TYPE_ID: u32;

    fn net_save(&self) -> Result<Vec<u8>, ReplicationError>;

    fn net_load(&mut self, bytes: &[u8]) -> Result<(), ReplicationError>;
}

pub fn singleton_payload<T: Singleton>(value: &T) -> Result<ReplicationPayload, ReplicationError> {
    Ok(ReplicationPayload::SingletonComponent {
        static_type_id: T::TYPE_ID,
        state: value.net_save()?,
    })
}

type LoadFn = fn(&mut dyn Any, &[u8]) -> Result<(), ReplicationError>;

struct SingletonSlot {
    value: Box<dyn Any>,
    load: LoadFn,
}

fn load_into<T: Singleton>(slot: &mut dyn Any, bytes: &[u8]) -> Result<(), ReplicationError> {
    slot.downcast_mut::<T>()
        .ok_or(ReplicationError::UnknownSingleton(T::TYPE_ID))?
        .net_load(bytes)
}

/// Client-side singleton instances keyed by type id.
#[derive(Default)]
pub struct SingletonStore {
    slots: HashMap<u32, SingletonSlot>,
}

impl std::fmt::Debug for SingletonStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingletonStore")
            .field("type_ids", &self.slots.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SingletonStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Singleton>(&mut self, value: T) {
        self.slots.insert(
            T::TYPE_ID,
            SingletonSlot {
                value: Box::new(value),
                load: load_into::<T>,
            },
        );
    }

    pub fn get<T: Singleton>(&self) -> Option<&T> {
        self.slots.get(&T::TYPE_ID)?.value.downcast_ref()
    }

    pub fn get_mut<T: Singleton>(&mut self) -> Option<&mut T> {
        self.slots.get_mut(&T::TYPE_ID)?.value.downcast_mut()
    }

    /// Overwrites the singleton registered under `type_id`.
    pub fn load(&mut self, type_id: u32, bytes: &[u8]) -> Result<(), ReplicationError> {
        let slot = self
            .slots
            .get_mut(&type_id)
            .ok_or(ReplicationError::UnknownSingleton(type_id))?;
        (slot.load)(slot.value.as_mut(), bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct MatchState {
    pub round: u32,
    pub time_remaining_ms: u32,
}

impl Singleton for MatchState {
    const TYPE_ID: u32 = u32::from_be_bytes(*b"MTCH");

    fn net_save(&self) -> Result<Vec<u8>, ReplicationError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(ReplicationError::Encode)
    }

    fn net_load(&mut self, bytes: &[u8]) -> Result<(), ReplicationError> {
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        *self = rkyv::from_bytes::<Self, rancor::Error>(&aligned).map_err(ReplicationError::Decode)?;
        Ok(())
    }
}
