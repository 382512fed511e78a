use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use crate::config::Backoff;
use crate::net::{OutgoingPacket, Packet, PacketHeader, PacketListener, Payload};

use super::ReplicationError;
use super::payload::{ReplicationFlags, ReplicationPayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplicationHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationEvent {
    /// A packet carrying the entry was acknowledged.
    Confirmed(ReplicationHandle),
    /// The resend cap was reached; the entry is gone.
    Abandoned(ReplicationHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationLocation {
    Queued,
    Pending(u32),
}

#[derive(Debug, Clone)]
struct ReplicationEntry {
    handle: ReplicationHandle,
    flags: ReplicationFlags,
    payload: ReplicationPayload,
    failures: u32,
    not_before: Option<Instant>,
}

impl ReplicationEntry {
    fn ready(&self, now: Instant) -> bool {
        self.not_before.is_none_or(|at| now >= at)
    }
}

/// Host-side outgoing replication queue for one peer.
///
/// An entry is always in exactly one place: `next_replication` while waiting
/// to be sent, `pending_replication[tag]` while its packet is in flight.
#[derive(Debug)]
pub struct ReplicationManager {
    next_replication: VecDeque<ReplicationEntry>,
    pending_replication: BTreeMap<u32, Vec<ReplicationEntry>>,
    next_handle: u64,
    backoff: Backoff,
    budget: usize,
    events: VecDeque<ReplicationEvent>,
}

impl ReplicationManager {
    pub fn new(backoff: Backoff, budget: usize) -> Self {
        Self {
            next_replication: VecDeque::new(),
            pending_replication: BTreeMap::new(),
            next_handle: 0,
            backoff,
            budget,
            events: VecDeque::new(),
        }
    }

    /// Queues `payload`. Refused when it could not fit even an otherwise
    /// empty packet.
    pub fn replicate(
        &mut self,
        payload: ReplicationPayload,
        flags: ReplicationFlags,
    ) -> Result<ReplicationHandle, ReplicationError> {
        let alone = Packet::new(
            PacketHeader::default(),
            vec![Payload::Replication(payload.clone())],
        );
        let size = alone.encoded_len().map_err(ReplicationError::Encode)?;
        if size > self.budget {
            return Err(ReplicationError::Oversized {
                kind: payload.kind(),
                size,
                budget: self.budget,
            });
        }

        let handle = ReplicationHandle(self.next_handle);
        self.next_handle += 1;
        self.next_replication.push_back(ReplicationEntry {
            handle,
            flags,
            payload,
            failures: 0,
            not_before: None,
        });
        Ok(handle)
    }

    /// Moves every ready entry that fits the budget into `packet`.
    pub fn write(&mut self, packet: &mut OutgoingPacket, now: Instant) {
        let tag = packet.tag();
        let mut held_back = VecDeque::new();
        let mut sent_reliable = Vec::new();

        while let Some(entry) = self.next_replication.pop_front() {
            if !entry.ready(now) {
                held_back.push_back(entry);
                continue;
            }
            let payload = Payload::Replication(entry.payload.clone());
            if packet.push_within(payload, self.budget).is_err() {
                held_back.push_back(entry);
                continue;
            }

            if entry.flags.contains(ReplicationFlags::RESEND_UNTIL_REPLICATED) {
                sent_reliable.push(entry);
            }
        }
        self.next_replication = held_back;

        if !sent_reliable.is_empty() {
            packet.listen(PacketListener::Replication);
            self.pending_replication
                .entry(tag)
                .or_default()
                .extend(sent_reliable);
        }
    }

    pub fn on_replication_success(&mut self, tag: u32) {
        let Some(entries) = self.pending_replication.remove(&tag) else {
            return;
        };
        for entry in entries {
            self.events.push_back(ReplicationEvent::Confirmed(entry.handle));
        }
    }

    pub fn on_replication_fail(&mut self, tag: u32, now: Instant) {
        let Some(entries) = self.pending_replication.remove(&tag) else {
            return;
        };
        for mut entry in entries {
            entry.failures += 1;
            if self.backoff.exhausted(entry.failures) {
                log::warn!(
                    "abandoning {} replication after {} lost sends",
                    entry.payload.kind(),
                    entry.failures
                );
                self.events.push_back(ReplicationEvent::Abandoned(entry.handle));
                continue;
            }

            let delay = self.backoff.delay(entry.failures);
            log::debug!(
                "{} replication lost with packet {}, resending in {:?}",
                entry.payload.kind(),
                tag,
                delay
            );
            entry.not_before = Some(now + delay);
            self.next_replication.push_back(entry);
        }
    }

    /// Where `handle` currently lives, or `None` once it was confirmed,
    /// abandoned or sent without the resend flag.
    pub fn location(&self, handle: ReplicationHandle) -> Option<ReplicationLocation> {
        if self.next_replication.iter().any(|e| e.handle == handle) {
            return Some(ReplicationLocation::Queued);
        }
        self.pending_replication
            .iter()
            .find(|(_, entries)| entries.iter().any(|e| e.handle == handle))
            .map(|(&tag, _)| ReplicationLocation::Pending(tag))
    }

    pub fn queued_count(&self) -> usize {
        self.next_replication.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending_replication.values().map(Vec::len).sum()
    }

    pub fn is_idle(&self) -> bool {
        self.next_replication.is_empty() && self.pending_replication.is_empty()
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ReplicationEvent> + '_ {
        self.events.drain(..)
    }

    pub fn clear(&mut self) {
        self.next_replication.clear();
        self.pending_replication.clear();
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use crate::net::ReliabilityLayer;
    use crate::replication::Rpc;

    fn rpc(byte: u8) -> ReplicationPayload {
        ReplicationPayload::Rpc(vec![b'T', b'E', b'S', b'T', byte])
    }

    fn manager() -> ReplicationManager {
        ReplicationManager::new(Backoff::default(), 1100)
    }

    /// One send cycle through a reliability layer; returns the tag used.
    fn send(
        manager: &mut ReplicationManager,
        layer: &mut ReliabilityLayer,
        now: Instant,
    ) -> (u32, Vec<Payload>) {
        let mut packet = OutgoingPacket::new();
        layer.write(&mut packet);
        manager.write(&mut packet, now);
        if !packet.has_payloads() {
            packet.push(Payload::Disconnect);
        }
        layer.register_packet(&mut packet, now);
        let tag = packet.tag();
        (tag, packet.into_packet().payloads)
    }

    #[test]
    fn fire_and_forget_is_discarded_after_one_send() {
        let now = Instant::now();
        let mut manager = manager();
        let handle = manager.replicate(rpc(1), ReplicationFlags::empty()).unwrap();

        let mut packet = OutgoingPacket::new();
        manager.write(&mut packet, now);

        assert_eq!(packet.packet.payloads.len(), 1);
        assert!(packet.listeners.is_empty());
        assert_eq!(manager.location(handle), None);
        assert!(manager.is_idle());
    }

    #[test]
    fn several_entries_share_one_tag() {
        let now = Instant::now();
        let mut manager = manager();
        let mut layer = ReliabilityLayer::default();
        let a = manager.replicate(rpc(1), ReplicationFlags::RESEND_UNTIL_REPLICATED).unwrap();
        let b = manager.replicate(rpc(2), ReplicationFlags::RESEND_UNTIL_REPLICATED).unwrap();

        let (tag, payloads) = send(&mut manager, &mut layer, now);
        assert_eq!(payloads.len(), 2);
        assert_eq!(manager.location(a), Some(ReplicationLocation::Pending(tag)));
        assert_eq!(manager.location(b), Some(ReplicationLocation::Pending(tag)));

        manager.on_replication_success(tag);
        assert_eq!(
            manager.drain_events().collect::<Vec<_>>(),
            vec![ReplicationEvent::Confirmed(a), ReplicationEvent::Confirmed(b)]
        );
        assert!(manager.is_idle());
    }

    #[test]
    fn lost_entry_is_resent_with_fresh_tag() {
        let now = Instant::now();
        let mut manager = manager();
        let mut layer = ReliabilityLayer::default();
        for _ in 0..9 {
            send(&mut manager, &mut layer, now);
        }
        layer.process_acks(&(0..9).collect::<Vec<_>>(), now);

        let handle = manager.replicate(rpc(7), ReplicationFlags::RESEND_UNTIL_REPLICATED).unwrap();
        let (first, _) = send(&mut manager, &mut layer, now);
        assert_eq!(first, 9);
        let (unrelated, _) = send(&mut manager, &mut layer, now);
        assert_eq!(unrelated, 10);

        for notification in layer.process_acks(&[10], now) {
            if notification.listener == PacketListener::Replication {
                match notification.outcome {
                    crate::net::DeliveryOutcome::Delivered => {
                        manager.on_replication_success(notification.tag)
                    }
                    crate::net::DeliveryOutcome::Dropped => {
                        manager.on_replication_fail(notification.tag, now)
                    }
                }
            }
        }
        assert_eq!(manager.location(handle), Some(ReplicationLocation::Queued));

        let (second, payloads) = send(&mut manager, &mut layer, now);
        assert_eq!(second, 11);
        assert_eq!(payloads, vec![Payload::Replication(rpc(7))]);
        assert_eq!(manager.location(handle), Some(ReplicationLocation::Pending(11)));
    }

    #[test]
    fn entry_lives_in_exactly_one_place() {
        let now = Instant::now();
        let mut manager = manager();
        let handle = manager.replicate(rpc(1), ReplicationFlags::RESEND_UNTIL_REPLICATED).unwrap();

        for tag in 0..6u32 {
            let mut packet = OutgoingPacket::new();
            packet.packet.header.tag = tag;
            manager.write(&mut packet, now);
            assert!(manager.location(handle).is_some());
            assert_eq!(manager.queued_count() + manager.pending_count(), 1);

            manager.on_replication_fail(tag, now);
            assert_eq!(manager.location(handle), Some(ReplicationLocation::Queued));
        }
    }

    #[test]
    fn backoff_delays_later_resends() {
        let now = Instant::now();
        let backoff = Backoff::default();
        let mut manager = ReplicationManager::new(backoff.clone(), 1100);
        manager.replicate(rpc(1), ReplicationFlags::RESEND_UNTIL_REPLICATED).unwrap();

        for tag in 0..2u32 {
            let mut packet = OutgoingPacket::new();
            packet.packet.header.tag = tag;
            manager.write(&mut packet, now);
            assert!(packet.has_payloads());
            manager.on_replication_fail(tag, now);
        }

        let mut early = OutgoingPacket::new();
        manager.write(&mut early, now);
        assert!(!early.has_payloads());

        let mut later = OutgoingPacket::new();
        manager.write(&mut later, now + backoff.delay(2));
        assert!(later.has_payloads());
    }

    #[test]
    fn resend_cap_abandons() {
        let now = Instant::now();
        let backoff = Backoff {
            max_attempts: Some(2),
            ..Backoff::immediate()
        };
        let mut manager = ReplicationManager::new(backoff, 1100);
        let handle = manager.replicate(rpc(1), ReplicationFlags::RESEND_UNTIL_REPLICATED).unwrap();

        for tag in 0..2u32 {
            let mut packet = OutgoingPacket::new();
            packet.packet.header.tag = tag;
            manager.write(&mut packet, now);
            manager.on_replication_fail(tag, now);
        }

        assert_eq!(manager.location(handle), None);
        assert_eq!(
            manager.drain_events().collect::<Vec<_>>(),
            vec![ReplicationEvent::Abandoned(handle)]
        );
    }

    #[test]
    fn budget_holds_entries_for_next_packet() {
        let now = Instant::now();
        let mut manager = ReplicationManager::new(Backoff::default(), 300);
        let big = || ReplicationPayload::Rpc(vec![0; 200]);
        manager.replicate(big(), ReplicationFlags::RESEND_UNTIL_REPLICATED).unwrap();
        manager.replicate(big(), ReplicationFlags::RESEND_UNTIL_REPLICATED).unwrap();

        let mut packet = OutgoingPacket::new();
        manager.write(&mut packet, now);

        assert_eq!(packet.packet.payloads.len(), 1);
        assert_eq!(manager.queued_count(), 1);
    }

    #[test]
    fn packed_bundle_stays_under_the_mtu() {
        let now = Instant::now();
        let budget = NetConfig::default().packet_budget;
        let mut manager = ReplicationManager::new(Backoff::default(), budget);
        let mut layer = ReliabilityLayer::default();
        for net_id in 0..60 {
            let spawn = Rpc::Spawn {
                net_id,
                valid_from_frame: 100,
            };
            manager
                .replicate(spawn.payload(), ReplicationFlags::RESEND_UNTIL_REPLICATED)
                .unwrap();
        }

        let mut sent = 0;
        while manager.queued_count() > 0 {
            let mut packet = OutgoingPacket::new();
            layer.write(&mut packet);
            manager.write(&mut packet, now);
            // The host appends a ship snapshot after replication.
            packet.push(Payload::PlayerState(Default::default()));
            layer.register_packet(&mut packet, now);

            let packet = packet.into_packet();
            assert!(packet.payloads.len() >= 2);
            sent += packet.payloads.len() - 1;
            packet.serialize().unwrap();
        }
        assert_eq!(sent, 60);
        assert_eq!(manager.pending_count(), 60);
    }

    #[test]
    fn requeued_bundle_is_split_again() {
        let now = Instant::now();
        let budget = NetConfig::default().packet_budget;
        let mut manager = ReplicationManager::new(Backoff::immediate(), budget);
        for byte in 0..40 {
            manager
                .replicate(
                    ReplicationPayload::Rpc(vec![byte; 40]),
                    ReplicationFlags::RESEND_UNTIL_REPLICATED,
                )
                .unwrap();
        }

        for tag in 0..4u32 {
            let mut packet = OutgoingPacket::new();
            packet.packet.header.tag = tag;
            manager.write(&mut packet, now);
            assert!(packet.has_payloads());
            packet.into_packet().serialize().unwrap();
            manager.on_replication_fail(tag, now);
        }
        assert_eq!(manager.queued_count(), 40);
    }

    #[test]
    fn payload_larger_than_any_packet_is_refused() {
        let mut manager = ReplicationManager::new(Backoff::default(), 1136);
        let result = manager.replicate(
            ReplicationPayload::Rpc(vec![0; 2000]),
            ReplicationFlags::RESEND_UNTIL_REPLICATED,
        );

        assert!(matches!(
            result,
            Err(ReplicationError::Oversized {
                kind: "rpc",
                budget: 1136,
                ..
            })
        ));
        assert!(manager.is_idle());
    }
}
