use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::protocol::{
    DeliveryOutcome, OutgoingPacket, PacketHeader, PacketListener, PacketNotification,
    sequence_less_than,
};
use super::stats::NetworkStats;

#[derive(Debug, Clone)]
pub struct InFlightPacket {
    pub tag: u32,
    pub dispatched_at: Instant,
    pub listeners: Vec<PacketListener>,
}

impl InFlightPacket {
    fn notify(self, outcome: DeliveryOutcome) -> impl Iterator<Item = PacketNotification> {
        let tag = self.tag;
        self.listeners
            .into_iter()
            .map(move |listener| PacketNotification {
                tag,
                outcome,
                listener,
            })
    }
}

/// Per-connection sequencing and acknowledgment bookkeeping.
///
/// Accepted packets are processed exactly once and in non-decreasing tag
/// order; packets skipped over by a gap are never delivered.
#[derive(Debug)]
pub struct ReliabilityLayer {
    expected_packet_tag: u32,
    next_packet_tag: u32,
    pending_acks: Vec<u32>,
    in_flight: VecDeque<InFlightPacket>,
    max_acks_per_packet: usize,
    srtt: f32,
    rtt_var: f32,
    stats: NetworkStats,
}

impl Default for ReliabilityLayer {
    fn default() -> Self {
        Self::new(64)
    }
}

impl ReliabilityLayer {
    pub fn new(max_acks_per_packet: usize) -> Self {
        Self {
            expected_packet_tag: 0,
            next_packet_tag: 0,
            pending_acks: Vec::new(),
            in_flight: VecDeque::new(),
            max_acks_per_packet: max_acks_per_packet.max(1),
            srtt: 100.0,
            rtt_var: 50.0,
            stats: NetworkStats::default(),
        }
    }

    pub fn expected_packet_tag(&self) -> u32 {
        self.expected_packet_tag
    }

    pub fn next_packet_tag(&self) -> u32 {
        self.next_packet_tag
    }

    pub fn pending_acks(&self) -> &[u32] {
        &self.pending_acks
    }

    pub fn in_flight(&self) -> impl Iterator<Item = &InFlightPacket> {
        self.in_flight.iter()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    /// Decides whether an incoming packet may be processed.
    pub fn validate_packet(&mut self, header: &PacketHeader) -> bool {
        if header.only_contains_ack {
            return true;
        }

        let tag = header.tag;
        if tag == self.expected_packet_tag {
            self.expected_packet_tag = tag.wrapping_add(1);
            self.pending_acks.push(tag);
            self.stats.packets_received += 1;
            true
        } else if sequence_less_than(tag, self.expected_packet_tag) {
            log::trace!(
                "dropping stale packet {} (expected {})",
                tag,
                self.expected_packet_tag
            );
            self.stats.packets_stale += 1;
            false
        } else {
            log::debug!(
                "sequence gap: got {}, expected {}",
                tag,
                self.expected_packet_tag
            );
            self.expected_packet_tag = tag.wrapping_add(1);
            self.pending_acks.push(tag);
            self.stats.packets_received += 1;
            true
        }
    }

    /// Stamps the next tag on `packet` and piggybacks pending acks.
    pub fn write(&mut self, packet: &mut OutgoingPacket) {
        let header = &mut packet.packet.header;
        header.tag = self.next_packet_tag;
        header.only_contains_ack = false;
        self.next_packet_tag = self.next_packet_tag.wrapping_add(1);

        let count = self.pending_acks.len().min(self.max_acks_per_packet);
        header.ack_tags = self.pending_acks.drain(..count).collect();
    }

    /// Finalizes a packet written with [`Self::write`].
    ///
    /// Returns false when there is nothing worth sending. A packet carrying
    /// only acks hands its tag back so the sequence stays gap free.
    pub fn register_packet(&mut self, packet: &mut OutgoingPacket, now: Instant) -> bool {
        if !packet.has_payloads() {
            self.next_packet_tag = self.next_packet_tag.wrapping_sub(1);
            let header = &mut packet.packet.header;
            header.only_contains_ack = true;
            header.tag = 0;
            packet.listeners.clear();
            return !header.ack_tags.is_empty();
        }

        self.in_flight.push_back(InFlightPacket {
            tag: packet.tag(),
            dispatched_at: now,
            listeners: std::mem::take(&mut packet.listeners),
        });
        self.stats.packets_sent += 1;
        true
    }

    /// Walks the incoming ack list against the in-flight queue.
    pub fn process_acks(&mut self, ack_tags: &[u32], now: Instant) -> Vec<PacketNotification> {
        let mut notifications = Vec::new();
        let mut acks = ack_tags.iter().copied().peekable();

        while let (Some(&ack), Some(head_tag)) =
            (acks.peek(), self.in_flight.front().map(|p| p.tag))
        {
            if head_tag == ack {
                let Some(entry) = self.in_flight.pop_front() else {
                    break;
                };
                let rtt = now.saturating_duration_since(entry.dispatched_at).as_secs_f32() * 1000.0;
                self.update_rtt(rtt);
                self.stats.packets_acked += 1;
                notifications.extend(entry.notify(DeliveryOutcome::Delivered));
                acks.next();
            } else if sequence_less_than(head_tag, ack) {
                let Some(entry) = self.in_flight.pop_front() else {
                    break;
                };
                self.stats.packets_lost += 1;
                notifications.extend(entry.notify(DeliveryOutcome::Dropped));
            } else {
                acks.next();
            }
        }

        self.stats.rtt_ms = self.srtt;
        self.stats.rtt_variance = self.rtt_var;
        self.stats.update_loss();
        notifications
    }

    /// Presumes every in-flight packet older than `max_age` lost.
    pub fn expire(&mut self, now: Instant, max_age: Duration) -> Vec<PacketNotification> {
        let mut notifications = Vec::new();

        while self
            .in_flight
            .front()
            .is_some_and(|p| now.saturating_duration_since(p.dispatched_at) > max_age)
        {
            if let Some(entry) = self.in_flight.pop_front() {
                log::debug!("packet {} timed out in flight", entry.tag);
                self.stats.packets_lost += 1;
                notifications.extend(entry.notify(DeliveryOutcome::Dropped));
            }
        }

        self.stats.update_loss();
        notifications
    }

    /// Forgets all sequencing state, as after a terminal disconnect.
    pub fn reset(&mut self) {
        let max_acks = self.max_acks_per_packet;
        *self = Self::new(max_acks);
    }

    fn update_rtt(&mut self, rtt: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        let diff = (rtt - self.srtt).abs();
        self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
        self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::Payload;

    fn header(tag: u32) -> PacketHeader {
        PacketHeader::new(tag)
    }

    fn send(layer: &mut ReliabilityLayer, listener: PacketListener, now: Instant) -> u32 {
        let mut packet = OutgoingPacket::new();
        layer.write(&mut packet);
        packet.push(Payload::Disconnect);
        packet.listen(listener);
        assert!(layer.register_packet(&mut packet, now));
        packet.tag()
    }

    #[test]
    fn gap_is_accepted_and_fast_forwards() {
        let mut layer = ReliabilityLayer::new(64);

        assert!(layer.validate_packet(&header(0)));
        assert!(layer.validate_packet(&header(1)));
        assert!(layer.validate_packet(&header(3)));

        assert_eq!(layer.expected_packet_tag(), 4);
        assert_eq!(layer.pending_acks(), &[0, 1, 3]);
    }

    #[test]
    fn stale_and_duplicate_packets_dropped() {
        let mut layer = ReliabilityLayer::new(64);

        assert!(layer.validate_packet(&header(0)));
        assert!(layer.validate_packet(&header(5)));
        assert!(!layer.validate_packet(&header(5)));
        assert!(!layer.validate_packet(&header(2)));

        assert_eq!(layer.expected_packet_tag(), 6);
        assert_eq!(layer.pending_acks(), &[0, 5]);
    }

    #[test]
    fn expected_tag_never_decreases() {
        let mut layer = ReliabilityLayer::new(64);
        let mut previous = layer.expected_packet_tag();

        for tag in [0, 1, 1, 4, 2, 3, 9, 10, 7, 11] {
            let before = layer.expected_packet_tag();
            let accepted = layer.validate_packet(&header(tag));
            let after = layer.expected_packet_tag();

            assert!(!sequence_less_than(after, previous));
            if accepted {
                assert_eq!(after, tag + 1);
            } else {
                assert_eq!(after, before);
            }
            previous = after;
        }
    }

    #[test]
    fn ack_only_packet_is_always_valid() {
        let mut layer = ReliabilityLayer::new(64);
        layer.validate_packet(&header(3));

        let mut ack_only = header(0);
        ack_only.only_contains_ack = true;

        assert!(layer.validate_packet(&ack_only));
        assert_eq!(layer.expected_packet_tag(), 4);
        assert_eq!(layer.pending_acks(), &[3]);
    }

    #[test]
    fn ack_only_packet_does_not_consume_tag() {
        let mut layer = ReliabilityLayer::new(64);
        let now = Instant::now();
        layer.validate_packet(&header(0));

        let mut packet = OutgoingPacket::new();
        layer.write(&mut packet);
        assert!(layer.register_packet(&mut packet, now));

        assert!(packet.packet.header.only_contains_ack);
        assert_eq!(packet.packet.header.ack_tags, vec![0]);
        assert_eq!(layer.next_packet_tag(), 0);
        assert_eq!(layer.in_flight_count(), 0);

        let mut empty = OutgoingPacket::new();
        layer.write(&mut empty);
        assert!(!layer.register_packet(&mut empty, now));
        assert_eq!(layer.next_packet_tag(), 0);
    }

    #[test]
    fn ack_flush_respects_limit() {
        let mut layer = ReliabilityLayer::new(2);
        for tag in 0..5 {
            layer.validate_packet(&header(tag));
        }

        let mut packet = OutgoingPacket::new();
        layer.write(&mut packet);
        assert_eq!(packet.packet.header.ack_tags, vec![0, 1]);
        assert_eq!(layer.pending_acks(), &[2, 3, 4]);
    }

    #[test]
    fn ack_walk_fires_success_and_presumed_drop() {
        let mut layer = ReliabilityLayer::new(64);
        let now = Instant::now();
        for _ in 0..5 {
            send(&mut layer, PacketListener::Replication, now);
        }
        // Tags 0..=4 sent; trim to the [5, 6, 7] shape by acknowledging 0..=4 first.
        layer.process_acks(&[0, 1, 2, 3, 4], now);
        for _ in 0..3 {
            send(&mut layer, PacketListener::Replication, now);
        }

        let notifications = layer.process_acks(&[5, 7], now);

        let outcomes: Vec<(u32, DeliveryOutcome)> =
            notifications.iter().map(|n| (n.tag, n.outcome)).collect();
        assert_eq!(
            outcomes,
            vec![
                (5, DeliveryOutcome::Delivered),
                (6, DeliveryOutcome::Dropped),
                (7, DeliveryOutcome::Delivered),
            ]
        );
        assert_eq!(layer.in_flight_count(), 0);
    }

    #[test]
    fn stale_ack_is_skipped() {
        let mut layer = ReliabilityLayer::new(64);
        let now = Instant::now();
        send(&mut layer, PacketListener::Hello, now);
        send(&mut layer, PacketListener::Hello, now);
        layer.process_acks(&[0], now);

        let notifications = layer.process_acks(&[0, 1], now);
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].tag, 1);
        assert_eq!(notifications[0].outcome, DeliveryOutcome::Delivered);
    }

    #[test]
    fn every_popped_entry_fires_exactly_once_in_order() {
        let mut layer = ReliabilityLayer::new(64);
        let now = Instant::now();
        for _ in 0..10 {
            send(&mut layer, PacketListener::Replication, now);
        }

        let mut fired = Vec::new();
        fired.extend(layer.process_acks(&[1, 2, 6], now));
        fired.extend(layer.process_acks(&[4, 8, 9], now));

        let tags: Vec<u32> = fired.iter().map(|n| n.tag).collect();
        assert_eq!(tags, (0..10).collect::<Vec<_>>());
        assert!(tags.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(layer.in_flight_count(), 0);
    }

    #[test]
    fn expiry_reclaims_old_entries() {
        let mut layer = ReliabilityLayer::new(64);
        let start = Instant::now();
        send(&mut layer, PacketListener::Hello, start);
        send(
            &mut layer,
            PacketListener::Replication,
            start + Duration::from_millis(800),
        );

        let expired = layer.expire(start + Duration::from_millis(1100), Duration::from_secs(1));

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].tag, 0);
        assert_eq!(expired[0].listener, PacketListener::Hello);
        assert_eq!(expired[0].outcome, DeliveryOutcome::Dropped);
        assert_eq!(layer.in_flight_count(), 1);
    }

    #[test]
    fn rtt_sample_updates_estimate() {
        let mut layer = ReliabilityLayer::new(64);
        let start = Instant::now();
        send(&mut layer, PacketListener::Hello, start);

        layer.process_acks(&[0], start + Duration::from_millis(20));

        assert!(layer.srtt() < 100.0);
        assert!(layer.srtt() > 20.0);
    }
}
