use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::protocol::Packet;
use super::stats::PacketLossSimulation;

#[derive(Debug)]
struct DelayedPacket {
    release_time: Instant,
    order: u64,
    packet: Packet,
    addr: SocketAddr,
}

impl PartialEq for DelayedPacket {
    fn eq(&self, other: &Self) -> bool {
        self.release_time == other.release_time && self.order == other.order
    }
}

impl Eq for DelayedPacket {}

impl PartialOrd for DelayedPacket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedPacket {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap on release time.
        other
            .release_time
            .cmp(&self.release_time)
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// Fate of one packet handed to a scripted [`NetworkSimulator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkVerdict {
    Deliver,
    Drop,
    Duplicate,
}

/// Injects loss, duplication and latency between the sessions and the socket.
#[derive(Debug, Default)]
pub struct NetworkSimulator {
    default_config: Option<PacketLossSimulation>,
    configs: HashMap<SocketAddr, PacketLossSimulation>,
    script: Vec<LinkVerdict>,
    script_cursor: usize,
    queue: BinaryHeap<DelayedPacket>,
    next_order: u64,
    dropped: u64,
    duplicated: u64,
}

impl NetworkSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `config` to every address without its own override.
    pub fn with_default(config: PacketLossSimulation) -> Self {
        Self {
            default_config: config.enabled.then_some(config),
            ..Self::default()
        }
    }

    pub fn set_config(&mut self, addr: SocketAddr, config: PacketLossSimulation) {
        if config.enabled {
            self.configs.insert(addr, config);
        } else {
            self.configs.remove(&addr);
        }
    }

    /// Replaces the random loss and duplication rolls with `verdicts`,
    /// applied in turn to every enqueued packet and repeated once
    /// exhausted. Latency still comes from the address config.
    pub fn set_script(&mut self, verdicts: impl IntoIterator<Item = LinkVerdict>) {
        self.script = verdicts.into_iter().collect();
        self.script_cursor = 0;
    }

    /// Scripts the loss of every `n`th packet.
    pub fn drop_every(&mut self, n: usize) {
        self.set_script((1..=n).map(|i| {
            if i == n {
                LinkVerdict::Drop
            } else {
                LinkVerdict::Deliver
            }
        }));
    }

    pub fn config_for(&self, addr: &SocketAddr) -> Option<&PacketLossSimulation> {
        self.configs.get(addr).or(self.default_config.as_ref())
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn duplicated(&self) -> u64 {
        self.duplicated
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Queues `packet` for release, or swallows it when the script or the
    /// dice say so.
    pub fn enqueue(&mut self, packet: Packet, addr: SocketAddr, now: Instant) {
        let config = self.config_for(&addr).cloned();
        let verdict = match self.next_scripted() {
            Some(verdict) => verdict,
            None => match &config {
                Some(config) if config.should_drop() => LinkVerdict::Drop,
                Some(config) if config.should_duplicate() => LinkVerdict::Duplicate,
                _ => LinkVerdict::Deliver,
            },
        };
        let delay = || {
            config
                .as_ref()
                .map_or(Duration::ZERO, |c| Duration::from_millis(c.delay_ms() as u64))
        };

        match verdict {
            LinkVerdict::Drop => {
                log::trace!("simulated loss of packet {} to {}", packet.tag(), addr);
                self.dropped += 1;
                return;
            }
            LinkVerdict::Duplicate => {
                self.duplicated += 1;
                self.push(packet.clone(), addr, now + delay());
            }
            LinkVerdict::Deliver => {}
        }
        self.push(packet, addr, now + delay());
    }

    /// Pops every packet whose release time has passed.
    pub fn release(&mut self, now: Instant) -> Vec<(Packet, SocketAddr)> {
        let mut packets = Vec::new();
        while self.queue.peek().is_some_and(|p| p.release_time <= now) {
            if let Some(delayed) = self.queue.pop() {
                packets.push((delayed.packet, delayed.addr));
            }
        }
        packets
    }

    fn next_scripted(&mut self) -> Option<LinkVerdict> {
        let verdict = *self.script.get(self.script_cursor)?;
        self.script_cursor = (self.script_cursor + 1) % self.script.len();
        Some(verdict)
    }

    fn push(&mut self, packet: Packet, addr: SocketAddr, release_time: Instant) {
        let order = self.next_order;
        self.next_order += 1;
        self.queue.push(DelayedPacket {
            release_time,
            order,
            packet,
            addr,
        });
    }
}
