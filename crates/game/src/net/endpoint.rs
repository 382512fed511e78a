use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use super::protocol::{MAX_PACKET_SIZE, Packet};
use super::stats::NetworkStats;

/// Non-blocking UDP socket speaking the rkyv packet envelope.
pub struct NetworkEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    stats: NetworkStats,
    rejected: u64,
    recv_buffer: Box<[u8; MAX_PACKET_SIZE * 2]>,
}

impl NetworkEndpoint {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            stats: NetworkStats::default(),
            rejected: 0,
            recv_buffer: Box::new([0u8; MAX_PACKET_SIZE * 2]),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    /// Datagrams that failed to decode or carried a foreign header.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn send_to(&mut self, packet: &Packet, addr: SocketAddr) -> io::Result<usize> {
        let data = packet
            .serialize()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let bytes = self.socket.send_to(&data, addr)?;

        self.stats.packets_sent += 1;
        self.stats.bytes_sent += bytes as u64;

        Ok(bytes)
    }

    /// Drains every datagram currently queued on the socket.
    pub fn receive(&mut self) -> io::Result<Vec<(Packet, SocketAddr)>> {
        let mut packets = Vec::new();

        loop {
            match self.socket.recv_from(&mut self.recv_buffer[..]) {
                Ok((size, addr)) => {
                    if size > MAX_PACKET_SIZE {
                        log::debug!("dropping {} byte datagram from {}", size, addr);
                        self.rejected += 1;
                        continue;
                    }

                    match Packet::deserialize(&self.recv_buffer[..size]) {
                        Ok(packet) => {
                            self.stats.packets_received += 1;
                            self.stats.bytes_received += size as u64;
                            packets.push((packet, addr));
                        }
                        Err(e) => {
                            log::debug!("rejecting datagram from {}: {}", addr, e);
                            self.rejected += 1;
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // Windows reports an ICMP port unreachable from a previous send here.
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(packets)
    }
}
