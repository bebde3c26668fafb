use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use log::debug;

use super::channel::PeerChannel;
use super::protocol::{MAX_PACKET_SIZE, Packet, PacketType};
use super::tracking::DeliveryOutcome;

const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// A received packet with the delivery outcomes its ack header resolved.
#[derive(Debug)]
pub struct Received {
    pub packet: Packet,
    pub addr: SocketAddr,
    pub outcomes: Vec<(u32, DeliveryOutcome)>,
}

/// Non-blocking UDP socket with per-peer sequencing and acks.
pub struct NetworkEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    remote_addr: Option<SocketAddr>,
    peers: HashMap<SocketAddr, PeerChannel>,
    stats: NetworkStats,
    recv_buffer: [u8; MAX_PACKET_SIZE],
    timeout: Duration,
    last_receive_time: Instant,
}

impl NetworkEndpoint {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            remote_addr: None,
            peers: HashMap::new(),
            stats: NetworkStats::default(),
            recv_buffer: [0u8; MAX_PACKET_SIZE],
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            last_receive_time: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn set_remote(&mut self, addr: SocketAddr) {
        self.remote_addr = Some(addr);
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn peer(&self, addr: &SocketAddr) -> Option<&PeerChannel> {
        self.peers.get(addr)
    }

    pub fn forget_peer(&mut self, addr: &SocketAddr) {
        self.peers.remove(addr);
    }

    /// Sends `payload` and returns the packet sequence it went out under,
    /// plus any older packet the sender stopped tracking.
    pub fn send_to(
        &mut self,
        payload: PacketType,
        addr: SocketAddr,
    ) -> io::Result<(u32, Vec<(u32, DeliveryOutcome)>)> {
        let (packet, evicted) = self.peers.entry(addr).or_default().wrap(payload);
        let data = packet
            .serialize()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        let bytes = self.socket.send_to(&data, addr)?;

        self.stats.packets_sent += 1;
        self.stats.bytes_sent += bytes as u64;
        self.stats.packets_lost += evicted.len() as u64;

        Ok((packet.header.sequence, evicted))
    }

    pub fn send(&mut self, payload: PacketType) -> io::Result<(u32, Vec<(u32, DeliveryOutcome)>)> {
        let addr = self
            .remote_addr
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "No remote address set"))?;
        self.send_to(payload, addr)
    }

    /// Drains the socket. Invalid, duplicate and stale packets are skipped.
    pub fn receive(&mut self) -> io::Result<Vec<Received>> {
        let mut received = Vec::new();

        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => {
                    let packet = match Packet::deserialize(&self.recv_buffer[..size]) {
                        Ok(packet) => packet,
                        Err(e) => {
                            debug!("dropping undecodable packet from {addr}: {e}");
                            continue;
                        }
                    };
                    received.extend(self.accept(packet, addr, size));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        Ok(received)
    }

    /// Runs a packet read off a cloned socket through the sender's ack
    /// tracking. Returns `None` for foreign, duplicate or stale packets.
    pub fn accept(&mut self, packet: Packet, addr: SocketAddr, size: usize) -> Option<Received> {
        if !packet.header.is_valid() {
            return None;
        }
        let outcomes = self.peers.entry(addr).or_default().on_receive(&packet.header)?;

        self.stats.packets_received += 1;
        self.stats.bytes_received += size as u64;
        self.stats.packets_lost += outcomes
            .iter()
            .filter(|(_, o)| *o == DeliveryOutcome::Lost)
            .count() as u64;

        self.last_receive_time = Instant::now();
        Some(Received {
            packet,
            addr,
            outcomes,
        })
    }

    /// A second handle on the socket for a dedicated receive loop.
    pub fn try_clone_socket(&self) -> io::Result<UdpSocket> {
        self.socket.try_clone()
    }

    pub fn is_timed_out(&self) -> bool {
        self.last_receive_time.elapsed() > self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}
