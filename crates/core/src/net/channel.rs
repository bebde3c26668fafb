use super::protocol::{Packet, PacketHeader, PacketType};
use super::tracking::{AckTracker, DeliveryOutcome, ReceiveTracker};

const MAX_PENDING: usize = 256;

/// Sequence and acknowledgement state for one remote peer.
///
/// Independent of any socket so the blocking endpoint and the async server
/// harness share it.
#[derive(Debug)]
pub struct PeerChannel {
    next_sequence: u32,
    received: ReceiveTracker,
    acks: AckTracker,
}

impl Default for PeerChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerChannel {
    pub fn new() -> Self {
        Self {
            // an empty ack header reads as "acked 0", so 0 is never sent
            next_sequence: 1,
            received: ReceiveTracker::new(),
            acks: AckTracker::new(MAX_PENDING),
        }
    }

    /// Stamps `payload` with the next sequence and current ack state.
    /// Returns the packet and any sequence pushed out of the pending list,
    /// which counts as lost.
    pub fn wrap(&mut self, payload: PacketType) -> (Packet, Vec<(u32, DeliveryOutcome)>) {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1).max(1);

        let (ack, ack_bitfield) = self.received.ack_data();
        let evicted = self
            .acks
            .track_packet(sequence)
            .map(|s| (s, DeliveryOutcome::Lost))
            .into_iter()
            .collect();
        (Packet::new(PacketHeader::new(sequence, ack, ack_bitfield), payload), evicted)
    }

    /// Processes an inbound header. `None` marks a duplicate or stale packet
    /// whose payload must be ignored.
    pub fn on_receive(&mut self, header: &PacketHeader) -> Option<Vec<(u32, DeliveryOutcome)>> {
        if !self.received.record_received(header.sequence) {
            return None;
        }
        Some(self.acks.process_ack(header.ack, header.ack_bitfield))
    }

    pub fn srtt_ms(&self) -> f32 {
        self.acks.srtt()
    }

    pub fn unacked(&self) -> usize {
        self.acks.unacked_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acks_flow_between_peers() {
        let mut a = PeerChannel::new();
        let mut b = PeerChannel::new();

        let (p1, _) = a.wrap(PacketType::Ping { timestamp: 1 });
        let (p2, _) = a.wrap(PacketType::Ping { timestamp: 2 });
        assert_eq!(b.on_receive(&p1.header), Some(vec![]));
        assert_eq!(b.on_receive(&p2.header), Some(vec![]));
        assert_eq!(b.on_receive(&p2.header), None);

        let (reply, _) = b.wrap(PacketType::Pong { timestamp: 2 });
        let outcomes = a.on_receive(&reply.header).unwrap();
        assert_eq!(
            outcomes,
            vec![
                (p1.header.sequence, DeliveryOutcome::Acked),
                (p2.header.sequence, DeliveryOutcome::Acked)
            ]
        );
        assert_eq!(a.unacked(), 0);
    }

    #[test]
    fn test_nothing_acked_before_first_receive() {
        let mut a = PeerChannel::new();
        let mut b = PeerChannel::new();
        a.wrap(PacketType::Ping { timestamp: 1 });

        let (reply, _) = b.wrap(PacketType::Disconnect);
        assert_eq!(a.on_receive(&reply.header), Some(vec![]));
        assert_eq!(a.unacked(), 1);
    }
}
