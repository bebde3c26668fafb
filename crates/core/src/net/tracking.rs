use std::collections::VecDeque;
use std::time::Instant;

use crate::tick::tick_greater_than as sequence_greater_than;

/// Width of the acknowledgement bitfield carried in every header.
pub const ACK_WINDOW: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    /// Fell out of the ack window without being acknowledged.
    Lost,
}

#[derive(Debug, Clone)]
pub struct PendingPacket {
    pub sequence: u32,
    pub send_time: Instant,
}

/// Sender-side view of which outbound packets the peer has seen.
#[derive(Debug)]
pub struct AckTracker {
    pending: VecDeque<PendingPacket>,
    max_pending: usize,
    srtt: f32,
    rtt_var: f32,
}

impl AckTracker {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(max_pending),
            max_pending,
            srtt: 100.0,
            rtt_var: 50.0,
        }
    }

    /// Records an outbound packet. Returns the sequence evicted as lost when
    /// the pending list is full.
    pub fn track_packet(&mut self, sequence: u32) -> Option<u32> {
        let evicted = if self.pending.len() >= self.max_pending {
            self.pending.pop_front().map(|p| p.sequence)
        } else {
            None
        };

        self.pending.push_back(PendingPacket {
            sequence,
            send_time: Instant::now(),
        });
        evicted
    }

    /// Resolves pending packets against a received ack header.
    pub fn process_ack(&mut self, ack: u32, ack_bitfield: u32) -> Vec<(u32, DeliveryOutcome)> {
        let now = Instant::now();
        let mut outcomes = Vec::new();
        let mut rtt_samples = Vec::new();

        self.pending.retain(|pending| {
            let acked = if pending.sequence == ack {
                true
            } else if sequence_greater_than(ack, pending.sequence) {
                let diff = ack.wrapping_sub(pending.sequence);
                diff <= ACK_WINDOW && ack_bitfield & (1 << (diff - 1)) != 0
            } else {
                false
            };

            if acked {
                outcomes.push((pending.sequence, DeliveryOutcome::Acked));
                rtt_samples.push(now.duration_since(pending.send_time).as_secs_f32() * 1000.0);
                return false;
            }
            if sequence_greater_than(ack, pending.sequence)
                && ack.wrapping_sub(pending.sequence) > ACK_WINDOW
            {
                outcomes.push((pending.sequence, DeliveryOutcome::Lost));
                return false;
            }
            true
        });

        for rtt in rtt_samples {
            self.update_rtt(rtt);
        }
        outcomes
    }

    fn update_rtt(&mut self, rtt: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        let diff = (rtt - self.srtt).abs();
        self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
        self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt_var
    }

    pub fn unacked_count(&self) -> usize {
        self.pending.len()
    }
}

/// Receiver-side record used to fill outbound ack headers.
#[derive(Debug, Default)]
pub struct ReceiveTracker {
    latest: Option<u32>,
    received_bitfield: u32,
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` for duplicates and for packets too old to track.
    pub fn record_received(&mut self, sequence: u32) -> bool {
        let Some(latest) = self.latest else {
            self.latest = Some(sequence);
            return true;
        };

        if sequence == latest {
            return false;
        }
        if sequence_greater_than(sequence, latest) {
            let diff = sequence.wrapping_sub(latest);
            self.received_bitfield = match diff {
                d if d < ACK_WINDOW => (self.received_bitfield << d) | (1 << (d - 1)),
                ACK_WINDOW => 1 << (ACK_WINDOW - 1),
                _ => 0,
            };
            self.latest = Some(sequence);
            return true;
        }

        let diff = latest.wrapping_sub(sequence);
        if diff > ACK_WINDOW {
            return false;
        }
        let bit = 1 << (diff - 1);
        if self.received_bitfield & bit != 0 {
            return false;
        }
        self.received_bitfield |= bit;
        true
    }

    pub fn ack_data(&self) -> (u32, u32) {
        (self.latest.unwrap_or(0), self.received_bitfield)
    }

    pub fn has_received(&self) -> bool {
        self.latest.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_after(sequences: &[u32]) -> (u32, u32) {
        let mut tracker = ReceiveTracker::new();
        for &sequence in sequences {
            tracker.record_received(sequence);
        }
        tracker.ack_data()
    }

    #[test]
    fn test_ack_header_independent_of_arrival_order() {
        assert_eq!(header_after(&[5, 6, 7]), (7, 0b11));
        assert_eq!(header_after(&[7, 5, 6]), (7, 0b11));
        assert_eq!(header_after(&[7, 5]), (7, 0b10));
    }

    #[test]
    fn test_replayed_datagrams_rejected() {
        let mut tracker = ReceiveTracker::new();
        assert!(!tracker.has_received());
        assert!(tracker.record_received(10));
        assert!(!tracker.record_received(10));
        assert!(tracker.record_received(12));
        assert!(!tracker.record_received(10));
        // beyond the window behind the newest
        assert!(!tracker.record_received(12u32.wrapping_sub(ACK_WINDOW + 1)));
    }

    #[test]
    fn test_sequence_zero_is_tracked() {
        let mut tracker = ReceiveTracker::new();
        assert!(tracker.record_received(0));
        assert!(tracker.record_received(1));
        assert_eq!(tracker.ack_data(), (1, 0b1));
    }

    #[test]
    fn test_header_ack_resolves_pending() {
        let mut tracker = AckTracker::new(32);
        assert_eq!(tracker.track_packet(1), None);
        assert_eq!(tracker.track_packet(2), None);

        let outcomes = tracker.process_ack(2, 0b1);

        assert_eq!(
            outcomes,
            vec![(1, DeliveryOutcome::Acked), (2, DeliveryOutcome::Acked)]
        );
        assert!(tracker.srtt() > 0.0);
        assert!(tracker.rtt_var() >= 0.0);
        assert_eq!(tracker.unacked_count(), 0);
    }

    #[test]
    fn test_full_pending_list_evicts_oldest() {
        let mut tracker = AckTracker::new(2);
        tracker.track_packet(1);
        tracker.track_packet(2);
        assert_eq!(tracker.track_packet(3), Some(1));
        assert_eq!(tracker.unacked_count(), 2);
    }

    #[test]
    fn test_packets_outside_window_reported_lost() {
        let mut tracker = AckTracker::new(128);
        for sequence in 0..40 {
            tracker.track_packet(sequence);
        }

        // peer saw 39 and 38 only
        let outcomes = tracker.process_ack(39, 0b1);
        let lost: Vec<u32> = outcomes
            .iter()
            .filter(|(_, o)| *o == DeliveryOutcome::Lost)
            .map(|(s, _)| *s)
            .collect();
        let acked: Vec<u32> = outcomes
            .iter()
            .filter(|(_, o)| *o == DeliveryOutcome::Acked)
            .map(|(s, _)| *s)
            .collect();

        assert_eq!(lost, (0..7).collect::<Vec<_>>());
        assert_eq!(acked, vec![38, 39]);
        assert_eq!(tracker.unacked_count(), 40 - 9);
    }
}
