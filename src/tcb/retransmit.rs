use super::seq::seq_leq;
use super::Segment;
use std::collections::VecDeque;
use tokio::time::Instant;

/// A segment on the retransmission queue along with its bookkeeping.
#[derive(Debug, Clone)]
pub struct Transmit {
    pub segment: Segment,
    /// When the segment was last handed to the network layer.
    pub sent_at: Instant,
    /// How many times the segment has been retransmitted.
    pub retries: u32,
}

impl Transmit {
    pub fn new(segment: Segment) -> Self {
        Self {
            segment,
            sent_at: Instant::now(),
            retries: 0,
        }
    }
}

/// Sent-but-unacknowledged segments, oldest first.
///
/// Never contains a segment that the peer has fully acknowledged: `prune`
/// drops entries as soon as the acknowledgment number passes their end.
#[derive(Debug, Default)]
pub struct RetransmissionQueue {
    segments: VecDeque<Transmit>,
}

impl RetransmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a freshly sent segment.
    pub fn push(&mut self, segment: Segment) {
        self.segments.push_back(Transmit::new(segment));
    }

    /// Drops every segment fully covered by the acknowledgment number.
    pub fn prune(&mut self, una: u32) {
        while let Some(front) = self.segments.front() {
            if seq_leq(front.segment.seq_end(), una) {
                self.segments.pop_front();
            } else {
                break;
            }
        }
    }

    /// The oldest unacknowledged segment, due first for retransmission.
    pub fn oldest_mut(&mut self) -> Option<&mut Transmit> {
        self.segments.front_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp_parsing::TcpHeaderBuilder;
    use crate::utility::Ipv4Address;

    fn data_segment(seq: u32, len: usize) -> Segment {
        let payload = vec![0u8; len];
        let header = TcpHeaderBuilder::new(1, 2, seq)
            .ack(0)
            .build(Ipv4Address::LOCALHOST, Ipv4Address::LOCALHOST, &payload)
            .unwrap();
        Segment::new(header, payload)
    }

    #[test]
    fn prune_drops_only_fully_acknowledged_segments() {
        let mut queue = RetransmissionQueue::new();
        queue.push(data_segment(100, 10));
        queue.push(data_segment(110, 10));
        queue.push(data_segment(120, 10));

        // covers the first segment exactly
        queue.prune(110);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.oldest_mut().unwrap().segment.header.seq, 110);

        // mid-segment acknowledgment leaves the straddled segment queued
        queue.prune(115);
        assert_eq!(queue.len(), 2);

        queue.prune(130);
        assert!(queue.is_empty());
    }

    #[test]
    fn prune_handles_sequence_wraparound() {
        let mut queue = RetransmissionQueue::new();
        queue.push(data_segment(u32::MAX - 4, 10));
        queue.prune(u32::MAX - 1);
        assert_eq!(queue.len(), 1);
        // the segment's end wrapped past zero
        queue.prune(6);
        assert!(queue.is_empty());
    }
}
