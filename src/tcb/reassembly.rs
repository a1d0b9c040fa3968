use super::seq::seq_lt;
use super::Segment;
use std::cmp::Ordering;

/// A segment held aside because it arrived ahead of the data that precedes
/// it. The ordering is reversed so a max-heap yields the lowest sequence
/// number first.
#[derive(Debug, Clone)]
pub struct OutOfOrder(pub Segment);

impl PartialEq for OutOfOrder {
    fn eq(&self, other: &Self) -> bool {
        self.0.header.seq == other.0.header.seq
    }
}

impl Eq for OutOfOrder {}

impl PartialOrd for OutOfOrder {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OutOfOrder {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.0.header.seq == other.0.header.seq {
            Ordering::Equal
        } else if seq_lt(self.0.header.seq, other.0.header.seq) {
            Ordering::Greater
        } else {
            Ordering::Less
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp_parsing::TcpHeaderBuilder;
    use crate::utility::Ipv4Address;
    use std::collections::BinaryHeap;

    fn segment(seq: u32) -> Segment {
        let header = TcpHeaderBuilder::new(1, 2, seq)
            .build(Ipv4Address::LOCALHOST, Ipv4Address::LOCALHOST, &[])
            .unwrap();
        Segment::new(header, Vec::new())
    }

    #[test]
    fn heap_yields_lowest_sequence_first() {
        let mut heap = BinaryHeap::new();
        heap.push(OutOfOrder(segment(300)));
        heap.push(OutOfOrder(segment(100)));
        heap.push(OutOfOrder(segment(200)));

        assert_eq!(heap.pop().unwrap().0.header.seq, 100);
        assert_eq!(heap.pop().unwrap().0.header.seq, 200);
        assert_eq!(heap.pop().unwrap().0.header.seq, 300);
    }

    #[test]
    fn ordering_respects_wraparound() {
        let mut heap = BinaryHeap::new();
        heap.push(OutOfOrder(segment(5)));
        heap.push(OutOfOrder(segment(u32::MAX - 5)));

        // the pre-wrap sequence number comes out first
        assert_eq!(heap.pop().unwrap().0.header.seq, u32::MAX - 5);
        assert_eq!(heap.pop().unwrap().0.header.seq, 5);
    }
}
