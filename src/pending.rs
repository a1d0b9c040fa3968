//! The hand-off queue between the network delivery path and a connection's
//! processing task.

use crate::tcb::Segment;
use std::collections::VecDeque;
use std::sync::Mutex;

/// A thread-safe FIFO of arrived segments awaiting protocol processing.
///
/// The network side pushes segments as they arrive; the connection's task
/// pops one per packet-arrival event. Segments come out in arrival order and
/// each is popped exactly once. The wake-up accompanying a push travels
/// through the connection's mailbox, so this lock is held only long enough
/// to mutate the queue.
#[derive(Debug, Default)]
pub struct SegmentQueue {
    segments: Mutex<VecDeque<Segment>>,
}

impl SegmentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transfers a segment into the queue.
    pub fn push(&self, segment: Segment) {
        self.segments.lock().unwrap().push_back(segment);
    }

    /// Removes and returns the segment at the head of the queue.
    pub fn pop(&self) -> Option<Segment> {
        self.segments.lock().unwrap().pop_front()
    }

    /// The number of segments waiting.
    pub fn len(&self) -> usize {
        self.segments.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discards everything still queued, returning how many segments were
    /// dropped. Used at teardown so arrivals that raced with the shutdown
    /// are thrown away rather than processed against released state.
    pub fn drain(&self) -> usize {
        let mut segments = self.segments.lock().unwrap();
        let count = segments.len();
        segments.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp_parsing::TcpHeaderBuilder;
    use crate::utility::Ipv4Address;

    fn segment(seq: u32) -> Segment {
        let header = TcpHeaderBuilder::new(1, 2, seq)
            .build(Ipv4Address::LOCALHOST, Ipv4Address::LOCALHOST, &[])
            .unwrap();
        Segment::new(header, Vec::new())
    }

    #[test]
    fn pops_in_arrival_order() {
        let queue = SegmentQueue::new();
        queue.push(segment(3));
        queue.push(segment(1));
        queue.push(segment(2));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().unwrap().header.seq, 3);
        assert_eq!(queue.pop().unwrap().header.seq, 1);
        assert_eq!(queue.pop().unwrap().header.seq, 2);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn drain_discards_everything() {
        let queue = SegmentQueue::new();
        queue.push(segment(1));
        queue.push(segment(2));
        assert_eq!(queue.drain(), 2);
        assert!(queue.is_empty());
        assert!(queue.pop().is_none());
    }
}
