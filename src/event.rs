//! The discrete events a connection responds to.

/// An event delivered to a connection's state machine.
///
/// Application requests, arriving segments, and timer firings are all
/// normalized into this type. Each connection processes its events strictly
/// one at a time, so a handler may assume exclusive access to the
/// transmission control block while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The application requested an active open and the three-way handshake
    /// should begin.
    ApplicationConnect,
    /// The application queued data and the send buffer has unsent bytes.
    ApplicationSend,
    /// The application drained some of the receive buffer; the advertised
    /// window may have grown.
    ApplicationReceive,
    /// The application requested an orderly teardown.
    ApplicationClose,
    /// A validated segment is at the head of the pending queue.
    PacketArrival,
    /// The retransmission timer fired.
    TimeoutRtx,
    /// The persist timer fired while probing a zero window.
    TimeoutPst,
    /// The connection is being torn down and must release its resources.
    Cleanup,
}
