//! The transmission control block: per-connection protocol state and the
//! handlers that drive it through the RFC793 lifecycle.
//!
//! There is one handler per protocol state, selected by a `match` on the
//! [`State`] enum; each handler consumes one [`Event`], mutates the TCB, and
//! records the side effects it wants (outgoing segments and timer
//! operations) for the connection driver to apply. Handlers never block and
//! assume exclusive access to the TCB, which the driver guarantees by
//! processing events strictly one at a time.

use crate::{
    buffer::RingBuffer,
    event::Event,
    pending::SegmentQueue,
    tcp_parsing::{TcpHeader, TcpHeaderBuilder},
    utility::Endpoints,
};
use std::{collections::BinaryHeap, sync::Arc, time::Duration};
use tokio::time::Instant;

mod reassembly;
mod receive_sequence_space;
mod retransmit;
mod segment;
mod send_sequence_space;
mod seq;
mod state;

pub use receive_sequence_space::ReceiveSequenceSpace;
pub use retransmit::{RetransmissionQueue, Transmit};
pub use segment::Segment;
pub use send_sequence_space::SendSequenceSpace;
pub use state::State;

use reassembly::OutOfOrder;
use seq::{seq_gt, seq_in_window, seq_leq, seq_lt};

/// Early segments held for reassembly before the pile gets dropped instead.
const REASSEMBLY_LIMIT: usize = 64;

/// Tuning knobs for a connection.
#[derive(Debug, Clone, Copy)]
pub struct TcpConfig {
    /// Largest payload placed in a single segment.
    pub mss: usize,
    /// Capacity of the send buffer in bytes.
    pub send_capacity: usize,
    /// Capacity of the receive buffer in bytes. Bounds the advertised
    /// window.
    pub recv_capacity: usize,
    /// Retransmission timeout before any backoff.
    pub rto_initial: Duration,
    /// Upper bound on the backed-off retransmission timeout.
    pub rto_max: Duration,
    /// How many times a single segment is retransmitted before the
    /// connection is abandoned.
    pub max_retries: u32,
    /// Persist probe interval before any backoff.
    pub probe_initial: Duration,
    /// Upper bound on the backed-off persist interval.
    pub probe_max: Duration,
    /// Maximum segment lifetime. TIME-WAIT lasts twice this.
    pub msl: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            mss: 1460,
            send_capacity: 8192,
            recv_capacity: 8192,
            rto_initial: Duration::from_millis(200),
            rto_max: Duration::from_secs(60),
            max_retries: 5,
            probe_initial: Duration::from_millis(500),
            probe_max: Duration::from_secs(60),
            msl: Duration::from_secs(30),
        }
    }
}

/// A timer action requested by a state handler and applied by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOp {
    ArmRetransmit(Duration),
    CancelRetransmit,
    ArmPersist(Duration),
    CancelPersist,
    ArmTimeWait(Duration),
}

/// What the driver should do with the connection after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventResult {
    /// Keep processing events.
    Continue,
    /// The connection is finished; release the TCB.
    CloseConnection,
}

/// The failures a connection surfaces to its caller. Everything else in the
/// protocol (malformed segments, out-of-window sequence numbers, events that
/// make no sense in the current state) is resolved where it happens and
/// never escapes the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TcpError {
    /// The retransmission retry budget ran out during the handshake or data
    /// transfer.
    #[error("the connection timed out")]
    ConnectionTimedOut,
    /// The connection is closed or its driver has terminated.
    #[error("the connection is closed")]
    ConnectionClosed,
}

/// A read-only view of the TCB, published after every processed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcbSnapshot {
    pub state: State,
    pub iss: u32,
    pub irs: u32,
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_wnd: u16,
    pub rcv_nxt: u32,
    pub rcv_wnd: u16,
    pub error: Option<TcpError>,
}

/// The bytes currently sitting in a connection's buffers, for debugging and
/// test harnesses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferSnapshot {
    pub send: Vec<u8>,
    pub recv: Vec<u8>,
}

/// What a segment's text contributed once processed.
#[derive(Debug, Default, Clone, Copy)]
struct TextOutcome {
    /// The segment carried payload bytes, new or duplicate.
    data_seen: bool,
    /// An in-order FIN was reached.
    fin: bool,
}

/// The transmission control block for one connection.
pub struct Tcb {
    id: Endpoints,
    state: State,
    snd: SendSequenceSpace,
    rcv: ReceiveSequenceSpace,
    send_buffer: RingBuffer,
    recv_buffer: RingBuffer,
    pending: Arc<SegmentQueue>,
    retransmission: RetransmissionQueue,
    reassembly: BinaryHeap<OutOfOrder>,
    /// Segments produced by handlers, drained by the driver.
    outgoing: Vec<Segment>,
    /// Timer actions requested by handlers, drained by the driver.
    timer_ops: Vec<TimerOp>,
    /// Sequence number our FIN consumed, once one has been sent.
    fin_seq: Option<u32>,
    /// The zero-window probe awaiting acknowledgment, if any.
    probe: Option<Segment>,
    rto: Duration,
    probe_interval: Duration,
    rtx_armed: bool,
    pst_armed: bool,
    error: Option<TcpError>,
    config: TcpConfig,
}

impl Tcb {
    /// Creates a closed TCB for the given connection. `iss` becomes the
    /// initial send sequence number when a handshake starts.
    pub fn new(id: Endpoints, iss: u32, config: TcpConfig) -> Self {
        Self {
            id,
            state: State::Closed,
            snd: SendSequenceSpace {
                iss,
                una: iss,
                nxt: iss,
                ..Default::default()
            },
            rcv: ReceiveSequenceSpace::default(),
            send_buffer: RingBuffer::new(config.send_capacity),
            recv_buffer: RingBuffer::new(config.recv_capacity),
            pending: Arc::new(SegmentQueue::new()),
            retransmission: RetransmissionQueue::new(),
            reassembly: BinaryHeap::new(),
            outgoing: Vec::new(),
            timer_ops: Vec::new(),
            fin_seq: None,
            probe: None,
            rto: config.rto_initial,
            probe_interval: config.probe_initial,
            rtx_armed: false,
            pst_armed: false,
            error: None,
            config,
        }
    }

    pub fn id(&self) -> Endpoints {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn error(&self) -> Option<TcpError> {
        self.error
    }

    /// The queue inbound segments should be pushed onto before submitting
    /// [`Event::PacketArrival`].
    pub fn pending(&self) -> Arc<SegmentQueue> {
        self.pending.clone()
    }

    /// Moves a closed connection into LISTEN for a passive open.
    pub fn listen(&mut self) {
        if self.state == State::Closed {
            self.set_state(State::Listen);
        } else {
            tracing::warn!(state = %self.state, "listen requested on a connection that is not closed");
        }
    }

    /// Appends application data to the send buffer, returning how many bytes
    /// were accepted. Follow with [`Event::ApplicationSend`].
    pub fn write_send(&mut self, data: &[u8]) -> usize {
        self.send_buffer.write(data)
    }

    /// Drains up to `max_len` bytes of received, in-order data. Follow with
    /// [`Event::ApplicationReceive`] so the window reopens.
    pub fn read_recv(&mut self, max_len: usize) -> Vec<u8> {
        self.recv_buffer.read(max_len)
    }

    /// Processes one event against the current state. This is the single
    /// entry point for all protocol activity.
    pub fn handle(&mut self, event: Event) -> EventResult {
        match self.state {
            State::Closed => self.closed(event),
            State::Listen => self.listening(event),
            State::SynSent => self.syn_sent(event),
            State::SynReceived => self.syn_received(event),
            State::Established => self.established(event),
            State::FinWait1 => self.fin_wait_1(event),
            State::FinWait2 => self.fin_wait_2(event),
            State::CloseWait => self.close_wait(event),
            State::Closing => self.closing(event),
            State::LastAck => self.last_ack(event),
            State::TimeWait => self.time_wait(event),
        }
    }

    /// Outgoing segments produced by handlers since the last call.
    pub fn take_outgoing(&mut self) -> Vec<Segment> {
        std::mem::take(&mut self.outgoing)
    }

    /// Timer actions requested by handlers since the last call.
    pub fn take_timer_ops(&mut self) -> Vec<TimerOp> {
        std::mem::take(&mut self.timer_ops)
    }

    pub fn snapshot(&self) -> TcbSnapshot {
        TcbSnapshot {
            state: self.state,
            iss: self.snd.iss,
            irs: self.rcv.irs,
            snd_una: self.snd.una,
            snd_nxt: self.snd.nxt,
            snd_wnd: self.snd.wnd,
            rcv_nxt: self.rcv.nxt,
            rcv_wnd: self.rcv.wnd,
            error: self.error,
        }
    }

    pub fn buffers(&self) -> BufferSnapshot {
        BufferSnapshot {
            send: self.send_buffer.peek(usize::MAX),
            recv: self.recv_buffer.peek(usize::MAX),
        }
    }

    fn closed(&mut self, event: Event) -> EventResult {
        match event {
            Event::ApplicationConnect => {
                self.snd.una = self.snd.iss;
                self.snd.nxt = self.snd.iss.wrapping_add(1);
                self.rcv.wnd = self.advertised_window();
                let syn = self.header(self.snd.iss).syn();
                if let Some(syn) = self.emit(syn, Vec::new()) {
                    self.retransmission.push(syn);
                    self.arm_retransmit();
                }
                self.set_state(State::SynSent);
                EventResult::Continue
            }
            Event::Cleanup => self.cleanup(),
            other => self.unexpected(other),
        }
    }

    fn listening(&mut self, event: Event) -> EventResult {
        match event {
            Event::PacketArrival => {
                let Some(segment) = self.pending.pop() else {
                    return EventResult::Continue;
                };
                let header = segment.header;
                if !header.ctl.syn() {
                    tracing::debug!("segment without SYN ignored in LISTEN");
                    return EventResult::Continue;
                }
                self.rcv.irs = header.seq;
                self.rcv.nxt = header.seq.wrapping_add(1);
                self.rcv.wnd = self.advertised_window();
                self.snd.una = self.snd.iss;
                self.snd.nxt = self.snd.iss.wrapping_add(1);
                self.snd.wnd = header.wnd;
                self.snd.wl1 = header.seq;
                self.snd.wl2 = header.ack;
                let syn_ack = self.header(self.snd.iss).syn().ack(self.rcv.nxt);
                if let Some(syn_ack) = self.emit(syn_ack, Vec::new()) {
                    self.retransmission.push(syn_ack);
                    self.arm_retransmit();
                }
                self.set_state(State::SynReceived);
                EventResult::Continue
            }
            Event::Cleanup => self.cleanup(),
            other => self.unexpected(other),
        }
    }

    fn syn_sent(&mut self, event: Event) -> EventResult {
        match event {
            Event::PacketArrival => {
                let Some(segment) = self.pending.pop() else {
                    return EventResult::Continue;
                };
                let header = segment.header;
                if header.ctl.ack()
                    && !(seq_lt(self.snd.iss, header.ack) && seq_leq(header.ack, self.snd.nxt))
                {
                    tracing::debug!(ack = header.ack, "unacceptable acknowledgment in SYN-SENT");
                    return EventResult::Continue;
                }
                if !header.ctl.syn() {
                    return EventResult::Continue;
                }
                self.rcv.irs = header.seq;
                self.rcv.nxt = header.seq.wrapping_add(1);
                self.snd.wnd = header.wnd;
                self.snd.wl1 = header.seq;
                self.snd.wl2 = header.ack;
                if header.ctl.ack() {
                    self.snd.una = header.ack;
                    self.retransmission.prune(self.snd.una);
                }
                if seq_gt(self.snd.una, self.snd.iss) {
                    // our SYN is acknowledged
                    self.cancel_retransmit();
                    self.rto = self.config.rto_initial;
                    self.emit_ack();
                    self.set_state(State::Established);
                    self.flush_send_buffer();
                } else {
                    // simultaneous open: answer the peer's SYN and wait for
                    // our own to be acknowledged
                    self.retransmission.clear();
                    let syn_ack = self.header(self.snd.iss).syn().ack(self.rcv.nxt);
                    if let Some(syn_ack) = self.emit(syn_ack, Vec::new()) {
                        self.retransmission.push(syn_ack);
                        self.arm_retransmit();
                    }
                    self.set_state(State::SynReceived);
                }
                EventResult::Continue
            }
            Event::TimeoutRtx => self.retransmit_timeout(),
            Event::Cleanup => self.cleanup(),
            other => self.unexpected(other),
        }
    }

    fn syn_received(&mut self, event: Event) -> EventResult {
        match event {
            Event::PacketArrival => {
                let Some(segment) = self.pending.pop() else {
                    return EventResult::Continue;
                };
                let header = segment.header;
                if header.ctl.syn() && !header.ctl.ack() {
                    // a duplicate of the SYN that opened this connection;
                    // answer it again
                    let syn_ack = self.header(self.snd.iss).syn().ack(self.rcv.nxt);
                    let _ = self.emit(syn_ack, Vec::new());
                    return EventResult::Continue;
                }
                if !header.ctl.ack() {
                    return EventResult::Continue;
                }
                if seq_leq(self.snd.una, header.ack) && seq_leq(header.ack, self.snd.nxt) {
                    self.snd.una = header.ack;
                    self.retransmission.prune(self.snd.una);
                    self.update_send_window(&header);
                    self.cancel_retransmit();
                    self.rto = self.config.rto_initial;
                    self.set_state(State::Established);
                    self.flush_send_buffer();
                    if !segment.payload.is_empty() || header.ctl.fin() {
                        // the handshake-completing segment already carries data
                        return self.established_segment(segment);
                    }
                } else {
                    tracing::debug!(
                        ack = header.ack,
                        "unacceptable acknowledgment in SYN-RECEIVED"
                    );
                }
                EventResult::Continue
            }
            Event::TimeoutRtx => self.retransmit_timeout(),
            Event::Cleanup => self.cleanup(),
            other => self.unexpected(other),
        }
    }

    fn established(&mut self, event: Event) -> EventResult {
        match event {
            Event::ApplicationSend => {
                self.flush_send_buffer();
                EventResult::Continue
            }
            Event::PacketArrival => {
                let Some(segment) = self.pending.pop() else {
                    return EventResult::Continue;
                };
                self.established_segment(segment)
            }
            Event::ApplicationReceive => {
                self.window_update();
                EventResult::Continue
            }
            Event::ApplicationClose => {
                self.send_fin();
                self.set_state(State::FinWait1);
                EventResult::Continue
            }
            Event::TimeoutRtx => self.retransmit_timeout(),
            Event::TimeoutPst => self.persist_timeout(),
            Event::Cleanup => self.cleanup(),
            other => self.unexpected(other),
        }
    }

    fn fin_wait_1(&mut self, event: Event) -> EventResult {
        match event {
            Event::PacketArrival => {
                let Some(segment) = self.pending.pop() else {
                    return EventResult::Continue;
                };
                if !self.acceptable(&segment) {
                    self.emit_ack();
                    return EventResult::Continue;
                }
                self.process_ack(&segment.header);
                let outcome = self.process_text(segment);
                if outcome.fin {
                    self.rcv.nxt = self.rcv.nxt.wrapping_add(1);
                    self.emit_ack();
                    if self.fin_acked() {
                        self.enter_time_wait();
                    } else {
                        self.set_state(State::Closing);
                    }
                } else {
                    if outcome.data_seen {
                        self.emit_ack();
                    }
                    if self.fin_acked() {
                        self.set_state(State::FinWait2);
                    }
                }
                EventResult::Continue
            }
            Event::ApplicationReceive => {
                self.window_update();
                EventResult::Continue
            }
            Event::TimeoutRtx => self.retransmit_timeout(),
            Event::TimeoutPst => self.persist_timeout(),
            Event::Cleanup => self.cleanup(),
            other => self.unexpected(other),
        }
    }

    fn fin_wait_2(&mut self, event: Event) -> EventResult {
        match event {
            Event::PacketArrival => {
                let Some(segment) = self.pending.pop() else {
                    return EventResult::Continue;
                };
                if !self.acceptable(&segment) {
                    self.emit_ack();
                    return EventResult::Continue;
                }
                self.process_ack(&segment.header);
                let outcome = self.process_text(segment);
                if outcome.fin {
                    self.rcv.nxt = self.rcv.nxt.wrapping_add(1);
                    self.emit_ack();
                    self.enter_time_wait();
                } else if outcome.data_seen {
                    self.emit_ack();
                }
                EventResult::Continue
            }
            Event::ApplicationReceive => {
                self.window_update();
                EventResult::Continue
            }
            Event::TimeoutRtx => self.retransmit_timeout(),
            Event::Cleanup => self.cleanup(),
            other => self.unexpected(other),
        }
    }

    fn close_wait(&mut self, event: Event) -> EventResult {
        match event {
            Event::ApplicationClose => {
                self.send_fin();
                self.set_state(State::LastAck);
                EventResult::Continue
            }
            Event::PacketArrival => {
                let Some(segment) = self.pending.pop() else {
                    return EventResult::Continue;
                };
                if !self.acceptable(&segment) {
                    self.emit_ack();
                    return EventResult::Continue;
                }
                self.process_ack(&segment.header);
                EventResult::Continue
            }
            Event::TimeoutRtx => self.retransmit_timeout(),
            Event::TimeoutPst => self.persist_timeout(),
            Event::Cleanup => self.cleanup(),
            other => self.unexpected(other),
        }
    }

    fn closing(&mut self, event: Event) -> EventResult {
        match event {
            Event::PacketArrival => {
                let Some(segment) = self.pending.pop() else {
                    return EventResult::Continue;
                };
                if !self.acceptable(&segment) {
                    self.emit_ack();
                    return EventResult::Continue;
                }
                self.process_ack(&segment.header);
                if self.fin_acked() {
                    self.enter_time_wait();
                }
                EventResult::Continue
            }
            Event::TimeoutRtx => self.retransmit_timeout(),
            Event::TimeoutPst => self.persist_timeout(),
            Event::Cleanup => self.cleanup(),
            other => self.unexpected(other),
        }
    }

    fn last_ack(&mut self, event: Event) -> EventResult {
        match event {
            Event::PacketArrival => {
                let Some(segment) = self.pending.pop() else {
                    return EventResult::Continue;
                };
                if !self.acceptable(&segment) {
                    self.emit_ack();
                    return EventResult::Continue;
                }
                self.process_ack(&segment.header);
                if self.fin_acked() {
                    return self.cleanup();
                }
                EventResult::Continue
            }
            Event::TimeoutRtx => self.retransmit_timeout(),
            Event::TimeoutPst => self.persist_timeout(),
            Event::Cleanup => self.cleanup(),
            other => self.unexpected(other),
        }
    }

    fn time_wait(&mut self, event: Event) -> EventResult {
        // Protocol processing is over; only the 2*MSL expiry, delivered as
        // Cleanup, does anything here.
        match event {
            Event::Cleanup => self.cleanup(),
            other => self.unexpected(other),
        }
    }

    /// Handles a segment in ESTABLISHED, and the tail of the handshake when
    /// the completing acknowledgment already carries data.
    fn established_segment(&mut self, segment: Segment) -> EventResult {
        if !self.acceptable(&segment) {
            tracing::debug!(
                seq = segment.header.seq,
                rcv_nxt = self.rcv.nxt,
                "segment outside the receive window; resending acknowledgment"
            );
            self.emit_ack();
            return EventResult::Continue;
        }
        self.process_ack(&segment.header);
        let outcome = self.process_text(segment);
        if outcome.fin {
            self.rcv.nxt = self.rcv.nxt.wrapping_add(1);
            self.emit_ack();
            self.set_state(State::CloseWait);
        } else if outcome.data_seen {
            self.emit_ack();
        }
        self.flush_send_buffer();
        EventResult::Continue
    }

    /// RFC793 acceptability: the segment must begin inside the receive
    /// window. Anything else is answered with a duplicate acknowledgment by
    /// the caller.
    fn acceptable(&self, segment: &Segment) -> bool {
        if segment.seg_len() == 0 && self.rcv.wnd == 0 {
            return segment.header.seq == self.rcv.nxt;
        }
        seq_in_window(segment.header.seq, self.rcv.nxt, self.rcv.wnd as u32)
    }

    /// Applies the acknowledgment and window fields of an arriving segment.
    fn process_ack(&mut self, header: &TcpHeader) {
        if !header.ctl.ack() {
            return;
        }
        if !(seq_leq(self.snd.una, header.ack) && seq_leq(header.ack, self.snd.nxt)) {
            tracing::debug!(ack = header.ack, "acknowledgment outside the send window");
            return;
        }
        if seq_lt(self.snd.una, header.ack) {
            self.snd.una = header.ack;
            self.retransmission.prune(self.snd.una);
            if let Some(probe) = &self.probe {
                if seq_lt(probe.header.seq, self.snd.una) {
                    self.probe = None;
                }
            }
            // fresh progress resets the backoff
            self.rto = self.config.rto_initial;
            if self.retransmission.is_empty() {
                self.cancel_retransmit();
            } else {
                self.arm_retransmit();
            }
        }
        self.update_send_window(header);
        if self.snd.wnd > 0 {
            if self.pst_armed {
                self.cancel_persist();
                self.probe_interval = self.config.probe_initial;
            }
            if let Some(probe) = self.probe.take() {
                // the probe was never accepted; send it again now that it
                // fits and let the retransmission timer watch it
                self.outgoing.push(probe.clone());
                self.retransmission.push(probe);
                if !self.rtx_armed {
                    self.arm_retransmit();
                }
            }
        } else if self.send_buffer.used() > 0 && self.retransmission.is_empty() && !self.pst_armed
        {
            self.arm_persist();
        }
    }

    /// The RFC793 window-update rule: take SEG.WND only from segments that
    /// are not older than the last one used, so a reordered acknowledgment
    /// cannot reinstate a stale window.
    fn update_send_window(&mut self, header: &TcpHeader) {
        if seq_lt(self.snd.wl1, header.seq)
            || (self.snd.wl1 == header.seq && seq_leq(self.snd.wl2, header.ack))
        {
            self.snd.wnd = header.wnd;
            self.snd.wl1 = header.seq;
            self.snd.wl2 = header.ack;
        }
    }

    /// Moves an accepted segment's payload toward the application and tracks
    /// whether an in-order FIN was reached.
    fn process_text(&mut self, segment: Segment) -> TextOutcome {
        let mut outcome = TextOutcome {
            data_seen: !segment.payload.is_empty(),
            fin: false,
        };
        if segment.payload.is_empty() && !segment.header.ctl.fin() {
            return outcome;
        }
        if segment.header.seq == self.rcv.nxt {
            self.accept_in_order(segment, &mut outcome);
            self.drain_reassembly(&mut outcome);
        } else if self.reassembly.len() < REASSEMBLY_LIMIT {
            // in-window, but a gap precedes it; hold it for reassembly
            self.reassembly.push(OutOfOrder(segment));
        } else {
            tracing::debug!("reassembly heap full; early segment dropped");
        }
        outcome
    }

    fn accept_in_order(&mut self, segment: Segment, outcome: &mut TextOutcome) {
        let written = self.recv_buffer.write(&segment.payload);
        if written < segment.payload.len() {
            tracing::warn!(
                dropped = segment.payload.len() - written,
                "receive buffer ran out of space; tail of segment dropped"
            );
        }
        self.rcv.nxt = self.rcv.nxt.wrapping_add(written as u32);
        self.rcv.wnd = self.advertised_window();
        if written > 0 {
            outcome.data_seen = true;
        }
        if segment.header.ctl.fin() && written == segment.payload.len() {
            outcome.fin = true;
        }
    }

    /// Consumes buffered early segments that the advancing window has made
    /// contiguous.
    fn drain_reassembly(&mut self, outcome: &mut TextOutcome) {
        while let Some(head) = self.reassembly.peek() {
            if seq_gt(head.0.header.seq, self.rcv.nxt) {
                break;
            }
            let Some(early) = self.reassembly.pop() else {
                break;
            };
            let mut segment = early.0;
            if seq_lt(segment.header.seq, self.rcv.nxt) {
                let duplicate = self.rcv.nxt.wrapping_sub(segment.header.seq) as usize;
                if duplicate >= segment.payload.len() {
                    continue;
                }
                segment.payload.drain(..duplicate);
                segment.header.seq = self.rcv.nxt;
            }
            self.accept_in_order(segment, outcome);
        }
    }

    /// Segmentizes send-buffer data as far as the peer's window allows.
    fn flush_send_buffer(&mut self) {
        let mut sent = false;
        loop {
            let usable = self.snd.usable_window() as usize;
            if usable == 0 || self.send_buffer.used() == 0 {
                break;
            }
            let len = usable.min(self.config.mss).min(self.send_buffer.used());
            let payload = self.send_buffer.read(len);
            let builder = self.header(self.snd.nxt).ack(self.rcv.nxt);
            match self.emit(builder, payload) {
                Some(segment) => {
                    self.snd.nxt = self.snd.nxt.wrapping_add(len as u32);
                    self.retransmission.push(segment);
                    sent = true;
                }
                None => break,
            }
        }
        if sent && !self.rtx_armed {
            self.arm_retransmit();
        }
        if self.snd.wnd == 0
            && self.send_buffer.used() > 0
            && self.retransmission.is_empty()
            && !self.pst_armed
        {
            self.arm_persist();
        }
    }

    /// Recomputes the advertised window after the application drained the
    /// receive buffer and announces it if it reopened from zero.
    fn window_update(&mut self) {
        let old = self.rcv.wnd;
        self.rcv.wnd = self.advertised_window();
        if old == 0 && self.rcv.wnd > 0 {
            self.emit_ack();
        }
    }

    /// Sends our FIN. Queued data goes out ahead of it as far as the window
    /// allows.
    fn send_fin(&mut self) {
        self.flush_send_buffer();
        let seq = self.snd.nxt;
        let builder = self.header(seq).ack(self.rcv.nxt).fin();
        if let Some(fin) = self.emit(builder, Vec::new()) {
            self.snd.nxt = self.snd.nxt.wrapping_add(1);
            self.fin_seq = Some(seq);
            self.retransmission.push(fin);
            if !self.rtx_armed {
                self.arm_retransmit();
            }
        }
    }

    fn fin_acked(&self) -> bool {
        self.fin_seq
            .map(|seq| seq_gt(self.snd.una, seq))
            .unwrap_or(false)
    }

    fn retransmit_timeout(&mut self) -> EventResult {
        self.rtx_armed = false;
        let budget = self.config.max_retries;
        let segment = match self.retransmission.oldest_mut() {
            // the acknowledgment that emptied the queue raced with the timer
            None => return EventResult::Continue,
            Some(transmit) if transmit.retries >= budget => None,
            Some(transmit) => {
                transmit.retries += 1;
                transmit.sent_at = Instant::now();
                Some(transmit.segment.clone())
            }
        };
        match segment {
            Some(segment) => {
                tracing::debug!(seq = segment.header.seq, "retransmitting oldest unacknowledged segment");
                self.outgoing.push(segment);
                self.rto = (self.rto * 2).min(self.config.rto_max);
                self.arm_retransmit();
                EventResult::Continue
            }
            None => {
                tracing::warn!("retransmission retry budget exhausted; aborting connection");
                self.abort(TcpError::ConnectionTimedOut)
            }
        }
    }

    fn persist_timeout(&mut self) -> EventResult {
        self.pst_armed = false;
        if self.snd.wnd > 0 {
            // the window opened while the timeout was in flight
            return EventResult::Continue;
        }
        if let Some(probe) = self.probe.clone() {
            self.outgoing.push(probe);
        } else {
            let byte = self.send_buffer.read(1);
            if byte.is_empty() {
                return EventResult::Continue;
            }
            let builder = self.header(self.snd.nxt).ack(self.rcv.nxt);
            match self.emit(builder, byte) {
                Some(segment) => {
                    self.snd.nxt = self.snd.nxt.wrapping_add(1);
                    self.probe = Some(segment);
                }
                None => return EventResult::Continue,
            }
        }
        self.probe_interval = (self.probe_interval * 2).min(self.config.probe_max);
        self.arm_persist();
        EventResult::Continue
    }

    fn enter_time_wait(&mut self) {
        self.cancel_retransmit();
        self.cancel_persist();
        self.timer_ops.push(TimerOp::ArmTimeWait(self.config.msl * 2));
        self.set_state(State::TimeWait);
    }

    fn abort(&mut self, error: TcpError) -> EventResult {
        self.error = Some(error);
        self.release();
        self.set_state(State::Closed);
        EventResult::CloseConnection
    }

    fn cleanup(&mut self) -> EventResult {
        self.release();
        self.set_state(State::Closed);
        EventResult::CloseConnection
    }

    fn release(&mut self) {
        self.cancel_retransmit();
        self.cancel_persist();
        self.retransmission.clear();
        self.reassembly.clear();
        self.pending.drain();
        self.send_buffer.clear();
        self.recv_buffer.clear();
        self.probe = None;
    }

    fn unexpected(&mut self, event: Event) -> EventResult {
        tracing::warn!(state = %self.state, ?event, "event not handled in this state");
        EventResult::Continue
    }

    fn set_state(&mut self, state: State) {
        tracing::debug!(id = %self.id, from = %self.state, to = %state, "state transition");
        self.state = state;
    }

    fn advertised_window(&self) -> u16 {
        self.recv_buffer.available().min(u16::MAX as usize) as u16
    }

    fn header(&self, seq: u32) -> TcpHeaderBuilder {
        TcpHeaderBuilder::new(self.id.local.port, self.id.remote.port, seq)
    }

    /// Sends a bare acknowledgment for the current receive position.
    fn emit_ack(&mut self) {
        let builder = self.header(self.snd.nxt).ack(self.rcv.nxt);
        let _ = self.emit(builder, Vec::new());
    }

    /// Finishes a header with the current advertised window, pairs it with
    /// its payload, and queues the segment for the driver to transmit.
    fn emit(&mut self, builder: TcpHeaderBuilder, payload: Vec<u8>) -> Option<Segment> {
        let built = builder.wnd(self.rcv.wnd).build(
            self.id.local.address,
            self.id.remote.address,
            &payload,
        );
        match built {
            Ok(header) => {
                let segment = Segment::new(header, payload);
                self.outgoing.push(segment.clone());
                Some(segment)
            }
            Err(error) => {
                tracing::error!(%error, "could not build an outgoing segment");
                None
            }
        }
    }

    fn arm_retransmit(&mut self) {
        self.timer_ops.push(TimerOp::ArmRetransmit(self.rto));
        self.rtx_armed = true;
        if self.pst_armed {
            self.cancel_persist();
        }
    }

    fn cancel_retransmit(&mut self) {
        if self.rtx_armed {
            self.timer_ops.push(TimerOp::CancelRetransmit);
            self.rtx_armed = false;
        }
    }

    fn arm_persist(&mut self) {
        self.timer_ops.push(TimerOp::ArmPersist(self.probe_interval));
        self.pst_armed = true;
        if self.rtx_armed {
            self.cancel_retransmit();
        }
    }

    fn cancel_persist(&mut self) {
        if self.pst_armed {
            self.timer_ops.push(TimerOp::CancelPersist);
            self.pst_armed = false;
        }
    }
}
