//! The per-connection driver: a task that serializes event delivery to the
//! TCB and applies the side effects its handlers request.
//!
//! Concurrency exists only at the edges. The network-delivery path, the
//! timers, and the application all hand work to the connection through its
//! mailbox or its pending queue; a single spawned task drains the mailbox,
//! owns the TCB exclusively, and runs one handler at a time. Timer firings
//! are `select!`ed from the same loop, so they can never interleave with an
//! in-progress handler for the same connection.

use crate::{
    event::Event,
    pending::SegmentQueue,
    tcb::{
        BufferSnapshot, EventResult, Segment, State, Tcb, TcbSnapshot, TcpConfig, TcpError,
        TimerOp,
    },
    timer::{ConnectionTimers, TimerKind},
    utility::Endpoints,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// How many commands may queue up before submitters are backpressured.
const MAILBOX_BACKLOG: usize = 32;

/// Messages accepted by a connection's driver task.
enum Command {
    Event(Event),
    Listen,
    Send {
        data: Vec<u8>,
        reply: oneshot::Sender<usize>,
    },
    Recv {
        max_len: usize,
        reply: oneshot::Sender<Vec<u8>>,
    },
    Inspect {
        reply: oneshot::Sender<BufferSnapshot>,
    },
}

/// A handle to one TCP connection.
///
/// Cloning the handle does not clone the connection; all clones feed the
/// same driver task. Outgoing segments are handed to the channel supplied at
/// creation, which is the network layer's side of the boundary.
#[derive(Debug, Clone)]
pub struct Connection {
    commands: mpsc::Sender<Command>,
    pending: Arc<SegmentQueue>,
    snapshot: watch::Receiver<TcbSnapshot>,
}

impl Connection {
    /// Creates a connection in CLOSED and spawns its driver task.
    pub fn new(id: Endpoints, config: TcpConfig, network: mpsc::Sender<Segment>) -> Self {
        let iss = SmallRng::from_entropy().gen();
        Self::with_iss(id, iss, config, network)
    }

    /// Like [`Connection::new`] with a caller-chosen initial sequence
    /// number, which keeps handshakes deterministic under test.
    pub fn with_iss(
        id: Endpoints,
        iss: u32,
        config: TcpConfig,
        network: mpsc::Sender<Segment>,
    ) -> Self {
        let tcb = Tcb::new(id, iss, config);
        let pending = tcb.pending();
        let (commands, mailbox) = mpsc::channel(MAILBOX_BACKLOG);
        let (snapshot_tx, snapshot) = watch::channel(tcb.snapshot());
        tokio::spawn(
            Driver {
                tcb,
                timers: ConnectionTimers::new(),
                mailbox,
                network,
                snapshot: snapshot_tx,
            }
            .run(),
        );
        Self {
            commands,
            pending,
            snapshot,
        }
    }

    /// Submits one protocol event to the connection.
    pub async fn submit(&self, event: Event) {
        if self.commands.send(Command::Event(event)).await.is_err() {
            tracing::debug!(?event, "event dropped; the connection driver is gone");
        }
    }

    /// Begins a passive open: the connection waits in LISTEN for a SYN.
    pub async fn listen(&self) {
        let _ = self.commands.send(Command::Listen).await;
    }

    /// Begins the three-way handshake. Use [`Connection::wait_for_state`] to
    /// block until it completes.
    pub async fn connect(&self) {
        self.submit(Event::ApplicationConnect).await;
    }

    /// Queues data for transmission, returning how many bytes the send
    /// buffer accepted.
    pub async fn send(&self, data: &[u8]) -> Result<usize, TcpError> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(Command::Send {
                data: data.to_vec(),
                reply,
            })
            .await
            .map_err(|_| TcpError::ConnectionClosed)?;
        answer.await.map_err(|_| TcpError::ConnectionClosed)
    }

    /// Takes up to `max_len` bytes of received, in-order data. Returns empty
    /// when nothing has arrived yet.
    pub async fn recv(&self, max_len: usize) -> Result<Vec<u8>, TcpError> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(Command::Recv { max_len, reply })
            .await
            .map_err(|_| TcpError::ConnectionClosed)?;
        answer.await.map_err(|_| TcpError::ConnectionClosed)
    }

    /// Requests an orderly close.
    pub async fn close(&self) {
        self.submit(Event::ApplicationClose).await;
    }

    /// Tears the connection down immediately, releasing its resources.
    pub async fn shutdown(&self) {
        self.submit(Event::Cleanup).await;
    }

    /// Places an inbound, already-validated segment on the pending queue and
    /// wakes the connection. Called by the network layer.
    pub async fn deliver(&self, segment: Segment) {
        self.pending.push(segment);
        if self
            .commands
            .send(Command::Event(Event::PacketArrival))
            .await
            .is_err()
        {
            // the driver is gone; whatever we just queued must not outlive it
            let dropped = self.pending.drain();
            tracing::debug!(dropped, "segments discarded after connection teardown");
        }
    }

    /// The most recently published TCB snapshot. Never blocks and never
    /// mutates connection state.
    pub fn snapshot(&self) -> TcbSnapshot {
        *self.snapshot.borrow()
    }

    /// The current contents of the send and receive buffers.
    pub async fn buffers(&self) -> Result<BufferSnapshot, TcpError> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(Command::Inspect { reply })
            .await
            .map_err(|_| TcpError::ConnectionClosed)?;
        answer.await.map_err(|_| TcpError::ConnectionClosed)
    }

    /// Waits until the connection reaches `target`, failing with the
    /// connection's recorded error if it dies first.
    pub async fn wait_for_state(&self, target: State) -> Result<(), TcpError> {
        let mut snapshot = self.snapshot.clone();
        loop {
            let current = *snapshot.borrow_and_update();
            if current.state == target {
                return Ok(());
            }
            if let Some(error) = current.error {
                return Err(error);
            }
            if snapshot.changed().await.is_err() {
                return Err(TcpError::ConnectionClosed);
            }
        }
    }
}

/// The task half of a connection: owns the TCB and everything that may
/// mutate it.
struct Driver {
    tcb: Tcb,
    timers: ConnectionTimers,
    mailbox: mpsc::Receiver<Command>,
    network: mpsc::Sender<Segment>,
    snapshot: watch::Sender<TcbSnapshot>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let result = tokio::select! {
                command = self.mailbox.recv() => match command {
                    Some(command) => self.command(command),
                    None => break,
                },
                kind = self.timers.expired() => self.expired(kind),
            };
            self.apply().await;
            if result == EventResult::CloseConnection {
                break;
            }
        }
        self.timers.clear();
    }

    fn command(&mut self, command: Command) -> EventResult {
        match command {
            Command::Event(event) => self.tcb.handle(event),
            Command::Listen => {
                self.tcb.listen();
                EventResult::Continue
            }
            Command::Send { data, reply } => {
                let written = self.tcb.write_send(&data);
                let result = self.tcb.handle(Event::ApplicationSend);
                let _ = reply.send(written);
                result
            }
            Command::Recv { max_len, reply } => {
                let data = self.tcb.read_recv(max_len);
                let result = self.tcb.handle(Event::ApplicationReceive);
                let _ = reply.send(data);
                result
            }
            Command::Inspect { reply } => {
                let _ = reply.send(self.tcb.buffers());
                EventResult::Continue
            }
        }
    }

    fn expired(&mut self, kind: TimerKind) -> EventResult {
        match kind {
            TimerKind::Retransmit => self.tcb.handle(Event::TimeoutRtx),
            TimerKind::Persist => self.tcb.handle(Event::TimeoutPst),
            TimerKind::TimeWait => self.tcb.handle(Event::Cleanup),
        }
    }

    /// Applies whatever side effects the last handler requested and
    /// publishes a fresh snapshot.
    async fn apply(&mut self) {
        for op in self.tcb.take_timer_ops() {
            match op {
                TimerOp::ArmRetransmit(after) => self.timers.arm(TimerKind::Retransmit, after),
                TimerOp::CancelRetransmit => self.timers.cancel(TimerKind::Retransmit),
                TimerOp::ArmPersist(after) => self.timers.arm(TimerKind::Persist, after),
                TimerOp::CancelPersist => self.timers.cancel(TimerKind::Persist),
                TimerOp::ArmTimeWait(after) => self.timers.arm(TimerKind::TimeWait, after),
            }
        }
        for segment in self.tcb.take_outgoing() {
            if self.network.send(segment).await.is_err() {
                tracing::debug!("network layer is gone; outgoing segment dropped");
            }
        }
        self.snapshot.send_replace(self.tcb.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utility::{Endpoint, Ipv4Address};
    use std::time::Duration;
    use tokio::time::timeout;

    const ID: Endpoints = Endpoints {
        local: Endpoint {
            address: Ipv4Address::new([10, 0, 0, 1]),
            port: 0xcafe,
        },
        remote: Endpoint {
            address: Ipv4Address::new([10, 0, 0, 2]),
            port: 0xbeef,
        },
    };

    const WAIT: Duration = Duration::from_secs(5);

    /// Two connections wired back to back: everything one transmits is
    /// delivered to the other.
    fn pair(config: TcpConfig) -> (Connection, Connection) {
        let (a_out, mut a_wire) = mpsc::channel(64);
        let (b_out, mut b_wire) = mpsc::channel(64);
        let a = Connection::with_iss(ID, 100, config, a_out);
        let b = Connection::with_iss(ID.reverse(), 300, config, b_out);

        let to_b = b.clone();
        tokio::spawn(async move {
            while let Some(segment) = a_wire.recv().await {
                to_b.deliver(segment).await;
            }
        });
        let to_a = a.clone();
        tokio::spawn(async move {
            while let Some(segment) = b_wire.recv().await {
                to_a.deliver(segment).await;
            }
        });

        (a, b)
    }

    async fn reach(connection: &Connection, state: State) {
        timeout(WAIT, connection.wait_for_state(state))
            .await
            .expect("state was not reached in time")
            .expect("connection failed");
    }

    #[tokio::test]
    async fn active_open_establishes_both_sides() {
        let (a, b) = pair(TcpConfig::default());
        b.listen().await;
        a.connect().await;
        reach(&a, State::Established).await;
        reach(&b, State::Established).await;

        let a_snap = a.snapshot();
        assert_eq!(a_snap.snd_una, 101);
        assert_eq!(a_snap.rcv_nxt, 301);
        // the handshake carried both buffer capacities
        assert_eq!(a_snap.snd_wnd, 8192);
        let b_snap = b.snapshot();
        assert_eq!(b_snap.snd_una, 301);
        assert_eq!(b_snap.rcv_nxt, 101);
        assert_eq!(b_snap.snd_wnd, 8192);
    }

    #[tokio::test]
    async fn data_round_trip() {
        let (a, b) = pair(TcpConfig::default());
        b.listen().await;
        a.connect().await;
        reach(&a, State::Established).await;

        assert_eq!(a.send(b"ping").await.unwrap(), 4);
        let received = timeout(WAIT, async {
            loop {
                let data = b.recv(64).await.unwrap();
                if !data.is_empty() {
                    return data;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(received, b"ping");

        assert_eq!(b.send(b"pong").await.unwrap(), 4);
        let replied = timeout(WAIT, async {
            loop {
                let data = a.recv(64).await.unwrap();
                if !data.is_empty() {
                    return data;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(replied, b"pong");
    }

    #[tokio::test]
    async fn graceful_close_reaches_closed_on_both_sides() {
        let config = TcpConfig {
            msl: Duration::from_millis(20),
            ..TcpConfig::default()
        };
        let (a, b) = pair(config);
        b.listen().await;
        a.connect().await;
        reach(&a, State::Established).await;
        reach(&b, State::Established).await;

        a.close().await;
        reach(&b, State::CloseWait).await;
        b.close().await;

        // the passive closer leaves through LAST-ACK, the active one waits
        // out 2*MSL in TIME-WAIT
        reach(&b, State::Closed).await;
        reach(&a, State::Closed).await;
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_retry_budget_surfaces_timeout() {
        // no peer: the SYN goes nowhere and the retry budget runs out
        let (out, _wire) = mpsc::channel(64);
        let config = TcpConfig {
            rto_initial: Duration::from_millis(10),
            max_retries: 2,
            ..TcpConfig::default()
        };
        let lonely = Connection::with_iss(ID, 100, config, out);
        lonely.connect().await;
        let result = lonely.wait_for_state(State::Established).await;
        assert_eq!(result, Err(TcpError::ConnectionTimedOut));
        assert_eq!(lonely.snapshot().state, State::Closed);
    }

    #[tokio::test]
    async fn buffer_introspection_sees_undelivered_data() {
        let (a, b) = pair(TcpConfig::default());
        b.listen().await;
        a.connect().await;
        reach(&a, State::Established).await;

        a.send(b"inspectable").await.unwrap();
        let received = timeout(WAIT, async {
            loop {
                let buffers = b.buffers().await.unwrap();
                if !buffers.recv.is_empty() {
                    return buffers.recv;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(received, b"inspectable");
        // the bytes are still there: introspection must not consume them
        assert_eq!(b.recv(64).await.unwrap(), b"inspectable");
    }

    #[tokio::test]
    async fn delivery_after_shutdown_is_discarded() {
        let (a, b) = pair(TcpConfig::default());
        b.listen().await;
        a.connect().await;
        reach(&a, State::Established).await;

        b.shutdown().await;
        reach(&b, State::Closed).await;
        // the driver is gone; this must neither panic nor hang
        a.send(b"into the void").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
