//! A user-space implementation of the [Transmission Control
//! Protocol](https://www.rfc-editor.org/rfc/rfc9293.html): per-connection
//! state machines that drive sockets through the RFC793 lifecycle in
//! response to application requests, arriving segments, and timer firings.
//!
//! The crate owns the protocol core only. A surrounding daemon is expected
//! to multiplex connections and carry application socket calls; a network
//! layer is expected to move serialized segments between hosts. Both attach
//! at the [`Connection`] handle: the daemon submits events and reads state,
//! the network layer delivers validated inbound segments and drains an
//! outbound channel.
//!
//! # Organization
//!
//! - [`tcb`] holds the per-connection protocol state (sequence spaces,
//!   buffers, retransmission queue) and one handler per protocol state
//! - [`connection`] runs a task per connection that serializes event
//!   delivery and applies the side effects handlers request
//! - [`tcp_parsing`] builds and validates segment headers
//! - [`buffer`], [`pending`], and [`timer`] are the supporting mechanics:
//!   the byte rings behind the send and receive windows, the hand-off queue
//!   for arrived segments, and the cancellable connection timers

pub mod buffer;
pub mod connection;
pub mod event;
pub mod pending;
pub mod tcb;
pub mod tcp_parsing;
pub mod timer;
pub mod utility;

pub use connection::Connection;
pub use event::Event;
pub use tcb::{BufferSnapshot, Segment, State, Tcb, TcbSnapshot, TcpConfig, TcpError};
pub use utility::{Endpoint, Endpoints, Ipv4Address};
