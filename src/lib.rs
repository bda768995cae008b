//! Per-peer connection transport for a distributed array database's
//! internode messaging layer: every instance keeps one long-lived,
//! bidirectional, framed TCP connection to each peer (and to each client),
//! delivering application messages reliably and in order while keeping
//! different traffic classes from blocking each other.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (a structured record
//!   part plus an optional binary blob), not a byte stream
//! * One peer, one socket: control, query and bulk traffic share it, each on
//!   its own channel with its own FIFO order and its own credit state, so a
//!   saturated bulk transfer never head-of-line-blocks control messages
//! * Credit-based flow control per channel: the sender throttles itself when
//!   the receiver's per-class intake buffer is full, and producers are told
//!   (via queue status publications) when to back off and when to resume
//! * Reconnects are cheap and safe: each send queue carries a generation id
//!   minted from a monotonic clock, so peers can tell a reconnect of the same
//!   process from a restart and reconcile their sequence numbers without any
//!   handshake round-trips before user data can flow
//! * Client queries attach to the connection that carries them and get
//!   notified exactly once if it goes away
//! * Policy lives upstream: routing, decoding, reconnect scheduling, queue
//!   sizing and idle detection all belong to the network manager; this crate
//!   only moves frames and enforces flow control
//!
//! ## Wire format
//!
//! Every frame starts with a fixed 50-byte header (see
//! [frame::FrameHeader]), followed by the record part and the optional
//! binary part. Flow-control state travels either in dedicated frames (the
//! record part then holds a [flow_control::FlowControlUpdate]) or
//! piggybacked in two otherwise-unused header fields of application frames;
//! receivers accept both.
//!
//! ## Non-goals
//!
//! No exactly-once delivery across process restarts: messages in flight when
//! a connection breaks are dropped and their owning queries aborted. No
//! multiplexing of independent logical sessions over one socket. No ordering
//! across channels - only within one.

mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod flow_control;
pub mod frame;
pub mod instance;
pub mod message;
mod multi_channel_queue;
pub mod network_manager;

pub use connection::{Connection, DisconnectHandler};
pub use error::{ConnectionError, OverflowError};
pub use instance::{InstanceId, QueryId};
pub use message::{Message, MessageClass};
pub use network_manager::{NetworkManager, QueueStatus};

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
