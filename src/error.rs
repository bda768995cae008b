use thiserror::Error;

use crate::message::{Message, MessageClass};

/// A send was refused because the channel's send queue or in-flight window is
/// full. Not fatal: the producer gets its message back and should retry once
/// the channel drains (it is told via a queue status publication).
#[derive(Debug, Error)]
#[error("send queue overflow on {class:?} channel")]
pub struct OverflowError {
    pub class: MessageClass,
    /// Ownership of the refused message returns to the caller.
    pub message: Message,
}

/// Errors that terminate a connection. Local recovery is limited to overflow
/// (see [OverflowError]); everything here tears the connection down, and
/// reconnecting is the only remedy.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Any socket-layer failure, EOF included.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The peer reported state inconsistent with ours, or sent a malformed
    /// frame.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}
