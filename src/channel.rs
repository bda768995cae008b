use std::collections::VecDeque;

use crate::error::OverflowError;
use crate::message::{Message, MessageClass};
use crate::network_manager::QueueStatus;

/// A FIFO stream of pending outbound messages for one traffic class, with the
/// credit state needed to decide when its head may go on the wire.
///
/// Admission (push) is bounded by the local `send_limit` alone; transmission
/// (pop) additionally requires credit from the peer. The split lets a producer
/// keep buffering through a brief peer stall while the transport refuses to
/// transmit into a full intake buffer.
///
/// Sequence numbers count pushes since the owning queue's current generation
/// began. `local_seq_on_peer` trails `local_seq` by however many messages the
/// peer has not yet acknowledged via flow-control updates.
pub(crate) struct Channel {
    class: MessageClass,
    remote_capacity: u64,
    local_seq: u64,
    remote_seq: u64,
    local_seq_on_peer: u64,
    send_limit: u64,
    queue: VecDeque<Message>,
}

impl Channel {
    pub fn new(class: MessageClass, send_limit: u64, initial_remote_capacity: u64) -> Channel {
        Channel {
            class,
            remote_capacity: initial_remote_capacity.max(1),
            local_seq: 0,
            remote_seq: 0,
            local_seq_on_peer: 0,
            send_limit: send_limit.max(1),
            queue: VecDeque::new(),
        }
    }

    pub fn local_seq(&self) -> u64 {
        self.local_seq
    }

    pub fn remote_seq(&self) -> u64 {
        self.remote_seq
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn in_flight(&self) -> u64 {
        debug_assert!(self.local_seq >= self.local_seq_on_peer);
        self.local_seq - self.local_seq_on_peer
    }

    /// Remaining credit: how many more messages the peer is willing to take.
    pub fn available(&self) -> u64 {
        self.remote_capacity.saturating_sub(self.in_flight())
    }

    /// Is there a message ready to go on the wire?
    pub fn is_active(&self) -> bool {
        self.available() > 0 && !self.queue.is_empty()
    }

    /// Append a message. Fails with the message handed back if either the
    /// queue or the unacknowledged window has hit `send_limit`.
    pub fn push_back(&mut self, msg: Message) -> Result<Option<QueueStatus>, OverflowError> {
        if self.queue_len() as u64 >= self.send_limit
            || self.local_seq - self.local_seq_on_peer >= self.send_limit
        {
            return Err(OverflowError {
                class: self.class,
                message: msg,
            });
        }

        let space_before = self.available();
        self.queue.push_back(msg);
        self.local_seq += 1;
        Ok(self.new_status(space_before))
    }

    /// Dequeue the head message if the channel is active. `local_seq` is not
    /// touched here - it was counted at push time.
    pub fn pop_front(&mut self) -> (Option<Message>, Option<QueueStatus>) {
        if !self.is_active() {
            return (None, None);
        }
        let space_before = self.available();
        let msg = self.queue.pop_front();
        (msg, self.new_status(space_before))
    }

    /// Apply a flow-control update from the peer. Sequence numbers only move
    /// forward; regressions from a reordered or stale update are ignored.
    pub fn set_remote_state(
        &mut self,
        remote_capacity: u64,
        observed_local_seq: u64,
        peer_local_seq: u64,
    ) -> Option<QueueStatus> {
        let space_before = self.available();

        self.remote_capacity = remote_capacity.max(1);
        if observed_local_seq > self.local_seq_on_peer {
            self.local_seq_on_peer = observed_local_seq;
        }
        if peer_local_seq > self.remote_seq {
            self.remote_seq = peer_local_seq;
        }

        self.new_status(space_before)
    }

    /// The peer cannot have observed more messages than we ever sent; a claim
    /// to the contrary means the two sides disagree about which conversation
    /// they are having.
    pub fn validate_remote_state(&self, observed_local_seq: u64) -> bool {
        self.local_seq >= observed_local_seq
    }

    /// Drop all queued messages, aborting their owning queries. Sequence
    /// numbers are untouched - they only reset on a generation change.
    pub fn abort_messages(&mut self) -> usize {
        let count = self.queue.len();
        while let Some(mut msg) = self.queue.pop_front() {
            msg.abort();
        }
        count
    }

    pub fn reset_sequences(&mut self) {
        self.local_seq = 0;
        self.local_seq_on_peer = 0;
        self.remote_seq = 0;
    }

    /// A status is minted only when the available credit crosses 0 in either
    /// direction; everything in between is not an edge.
    fn new_status(&self, space_before: u64) -> Option<QueueStatus> {
        let space_after = self.available();
        if (space_before == 0) != (space_after == 0) {
            Some(QueueStatus {
                class: self.class,
                available: space_after,
            })
        }
        else {
            None
        }
    }
}
