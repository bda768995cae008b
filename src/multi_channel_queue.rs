use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace, warn};

use crate::channel::Channel;
use crate::config::QueueLimits;
use crate::error::{ConnectionError, OverflowError};
use crate::flow_control::FlowControlUpdate;
use crate::message::{Message, MessageClass, CLASS_COUNT};
use crate::network_manager::QueueStatus;

/// A send queue with one parallel FIFO channel per [MessageClass]. FIFO order
/// is per channel; the channels are drained round-robin, one message per
/// call, so no class can starve another.
///
/// The queue also owns the generation handshake that reconciles sequence
/// numbers after either side restarts: `local_gen` is minted from a monotonic
/// clock when the queue is created, so a peer comparing generations can tell
/// a reconnect of the same process from a restart.
pub(crate) struct MultiChannelQueue {
    channels: [Channel; CLASS_COUNT],
    curr_class: usize,
    active_count: usize,
    total_size: u64,
    local_gen: u64,
    remote_gen: u64,
}

impl MultiChannelQueue {
    pub fn new(limits: &QueueLimits) -> MultiChannelQueue {
        MultiChannelQueue {
            channels: MessageClass::ALL.map(|class| {
                Channel::new(
                    class,
                    limits.send_limits[class.index()],
                    limits.receive_hints[class.index()],
                )
            }),
            curr_class: MessageClass::None.index(),
            active_count: 0,
            total_size: 0,
            local_gen: next_gen_id(),
            remote_gen: 0,
        }
    }

    pub fn local_gen(&self) -> u64 {
        self.local_gen
    }

    pub fn remote_gen(&self) -> u64 {
        self.remote_gen
    }

    pub fn size(&self) -> u64 {
        self.total_size
    }

    pub fn is_active(&self) -> bool {
        debug_assert!(self.active_count <= CLASS_COUNT);
        self.active_count > 0
    }

    pub fn available(&self, class: MessageClass) -> u64 {
        self.channels[class.index()].available()
    }

    pub fn local_seq(&self, class: MessageClass) -> u64 {
        self.channels[class.index()].local_seq()
    }

    pub fn remote_seq(&self, class: MessageClass) -> u64 {
        self.channels[class.index()].remote_seq()
    }

    /// Append a message to the channel for `class`.
    pub fn push_back(
        &mut self,
        class: MessageClass,
        msg: Message,
    ) -> Result<Option<QueueStatus>, OverflowError> {
        let idx = class.index();
        let was_active = self.channels[idx].is_active();

        let status = self.channels[idx].push_back(msg)?;
        self.total_size += 1;
        if !was_active && self.channels[idx].is_active() {
            self.active_count += 1;
        }
        Ok(status)
    }

    /// Dequeue the next transmittable message, scanning the channels
    /// round-robin starting after the previously drained class.
    pub fn pop_front(&mut self) -> (Option<Message>, Option<QueueStatus>) {
        if self.active_count == 0 {
            return (None, None);
        }

        for step in 1..=CLASS_COUNT {
            let idx = (self.curr_class + step) % CLASS_COUNT;
            if !self.channels[idx].is_active() {
                continue;
            }

            let (msg, status) = self.channels[idx].pop_front();
            debug_assert!(msg.is_some());
            if msg.is_some() {
                self.total_size -= 1;
            }
            if !self.channels[idx].is_active() {
                self.active_count -= 1;
            }
            self.curr_class = idx;
            return (msg, status);
        }

        debug_assert!(false, "active_count is {} but no channel is active", self.active_count);
        (None, None)
    }

    /// Apply a flow-control update from the peer. This is where restarts are
    /// detected and stale frames from previous lives are filtered out.
    pub fn set_remote_state(
        &mut self,
        update: &FlowControlUpdate,
    ) -> Result<Option<QueueStatus>, ConnectionError> {
        // a frame from a previous life of the peer
        if update.peer_gen < self.remote_gen {
            trace!("flow-control update for old peer generation {} - discarding", update.peer_gen);
            return Ok(None);
        }

        // the peer refers to a previous life of ours (0 = it has not seen any
        // generation of ours yet, which is fine on first contact)
        if update.our_gen_seen_by_peer != 0 && update.our_gen_seen_by_peer < self.local_gen {
            trace!("flow-control update refers to our previous generation {} - discarding", update.our_gen_seen_by_peer);
            return Ok(None);
        }
        if update.our_gen_seen_by_peer > self.local_gen {
            return Err(ConnectionError::ProtocolViolation(format!(
                "peer claims to have seen our generation {} which was never minted (local is {})",
                update.our_gen_seen_by_peer, self.local_gen,
            )));
        }

        if update.peer_gen > self.remote_gen {
            if self.remote_gen == 0 {
                debug!("adopting peer generation {}", update.peer_gen);
                self.remote_gen = update.peer_gen;
            }
            else {
                self.on_peer_restart(update.peer_gen);
            }
        }

        let idx = update.class.index();
        if !self.channels[idx].validate_remote_state(update.observed_local_seq) {
            return Err(ConnectionError::ProtocolViolation(format!(
                "peer claims to have seen {} messages on the {:?} channel, but only {} were ever sent",
                update.observed_local_seq,
                update.class,
                self.channels[idx].local_seq(),
            )));
        }

        let was_active = self.channels[idx].is_active();
        let status = self.channels[idx].set_remote_state(
            update.remote_capacity,
            update.observed_local_seq,
            update.peer_local_seq,
        );
        match (was_active, self.channels[idx].is_active()) {
            (false, true) => self.active_count += 1,
            (true, false) => self.active_count -= 1,
            _ => {}
        }
        Ok(status)
    }

    /// The peer came back with a fresh generation: everything buffered for its
    /// previous life is undeliverable and the per-channel sequence counters
    /// start over.
    fn on_peer_restart(&mut self, peer_gen: u64) {
        warn!(
            "peer restarted (generation {} -> {}), dropping {} pending messages",
            self.remote_gen, peer_gen, self.total_size,
        );

        for channel in &mut self.channels {
            channel.abort_messages();
            channel.reset_sequences();
        }
        self.total_size = 0;
        self.active_count = 0;
        self.remote_gen = peer_gen;
    }

    /// Exchange queue contents with `other`. Used on teardown: the connection
    /// swaps in a freshly built queue (new generation, clean credit) and
    /// aborts whatever was left in the old one.
    pub fn swap(&mut self, other: &mut MultiChannelQueue) {
        std::mem::swap(self, other);
    }

    /// Drain every channel through its abort path.
    pub fn abort_messages(&mut self) -> usize {
        let mut aborted = 0;
        for channel in &mut self.channels {
            aborted += channel.abort_messages();
        }
        self.total_size = 0;
        self.active_count = 0;
        aborted
    }

    #[cfg(test)]
    pub fn channel_state(&self, class: MessageClass) -> (u64, u64, usize) {
        let channel = &self.channels[class.index()];
        (channel.local_seq(), channel.available(), channel.queue_len())
    }
}

/// Generation ids come from a monotonic clock (nanosecond resolution), never
/// from the wall clock: they only ever need to be comparable between two
/// lives of the same host, and must not jump backwards with clock
/// adjustments. The atomic max makes them strictly increasing within one
/// process no matter how quickly queues are created.
pub(crate) fn next_gen_id() -> u64 {
    static LAST: AtomicU64 = AtomicU64::new(0);

    let raw = monotonic_nanos();
    let mut prev = LAST.load(Ordering::Relaxed);
    loop {
        let next = raw.max(prev + 1);
        match LAST.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

#[cfg(unix)]
fn monotonic_nanos() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        // cannot happen for CLOCK_MONOTONIC; the atomic max in next_gen_id
        // keeps ids strictly increasing regardless
        return 0;
    }
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(not(unix))]
fn monotonic_nanos() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static PROCESS_START: OnceLock<Instant> = OnceLock::new();
    PROCESS_START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use bytes::Bytes;
    use rstest::rstest;

    use crate::instance::QueryId;

    use super::*;

    fn limits(send_limit: u64, receive_hint: u64) -> QueueLimits {
        QueueLimits {
            send_limits: [send_limit; CLASS_COUNT],
            receive_hints: [receive_hint; CLASS_COUNT],
        }
    }

    fn msg(message_type: u16) -> Message {
        Message::new(message_type, MessageClass::Normal, Bytes::new())
    }

    fn abortable_msg(counter: &Arc<AtomicUsize>) -> Message {
        let counter = counter.clone();
        msg(1).for_query(
            QueryId(3),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    fn update(class: MessageClass, queue: &MultiChannelQueue) -> FlowControlUpdate {
        FlowControlUpdate {
            class,
            remote_capacity: 8,
            peer_gen: 1,
            our_gen_seen_by_peer: queue.local_gen(),
            observed_local_seq: 0,
            peer_local_seq: 0,
        }
    }

    #[rstest]
    fn test_round_robin_across_classes() {
        // n1, n2 on Normal, then b1, b2 on Bulk - the wire order interleaves
        let mut queue = MultiChannelQueue::new(&limits(8, 8));
        queue.push_back(MessageClass::Normal, msg(1)).unwrap();
        queue.push_back(MessageClass::Normal, msg(2)).unwrap();
        queue.push_back(MessageClass::Bulk, msg(3)).unwrap();
        queue.push_back(MessageClass::Bulk, msg(4)).unwrap();
        assert_eq!(queue.size(), 4);

        let mut order = Vec::new();
        while let (Some(popped), _) = queue.pop_front() {
            order.push(popped.message_type());
        }
        assert_eq!(order, vec![1, 3, 2, 4]);
        assert_eq!(queue.size(), 0);
        assert!(!queue.is_active());
    }

    #[rstest]
    fn test_saturated_channel_is_skipped() {
        // bulk credit of 1 is used up by the first push; the normal channel
        // must keep making progress regardless
        let mut queue = MultiChannelQueue::new(&QueueLimits {
            send_limits: [8; CLASS_COUNT],
            receive_hints: [8, 8, 1],
        });
        queue.push_back(MessageClass::Bulk, msg(10)).unwrap();
        queue.push_back(MessageClass::Bulk, msg(11)).unwrap();
        queue.push_back(MessageClass::Normal, msg(20)).unwrap();
        queue.push_back(MessageClass::Normal, msg(21)).unwrap();

        let mut order = Vec::new();
        while let (Some(popped), _) = queue.pop_front() {
            order.push(popped.message_type());
        }
        assert_eq!(order, vec![20, 21]);

        // a capacity grant for bulk re-enables that channel only
        let mut ack = update(MessageClass::Bulk, &queue);
        ack.remote_capacity = 3;
        queue.set_remote_state(&ack).unwrap();

        let (popped, _) = queue.pop_front();
        assert_eq!(popped.unwrap().message_type(), 10);
        let (popped, _) = queue.pop_front();
        assert_eq!(popped.unwrap().message_type(), 11);
        assert!(!queue.is_active());
    }

    #[rstest]
    fn test_active_count_and_size_match_channels() {
        let mut queue = MultiChannelQueue::new(&limits(4, 10));
        assert!(!queue.is_active());

        queue.push_back(MessageClass::None, msg(1)).unwrap();
        queue.push_back(MessageClass::Bulk, msg(2)).unwrap();
        queue.push_back(MessageClass::Bulk, msg(3)).unwrap();
        queue.push_back(MessageClass::Bulk, msg(4)).unwrap();
        assert_eq!(queue.size(), 4);
        assert_eq!(queue.active_count, 2);

        let _ = queue.pop_front();
        let _ = queue.pop_front();
        let _ = queue.pop_front();
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.active_count, 1);

        let expected_active = MessageClass::ALL
            .iter()
            .filter(|&&c| {
                let (_, available, queued) = queue.channel_state(c);
                available > 0 && queued > 0
            })
            .count();
        assert_eq!(queue.active_count, expected_active);
    }

    #[rstest]
    fn test_peer_restart_aborts_and_resets() {
        let aborted = Arc::new(AtomicUsize::new(0));
        let mut queue = MultiChannelQueue::new(&limits(8, 8));
        for _ in 0..5 {
            queue
                .push_back(MessageClass::Normal, abortable_msg(&aborted))
                .unwrap();
        }

        // first contact
        queue.set_remote_state(&update(MessageClass::Normal, &queue)).unwrap();
        assert_eq!(queue.remote_gen(), 1);
        assert_eq!(aborted.load(Ordering::SeqCst), 0);

        // the peer comes back with a higher generation
        let mut restart = update(MessageClass::Normal, &queue);
        restart.peer_gen = 2;
        restart.our_gen_seen_by_peer = 0;
        queue.set_remote_state(&restart).unwrap();

        assert_eq!(aborted.load(Ordering::SeqCst), 5);
        assert_eq!(queue.remote_gen(), 2);
        assert_eq!(queue.size(), 0);
        let (local_seq, _, queued) = queue.channel_state(MessageClass::Normal);
        assert_eq!(local_seq, 0);
        assert_eq!(queued, 0);

        // sequence numbers restart under the new generation
        queue.push_back(MessageClass::Normal, msg(1)).unwrap();
        assert_eq!(queue.local_seq(MessageClass::Normal), 1);
    }

    #[rstest]
    fn test_stale_update_is_dropped_silently() {
        let mut queue = MultiChannelQueue::new(&limits(8, 4));
        queue.push_back(MessageClass::Normal, msg(1)).unwrap();
        queue.set_remote_state(&update(MessageClass::Normal, &queue)).unwrap();

        // refers to a generation of ours from before this queue existed
        let mut stale = update(MessageClass::Normal, &queue);
        stale.our_gen_seen_by_peer = queue.local_gen() - 1;
        stale.remote_capacity = 1000;
        stale.observed_local_seq = 1;

        let status = queue.set_remote_state(&stale).unwrap();
        assert_eq!(status, None);
        // capacity stays at the 8 granted on first contact, minus one in flight
        assert_eq!(queue.available(MessageClass::Normal), 7);
    }

    #[rstest]
    fn test_old_peer_generation_is_dropped_silently() {
        let mut queue = MultiChannelQueue::new(&limits(8, 4));
        let mut first = update(MessageClass::Normal, &queue);
        first.peer_gen = 7;
        queue.set_remote_state(&first).unwrap();

        let mut old = update(MessageClass::Normal, &queue);
        old.peer_gen = 3;
        old.remote_capacity = 1000;
        assert_eq!(queue.set_remote_state(&old).unwrap(), None);
        assert_eq!(queue.remote_gen(), 7);
    }

    #[rstest]
    fn test_inconsistent_observed_seq_is_a_protocol_violation() {
        let mut queue = MultiChannelQueue::new(&limits(8, 4));
        for _ in 0..3 {
            queue.push_back(MessageClass::Normal, msg(1)).unwrap();
        }

        let mut bad = update(MessageClass::Normal, &queue);
        bad.observed_local_seq = 10;
        let result = queue.set_remote_state(&bad);
        assert!(matches!(result, Err(ConnectionError::ProtocolViolation(_))));
    }

    #[rstest]
    fn test_future_local_generation_is_a_protocol_violation() {
        let mut queue = MultiChannelQueue::new(&limits(8, 4));
        let mut bad = update(MessageClass::Normal, &queue);
        bad.our_gen_seen_by_peer = queue.local_gen() + 1;
        assert!(matches!(
            queue.set_remote_state(&bad),
            Err(ConnectionError::ProtocolViolation(_))
        ));
    }

    #[rstest]
    fn test_swap_preserves_contents_and_generations_increase() {
        let mut first = MultiChannelQueue::new(&limits(8, 8));
        first.push_back(MessageClass::Normal, msg(1)).unwrap();

        let mut second = MultiChannelQueue::new(&limits(8, 8));
        assert!(second.local_gen() > first.local_gen());

        let first_gen = first.local_gen();
        first.swap(&mut second);

        assert_eq!(first.size(), 0);
        assert_eq!(second.size(), 1);
        assert_eq!(second.local_gen(), first_gen);
    }

    #[rstest]
    fn test_gen_ids_strictly_increase() {
        let mut previous = next_gen_id();
        for _ in 0..1000 {
            let next = next_gen_id();
            assert!(next > previous);
            previous = next;
        }
    }

    #[rstest]
    fn test_abort_messages_drains_everything() {
        let aborted = Arc::new(AtomicUsize::new(0));
        let mut queue = MultiChannelQueue::new(&limits(8, 8));
        queue.push_back(MessageClass::None, abortable_msg(&aborted)).unwrap();
        queue.push_back(MessageClass::Normal, abortable_msg(&aborted)).unwrap();
        queue.push_back(MessageClass::Bulk, abortable_msg(&aborted)).unwrap();

        assert_eq!(queue.abort_messages(), 3);
        assert_eq!(aborted.load(Ordering::SeqCst), 3);
        assert_eq!(queue.size(), 0);
        assert!(!queue.is_active());
    }
}
