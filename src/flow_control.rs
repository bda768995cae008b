use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

use crate::message::MessageClass;

/// The record part of a dedicated flow-control frame
/// ([crate::frame::MESSAGE_TYPE_FLOW_CONTROL]).
///
/// All fields are named from the *receiver's* perspective: the sending side
/// fills in `peer_gen` with its own generation, `observed_local_seq` with the
/// number of frames it has received on `class` (i.e. the receiver's local
/// sequence number as observed), and so on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowControlUpdate {
    pub class: MessageClass,
    /// How many messages the sending side is willing to buffer on `class`.
    pub remote_capacity: u64,
    /// The sending side's queue generation.
    pub peer_gen: u64,
    /// The receiver's generation as last seen by the sending side
    /// (0 = never seen).
    pub our_gen_seen_by_peer: u64,
    /// The receiver's per-class sequence number as observed by the sending
    /// side, i.e. how many `class` frames it has taken off the wire.
    pub observed_local_seq: u64,
    /// The sending side's own per-class sequence number.
    pub peer_local_seq: u64,
}

impl FlowControlUpdate {
    pub const SERIALIZED_LEN: usize = size_of::<u8>() + 5 * size_of::<u64>();

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.class.into());
        buf.put_u64(self.remote_capacity);
        buf.put_u64(self.peer_gen);
        buf.put_u64(self.our_gen_seen_by_peer);
        buf.put_u64(self.observed_local_seq);
        buf.put_u64(self.peer_local_seq);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FlowControlUpdate> {
        let raw_class = buf.try_get_u8()?;
        let class = MessageClass::try_from(raw_class)
            .map_err(|_| anyhow!("unknown message class {}", raw_class))?;

        Ok(FlowControlUpdate {
            class,
            remote_capacity: buf.try_get_u64()?,
            peer_gen: buf.try_get_u64()?,
            our_gen_seen_by_peer: buf.try_get_u64()?,
            observed_local_seq: buf.try_get_u64()?,
            peer_local_seq: buf.try_get_u64()?,
        })
    }
}
