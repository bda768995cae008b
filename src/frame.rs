use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

use crate::instance::{InstanceId, QueryId};
use crate::message::MessageClass;

/// Every frame on the wire - application and control alike - starts with this
/// fixed-size header so the reader can always fetch it in a single read. It is
/// followed by `record_len` bytes of the structured record part and
/// `binary_len` bytes of the optional binary part.
///
/// All numbers are in network byte order:
/// ```ascii
///  0: magic             (u16)
///  2: version           (u8)
///  3: class             (u8)  - MessageClass of this frame
///  4: message_type      (u16) - 0 reserved, 1 = flow control, >= 16 application
///  6: record_len        (u32)
/// 10: binary_len        (u64)
/// 18: source_instance   (u64)
/// 26: query_id          (u64)
/// 34: flow_observed_seq (u64) - piggybacked intake advertisement, see below
/// 42: flow_capacity     (u64)
/// ```
///
/// The two `flow_*` fields let a sender refresh its per-class intake state on
/// the back of an application frame without a dedicated control frame:
/// `flow_observed_seq` is the sender's count of frames received on `class`
/// this generation, `flow_capacity` its intake capacity for `class`. A
/// `flow_capacity` of zero means "no advertisement" (real capacities are
/// always at least 1). Generation handshakes always travel in dedicated
/// [crate::flow_control::FlowControlUpdate] frames; receivers accept both
/// forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub class: MessageClass,
    pub message_type: u16,
    pub record_len: u32,
    pub binary_len: u64,
    pub source_instance: InstanceId,
    pub query_id: QueryId,
    pub flow_observed_seq: u64,
    pub flow_capacity: u64,
}

pub const FRAME_MAGIC: u16 = 0x5DB5;
pub const FRAME_VERSION: u8 = 1;

/// Reserved message type carrying a [crate::flow_control::FlowControlUpdate]
/// in its record part.
pub const MESSAGE_TYPE_FLOW_CONTROL: u16 = 1;

/// Upper bound for the record part. Records hold structured metadata and are
/// small; anything bigger is a corrupt or hostile header.
pub const MAX_RECORD_LEN: u32 = 16 * 1024 * 1024;

/// Upper bound for the binary part (raw array data).
pub const MAX_BINARY_LEN: u64 = 1024 * 1024 * 1024;

impl FrameHeader {
    pub const SERIALIZED_LEN: usize = 50;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(FRAME_MAGIC);
        buf.put_u8(FRAME_VERSION);
        buf.put_u8(self.class.into());
        buf.put_u16(self.message_type);
        buf.put_u32(self.record_len);
        buf.put_u64(self.binary_len);
        buf.put_u64(self.source_instance.0);
        buf.put_u64(self.query_id.0);
        buf.put_u64(self.flow_observed_seq);
        buf.put_u64(self.flow_capacity);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FrameHeader> {
        let magic = buf.try_get_u16()?;
        if magic != FRAME_MAGIC {
            return Err(anyhow!("bad frame magic {:#06x}", magic));
        }
        let version = buf.try_get_u8()?;
        if version != FRAME_VERSION {
            return Err(anyhow!("unsupported frame version {}", version));
        }
        let raw_class = buf.try_get_u8()?;
        let class = MessageClass::try_from(raw_class)
            .map_err(|_| anyhow!("unknown message class {}", raw_class))?;
        let message_type = buf.try_get_u16()?;
        if message_type == 0 {
            return Err(anyhow!("reserved message type 0"));
        }
        let record_len = buf.try_get_u32()?;
        if record_len > MAX_RECORD_LEN {
            return Err(anyhow!("record part of {} bytes exceeds limit", record_len));
        }
        let binary_len = buf.try_get_u64()?;
        if binary_len > MAX_BINARY_LEN {
            return Err(anyhow!("binary part of {} bytes exceeds limit", binary_len));
        }

        Ok(FrameHeader {
            class,
            message_type,
            record_len,
            binary_len,
            source_instance: InstanceId(buf.try_get_u64()?),
            query_id: QueryId(buf.try_get_u64()?),
            flow_observed_seq: buf.try_get_u64()?,
            flow_capacity: buf.try_get_u64()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn sample_header() -> FrameHeader {
        FrameHeader {
            class: MessageClass::Normal,
            message_type: 77,
            record_len: 123,
            binary_len: 456789,
            source_instance: InstanceId(3),
            query_id: QueryId(99),
            flow_observed_seq: 12,
            flow_capacity: 64,
        }
    }

    #[rstest]
    #[case::plain(sample_header())]
    #[case::control(FrameHeader {
        class: MessageClass::None,
        message_type: MESSAGE_TYPE_FLOW_CONTROL,
        record_len: 41,
        binary_len: 0,
        source_instance: InstanceId::INVALID,
        query_id: QueryId::NONE,
        flow_observed_seq: 0,
        flow_capacity: 0,
    })]
    #[case::bulk_extremes(FrameHeader {
        class: MessageClass::Bulk,
        message_type: u16::MAX,
        record_len: MAX_RECORD_LEN,
        binary_len: MAX_BINARY_LEN,
        source_instance: InstanceId(u64::MAX - 1),
        query_id: QueryId(u64::MAX),
        flow_observed_seq: u64::MAX,
        flow_capacity: u64::MAX,
    })]
    fn test_ser_deser_round_trip(#[case] header: FrameHeader) {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.len(), FrameHeader::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        let deserialized = FrameHeader::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deserialized, header);
    }

    #[rstest]
    fn test_deser_rejects_bad_magic() {
        let mut buf = BytesMut::new();
        sample_header().ser(&mut buf);
        buf[0] = 0x00;
        assert!(FrameHeader::deser(&mut &buf[..]).is_err());
    }

    #[rstest]
    fn test_deser_rejects_bad_version() {
        let mut buf = BytesMut::new();
        sample_header().ser(&mut buf);
        buf[2] = 99;
        assert!(FrameHeader::deser(&mut &buf[..]).is_err());
    }

    #[rstest]
    fn test_deser_rejects_unknown_class() {
        let mut buf = BytesMut::new();
        sample_header().ser(&mut buf);
        buf[3] = 7;
        assert!(FrameHeader::deser(&mut &buf[..]).is_err());
    }

    #[rstest]
    fn test_deser_rejects_reserved_message_type() {
        let mut buf = BytesMut::new();
        sample_header().ser(&mut buf);
        buf[4] = 0;
        buf[5] = 0;
        assert!(FrameHeader::deser(&mut &buf[..]).is_err());
    }

    #[rstest]
    fn test_deser_rejects_oversized_record() {
        let mut header = sample_header();
        header.record_len = MAX_RECORD_LEN;
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        buf[6..10].copy_from_slice(&(MAX_RECORD_LEN + 1).to_be_bytes());
        assert!(FrameHeader::deser(&mut &buf[..]).is_err());
    }

    #[rstest]
    #[case::empty(0)]
    #[case::partial(10)]
    #[case::one_short(FrameHeader::SERIALIZED_LEN - 1)]
    fn test_deser_rejects_short_buffer(#[case] len: usize) {
        let mut buf = BytesMut::new();
        sample_header().ser(&mut buf);
        assert!(FrameHeader::deser(&mut &buf[..len]).is_err());
    }
}
