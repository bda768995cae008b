use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::instance::QueryId;

/// Traffic classification. Each class gets its own channel on a connection so
/// that e.g. a saturated bulk transfer cannot head-of-line-block control
/// traffic sharing the same socket.
///
/// The set of classes is closed: channels are allocated per class at
/// connection setup, and the class is a single byte on the wire.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageClass {
    /// Control traffic and anything unclassified, including heartbeats.
    None = 0,
    /// Regular query traffic.
    Normal = 1,
    /// Large data chunks.
    Bulk = 2,
}

pub const CLASS_COUNT: usize = 3;

impl MessageClass {
    pub const ALL: [MessageClass; CLASS_COUNT] =
        [MessageClass::None, MessageClass::Normal, MessageClass::Bulk];

    pub fn index(self) -> usize {
        u8::from(self) as usize
    }
}

/// Fired when a message is dropped undelivered, to abort the query that was
/// waiting on it. Handlers must be non-blocking.
pub type AbortHandler = Box<dyn FnOnce(QueryId) + Send>;

/// An opaque application message envelope: a structured record part, an
/// optional binary blob (kept as [Bytes] so large array chunks are not
/// copied), a message type tag, and optional query ownership.
///
/// The transport never interprets the record or binary bytes. It asks the
/// message for its declared class (routing to the matching channel), its size,
/// and - when the message is dropped undelivered - to abort its owning query.
pub struct Message {
    message_type: u16,
    class: MessageClass,
    query_id: QueryId,
    record: Bytes,
    binary: Option<Bytes>,
    on_abort: Option<AbortHandler>,
}

impl Message {
    pub fn new(message_type: u16, class: MessageClass, record: Bytes) -> Message {
        Message {
            message_type,
            class,
            query_id: QueryId::NONE,
            record,
            binary: None,
            on_abort: None,
        }
    }

    pub fn with_binary(mut self, binary: Bytes) -> Message {
        self.binary = Some(binary);
        self
    }

    /// Associate the message with a query. The abort handler fires (at most
    /// once) if the message is dropped undelivered, e.g. when the connection
    /// breaks or the peer turns out to have restarted.
    pub fn for_query(mut self, query_id: QueryId, on_abort: AbortHandler) -> Message {
        self.query_id = query_id;
        self.on_abort = Some(on_abort);
        self
    }

    pub(crate) fn from_wire(
        message_type: u16,
        class: MessageClass,
        query_id: QueryId,
        record: Bytes,
        binary: Option<Bytes>,
    ) -> Message {
        Message {
            message_type,
            class,
            query_id,
            record,
            binary,
            on_abort: None,
        }
    }

    pub fn message_type(&self) -> u16 {
        self.message_type
    }

    pub fn class(&self) -> MessageClass {
        self.class
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn record(&self) -> &Bytes {
        &self.record
    }

    pub fn binary(&self) -> Option<&Bytes> {
        self.binary.as_ref()
    }

    /// Payload size on the wire, excluding the frame header.
    pub fn wire_size(&self) -> usize {
        self.record.len() + self.binary.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    /// Abort the owning query (if any). Idempotent: the handler fires at most
    /// once no matter how often this is called.
    pub(crate) fn abort(&mut self) {
        if let Some(handler) = self.on_abort.take() {
            handler(self.query_id);
        }
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Message{{type:{}, class:{:?}, {:?}, record:{}B, binary:{}B}}",
            self.message_type,
            self.class,
            self.query_id,
            self.record.len(),
            self.binary.as_ref().map(|b| b.len()).unwrap_or(0),
        )
    }
}
