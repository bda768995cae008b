use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::instance::InstanceId;
use crate::message::{Message, MessageClass};

/// Published when a channel crosses the saturated/unsaturated boundary.
/// `available` is the channel's remaining credit (peer capacity minus
/// in-flight messages); 0 means the producer should stop pushing until the
/// next status arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    pub class: MessageClass,
    pub available: u64,
}

impl QueueStatus {
    pub fn is_saturated(&self) -> bool {
        self.available == 0
    }
}

/// The higher-level network manager, as seen by a connection. It routes
/// delivered messages to handlers, supplies queue configuration, throttles
/// upstream producers based on queue statuses, and owns the reconnect policy.
///
/// Callbacks are invoked outside the connection's lock, but sequentially per
/// connection; they must not block and must not call back into the connection
/// that invoked them.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NetworkManager: Send + Sync + 'static {
    /// Maximum number of outbound messages buffered per `class` channel.
    fn get_send_queue_limit(&self, class: MessageClass) -> u64;

    /// Intake buffer size (in messages) to advertise to peers for `class`.
    fn get_receive_queue_hint(&self, class: MessageClass) -> u64;

    /// A complete application frame arrived and is ready for dispatch.
    async fn on_message_received(&self, msg: Message, from: InstanceId);

    /// A channel of the connection to `peer` crossed the saturation boundary.
    /// Intermediate edges may be coalesced; the latest one is delivered.
    async fn on_connection_status(&self, peer: InstanceId, status: QueueStatus);

    /// An established or in-progress connection to `peer` was lost. Only
    /// called for outbound instance-to-instance connections; deciding whether
    /// and when to reconnect is the manager's business.
    async fn on_disconnect(&self, peer: InstanceId);
}
