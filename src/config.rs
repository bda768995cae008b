use anyhow::bail;
use rustc_hash::FxHashMap;

use crate::message::{MessageClass, CLASS_COUNT};
use crate::network_manager::NetworkManager;

/// Per-class queue sizing, with a default and per-class overrides (bulk
/// channels typically get deeper intake buffers than control channels).
///
/// A network manager implementation would usually answer its
/// `get_send_queue_limit` / `get_receive_queue_hint` calls from an instance of
/// this struct.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum number of outbound messages buffered per channel; this also
    /// caps the unacknowledged in-flight window.
    pub default_send_queue_limit: u64,
    pub specific_send_queue_limits: FxHashMap<MessageClass, u64>,

    /// Intake buffer size advertised to peers, per channel, in messages.
    pub default_receive_queue_hint: u64,
    pub specific_receive_queue_hints: FxHashMap<MessageClass, u64>,
}

impl TransportConfig {
    pub fn new() -> TransportConfig {
        // the receive hint should stay above the send limit: credit is
        // consumed at enqueue time, so a window as small as the send buffer
        // can pin queued messages behind unacknowledged ones
        TransportConfig {
            default_send_queue_limit: 64,
            specific_send_queue_limits: FxHashMap::default(),
            default_receive_queue_hint: 128,
            specific_receive_queue_hints: FxHashMap::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_send_queue_limit == 0 {
            bail!("send queue limit must be at least 1");
        }
        if self.default_receive_queue_hint == 0 {
            bail!("receive queue hint must be at least 1");
        }
        for (&class, &limit) in &self.specific_send_queue_limits {
            if limit == 0 {
                bail!("send queue limit for {:?} must be at least 1", class);
            }
        }
        for (&class, &hint) in &self.specific_receive_queue_hints {
            if hint == 0 {
                bail!("receive queue hint for {:?} must be at least 1", class);
            }
        }
        Ok(())
    }

    pub fn send_queue_limit(&self, class: MessageClass) -> u64 {
        *self
            .specific_send_queue_limits
            .get(&class)
            .unwrap_or(&self.default_send_queue_limit)
    }

    pub fn receive_queue_hint(&self, class: MessageClass) -> u64 {
        *self
            .specific_receive_queue_hints
            .get(&class)
            .unwrap_or(&self.default_receive_queue_hint)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The per-class limits a connection actually runs with, resolved once at
/// connection setup from the network manager's configuration.
#[derive(Debug, Clone)]
pub struct QueueLimits {
    pub send_limits: [u64; CLASS_COUNT],
    pub receive_hints: [u64; CLASS_COUNT],
}

impl QueueLimits {
    /// Values of 0 are clamped to 1: a channel that can never hold a message
    /// or never receive one would wedge the connection.
    pub fn from_manager(network_manager: &dyn NetworkManager) -> QueueLimits {
        let mut send_limits = [1u64; CLASS_COUNT];
        let mut receive_hints = [1u64; CLASS_COUNT];
        for class in MessageClass::ALL {
            send_limits[class.index()] = network_manager.get_send_queue_limit(class).max(1);
            receive_hints[class.index()] = network_manager.get_receive_queue_hint(class).max(1);
        }
        QueueLimits {
            send_limits,
            receive_hints,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn test_defaults_are_valid() {
        let config = TransportConfig::new();
        config.validate().unwrap();
        assert_eq!(config.send_queue_limit(MessageClass::Normal), 64);
        assert_eq!(config.receive_queue_hint(MessageClass::Bulk), 128);
    }

    #[rstest]
    fn test_specific_overrides() {
        let mut config = TransportConfig::new();
        config.specific_send_queue_limits.insert(MessageClass::Bulk, 8);
        config.specific_receive_queue_hints.insert(MessageClass::Bulk, 256);

        assert_eq!(config.send_queue_limit(MessageClass::Bulk), 8);
        assert_eq!(config.send_queue_limit(MessageClass::Normal), 64);
        assert_eq!(config.receive_queue_hint(MessageClass::Bulk), 256);
        assert_eq!(config.receive_queue_hint(MessageClass::None), 128);
    }

    #[rstest]
    fn test_validate_rejects_zero_limits() {
        let mut config = TransportConfig::new();
        config.default_send_queue_limit = 0;
        assert!(config.validate().is_err());

        let mut config = TransportConfig::new();
        config.specific_receive_queue_hints.insert(MessageClass::None, 0);
        assert!(config.validate().is_err());
    }
}
