//! Protocol limits

use std::time::Duration;

/// Bounds applied by the ratchet engine and session records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// Largest counter gap a single message may skip on one receiving chain
    pub max_forward_jumps: u32,

    /// Capacity of the per-session skipped message key cache
    pub max_message_keys: usize,

    /// Receiving chains kept per session before the oldest is dropped
    pub max_receiver_chains: usize,

    /// Archived session states kept per remote address
    pub max_archived_states: usize,

    /// Archived session states older than this are pruned
    pub archived_state_max_age: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_forward_jumps: 25_000,
            max_message_keys: 2_000,
            max_receiver_chains: 5,
            max_archived_states: 40,
            archived_state_max_age: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

impl ProtocolConfig {
    /// Tighter limits for constrained devices
    pub fn strict() -> Self {
        Self {
            max_forward_jumps: 2_000,
            max_message_keys: 500,
            max_receiver_chains: 5,
            max_archived_states: 10,
            archived_state_max_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProtocolConfig::default();
        assert_eq!(config.max_forward_jumps, 25_000);
        assert_eq!(config.max_message_keys, 2_000);
        assert_eq!(config.max_archived_states, 40);
    }

    #[test]
    fn test_strict_config() {
        let config = ProtocolConfig::strict();
        let default = ProtocolConfig::default();
        assert!(config.max_forward_jumps < default.max_forward_jumps);
        assert!(config.archived_state_max_age < default.archived_state_max_age);
    }
}
