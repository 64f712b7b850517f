use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection state of one physical link
///
/// Transitions are linear (`Idle` → `Connecting` → `Connected` →
/// `Disconnecting` → `Disconnected`), except `Error`, which is reachable from
/// any state and only left through a successful reconnect or a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkConnectionState {
    /// Link created, never opened
    Idle,
    /// Transport open requested
    Connecting,
    /// Transport open, transactions may run
    Connected,
    /// Close in progress
    Disconnecting,
    /// Transport closed
    Disconnected,
    /// Transport reported a failure
    Error,
}

impl LinkConnectionState {
    /// Whether a transport open may be started from this state
    #[must_use]
    pub const fn can_open(self) -> bool {
        matches!(self, Self::Idle | Self::Disconnected | Self::Error)
    }

    /// Whether the link is closed or closing
    #[must_use]
    pub const fn is_closing_or_closed(self) -> bool {
        matches!(self, Self::Idle | Self::Disconnecting | Self::Disconnected)
    }
}

impl fmt::Display for LinkConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Lifecycle of a single command/response exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    /// Waiting for the link to become free
    Queued,
    /// Request written, waiting for the device handshake byte
    AwaitingAck,
    /// Waiting for the reply frame
    AwaitingFrame,
    /// Reply received and validated
    Completed,
    /// Rejected, timed out or cancelled
    Failed,
}

impl TransactionState {
    /// Whether the transaction currently occupies the link
    #[must_use]
    pub const fn is_outstanding(self) -> bool {
        matches!(self, Self::AwaitingAck | Self::AwaitingFrame)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "Queued"),
            Self::AwaitingAck => write!(f, "AwaitingAck"),
            Self::AwaitingFrame => write!(f, "AwaitingFrame"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Timing configuration of a device link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// How long a transport open may take, in milliseconds
    pub open_timeout_ms: u64,
    /// Response deadline for commands that carry none, in milliseconds
    pub default_timeout_ms: u64,
    /// How long `send` waits for a busy link before giving up, in milliseconds
    pub busy_timeout_ms: u64,
}

impl LinkConfig {
    /// Daum 8008 Classic over RS-232
    #[must_use]
    pub const fn daum_classic() -> Self {
        Self {
            open_timeout_ms: 5_000,
            default_timeout_ms: 2_000,
            busy_timeout_ms: 10_000,
        }
    }

    /// Daum 8i Premium over RS-232 or TCP
    #[must_use]
    pub const fn daum_premium() -> Self {
        Self {
            open_timeout_ms: 5_000,
            default_timeout_ms: 3_000,
            busy_timeout_ms: 10_000,
        }
    }

    /// Kettler ergometers over RS-232
    #[must_use]
    pub const fn kettler() -> Self {
        Self {
            open_timeout_ms: 5_000,
            default_timeout_ms: 1_500,
            busy_timeout_ms: 5_000,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            open_timeout_ms: 5_000,
            default_timeout_ms: 3_000,
            busy_timeout_ms: 10_000,
        }
    }
}

/// Bounded retry policy applied by device adapters around `send`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Pause between attempts, in milliseconds
    pub delay_ms: u64,
}

impl RetryPolicy {
    /// Policy that never retries
    #[must_use]
    pub const fn once() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_config_defaults() {
        let config = LinkConfig::default();

        assert_eq!(config.open_timeout_ms, 5_000);
        assert_eq!(config.default_timeout_ms, 3_000);
        assert_eq!(config.busy_timeout_ms, 10_000);
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_ms, 200);
        assert_eq!(RetryPolicy::once().max_attempts, 1);
    }

    #[test]
    fn test_state_predicates() {
        assert!(LinkConnectionState::Idle.can_open());
        assert!(LinkConnectionState::Error.can_open());
        assert!(!LinkConnectionState::Connecting.can_open());
        assert!(!LinkConnectionState::Connected.can_open());

        assert!(LinkConnectionState::Disconnecting.is_closing_or_closed());
        assert!(!LinkConnectionState::Error.is_closing_or_closed());

        assert!(TransactionState::AwaitingAck.is_outstanding());
        assert!(TransactionState::AwaitingFrame.is_outstanding());
        assert!(!TransactionState::Queued.is_outstanding());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(LinkConnectionState::Disconnected.to_string(), "Disconnected");
        assert_eq!(TransactionState::AwaitingAck.to_string(), "AwaitingAck");
    }
}
