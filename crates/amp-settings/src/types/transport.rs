//! Socket and polling transport settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What the socket transport does once it has failed `afterAttempts`
/// connection attempts without ever becoming healthy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GiveUpPolicy {
    /// Keep retrying forever.
    #[default]
    Never,
    /// Stop retrying and enter the terminal given-up state.
    Stop,
    /// Emit one `giveUp` status event and keep retrying.
    Notify,
}

/// Give-up threshold and policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GiveUpSettings {
    /// Policy applied once the threshold is exceeded.
    pub policy: GiveUpPolicy,
    /// Connection attempts allowed before the policy applies.
    pub after_attempts: u32,
}

impl Default for GiveUpSettings {
    fn default() -> Self {
        Self {
            policy: GiveUpPolicy::Never,
            after_attempts: 10,
        }
    }
}

/// Persistent socket transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SocketSettings {
    /// Keepalive ping interval before the first pong.
    pub ping_interval_ms: u64,
    /// Keepalive ping interval once healthy.
    pub healthy_ping_interval_ms: u64,
    /// How long an open connection may stay without a pong.
    pub pong_timeout_ms: u64,
    /// Upper bound on the WebSocket handshake.
    pub connect_timeout_ms: u64,
    /// Backoff time unit: the delay is `2^min(attempts, cap)` units.
    pub reconnect_unit_ms: u64,
    /// Backoff exponent cap.
    pub reconnect_cap: u32,
    /// Give-up behaviour.
    pub give_up: GiveUpSettings,
}

impl Default for SocketSettings {
    fn default() -> Self {
        Self {
            ping_interval_ms: 4_000,
            healthy_ping_interval_ms: 16_000,
            pong_timeout_ms: 16_000,
            connect_timeout_ms: 10_000,
            reconnect_unit_ms: 1_000,
            reconnect_cap: 12,
            give_up: GiveUpSettings::default(),
        }
    }
}

impl SocketSettings {
    /// Pre-health ping interval.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Post-health ping interval.
    pub fn healthy_ping_interval(&self) -> Duration {
        Duration::from_millis(self.healthy_ping_interval_ms)
    }

    /// Pong watchdog window.
    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    /// Handshake timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Backoff time unit.
    pub fn reconnect_unit(&self) -> Duration {
        Duration::from_millis(self.reconnect_unit_ms)
    }
}

/// HTTP long-polling transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollingSettings {
    /// Delay before re-arming a topic after a retryable failure.
    pub retry_delay_ms: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            retry_delay_ms: 4_000,
        }
    }
}

impl PollingSettings {
    /// Retry delay.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_defaults() {
        let s = SocketSettings::default();
        assert_eq!(s.ping_interval(), Duration::from_secs(4));
        assert_eq!(s.healthy_ping_interval(), Duration::from_secs(16));
        assert_eq!(s.pong_timeout(), Duration::from_secs(16));
        assert_eq!(s.reconnect_unit(), Duration::from_secs(1));
        assert_eq!(s.reconnect_cap, 12);
        assert_eq!(s.give_up.policy, GiveUpPolicy::Never);
    }

    #[test]
    fn give_up_policy_serde() {
        let policy: GiveUpPolicy = serde_json::from_str("\"notify\"").unwrap();
        assert_eq!(policy, GiveUpPolicy::Notify);
        assert_eq!(serde_json::to_string(&GiveUpPolicy::Stop).unwrap(), "\"stop\"");
    }

    #[test]
    fn partial_socket_json() {
        let s: SocketSettings =
            serde_json::from_str(r#"{"pongTimeoutMs": 500, "giveUp": {"policy": "stop"}}"#)
                .unwrap();
        assert_eq!(s.pong_timeout_ms, 500);
        assert_eq!(s.ping_interval_ms, 4_000);
        assert_eq!(s.give_up.policy, GiveUpPolicy::Stop);
        assert_eq!(s.give_up.after_attempts, 10);
    }

    #[test]
    fn polling_defaults() {
        assert_eq!(
            PollingSettings::default().retry_delay(),
            Duration::from_secs(4)
        );
    }
}
