//! Shared data model: connection state, reconnection policy, transport
//! configuration, and auth headers (§3).

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The lifecycle state of one transport instance. `Failed` is terminal —
/// nothing transitions out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Backoff policy for reconnection attempts.
///
/// `next_delay(k) = clamp(initial * multiplier^(k-1), .., max) * (1 ± jitter)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectionPolicy {
    /// Maximum number of reconnect attempts before transitioning to `Failed`.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay on each subsequent attempt. Must be
    /// greater than 1.
    pub backoff_multiplier: f64,
    /// Upper bound on the computed delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Fractional jitter applied as `delay * (1 ± U(0, jitter_fraction))`.
    pub jitter_fraction: f64,
}

impl ReconnectionPolicy {
    /// A policy tuned for fast recovery: short delays, many attempts.
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 250,
            backoff_multiplier: 1.5,
            max_delay_ms: 5_000,
            jitter_fraction: 0.2,
        }
    }

    /// A policy tuned to avoid hammering a flaky upstream.
    pub fn conservative() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter_fraction: 0.1,
        }
    }

    /// No reconnection at all: any disconnect goes straight to `Failed`.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            initial_delay_ms: 0,
            backoff_multiplier: 1.0,
            max_delay_ms: 0,
            jitter_fraction: 0.0,
        }
    }

    /// Computes the deterministic (jitter-free) delay for 1-indexed attempt
    /// `attempt`, clamped to `max_delay_ms`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exp);
        let clamped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(clamped as u64)
    }

    /// Applies `±jitter_fraction` jitter to `base`, using `rand_unit` (a
    /// caller-supplied value in `[-1.0, 1.0]`) rather than sampling
    /// internally, so callers can pass `0.0` for deterministic tests.
    pub fn jittered_delay(&self, attempt: u32, rand_unit: f64) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        let jitter = base * self.jitter_fraction * rand_unit.clamp(-1.0, 1.0);
        Duration::from_millis((base + jitter).max(0.0) as u64)
    }
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self::conservative()
    }
}

/// Per-transport-type wire configuration (§3's tagged `TransportConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "kebab-case")]
pub enum TransportConfig {
    /// Spawn a child process and speak newline-delimited JSON-RPC over its
    /// stdio.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Server-Sent Events, paired with an HTTP POST channel for outbound
    /// requests.
    Sse {
        url: String,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
        #[serde(default)]
        reconnect: ReconnectionPolicy,
        #[serde(default)]
        auth: Option<AuthConfig>,
    },
    /// WebSocket, `ws://` or `wss://` only.
    WebSocket {
        url: String,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
        #[serde(default)]
        reconnect: ReconnectionPolicy,
        #[serde(default)]
        ping_interval_ms: Option<u64>,
        #[serde(default)]
        auth: Option<AuthConfig>,
    },
    /// Streamable HTTP: each send is a POST, correlated by
    /// `Mcp-Session-Id`.
    StreamableHttp {
        url: String,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
        #[serde(default)]
        reconnect: ReconnectionPolicy,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        auth: Option<AuthConfig>,
        /// See `DESIGN.md`'s Open Question resolution: when `true`, open a
        /// dedicated GET stream for server-initiated events instead of
        /// piggybacking on the response stream.
        #[serde(default)]
        dedicated_event_stream: bool,
    },
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// Static bearer credentials attached to every outgoing request/upgrade on a
/// transport, independent of the inbound-facing `InboundAuthValidator`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub token: String,
}

/// A header→value map carried by the caller and merged onto outgoing
/// requests. Transports must never fold these into URLs or query strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthHeaders(HashMap<String, String>);

impl AuthHeaders {
    /// An empty header set.
    pub fn new() -> Self {
        Self::default()
    }

    /// A single `Authorization: Bearer <token>` header.
    pub fn bearer(token: impl Into<String>) -> Self {
        let mut map = HashMap::new();
        map.insert("Authorization".to_string(), format!("Bearer {}", token.into()));
        Self(map)
    }

    /// Merges `self` onto `caller_headers`, with `self` winning on
    /// collision for the `Authorization` key (per §4.6's security rule).
    pub fn merge_onto(&self, caller_headers: &mut HashMap<String, String>) {
        for (key, value) in &self.0 {
            caller_headers.insert(key.clone(), value.clone());
        }
    }

    /// Iterates the header pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_monotonic_growth_with_zero_jitter() {
        let policy = ReconnectionPolicy {
            max_attempts: 5,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 3000,
            jitter_fraction: 0.0,
        };
        let delays: Vec<u64> = (1..=5)
            .map(|k| policy.jittered_delay(k, 0.0).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 3000, 3000, 3000]);
    }

    #[test]
    fn jitter_is_bounded_by_fraction() {
        let policy = ReconnectionPolicy {
            max_attempts: 5,
            initial_delay_ms: 1000,
            backoff_multiplier: 1.0,
            max_delay_ms: 1000,
            jitter_fraction: 0.1,
        };
        let low = policy.jittered_delay(1, -1.0).as_millis();
        let high = policy.jittered_delay(1, 1.0).as_millis();
        assert_eq!(low, 900);
        assert_eq!(high, 1100);
    }

    #[test]
    fn auth_headers_override_caller_on_collision() {
        let mut caller = HashMap::new();
        caller.insert("Authorization".to_string(), "Bearer caller-token".to_string());
        caller.insert("X-Custom".to_string(), "keep-me".to_string());

        let auth = AuthHeaders::bearer("server-token");
        auth.merge_onto(&mut caller);

        assert_eq!(caller.get("Authorization").unwrap(), "Bearer server-token");
        assert_eq!(caller.get("X-Custom").unwrap(), "keep-me");
    }
}
