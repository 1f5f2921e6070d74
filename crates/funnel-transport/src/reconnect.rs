//! State machine + exponential backoff for automatic reconnection (§4.4).

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};

use funnel_protocol::TransportError;

use crate::config::{ConnectionState, ReconnectionPolicy};

/// A single state transition, delivered to subscribers.
#[derive(Debug, Clone)]
pub struct StateChangeEvent {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub retry_count: u32,
    /// Present only when transitioning into `Reconnecting`.
    pub next_retry_delay: Option<Duration>,
    pub error: Option<String>,
}

/// Drives one transport's [`ConnectionState`] through backoff-governed
/// reconnection attempts.
///
/// `Failed` is terminal: once reached, `on_disconnected` must not downgrade
/// the state back to `Disconnected`.
pub struct ReconnectionManager {
    state: Mutex<ConnectionState>,
    retry_count: AtomicU32,
    policy: ReconnectionPolicy,
    tx: watch::Sender<Option<StateChangeEvent>>,
    cancel: Notify,
}

impl ReconnectionManager {
    /// Builds a manager governed by `policy`, starting in `Disconnected`.
    pub fn new(policy: ReconnectionPolicy) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            retry_count: AtomicU32::new(0),
            policy,
            tx,
            cancel: Notify::new(),
        }
    }

    /// The current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// The number of reconnect attempts made since the last successful
    /// connection (or construction).
    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    /// Subscribes to state-change events. The receiver's initial value is
    /// `None` until the first transition.
    pub fn subscribe(&self) -> watch::Receiver<Option<StateChangeEvent>> {
        self.tx.subscribe()
    }

    fn transition(&self, to: ConnectionState, next_retry_delay: Option<Duration>, error: Option<String>) {
        let from = {
            let mut state = self.state.lock();
            let from = *state;
            *state = to;
            from
        };
        let _ = self.tx.send(Some(StateChangeEvent {
            from,
            to,
            retry_count: self.retry_count(),
            next_retry_delay,
            error,
        }));
    }

    /// Marks the start of a connection attempt.
    pub fn on_connecting(&self) {
        self.transition(ConnectionState::Connecting, None, None);
    }

    /// Marks a successful connection: resets the retry count and
    /// transitions to `Connected`.
    pub fn on_connected(&self) {
        self.retry_count.store(0, Ordering::SeqCst);
        self.transition(ConnectionState::Connected, None, None);
    }

    /// Marks a lost/failed connection. No-op if already `Failed`.
    pub fn on_disconnected(&self, err: Option<String>) {
        if self.state() == ConnectionState::Failed {
            return;
        }
        self.transition(ConnectionState::Disconnected, None, err);
    }

    /// Cancels any pending reconnect timer and transitions to
    /// `Disconnected`, unless already `Failed`.
    pub fn cancel(&self) {
        self.cancel.notify_waiters();
        if self.state() != ConnectionState::Failed {
            self.transition(ConnectionState::Disconnected, None, None);
        }
    }

    /// Resets retry count and state to a fresh `Disconnected`, even from
    /// `Failed`. Used when an operator explicitly re-enables a transport.
    pub fn reset(&self) {
        self.retry_count.store(0, Ordering::SeqCst);
        self.transition(ConnectionState::Disconnected, None, None);
    }

    /// Equivalent to `cancel()`; present for symmetry with the spec's
    /// lifecycle contract (no extra state is held beyond the timer).
    pub fn destroy(&self) {
        self.cancel();
    }

    /// Schedules a reconnect: increments the retry count, computes the next
    /// delay, transitions to `Reconnecting`, waits out the delay (unless
    /// cancelled), then invokes `connect_fn`.
    ///
    /// # Errors
    ///
    /// Returns the error from `connect_fn`, or a "max reconnection attempts
    /// exceeded" error once `retry_count` exceeds `policy.max_attempts`
    /// (after which the manager transitions to the terminal `Failed` state).
    pub async fn schedule_reconnect<F, Fut>(&self, connect_fn: F) -> Result<(), TransportError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), TransportError>>,
    {
        let attempt = self.retry_count.fetch_add(1, Ordering::SeqCst) + 1;

        if attempt > self.policy.max_attempts {
            let message = format!(
                "Max reconnection attempts ({}) exceeded",
                self.policy.max_attempts
            );
            self.transition(ConnectionState::Failed, None, Some(message.clone()));
            return Err(TransportError::ConnectionFailed(message));
        }

        let rand_unit = fastrand::f64() * 2.0 - 1.0;
        let delay = self.policy.jittered_delay(attempt, rand_unit);
        self.transition(ConnectionState::Reconnecting, Some(delay), None);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.cancel.notified() => {
                return Ok(());
            }
        }

        connect_fn().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn zero_jitter_policy() -> ReconnectionPolicy {
        ReconnectionPolicy {
            max_attempts: 5,
            initial_delay_ms: 1,
            backoff_multiplier: 2.0,
            max_delay_ms: 100,
            jitter_fraction: 0.0,
        }
    }

    #[tokio::test]
    async fn on_connected_resets_retry_count() {
        let mgr = ReconnectionManager::new(zero_jitter_policy());
        let _ = mgr
            .schedule_reconnect(|| async { Err(TransportError::ConnectionFailed("x".into())) })
            .await;
        assert_eq!(mgr.retry_count(), 1);
        mgr.on_connected();
        assert_eq!(mgr.retry_count(), 0);
        assert_eq!(mgr.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn exceeding_max_attempts_transitions_to_failed_and_is_terminal() {
        let policy = ReconnectionPolicy {
            max_attempts: 1,
            ..zero_jitter_policy()
        };
        let mgr = ReconnectionManager::new(policy);

        let first = mgr
            .schedule_reconnect(|| async { Err(TransportError::ConnectionFailed("x".into())) })
            .await;
        assert!(first.is_err());

        let second = mgr
            .schedule_reconnect(|| async { Ok(()) })
            .await;
        assert!(second.is_err());
        assert_eq!(mgr.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn failed_is_terminal_and_disconnect_does_not_downgrade() {
        let policy = ReconnectionPolicy {
            max_attempts: 0,
            ..zero_jitter_policy()
        };
        let mgr = ReconnectionManager::new(policy);
        let result = mgr
            .schedule_reconnect(|| async { Ok(()) })
            .await;
        assert!(result.is_err());
        assert_eq!(mgr.state(), ConnectionState::Failed);

        mgr.on_disconnected(Some("ignored".into()));
        assert_eq!(mgr.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let mgr = ReconnectionManager::new(zero_jitter_policy());
        mgr.on_connecting();
        mgr.cancel();
        mgr.cancel();
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn successful_reconnect_invokes_connect_fn_once() {
        let mgr = ReconnectionManager::new(zero_jitter_policy());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let result = mgr
            .schedule_reconnect(move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
