//! Pluggable reconnection backoff policy

use std::time::Duration;

use crate::error::Result;

/// Why a reconnect attempt is being made
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
    /// The signaling channel closed unexpectedly
    SignalClosed,
    /// A required media transport reported failure
    TransportFailed,
    /// The server asked us to leave but allowed reconnection
    ServerLeave,
    /// Cause unknown
    Unknown,
}

impl ReconnectReason {
    /// Wire value for the reconnect query parameter
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconnectReason::SignalClosed => "signal_closed",
            ReconnectReason::TransportFailed => "transport_failed",
            ReconnectReason::ServerLeave => "server_leave",
            ReconnectReason::Unknown => "unknown",
        }
    }
}

/// Inputs to one backoff decision, constructed fresh per retry
#[derive(Debug, Clone)]
pub struct ReconnectContext {
    /// Attempts made so far in the current burst (0 on the first)
    pub retry_count: u32,
    /// Time elapsed since the burst started
    pub elapsed: Duration,
    /// Why we are reconnecting, when known
    pub reason: Option<ReconnectReason>,
    /// Endpoint the session was connected to
    pub server_url: String,
}

/// Decides how long to wait before the next reconnect attempt.
///
/// Returning `Ok(None)` stops retrying; the engine then emits a terminal
/// disconnected event and closes. A returned error also stops retrying
/// (fail closed, not open).
pub trait ReconnectPolicy: Send + Sync {
    /// Delay before the next attempt, or `None` to give up
    fn next_delay(&self, ctx: &ReconnectContext) -> Result<Option<Duration>>;
}

/// Default policy: bounded attempts with capped exponential backoff
#[derive(Debug, Clone)]
pub struct DefaultReconnectPolicy {
    /// Maximum number of reconnection attempts
    pub max_retries: u32,
    /// Initial backoff delay
    pub backoff_initial: Duration,
    /// Maximum backoff delay
    pub backoff_max: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
    /// Whether to add jitter to backoff
    pub jitter_enabled: bool,
}

impl Default for DefaultReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            backoff_initial: Duration::from_millis(300),
            backoff_max: Duration::from_secs(7),
            backoff_multiplier: 2.0,
            jitter_enabled: true,
        }
    }
}

impl DefaultReconnectPolicy {
    /// Nominal delay before jitter: the initial delay scaled once per
    /// attempt already made, saturating at the cap
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = self.backoff_initial.min(self.backoff_max);
        for _ in 0..attempt {
            delay = delay.mul_f64(self.backoff_multiplier);
            if delay >= self.backoff_max {
                return self.backoff_max;
            }
        }
        delay
    }

    /// Spread a delay by up to a quarter of its nominal value so clients
    /// that lost the same server do not retry in lockstep
    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter_enabled || delay.is_zero() {
            return delay;
        }

        let span_ms = (delay / 4).as_millis().max(1) as u64;
        delay + Duration::from_millis(jitter_ms(span_ms))
    }
}

impl ReconnectPolicy for DefaultReconnectPolicy {
    fn next_delay(&self, ctx: &ReconnectContext) -> Result<Option<Duration>> {
        if ctx.retry_count >= self.max_retries {
            return Ok(None);
        }

        // A server-initiated leave wants the client back quickly
        if ctx.reason == Some(ReconnectReason::ServerLeave) {
            return Ok(Some(Duration::ZERO));
        }

        Ok(Some(self.jittered(self.delay_for_attempt(ctx.retry_count))))
    }
}

/// Cheap jitter source: hash the clock instead of pulling in an rng
fn jitter_ms(span_ms: u64) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    hasher.finish() % span_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(retry_count: u32) -> ReconnectContext {
        ReconnectContext {
            retry_count,
            elapsed: Duration::from_secs(1),
            reason: None,
            server_url: "wss://example.com".to_string(),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = DefaultReconnectPolicy {
            jitter_enabled: false,
            ..Default::default()
        };

        let first = policy.next_delay(&ctx(0)).unwrap().unwrap();
        let second = policy.next_delay(&ctx(1)).unwrap().unwrap();
        let late = policy.next_delay(&ctx(9)).unwrap().unwrap();

        assert_eq!(first, Duration::from_millis(300));
        assert_eq!(second, Duration::from_millis(600));
        assert_eq!(late, policy.backoff_max);
    }

    #[test]
    fn test_gives_up_after_max_retries() {
        let policy = DefaultReconnectPolicy::default();
        assert!(policy.next_delay(&ctx(policy.max_retries)).unwrap().is_none());
    }

    #[test]
    fn test_server_leave_collapses_delay() {
        let policy = DefaultReconnectPolicy::default();
        let mut c = ctx(2);
        c.reason = Some(ReconnectReason::ServerLeave);
        assert_eq!(policy.next_delay(&c).unwrap(), Some(Duration::ZERO));
    }

    #[test]
    fn test_jitter_stays_bounded() {
        let policy = DefaultReconnectPolicy {
            jitter_enabled: true,
            ..Default::default()
        };
        let delay = policy.next_delay(&ctx(0)).unwrap().unwrap();
        assert!(delay >= Duration::from_millis(300));
        assert!(delay <= Duration::from_millis(375));
    }
}
