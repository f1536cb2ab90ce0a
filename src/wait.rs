//! Poll-until helpers.
//!
//! Keyguard dismissal and credential propagation complete asynchronously with
//! respect to the caller, so every state-dependent step goes through
//! [`wait_until`] with a human-readable description that ends up in the
//! timeout error.

use serde::Deserialize;
use std::{convert::Infallible, thread, time::Duration};
use thiserror::Error;
use tracing::{trace, warn};

/// A polled condition was not observed within its attempt budget.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("condition `{description}` not met after {attempts} attempts")]
pub struct ConditionTimeout {
    pub description: String,
    pub attempts: u32,
}

/// How long and how often to poll.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct WaitPolicy {
    pub max_attempts: u32,
    pub interval_ms: u64,
    pub max_interval_ms: u64,
    /// Multiplier applied to the sleep after each failed attempt. `1.0` polls
    /// at a fixed interval.
    pub backoff_factor: f32,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            interval_ms: 100,
            max_interval_ms: 2_000,
            backoff_factor: 1.5,
        }
    }
}

impl WaitPolicy {
    /// Poll `max_attempts` times without sleeping. Meant for simulated devices.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            interval_ms: 0,
            max_interval_ms: 0,
            backoff_factor: 1.0,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Sleep inserted after failed attempt `attempt` (zero-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = if self.backoff_factor.is_finite() && self.backoff_factor >= 1.0 {
            self.backoff_factor
        } else {
            1.0
        };
        let cap_ms = self.max_interval_ms.max(self.interval_ms);
        let scaled_ms = self.interval_ms as f64 * f64::from(factor).powi(attempt as i32);
        Duration::from_millis(scaled_ms.min(cap_ms as f64).round() as u64)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Call `condition` until it returns `true`, passing the zero-based attempt
/// number.
///
/// The predicate may perform corrective side effects keyed on the attempt
/// number (for example pressing Back once a bouncer has had time to appear);
/// callers document those effects at the call site.
///
/// Returns the number of attempts used. After `policy.max_attempts`
/// consecutive `false` results the predicate has been called exactly that many
/// times and [`ConditionTimeout`] is returned. Sleeps only between attempts.
pub fn wait_until<F>(
    description: &str,
    policy: &WaitPolicy,
    mut condition: F,
) -> Result<u32, ConditionTimeout>
where
    F: FnMut(u32) -> bool,
{
    match poll(description, policy, |attempt| Ok::<_, Infallible>(condition(attempt))) {
        Ok(used) => Ok(used),
        Err(PollFailure::Timeout(t)) => Err(t),
        Err(PollFailure::Predicate(never)) => match never {},
    }
}

/// Outcome of [`try_wait_until`] when the condition was not met.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error(transparent)]
    Timeout(#[from] ConditionTimeout),
    /// The predicate failed; the wait stops on the first such error.
    #[error("while waiting for `{description}`: {source:#}")]
    Predicate {
        description: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Fallible form of [`wait_until`]. A predicate error aborts the wait
/// immediately and is not retried.
pub fn try_wait_until<F>(
    description: &str,
    policy: &WaitPolicy,
    condition: F,
) -> Result<u32, WaitError>
where
    F: FnMut(u32) -> anyhow::Result<bool>,
{
    poll(description, policy, condition).map_err(|failure| match failure {
        PollFailure::Timeout(t) => WaitError::Timeout(t),
        PollFailure::Predicate(source) => WaitError::Predicate {
            description: description.to_string(),
            source,
        },
    })
}

enum PollFailure<E> {
    Timeout(ConditionTimeout),
    Predicate(E),
}

fn poll<F, E>(
    description: &str,
    policy: &WaitPolicy,
    mut condition: F,
) -> Result<u32, PollFailure<E>>
where
    F: FnMut(u32) -> Result<bool, E>,
{
    let attempts = policy.attempts();
    for attempt in 0..attempts {
        trace!(description, attempt, "polling");
        if condition(attempt).map_err(PollFailure::Predicate)? {
            return Ok(attempt + 1);
        }
        if attempt + 1 < attempts {
            let delay = policy.delay_after(attempt);
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }
    }
    warn!(description, attempts, "condition timed out");
    Err(PollFailure::Timeout(ConditionTimeout {
        description: description.to_string(),
        attempts,
    }))
}
