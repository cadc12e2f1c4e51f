use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::RetryPolicy;

/// Exponential backoff with jitter: `min(initial * 2^attempt + jitter, max)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
    started: Instant,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            started: Instant::now(),
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Restart the schedule, e.g. when a new stage begins.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.started = Instant::now();
    }

    /// Delay before the next attempt, or `None` once `max_wait_ms` is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = delay_for_attempt(&self.policy, self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        match self.policy.max_wait_ms {
            Some(max_wait) => {
                let elapsed = self.elapsed().as_millis() as u64;
                if elapsed >= max_wait {
                    return None;
                }
                Some(delay.min(Duration::from_millis(max_wait - elapsed)))
            }
            None => Some(delay),
        }
    }
}

pub fn delay_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy
        .initial_backoff_ms
        .saturating_mul(2_u64.saturating_pow(attempt.min(32)));
    let jitter = random_jitter(base / 2);
    Duration::from_millis(base.saturating_add(jitter).min(policy.max_backoff_ms))
}

fn random_jitter(max_jitter: u64) -> u64 {
    if max_jitter == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..=max_jitter)
}

/// Sleep for `delay` unless shutdown is signalled first.
///
/// Returns `false` when the sleep was cut short by shutdown.
pub async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.changed() => false,
    }
}
