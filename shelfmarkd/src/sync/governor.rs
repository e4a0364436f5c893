use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

const MAX_DELAY: Duration = Duration::from_secs(30);
const JITTER_MS: u64 = 1000;

/// Process-wide advisory throttle. Every caller about to issue a remote call
/// must check [`RateGovernor::is_limited`] first and abstain while it holds;
/// nothing in the network layer enforces this.
pub struct RateGovernor {
    base_delay: Duration,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    limited_until: Option<Instant>,
    consecutive_failures: u32,
}

impl RateGovernor {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            state: Mutex::new(State::default()),
        }
    }

    /// Whether remote calls are currently forbidden. A deadline that has
    /// passed clears itself.
    pub fn is_limited(&self) -> bool {
        let mut state = self.lock();
        match state.limited_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                state.limited_until = None;
                false
            }
            None => false,
        }
    }

    pub fn mark_limited(&self, retry_after: Option<Duration>) {
        let mut rng = rand::thread_rng();
        self.mark_limited_with_rng(retry_after, &mut rng);
    }

    /// A server-supplied retry-after overrides the computed backoff but
    /// still counts as a failure.
    pub fn mark_limited_with_rng<R: Rng + ?Sized>(
        &self,
        retry_after: Option<Duration>,
        rng: &mut R,
    ) {
        let mut state = self.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let delay = retry_after
            .unwrap_or_else(|| backoff_delay(self.base_delay, state.consecutive_failures, rng));
        state.limited_until = Some(Instant::now() + delay);
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.limited_until = None;
        state.consecutive_failures = 0;
    }

    pub fn remaining_ms(&self) -> u64 {
        let state = self.lock();
        state
            .limited_until
            .map(|until| {
                until
                    .saturating_duration_since(Instant::now())
                    .as_millis()
                    .min(u128::from(u64::MAX)) as u64
            })
            .unwrap_or(0)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for RateGovernor {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}

fn backoff_delay<R: Rng + ?Sized>(base: Duration, failures: u32, rng: &mut R) -> Duration {
    let base_ms = base.as_millis().min(u128::from(u64::MAX)) as u64;
    let max_ms = MAX_DELAY.as_millis() as u64;
    let shift = failures.saturating_sub(1).min(16);
    let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
    Duration::from_millis(exp + rng.gen_range(0..=JITTER_MS))
}
