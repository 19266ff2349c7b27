//! Request pacing and sleep helpers shared by catalog workers.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::debug;

/// Blocking sleep capability, injectable for tests.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Process-wide minimum spacing between outbound requests.
///
/// The limiter allows a burst of one, so each request waits until the
/// configured interval has elapsed since the previous one, regardless of
/// which worker issued it.
pub struct RequestPacer {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    clock: DefaultClock,
    min_interval: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration, sleeper: Arc<dyn Sleeper>) -> Self {
        let period = min_interval.max(Duration::from_millis(1));
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::direct(quota),
            clock: DefaultClock::default(),
            min_interval: period,
            sleeper,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn sleeper(&self) -> &dyn Sleeper {
        self.sleeper.as_ref()
    }

    /// Blocks until the next request slot is available.
    pub fn wait_for_slot(&self) {
        loop {
            match self.limiter.check() {
                Ok(()) => return,
                Err(not_until) => {
                    let wait = not_until.wait_time_from(self.clock.now());
                    debug!("Catalog pacing: waiting {:?}", wait);
                    self.sleeper.sleep(wait);
                }
            }
        }
    }
}
