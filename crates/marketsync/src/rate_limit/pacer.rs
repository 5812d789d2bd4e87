//! Request pacing with `governor`.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

type GovernorRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Smooths bursts to a steady requests-per-second rate.
///
/// Window accounting bounds how many calls fit in a period; the pacer keeps
/// those calls from all leaving in the same instant.
#[derive(Clone)]
pub struct Pacer {
    inner: Arc<GovernorRateLimiter>,
    rps: u32,
}

impl Pacer {
    /// Create a pacer allowing `requests_per_second` (0 is treated as 1).
    pub fn new(requests_per_second: u32) -> Self {
        let rps = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            inner: Arc::new(RateLimiter::direct(Quota::per_second(rps))),
            rps: rps.get(),
        }
    }

    pub fn rps(&self) -> u32 {
        self.rps
    }

    /// Wait until the next request may leave.
    pub async fn wait(&self) {
        self.inner.until_ready().await;
    }
}

impl std::fmt::Debug for Pacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pacer").field("rps", &self.rps).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn zero_rps_is_clamped_to_one() {
        assert_eq!(Pacer::new(0).rps(), 1);
        assert_eq!(Pacer::new(25).rps(), 25);
    }

    #[tokio::test]
    async fn pacer_spaces_out_requests_beyond_the_burst() {
        let pacer = Pacer::new(20);
        let started = Instant::now();
        // Burst capacity equals the rate; the rest are spaced 50ms apart.
        for _ in 0..22 {
            pacer.wait().await;
        }
        assert!(started.elapsed() >= Duration::from_millis(80));
    }
}
