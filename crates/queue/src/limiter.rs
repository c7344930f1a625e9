//! Per-item and overall rate limiters deciding how long a requeue waits.

use std::hash::Hash;
use std::num::NonZeroU32;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use rustc_hash::FxHashMap;

/// Decides the delay before an item may be retried, and tracks how often it was.
pub trait RateLimiter<T>: Send + Sync {
    /// Delay for the next retry of `item`. Counts as one requeue.
    fn when(&self, item: &T) -> Duration;
    /// Clear the retry history of `item`.
    fn forget(&self, item: &T);
    fn num_requeues(&self, item: &T) -> u32;
}

/// `base * 2^failures`, capped at `max`.
pub struct ItemExponentialBackoff<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<T, u32>>,
}

impl<T> ItemExponentialBackoff<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: Mutex::new(FxHashMap::default()) }
    }
}

pub(crate) fn exponential(base: Duration, max: Duration, exp: u32) -> Duration {
    1u32.checked_shl(exp)
        .and_then(|factor| base.checked_mul(factor))
        .map(|d| d.min(max))
        .unwrap_or(max)
}

impl<T: Clone + Eq + Hash + Send> RateLimiter<T> for ItemExponentialBackoff<T> {
    fn when(&self, item: &T) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(item.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);
        exponential(self.base, self.max, exp)
    }

    fn forget(&self, item: &T) {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).get(item).copied().unwrap_or(0)
    }
}

/// Slowest refill the bucket models; a lower qps is treated as this.
const MAX_REFILL_PERIOD: Duration = Duration::from_secs(86_400);

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Overall token bucket shared by every item, refilled at `qps` up to `burst`.
///
/// The delay is the wait until the bucket next admits a call. A non-positive, NaN or
/// unrepresentably high qps disables the bucket.
pub struct BucketRateLimiter {
    limiter: Option<DirectLimiter>,
    clock: DefaultClock,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = NonZeroU32::new(burst.max(1)).unwrap_or(NonZeroU32::MIN);
        let limiter = refill_period(qps)
            .and_then(Quota::with_period)
            .map(|quota| governor::RateLimiter::direct(quota.allow_burst(burst)));
        Self { limiter, clock: DefaultClock::default() }
    }
}

fn refill_period(qps: f64) -> Option<Duration> {
    if qps.is_nan() || qps <= 0.0 {
        return None;
    }
    let period = Duration::try_from_secs_f64(qps.recip()).unwrap_or(MAX_REFILL_PERIOD);
    Some(period.min(MAX_REFILL_PERIOD))
}

impl<T> RateLimiter<T> for BucketRateLimiter {
    fn when(&self, _item: &T) -> Duration {
        match self.limiter.as_ref().map(DirectLimiter::check) {
            Some(Err(not_until)) => not_until.wait_time_from(self.clock.now()),
            Some(Ok(())) | None => Duration::ZERO,
        }
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 { 0 }
}

/// Takes the longest delay of all inner limiters.
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self { Self { limiters } }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters.iter().map(|l| l.when(item)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &T) {
        for l in &self.limiters {
            l.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(item)).max().unwrap_or(0)
    }
}

/// Per-item exponential backoff combined with an overall bucket.
pub fn controller_rate_limiter<T>(base: Duration, max: Duration, qps: f64, burst: u32) -> MaxOfRateLimiter<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialBackoff::new(base, max)),
        Box::new(BucketRateLimiter::new(qps, burst)),
    ])
}

/// 5ms doubling up to 1000s per item, and 10 qps with a burst of 100 overall.
pub fn default_controller_rate_limiter<T>() -> MaxOfRateLimiter<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    controller_rate_limiter(Duration::from_millis(5), Duration::from_secs(1000), 10.0, 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_then_caps() {
        let l = ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_millis(100));
        let delays: Vec<_> = (0..7).map(|_| l.when(&"k").as_millis()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 100, 100]);
        assert_eq!(l.num_requeues(&"k"), 7);
        assert_eq!(l.num_requeues(&"other"), 0);
    }

    #[test]
    fn exponential_survives_huge_exponents() {
        assert_eq!(exponential(Duration::from_secs(1), Duration::from_secs(9), 40), Duration::from_secs(9));
        assert_eq!(exponential(Duration::from_secs(u64::MAX / 2), Duration::from_secs(9), 3), Duration::from_secs(9));
    }

    #[test]
    fn forget_resets_history() {
        let l = ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1));
        l.when(&1);
        l.when(&1);
        l.forget(&1);
        assert_eq!(l.num_requeues(&1), 0);
        assert_eq!(l.when(&1), Duration::from_millis(5));
    }

    #[test]
    fn bucket_allows_burst_then_spaces_out() {
        let b = BucketRateLimiter::new(10.0, 2);
        assert_eq!(RateLimiter::<u8>::when(&b, &0), Duration::ZERO);
        assert_eq!(RateLimiter::<u8>::when(&b, &0), Duration::ZERO);
        let third = RateLimiter::<u8>::when(&b, &0);
        assert!(third > Duration::ZERO && third <= Duration::from_millis(100), "third wait {third:?}");
    }

    #[test]
    fn bucket_with_tiny_qps_waits_at_most_the_refill_cap() {
        let b = BucketRateLimiter::new(1e-30, 1);
        assert_eq!(RateLimiter::<u8>::when(&b, &0), Duration::ZERO);
        let wait = RateLimiter::<u8>::when(&b, &0);
        assert!(wait > Duration::from_secs(3600) && wait <= MAX_REFILL_PERIOD, "wait {wait:?}");
    }

    #[test]
    fn disabled_bucket_never_waits() {
        for qps in [0.0, -1.0, f64::NAN, 1e30] {
            let b = BucketRateLimiter::new(qps, 1);
            for _ in 0..5 {
                assert_eq!(RateLimiter::<u8>::when(&b, &0), Duration::ZERO, "qps {qps}");
            }
        }
    }

    #[test]
    fn max_of_picks_longest() {
        let l: MaxOfRateLimiter<&str> = default_controller_rate_limiter();
        assert_eq!(l.when(&"a"), Duration::from_millis(5));
        assert_eq!(l.when(&"a"), Duration::from_millis(10));
        assert_eq!(l.num_requeues(&"a"), 2);
        l.forget(&"a");
        assert_eq!(l.num_requeues(&"a"), 0);
    }
}
