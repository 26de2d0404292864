//! Metric recency.
//!
//! Recency deals with the concept of removing metrics that have not been updated for a certain
//! amount of time. Statsd clients are free to invent names and tags on the fly, such as tags
//! referencing a request ID or a version of software. When these change, the old series are never
//! updated again, yet would otherwise be tracked and exported forever, growing until a significant
//! portion of memory is spent on series nobody cares about.
//!
//! [`Recency`] answers the question "has this metric been idle for too long?" for a metric whose
//! last update time is tracked by the caller. Callers stamp each entry with [`Recency::now`] on
//! every update, and later ask [`Recency::is_idle`] while deciding whether to evict the entry.
use std::time::Duration;

use quanta::{Clock, Instant};

use crate::{MetricKind, MetricKindMask};

/// Decides whether metrics have been idle for longer than a configured timeout.
///
/// Time is read from a [`quanta::Clock`], so tests can drive idle expiry with a mocked clock
/// instead of sleeping.
#[derive(Clone, Debug)]
pub struct Recency {
    clock: Clock,
    mask: MetricKindMask,
    idle_timeout: Option<Duration>,
}

impl Recency {
    /// Creates a new [`Recency`].
    ///
    /// If `idle_timeout` is `None`, no metric is ever considered idle. `mask` controls which
    /// metrics are covered by the recency logic. For example, if `mask` only contains counters and
    /// timers, then gauges and sets will never be considered idle, and thus never be evicted.
    ///
    /// Refer to the documentation for [`MetricKindMask`](crate::MetricKindMask) for more
    /// information on defining a metric kind mask.
    pub fn new(clock: Clock, mask: MetricKindMask, idle_timeout: Option<Duration>) -> Recency {
        Recency { clock, mask, idle_timeout }
    }

    /// Current time, according to the configured clock.
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Returns `true` if a metric of the given kind, last updated at `last_update`, has been idle
    /// for longer than the idle timeout as of `now`.
    pub fn is_idle(&self, kind: MetricKind, last_update: Instant, now: Instant) -> bool {
        match self.idle_timeout {
            Some(idle_timeout) if self.mask.matches(kind) => {
                now.saturating_duration_since(last_update) > idle_timeout
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use quanta::Clock;

    use super::Recency;
    use crate::{MetricKind, MetricKindMask};

    #[test]
    fn idle_after_timeout() {
        let (clock, mock) = Clock::mock();
        let recency = Recency::new(clock, MetricKindMask::ALL, Some(Duration::from_secs(10)));

        let last_update = recency.now();
        mock.increment(Duration::from_secs(5));
        assert!(!recency.is_idle(MetricKind::Counter, last_update, recency.now()));

        // Exactly at the timeout is not yet idle.
        mock.increment(Duration::from_secs(5));
        assert!(!recency.is_idle(MetricKind::Counter, last_update, recency.now()));

        mock.increment(Duration::from_millis(1));
        assert!(recency.is_idle(MetricKind::Counter, last_update, recency.now()));
    }

    #[test]
    fn mask_excludes_kinds() {
        let (clock, mock) = Clock::mock();
        let mask = MetricKindMask::COUNTER | MetricKindMask::TIMER;
        let recency = Recency::new(clock, mask, Some(Duration::from_secs(1)));

        let last_update = recency.now();
        mock.increment(Duration::from_secs(60));
        let now = recency.now();

        assert!(recency.is_idle(MetricKind::Counter, last_update, now));
        assert!(recency.is_idle(MetricKind::Timer, last_update, now));
        assert!(!recency.is_idle(MetricKind::Gauge, last_update, now));
        assert!(!recency.is_idle(MetricKind::Set, last_update, now));
    }

    #[test]
    fn no_timeout_never_idle() {
        let (clock, mock) = Clock::mock();
        let recency = Recency::new(clock, MetricKindMask::ALL, None);

        let last_update = recency.now();
        mock.increment(Duration::from_secs(86_400));
        assert!(!recency.is_idle(MetricKind::Gauge, last_update, recency.now()));
    }
}
