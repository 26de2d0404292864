use std::{fmt, ops::BitOr};

/// Metric kind.
///
/// Defines the kind, or type, of a metric. Follows the metric types of the statsd protocol:
/// - counters
/// - gauges
/// - timers
/// - sets
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum MetricKind {
    /// Counter type.
    Counter,
    /// Gauge type.
    Gauge,
    /// Timer type.
    Timer,
    /// Set type.
    Set,
}

impl MetricKind {
    /// All metric kinds, in export order.
    pub const ALL: [MetricKind; 4] =
        [MetricKind::Counter, MetricKind::Gauge, MetricKind::Timer, MetricKind::Set];

    /// Lowercase name of this kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Timer => "timer",
            MetricKind::Set => "set",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metric kind mask.
///
/// Useful for matching against a kind, or kinds, of metrics.
///
/// In order to use for defining multiple metric kinds, can be used in a bitmask fashion, as this
/// type implements bitwise OR support, and checking for inclusion of a specific kind within another
/// kind value can be checked via [`matches`](MetricKindMask::matches):
///
/// ```rust
/// # use statsd_util::{MetricKind, MetricKindMask};
/// // Let's only match counters and timers:
/// let mask = MetricKindMask::COUNTER | MetricKindMask::TIMER;
///
/// assert!(!mask.matches(MetricKind::Gauge));
/// assert!(mask.matches(MetricKind::Counter));
/// assert!(mask.matches(MetricKind::Timer));
/// assert!(!mask.matches(MetricKind::Set));
/// ```
#[derive(Debug, Eq, PartialEq, Hash, Clone, Copy, Ord, PartialOrd)]
pub struct MetricKindMask(u8);

impl MetricKindMask {
    /// No metric kinds.
    pub const NONE: MetricKindMask = MetricKindMask(0);

    /// The counter kind.
    pub const COUNTER: MetricKindMask = MetricKindMask(1);

    /// The gauge kind.
    pub const GAUGE: MetricKindMask = MetricKindMask(2);

    /// The timer kind.
    pub const TIMER: MetricKindMask = MetricKindMask(4);

    /// The set kind.
    pub const SET: MetricKindMask = MetricKindMask(8);

    /// All metric kinds.
    pub const ALL: MetricKindMask = MetricKindMask(15);

    #[inline]
    fn value(self) -> u8 {
        self.0
    }

    /// Whether or not this metric kind contains the specified kind.
    pub fn matches(&self, kind: MetricKind) -> bool {
        let bit = match kind {
            MetricKind::Counter => MetricKindMask::COUNTER,
            MetricKind::Gauge => MetricKindMask::GAUGE,
            MetricKind::Timer => MetricKindMask::TIMER,
            MetricKind::Set => MetricKindMask::SET,
        };
        self.0 & bit.value() != 0
    }
}

impl BitOr for MetricKindMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::MetricKindMask;
    use crate::MetricKind;

    #[test]
    fn test_matching() {
        let cmask = MetricKindMask::COUNTER;
        let gmask = MetricKindMask::GAUGE;
        let tmask = MetricKindMask::TIMER;
        let smask = MetricKindMask::SET;
        let nmask = MetricKindMask::NONE;
        let amask = MetricKindMask::ALL;

        assert!(cmask.matches(MetricKind::Counter));
        assert!(!cmask.matches(MetricKind::Gauge));
        assert!(!cmask.matches(MetricKind::Timer));
        assert!(!cmask.matches(MetricKind::Set));

        assert!(!gmask.matches(MetricKind::Counter));
        assert!(gmask.matches(MetricKind::Gauge));

        assert!(tmask.matches(MetricKind::Timer));
        assert!(!tmask.matches(MetricKind::Set));

        assert!(smask.matches(MetricKind::Set));
        assert!(!smask.matches(MetricKind::Counter));

        for kind in MetricKind::ALL {
            assert!(amask.matches(kind));
            assert!(!nmask.matches(kind));
        }

        let combined = cmask | smask;
        assert!(combined.matches(MetricKind::Counter));
        assert!(combined.matches(MetricKind::Set));
        assert!(!combined.matches(MetricKind::Gauge));
    }

    #[test]
    fn names() {
        assert_eq!(MetricKind::Counter.to_string(), "counter");
        assert_eq!(MetricKind::Timer.as_str(), "timer");
    }
}
