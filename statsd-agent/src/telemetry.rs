use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use crate::parser::ParseError;

/// Agent telemetry.
///
/// `Telemetry` collects information about the agent's own behavior: how many datagrams were
/// received and parsed, how many were rejected and why, how many were shed under load, and how much
/// time was spent parsing and aggregating. It is exported under the agent cluster.
///
/// Counters only ever increase.
#[derive(Default)]
pub struct Telemetry {
    received: AtomicU64,
    parsed: AtomicU64,
    parse_errors: [AtomicU64; ParseError::KINDS],
    dropped: AtomicU64,
    aggregated: AtomicU64,
    type_mismatch: AtomicU64,
    store_full: AtomicU64,
    non_finite: AtomicU64,
    evicted: AtomicU64,
    receive_failures: AtomicU64,
    time_spent_parsing_ns: AtomicU64,
    time_spent_aggregating_ns: AtomicU64,
}

impl Telemetry {
    /// Applies the given telemetry update.
    pub fn apply_update(&self, update: &TelemetryUpdate) {
        add(&self.received, update.received);
        add(&self.parsed, update.parsed);
        for (total, delta) in self.parse_errors.iter().zip(update.parse_errors) {
            add(total, delta);
        }
        add(&self.dropped, update.dropped);
        add(&self.aggregated, update.aggregated);
        add(&self.type_mismatch, update.type_mismatch);
        add(&self.store_full, update.store_full);
        add(&self.non_finite, update.non_finite);
        add(&self.receive_failures, update.receive_failures);
        add(&self.time_spent_parsing_ns, update.time_spent_parsing_ns);
        add(&self.time_spent_aggregating_ns, update.time_spent_aggregating_ns);
    }

    /// Tracks entries evicted by the idle sweep.
    pub fn track_evicted(&self, evicted: usize) {
        add(&self.evicted, evicted as u64);
    }

    /// Takes a point-in-time copy of every counter.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Acquire);

        TelemetrySnapshot {
            received: load(&self.received),
            parsed: load(&self.parsed),
            parse_errors: std::array::from_fn(|i| load(&self.parse_errors[i])),
            dropped: load(&self.dropped),
            aggregated: load(&self.aggregated),
            type_mismatch: load(&self.type_mismatch),
            store_full: load(&self.store_full),
            non_finite: load(&self.non_finite),
            evicted: load(&self.evicted),
            receive_failures: load(&self.receive_failures),
            time_spent_parsing: Duration::from_nanos(load(&self.time_spent_parsing_ns)),
            time_spent_aggregating: Duration::from_nanos(load(&self.time_spent_aggregating_ns)),
        }
    }
}

fn add(counter: &AtomicU64, value: u64) {
    if value > 0 {
        counter.fetch_add(value, Ordering::AcqRel);
    }
}

/// A point-in-time copy of the agent telemetry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    /// Datagrams received from the network.
    pub received: u64,

    /// Statements parsed successfully.
    pub parsed: u64,

    /// Parse failures, indexed by [`ParseError::index`].
    pub parse_errors: [u64; ParseError::KINDS],

    /// Parsed statements shed because the queue was full.
    pub dropped: u64,

    /// Statements applied to the metric store.
    pub aggregated: u64,

    /// Statements rejected because their key already holds a metric of another type.
    pub type_mismatch: u64,

    /// Statements rejected because the metric store, or the set they named, was full.
    pub store_full: u64,

    /// Statements rejected because applying them would have made a value non-finite.
    pub non_finite: u64,

    /// Entries evicted after being idle for too long.
    pub evicted: u64,

    /// Failed socket receives.
    pub receive_failures: u64,

    /// Total time spent parsing.
    pub time_spent_parsing: Duration,

    /// Total time spent aggregating.
    pub time_spent_aggregating: Duration,
}

impl TelemetrySnapshot {
    /// Total parse failures, across all kinds.
    pub fn parse_errors_total(&self) -> u64 {
        self.parse_errors.iter().sum()
    }
}

/// A buffer for collecting telemetry updates.
///
/// Hot paths record into a local `TelemetryUpdate` and apply it to the shared [`Telemetry`] in
/// batches, instead of touching shared atomics for every statement.
#[derive(Default)]
pub struct TelemetryUpdate {
    received: u64,
    parsed: u64,
    parse_errors: [u64; ParseError::KINDS],
    dropped: u64,
    aggregated: u64,
    type_mismatch: u64,
    store_full: u64,
    non_finite: u64,
    receive_failures: u64,
    time_spent_parsing_ns: u64,
    time_spent_aggregating_ns: u64,
}

impl TelemetryUpdate {
    /// Clears the update buffer, resetting it back to an empty state.
    pub fn clear(&mut self) {
        *self = TelemetryUpdate::default();
    }

    /// Tracks a received datagram.
    pub fn track_received(&mut self) {
        self.received += 1;
    }

    /// Tracks a successfully parsed statement.
    pub fn track_parsed(&mut self) {
        self.parsed += 1;
    }

    /// Tracks a parse failure.
    pub fn track_parse_error(&mut self, error: &ParseError) {
        self.parse_errors[error.index()] += 1;
    }

    /// Tracks a statement shed because the queue was full.
    pub fn track_dropped(&mut self) {
        self.dropped += 1;
    }

    /// Tracks a statement applied to the store.
    pub fn track_aggregated(&mut self) {
        self.aggregated += 1;
    }

    /// Tracks a type mismatch.
    pub fn track_type_mismatch(&mut self) {
        self.type_mismatch += 1;
    }

    /// Tracks a rejection due to a full store or a full set.
    pub fn track_store_full(&mut self) {
        self.store_full += 1;
    }

    /// Tracks a rejection due to a non-finite result.
    pub fn track_non_finite(&mut self) {
        self.non_finite += 1;
    }

    /// Tracks a failed socket receive.
    pub fn track_receive_failure(&mut self) {
        self.receive_failures += 1;
    }

    /// Adds to the time spent parsing.
    pub fn track_parsing_time(&mut self, elapsed: Duration) {
        self.time_spent_parsing_ns += saturating_nanos(elapsed);
    }

    /// Adds to the time spent aggregating.
    pub fn track_aggregating_time(&mut self, elapsed: Duration) {
        self.time_spent_aggregating_ns += saturating_nanos(elapsed);
    }
}

fn saturating_nanos(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Telemetry, TelemetryUpdate};
    use crate::parser::ParseError;

    #[test]
    fn updates_accumulate() {
        let telemetry = Telemetry::default();
        let mut update = TelemetryUpdate::default();

        update.track_received();
        update.track_parsed();
        update.track_parsed();
        update.track_parse_error(&ParseError::UnknownType);
        update.track_parse_error(&ParseError::TooLarge { len: 2000, max: 1472 });
        update.track_dropped();
        update.track_parsing_time(Duration::from_micros(5));
        telemetry.apply_update(&update);

        update.clear();
        update.track_received();
        update.track_aggregated();
        update.track_non_finite();
        telemetry.apply_update(&update);
        telemetry.track_evicted(3);

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.parsed, 2);
        assert_eq!(snapshot.parse_errors[ParseError::UnknownType.index()], 1);
        assert_eq!(snapshot.parse_errors[0], 1);
        assert_eq!(snapshot.parse_errors_total(), 2);
        assert_eq!(snapshot.dropped, 1);
        assert_eq!(snapshot.aggregated, 1);
        assert_eq!(snapshot.non_finite, 1);
        assert_eq!(snapshot.evicted, 3);
        assert_eq!(snapshot.time_spent_parsing, Duration::from_micros(5));
    }
}
