//! Aggregate metric storage.
use std::{collections::HashSet, sync::Arc, time::Duration};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use quanta::Instant;
use statsd_util::{MetricKey, MetricKind, Quantile, Recency, Registry, Summary};
use thiserror::Error;
use tracing::debug;

use crate::telemetry::Telemetry;

/// Errors that could occur while aggregating a datagram into the store.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum AggregationError {
    /// The key already holds a metric of a different type.
    #[error("metric already exists as a {existing}, cannot update it as a {incoming}")]
    TypeMismatch {
        /// Type of the existing metric.
        existing: MetricKind,

        /// Type of the rejected update.
        incoming: MetricKind,
    },

    /// The store is at capacity and cannot track another key.
    #[error("metric store is full ({capacity} keys)")]
    StoreFull {
        /// Maximum number of keys.
        capacity: usize,
    },

    /// The set is at capacity and cannot track another member.
    #[error("set is full ({capacity} members)")]
    SetFull {
        /// Maximum number of members.
        capacity: usize,
    },

    /// Applying the update would leave the metric with a non-finite value.
    #[error("update would make the {kind} non-finite")]
    NonFinite {
        /// Type of the rejected update.
        kind: MetricKind,
    },
}

/// Which aggregates are reset after being exported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResetPolicy {
    /// Reset counters, timers and sets after export.
    ///
    /// Defaults to `true`.
    pub counters: bool,

    /// Reset gauges to zero after export.
    ///
    /// Defaults to `false`.
    pub gauges: bool,
}

impl Default for ResetPolicy {
    fn default() -> Self {
        ResetPolicy { counters: true, gauges: false }
    }
}

// Timer quantile sketches: 1% relative error, at most 1,024 eight-byte buckets per sign. That spans
// about nine orders of magnitude before the smallest values are collapsed together.
const TIMER_SUMMARY_ALPHA: f64 = 0.01;
const TIMER_SUMMARY_MAX_BUCKETS: u32 = 1_024;
const TIMER_SUMMARY_MIN_VALUE: f64 = 1.0e-9;

/// Streaming timer statistics.
#[derive(Clone)]
pub struct TimerStats {
    count: u64,
    min: f64,
    max: f64,
    sum: f64,
    sum_of_squares: f64,
    summary: Summary,
}

impl TimerStats {
    fn new() -> Self {
        TimerStats {
            count: 0,
            min: 0.0,
            max: 0.0,
            sum: 0.0,
            sum_of_squares: 0.0,
            summary: Summary::new(TIMER_SUMMARY_ALPHA, TIMER_SUMMARY_MAX_BUCKETS, TIMER_SUMMARY_MIN_VALUE),
        }
    }

    /// Records an observation.
    ///
    /// # Errors
    ///
    /// If the running sum or sum of squares would overflow, [`AggregationError::NonFinite`] is
    /// returned and the statistics are left untouched.
    pub fn record(&mut self, value: f64) -> Result<(), AggregationError> {
        let sum = self.sum + value;
        let sum_of_squares = self.sum_of_squares + value * value;
        if !sum.is_finite() || !sum_of_squares.is_finite() {
            return Err(AggregationError::NonFinite { kind: MetricKind::Timer });
        }

        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum = sum;
        self.sum_of_squares = sum_of_squares;
        self.summary.add(value);
        Ok(())
    }

    fn snapshot(&self, quantiles: &[Quantile]) -> TimerSnapshot {
        if self.count == 0 {
            return TimerSnapshot {
                quantiles: quantiles.iter().map(|q| (q.clone(), 0.0)).collect(),
                ..TimerSnapshot::default()
            };
        }

        let count = self.count as f64;
        let average = self.sum / count;
        let variance = (self.sum_of_squares / count - average * average).max(0.0);

        TimerSnapshot {
            count: self.count,
            min: self.min,
            max: self.max,
            sum: self.sum,
            average,
            std_deviation: variance.sqrt(),
            quantiles: quantiles
                .iter()
                .map(|q| (q.clone(), self.summary.quantile(q.value()).unwrap_or(0.0)))
                .collect(),
        }
    }
}

/// Aggregate state of a single metric.
pub enum Aggregate {
    /// Sum of scaled increments since the last export.
    Counter(f64),

    /// Current gauge value.
    Gauge(f64),

    /// Timer observations since the last export.
    Timer(TimerStats),

    /// Distinct members since the last export.
    Set(HashSet<String>),
}

impl Aggregate {
    fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Aggregate::Counter(0.0),
            MetricKind::Gauge => Aggregate::Gauge(0.0),
            MetricKind::Timer => Aggregate::Timer(TimerStats::new()),
            MetricKind::Set => Aggregate::Set(HashSet::new()),
        }
    }

    fn snapshot(&mut self, quantiles: &[Quantile], policy: ResetPolicy) -> SnapshotValue {
        match self {
            Aggregate::Counter(sum) => {
                let value = SnapshotValue::Counter(*sum);
                if policy.counters {
                    *sum = 0.0;
                }
                value
            }
            Aggregate::Gauge(current) => {
                let value = SnapshotValue::Gauge(*current);
                if policy.gauges {
                    *current = 0.0;
                }
                value
            }
            Aggregate::Timer(stats) => {
                let value = SnapshotValue::Timer(stats.snapshot(quantiles));
                if policy.counters {
                    *stats = TimerStats::new();
                }
                value
            }
            Aggregate::Set(members) => {
                let value = SnapshotValue::Set(members.len());
                if policy.counters {
                    members.clear();
                }
                value
            }
        }
    }
}

struct EntryState {
    aggregate: Aggregate,
    last_update: Instant,
    updates: u64,
}

/// A metric store entry. The kind is fixed when the entry is created.
pub struct Entry {
    kind: MetricKind,
    state: Mutex<EntryState>,
}

impl Entry {
    fn new(kind: MetricKind, now: Instant) -> Self {
        Entry {
            kind,
            state: Mutex::new(EntryState {
                aggregate: Aggregate::new(kind),
                last_update: now,
                updates: 0,
            }),
        }
    }
}

/// Exported statistics of a timer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TimerSnapshot {
    /// Number of observations.
    pub count: u64,
    /// Smallest observation.
    pub min: f64,
    /// Largest observation.
    pub max: f64,
    /// Sum of observations.
    pub sum: f64,
    /// Mean observation.
    pub average: f64,
    /// Population standard deviation.
    pub std_deviation: f64,
    /// Estimated value at each configured quantile.
    pub quantiles: Vec<(Quantile, f64)>,
}

/// Exported value of a single metric.
#[derive(Clone, Debug, PartialEq)]
pub enum SnapshotValue {
    /// Counter delta since the previous export.
    Counter(f64),
    /// Gauge value.
    Gauge(f64),
    /// Timer statistics since the previous export.
    Timer(TimerSnapshot),
    /// Set cardinality since the previous export.
    Set(usize),
}

/// A single metric in a [`Snapshot`].
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotEntry {
    /// Metric key.
    pub key: MetricKey,
    /// Exported value.
    pub value: SnapshotValue,
    /// Number of updates applied since the entry was created.
    pub updates: u64,
}

/// A consistent view of every metric in the store, sorted by key.
pub type Snapshot = Vec<SnapshotEntry>;

/// Number of live entries, by kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tracked {
    /// Live counters.
    pub counters: usize,
    /// Live gauges.
    pub gauges: usize,
    /// Live timers.
    pub timers: usize,
    /// Live sets.
    pub sets: usize,
}

impl Tracked {
    /// Live entries of all kinds.
    pub fn total(&self) -> usize {
        self.counters + self.gauges + self.timers + self.sets
    }

    /// Live entries of the given kind.
    pub fn of(&self, kind: MetricKind) -> usize {
        match kind {
            MetricKind::Counter => self.counters,
            MetricKind::Gauge => self.gauges,
            MetricKind::Timer => self.timers,
            MetricKind::Set => self.sets,
        }
    }
}

/// The aggregate metric store.
///
/// Entries live in a sharded [`Registry`]. Updates run while holding the read side of the entry's
/// shard lock and the entry's own mutex, so concurrent updates to different keys proceed in
/// parallel, and an entry can never be evicted while it is being updated. Snapshots read and reset
/// each entry atomically under its mutex.
pub struct MetricStore {
    registry: Registry<MetricKey, Entry>,
    recency: Recency,
    quantiles: Vec<Quantile>,
    reset_policy: ResetPolicy,
    snapshot_lock: Mutex<()>,
}

impl MetricStore {
    /// Creates a new `MetricStore`.
    ///
    /// `max_keys` bounds the number of distinct keys, or `None` for no limit.
    pub fn new(
        recency: Recency,
        quantiles: Vec<Quantile>,
        reset_policy: ResetPolicy,
        max_keys: Option<usize>,
    ) -> Self {
        MetricStore {
            registry: Registry::with_capacity(max_keys),
            recency,
            quantiles,
            reset_policy,
            snapshot_lock: Mutex::new(()),
        }
    }

    /// Current time, according to the store's clock.
    pub fn now(&self) -> Instant {
        self.recency.now()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// Returns `true` if the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Gets or creates the entry for `key` as a metric of `kind`, then applies `mutator` to it.
    ///
    /// # Errors
    ///
    /// If the key exists with a different kind, [`AggregationError::TypeMismatch`] is returned and
    /// the entry is left untouched. If the key is new and the store is full,
    /// [`AggregationError::StoreFull`] is returned. If `mutator` fails, its error is returned and
    /// the entry is not marked as updated.
    pub fn upsert<F, R>(&self, key: &MetricKey, kind: MetricKind, mutator: F) -> Result<R, AggregationError>
    where
        F: FnOnce(&mut Aggregate) -> Result<R, AggregationError>,
    {
        let now = self.recency.now();
        self.registry
            .get_or_try_create(
                key,
                |_| Entry::new(kind, now),
                |entry| {
                    if entry.kind != kind {
                        return Err(AggregationError::TypeMismatch { existing: entry.kind, incoming: kind });
                    }

                    let mut state = entry.state.lock();
                    let result = mutator(&mut state.aggregate)?;
                    state.last_update = now;
                    state.updates += 1;
                    Ok(result)
                },
            )
            .map_err(|e| AggregationError::StoreFull { capacity: e.capacity })?
    }

    /// Takes a snapshot of every entry, sorted by key, resetting entries per the reset policy.
    ///
    /// Concurrent snapshots are serialized, so every delta is exported exactly once.
    pub fn snapshot(&self) -> Snapshot {
        let _guard = self.snapshot_lock.lock();

        let mut entries = Vec::with_capacity(self.registry.len());
        self.registry.visit(|key, entry| {
            let mut state = entry.state.lock();
            let value = state.aggregate.snapshot(&self.quantiles, self.reset_policy);
            entries.push(SnapshotEntry { key: key.clone(), value, updates: state.updates });
        });

        entries.sort_unstable_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Evicts entries that have been idle for longer than the idle timeout as of `now`, returning how
    /// many were evicted.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        self.registry.retain(|_, entry| {
            let last_update = entry.state.lock().last_update;
            !self.recency.is_idle(entry.kind, last_update, now)
        })
    }

    /// Counts live entries by kind.
    pub fn tracked(&self) -> Tracked {
        let mut tracked = Tracked::default();
        self.registry.visit(|_, entry| match entry.kind {
            MetricKind::Counter => tracked.counters += 1,
            MetricKind::Gauge => tracked.gauges += 1,
            MetricKind::Timer => tracked.timers += 1,
            MetricKind::Set => tracked.sets += 1,
        });
        tracked
    }
}

/// Periodically evicts idle entries from a [`MetricStore`].
pub(crate) struct Sweeper {
    store: Arc<MetricStore>,
    telemetry: Arc<Telemetry>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(store: Arc<MetricStore>, telemetry: Arc<Telemetry>, interval: Duration) -> Self {
        Sweeper { store, telemetry, interval }
    }

    /// Sweeps every interval until `stop` is signalled or disconnected.
    pub fn run(self, stop: &Receiver<()>) {
        debug!(interval = ?self.interval, "Sweeper started.");

        while let Err(RecvTimeoutError::Timeout) = stop.recv_timeout(self.interval) {
            let evicted = self.store.sweep_expired(self.store.now());
            if evicted > 0 {
                debug!(evicted, remaining = self.store.len(), "Evicted idle metrics.");
                self.telemetry.track_evicted(evicted);
            }
        }

        debug!("Sweeper stopping.");
    }
}
