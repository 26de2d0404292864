use std::sync::Arc;

use crossbeam_channel::Receiver;
use statsd_util::MetricKind;
use tracing::{debug, trace};

use crate::{
    parser::{Datagram, DatagramValue, GaugeValue},
    store::{Aggregate, AggregationError, MetricStore},
    telemetry::{Telemetry, TelemetryUpdate},
};

/// How signed gauge updates are applied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GaugeSemantics {
    /// `+n` and `-n` adjust the current value, while unsigned values overwrite it.
    #[default]
    Relative,

    /// Every gauge update overwrites the current value, with `-n` writing a negative value.
    Absolute,
}

// Telemetry is applied at least this often while the queue stays busy.
const TELEMETRY_BATCH: u64 = 256;

/// Applies parsed datagrams to the metric store.
///
/// The aggregator is the only writer of the store: it consumes datagrams from the queue in order,
/// and applies the per-type aggregation rules to each of them.
pub struct Aggregator {
    store: Arc<MetricStore>,
    telemetry: Arc<Telemetry>,
    gauge_semantics: GaugeSemantics,
    max_set_members: Option<usize>,
}

impl Aggregator {
    /// Creates a new `Aggregator`.
    pub fn new(
        store: Arc<MetricStore>,
        telemetry: Arc<Telemetry>,
        gauge_semantics: GaugeSemantics,
    ) -> Self {
        Aggregator { store, telemetry, gauge_semantics, max_set_members: None }
    }

    /// Bounds the number of distinct members a single set tracks between exports.
    ///
    /// Once a set holds `max_set_members` members, new members are rejected while known members are
    /// still accepted. `None` leaves sets unbounded.
    #[must_use]
    pub fn with_max_set_members(mut self, max_set_members: Option<usize>) -> Self {
        self.max_set_members = max_set_members;
        self
    }

    /// Applies a single datagram to the store.
    ///
    /// # Errors
    ///
    /// The datagram is discarded, and an error returned, if:
    /// - the metric key already holds a metric of another type
    /// - the key is new and the store is full
    /// - the datagram names a new member of a set that is full
    /// - applying it would leave a counter, gauge or timer with a non-finite value
    pub fn aggregate(&self, datagram: Datagram) -> Result<(), AggregationError> {
        let kind = datagram.kind();
        let (key, value, sample_rate) = datagram.into_parts();
        let gauge_semantics = self.gauge_semantics;
        let max_set_members = self.max_set_members;

        // A tiny sample rate can overflow the increment itself, before any existing sum is involved.
        let value = match value {
            DatagramValue::Counter(n) => DatagramValue::Counter(finite(kind, n / sample_rate)?),
            value => value,
        };

        self.store.upsert(&key, kind, move |aggregate| match (aggregate, value) {
            (Aggregate::Counter(sum), DatagramValue::Counter(increment)) => {
                *sum = finite(kind, *sum + increment)?;
                Ok(())
            }
            (Aggregate::Gauge(current), DatagramValue::Gauge(update)) => {
                *current = finite(
                    kind,
                    match (gauge_semantics, update) {
                        (_, GaugeValue::Absolute(n)) => n,
                        (GaugeSemantics::Relative, GaugeValue::Increment(n)) => *current + n,
                        (GaugeSemantics::Relative, GaugeValue::Decrement(n)) => *current - n,
                        (GaugeSemantics::Absolute, GaugeValue::Increment(n)) => n,
                        (GaugeSemantics::Absolute, GaugeValue::Decrement(n)) => -n,
                    },
                )?;
                Ok(())
            }
            (Aggregate::Timer(stats), DatagramValue::Timer(n)) => stats.record(n),
            (Aggregate::Set(members), DatagramValue::Set(member)) => match max_set_members {
                Some(capacity) if members.len() >= capacity && !members.contains(&member) => {
                    Err(AggregationError::SetFull { capacity })
                }
                _ => {
                    members.insert(member);
                    Ok(())
                }
            },
            // The store only hands out entries of the requested kind.
            _ => Ok(()),
        })
    }

    /// Runs the aggregator until every sender of `receiver` is dropped and the queue is drained.
    pub fn run(self, receiver: Receiver<Datagram>) {
        debug!("Aggregator started.");

        let mut update = TelemetryUpdate::default();
        let mut pending = 0;

        while let Ok(datagram) = receiver.recv() {
            self.process(datagram, &mut update);
            pending += 1;

            // Drain whatever else is already queued before publishing telemetry.
            while let Ok(datagram) = receiver.try_recv() {
                self.process(datagram, &mut update);
                pending += 1;
                if pending >= TELEMETRY_BATCH {
                    break;
                }
            }

            self.telemetry.apply_update(&update);
            update.clear();
            pending = 0;
        }

        debug!("Queue disconnected and drained, aggregator stopping.");
    }

    fn process(&self, datagram: Datagram, update: &mut TelemetryUpdate) {
        let start = self.store.now();
        match self.aggregate(datagram) {
            Ok(()) => update.track_aggregated(),
            Err(e @ AggregationError::TypeMismatch { .. }) => {
                trace!(error = %e, "Dropping datagram.");
                update.track_type_mismatch();
            }
            Err(e @ (AggregationError::StoreFull { .. } | AggregationError::SetFull { .. })) => {
                trace!(error = %e, "Dropping datagram.");
                update.track_store_full();
            }
            Err(e @ AggregationError::NonFinite { .. }) => {
                trace!(error = %e, "Dropping datagram.");
                update.track_non_finite();
            }
        }
        update.track_aggregating_time(self.store.now().saturating_duration_since(start));
    }
}

fn finite(kind: MetricKind, value: f64) -> Result<f64, AggregationError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(AggregationError::NonFinite { kind })
    }
}
