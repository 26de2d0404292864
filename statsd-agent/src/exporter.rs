//! The export side of the agent.
//!
//! Every time the metrics coordinator polls the agent, it asks for one [`Cluster`] of metrics at a
//! time, and the [`Exporter`] turns the current state of the agent into a flat list of
//! [`MetricInstance`]s for that cluster.
use std::{io, path::PathBuf, sync::Arc, time::Duration};

use statsd_util::{MetricKey, MetricKind};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    builder::ParserStrategy,
    parser::ParseError,
    store::{MetricStore, SnapshotValue, TimerSnapshot},
    telemetry::Telemetry,
    uptime::UptimeSource,
};

/// Errors that could occur while refreshing a cluster.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// A collaborator's file could not be opened or read.
    #[error("failed to read {path}: {source}")]
    FileUnreadable {
        /// Path of the file.
        path: PathBuf,

        /// Underlying I/O error.
        source: io::Error,
    },

    /// A collaborator returned data that could not be understood.
    #[error("malformed collaborator data: {reason}")]
    MalformedCollaboratorData {
        /// Details about the malformed data.
        reason: String,
    },

    /// The requested cluster does not exist.
    #[error("unknown cluster {0}")]
    UnknownCluster(u32),
}

/// A group of metrics refreshed together.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Cluster {
    /// Metrics aggregated from statsd traffic.
    Statsd,

    /// The agent's own telemetry.
    Agent,

    /// Host uptime counters.
    Host,
}

impl Cluster {
    /// Every cluster, in id order.
    pub const ALL: [Cluster; 3] = [Cluster::Statsd, Cluster::Agent, Cluster::Host];

    /// Numeric id of this cluster.
    pub const fn id(self) -> u32 {
        match self {
            Cluster::Statsd => 0,
            Cluster::Agent => 1,
            Cluster::Host => 2,
        }
    }
}

impl TryFrom<u32> for Cluster {
    type Error = CollaboratorError;

    fn try_from(id: u32) -> Result<Self, Self::Error> {
        Cluster::ALL.into_iter().find(|c| c.id() == id).ok_or(CollaboratorError::UnknownCluster(id))
    }
}

/// A single exported value.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricInstance {
    /// Metric name.
    pub name: String,

    /// Instance within the metric, `/` for a metric with a single instance.
    ///
    /// Tagged metrics render their tags as `/k1=v1::k2=v2`, with `\`, `:`, `=` and `|` in tag keys
    /// and values escaped by a backslash. Timer statistics append `|<stat>`, as in `/|count` or
    /// `/route=index|p99`.
    pub instance: String,

    /// Current value.
    pub value: f64,
}

impl MetricInstance {
    fn new<N: Into<String>, I: Into<String>>(name: N, instance: I, value: f64) -> Self {
        MetricInstance { name: name.into(), instance: instance.into(), value }
    }
}

const SINGULAR: &str = "/";
const AGENT_PREFIX: &str = "statsd.pmda.";

/// Agent settings exported alongside the agent telemetry.
#[derive(Clone, Debug)]
pub(crate) struct Settings {
    pub max_datagram_size: usize,
    pub queue_capacity: usize,
    pub max_keys: Option<usize>,
    pub max_set_members: Option<usize>,
    pub parser: ParserStrategy,
    pub idle_timeout: Option<Duration>,
    pub receive_threads: usize,
}

/// Maps agent state to exported metric instances.
pub struct Exporter {
    store: Arc<MetricStore>,
    telemetry: Arc<Telemetry>,
    prefix: String,
    uptime: Option<Arc<dyn UptimeSource>>,
    settings: Settings,
}

impl Exporter {
    pub(crate) fn new(
        store: Arc<MetricStore>,
        telemetry: Arc<Telemetry>,
        prefix: String,
        uptime: Option<Arc<dyn UptimeSource>>,
        settings: Settings,
    ) -> Self {
        Exporter { store, telemetry, prefix, uptime, settings }
    }

    /// Refreshes the given cluster, returning every instance in it.
    ///
    /// Refreshing [`Cluster::Statsd`] exports the aggregated metrics and resets them according to
    /// the configured reset policy, so each counter increment is exported exactly once.
    ///
    /// # Errors
    ///
    /// If a collaborator backing the cluster fails, its error is returned. The failure only affects
    /// this call.
    pub fn refresh(&self, cluster: Cluster) -> Result<Vec<MetricInstance>, CollaboratorError> {
        let instances = match cluster {
            Cluster::Statsd => self.refresh_statsd(),
            Cluster::Agent => self.refresh_agent(),
            Cluster::Host => self.refresh_host()?,
        };

        debug!(cluster = cluster.id(), instances = instances.len(), "Refreshed cluster.");
        Ok(instances)
    }

    /// Refreshes the cluster with the given numeric id.
    ///
    /// # Errors
    ///
    /// If the id does not name a cluster, [`CollaboratorError::UnknownCluster`] is returned.
    pub fn refresh_id(&self, id: u32) -> Result<Vec<MetricInstance>, CollaboratorError> {
        self.refresh(Cluster::try_from(id)?)
    }

    fn refresh_statsd(&self) -> Vec<MetricInstance> {
        let snapshot = self.store.snapshot();

        let mut instances = Vec::with_capacity(snapshot.len());
        for entry in snapshot {
            let name = format!("{}{}", self.prefix, entry.key.name());
            let instance = instance_of(&entry.key);
            match entry.value {
                SnapshotValue::Counter(value) | SnapshotValue::Gauge(value) => {
                    instances.push(MetricInstance::new(name, instance, value));
                }
                SnapshotValue::Set(cardinality) => {
                    instances.push(MetricInstance::new(name, instance, cardinality as f64));
                }
                SnapshotValue::Timer(timer) => timer_instances(&mut instances, &name, &instance, &timer),
            }
        }
        instances
    }

    fn refresh_agent(&self) -> Vec<MetricInstance> {
        let t = self.telemetry.snapshot();
        let tracked = self.store.tracked();
        let agent = |name: &str| format!("{}{}", AGENT_PREFIX, name);

        let mut instances = vec![
            MetricInstance::new(agent("received"), SINGULAR, t.received as f64),
            MetricInstance::new(agent("parsed"), SINGULAR, t.parsed as f64),
        ];
        for (label, count) in ParseError::LABELS.iter().zip(t.parse_errors) {
            instances.push(MetricInstance::new(agent("parse_errors"), format!("/{}", label), count as f64));
        }
        instances.push(MetricInstance::new(agent("parse_errors"), "/total", t.parse_errors_total() as f64));
        instances.extend([
            MetricInstance::new(agent("dropped"), SINGULAR, t.dropped as f64),
            MetricInstance::new(agent("aggregated"), SINGULAR, t.aggregated as f64),
            MetricInstance::new(agent("type_mismatch"), SINGULAR, t.type_mismatch as f64),
            MetricInstance::new(agent("store_full"), SINGULAR, t.store_full as f64),
            MetricInstance::new(agent("non_finite"), SINGULAR, t.non_finite as f64),
            MetricInstance::new(agent("evicted"), SINGULAR, t.evicted as f64),
            MetricInstance::new(agent("receive_failures"), SINGULAR, t.receive_failures as f64),
            MetricInstance::new(agent("time_spent_parsing"), SINGULAR, t.time_spent_parsing.as_secs_f64()),
            MetricInstance::new(
                agent("time_spent_aggregating"),
                SINGULAR,
                t.time_spent_aggregating.as_secs_f64(),
            ),
        ]);

        for kind in MetricKind::ALL {
            instances.push(MetricInstance::new(
                agent("metrics_tracked"),
                format!("/{}", kind),
                tracked.of(kind) as f64,
            ));
        }
        instances.push(MetricInstance::new(agent("metrics_tracked"), "/total", tracked.total() as f64));

        let s = &self.settings;
        instances.extend([
            MetricInstance::new(agent("settings.max_datagram_size"), SINGULAR, s.max_datagram_size as f64),
            MetricInstance::new(agent("settings.queue_capacity"), SINGULAR, s.queue_capacity as f64),
            MetricInstance::new(agent("settings.max_keys"), SINGULAR, s.max_keys.unwrap_or(0) as f64),
            MetricInstance::new(
                agent("settings.max_set_members"),
                SINGULAR,
                s.max_set_members.unwrap_or(0) as f64,
            ),
            MetricInstance::new(agent("settings.parser_type"), SINGULAR, f64::from(s.parser.id())),
            MetricInstance::new(
                agent("settings.idle_timeout"),
                SINGULAR,
                s.idle_timeout.map_or(0.0, |d| d.as_secs_f64()),
            ),
            MetricInstance::new(agent("settings.receive_threads"), SINGULAR, s.receive_threads as f64),
        ]);

        instances
    }

    fn refresh_host(&self) -> Result<Vec<MetricInstance>, CollaboratorError> {
        let Some(source) = &self.uptime else {
            return Ok(Vec::new());
        };

        let uptime = source.read().map_err(|e| {
            warn!(error = %e, "Failed to read uptime.");
            e
        })?;

        Ok(vec![
            MetricInstance::new("kernel.all.uptime", SINGULAR, uptime.uptime_seconds),
            MetricInstance::new("kernel.all.idletime", SINGULAR, uptime.idle_seconds),
        ])
    }
}

/// Renders the instance of a key: `/` when untagged, otherwise `/k1=v1::k2=v2` in tag order.
///
/// Separators appearing inside tag keys and values are escaped, so distinct tag sets never render
/// to the same instance.
pub(crate) fn instance_of(key: &MetricKey) -> String {
    let mut instance = String::from("/");
    for (i, tag) in key.tags().enumerate() {
        if i > 0 {
            instance.push_str("::");
        }
        escape_into(&mut instance, tag.key());
        if !tag.is_bare() {
            instance.push('=');
            escape_into(&mut instance, tag.value());
        }
    }
    instance
}

fn escape_into(out: &mut String, raw: &str) {
    for c in raw.chars() {
        if matches!(c, '\\' | ':' | '=' | '|') {
            out.push('\\');
        }
        out.push(c);
    }
}

// Timer statistics share the metric's name, and are told apart by a `|<stat>` instance suffix. A
// tag rendering never contains an unescaped `|`.
fn timer_instances(out: &mut Vec<MetricInstance>, name: &str, instance: &str, timer: &TimerSnapshot) {
    let mut push = |stat: &str, value: f64| {
        out.push(MetricInstance::new(name, format!("{}|{}", instance, stat), value));
    };

    push("count", timer.count as f64);
    push("min", timer.min);
    push("max", timer.max);
    push("sum", timer.sum);
    push("average", timer.average);
    push("std_deviation", timer.std_deviation);
    for (quantile, value) in &timer.quantiles {
        push(quantile.label(), *value);
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc, time::Duration};

    use quanta::Clock;
    use statsd_util::{parse_quantiles, MetricKey, MetricKindMask, Recency, Tag};

    use super::{instance_of, Cluster, CollaboratorError, Exporter, MetricInstance, Settings};
    use crate::{
        aggregator::{Aggregator, GaugeSemantics},
        builder::ParserStrategy,
        parser::{BasicParser, DatagramParser},
        store::{MetricStore, ResetPolicy},
        telemetry::Telemetry,
        uptime::{Uptime, UptimeSource},
    };

    struct FixedUptime(Option<Uptime>);

    impl UptimeSource for FixedUptime {
        fn read(&self) -> Result<Uptime, CollaboratorError> {
            self.0.ok_or_else(|| CollaboratorError::MalformedCollaboratorData {
                reason: "no uptime".to_string(),
            })
        }
    }

    fn settings() -> Settings {
        Settings {
            max_datagram_size: 1472,
            queue_capacity: 4096,
            max_keys: None,
            max_set_members: Some(10_000),
            parser: ParserStrategy::Basic,
            idle_timeout: Some(Duration::from_secs(600)),
            receive_threads: 1,
        }
    }

    fn setup(uptime: Option<Uptime>) -> (Exporter, Aggregator) {
        let recency = Recency::new(Clock::new(), MetricKindMask::ALL, None);
        let store = Arc::new(MetricStore::new(
            recency,
            parse_quantiles(&[0.5, 0.99]),
            ResetPolicy::default(),
            None,
        ));
        let telemetry = Arc::new(Telemetry::default());
        let source: Arc<dyn UptimeSource> = Arc::new(FixedUptime(uptime));
        let exporter = Exporter::new(
            Arc::clone(&store),
            Arc::clone(&telemetry),
            "statsd.".to_string(),
            Some(source),
            settings(),
        );
        let aggregator = Aggregator::new(store, telemetry, GaugeSemantics::Relative);
        (exporter, aggregator)
    }

    fn feed(aggregator: &Aggregator, statements: &[&str]) {
        for statement in statements {
            let datagram = BasicParser.parse_statement(statement).expect("valid statement");
            aggregator.aggregate(datagram).expect("aggregated");
        }
    }

    fn find<'a>(instances: &'a [MetricInstance], name: &str, instance: &str) -> Option<&'a MetricInstance> {
        instances.iter().find(|i| i.name == name && i.instance == instance)
    }

    #[test]
    fn cluster_ids() {
        for cluster in Cluster::ALL {
            assert_eq!(Cluster::try_from(cluster.id()).ok(), Some(cluster));
        }
        assert!(matches!(Cluster::try_from(7), Err(CollaboratorError::UnknownCluster(7))));
    }

    #[test]
    fn instances_render_sorted_tags() {
        let key = MetricKey::new("m", vec![Tag::new("zone", "b"), Tag::bare("canary"), Tag::new("az", "1")]);
        assert_eq!(instance_of(&key), "/az=1::canary::zone=b");
        assert_eq!(instance_of(&MetricKey::from_name("m")), "/");
    }

    #[test]
    fn instances_escape_separators() {
        let key = MetricKey::new("m", vec![Tag::new("a", "b::c=d")]);
        assert_eq!(instance_of(&key), r"/a=b\:\:c\=d");

        let key = MetricKey::new("m", vec![Tag::new("a", "b"), Tag::new("c", "d")]);
        assert_eq!(instance_of(&key), "/a=b::c=d");

        let key = MetricKey::new("m", vec![Tag::new(r"x\", "y|z")]);
        assert_eq!(instance_of(&key), r"/x\\=y\|z");
    }

    #[test]
    fn tag_values_with_separators_stay_distinct() {
        let (exporter, aggregator) = setup(None);
        feed(&aggregator, &["m:1|c|#a:b::c=d", "m:2|c|#a:b,c:d", "m:4|c|#a:b:c"]);

        let instances = exporter.refresh(Cluster::Statsd).expect("refresh");
        assert_eq!(instances.len(), 3);
        assert_eq!(find(&instances, "statsd.m", r"/a=b\:\:c\=d").map(|i| i.value), Some(1.0));
        assert_eq!(find(&instances, "statsd.m", "/a=b::c=d").map(|i| i.value), Some(2.0));
        assert_eq!(find(&instances, "statsd.m", r"/a=b\:c").map(|i| i.value), Some(4.0));
    }

    #[test]
    fn timer_statistics_never_collide_with_other_metrics() {
        let (exporter, aggregator) = setup(None);
        feed(&aggregator, &["lat.count:5|c", "lat:1|ms", "lat:7|c|#count", "lat.p99:3|g", "lat:2|ms|#count"]);

        let instances = exporter.refresh(Cluster::Statsd).expect("refresh");
        let identities = instances.iter().map(|i| (i.name.as_str(), i.instance.as_str())).collect::<HashSet<_>>();
        assert_eq!(identities.len(), instances.len());

        assert_eq!(find(&instances, "statsd.lat.count", "/").map(|i| i.value), Some(5.0));
        assert_eq!(find(&instances, "statsd.lat", "/|count").map(|i| i.value), Some(1.0));
        assert_eq!(find(&instances, "statsd.lat", "/count").map(|i| i.value), Some(7.0));
        assert_eq!(find(&instances, "statsd.lat", "/count|count").map(|i| i.value), Some(1.0));
        assert_eq!(find(&instances, "statsd.lat", "/count|max").map(|i| i.value), Some(2.0));
        assert_eq!(find(&instances, "statsd.lat.p99", "/").map(|i| i.value), Some(3.0));
    }

    #[test]
    fn statsd_cluster() {
        let (exporter, aggregator) = setup(None);
        feed(&aggregator, &["hits:3|c|#route:index", "temp:21.5|g", "users:a|s", "users:b|s", "lat:10|ms"]);

        let instances = exporter.refresh(Cluster::Statsd).expect("refresh");
        assert_eq!(find(&instances, "statsd.hits", "/route=index").map(|i| i.value), Some(3.0));
        assert_eq!(find(&instances, "statsd.temp", "/").map(|i| i.value), Some(21.5));
        assert_eq!(find(&instances, "statsd.users", "/").map(|i| i.value), Some(2.0));

        let stats = ["count", "min", "max", "sum", "average", "std_deviation", "p50", "p99"];
        for stat in stats {
            let instance = format!("/|{}", stat);
            assert!(find(&instances, "statsd.lat", &instance).is_some(), "missing {}", instance);
        }
        assert_eq!(find(&instances, "statsd.lat", "/|count").map(|i| i.value), Some(1.0));
        assert_eq!(find(&instances, "statsd.lat", "/|max").map(|i| i.value), Some(10.0));
    }

    #[test]
    fn refresh_is_idempotent_without_traffic() {
        let (exporter, aggregator) = setup(None);
        feed(&aggregator, &["hits:3|c", "temp:21.5|g", "lat:10|ms"]);

        let _ = exporter.refresh(Cluster::Statsd).expect("refresh");
        let first = exporter.refresh(Cluster::Statsd).expect("refresh");
        let second = exporter.refresh(Cluster::Statsd).expect("refresh");

        assert_eq!(first, second);
        assert_eq!(find(&first, "statsd.hits", "/").map(|i| i.value), Some(0.0));
        assert_eq!(find(&first, "statsd.temp", "/").map(|i| i.value), Some(21.5));
        assert_eq!(find(&first, "statsd.lat", "/|count").map(|i| i.value), Some(0.0));
        assert_eq!(find(&first, "statsd.lat", "/|p99").map(|i| i.value), Some(0.0));
    }

    #[test]
    fn agent_cluster() {
        let (exporter, aggregator) = setup(None);
        feed(&aggregator, &["a:1|c", "b:1|g", "c:1|g", "d:1|ms"]);

        let instances = exporter.refresh(Cluster::Agent).expect("refresh");
        let tracked = |instance: &str| find(&instances, "statsd.pmda.metrics_tracked", instance).map(|i| i.value);
        assert_eq!(tracked("/counter"), Some(1.0));
        assert_eq!(tracked("/gauge"), Some(2.0));
        assert_eq!(tracked("/timer"), Some(1.0));
        assert_eq!(tracked("/set"), Some(0.0));
        assert_eq!(tracked("/total"), Some(4.0));

        assert!(find(&instances, "statsd.pmda.parse_errors", "/unknown_type").is_some());
        assert_eq!(find(&instances, "statsd.pmda.parse_errors", "/total").map(|i| i.value), Some(0.0));
        assert_eq!(find(&instances, "statsd.pmda.non_finite", "/").map(|i| i.value), Some(0.0));
        assert_eq!(
            find(&instances, "statsd.pmda.settings.max_set_members", "/").map(|i| i.value),
            Some(10_000.0)
        );
        assert_eq!(
            find(&instances, "statsd.pmda.settings.max_datagram_size", "/").map(|i| i.value),
            Some(1472.0)
        );
    }

    #[test]
    fn host_cluster() {
        let uptime = Uptime { uptime_seconds: 120.0, idle_seconds: 60.0 };
        let (exporter, _) = setup(Some(uptime));
        let instances = exporter.refresh(Cluster::Host).expect("refresh");
        assert_eq!(
            instances,
            vec![
                MetricInstance::new("kernel.all.uptime", "/", 120.0),
                MetricInstance::new("kernel.all.idletime", "/", 60.0),
            ]
        );
    }

    #[test]
    fn host_failure_only_fails_that_refresh() {
        let (exporter, aggregator) = setup(None);
        feed(&aggregator, &["hits:1|c"]);

        let result = exporter.refresh(Cluster::Host);
        assert!(matches!(result, Err(CollaboratorError::MalformedCollaboratorData { .. })));

        let instances = exporter.refresh_id(0).expect("statsd cluster still refreshes");
        assert_eq!(find(&instances, "statsd.hits", "/").map(|i| i.value), Some(1.0));
    }
}
