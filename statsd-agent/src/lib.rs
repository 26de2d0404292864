//! A [statsd]-compatible ingestion and aggregation agent, exporting to a metrics coordinator.
//!
//! [statsd]: https://github.com/statsd/statsd/blob/master/docs/metric_types.md
//!
//! # Usage
//!
//! ```no_run
//! # use statsd_agent::{AgentBuilder, Cluster};
//! // First, create a builder.
//! //
//! // The builder can configure many aspects of the agent, such as changing the listen address, the
//! // parsing strategy, how long idle metrics are kept around, which quantiles timers export, and more.
//! let builder = AgentBuilder::default()
//!     .with_listen_address("127.0.0.1:8125")
//!     .expect("valid listen address");
//!
//! // Building the agent binds the socket and starts the background threads: from here on, datagrams
//! // are received, parsed and aggregated.
//! let mut agent = builder.build().expect("failed to start agent");
//!
//! // Whenever the coordinator polls the agent, refresh the cluster it asks for.
//! for instance in agent.refresh(Cluster::Statsd).expect("statsd cluster never fails") {
//!     println!("{}[{}] = {}", instance.name, instance.instance, instance.value);
//! }
//!
//! // Shutting down drains everything that was already received.
//! agent.shutdown().expect("listeners ran without transport errors");
//! ```
//!
//! # Pipeline
//!
//! ## Listening
//!
//! One or more listener threads receive datagrams from a shared UDP socket. Each datagram holds one
//! or more newline-separated statements, which are parsed with the configured [`ParserStrategy`].
//! Both strategies accept and reject exactly the same input.
//!
//! ## Queueing
//!
//! Parsed statements are handed to the aggregator through a bounded queue. Listeners never wait on
//! the queue: when it is full, statements are dropped and counted, so that a slow aggregator cannot
//! stall receiving.
//!
//! ## Aggregation
//!
//! A single aggregator thread applies statements to the metric store in order. Counters accumulate
//! their values scaled by the inverse of the sample rate, gauges track their latest value, timers
//! accumulate summary statistics and quantiles, and sets count their distinct members. A metric is
//! identified by its name and its sorted tags, and keeps the type it was first seen with.
//!
//! ## Exporting
//!
//! Metrics are exported in three clusters: the aggregated statsd metrics, the agent's own
//! telemetry and settings, and host uptime counters. Refreshing the statsd cluster resets counters,
//! timers and sets, so every update is exported exactly once.
//!
//! ## Idle metrics
//!
//! Metrics that have not been updated within the idle timeout are evicted by a background sweeper,
//! bounding memory use when metric names churn.
//!
//! # Telemetry
//!
//! The agent tracks how many datagrams were received, parsed, dropped or rejected (per error kind),
//! how many statements were aggregated or rejected, how many metrics were evicted, and how much
//! time was spent parsing and aggregating. All of it is exported under `statsd.pmda`.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod aggregator;
pub use self::aggregator::GaugeSemantics;

mod builder;
pub use self::builder::{AgentBuilder, BuildError, ParserStrategy};

mod exporter;
pub use self::exporter::{Cluster, CollaboratorError, Exporter, MetricInstance};

mod handle;
pub use self::handle::AgentHandle;

mod listener;
pub use self::listener::TransportError;

pub mod parser;

mod store;
pub use self::store::{AggregationError, ResetPolicy};

mod telemetry;

mod uptime;
pub use self::uptime::{ProcUptime, Uptime, UptimeSource};

pub use statsd_util::{MetricKey, MetricKind, MetricKindMask, Tag};
