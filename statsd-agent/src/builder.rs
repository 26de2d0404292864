use std::{
    net::{SocketAddr, ToSocketAddrs as _, UdpSocket},
    sync::{atomic::AtomicBool, Arc},
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::Sender;
use quanta::Clock;
use statsd_util::{parse_quantiles, MetricKindMask, Quantile, Recency};
use thiserror::Error;
use tracing::info;

use crate::{
    aggregator::{Aggregator, GaugeSemantics},
    exporter::{Exporter, Settings},
    handle::AgentHandle,
    listener::{self, Listener, ListenerConfiguration, TransportError},
    parser::{BasicParser, Datagram, DatagramParser, GrammarParser},
    store::{MetricStore, ResetPolicy, Sweeper},
    telemetry::Telemetry,
    uptime::UptimeSource,
};

const DEFAULT_LISTEN_ADDRESS: ([u8; 4], u16) = ([0, 0, 0, 0], 8125);
const DEFAULT_MAX_DATAGRAM_SIZE: usize = 1472;
const DEFAULT_QUEUE_CAPACITY: usize = 4096;
const DEFAULT_MAX_KEYS: usize = 65_536;
const DEFAULT_MAX_SET_MEMBERS: usize = 10_000;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_QUANTILES: [f64; 4] = [0.5, 0.9, 0.95, 0.99];
const DEFAULT_PREFIX: &str = "statsd.";
const DEFAULT_RECEIVE_THREADS: usize = 1;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_MAX_CONSECUTIVE_RECEIVE_FAILURES: usize = 16;

/// Errors that could occur while building the agent.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Failed to parse the listen address.
    #[error("invalid listen address: {reason}")]
    InvalidListenAddress {
        /// Details about the parsing failure.
        reason: String,
    },

    /// A configured quantile is outside of `[0, 1]`.
    #[error("invalid quantile {0}: quantiles must be between 0.0 and 1.0")]
    InvalidQuantile(f64),

    /// A setting is out of range.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Details about the invalid setting.
        reason: String,
    },

    /// Failed to bind the socket or start a background thread.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Datagram parsing strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ParserStrategy {
    /// Hand-rolled scanner. See [`BasicParser`].
    #[default]
    Basic,

    /// Regular-expression grammar. See [`GrammarParser`].
    Grammar,
}

impl ParserStrategy {
    /// Numeric id of this strategy, as exported in the agent settings.
    pub const fn id(self) -> u8 {
        match self {
            ParserStrategy::Basic => 0,
            ParserStrategy::Grammar => 1,
        }
    }
}

/// Builder for a statsd agent.
pub struct AgentBuilder {
    listen_addr: SocketAddr,
    max_datagram_size: usize,
    queue_capacity: usize,
    max_keys: Option<usize>,
    max_set_members: Option<usize>,
    recency_mask: MetricKindMask,
    idle_timeout: Option<Duration>,
    sweep_interval: Duration,
    quantiles: Vec<Quantile>,
    parser: ParserStrategy,
    reset_policy: ResetPolicy,
    gauge_semantics: GaugeSemantics,
    prefix: String,
    receive_threads: usize,
    poll_interval: Duration,
    max_consecutive_receive_failures: usize,
    uptime: Option<Arc<dyn UptimeSource>>,
}

impl AgentBuilder {
    /// Set the address to listen on for statsd datagrams.
    ///
    /// The address must be in the format of `<host>:<port>`. If the host resolves to several
    /// addresses, the first one is used.
    ///
    /// Defaults to `0.0.0.0:8125`.
    ///
    /// # Errors
    ///
    /// If the given address is not able to be parsed as a valid address, an error will be returned
    /// indicating the reason.
    pub fn with_listen_address<A>(mut self, addr: A) -> Result<Self, BuildError>
    where
        A: AsRef<str>,
    {
        let addr = addr.as_ref();
        self.listen_addr = addr
            .to_socket_addrs()
            .map_err(|e| BuildError::InvalidListenAddress { reason: e.to_string() })?
            .next()
            .ok_or_else(|| BuildError::InvalidListenAddress {
                reason: format!("'{}' did not resolve to any address", addr),
            })?;
        Ok(self)
    }

    /// Set the maximum datagram size, in bytes.
    ///
    /// Larger datagrams are rejected as a whole, without being parsed.
    ///
    /// Defaults to 1472 bytes, the largest UDP payload that fits in a standard Ethernet frame.
    #[must_use]
    pub fn with_max_datagram_size(mut self, max_datagram_size: usize) -> Self {
        self.max_datagram_size = max_datagram_size;
        self
    }

    /// Set the capacity of the queue between the listeners and the aggregator.
    ///
    /// When the queue is full, newly parsed statements are dropped rather than slowing down the
    /// listeners.
    ///
    /// Defaults to 4096 statements.
    #[must_use]
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Set the maximum number of distinct metrics tracked at once, or `None` for no limit.
    ///
    /// Once the limit is reached, statements for new metrics are rejected while existing metrics
    /// keep updating.
    ///
    /// Defaults to 65,536.
    #[must_use]
    pub fn with_max_keys(mut self, max_keys: Option<usize>) -> Self {
        self.max_keys = max_keys;
        self
    }

    /// Set the maximum number of distinct members a single set tracks between exports, or `None`
    /// for no limit.
    ///
    /// Once a set is full, statements adding new members to it are rejected and counted as
    /// `store_full`, while members it already holds are still accepted.
    ///
    /// Defaults to 10,000.
    #[must_use]
    pub fn with_max_set_members(mut self, max_set_members: Option<usize>) -> Self {
        self.max_set_members = max_set_members;
        self
    }

    /// Set the idle timeout for metrics.
    ///
    /// Metrics of a kind matching `mask` that have not been updated for longer than `timeout` are
    /// evicted, and are no longer exported until they are updated again. `None` disables eviction.
    ///
    /// Refer to the documentation for [`MetricKindMask`](statsd_util::MetricKindMask) for more
    /// information on defining a metric kind mask.
    ///
    /// Defaults to 10 minutes, for every kind.
    #[must_use]
    pub fn with_idle_timeout(mut self, mask: MetricKindMask, timeout: Option<Duration>) -> Self {
        self.recency_mask = if timeout.is_some() { mask } else { MetricKindMask::NONE };
        self.idle_timeout = timeout;
        self
    }

    /// Set how often idle metrics are looked for.
    ///
    /// Defaults to 10 seconds.
    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the quantiles exported for timers.
    ///
    /// Each quantile is exported as its own statistic, labelled like a percentile: `0.9` is
    /// exported as `p90`.
    ///
    /// Defaults to `[0.5, 0.9, 0.95, 0.99]`.
    ///
    /// # Errors
    ///
    /// If any quantile is outside of `[0, 1]`, an error is returned.
    pub fn with_quantiles(mut self, quantiles: &[f64]) -> Result<Self, BuildError> {
        if let Some(q) = quantiles.iter().find(|q| !(0.0..=1.0).contains(*q)) {
            return Err(BuildError::InvalidQuantile(*q));
        }
        self.quantiles = parse_quantiles(quantiles);
        Ok(self)
    }

    /// Set the datagram parsing strategy.
    ///
    /// Both strategies accept exactly the same input.
    ///
    /// Defaults to [`ParserStrategy::Basic`].
    #[must_use]
    pub fn with_parser(mut self, parser: ParserStrategy) -> Self {
        self.parser = parser;
        self
    }

    /// Set which metrics are reset after being exported.
    ///
    /// Defaults to resetting counters, timers and sets, and retaining gauges.
    #[must_use]
    pub fn with_reset_policy(mut self, reset_policy: ResetPolicy) -> Self {
        self.reset_policy = reset_policy;
        self
    }

    /// Set how signed gauge updates are applied.
    ///
    /// Defaults to [`GaugeSemantics::Relative`].
    #[must_use]
    pub fn with_gauge_semantics(mut self, gauge_semantics: GaugeSemantics) -> Self {
        self.gauge_semantics = gauge_semantics;
        self
    }

    /// Set the prefix prepended to the names of exported statsd metrics.
    ///
    /// Defaults to `statsd.`.
    #[must_use]
    pub fn with_prefix<P: Into<String>>(mut self, prefix: P) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set the number of threads receiving datagrams from the socket.
    ///
    /// Defaults to 1.
    #[must_use]
    pub fn with_receive_threads(mut self, receive_threads: usize) -> Self {
        self.receive_threads = receive_threads;
        self
    }

    /// Set how long a listener waits for a datagram before checking for shutdown.
    ///
    /// Defaults to 100 milliseconds.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set how many receive failures in a row stop the agent.
    ///
    /// Defaults to 16.
    #[must_use]
    pub fn with_max_consecutive_receive_failures(mut self, failures: usize) -> Self {
        self.max_consecutive_receive_failures = failures;
        self
    }

    /// Set the source of host uptime counters, exported under [`Cluster::Host`].
    ///
    /// Defaults to none, which exports an empty host cluster.
    ///
    /// [`Cluster::Host`]: crate::Cluster::Host
    #[must_use]
    pub fn with_uptime_source<U>(mut self, source: U) -> Self
    where
        U: UptimeSource + 'static,
    {
        self.uptime = Some(Arc::new(source));
        self
    }

    /// Builds and starts the agent.
    ///
    /// The socket is bound, and the listener, aggregator and sweeper threads are spawned.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, the socket cannot be bound, or a thread cannot be spawned,
    /// an error will be returned.
    pub fn build(self) -> Result<AgentHandle, BuildError> {
        self.build_with_clock(Clock::new())
    }

    /// Builds and starts the agent, using the given clock to track metric activity.
    ///
    /// This is mostly useful in tests, where a mocked clock can drive idle timeouts.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, the socket cannot be bound, or a thread cannot be spawned,
    /// an error will be returned.
    pub fn build_with_clock(self, clock: Clock) -> Result<AgentHandle, BuildError> {
        self.validate()?;

        let socket = listener::bind(self.listen_addr, self.poll_interval)?;
        let local_addr = socket
            .local_addr()
            .map_err(|source| TransportError::Bind { addr: self.listen_addr, source })?;

        let recency = Recency::new(clock.clone(), self.recency_mask, self.idle_timeout);
        let store = Arc::new(MetricStore::new(
            recency,
            self.quantiles,
            self.reset_policy,
            self.max_keys,
        ));
        let telemetry = Arc::new(Telemetry::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let settings = Settings {
            max_datagram_size: self.max_datagram_size,
            queue_capacity: self.queue_capacity,
            max_keys: self.max_keys,
            max_set_members: self.max_set_members,
            parser: self.parser,
            idle_timeout: self.idle_timeout,
            receive_threads: self.receive_threads,
        };
        let exporter = Exporter::new(
            Arc::clone(&store),
            Arc::clone(&telemetry),
            self.prefix,
            self.uptime,
            settings,
        );

        // Any early return from here on drops the handle, which stops whatever was already spawned.
        // The queue is created afterwards so that its sender is dropped first, letting the
        // aggregator drain and exit.
        let mut handle = AgentHandle::new(local_addr, exporter, Arc::clone(&shutdown));

        let (sender, receiver) = crossbeam_channel::bounded(self.queue_capacity);

        let aggregator = Aggregator::new(Arc::clone(&store), Arc::clone(&telemetry), self.gauge_semantics)
            .with_max_set_members(self.max_set_members);
        handle.set_aggregator(spawn("statsd-aggregator".to_string(), move || {
            aggregator.run(receiver);
        })?);

        if self.idle_timeout.is_some() {
            let (stop, stopped) = crossbeam_channel::bounded(0);
            let sweeper = Sweeper::new(Arc::clone(&store), Arc::clone(&telemetry), self.sweep_interval);
            let thread = spawn("statsd-sweeper".to_string(), move || sweeper.run(&stopped))?;
            handle.set_sweeper(thread, stop);
        }

        let context = ListenerContext {
            socket: &socket,
            sender: &sender,
            telemetry: &telemetry,
            shutdown: &shutdown,
            clock: &clock,
            config: ListenerConfiguration {
                max_datagram_size: self.max_datagram_size,
                max_consecutive_failures: self.max_consecutive_receive_failures,
            },
            threads: self.receive_threads,
        };
        match self.parser {
            ParserStrategy::Basic => context.spawn_all(BasicParser, &mut handle)?,
            ParserStrategy::Grammar => context.spawn_all(GrammarParser::new(), &mut handle)?,
        }
        drop(sender);

        info!(
            %local_addr,
            parser = ?self.parser,
            receive_threads = self.receive_threads,
            queue_capacity = self.queue_capacity,
            "Statsd agent listening."
        );

        Ok(handle)
    }

    fn validate(&self) -> Result<(), BuildError> {
        let invalid = |reason: &str| Err(BuildError::InvalidConfiguration { reason: reason.to_string() });

        if self.max_datagram_size == 0 {
            return invalid("maximum datagram size must be greater than zero");
        }
        if self.queue_capacity == 0 {
            return invalid("queue capacity must be greater than zero");
        }
        if self.max_keys == Some(0) {
            return invalid("maximum number of keys must be greater than zero");
        }
        if self.max_set_members == Some(0) {
            return invalid("maximum number of set members must be greater than zero");
        }
        if self.receive_threads == 0 {
            return invalid("at least one receive thread is required");
        }
        if self.poll_interval.is_zero() {
            return invalid("poll interval must be greater than zero");
        }
        if self.sweep_interval.is_zero() {
            return invalid("sweep interval must be greater than zero");
        }
        if self.idle_timeout.is_some_and(|t| t.is_zero()) {
            return invalid("idle timeout must be greater than zero");
        }
        if self.max_consecutive_receive_failures == 0 {
            return invalid("receive failure limit must be greater than zero");
        }
        Ok(())
    }
}

impl Default for AgentBuilder {
    fn default() -> Self {
        AgentBuilder {
            listen_addr: SocketAddr::from(DEFAULT_LISTEN_ADDRESS),
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_keys: Some(DEFAULT_MAX_KEYS),
            max_set_members: Some(DEFAULT_MAX_SET_MEMBERS),
            recency_mask: MetricKindMask::ALL,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            quantiles: parse_quantiles(&DEFAULT_QUANTILES),
            parser: ParserStrategy::default(),
            reset_policy: ResetPolicy::default(),
            gauge_semantics: GaugeSemantics::default(),
            prefix: DEFAULT_PREFIX.to_string(),
            receive_threads: DEFAULT_RECEIVE_THREADS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_consecutive_receive_failures: DEFAULT_MAX_CONSECUTIVE_RECEIVE_FAILURES,
            uptime: None,
        }
    }
}

struct ListenerContext<'a> {
    socket: &'a UdpSocket,
    sender: &'a Sender<Datagram>,
    telemetry: &'a Arc<Telemetry>,
    shutdown: &'a Arc<AtomicBool>,
    clock: &'a Clock,
    config: ListenerConfiguration,
    threads: usize,
}

impl ListenerContext<'_> {
    fn spawn_all<P>(&self, parser: P, handle: &mut AgentHandle) -> Result<(), BuildError>
    where
        P: DatagramParser,
    {
        for i in 0..self.threads {
            let addr = handle.local_addr();
            let socket = self
                .socket
                .try_clone()
                .map_err(|source| TransportError::Bind { addr, source })?;
            let listener = Listener::new(
                socket,
                parser.clone(),
                self.sender.clone(),
                Arc::clone(self.telemetry),
                Arc::clone(self.shutdown),
                self.clock.clone(),
                self.config.clone(),
            );
            handle.add_listener(spawn(format!("statsd-listener-{}", i), move || listener.run())?);
        }
        Ok(())
    }
}

fn spawn<F, T>(name: String, f: F) -> Result<JoinHandle<T>, BuildError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|source| BuildError::Transport(TransportError::Spawn { name, source }))
}
