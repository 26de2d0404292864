use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use crossbeam_channel::Sender;
use tracing::{debug, error};

use crate::{
    exporter::{Cluster, CollaboratorError, Exporter, MetricInstance},
    listener::TransportError,
};

/// A running statsd agent.
///
/// Dropping the handle stops the agent, as [`shutdown`](AgentHandle::shutdown) does, but discards any
/// listener error.
pub struct AgentHandle {
    local_addr: SocketAddr,
    exporter: Exporter,
    shutdown: Arc<AtomicBool>,
    listeners: Vec<JoinHandle<Result<(), TransportError>>>,
    aggregator: Option<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
    sweeper_stop: Option<Sender<()>>,
}

impl AgentHandle {
    pub(crate) fn new(local_addr: SocketAddr, exporter: Exporter, shutdown: Arc<AtomicBool>) -> Self {
        AgentHandle {
            local_addr,
            exporter,
            shutdown,
            listeners: Vec::new(),
            aggregator: None,
            sweeper: None,
            sweeper_stop: None,
        }
    }

    pub(crate) fn add_listener(&mut self, listener: JoinHandle<Result<(), TransportError>>) {
        self.listeners.push(listener);
    }

    pub(crate) fn set_aggregator(&mut self, aggregator: JoinHandle<()>) {
        self.aggregator = Some(aggregator);
    }

    pub(crate) fn set_sweeper(&mut self, sweeper: JoinHandle<()>, stop: Sender<()>) {
        self.sweeper = Some(sweeper);
        self.sweeper_stop = Some(stop);
    }

    /// Address the agent is listening on.
    ///
    /// When the agent was configured with port 0, this holds the port actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The exporter for the agent's metrics.
    pub fn exporter(&self) -> &Exporter {
        &self.exporter
    }

    /// Refreshes a cluster of exported metrics.
    ///
    /// Shorthand for `self.exporter().refresh(cluster)`.
    ///
    /// # Errors
    ///
    /// See [`Exporter::refresh`].
    pub fn refresh(&self, cluster: Cluster) -> Result<Vec<MetricInstance>, CollaboratorError> {
        self.exporter.refresh(cluster)
    }

    /// Returns `true` once shutdown has begun, either requested or because a listener failed.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stops the agent.
    ///
    /// Listeners stop receiving, then the aggregator drains every statement already queued before
    /// stopping, so the store reflects everything that was accepted. The exporter stays usable
    /// until the handle is dropped. Calling this again has no effect.
    ///
    /// # Errors
    ///
    /// If a listener had stopped because of a transport failure, the first such error is returned.
    pub fn shutdown(&mut self) -> Result<(), TransportError> {
        self.shutdown.store(true, Ordering::Release);

        let mut result = Ok(());
        for listener in self.listeners.drain(..) {
            match listener.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
                Err(_) => error!("Listener thread panicked."),
            }
        }

        // Every sender is gone with the listeners, so the aggregator exits once the queue is drained.
        if let Some(aggregator) = self.aggregator.take() {
            if aggregator.join().is_err() {
                error!("Aggregator thread panicked.");
            }
        }

        drop(self.sweeper_stop.take());
        if let Some(sweeper) = self.sweeper.take() {
            if sweeper.join().is_err() {
                error!("Sweeper thread panicked.");
            }
        }

        debug!("Statsd agent stopped.");
        result
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        if self.listeners.is_empty() && self.aggregator.is_none() && self.sweeper.is_none() {
            return;
        }
        let _ = self.shutdown();
    }
}
