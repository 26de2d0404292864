use std::{
    io,
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam_channel::{Sender, TrySendError};
use quanta::Clock;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::{
    parser::{Datagram, DatagramParser, ParseError},
    telemetry::{Telemetry, TelemetryUpdate},
};

/// Errors that could occur on the network side of the agent.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to bind or configure the listening socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address being bound.
        addr: SocketAddr,

        /// Underlying I/O error.
        source: io::Error,
    },

    /// The socket was closed underneath the listener.
    #[error("socket closed: {0}")]
    SocketClosed(io::Error),

    /// Receiving failed too many times in a row.
    #[error("giving up after {failures} consecutive receive failures: {source}")]
    ReceiveFailure {
        /// Number of consecutive failures.
        failures: usize,

        /// The last receive error.
        source: io::Error,
    },

    /// Failed to spawn a background thread.
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        /// Name of the thread.
        name: String,

        /// Underlying I/O error.
        source: io::Error,
    },
}

/// Listener configuration.
#[derive(Clone, Debug)]
pub(crate) struct ListenerConfiguration {
    pub max_datagram_size: usize,
    pub max_consecutive_failures: usize,
}

/// Binds the listening socket, ready to be shared by every listener.
pub(crate) fn bind(addr: SocketAddr, poll_interval: Duration) -> Result<UdpSocket, TransportError> {
    let socket = UdpSocket::bind(addr).map_err(|source| TransportError::Bind { addr, source })?;
    socket
        .set_read_timeout(Some(poll_interval))
        .map_err(|source| TransportError::Bind { addr, source })?;
    Ok(socket)
}

/// Receives datagrams, parses them, and queues the results for aggregation.
///
/// A listener never waits on aggregation: when the queue is full, parsed statements are dropped and
/// counted.
pub(crate) struct Listener<P> {
    socket: UdpSocket,
    parser: P,
    sender: Sender<Datagram>,
    telemetry: Arc<Telemetry>,
    shutdown: Arc<AtomicBool>,
    clock: Clock,
    config: ListenerConfiguration,
}

impl<P> Listener<P>
where
    P: DatagramParser,
{
    pub fn new(
        socket: UdpSocket,
        parser: P,
        sender: Sender<Datagram>,
        telemetry: Arc<Telemetry>,
        shutdown: Arc<AtomicBool>,
        clock: Clock,
        config: ListenerConfiguration,
    ) -> Self {
        Listener { socket, parser, sender, telemetry, shutdown, clock, config }
    }

    /// Runs the listener until shutdown is requested or the socket fails persistently.
    ///
    /// A persistent failure also requests shutdown, so the rest of the agent winds down with it.
    pub fn run(self) -> Result<(), TransportError> {
        let result = self.receive_loop();
        if let Err(e) = &result {
            error!(error = %e, "Listener failed, shutting down.");
            self.shutdown.store(true, Ordering::Release);
        }
        result
    }

    fn receive_loop(&self) -> Result<(), TransportError> {
        // One spare byte, so that oversized datagrams are seen as such instead of silently truncated.
        let mut buf = vec![0u8; self.config.max_datagram_size + 1];
        let mut update = TelemetryUpdate::default();
        let mut failures = 0;

        debug!(max_datagram_size = self.config.max_datagram_size, "Listener started.");

        while !self.shutdown.load(Ordering::Acquire) {
            match self.socket.recv_from(&mut buf) {
                Ok((len, peer)) => {
                    failures = 0;
                    self.handle_datagram(&buf[..len], peer, &mut update);
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if is_closed(&e) => return Err(TransportError::SocketClosed(e)),
                Err(e) => {
                    failures += 1;
                    update.track_receive_failure();
                    error!(error = %e, failures, "Failed to receive datagram.");

                    if failures >= self.config.max_consecutive_failures {
                        self.telemetry.apply_update(&update);
                        return Err(TransportError::ReceiveFailure { failures, source: e });
                    }
                }
            }

            self.telemetry.apply_update(&update);
            update.clear();
        }

        debug!("Shutdown requested, listener stopping.");
        Ok(())
    }

    fn handle_datagram(&self, buf: &[u8], peer: SocketAddr, update: &mut TelemetryUpdate) {
        update.track_received();

        let start = self.clock.now();
        match self.parser.parse(buf, self.config.max_datagram_size) {
            Ok(statements) => {
                for statement in statements {
                    match statement {
                        Ok(datagram) => {
                            update.track_parsed();
                            self.enqueue(datagram, update);
                        }
                        Err(e) => {
                            trace!(error = %e, %peer, "Dropping malformed statement.");
                            update.track_parse_error(&e);
                        }
                    }
                }
            }
            Err(e @ ParseError::TooLarge { .. }) => {
                warn!(error = %e, %peer, "Dropping oversized datagram.");
                update.track_parse_error(&e);
            }
            Err(e) => update.track_parse_error(&e),
        }
        update.track_parsing_time(self.clock.now().saturating_duration_since(start));
    }

    fn enqueue(&self, datagram: Datagram, update: &mut TelemetryUpdate) {
        match self.sender.try_send(datagram) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => update.track_dropped(),
            Err(TrySendError::Disconnected(_)) => {
                trace!("Aggregator gone, dropping datagram.");
                update.track_dropped();
            }
        }
    }
}

fn is_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotConnected | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use std::{
        net::{SocketAddr, UdpSocket},
        sync::{atomic::AtomicBool, Arc},
        thread,
        time::Duration,
    };

    use quanta::Clock;

    use super::{bind, Listener, ListenerConfiguration, TransportError};
    use crate::{parser::BasicParser, telemetry::Telemetry};

    fn localhost() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[test]
    fn bind_conflict_is_reported() {
        let taken = UdpSocket::bind(localhost()).expect("bind ephemeral port");
        let addr = taken.local_addr().expect("local addr");

        let result = bind(addr, Duration::from_millis(10));
        assert!(matches!(result, Err(TransportError::Bind { .. })), "{:?}", result);
    }

    #[test]
    fn sheds_when_queue_is_full() {
        let socket = bind(localhost(), Duration::from_millis(10)).expect("bind");
        let addr = socket.local_addr().expect("local addr");
        let (sender, receiver) = crossbeam_channel::bounded(2);
        let telemetry = Arc::new(Telemetry::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let listener = Listener::new(
            socket,
            BasicParser,
            sender,
            Arc::clone(&telemetry),
            Arc::clone(&shutdown),
            Clock::new(),
            ListenerConfiguration {
                max_datagram_size: 64,
                max_consecutive_failures: 3,
            },
        );
        let handle = thread::spawn(move || listener.run());

        let client = UdpSocket::bind(localhost()).expect("bind client");
        client.send_to(b"a:1|c\nb:1|c\nc:1|c\nd:1|c", addr).expect("send");
        client.send_to(&[b'x'; 100], addr).expect("send oversized");

        for _ in 0..200 {
            if telemetry.snapshot().received == 2 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        shutdown.store(true, std::sync::atomic::Ordering::Release);
        handle.join().expect("listener panicked").expect("clean shutdown");

        let snapshot = telemetry.snapshot();

        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.parsed, 4);
        assert_eq!(snapshot.dropped, 2);
        assert_eq!(snapshot.parse_errors[0], 1);
        assert_eq!(receiver.len(), 2);
    }
}
