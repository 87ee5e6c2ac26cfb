//! Per-endpoint connection state machine.
//!
//! ```text
//!                 connect (A)
//!  Disconnected ──────────────► Connecting ──── ok (D) ───► Connected ◄─┐
//!       ▲  ▲                      │    ▲                     │   │  ping (G/H/I)
//!       │  │        failed (E)    │    │ retry due (A)       │   └──────┘
//!       │  │                      ▼    │                     │
//!       │  └───── disconnect ─ Reconnecting ◄──── lost (F) ──┘
//!       └──────── disconnect (B) from Connecting / Connected
//! ```
//!
//! Every transition that the consumer can observe pushes its events onto
//! the loop's [`EventQueue`]; nothing here calls the handler directly.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::IoConfig;
use crate::dispatch::{Event, EventQueue, LogLevel};
use crate::error::IoError;
use crate::flags::ConnectionOptions;
use crate::transport::Transport;
use crate::worker::{ConnectWorker, Established, Target, WorkerContext};

/// Reads taken from one socket per wakeup before yielding to the others.
const MAX_READS_PER_WAKE: usize = 16;

// ── ConnectionPhase ──────────────────────────────────────────────

/// Observable lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    /// Idle. Initial state, and the state after an explicit disconnect.
    #[default]
    Disconnected,
    /// Waiting for the backoff deadline before the next attempt.
    Reconnecting,
    /// A connect worker is resolving, connecting or handshaking.
    Connecting,
    /// Established; bytes flow in both directions.
    Connected,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Reconnecting => write!(f, "Reconnecting"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

// ── Policy ───────────────────────────────────────────────────────

/// Timing and buffer limits shared by every connection.
#[derive(Debug, Clone)]
pub(crate) struct Policy {
    pub(crate) backoff: Backoff,
    pub(crate) ping_interval: Duration,
    pub(crate) ping_ceiling: u32,
    pub(crate) read_chunk: usize,
    pub(crate) send_limit: usize,
}

impl From<&IoConfig> for Policy {
    fn from(config: &IoConfig) -> Self {
        Self {
            backoff: config.backoff(),
            ping_interval: config.ping_interval(),
            ping_ceiling: config.ping.ceiling,
            read_chunk: config.limits.read_chunk_bytes.max(1),
            send_limit: config.limits.send_queue_bytes,
        }
    }
}

fn after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .unwrap_or_else(|| now + Duration::from_secs(86_400))
}

// ── Link ─────────────────────────────────────────────────────────

struct Live {
    transport: Transport,
    peer: SocketAddr,
    ping: u32,
    last_rx: Instant,
}

enum Link {
    Disconnected,
    Reconnecting { retry_at: Instant },
    Connecting { worker: ConnectWorker },
    Connected(Live),
}

// ── Connection ───────────────────────────────────────────────────

/// One IRC server endpoint and everything needed to (re)connect to it.
pub struct Connection<O> {
    owner: O,
    host: String,
    port: String,
    options: ConnectionOptions,
    link: Link,
    attempt: u32,
    outbound: BytesMut,
    inbound: BytesMut,
    /// Write failure recorded by `send`, handled on the next loop pass.
    fault: Option<String>,
}

impl<O> fmt::Debug for Connection<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("phase", &self.phase())
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

impl<O> Connection<O> {
    /// An empty `port` picks 6697 for TLS and 6667 otherwise.
    pub(crate) fn new(owner: O, host: String, port: String, options: ConnectionOptions) -> Self {
        let default_port = if options.tls.is_enabled() { "6697" } else { "6667" };
        let port = if port.is_empty() {
            default_port.to_string()
        } else {
            port
        };

        Self {
            owner,
            host,
            port,
            options,
            link: Link::Disconnected,
            attempt: 0,
            outbound: BytesMut::new(),
            inbound: BytesMut::new(),
            fault: None,
        }
    }

    pub fn owner(&self) -> &O {
        &self.owner
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn options(&self) -> ConnectionOptions {
        self.options
    }

    pub fn phase(&self) -> ConnectionPhase {
        match self.link {
            Link::Disconnected => ConnectionPhase::Disconnected,
            Link::Reconnecting { .. } => ConnectionPhase::Reconnecting,
            Link::Connecting { .. } => ConnectionPhase::Connecting,
            Link::Connected(_) => ConnectionPhase::Connected,
        }
    }

    /// Missed keepalive intervals; 0 unless connected and silent.
    pub fn ping_count(&self) -> u32 {
        match &self.link {
            Link::Connected(live) => live.ping,
            _ => 0,
        }
    }

    /// When the next automatic connect fires, while reconnecting.
    pub fn retry_deadline(&self) -> Option<Instant> {
        match self.link {
            Link::Reconnecting { retry_at } => Some(retry_at),
            _ => None,
        }
    }

    /// Failed attempts since the last success or explicit disconnect.
    pub fn backoff_attempt(&self) -> u32 {
        self.attempt
    }

    pub fn peer_address(&self) -> Option<SocketAddr> {
        match &self.link {
            Link::Connected(live) => Some(live.peer),
            _ => None,
        }
    }

    /// Bytes queued for the socket but not yet written.
    pub fn queued_bytes(&self) -> usize {
        self.outbound.len()
    }

    /// Socket and interest for the loop's wait set, while connected.
    pub(crate) fn readiness(&self) -> Option<(&TcpStream, Interest)> {
        match &self.link {
            Link::Connected(live) => Some((
                live.transport.stream(),
                live.transport.interest(!self.outbound.is_empty()),
            )),
            _ => None,
        }
    }

    /// Earliest instant at which `tick` has work to do.
    pub(crate) fn deadline(&self, policy: &Policy) -> Option<Instant> {
        match &self.link {
            Link::Reconnecting { retry_at } => Some(*retry_at),
            Link::Connected(live) => Some(after(
                live.last_rx,
                policy.ping_interval.saturating_mul(live.ping.saturating_add(1)),
            )),
            _ => None,
        }
    }

    fn target(&self) -> Target {
        Target {
            host: self.host.clone(),
            port: self.port.clone(),
            options: self.options,
        }
    }

    fn reset_buffers(&mut self) {
        self.outbound.clear();
        self.inbound.clear();
        self.fault = None;
    }

    /// Release the transport or worker and hand back the owner.
    pub(crate) fn into_owner(self) -> O {
        match self.link {
            Link::Connecting { worker } => {
                worker.cancel();
            }
            Link::Connected(live) => live.transport.close(),
            Link::Disconnected | Link::Reconnecting { .. } => {}
        }
        self.owner
    }
}

// ── Transitions ──────────────────────────────────────────────────

impl<O: Clone> Connection<O> {
    /// Start a connect attempt (A). Cancels a pending retry.
    pub(crate) fn connect(
        &mut self,
        workers: &WorkerContext,
        events: &mut EventQueue<O>,
    ) -> Result<(), IoError> {
        match self.link {
            Link::Connecting { .. } => return Err(IoError::AlreadyConnecting),
            Link::Connected(_) => return Err(IoError::AlreadyConnected),
            Link::Disconnected | Link::Reconnecting { .. } => {}
        }

        debug!("{}:{}: spawning connect worker", self.host, self.port);
        self.link = Link::Connecting {
            worker: ConnectWorker::spawn(self.target(), workers),
        };
        events.info(
            self.owner.clone(),
            format!("Connecting to {}:{}", self.host, self.port),
        );
        Ok(())
    }

    /// Explicit disconnect (B). No reconnect is scheduled.
    pub(crate) fn disconnect(&mut self, events: &mut EventQueue<O>) -> Result<(), IoError> {
        match std::mem::replace(&mut self.link, Link::Disconnected) {
            Link::Disconnected => return Err(IoError::NotConnected),
            Link::Reconnecting { .. } => {}
            Link::Connecting { worker } => {
                if !worker.cancel() {
                    warn!(
                        "{}:{}: connect worker did not confirm cancellation",
                        self.host, self.port
                    );
                }
                events.info(
                    self.owner.clone(),
                    format!("Connection to {}:{} cancelled", self.host, self.port),
                );
            }
            Link::Connected(live) => {
                live.transport.close();
                events.push(Event::Disconnected {
                    owner: self.owner.clone(),
                });
            }
        }

        self.attempt = 0;
        self.reset_buffers();
        Ok(())
    }

    /// Collect the worker's outcome if it has finished (D or E).
    pub(crate) fn poll_worker(
        &mut self,
        now: Instant,
        policy: &Policy,
        events: &mut EventQueue<O>,
    ) -> bool {
        let Link::Connecting { worker } = &self.link else {
            return false;
        };
        let Some(outcome) = worker.try_take() else {
            return false;
        };

        match outcome {
            Ok(established) => self.established(established, now, events),
            Err(e) => {
                info!("{}:{}: {e}", self.host, self.port);
                events.error(self.owner.clone(), e.to_string());
                self.schedule_retry(now, policy, events);
            }
        }
        true
    }

    fn established(&mut self, est: Established, now: Instant, events: &mut EventQueue<O>) {
        for warning in est.warnings {
            events.log(
                Some(self.owner.clone()),
                LogLevel::Warn,
                format!("TLS verification: {warning}"),
            );
        }
        if let Some(summary) = est.tls_summary {
            events.log(Some(self.owner.clone()), LogLevel::Debug, summary);
        }

        info!("{}:{}: connected to {}", self.host, self.port, est.peer);
        events.info(
            self.owner.clone(),
            format!("Connected to [{}]", est.peer.ip()),
        );
        events.push(Event::Connected {
            owner: self.owner.clone(),
        });

        self.attempt = 0;
        self.reset_buffers();
        self.link = Link::Connected(Live {
            transport: est.transport,
            peer: est.peer,
            ping: 0,
            last_rx: now,
        });
    }

    fn schedule_retry(&mut self, now: Instant, policy: &Policy, events: &mut EventQueue<O>) {
        let delay = policy.backoff.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.link = Link::Reconnecting {
            retry_at: after(now, delay),
        };

        let secs = delay.as_secs();
        events.info(
            self.owner.clone(),
            format!("Attempting reconnect in {:02}:{:02}", secs / 60, secs % 60),
        );
    }

    /// An established link failed (F).
    fn lost(&mut self, reason: String, now: Instant, policy: &Policy, events: &mut EventQueue<O>) {
        if !matches!(self.link, Link::Connected(_)) {
            return;
        }
        let Link::Connected(live) = std::mem::replace(&mut self.link, Link::Disconnected) else {
            return;
        };
        live.transport.close();

        info!("{}:{}: {reason}", self.host, self.port);
        events.error(self.owner.clone(), reason);
        events.push(Event::Disconnected {
            owner: self.owner.clone(),
        });

        self.reset_buffers();
        self.schedule_retry(now, policy, events);
    }

    /// Act on a write failure recorded by `send`.
    pub(crate) fn handle_fault(&mut self, now: Instant, policy: &Policy, events: &mut EventQueue<O>) {
        if let Some(reason) = self.fault.take() {
            self.lost(reason, now, policy, events);
        }
    }

    /// Socket readiness from the wait set.
    pub(crate) fn on_ready(
        &mut self,
        ready: io::Result<Ready>,
        now: Instant,
        policy: &Policy,
        events: &mut EventQueue<O>,
    ) {
        let ready = match ready {
            Ok(ready) => ready,
            Err(e) => return self.lost(format!("socket error: {e}"), now, policy, events),
        };

        if ready.is_writable() {
            if let Err(e) = self.flush() {
                return self.lost(IoError::Write(e.to_string()).to_string(), now, policy, events);
            }
        }
        if ready.is_readable() || ready.is_read_closed() {
            self.receive(now, policy, events);
        }
    }

    fn receive(&mut self, now: Instant, policy: &Policy, events: &mut EventQueue<O>) {
        let Link::Connected(live) = &mut self.link else {
            return;
        };

        let mut failure = None;
        for _ in 0..MAX_READS_PER_WAKE {
            let start = self.inbound.len();
            self.inbound.resize(start + policy.read_chunk, 0);

            match live.transport.read(&mut self.inbound[start..]) {
                Ok(0) => {
                    self.inbound.truncate(start);
                    failure = Some("Connection closed by peer".to_string());
                    break;
                }
                Ok(n) => {
                    self.inbound.truncate(start + n);
                    live.last_rx = now;
                    if live.ping > 0 {
                        live.ping = 0;
                        events.push(Event::PingCleared {
                            owner: self.owner.clone(),
                            count: 0,
                        });
                    }
                    events.push(Event::SocketData {
                        owner: self.owner.clone(),
                        data: self.inbound.split().freeze(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.inbound.truncate(start);
                    break;
                }
                Err(e) => {
                    self.inbound.truncate(start);
                    failure = Some(IoError::Read(e.to_string()).to_string());
                    break;
                }
            }
        }

        if let Some(reason) = failure {
            self.lost(reason, now, policy, events);
        }
    }

    /// Write as much of the outbound queue as the socket takes.
    fn flush(&mut self) -> io::Result<()> {
        let Link::Connected(live) = &mut self.link else {
            return Ok(());
        };

        while !self.outbound.is_empty() {
            match live.transport.write(&self.outbound) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.outbound.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        live.transport.flush_pending()
    }

    /// Queue `data` and try to write it right away.
    ///
    /// A write failure is returned and also recorded, so the loop drops
    /// the link (F) on its next pass.
    pub(crate) fn send(&mut self, data: &[u8], policy: &Policy) -> Result<(), IoError> {
        if !matches!(self.link, Link::Connected(_)) {
            return Err(IoError::NotConnected);
        }
        if let Some(reason) = &self.fault {
            return Err(IoError::Write(reason.clone()));
        }
        if self.outbound.len() + data.len() > policy.send_limit {
            return Err(IoError::Write(format!(
                "send queue full ({} bytes pending)",
                self.outbound.len()
            )));
        }

        self.outbound.extend_from_slice(data);
        self.flush().map_err(|e| {
            let error = IoError::Write(e.to_string());
            self.fault = Some(error.to_string());
            error
        })
    }

    /// Advance timers: automatic reconnect (A) and ping escalation (G, H, F).
    pub(crate) fn tick(
        &mut self,
        now: Instant,
        workers: &WorkerContext,
        policy: &Policy,
        events: &mut EventQueue<O>,
    ) {
        let due = self.deadline(policy).is_some_and(|at| now >= at);
        if !due {
            return;
        }

        if matches!(self.link, Link::Reconnecting { .. }) {
            debug!("{}:{}: retry deadline reached", self.host, self.port);
            if let Err(e) = self.connect(workers, events) {
                warn!("{}:{}: automatic reconnect failed: {e}", self.host, self.port);
            }
            return;
        }

        let Link::Connected(live) = &mut self.link else {
            return;
        };
        live.ping += 1;
        let count = live.ping;
        let owner = self.owner.clone();

        if count > policy.ping_ceiling {
            self.lost(
                format!("Ping timeout ({} missed keepalives)", count - 1),
                now,
                policy,
                events,
            );
        } else if count == 1 {
            events.push(Event::PingStarted { owner, count });
        } else {
            events.push(Event::PingUpdated { owner, count });
        }
    }
}
