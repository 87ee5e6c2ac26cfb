//! The event loop.
//!
//! [`IoContext`] owns every connection, a multi-threaded tokio runtime for
//! the connect workers, and the queue of pending events. [`IoContext::start`]
//! blocks the calling thread and runs the loop until [`IoContext::stop`] (or
//! a [`StopHandle`] from another thread) asks it to return.
//!
//! The loop waits on: the input stream, readiness of every connected
//! socket, worker completion, SIGWINCH, the stop signal, and the nearest
//! timer deadline. All events are delivered on the calling thread.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures::{FutureExt, StreamExt};
use futures::stream::FuturesUnordered;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::runtime::Runtime;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, trace, warn};

use crate::config::IoConfig;
use crate::connection::{Connection, ConnectionPhase, Policy};
use crate::dispatch::{Event, EventQueue, Handler, Signal};
use crate::error::IoError;
use crate::flags::{ConnectionOptions, Flags};
use crate::registry::{ConnectionId, Registry};
use crate::tls::TlsSettings;
use crate::worker::WorkerContext;

/// Write a formatted line to a connection. CRLF is appended.
///
/// ```ignore
/// sendf!(io, id, "PRIVMSG {} :{}", target, text)?;
/// ```
#[macro_export]
macro_rules! sendf {
    ($io:expr, $id:expr, $($arg:tt)*) => {
        $io.send_formatted($id, ::std::format_args!($($arg)*))
    };
}

// ── StopHandle ───────────────────────────────────────────────────

#[derive(Debug, Default)]
struct StopSignal {
    requested: AtomicBool,
    wake: Notify,
}

/// Asks a running loop to return from [`IoContext::start`].
///
/// Cloneable and usable from any thread.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    inner: Arc<StopSignal>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.inner.requested.store(true, Ordering::Release);
        self.inner.wake.notify_one();
    }

    /// Clear a pending request, along with the wakeup permit it left
    /// behind when nobody was waiting.
    fn take(&self) -> bool {
        let requested = self.inner.requested.swap(false, Ordering::AcqRel);
        if requested {
            let _ = self.inner.wake.notified().now_or_never();
        }
        requested
    }

    async fn notified(&self) {
        self.inner.wake.notified().await;
    }
}

// ── Input ────────────────────────────────────────────────────────

type InputSource = Box<dyn AsyncRead + Send + Unpin>;

enum Input {
    /// Not yet read from; attached when the loop first starts.
    Pending(InputSource),
    Attached(mpsc::Receiver<Bytes>),
    Closed,
}

impl Input {
    fn attach(&mut self, ctx: &WorkerContext, chunk: usize) {
        let Self::Pending(_) = self else {
            return;
        };
        let Self::Pending(mut source) = std::mem::replace(self, Self::Closed) else {
            return;
        };

        let (tx, rx) = mpsc::channel(32);
        ctx.runtime.spawn(async move {
            let mut buf = BytesMut::with_capacity(chunk);
            loop {
                buf.reserve(chunk);
                match source.read_buf(&mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.send(buf.split().freeze()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("input read failed: {e}");
                        break;
                    }
                }
            }
        });
        *self = Self::Attached(rx);
    }

    async fn recv(&mut self) -> Option<Bytes> {
        match self {
            Self::Attached(rx) => rx.recv().await,
            Self::Pending(_) | Self::Closed => std::future::pending().await,
        }
    }
}

// ── Signals ──────────────────────────────────────────────────────

struct Signals {
    #[cfg(unix)]
    winch: tokio::signal::unix::Signal,
}

impl Signals {
    /// Must run inside the runtime.
    fn register() -> Result<Self, IoError> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let winch = signal(SignalKind::window_change()).map_err(IoError::Signal)?;
            Ok(Self { winch })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    async fn recv(&mut self) -> Option<Signal> {
        #[cfg(unix)]
        {
            self.winch.recv().await.map(|()| Signal::WindowChange)
        }
        #[cfg(not(unix))]
        {
            std::future::pending().await
        }
    }
}

// ── Terminal size ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TerminalSize {
    columns: u16,
    rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self {
            columns: 80,
            rows: 24,
        }
    }
}

impl TerminalSize {
    fn query() -> Option<Self> {
        let (columns, rows) = crossterm::terminal::size().ok()?;
        (columns > 0 && rows > 0).then_some(Self { columns, rows })
    }
}

// ── IoContext ────────────────────────────────────────────────────

enum Wake {
    Stop,
    Timer,
    Worker,
    Signal(Signal),
    Input(Option<Bytes>),
    Socket(ConnectionId, std::io::Result<tokio::io::Ready>),
}

/// Owns all connections and runs the event loop.
///
/// `O` is the consumer's owner reference for each connection, echoed back
/// on every event about it.
pub struct IoContext<O> {
    config: IoConfig,
    policy: Policy,
    runtime: Option<Runtime>,
    workers: WorkerContext,
    registry: Registry<Connection<O>>,
    events: EventQueue<O>,
    stop: StopHandle,
    input: Input,
    tty: TerminalSize,
    running: bool,
}

impl<O> fmt::Debug for IoContext<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoContext")
            .field("connections", &self.registry.len())
            .field("capacity", &self.registry.capacity())
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl<O> IoContext<O> {
    /// Build a context: runtime, registry, TLS roots. Input defaults to stdin.
    pub fn init(config: IoConfig) -> Result<Self, IoError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.limits.worker_threads.max(1))
            .thread_name("rirc-io")
            .enable_all()
            .build()
            .map_err(IoError::Runtime)?;

        let workers = WorkerContext {
            runtime: runtime.handle().clone(),
            notifier: Arc::new(Notify::new()),
            tls: Arc::new(TlsSettings::default()),
            connect_timeout: config.connect_timeout(),
            handshake_timeout: config.handshake_timeout(),
            cancel_wait: config.cancel_wait(),
        };

        debug!(
            "io context ready: {} connection slot(s), {} worker thread(s)",
            config.limits.max_connections,
            config.limits.worker_threads.max(1)
        );

        Ok(Self {
            policy: Policy::from(&config),
            registry: Registry::new(config.limits.max_connections),
            config,
            runtime: Some(runtime),
            workers,
            events: EventQueue::default(),
            stop: StopHandle::default(),
            input: Input::Pending(Box::new(tokio::io::stdin())),
            tty: TerminalSize::query().unwrap_or_default(),
            running: false,
        })
    }

    /// Read input events from `reader` instead of stdin.
    pub fn with_input(mut self, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.input = Input::Pending(Box::new(reader));
        self
    }

    pub fn config(&self) -> &IoConfig {
        &self.config
    }

    /// Register a connection in the Disconnected state.
    pub fn connection(
        &mut self,
        owner: O,
        host: impl Into<String>,
        port: impl Into<String>,
        flags: Flags,
    ) -> Result<ConnectionId, IoError> {
        let options = ConnectionOptions::try_from(flags)?;
        let capacity = self.registry.capacity();
        let conn = Connection::new(owner, host.into(), port.into(), options);

        let id = self
            .registry
            .insert(conn)
            .map_err(|_| IoError::ConnectionLimitReached { capacity })?;
        debug!("connection {id} registered");
        Ok(id)
    }

    /// Free a connection, closing its socket or cancelling its worker.
    /// Returns the owner reference.
    pub fn destroy(&mut self, id: ConnectionId) -> Result<O, IoError> {
        let conn = self.registry.remove(id).ok_or(IoError::UnknownConnection)?;
        debug!("connection {id} destroyed");
        Ok(conn.into_owner())
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn terminal_columns(&self) -> u16 {
        self.tty.columns
    }

    pub fn terminal_rows(&self) -> u16 {
        self.tty.rows
    }

    // ── Introspection ────────────────────────────────────────────

    pub fn get(&self, id: ConnectionId) -> Option<&Connection<O>> {
        self.registry.get(id)
    }

    pub fn connections(&self) -> impl Iterator<Item = (ConnectionId, &Connection<O>)> {
        self.registry.iter()
    }

    pub fn phase(&self, id: ConnectionId) -> Option<ConnectionPhase> {
        self.get(id).map(Connection::phase)
    }

    pub fn ping_count(&self, id: ConnectionId) -> Option<u32> {
        self.get(id).map(Connection::ping_count)
    }

    pub fn retry_deadline(&self, id: ConnectionId) -> Option<Instant> {
        self.get(id).and_then(Connection::retry_deadline)
    }

    pub fn backoff_attempt(&self, id: ConnectionId) -> Option<u32> {
        self.get(id).map(Connection::backoff_attempt)
    }

    pub fn peer_address(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.get(id).and_then(Connection::peer_address)
    }

    pub fn owner(&self, id: ConnectionId) -> Option<&O> {
        self.get(id).map(Connection::owner)
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.registry.capacity()
    }
}

impl<O: Clone> IoContext<O> {
    /// Start connecting. Fails with `AlreadyConnecting` / `AlreadyConnected`.
    pub fn connect(&mut self, id: ConnectionId) -> Result<(), IoError> {
        let conn = self
            .registry
            .get_mut(id)
            .ok_or(IoError::UnknownConnection)?;
        conn.connect(&self.workers, &mut self.events)
    }

    /// Disconnect and stay disconnected. Fails with `NotConnected`.
    pub fn disconnect(&mut self, id: ConnectionId) -> Result<(), IoError> {
        let conn = self
            .registry
            .get_mut(id)
            .ok_or(IoError::UnknownConnection)?;
        conn.disconnect(&mut self.events)
    }

    /// Format a line, append CRLF and queue it. See [`sendf!`](crate::sendf).
    pub fn send_formatted(
        &mut self,
        id: ConnectionId,
        args: fmt::Arguments<'_>,
    ) -> Result<(), IoError> {
        let conn = self
            .registry
            .get_mut(id)
            .ok_or(IoError::UnknownConnection)?;

        let mut line = args.to_string();
        line.push_str("\r\n");
        conn.send(line.as_bytes(), &self.policy)
    }

    /// Run the loop on the calling thread until stopped.
    ///
    /// Must not be called from inside an async runtime or from a handler.
    pub fn start<H: Handler<O>>(&mut self, handler: &mut H) -> Result<(), IoError> {
        if self.running {
            return Err(IoError::Runtime(std::io::Error::other(
                "event loop already running",
            )));
        }

        self.running = true;
        let runtime = self.workers.runtime.clone();
        let result = runtime.block_on(self.run(handler));
        self.running = false;
        result
    }

    async fn run<H: Handler<O>>(&mut self, handler: &mut H) -> Result<(), IoError> {
        let mut signals = Signals::register()?;
        self.input.attach(&self.workers, self.policy.read_chunk);
        debug!("event loop started ({} connection(s))", self.registry.len());

        loop {
            self.dispatch(handler);
            if self.stop.take() {
                break;
            }

            let now = Instant::now();
            for conn in self.registry.iter_mut() {
                conn.handle_fault(now, &self.policy, &mut self.events);
            }
            if !self.events.is_empty() {
                continue;
            }

            let deadline = self.next_deadline(now);
            let wake = self.wait(&mut signals, deadline).await;
            let now = Instant::now();

            match wake {
                Wake::Stop | Wake::Timer | Wake::Worker => {}
                Wake::Input(Some(bytes)) => self.events.push(Event::Input(bytes)),
                Wake::Input(None) => {
                    debug!("input stream closed");
                    self.input = Input::Closed;
                }
                Wake::Signal(signal) => {
                    self.tty = TerminalSize::query().unwrap_or(self.tty);
                    trace!("terminal resized to {}x{}", self.tty.columns, self.tty.rows);
                    self.events.push(Event::Signal(signal));
                }
                Wake::Socket(id, ready) => {
                    if let Some(conn) = self.registry.get_mut(id) {
                        conn.on_ready(ready, now, &self.policy, &mut self.events);
                    }
                }
            }

            for conn in self.registry.iter_mut() {
                conn.poll_worker(now, &self.policy, &mut self.events);
                conn.tick(now, &self.workers, &self.policy, &mut self.events);
            }
        }

        debug!("event loop stopped");
        Ok(())
    }

    fn dispatch<H: Handler<O>>(&mut self, handler: &mut H) {
        while let Some(event) = self.events.pop() {
            handler.on_event(self, event);
        }
    }

    fn next_deadline(&self, now: Instant) -> Instant {
        let idle = now.checked_add(self.config.max_idle()).unwrap_or(now);
        self.registry
            .iter()
            .filter_map(|(_, conn)| conn.deadline(&self.policy))
            .fold(idle, Instant::min)
    }

    async fn wait(&mut self, signals: &mut Signals, deadline: Instant) -> Wake {
        let mut sockets: FuturesUnordered<_> = self
            .registry
            .iter()
            .filter_map(|(id, conn)| {
                let (stream, interest) = conn.readiness()?;
                Some(async move { (id, stream.ready(interest).await) })
            })
            .collect();
        let watching = !sockets.is_empty();

        tokio::select! {
            biased;
            () = self.stop.notified() => Wake::Stop,
            Some(signal) = signals.recv() => Wake::Signal(signal),
            () = self.workers.notified() => Wake::Worker,
            Some((id, ready)) = sockets.next(), if watching => Wake::Socket(id, ready),
            bytes = self.input.recv() => Wake::Input(bytes),
            () = tokio::time::sleep_until(deadline.into()) => Wake::Timer,
        }
    }
}

impl<O> Drop for IoContext<O> {
    fn drop(&mut self) {
        for conn in self.registry.drain() {
            drop(conn.into_owner());
        }
        // A blocked stdin read must not hold up shutdown.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn context() -> IoContext<u32> {
        let mut config = IoConfig::default();
        config.limits.max_connections = 2;
        config.limits.worker_threads = 1;
        IoContext::init(config).unwrap().with_input(tokio::io::empty())
    }

    #[test]
    fn capacity_is_enforced() {
        let mut io = context();
        io.connection(1, "irc.libera.chat", "6697", Flags::TLS_ENABLED)
            .unwrap();
        io.connection(2, "irc.oftc.net", "", Flags::empty()).unwrap();
        let err = io
            .connection(3, "irc.efnet.org", "6667", Flags::empty())
            .unwrap_err();
        assert!(matches!(err, IoError::ConnectionLimitReached { capacity: 2 }));
        assert_eq!(io.len(), 2);
    }

    #[test]
    fn contradictory_flags_are_rejected() {
        let mut io = context();
        let err = io
            .connection(1, "irc.libera.chat", "", Flags::IPV_4 | Flags::IPV_6)
            .unwrap_err();
        assert!(matches!(err, IoError::InvalidFlags(_)));
        assert!(io.is_empty());
    }

    #[test]
    fn destroy_returns_owner_and_invalidates_id() {
        let mut io = context();
        let id = io.connection(7, "irc.libera.chat", "", Flags::empty()).unwrap();
        assert_eq!(io.owner(id), Some(&7));
        assert_eq!(io.phase(id), Some(ConnectionPhase::Disconnected));

        assert_eq!(io.destroy(id).unwrap(), 7);
        assert!(matches!(io.destroy(id), Err(IoError::UnknownConnection)));
        assert!(matches!(io.connect(id), Err(IoError::UnknownConnection)));
        assert_eq!(io.phase(id), None);
    }

    #[test]
    fn misuse_on_idle_connection() {
        let mut io = context();
        let id = io.connection(1, "irc.libera.chat", "", Flags::empty()).unwrap();
        assert!(matches!(io.disconnect(id), Err(IoError::NotConnected)));
        assert!(matches!(sendf!(io, id, "NICK {}", "rirc"), Err(IoError::NotConnected)));
    }

    #[test]
    fn stop_from_handler_returns_and_restarts() {
        let mut io = context();
        io.events.push(Event::Input(Bytes::from_static(b"a")));

        let mut seen = 0;
        io.start(&mut |io: &mut IoContext<u32>, event: Event<u32>| {
            if let Event::Input(_) = event {
                seen += 1;
                io.stop();
            }
        })
        .unwrap();
        assert_eq!(seen, 1);

        // Second run, stopped from another thread.
        let stop = io.stop_handle();
        let watchdog = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            stop.stop();
        });
        io.start(&mut |_: &mut IoContext<u32>, _: Event<u32>| {})
            .unwrap();
        watchdog.join().unwrap();
    }

    #[test]
    fn stop_request_leaves_no_stale_wakeup() {
        let stop = StopHandle::default();
        assert!(!stop.take());

        stop.stop();
        assert!(stop.take());
        assert!(!stop.take());
        assert!(stop.notified().now_or_never().is_none());
    }

    #[test]
    fn input_stream_becomes_events() {
        let mut io = IoContext::<u32>::init(IoConfig::default())
            .unwrap()
            .with_input(&b"/join #rirc\n"[..]);

        let mut input = Vec::new();
        io.start(&mut |io: &mut IoContext<u32>, event: Event<u32>| {
            if let Event::Input(bytes) = event {
                input.extend_from_slice(&bytes);
                io.stop();
            }
        })
        .unwrap();
        assert_eq!(input, b"/join #rirc\n");
    }

    #[test]
    fn events_raised_in_a_handler_are_delivered_after_it() {
        let mut io = context();
        let id = io.connection(1, "127.0.0.1", "1", Flags::empty()).unwrap();
        io.events.push(Event::Input(Bytes::from_static(b"go")));

        let mut order = Vec::new();
        io.start(&mut |io: &mut IoContext<u32>, event: Event<u32>| match event {
            Event::Input(_) => {
                io.connect(id).unwrap();
                order.push("input returned");
            }
            Event::Info { message, .. } if message.starts_with("Connecting") => {
                order.push("connecting");
                io.disconnect(id).unwrap();
                io.stop();
            }
            _ => {}
        })
        .unwrap();

        assert_eq!(order, vec!["input returned", "connecting"]);
        assert_eq!(io.phase(id), Some(ConnectionPhase::Disconnected));
    }

    #[test]
    fn terminal_size_has_a_fallback() {
        let io = context();
        assert!(io.terminal_columns() > 0);
        assert!(io.terminal_rows() > 0);
    }
}
