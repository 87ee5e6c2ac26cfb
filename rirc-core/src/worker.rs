//! Short-lived connect worker.
//!
//! One worker per connect attempt: resolve the host, try each candidate
//! address under a timeout, then run the TLS handshake if enabled. The
//! single outcome lands in a one-slot handoff that the event loop drains
//! after being woken through a shared [`Notify`].
//!
//! Cancelling drops the in-flight future, which releases every partially
//! acquired resource (lookups, half-open sockets, TLS sessions). A cancel
//! waits a bounded time for the task to confirm it has finished.

use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::IoError;
use crate::flags::{ConnectionOptions, TlsMode};
use crate::tls::TlsSettings;
use crate::transport::Transport;

/// A finished connect attempt.
#[derive(Debug)]
pub(crate) struct Established {
    pub(crate) transport: Transport,
    pub(crate) peer: SocketAddr,
    /// Verification failures accepted under the `optional` policy.
    pub(crate) warnings: Vec<String>,
    /// Negotiated TLS parameters, if any.
    pub(crate) tls_summary: Option<String>,
}

pub(crate) type Outcome = Result<Established, IoError>;

/// Where to connect and how.
#[derive(Debug, Clone)]
pub(crate) struct Target {
    pub(crate) host: String,
    pub(crate) port: String,
    pub(crate) options: ConnectionOptions,
}

/// Shared state every worker is spawned with.
#[derive(Debug, Clone)]
pub(crate) struct WorkerContext {
    pub(crate) runtime: Handle,
    pub(crate) notifier: Arc<Notify>,
    pub(crate) tls: Arc<TlsSettings>,
    pub(crate) connect_timeout: Duration,
    pub(crate) handshake_timeout: Duration,
    pub(crate) cancel_wait: Duration,
}

impl WorkerContext {
    /// Resolves once any worker has published its outcome.
    pub(crate) async fn notified(&self) {
        self.notifier.notified().await;
    }
}

// ── Handoff ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Slot {
    outcome: Option<Outcome>,
    finished: bool,
}

#[derive(Debug, Default)]
struct Handoff {
    slot: Mutex<Slot>,
    finished: Condvar,
}

impl Handoff {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks the handoff finished when the task ends, however it ends.
struct FinishGuard {
    handoff: Arc<Handoff>,
    notifier: Arc<Notify>,
}

impl FinishGuard {
    fn publish(self, outcome: Outcome) {
        self.handoff.lock().outcome = Some(outcome);
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.handoff.lock().finished = true;
        self.handoff.finished.notify_all();
        self.notifier.notify_one();
    }
}

// ── ConnectWorker ────────────────────────────────────────────────

/// Handle to a running connect attempt, owned by its connection.
///
/// Dropping the handle cancels the attempt without waiting.
#[derive(Debug)]
pub(crate) struct ConnectWorker {
    cancel: CancellationToken,
    handoff: Arc<Handoff>,
    cancel_wait: Duration,
}

impl ConnectWorker {
    pub(crate) fn spawn(target: Target, ctx: &WorkerContext) -> Self {
        let cancel = CancellationToken::new();
        let handoff = Arc::new(Handoff::default());

        let guard = FinishGuard {
            handoff: Arc::clone(&handoff),
            notifier: Arc::clone(&ctx.notifier),
        };
        let attempt = Attempt {
            target,
            tls: Arc::clone(&ctx.tls),
            connect_timeout: ctx.connect_timeout,
            handshake_timeout: ctx.handshake_timeout,
        };
        let token = cancel.clone();

        ctx.runtime.spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => Err(IoError::Cancelled),
                outcome = attempt.run() => outcome,
            };
            guard.publish(outcome);
        });

        Self {
            cancel,
            handoff,
            cancel_wait: ctx.cancel_wait,
        }
    }

    /// Take the outcome if the worker has finished. Never blocks.
    pub(crate) fn try_take(&self) -> Option<Outcome> {
        self.handoff.lock().outcome.take()
    }

    /// Cancel the attempt and wait for the task to confirm.
    ///
    /// Returns `false` if the task did not finish within the configured
    /// wait; it is still cancelled and will release its resources when it
    /// next runs.
    pub(crate) fn cancel(self) -> bool {
        self.cancel.cancel();

        let slot = self.handoff.lock();
        let (mut slot, _) = self
            .handoff
            .finished
            .wait_timeout_while(slot, self.cancel_wait, |s| !s.finished)
            .unwrap_or_else(PoisonError::into_inner);

        let confirmed = slot.finished;
        // An outcome that raced the cancel is discarded, closing its socket.
        let stale = slot.outcome.take();
        drop(slot);
        drop(stale);
        confirmed
    }
}

impl Drop for ConnectWorker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Attempt ──────────────────────────────────────────────────────

struct Attempt {
    target: Target,
    tls: Arc<TlsSettings>,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl Attempt {
    async fn run(self) -> Outcome {
        let candidates = self.resolve().await?;
        let (stream, peer) = self.connect_any(&candidates).await?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {peer}: {e}");
        }

        let (mut transport, warnings) = match self.target.options.tls {
            TlsMode::Disabled => (Transport::Plain(stream), None),
            TlsMode::Enabled(verify) => {
                let (session, warnings) = self.tls.client_session(&self.target.host, verify)?;
                (Transport::tls(stream, session), Some(warnings))
            }
        };

        timeout(self.handshake_timeout, transport.handshake())
            .await
            .map_err(|_| IoError::TlsHandshake("handshake timed out".into()))??;

        let warnings = warnings
            .map(|w| std::mem::take(&mut *w.lock().unwrap_or_else(PoisonError::into_inner)))
            .unwrap_or_default();
        let tls_summary = transport.describe();

        Ok(Established {
            transport,
            peer,
            warnings,
            tls_summary,
        })
    }

    async fn resolve(&self) -> Result<Vec<SocketAddr>, IoError> {
        let Target { host, port, options } = &self.target;

        let port: u16 = port
            .parse()
            .map_err(|_| IoError::Resolution(format!("invalid port '{port}'")))?;

        let resolved = timeout(
            self.connect_timeout,
            tokio::net::lookup_host((host.as_str(), port)),
        )
        .await
        .map_err(|_| IoError::Resolution(format!("{host}: timed out")))?
        .map_err(|e| IoError::Resolution(format!("{host}: {e}")))?;

        let candidates: Vec<SocketAddr> = resolved
            .filter(|addr| options.family.accepts(addr))
            .collect();

        if candidates.is_empty() {
            return Err(IoError::Resolution(format!(
                "{host}: no addresses for the requested family"
            )));
        }

        trace!("{host}: {} candidate address(es)", candidates.len());
        Ok(candidates)
    }

    async fn connect_any(
        &self,
        candidates: &[SocketAddr],
    ) -> Result<(TcpStream, SocketAddr), IoError> {
        let mut last = String::from("no candidates");

        for &addr in candidates {
            match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => return Ok((stream, addr)),
                Ok(Err(e)) => {
                    debug!("connect to {addr} failed: {e}");
                    last = e.to_string();
                }
                Err(_) => {
                    debug!("connect to {addr} timed out");
                    last = format!("{addr}: timed out");
                }
            }
        }

        Err(IoError::Connect(last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::AddressFamily;
    use std::net::TcpListener;
    use std::time::Instant;

    fn context(runtime: &tokio::runtime::Runtime) -> WorkerContext {
        WorkerContext {
            runtime: runtime.handle().clone(),
            notifier: Arc::new(Notify::new()),
            tls: Arc::new(TlsSettings::default()),
            connect_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(2),
            cancel_wait: Duration::from_secs(2),
        }
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    fn target(port: u16, options: ConnectionOptions) -> Target {
        Target {
            host: "127.0.0.1".into(),
            port: port.to_string(),
            options,
        }
    }

    fn wait_for(worker: &ConnectWorker) -> Outcome {
        let start = Instant::now();
        loop {
            if let Some(outcome) = worker.try_take() {
                return outcome;
            }
            assert!(start.elapsed() < Duration::from_secs(5), "worker never finished");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn plain_connect_succeeds() {
        let rt = runtime();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let worker = ConnectWorker::spawn(target(port, ConnectionOptions::default()), &context(&rt));
        let established = wait_for(&worker).unwrap();
        assert_eq!(established.peer.port(), port);
        assert!(!established.transport.is_tls());
        assert!(established.warnings.is_empty());
    }

    #[test]
    fn refused_port_is_a_connect_error() {
        let rt = runtime();
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let worker = ConnectWorker::spawn(target(port, ConnectionOptions::default()), &context(&rt));
        assert!(matches!(wait_for(&worker), Err(IoError::Connect(_))));
    }

    #[test]
    fn invalid_port_is_a_resolution_error() {
        let rt = runtime();
        let mut t = target(0, ConnectionOptions::default());
        t.port = "ircs".into();
        let worker = ConnectWorker::spawn(t, &context(&rt));
        assert!(matches!(wait_for(&worker), Err(IoError::Resolution(_))));
    }

    #[test]
    fn family_filter_can_empty_the_candidates() {
        let rt = runtime();
        let options = ConnectionOptions {
            family: AddressFamily::V6,
            ..Default::default()
        };
        let worker = ConnectWorker::spawn(target(6667, options), &context(&rt));
        assert!(matches!(wait_for(&worker), Err(IoError::Resolution(_))));
    }

    #[test]
    fn cancel_confirms_during_handshake() {
        let rt = runtime();
        // Accepts TCP but never answers the ClientHello.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let options = ConnectionOptions {
            tls: TlsMode::Enabled(crate::flags::Verify::Disabled),
            ..Default::default()
        };

        let worker = ConnectWorker::spawn(target(port, options), &context(&rt));
        let _peer = listener.accept().unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        assert!(worker.cancel());
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
