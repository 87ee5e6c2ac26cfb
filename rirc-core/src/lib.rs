//! # rirc-core
//!
//! Network connectivity core for the rirc terminal IRC client.
//!
//! This crate contains:
//! - **Connections**: per-server state machine with automatic reconnect
//!   (exponential backoff) and ping escalation on silent links
//! - **Transport**: plain TCP or rustls TLS with a per-connection
//!   certificate verification policy
//! - **Workers**: cancellable connect attempts (resolve, connect, handshake)
//!   running off the event loop
//! - **Event loop**: `IoContext`, a single coordinating loop that delivers
//!   every event to one `Handler`, serialized on the calling thread
//! - **Config**: `IoConfig`, TOML-loadable tunables
//! - **Error**: `IoError`, a `thiserror`-based taxonomy
//!
//! ```no_run
//! use rirc_core::{Event, Flags, IoConfig, IoContext, sendf};
//!
//! let mut io = IoContext::init(IoConfig::default())?;
//! let id = io.connection("libera", "irc.libera.chat", "", Flags::TLS_ENABLED)?;
//! io.connect(id)?;
//! io.start(&mut |io: &mut IoContext<&'static str>, event: Event<&'static str>| {
//!     if let Event::Connected { .. } = event {
//!         let _ = sendf!(io, id, "NICK {}", "rirc");
//!     }
//! })?;
//! # Ok::<(), rirc_core::IoError>(())
//! ```

pub mod backoff;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod flags;
pub mod io;
pub mod registry;
mod tls;
pub mod transport;
mod worker;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use backoff::Backoff;
pub use config::{ConnectConfig, IoConfig, LimitsConfig, PingConfig, ReconnectConfig};
pub use connection::{Connection, ConnectionPhase};
pub use dispatch::{Event, Handler, LogLevel, Signal};
pub use error::{ErrorKind, IoError, error_string};
pub use flags::{AddressFamily, ConnectionOptions, Flags, TlsMode, Verify};
pub use io::{IoContext, StopHandle};
pub use registry::ConnectionId;
pub use transport::Transport;
