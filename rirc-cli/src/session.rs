//! The terminal client's event handler.
//!
//! Prints server lines, relays typed lines, and does the minimum IRC needed
//! to stay registered: NICK/USER on connect, PONG on PING, and a PING of its
//! own when the link goes quiet.

use std::io::Write;

use rirc_core::{ConnectionId, Event, Handler, IoContext, LogLevel, Signal, sendf};
use tracing::{debug, error, info, warn};

use crate::config::IdentityConfig;

/// A typed line, after slash-command parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputCommand {
    Connect,
    Disconnect,
    /// Print every connection's phase and send backlog.
    Status,
    Quit(Option<String>),
    /// Sent to the server as-is.
    Raw(String),
}

impl InputCommand {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end();
        if line.is_empty() {
            return None;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Some(Self::Raw(line.to_string()));
        };

        let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
        let rest = rest.trim();
        Some(match name.to_ascii_lowercase().as_str() {
            "connect" => Self::Connect,
            "disconnect" => Self::Disconnect,
            "status" => Self::Status,
            "quit" => Self::Quit((!rest.is_empty()).then(|| rest.to_string())),
            "quote" | "raw" => Self::Raw(rest.to_string()),
            _ => Self::Raw(command.to_string()),
        })
    }
}

/// The PONG for a server PING line, if `line` is one.
pub fn pong_reply(line: &str) -> Option<String> {
    let line = line.strip_prefix(':').map_or(line, |l| {
        l.split_once(' ').map_or("", |(_, rest)| rest)
    });
    line.strip_prefix("PING ")
        .map(|token| format!("PONG {token}"))
}

/// Split complete lines off the front of `buf`; a trailing partial line
/// stays buffered.
pub fn take_lines(buf: &mut Vec<u8>) -> Vec<String> {
    let Some(end) = buf.iter().rposition(|&b| b == b'\n') else {
        return Vec::new();
    };
    let complete: Vec<u8> = buf.drain(..=end).collect();
    complete
        .split(|&b| b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            String::from_utf8_lossy(line).into_owned()
        })
        .collect()
}

/// Handler for a single-server session.
pub struct Session<W: Write> {
    id: ConnectionId,
    identity: IdentityConfig,
    out: W,
    socket: Vec<u8>,
    input: Vec<u8>,
}

impl<W: Write> Session<W> {
    pub fn new(id: ConnectionId, identity: IdentityConfig, out: W) -> Self {
        Self {
            id,
            identity,
            out,
            socket: Vec::new(),
            input: Vec::new(),
        }
    }

    pub fn into_output(self) -> W {
        self.out
    }

    fn print(&mut self, line: impl std::fmt::Display) {
        if let Err(e) = writeln!(self.out, "{line}") {
            error!("terminal write failed: {e}");
        }
    }

    fn register(&mut self, io: &mut IoContext<String>) {
        let nick = &self.identity.nick;
        let user = &self.identity.username;
        let real = &self.identity.realname;
        let result = sendf!(io, self.id, "NICK {nick}")
            .and_then(|()| sendf!(io, self.id, "USER {user} 8 * :{real}"));
        if let Err(e) = result {
            self.print(format_args!("-!!- registration failed: {e}"));
        }
    }

    fn status(&mut self, io: &IoContext<String>) {
        let lines: Vec<String> = io
            .connections()
            .map(|(id, conn)| {
                format!(
                    "-- {id} {} {}:{} {}, {} bytes queued",
                    conn.owner(),
                    conn.host(),
                    conn.port(),
                    conn.phase(),
                    conn.queued_bytes()
                )
            })
            .collect();
        for line in lines {
            self.print(line);
        }
    }

    fn typed(&mut self, io: &mut IoContext<String>, line: &str) {
        let Some(command) = InputCommand::parse(line) else {
            return;
        };
        let result = match command {
            InputCommand::Connect => io.connect(self.id),
            InputCommand::Disconnect => io.disconnect(self.id),
            InputCommand::Status => {
                self.status(io);
                Ok(())
            }
            InputCommand::Quit(message) => {
                let message = message.unwrap_or_else(|| self.identity.realname.clone());
                // Quitting while disconnected is fine.
                let _ = sendf!(io, self.id, "QUIT :{message}");
                io.stop();
                Ok(())
            }
            InputCommand::Raw(text) => sendf!(io, self.id, "{text}"),
        };
        if let Err(e) = result {
            self.print(format_args!("-!!- {e}"));
        }
    }

    fn received(&mut self, io: &mut IoContext<String>, line: &str) {
        if let Some(pong) = pong_reply(line) {
            debug!("answering {line}");
            if let Err(e) = sendf!(io, self.id, "{pong}") {
                warn!("PONG failed: {e}");
            }
            return;
        }
        self.print(line);
    }
}

impl<W: Write> Handler<String> for Session<W> {
    fn on_event(&mut self, io: &mut IoContext<String>, event: Event<String>) {
        match event {
            Event::Connected { .. } => self.register(io),
            Event::Disconnected { owner } => self.print(format_args!("-- disconnected from {owner}")),
            Event::Error { message, .. } => self.print(format_args!("-!!- {message}")),
            Event::Info { message, .. } => self.print(format_args!("-- {message}")),
            Event::PingStarted { owner, count } => {
                self.print(format_args!("-- no traffic from {owner} ({count})"));
                if let Err(e) = sendf!(io, self.id, "PING :{owner}") {
                    warn!("keepalive PING failed: {e}");
                }
            }
            Event::PingUpdated { owner, count } => {
                self.print(format_args!("-- no traffic from {owner} ({count})"));
            }
            Event::PingCleared { owner, .. } => {
                self.print(format_args!("-- traffic from {owner} resumed"));
            }
            Event::Signal(Signal::WindowChange) => {
                debug!(
                    "terminal is now {}x{}",
                    io.terminal_columns(),
                    io.terminal_rows()
                );
            }
            Event::Input(bytes) => {
                self.input.extend_from_slice(&bytes);
                for line in take_lines(&mut self.input) {
                    self.typed(io, &line);
                }
            }
            Event::SocketData { data, .. } => {
                self.socket.extend_from_slice(&data);
                for line in take_lines(&mut self.socket) {
                    self.received(io, &line);
                }
            }
            Event::Log { level, message, .. } => match level {
                LogLevel::Error => error!("{message}"),
                LogLevel::Warn => warn!("{message}"),
                LogLevel::Info => info!("{message}"),
                LogLevel::Debug => debug!("{message}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rirc_core::{Flags, IoConfig};

    #[test]
    fn slash_commands() {
        assert_eq!(InputCommand::parse("/connect"), Some(InputCommand::Connect));
        assert_eq!(InputCommand::parse("/DISCONNECT"), Some(InputCommand::Disconnect));
        assert_eq!(InputCommand::parse("/status"), Some(InputCommand::Status));
        assert_eq!(InputCommand::parse("/quit"), Some(InputCommand::Quit(None)));
        assert_eq!(
            InputCommand::parse("/quit see you"),
            Some(InputCommand::Quit(Some("see you".into())))
        );
        assert_eq!(
            InputCommand::parse("/quote MODE rirc +i"),
            Some(InputCommand::Raw("MODE rirc +i".into()))
        );
        assert_eq!(
            InputCommand::parse("/join #rirc"),
            Some(InputCommand::Raw("join #rirc".into()))
        );
        assert_eq!(
            InputCommand::parse("PRIVMSG #rirc :hi\r"),
            Some(InputCommand::Raw("PRIVMSG #rirc :hi".into()))
        );
        assert_eq!(InputCommand::parse("  "), None);
    }

    #[test]
    fn ping_lines_get_pong() {
        assert_eq!(pong_reply("PING :irc.libera.chat"), Some("PONG :irc.libera.chat".into()));
        assert_eq!(pong_reply(":srv PING :token"), Some("PONG :token".into()));
        assert_eq!(pong_reply(":srv 001 rirc :Welcome"), None);
    }

    #[test]
    fn partial_lines_stay_buffered() {
        let mut buf = b":a 001 x :hi\r\n:a 002 x :yo\r\n:a 00".to_vec();
        assert_eq!(take_lines(&mut buf), vec![":a 001 x :hi", ":a 002 x :yo"]);
        assert_eq!(buf, b":a 00");

        buf.extend_from_slice(b"3 x\r\n");
        assert_eq!(take_lines(&mut buf), vec![":a 003 x"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn events_are_printed() {
        let mut config = IoConfig::default();
        config.limits.worker_threads = 1;
        let mut io: IoContext<String> = IoContext::init(config).unwrap();
        let id = io
            .connection("libera".into(), "irc.libera.chat", "", Flags::TLS_ENABLED)
            .unwrap();

        let mut session = Session::new(id, IdentityConfig::default(), Vec::new());
        session.on_event(
            &mut io,
            Event::Info {
                owner: "libera".into(),
                message: "Connecting to irc.libera.chat:6697".into(),
            },
        );
        session.on_event(
            &mut io,
            Event::Input(b"PRIVMSG #rirc :hi\n".to_vec().into()),
        );

        let out = String::from_utf8(session.into_output()).unwrap();
        assert_eq!(out, "-- Connecting to irc.libera.chat:6697\n-!!- not connected\n");
    }

    #[test]
    fn status_lists_connections() {
        let mut config = IoConfig::default();
        config.limits.worker_threads = 1;
        let mut io: IoContext<String> = IoContext::init(config).unwrap();
        let id = io
            .connection("libera".into(), "irc.libera.chat", "", Flags::TLS_ENABLED)
            .unwrap();

        let mut session = Session::new(id, IdentityConfig::default(), Vec::new());
        session.on_event(&mut io, Event::Input(b"/status\n".to_vec().into()));

        let out = String::from_utf8(session.into_output()).unwrap();
        assert_eq!(
            out,
            format!("-- {id} libera irc.libera.chat:6697 Disconnected, 0 bytes queued\n")
        );
    }
}
