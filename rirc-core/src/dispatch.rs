//! Consumer-facing events and the handler they are delivered to.
//!
//! Every event is produced on the event loop thread and queued; the loop
//! hands them to the [`Handler`] one at a time. A handler may call back into
//! the [`IoContext`] (connect, disconnect, send, stop). Events raised by those
//! calls are appended to the queue and delivered after the handler returns,
//! so callbacks never nest.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::io::IoContext;

/// Severity of an [`Event::Log`] line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

/// External signals re-delivered as events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The terminal was resized (SIGWINCH).
    WindowChange,
}

/// Everything the core reports to its consumer.
///
/// `O` is the owner reference given to
/// [`IoContext::connection`]; it is echoed back untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum Event<O> {
    /// The connection is established (transition D).
    Connected { owner: O },
    /// An established connection went away.
    Disconnected { owner: O },
    /// A connect attempt or an established link failed.
    Error { owner: O, message: String },
    /// Progress notice: attempt started, peer address, retry schedule.
    Info { owner: O, message: String },
    /// First missed keepalive interval (G).
    PingStarted { owner: O, count: u32 },
    /// Another missed keepalive interval (H).
    PingUpdated { owner: O, count: u32 },
    /// Traffic resumed after one or more missed intervals (I).
    PingCleared { owner: O, count: u32 },
    /// A caught signal.
    Signal(Signal),
    /// Bytes read from the input stream.
    Input(Bytes),
    /// Bytes read from a connection.
    SocketData { owner: O, data: Bytes },
    /// Diagnostic line attributed to a connection when `owner` is set.
    Log {
        owner: Option<O>,
        level: LogLevel,
        message: String,
    },
}

impl<O> Event<O> {
    /// The owner reference this event is about, if any.
    pub fn owner(&self) -> Option<&O> {
        match self {
            Self::Connected { owner }
            | Self::Disconnected { owner }
            | Self::Error { owner, .. }
            | Self::Info { owner, .. }
            | Self::PingStarted { owner, .. }
            | Self::PingUpdated { owner, .. }
            | Self::PingCleared { owner, .. }
            | Self::SocketData { owner, .. } => Some(owner),
            Self::Log { owner, .. } => owner.as_ref(),
            Self::Signal(_) | Self::Input(_) => None,
        }
    }
}

// ── Handler ──────────────────────────────────────────────────────

/// Receives events from the event loop.
pub trait Handler<O> {
    fn on_event(&mut self, io: &mut IoContext<O>, event: Event<O>);
}

impl<O, F> Handler<O> for F
where
    F: FnMut(&mut IoContext<O>, Event<O>),
{
    fn on_event(&mut self, io: &mut IoContext<O>, event: Event<O>) {
        self(io, event)
    }
}

// ── EventQueue ───────────────────────────────────────────────────

/// FIFO of events waiting to be delivered.
#[derive(Debug)]
pub(crate) struct EventQueue<O> {
    events: VecDeque<Event<O>>,
}

impl<O> Default for EventQueue<O> {
    fn default() -> Self {
        Self {
            events: VecDeque::new(),
        }
    }
}

impl<O> EventQueue<O> {
    pub(crate) fn push(&mut self, event: Event<O>) {
        self.events.push_back(event);
    }

    pub(crate) fn pop(&mut self) -> Option<Event<O>> {
        self.events.pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub(crate) fn info(&mut self, owner: O, message: impl Into<String>) {
        self.push(Event::Info {
            owner,
            message: message.into(),
        });
    }

    pub(crate) fn error(&mut self, owner: O, message: impl Into<String>) {
        self.push(Event::Error {
            owner,
            message: message.into(),
        });
    }

    pub(crate) fn log(&mut self, owner: Option<O>, level: LogLevel, message: impl Into<String>) {
        self.push(Event::Log {
            owner,
            level,
            message: message.into(),
        });
    }

    #[cfg(test)]
    pub(crate) fn drain(&mut self) -> Vec<Event<O>> {
        self.events.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_is_fifo() {
        let mut q: EventQueue<u32> = EventQueue::default();
        q.info(1, "Connecting to irc.example.org:6697");
        q.push(Event::Connected { owner: 1 });
        q.error(2, "error connecting: refused");

        assert!(matches!(q.pop(), Some(Event::Info { owner: 1, .. })));
        assert!(matches!(q.pop(), Some(Event::Connected { owner: 1 })));
        assert!(matches!(q.pop(), Some(Event::Error { owner: 2, .. })));
        assert!(q.is_empty());
    }

    #[test]
    fn owner_accessor() {
        let ev: Event<&str> = Event::PingUpdated {
            owner: "libera",
            count: 3,
        };
        assert_eq!(ev.owner(), Some(&"libera"));

        let ev: Event<&str> = Event::Input(Bytes::from_static(b"/quit\n"));
        assert_eq!(ev.owner(), None);

        let ev: Event<&str> = Event::Log {
            owner: None,
            level: LogLevel::Warn,
            message: "x".into(),
        };
        assert_eq!(ev.owner(), None);
    }

    #[test]
    fn log_levels_order_by_severity() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Info < LogLevel::Debug);
    }
}
