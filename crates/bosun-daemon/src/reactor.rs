//! Single-threaded readiness reactor
//!
//! A thin cooperative loop over `mio::Poll`.  Every registered
//! descriptor carries a token that packs a slot number and a source
//! kind; the supervisor dispatches on the kind.  One-shot timers drive
//! the poll timeout; there is no other blocking point in the daemon.

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

const KIND_BITS: usize = 2;
const KIND_MASK: usize = (1 << KIND_BITS) - 1;

/// What a ready token refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// The accept socket.
    Listener = 0,
    /// A connection socket.
    Connection = 1,
    /// A child pidfd; readable means the child terminated.
    Child = 2,
    /// The SIGCHLD signalfd of the zombie reaper.
    Signal = 3,
}

/// Pack a slot and kind into a token.
#[must_use]
pub fn token(slot: usize, kind: SourceKind) -> Token {
    Token((slot << KIND_BITS) | kind as usize)
}

/// Undo [`token`].
#[must_use]
pub fn split(token: Token) -> (usize, SourceKind) {
    let kind = match token.0 & KIND_MASK {
        0 => SourceKind::Listener,
        1 => SourceKind::Connection,
        2 => SourceKind::Child,
        _ => SourceKind::Signal,
    };
    (token.0 >> KIND_BITS, kind)
}

/// Identifier of a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// One-shot timers ordered by deadline.
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    cancelled: HashSet<u64>,
    next_id: u64,
}

impl TimerQueue {
    pub fn schedule(&mut self, after: Duration) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((Instant::now() + after, id)));
        TimerId(id)
    }

    pub fn cancel(&mut self, id: TimerId) {
        self.cancelled.insert(id.0);
    }

    /// Deadline of the nearest live timer.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.cancelled.remove(&id) {
                self.heap.pop();
                continue;
            }
            return Some(deadline);
        }
        None
    }

    /// Pop every timer due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerId> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if !self.cancelled.remove(&id) {
                due.push(TimerId(id));
            }
        }
        due
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.cancelled.clear();
    }
}

/// One readiness event, decoded.
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    /// HUP or error; the source should be torn down.
    pub closed: bool,
}

/// The poller plus its event buffer.
pub struct Reactor {
    poll: Poll,
    events: Events,
}

impl Reactor {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(64),
        })
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    pub fn register(&self, fd: RawFd, token: Token, interest: Interest) -> std::io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, interest)
    }

    pub fn deregister(&self, fd: RawFd) -> std::io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    /// Block until readiness or `timeout`, returning the decoded
    /// events.
    pub fn poll(&mut self, timeout: Option<Duration>) -> std::io::Result<Vec<Ready>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        Ok(self
            .events
            .iter()
            .map(|event| Ready {
                token: event.token(),
                readable: event.is_readable(),
                writable: event.is_writable(),
                closed: event.is_read_closed() || event.is_error(),
            })
            .collect())
    }
}

/// Reregister helper used when a connection toggles write interest.
pub fn reregister(
    registry: &Registry,
    fd: RawFd,
    token: Token,
    interest: Interest,
) -> std::io::Result<()> {
    registry.reregister(&mut SourceFd(&fd), token, interest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip() {
        for kind in [
            SourceKind::Listener,
            SourceKind::Connection,
            SourceKind::Child,
            SourceKind::Signal,
        ] {
            let (slot, decoded) = split(token(42, kind));
            assert_eq!(slot, 42);
            assert_eq!(decoded, kind);
        }
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut timers = TimerQueue::default();
        let slow = timers.schedule(Duration::from_secs(60));
        let fast = timers.schedule(Duration::from_millis(0));

        let due = timers.pop_due(Instant::now());
        assert_eq!(due, vec![fast]);

        assert!(timers.next_deadline().is_some());
        timers.cancel(slow);
        assert!(timers.next_deadline().is_none());
    }

    #[test]
    fn cancelled_timers_do_not_fire() {
        let mut timers = TimerQueue::default();
        let id = timers.schedule(Duration::from_millis(0));
        timers.cancel(id);
        assert!(timers.pop_due(Instant::now()).is_empty());
    }
}
