//! Supervisor lifecycle
//!
//! Owns the reactor, the cgroup state, the tmpfs manager, the zombie
//! reaper and the connection table.  Accepts new clients, dispatches
//! readiness events, runs the expiration timer, and returns from
//! [`Supervisor::run`] once the last connection is gone.

use crate::connection::{Action, Connection, SpawnContext};
use crate::reactor::{self, Reactor, SourceKind, TimerId, TimerQueue};
use crate::registry::ZombieReaper;
use bosun_core::config::VerifyHook;
use bosun_core::tmpfs::IDLE_THRESHOLD;
use bosun_core::{CgroupState, SpawnConfig, TmpfsManager};
use mio::{Interest, Token};
use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Instant;

/// State shared with every connection while it handles an event.
pub struct Shared {
    pub config: SpawnConfig,
    pub cgroup: CgroupState,
    pub tmpfs: Option<TmpfsManager>,
    pub hook: Option<Box<dyn VerifyHook>>,
}

pub struct Supervisor {
    reactor: Reactor,
    timers: TimerQueue,
    listener: OwnedFd,
    connections: HashMap<usize, Connection>,
    /// pidfd token -> (connection slot, request id)
    child_index: HashMap<Token, (usize, u32)>,
    next_slot: usize,
    shared: Shared,
    reaper: Option<ZombieReaper>,
    expire_timer: Option<TimerId>,
    accepted_any: bool,
}

impl Supervisor {
    pub fn new(listener: OwnedFd, shared: Shared) -> std::io::Result<Self> {
        let reactor = Reactor::new()?;
        let mut timers = TimerQueue::default();

        reactor.register(
            listener.as_raw_fd(),
            reactor::token(0, SourceKind::Listener),
            Interest::READABLE,
        )?;

        let reaper = ZombieReaper::new()?;
        reactor.register(
            reaper.fd(),
            reactor::token(0, SourceKind::Signal),
            Interest::READABLE,
        )?;

        let expire_timer = shared
            .tmpfs
            .is_some()
            .then(|| timers.schedule(IDLE_THRESHOLD));

        Ok(Self {
            reactor,
            timers,
            listener,
            connections: HashMap::new(),
            child_index: HashMap::new(),
            next_slot: 1,
            shared,
            reaper: Some(reaper),
            expire_timer,
            accepted_any: false,
        })
    }

    /// Adopt a socket as a new client session and schedule reads.
    pub fn add_connection(&mut self, socket: OwnedFd) -> std::io::Result<()> {
        let slot = self.next_slot;
        self.next_slot += 1;

        let token = reactor::token(slot, SourceKind::Connection);
        let connection = Connection::new(socket, token)?;
        self.reactor
            .register(connection.socket_fd(), token, Interest::READABLE)?;

        tracing::debug!(slot, "connection added");
        self.connections.insert(slot, connection);
        self.accepted_any = true;
        Ok(())
    }

    /// Drive the reactor until the last connection is gone.
    pub fn run(&mut self) -> std::io::Result<()> {
        let mut actions: Vec<Action> = Vec::new();

        loop {
            if self.accepted_any && self.connections.is_empty() {
                break;
            }

            let timeout = self
                .timers
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));

            let events = self.reactor.poll(timeout)?;

            for ready in events {
                let (slot, kind) = reactor::split(ready.token);
                match kind {
                    SourceKind::Listener => self.accept_pending(),

                    SourceKind::Signal => {
                        if let Some(reaper) = &mut self.reaper {
                            reaper.on_readable();
                        }
                    }

                    SourceKind::Connection => {
                        let Some(connection) = self.connections.get_mut(&slot) else {
                            continue;
                        };

                        let mut ctx = SpawnContext {
                            registry: self.reactor.registry(),
                            shared: &mut self.shared,
                            child_index: &mut self.child_index,
                            next_slot: &mut self.next_slot,
                            actions: &mut actions,
                            conn_slot: slot,
                        };

                        let keep = if ready.closed && !ready.readable {
                            false
                        } else {
                            connection.on_ready(ready.readable, ready.writable, &mut ctx)
                        };

                        if !keep {
                            actions.push(Action::Close(slot));
                        }
                    }

                    SourceKind::Child => {
                        let Some((slot, id)) = self.child_index.remove(&ready.token) else {
                            continue;
                        };
                        if let Some(connection) = self.connections.get_mut(&slot) {
                            connection.on_child_exit(id, self.reactor.registry());
                        }
                    }
                }
            }

            // deferred work: connection table mutation cannot happen
            // while an event borrows a connection
            for action in actions.drain(..) {
                match action {
                    Action::AddConnection(socket) => {
                        if let Err(e) = self.add_connection(socket) {
                            tracing::error!(error = %e, "failed to adopt connection");
                        }
                    }
                    Action::Close(slot) => self.close_connection(slot),
                }
            }

            self.fire_timers();
        }

        tracing::info!("last connection closed, shutting down");
        self.timers.clear();
        if let Some(reaper) = self.reaper.take() {
            reaper.disable();
        }
        Ok(())
    }

    fn accept_pending(&mut self) {
        loop {
            match nix::sys::socket::accept4(
                self.listener.as_raw_fd(),
                nix::sys::socket::SockFlag::SOCK_CLOEXEC | nix::sys::socket::SockFlag::SOCK_NONBLOCK,
            ) {
                Ok(fd) => {
                    // SAFETY: accept4 just returned this descriptor
                    let socket = unsafe { OwnedFd::from_raw_fd(fd) };
                    if let Err(e) = self.add_connection(socket) {
                        tracing::error!(error = %e, "failed to add connection");
                    }
                }
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn close_connection(&mut self, slot: usize) {
        let Some(mut connection) = self.connections.remove(&slot) else {
            return;
        };

        tracing::debug!(slot, children = connection.children.len(), "connection closed");
        connection.teardown(self.reactor.registry(), &self.shared.cgroup);
        self.child_index.retain(|_, (s, _)| *s != slot);
    }

    fn fire_timers(&mut self) {
        let due = self.timers.pop_due(Instant::now());
        for id in due {
            if Some(id) == self.expire_timer {
                if let Some(tmpfs) = &mut self.shared.tmpfs {
                    tmpfs.expire();
                }
                self.expire_timer = Some(self.timers.schedule(IDLE_THRESHOLD));
            }
        }
    }
}
