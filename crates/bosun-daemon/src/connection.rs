//! Per-client session over the control socket
//!
//! Each connection receives framed messages (payload plus
//! `SCM_RIGHTS` descriptors), dispatches on the command byte and
//! queues responses.  EXEC_COMPLETE and EXIT ride independent FIFO
//! queues flushed on writability in batches; a full socket buffer
//! parks the batch until the next writable event.  Malformed payloads
//! are logged and the connection keeps serving.

use crate::reactor::{self, SourceKind};
use crate::registry::{self, ChildRecord};
use crate::supervisor::Shared;
use bosun_core::protocol::{
    self, request, response, ExecCompleteItem, ExitItem, FdList, Payload, Serializer, MAX_BATCH,
    MAX_FDS, MAX_PAYLOAD,
};
use bosun_core::{spawn, SpawnError};
use mio::{Interest, Registry, Token};
use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessageOwned, MsgFlags, UnixAddr};
use std::collections::{HashMap, VecDeque};
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Spawn-failure wait status: exit code 0xff.
const SPAWN_FAILURE_STATUS: i32 = 0xff00;

/// Work a connection hands back to the supervisor, executed after the
/// current dispatch round.
#[derive(Debug)]
pub enum Action {
    /// Adopt the carried socket as an additional connection.
    AddConnection(OwnedFd),
    /// Tear down the connection in this slot.
    Close(usize),
}

/// Everything a connection needs from the supervisor while handling
/// one event.
pub struct SpawnContext<'a> {
    pub registry: &'a Registry,
    pub shared: &'a mut Shared,
    /// Global pidfd token index: token -> (connection slot, request id).
    pub child_index: &'a mut HashMap<Token, (usize, u32)>,
    pub next_slot: &'a mut usize,
    pub actions: &'a mut Vec<Action>,
    pub conn_slot: usize,
}

enum Received {
    Message(Vec<u8>, Vec<OwnedFd>),
    Closed,
    WouldBlock,
}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    // SAFETY: fcntl on a descriptor we own
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: as above
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Stateful per-client session.
pub struct Connection {
    socket: OwnedFd,
    token: Token,
    pub children: HashMap<u32, ChildRecord>,
    exec_complete_queue: VecDeque<ExecCompleteItem>,
    exit_queue: VecDeque<ExitItem>,
    write_scheduled: bool,
}

impl Connection {
    pub fn new(socket: OwnedFd, token: Token) -> std::io::Result<Self> {
        set_nonblocking(socket.as_raw_fd())?;
        Ok(Self {
            socket,
            token,
            children: HashMap::new(),
            exec_complete_queue: VecDeque::new(),
            exit_queue: VecDeque::new(),
            write_scheduled: false,
        })
    }

    #[must_use]
    pub fn socket_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Handle one readiness event.  Returns false when the connection
    /// must be torn down.
    pub fn on_ready(&mut self, readable: bool, writable: bool, ctx: &mut SpawnContext<'_>) -> bool {
        if writable {
            if let Err(e) = self.flush(ctx.registry) {
                tracing::warn!(error = %e, "response flush failed");
                return false;
            }
        }

        if readable {
            loop {
                match self.receive_one() {
                    Ok(Received::Message(payload, fds)) => {
                        if let Err(e) = self.dispatch(&payload, FdList::new(fds), ctx) {
                            if e.is_malformed() {
                                tracing::warn!("malformed spawn payload");
                            } else {
                                tracing::warn!(error = %e, "request failed");
                            }
                        }
                    }
                    Ok(Received::Closed) => return false,
                    Ok(Received::WouldBlock) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "receive failed");
                        return false;
                    }
                }
            }
        }

        true
    }

    /// One atomic receive of payload plus ancillary descriptors.
    fn receive_one(&mut self) -> nix::Result<Received> {
        let mut buf = vec![0u8; MAX_PAYLOAD];
        let mut cmsg = nix::cmsg_space!([RawFd; MAX_FDS]);

        let (bytes, fds) = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let msg = match recvmsg::<UnixAddr>(
                self.socket.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg),
                MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_CMSG_CLOEXEC,
            ) {
                Ok(msg) => msg,
                Err(Errno::EAGAIN) => return Ok(Received::WouldBlock),
                Err(e) => return Err(e),
            };

            let mut fds = Vec::new();
            if let Ok(cmsgs) = msg.cmsgs() {
                for cmsg in cmsgs {
                    if let ControlMessageOwned::ScmRights(received) = cmsg {
                        for fd in received {
                            // SAFETY: the kernel installed these fresh
                            // descriptors for us
                            fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                        }
                    }
                }
            }

            (msg.bytes, fds)
        };

        if bytes == 0 {
            return Ok(Received::Closed);
        }

        buf.truncate(bytes);
        Ok(Received::Message(buf, fds))
    }

    fn dispatch(
        &mut self,
        payload: &[u8],
        mut fds: FdList,
        ctx: &mut SpawnContext<'_>,
    ) -> bosun_core::Result<()> {
        let mut payload = Payload::new(payload);

        match payload.read_u8()? {
            request::CONNECT => {
                if !payload.is_empty() || fds.len() != 1 {
                    return Err(SpawnError::MalformedPayload);
                }
                ctx.actions.push(Action::AddConnection(fds.next()?));
                Ok(())
            }

            request::EXEC => self.handle_exec(payload, fds, ctx),

            request::KILL => {
                if !fds.is_empty() {
                    return Err(SpawnError::MalformedPayload);
                }
                while !payload.is_empty() {
                    let (id, signo) = protocol::parse_one_kill(&mut payload)?;
                    self.handle_one_kill(id, signo, ctx);
                }
                Ok(())
            }

            _ => Err(SpawnError::MalformedPayload),
        }
    }

    fn handle_exec(
        &mut self,
        payload: Payload<'_>,
        mut fds: FdList,
        ctx: &mut SpawnContext<'_>,
    ) -> bosun_core::Result<()> {
        let (id, name, prepared) = protocol::parse_exec(payload, &mut fds)?;

        if self.children.contains_key(&id) {
            self.send_exec_complete(id, format!("request id {id} already in use"), ctx.registry);
            self.send_exit(id, SPAWN_FAILURE_STATUS, ctx.registry);
            return Ok(());
        }

        let spawned = spawn::spawn_child(
            prepared,
            &ctx.shared.config,
            ctx.shared.hook.as_deref(),
            &ctx.shared.cgroup,
            ctx.shared.tmpfs.as_mut(),
        );

        match spawned {
            Ok(child) => {
                let token = reactor::token(*ctx.next_slot, SourceKind::Child);
                *ctx.next_slot += 1;

                if let Err(e) = ctx.registry.register(
                    &mut mio::unix::SourceFd(&child.pidfd.as_raw_fd()),
                    token,
                    Interest::READABLE,
                ) {
                    tracing::error!(id, error = %e, "pidfd registration failed");
                    self.send_exec_complete(id, format!("pidfd registration failed: {e}"), ctx.registry);
                    self.send_exit(id, SPAWN_FAILURE_STATUS, ctx.registry);
                    return Ok(());
                }

                tracing::info!(id, name = %name, pid = child.pid, "child spawned");

                ctx.child_index.insert(token, (ctx.conn_slot, id));
                self.children.insert(
                    id,
                    ChildRecord {
                        id,
                        name,
                        pidfd: child.pidfd,
                        leases: child.leases,
                        cgroup_path: child.cgroup_path,
                        killed: false,
                    },
                );

                self.send_exec_complete(id, String::new(), ctx.registry);
            }

            Err(e) => {
                tracing::warn!(id, name = %name, error = %e, "spawn failed");
                self.send_exec_complete(id, e.to_string(), ctx.registry);
                self.send_exit(id, SPAWN_FAILURE_STATUS, ctx.registry);
            }
        }

        Ok(())
    }

    /// A KILL for a live id delivers the signal; an unknown or
    /// already-killed id is silently ignored.
    fn handle_one_kill(&mut self, id: u32, signo: i32, ctx: &mut SpawnContext<'_>) {
        if let Some(record) = self.children.get_mut(&id) {
            if !record.killed {
                tracing::debug!(id, signo, "kill dispatched");
                record.kill(&ctx.shared.cgroup, signo);
            }
        }
    }

    /// The child behind `id` terminated: reap it, release its record
    /// and queue the EXIT response.
    pub fn on_child_exit(&mut self, id: u32, registry: &Registry) {
        let Some(record) = self.children.remove(&id) else {
            return;
        };

        let _ = registry.deregister(&mut mio::unix::SourceFd(&record.pidfd.as_raw_fd()));

        let status = match registry::wait_pidfd(&record.pidfd) {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(id, error = %e, "waitid failed");
                SPAWN_FAILURE_STATUS
            }
        };

        tracing::debug!(id, name = %record.name, status, leases = record.leases.len(), "child exited");
        self.send_exit(id, status, registry);
        // dropping the record closes the pidfd and releases the leases
    }

    fn send_exec_complete(&mut self, id: u32, error: String, registry: &Registry) {
        self.exec_complete_queue.push_back(ExecCompleteItem { id, error });
        self.schedule_write(registry);
    }

    fn send_exit(&mut self, id: u32, status: i32, registry: &Registry) {
        self.exit_queue.push_back(ExitItem { id, status });
        self.schedule_write(registry);
    }

    fn schedule_write(&mut self, registry: &Registry) {
        if self.write_scheduled {
            return;
        }
        if let Err(e) = reactor::reregister(
            registry,
            self.socket.as_raw_fd(),
            self.token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            tracing::error!(error = %e, "write scheduling failed");
            return;
        }
        self.write_scheduled = true;
    }

    /// Flush both response queues; cancel write interest once both are
    /// empty.
    fn flush(&mut self, registry: &Registry) -> std::io::Result<()> {
        while !self.exec_complete_queue.is_empty() {
            let batch = build_exec_complete_batch(&self.exec_complete_queue);
            if !self.try_send(batch.payload())? {
                return Ok(());
            }
            let n = self.exec_complete_queue.len().min(MAX_BATCH);
            self.exec_complete_queue.drain(..n);
        }

        while !self.exit_queue.is_empty() {
            let batch = build_exit_batch(&self.exit_queue);
            if !self.try_send(batch.payload())? {
                return Ok(());
            }
            let n = self.exit_queue.len().min(MAX_BATCH);
            self.exit_queue.drain(..n);
        }

        if self.write_scheduled {
            reactor::reregister(
                registry,
                self.socket.as_raw_fd(),
                self.token,
                Interest::READABLE,
            )?;
            self.write_scheduled = false;
        }

        Ok(())
    }

    /// Non-blocking send of one response datagram.  Returns false on a
    /// full socket buffer.
    fn try_send(&self, payload: &[u8]) -> std::io::Result<bool> {
        let iov = [IoSlice::new(payload)];
        match sendmsg::<UnixAddr>(
            self.socket.as_raw_fd(),
            &iov,
            &[],
            MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_NOSIGNAL,
            None,
        ) {
            Ok(_) => Ok(true),
            Err(Errno::EAGAIN) => Ok(false),
            Err(e) => Err(std::io::Error::from(e)),
        }
    }

    /// Close the session: SIGTERM every tracked child and drop its
    /// record (releasing pidfds and leases).
    pub fn teardown(&mut self, registry: &Registry, cgroup_state: &bosun_core::CgroupState) {
        let _ = registry.deregister(&mut mio::unix::SourceFd(&self.socket.as_raw_fd()));

        for (_, mut record) in self.children.drain() {
            let _ = registry.deregister(&mut mio::unix::SourceFd(&record.pidfd.as_raw_fd()));
            if !record.killed {
                record.kill(cgroup_state, libc::SIGTERM);
            }
        }
    }
}

fn build_exec_complete_batch(queue: &VecDeque<ExecCompleteItem>) -> Serializer {
    let mut s = Serializer::new(response::EXEC_COMPLETE);
    for item in queue.iter().take(MAX_BATCH) {
        s.write_u32(item.id).write_lp_str(&item.error);
    }
    s
}

fn build_exit_batch(queue: &VecDeque<ExitItem>) -> Serializer {
    let mut s = Serializer::new(response::EXIT);
    for item in queue.iter().take(MAX_BATCH) {
        s.write_u32(item.id).write_i32(item.status);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_are_bounded_and_fifo() {
        let mut queue = VecDeque::new();
        for id in 0..100u32 {
            queue.push_back(ExitItem { id, status: 0 });
        }

        let batch = build_exit_batch(&queue);
        let items = protocol::parse_exit(Payload::new(&batch.payload()[1..])).unwrap();
        assert_eq!(items.len(), MAX_BATCH);
        assert_eq!(items.first().map(|i| i.id), Some(0));
        assert_eq!(items.last().map(|i| i.id), Some(MAX_BATCH as u32 - 1));
    }

    #[test]
    fn exec_complete_batch_round_trips() {
        let mut queue = VecDeque::new();
        queue.push_back(ExecCompleteItem {
            id: 7,
            error: String::new(),
        });
        queue.push_back(ExecCompleteItem {
            id: 8,
            error: "tmpfs error: no space".into(),
        });

        let batch = build_exec_complete_batch(&queue);
        assert_eq!(batch.payload()[0], response::EXEC_COMPLETE);

        let items = protocol::parse_exec_complete(Payload::new(&batch.payload()[1..])).unwrap();
        assert_eq!(items.len(), 2);
        assert!(items[0].error.is_empty());
        assert_eq!(items[1].id, 8);
    }
}
