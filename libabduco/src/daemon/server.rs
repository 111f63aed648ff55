// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The session server: a single threaded, poll driven loop that fans
//! client input into the pty and pty output out to every connected
//! client.

use std::{
    fs, io,
    io::{Read, Write},
    os::unix::io::{AsRawFd, BorrowedFd},
    os::unix::net::UnixListener,
    path::{Path, PathBuf},
    process,
};

use anyhow::{anyhow, Context};
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
    sys::signal::{killpg, Signal},
    sys::stat::{umask, Mode},
    sys::wait::{waitpid, WaitPidFlag, WaitStatus},
    unistd::Pid,
};
use tracing::{debug, info, instrument, warn};

use abduco_protocol::{Packet, PAYLOAD_MAX};

use crate::{probe, session_dir, tty};

use super::{
    registry::{Client, ClientState, Registry},
    screen::ScreenBuffer,
    signals::SignalWatcher,
};

/// Bind the session socket with a fresh `rw-------` file, layering
/// the state bits on later. A leftover socket file from a dead server
/// gets unlinked and the bind retried once.
pub(crate) fn bind_listener(path: &Path) -> anyhow::Result<UnixListener> {
    let prev_umask = umask(Mode::from_bits_truncate(0o177));
    let mut res = UnixListener::bind(path);
    if let Err(e) = &res {
        if e.kind() == io::ErrorKind::AddrInUse && probe::session_pid(path).is_none() {
            debug!("replacing stale socket file {:?}", path);
            let _ = fs::remove_file(path);
            res = UnixListener::bind(path);
        }
    }
    umask(prev_umask);

    let listener = res.with_context(|| format!("binding session socket {:?}", path))?;
    listener.set_nonblocking(true).context("marking listener nonblocking")?;
    Ok(listener)
}

/// Unlinks the session socket file when the server winds down, on
/// normal return and on panic alike.
struct SocketGuard {
    path: PathBuf,
}

impl SocketGuard {
    fn remove_now(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        self.remove_now();
    }
}

struct PollResult {
    listener: PollFlags,
    pty: PollFlags,
    /// Client readiness keyed by client id: clients accepted after
    /// the poll returned must not inherit another client's events.
    clients: Vec<(u64, PollFlags)>,
}

pub struct Server {
    listener: UnixListener,
    cleanup: SocketGuard,
    /// The name exactly as the user supplied it, re-resolved when
    /// SIGUSR1 asks us to rebind after a directory move.
    name: String,
    host: String,
    session_name: String,
    // owns the pty pair for the lifetime of the server
    _pty_fork: shpool_pty::fork::Fork,
    pty: shpool_pty::fork::Master,
    pty_fd: i32,
    child: Pid,
    signals: SignalWatcher,
    clients: Registry,
    screen: ScreenBuffer,
    exit_status: Option<i32>,
    running: bool,
    /// Latched on by `-n` and by the first accepted client; once on,
    /// the pty is drained even with nobody connected so a detached
    /// child never blocks on a full pty buffer.
    read_pty: bool,
    exit_delivered: bool,
    /// Client input awaiting a writable pty.
    pty_outbuf: Vec<u8>,
}

impl Server {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        listener: UnixListener,
        pty_fork: shpool_pty::fork::Fork,
        child: Pid,
        sock: session_dir::SessionPath,
        name: String,
        host: String,
        signals: SignalWatcher,
        read_pty: bool,
        scrollback_lines: usize,
    ) -> anyhow::Result<Server> {
        let pty = pty_fork.is_parent().context("grabbing pty master handle")?;
        let pty_fd = pty.raw_fd().ok_or(anyhow!("no fd for pty master"))?;
        set_nonblocking(pty_fd).context("marking pty master nonblocking")?;

        Ok(Server {
            listener,
            cleanup: SocketGuard { path: sock.path },
            name,
            host,
            session_name: sock.session_name,
            _pty_fork: pty_fork,
            pty,
            pty_fd,
            child,
            signals,
            clients: Registry::new(),
            screen: ScreenBuffer::new(scrollback_lines),
            exit_status: None,
            running: true,
            read_pty,
            exit_delivered: false,
            pty_outbuf: Vec::new(),
        })
    }

    fn sock_path(&self) -> PathBuf {
        self.cleanup.path.clone()
    }

    /// The main loop. Runs until the last client is gone and, if the
    /// child died with a client attached, the final EXIT packet has
    /// been acknowledged. A session whose child died with nobody
    /// attached lingers here until someone attaches to collect the
    /// exit status.
    #[instrument(skip_all, fields(s = self.session_name))]
    pub fn run(mut self) -> anyhow::Result<()> {
        info!("serving session, child pid {}", self.child);

        while !self.clients.is_empty() || !self.exit_delivered {
            let pty_read = self.running && self.read_pty && self.clients.all_drained();
            let pty_write = self.running && !self.pty_outbuf.is_empty();

            let result = self.wait(pty_read, pty_write)?;

            let pending = self.signals.drain();
            if pending.terminate {
                info!("termination signal, cleaning up");
                self.cleanup.remove_now();
                process::exit(1);
            }
            if pending.child_exited {
                self.reap_child();
            }
            if pending.rebind {
                self.rebind_socket();
            }

            let result = match result {
                Some(r) => r,
                // interrupted; the flags above have been serviced,
                // just wait again
                None => continue,
            };

            if result.listener.intersects(PollFlags::POLLIN) {
                self.accept_clients();
            }

            let chunk = if pty_read
                && result.pty.intersects(PollFlags::POLLIN | PollFlags::POLLHUP)
            {
                self.read_pty_chunk()
            } else {
                None
            };
            if let Some(chunk) = &chunk {
                self.screen.push(chunk);
            }

            if !self.pty_outbuf.is_empty() {
                self.flush_pty();
            }

            self.service_clients(&result.clients);

            if let Some(chunk) = chunk {
                let bytes = Packet::Content(chunk).encode();
                for c in self.clients.iter_mut() {
                    if !c.reapable() {
                        enqueue_bytes(c, &bytes);
                    }
                }
            }

            if !self.running {
                if let Some(status) = self.exit_status {
                    for c in self.clients.iter_mut() {
                        if !c.reapable() && c.has_attached && !c.exit_sent {
                            enqueue(c, &Packet::Exit(status));
                            c.exit_sent = true;
                        }
                    }
                }
            }

            let reaped = self.clients.reap();
            if reaped.head_replaced {
                // ask the newly promoted primary client to announce
                // its window size
                if let Some(head) = self.clients.head_mut() {
                    enqueue(head, &Packet::Resize(None));
                }
            }
            if reaped.now_empty {
                probe::mark_attached(&self.sock_path(), false);
            }
        }

        info!("all clients gone and exit status delivered, shutting down");
        Ok(())
    }

    /// Block in poll until something needs doing. `None` means the
    /// wait was interrupted by a signal.
    fn wait(&mut self, pty_read: bool, pty_write: bool) -> anyhow::Result<Option<PollResult>> {
        // pty revents land here only when the pty is in the set at
        // all; a hung-up pty would otherwise wake us in a tight loop
        // while output is still pending to a slow client
        let poll_pty = pty_read || pty_write;

        let mut pty_events = PollFlags::empty();
        if pty_read {
            pty_events |= PollFlags::POLLIN;
        }
        if pty_write {
            pty_events |= PollFlags::POLLOUT;
        }

        let ids = self.clients.ids();
        let mut fds = Vec::with_capacity(3 + ids.len());
        // Saftey: every fd here is owned by self and outlives the
        //         poll call.
        unsafe {
            fds.push(PollFd::new(
                BorrowedFd::borrow_raw(self.signals.poll_fd()),
                PollFlags::POLLIN,
            ));
            fds.push(PollFd::new(
                BorrowedFd::borrow_raw(self.listener.as_raw_fd()),
                PollFlags::POLLIN,
            ));
            if poll_pty {
                fds.push(PollFd::new(BorrowedFd::borrow_raw(self.pty_fd), pty_events));
            }
            for c in self.clients.iter() {
                let mut events = PollFlags::POLLIN;
                if !c.outbuf.is_empty() {
                    events |= PollFlags::POLLOUT;
                }
                fds.push(PollFd::new(BorrowedFd::borrow_raw(c.stream.as_raw_fd()), events));
            }
        }

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(None),
            Err(e) => return Err(e).context("polling for readiness"),
        }

        let revents: Vec<PollFlags> =
            fds.iter().map(|fd| fd.revents().unwrap_or(PollFlags::empty())).collect();
        let clients_start = if poll_pty { 3 } else { 2 };
        Ok(Some(PollResult {
            listener: revents[1],
            pty: if poll_pty { revents[2] } else { PollFlags::empty() },
            clients: ids.into_iter().zip(revents[clients_start..].iter().copied()).collect(),
        }))
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!("marking accepted client nonblocking: {}", e);
                        continue;
                    }
                    if self.clients.is_empty() {
                        probe::mark_attached(&self.sock_path(), true);
                    }
                    info!("accepted client connection");
                    let pid = process::id() as u64;
                    let client = self.clients.push_front(stream);
                    enqueue(client, &Packet::Pid(pid));
                    self.read_pty = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accepting client: {}", e);
                    break;
                }
            }
        }
    }

    fn read_pty_chunk(&mut self) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; PAYLOAD_MAX];
        match self.pty.read(&mut buf) {
            Ok(0) => {
                info!("eof on pty master");
                self.running = false;
                None
            }
            Ok(n) => {
                buf.truncate(n);
                Some(buf)
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                None
            }
            Err(e) => {
                // EIO is the usual way a pty reports its last slave
                // closing
                info!("pty master read failed: {}", e);
                self.running = false;
                None
            }
        }
    }

    fn flush_pty(&mut self) {
        while !self.pty_outbuf.is_empty() {
            match self.pty.write(&self.pty_outbuf) {
                Ok(0) => {
                    self.running = false;
                    break;
                }
                Ok(n) => {
                    self.pty_outbuf.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    info!("pty master write failed: {}", e);
                    self.running = false;
                    break;
                }
            }
        }
    }

    fn service_clients(&mut self, revents: &[(u64, PollFlags)]) {
        // dispatch by stable id: an ATTACH can reorder the registry
        // under our feet
        for (id, flags) in revents.iter() {
            let flags = *flags;

            if flags.contains(PollFlags::POLLOUT) {
                if let Some(c) = self.clients.by_id(*id) {
                    flush_client(c);
                }
            }

            if !flags
                .intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
            {
                continue;
            }

            let pkt = {
                let c = match self.clients.by_id(*id) {
                    Some(c) => c,
                    None => continue,
                };
                if c.reapable() {
                    continue;
                }
                match Packet::read_from(&mut c.stream) {
                    Ok(Some(pkt)) => pkt,
                    Ok(None) => continue,
                    Err(e) => {
                        debug!("client {}: dropping connection: {}", id, e);
                        c.state = ClientState::Disconnected;
                        continue;
                    }
                }
            };
            self.dispatch(*id, pkt);
        }
    }

    fn dispatch(&mut self, id: u64, pkt: Packet) {
        match pkt {
            Packet::Content(data) => {
                let read_only =
                    self.clients.by_id(id).map(|c| c.flags.read_only).unwrap_or(true);
                if !read_only && !data.is_empty() {
                    self.pty_outbuf.extend_from_slice(&data);
                    self.flush_pty();
                }
            }
            Packet::Attach(flags) => {
                debug!("client {}: attach, flags {:?}", id, flags);
                if let Some(c) = self.clients.by_id(id) {
                    c.flags = flags;
                    c.has_attached = true;
                }
                if flags.low_priority {
                    self.clients.sink_to_tail(id);
                }
                // bring the late attacher up to date, then ack the
                // attach so a roundtrip works even when the child
                // stays silent; a dead child is announced through
                // the EXIT path instead
                let replay: Vec<Vec<u8>> =
                    self.screen.replay().map(|line| line.to_vec()).collect();
                let running = self.running;
                if let Some(c) = self.clients.by_id(id) {
                    for line in replay {
                        enqueue(c, &Packet::Content(line));
                    }
                    if running {
                        enqueue(c, &Packet::Content(vec![]));
                    }
                }
            }
            Packet::Resize(ws) => {
                let is_head = self.clients.is_head(id);
                let mut read_only = false;
                if let Some(c) = self.clients.by_id(id) {
                    c.state = ClientState::Attached;
                    read_only = c.flags.read_only;
                }
                if let Some(ws) = ws {
                    // only the primary client drives the pty size
                    if is_head && !read_only {
                        debug!("client {}: applying window size {:?}", id, ws);
                        if let Err(e) = tty::Size::from(ws).set_fd(self.pty_fd) {
                            warn!("applying window size: {:#}", e);
                        }
                    }
                }
                let _ = killpg(self.child, Signal::SIGWINCH);
            }
            Packet::Detach => {
                debug!("client {}: detached", id);
                if let Some(c) = self.clients.by_id(id) {
                    c.state = ClientState::Detached;
                }
            }
            Packet::Exit(_) => {
                // the client acknowledged the final exit status
                self.exit_delivered = true;
                if let Some(c) = self.clients.by_id(id) {
                    c.state = ClientState::Disconnected;
                }
            }
            Packet::Pid(_) | Packet::Unknown { .. } => {}
        }
    }

    fn reap_child(&mut self) {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(WaitStatus::Exited(pid, code)) => {
                    if pid == self.child {
                        self.record_exit(code);
                    }
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    if pid == self.child {
                        self.record_exit(128 + sig as i32);
                    }
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    }

    fn record_exit(&mut self, status: i32) {
        info!("child exited with status {}", status);
        self.exit_status = Some(status);
        probe::mark_terminated(&self.sock_path());
    }

    /// SIGUSR1: the session directory may have moved; re-resolve the
    /// socket path and swap the listener, keeping every accepted
    /// connection intact. Failure leaves the old listener in place.
    fn rebind_socket(&mut self) {
        info!("rebinding session socket");
        let resolved = match session_dir::resolve(&self.name, &self.host) {
            Ok(r) => r,
            Err(e) => {
                warn!("re-resolving socket path: {:#}", e);
                return;
            }
        };
        match bind_listener(&resolved.path) {
            Ok(listener) => {
                self.listener = listener;
                self.cleanup.path = resolved.path;
                // carry the state bits over onto the fresh file
                if !self.clients.is_empty() {
                    probe::mark_attached(&self.sock_path(), true);
                }
                if self.exit_status.is_some() {
                    probe::mark_terminated(&self.sock_path());
                }
            }
            Err(e) => warn!("rebinding socket failed, keeping the old one: {:#}", e),
        }
    }
}

fn enqueue(c: &mut Client, pkt: &Packet) {
    enqueue_bytes(c, &pkt.encode());
}

fn enqueue_bytes(c: &mut Client, bytes: &[u8]) {
    c.outbuf.extend_from_slice(bytes);
    flush_client(c);
}

/// Push as much pending output to the client as its socket accepts.
/// Leftover bytes stay queued and hold the pty read gate closed.
fn flush_client(c: &mut Client) {
    while !c.outbuf.is_empty() {
        match c.stream.write(&c.outbuf) {
            Ok(0) => {
                c.state = ClientState::Disconnected;
                break;
            }
            Ok(n) => {
                c.outbuf.drain(..n);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                debug!("client write failed: {}", e);
                c.state = ClientState::Disconnected;
                break;
            }
        }
    }
}

fn set_nonblocking(fd: i32) -> anyhow::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};

    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let flags = fcntl(borrowed, FcntlArg::F_GETFL).context("fetching fd flags")?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(borrowed, FcntlArg::F_SETFL(flags)).context("setting O_NONBLOCK")?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bind_listener_replaces_a_dead_socket() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("dead.sock");
        // a server that went away without unlinking
        drop(UnixListener::bind(&path).expect("first bind"));

        let listener = bind_listener(&path).expect("rebinding over the corpse");
        drop(listener);
    }

    #[test]
    fn bound_socket_file_starts_private() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("fresh.sock");
        let _listener = bind_listener(&path).expect("bind");

        let st = nix::sys::stat::stat(&path).expect("stat");
        assert_eq!(st.st_mode & 0o777, 0o600);
    }
}
