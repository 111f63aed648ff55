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

//! Session creation: the classic double fork, synchronised by two
//! pipes so that errors surface in the invoking terminal.
//!
//! The invoking process opens a status pipe and forks; the
//! intermediate child calls setsid and forks again to sever the
//! controlling terminal lineage, and the grandchild pty-forks into
//! the command and the session server. The command's side of every
//! pipe is close-on-exec, so a clean exec reads as EOF on the status
//! pipe while an exec failure delivers the error message itself.

use std::{
    fs,
    io::{Read, Write},
    os::unix::io::BorrowedFd,
    os::unix::net::UnixListener,
    os::unix::process::CommandExt,
    path::Path,
    process::Command,
};

use anyhow::{anyhow, bail, Context};
use nix::{
    fcntl::OFlag,
    sys::termios::{self, SetArg, Termios},
    unistd::{fork, pipe2, setsid, ForkResult, Pid},
};
use tracing::{info, warn};

use crate::{consts, probe, session_dir, tty};

use super::{server, server::Server, signals::SignalWatcher};

pub struct SessionSpec {
    pub sock: session_dir::SessionPath,
    /// The name exactly as the user supplied it, for socket
    /// re-resolution inside the server.
    pub name: String,
    pub host: String,
    pub command: Vec<String>,
    /// Terminal attributes of the creating terminal, mirrored onto
    /// the fresh pty when available.
    pub term: Option<Termios>,
    pub size: tty::Size,
    /// True for detached creation: start draining the pty right away
    /// instead of waiting for a first client.
    pub read_pty_at_start: bool,
    pub scrollback_lines: usize,
}

/// Create a new session. Returns in the invoking process once the
/// server is up and the command has successfully exec'd; any failure
/// along the way comes back as an error with the socket file cleaned
/// up.
pub fn create_session(spec: SessionSpec) -> anyhow::Result<()> {
    if probe::session_pid(&spec.sock.path).is_some() {
        bail!("session '{}' already exists", spec.sock.session_name);
    }

    // The invoking process binds the socket so that a rendezvous
    // failure is reported before any forking happens.
    let listener = server::bind_listener(&spec.sock.path)?;

    let (status_r, status_w) =
        pipe2(OFlag::O_CLOEXEC).context("creating session status pipe")?;

    // Saftey: single threaded at this point; both sides immediately
    //         diverge.
    match unsafe { fork() }.context("forking session intermediary")? {
        ForkResult::Parent { child } => {
            drop(status_w);
            drop(listener);

            // reap the intermediary; it exits as soon as it has
            // forked the server
            let _ = nix::sys::wait::waitpid(child, None);

            let mut errmsg = Vec::new();
            let mut status_r = fs::File::from(status_r);
            let _ = status_r.read_to_end(&mut errmsg);
            if !errmsg.is_empty() {
                let _ = fs::remove_file(&spec.sock.path);
                bail!("{}", String::from_utf8_lossy(&errmsg).trim_end());
            }
            Ok(())
        }
        ForkResult::Child => {
            // the intermediary: break the controlling terminal
            // lineage, fork the real server, and get out of the way
            drop(status_r);
            let _ = setsid();
            match unsafe { fork() } {
                Ok(ForkResult::Parent { .. }) => unsafe { libc::_exit(0) },
                Ok(ForkResult::Child) => server_process(listener, status_w.into(), spec),
                Err(e) => {
                    let mut status_w = fs::File::from(status_w);
                    let _ = writeln!(status_w, "server-fork: {e}");
                    unsafe { libc::_exit(1) }
                }
            }
        }
    }
}

/// The server side of the bootstrap. Never returns; exits the process
/// when the session ends.
fn server_process(listener: UnixListener, status_pipe: fs::File, spec: SessionSpec) -> ! {
    let mut status_pipe = Some(status_pipe);
    let code = match spawn_and_serve(listener, &mut status_pipe, spec) {
        Ok(()) => 0,
        Err(e) => {
            // if the pipe is already gone the original parent has
            // moved on and the message only reaches the log
            warn!("session server failed: {:#}", e);
            if let Some(pipe) = status_pipe.as_mut() {
                let _ = writeln!(pipe, "{e:#}");
            }
            1
        }
    };
    unsafe { libc::_exit(code) }
}

fn spawn_and_serve(
    listener: UnixListener,
    status_pipe: &mut Option<fs::File>,
    spec: SessionSpec,
) -> anyhow::Result<()> {
    let (exec_r, exec_w) = pipe2(OFlag::O_CLOEXEC).context("creating exec status pipe")?;

    // handlers must be in place before the child can possibly die
    let signals = SignalWatcher::install()?;

    let fork = shpool_pty::fork::Fork::from_ptmx().context("forking pty")?;
    if fork.is_child().is_ok() {
        drop(exec_r);
        let err = Command::new(&spec.command[0])
            .args(&spec.command[1..])
            .env(consts::ENV_SESSION, &spec.sock.session_name)
            .env(consts::ENV_SOCKET, &spec.sock.path)
            .exec();

        // only reachable when the exec failed; report it on both
        // pipes so the server and the invoking terminal see it
        let msg = format!("exec {}: {}\n", spec.command[0], err);
        let mut exec_w = fs::File::from(exec_w);
        let _ = exec_w.write_all(msg.as_bytes());
        if let Some(pipe) = status_pipe.as_mut() {
            let _ = pipe.write_all(msg.as_bytes());
        }
        unsafe { libc::_exit(1) }
    }

    let child = match &fork {
        shpool_pty::fork::Fork::Parent(pid, _) => Pid::from_raw(*pid),
        _ => return Err(anyhow!("pty fork claims to be neither parent nor child")),
    };

    apply_terminal(&fork, &spec);

    // block until the exec verdict is in: EOF means the command is
    // running, bytes mean it never started
    drop(exec_w);
    let mut errmsg = Vec::new();
    let mut exec_r = fs::File::from(exec_r);
    let _ = exec_r.read_to_end(&mut errmsg);
    if !errmsg.is_empty() {
        // the child already wrote the message to the status pipe
        unsafe { libc::_exit(1) }
    }

    // success: release the invoking process and finish detaching
    status_pipe.take();
    detach_stdio();
    let _ = std::env::set_current_dir("/");

    info!("session '{}' bootstrapped", spec.sock.session_name);
    Server::new(
        listener,
        fork,
        child,
        spec.sock,
        spec.name,
        spec.host,
        signals,
        spec.read_pty_at_start,
        spec.scrollback_lines,
    )?
    .run()
}

/// Mirror the creating terminal's attributes and window size onto the
/// fresh pty. The pty fork primitive does not take them at fork time,
/// so they are applied through the master right after; the command
/// has not had a chance to look at its terminal yet.
fn apply_terminal(fork: &shpool_pty::fork::Fork, spec: &SessionSpec) {
    let master = match fork.is_parent() {
        Ok(m) => m,
        Err(_) => return,
    };
    let fd = match master.raw_fd() {
        Some(fd) => *fd,
        None => return,
    };
    // Saftey: the fork handle owns the fd and outlives this call.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };

    if let Some(term) = &spec.term {
        if let Err(e) = termios::tcsetattr(borrowed, SetArg::TCSANOW, term) {
            warn!("mirroring terminal attributes onto pty: {}", e);
        }
    }
    if let Err(e) = spec.size.set_fd(fd) {
        warn!("setting initial pty size: {:#}", e);
    }
}

fn detach_stdio() {
    // Saftey: plain fd shuffling on fds we own.
    unsafe {
        let dev_null = libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDWR);
        if dev_null >= 0 {
            libc::dup2(dev_null, libc::STDIN_FILENO);
            libc::dup2(dev_null, libc::STDOUT_FILENO);
            libc::dup2(dev_null, libc::STDERR_FILENO);
            if dev_null > libc::STDERR_FILENO {
                libc::close(dev_null);
            }
        }
    }
}

/// Wait briefly for a finished server to unlink its socket file, so
/// that recreating a just-collected session does not race the old
/// server's cleanup.
pub fn await_socket_removal(path: &Path) {
    for _ in 0..50 {
        if !path.exists() {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
}
