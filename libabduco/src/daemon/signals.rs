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

//! Signal plumbing for the session server.
//!
//! Handlers do nothing but flip a flag and poke a self-pipe; the pipe
//! sits in the server's poll set so a signal wakes the main loop,
//! which then does the actual work (waitpid, rebind, shutdown) in
//! normal context.

use std::{
    io::Read,
    os::unix::io::{AsRawFd, RawFd},
    os::unix::net::UnixStream,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Context;
use nix::sys::signal::{signal, SigHandler, Signal};
use signal_hook::{consts as sigs, flag, low_level::pipe};
use tracing::info;

#[derive(Debug, Default)]
pub struct Pending {
    pub child_exited: bool,
    pub rebind: bool,
    pub terminate: bool,
}

pub struct SignalWatcher {
    rx: UnixStream,
    // keeps the write end alive for the registered handlers
    _tx: UnixStream,
    child_exited: Arc<AtomicBool>,
    rebind: Arc<AtomicBool>,
    terminate: Arc<AtomicBool>,
}

impl SignalWatcher {
    pub fn install() -> anyhow::Result<SignalWatcher> {
        let (rx, tx) = UnixStream::pair().context("creating signal self-pipe")?;
        rx.set_nonblocking(true).context("marking signal pipe nonblocking")?;
        tx.set_nonblocking(true).context("marking signal pipe nonblocking")?;

        let child_exited = Arc::new(AtomicBool::new(false));
        let rebind = Arc::new(AtomicBool::new(false));
        let terminate = Arc::new(AtomicBool::new(false));

        flag::register(sigs::SIGCHLD, Arc::clone(&child_exited))
            .context("registering SIGCHLD flag")?;
        flag::register(sigs::SIGUSR1, Arc::clone(&rebind)).context("registering SIGUSR1 flag")?;
        flag::register(sigs::SIGTERM, Arc::clone(&terminate))
            .context("registering SIGTERM flag")?;
        flag::register(sigs::SIGINT, Arc::clone(&terminate)).context("registering SIGINT flag")?;

        for sig in [sigs::SIGCHLD, sigs::SIGUSR1, sigs::SIGTERM, sigs::SIGINT] {
            pipe::register_raw(sig, tx.as_raw_fd())
                .with_context(|| format!("registering wakeup pipe for signal {sig}"))?;
        }

        // A client going away mid-write must surface as EPIPE, not
        // kill the server; HUP can't mean anything to a process with
        // no controlling terminal.
        unsafe {
            signal(Signal::SIGPIPE, SigHandler::SigIgn).context("ignoring SIGPIPE")?;
            signal(Signal::SIGHUP, SigHandler::SigIgn).context("ignoring SIGHUP")?;
        }

        info!("signal handlers installed");
        Ok(SignalWatcher { rx, _tx: tx, child_exited, rebind, terminate })
    }

    /// The read end of the self-pipe, for the poll set.
    pub fn poll_fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }

    /// Swallow any wakeup bytes and collect the pending flags.
    pub fn drain(&mut self) -> Pending {
        let mut buf = [0u8; 64];
        loop {
            match self.rx.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }

        Pending {
            child_exited: self.child_exited.swap(false, Ordering::Relaxed),
            rebind: self.rebind.swap(false, Ordering::Relaxed),
            terminate: self.terminate.swap(false, Ordering::Relaxed),
        }
    }
}
