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

//! The client side of an attach: forward stdin to the session,
//! render session output, and watch for the detach hotkey.

use std::{
    io::{self, Read, Write},
    os::unix::io::AsFd,
    os::unix::net::UnixStream,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Context;
use nix::{
    errno::Errno,
    poll::{ppoll, PollFd, PollFlags},
    sys::signal::{sigprocmask, SigHandler, SigSet, SigmaskHow, Signal},
};
use signal_hook::{consts as sigs, flag};
use tracing::{debug, info, instrument};

use abduco_protocol::{AttachFlags, Packet, PAYLOAD_MAX};

use crate::tty;

/// How an attach ended, as seen by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The user detached (hotkey or stdin EOF); the session lives on.
    Detached,
    /// The child terminated and the server delivered its exit status.
    Exit(i32),
    /// The connection to the server died under us.
    IoError,
}

pub struct AttachOpts {
    pub flags: AttachFlags,
    /// Forward stdin but never touch the terminal or render output.
    pub passthrough: bool,
    pub detach_key: u8,
    pub redraw_key: Option<u8>,
    pub alternate_screen: bool,
}

/// What a chunk of freshly read stdin means.
#[derive(Debug, PartialEq, Eq)]
enum InputAction {
    Detach,
    Redraw,
    Forward,
}

/// Hotkeys act on the first byte of a read, the way the line
/// discipline delivers single keystrokes in raw mode.
fn classify_input(buf: &[u8], detach_key: u8, redraw_key: Option<u8>) -> InputAction {
    match buf.first() {
        Some(&b) if b == detach_key => InputAction::Detach,
        Some(&b) if Some(b) == redraw_key => InputAction::Redraw,
        _ => InputAction::Forward,
    }
}

/// Drive an attached session over an established connection until it
/// detaches, the child exits, or the connection fails. Restores the
/// terminal on every path out.
#[instrument(skip_all)]
pub fn run(mut stream: UnixStream, opts: &AttachOpts) -> anyhow::Result<Outcome> {
    stream.set_nonblocking(true).context("marking session stream nonblocking")?;

    // SIGWINCH stays blocked except while parked in ppoll, so a
    // resize can never race the loop body.
    let need_resize = Arc::new(AtomicBool::new(true));
    flag::register(sigs::SIGWINCH, Arc::clone(&need_resize))
        .context("registering SIGWINCH flag")?;
    let mut winch = SigSet::empty();
    winch.add(Signal::SIGWINCH);
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&winch), None).context("blocking SIGWINCH")?;
    // a dying server must surface as a failed write, not a signal
    unsafe {
        nix::sys::signal::signal(Signal::SIGPIPE, SigHandler::SigIgn)
            .context("ignoring SIGPIPE")?;
    }

    let _tty_guard = if opts.passthrough {
        None
    } else {
        Some(tty::set_attach_flags(opts.alternate_screen).context("entering raw mode")?)
    };

    Packet::Attach(opts.flags).write_to(&mut stream).context("announcing attach")?;
    info!("attached, flags {:?}", opts.flags);

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut buf = vec![0u8; PAYLOAD_MAX];

    loop {
        if need_resize.load(Ordering::Relaxed) {
            // when stdin is not a terminal there is no size to
            // announce and the flag just stays set
            if let Ok(size) = tty::Size::from_fd(libc::STDIN_FILENO) {
                if Packet::Resize(Some(size.into())).write_to(&mut stream).is_err() {
                    return Ok(Outcome::IoError);
                }
                need_resize.store(false, Ordering::Relaxed);
            }
        }

        let (stdin_ready, sock_ready) = {
            let mut fds = [
                PollFd::new(stdin.as_fd(), PollFlags::POLLIN),
                PollFd::new(stream.as_fd(), PollFlags::POLLIN),
            ];
            match ppoll(&mut fds, None, Some(SigSet::empty())) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).context("waiting for terminal io"),
            }
            let ready = |fd: &PollFd| {
                fd.revents()
                    .map(|r| {
                        r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                    })
                    .unwrap_or(false)
            };
            (ready(&fds[0]), ready(&fds[1]))
        };

        if sock_ready {
            match Packet::read_from(&mut stream) {
                Ok(None) => {}
                Ok(Some(Packet::Content(payload))) => {
                    if !opts.passthrough && !payload.is_empty() {
                        stdout.write_all(&payload).context("writing to stdout")?;
                        let _ = stdout.flush();
                    }
                }
                Ok(Some(Packet::Resize(_))) => {
                    // we just became the primary client; re-announce
                    need_resize.store(true, Ordering::Relaxed);
                }
                Ok(Some(Packet::Exit(status))) => {
                    // acknowledge delivery so the server can wind down
                    let _ = Packet::Exit(status).write_to(&mut stream);
                    return Ok(Outcome::Exit(status));
                }
                Ok(Some(_)) => {} // the PID greeting, or newer kinds
                Err(e) => {
                    debug!("session stream failed: {}", e);
                    return Ok(Outcome::IoError);
                }
            }
        }

        if stdin_ready {
            let n = match stdin.lock().read(&mut buf) {
                Ok(n) => n,
                Err(e)
                    if e.kind() == io::ErrorKind::Interrupted
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    continue;
                }
                Err(e) => return Err(e).context("reading stdin"),
            };
            if n == 0 {
                let _ = Packet::Detach.write_to(&mut stream);
                return Ok(Outcome::Detached);
            }
            match classify_input(&buf[..n], opts.detach_key, opts.redraw_key) {
                InputAction::Detach => {
                    let _ = Packet::Detach.write_to(&mut stream);
                    return Ok(Outcome::Detached);
                }
                InputAction::Redraw => {
                    need_resize.store(true, Ordering::Relaxed);
                }
                InputAction::Forward => {
                    if !opts.flags.read_only
                        && Packet::Content(buf[..n].to_vec()).write_to(&mut stream).is_err()
                    {
                        return Ok(Outcome::IoError);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hotkeys_act_on_the_first_byte() {
        let detach = 0x1c;
        let redraw = Some(b'\x0c');

        assert_eq!(classify_input(&[0x1c], detach, redraw), InputAction::Detach);
        assert_eq!(classify_input(&[0x1c, b'x'], detach, redraw), InputAction::Detach);
        assert_eq!(classify_input(&[0x0c], detach, redraw), InputAction::Redraw);
        assert_eq!(classify_input(&[b'x', 0x1c], detach, redraw), InputAction::Forward);
        assert_eq!(classify_input(b"hello", detach, redraw), InputAction::Forward);
    }

    #[test]
    fn no_redraw_key_means_no_redraw() {
        assert_eq!(classify_input(&[0x0c], 0x1c, None), InputAction::Forward);
    }
}
