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

use std::{
    io::{self, Write},
    os::unix::io::RawFd,
};

use anyhow::Context;
use nix::sys::{
    termios,
    termios::{ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg},
};
use tracing::error;

use abduco_protocol::WinSize;

// see `man ioctl_tty` for info on these ioctl commands
nix::ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, libc::winsize);
nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, libc::winsize);

const ENTER_ALTERNATE_SCREEN: &str = "\x1b[?1049h";
const LEAVE_ALTERNATE_SCREEN: &str = "\x1b[?1049l";
const SHOW_CURSOR: &str = "\x1b[?25h";

#[derive(Debug, Default, Clone, Copy)]
pub struct Size {
    pub rows: u16,
    pub cols: u16,
}

impl Size {
    /// from_fd returns the terminal size for the given terminal.
    pub fn from_fd(fd: RawFd) -> anyhow::Result<Size> {
        let mut term_size = libc::winsize { ws_row: 0, ws_col: 0, ws_xpixel: 0, ws_ypixel: 0 };

        // Saftey: term_size is stack allocated and live for the whole
        //         call.
        unsafe {
            tiocgwinsz(fd, &mut term_size).context("fetching term size")?;
        }

        Ok(Size { rows: term_size.ws_row, cols: term_size.ws_col })
    }

    /// set_fd sets the tty indicated by the given file descriptor
    /// to have this size.
    pub fn set_fd(&self, fd: RawFd) -> anyhow::Result<()> {
        let term_size =
            libc::winsize { ws_row: self.rows, ws_col: self.cols, ws_xpixel: 0, ws_ypixel: 0 };

        unsafe {
            tiocswinsz(fd, &term_size).context("setting term size")?;
        }

        Ok(())
    }
}

impl From<WinSize> for Size {
    fn from(ws: WinSize) -> Size {
        Size { rows: ws.rows, cols: ws.cols }
    }
}

impl From<Size> for WinSize {
    fn from(size: Size) -> WinSize {
        WinSize { rows: size.rows, cols: size.cols }
    }
}

pub fn stdin_is_tty() -> bool {
    // Saftey: pure ffi on a constant fd.
    unsafe { libc::isatty(libc::STDIN_FILENO) == 1 }
}

/// Snapshot the terminal attributes of stdin, if it is a terminal.
/// The snapshot seeds the termios of a freshly created session pty.
pub fn snapshot() -> Option<termios::Termios> {
    if !stdin_is_tty() {
        return None;
    }
    termios::tcgetattr(io::stdin()).ok()
}

/// Put the stdin terminal into raw mode (and optionally onto the
/// alternate screen) for the duration of an attach. The returned
/// guard undoes everything on drop, so every exit path of the client
/// leaves the terminal the way it found it.
pub fn set_attach_flags(alternate_screen: bool) -> anyhow::Result<AttachFlagsGuard> {
    if !stdin_is_tty() {
        // We are not attached to a terminal, so don't futz with its flags.
        return Ok(AttachFlagsGuard { old: None, alternate_screen: false });
    }

    // grab settings from the stdin terminal
    let old = termios::tcgetattr(io::stdin()).context("grabbing term flags")?;

    // Set the input terminal to raw mode so we immediately get the
    // input chars. The terminal behind the session pty is the one
    // that will apply all the logic.
    let mut new = old.clone();
    new.input_flags &= !(InputFlags::IGNBRK
        | InputFlags::BRKINT
        | InputFlags::PARMRK
        | InputFlags::ISTRIP
        | InputFlags::INLCR
        | InputFlags::IGNCR
        | InputFlags::ICRNL
        | InputFlags::IXON);
    new.output_flags &= !OutputFlags::OPOST;
    new.local_flags &= !(LocalFlags::ECHO
        | LocalFlags::ECHONL
        | LocalFlags::ICANON
        | LocalFlags::ISIG
        | LocalFlags::IEXTEN);
    new.control_flags &= !(ControlFlags::CSIZE | ControlFlags::PARENB);
    new.control_flags |= ControlFlags::CS8;
    termios::tcsetattr(io::stdin(), SetArg::TCSANOW, &new)?;

    if alternate_screen {
        let mut stdout = io::stdout();
        let _ = stdout.write_all(ENTER_ALTERNATE_SCREEN.as_bytes());
        let _ = stdout.flush();
    }

    Ok(AttachFlagsGuard { old: Some(old), alternate_screen })
}

pub struct AttachFlagsGuard {
    old: Option<termios::Termios>,
    alternate_screen: bool,
}

impl std::ops::Drop for AttachFlagsGuard {
    fn drop(&mut self) {
        if let Some(old) = &self.old {
            // TCSADRAIN so any final output makes it out before the
            // flags flip back.
            if let Err(e) = termios::tcsetattr(io::stdin(), SetArg::TCSADRAIN, old) {
                error!("error restoring terminal settings: {:?}", e);
            }

            let mut stdout = io::stdout();
            if self.alternate_screen {
                let _ = stdout.write_all(LEAVE_ALTERNATE_SCREEN.as_bytes());
            }
            // the child may have left the cursor hidden
            let _ = stdout.write_all(SHOW_CURSOR.as_bytes());
            let _ = stdout.flush();
        }
    }
}
