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

//! Liveness probing of session sockets, and the permission-bit
//! encoding of session state on the socket file.
//!
//! The socket file's mode bits double as metadata so that `list` can
//! classify a session with a single stat: user-execute means at least
//! one client is connected, group-execute means the child terminated
//! and the session is lingering with an undelivered exit status.

use std::{
    fs,
    io,
    os::unix::{fs::PermissionsExt, net::UnixStream},
    path::Path,
};

use nix::sys::stat::stat;
use tracing::debug;

use abduco_protocol::Packet;

use crate::consts;

/// Connect to a session socket. A connection refused against a
/// leftover socket file means the server died without cleaning up, so
/// the stale file is unlinked on the way out.
pub fn connect(path: &Path) -> io::Result<UnixStream> {
    match UnixStream::connect(path) {
        Ok(stream) => Ok(stream),
        Err(e) => {
            if e.kind() == io::ErrorKind::ConnectionRefused && is_socket_file(path) {
                debug!("unlinking stale session socket {:?}", path);
                let _ = fs::remove_file(path);
            }
            Err(e)
        }
    }
}

/// Establish whether a session exists and what its server pid is, by
/// connecting and reading the PID greeting.
pub fn session_pid(path: &Path) -> Option<u64> {
    let mut stream = connect(path).ok()?;
    stream.set_read_timeout(Some(consts::PROBE_TIMEOUT)).ok()?;
    match Packet::read_from(&mut stream) {
        Ok(Some(Packet::Pid(pid))) => Some(pid),
        _ => None,
    }
}

/// A session is alive-and-running iff it answers the probe and its
/// child has not terminated (group-execute clear).
pub fn alive(path: &Path) -> bool {
    if session_pid(path).is_none() {
        return false;
    }
    match stat(path) {
        Ok(st) => {
            st.st_mode & libc::S_IFMT == libc::S_IFSOCK && st.st_mode & libc::S_IXGRP == 0
        }
        Err(_) => false,
    }
}

fn is_socket_file(path: &Path) -> bool {
    matches!(stat(path), Ok(st) if st.st_mode & libc::S_IFMT == libc::S_IFSOCK)
}

/// Set or clear the user-execute bit: "a client is connected".
pub fn mark_attached(path: &Path, attached: bool) {
    set_mode_bit(path, libc::S_IXUSR, attached);
}

/// Set the group-execute bit: "the child has terminated".
pub fn mark_terminated(path: &Path) {
    set_mode_bit(path, libc::S_IXGRP, true);
}

fn set_mode_bit(path: &Path, bit: libc::mode_t, on: bool) {
    let st = match stat(path) {
        Ok(st) => st,
        Err(_) => return,
    };
    let mode = if on { st.st_mode | bit } else { st.st_mode & !bit };
    let perms = fs::Permissions::from_mode(mode & 0o7777);
    if let Err(e) = fs::set_permissions(path, perms) {
        debug!("updating mode bits on {:?}: {}", path, e);
    }
}
