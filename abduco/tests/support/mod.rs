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

//! Helpers for driving a real abduco binary against a hermetic,
//! tempdir-backed session directory, plus a raw wire-protocol client
//! for poking the session server directly.

#![allow(dead_code)]

use std::{
    fs,
    os::unix::fs::MetadataExt,
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::{Duration, Instant},
};

use anyhow::{bail, Context};
use tempfile::TempDir;

use abduco_protocol::{AttachFlags, Packet, WinSize};

/// How long tests wait for asynchronous server behavior.
pub const WAIT: Duration = Duration::from_secs(10);
const TICK: Duration = Duration::from_millis(20);

pub fn abduco_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_abduco"))
}

/// A hermetic session directory. Every spawned binary gets
/// ABDUCO_SOCKET_DIR pointed here, so sessions never leak into the
/// developer's real session directory.
pub struct SessionDir {
    tmp: TempDir,
}

impl SessionDir {
    pub fn new() -> anyhow::Result<SessionDir> {
        let tmp = tempfile::Builder::new()
            .prefix("abduco-test")
            .tempdir()
            .context("creating tmp dir")?;
        Ok(SessionDir { tmp })
    }

    pub fn command(&self) -> Command {
        let mut cmd = Command::new(abduco_bin());
        cmd.env("ABDUCO_SOCKET_DIR", self.tmp.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// `abduco -n <name> <argv...>`: create a detached session and
    /// wait until its socket is dialable.
    pub fn spawn_session(&self, name: &str, argv: &[&str]) -> anyhow::Result<Session> {
        let out = self
            .command()
            .arg("-n")
            .arg(name)
            .args(argv)
            .output()
            .context("running abduco -n")?;
        if !out.status.success() {
            bail!("session creation failed: {}", String::from_utf8_lossy(&out.stderr));
        }

        let sock = self.wait_for_socket(name)?;
        // learn the server pid up front so the session gets cleaned
        // up even when an assertion fails mid-test
        let server_pid = WireClient::connect(&sock).ok().map(|c| c.server_pid);
        Ok(Session { sock, server_pid })
    }

    pub fn find_socket(&self, name: &str) -> Option<PathBuf> {
        scan(self.tmp.path(), &format!("{name}@"))
    }

    pub fn wait_for_socket(&self, name: &str) -> anyhow::Result<PathBuf> {
        let deadline = Instant::now() + WAIT;
        loop {
            if let Some(path) = self.find_socket(name) {
                if UnixStream::connect(&path).is_ok() {
                    return Ok(path);
                }
            }
            if Instant::now() > deadline {
                bail!("session socket for '{}' never came up", name);
            }
            std::thread::sleep(TICK);
        }
    }

    /// Run `abduco` with no arguments and capture the session listing.
    pub fn list_output(&self) -> anyhow::Result<String> {
        let out = self.command().output().context("running abduco list")?;
        if !out.status.success() {
            bail!("list failed: {}", String::from_utf8_lossy(&out.stderr));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

fn scan(dir: &Path, prefix: &str) -> Option<PathBuf> {
    for entry in fs::read_dir(dir).ok()?.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = scan(&path, prefix) {
                return Some(found);
            }
        } else if entry.file_name().to_string_lossy().starts_with(prefix) {
            return Some(path);
        }
    }
    None
}

/// A running (or lingering) session. Kills the server on drop so a
/// failed assertion can't leak processes.
pub struct Session {
    pub sock: PathBuf,
    server_pid: Option<u64>,
}

impl Session {
    pub fn server_pid(&self) -> Option<u64> {
        self.server_pid
    }

    pub fn signal_server(&self, sig: libc::c_int) {
        if let Some(pid) = self.server_pid {
            // Saftey: pure ffi.
            unsafe {
                libc::kill(pid as libc::pid_t, sig);
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.signal_server(libc::SIGKILL);
    }
}

pub fn mode_of(path: &Path) -> u32 {
    fs::metadata(path).map(|m| m.mode()).unwrap_or(0)
}

pub const S_IXUSR: u32 = 0o100;
pub const S_IXGRP: u32 = 0o010;

/// Spin until the condition holds, failing the test if it never does.
pub fn wait_until<F: FnMut() -> bool>(what: &str, mut cond: F) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() <= deadline, "timed out waiting for {what}");
        std::thread::sleep(TICK);
    }
}

/// A raw protocol client, attached straight to the session socket.
pub struct WireClient {
    stream: UnixStream,
    pub server_pid: u64,
}

impl WireClient {
    /// Dial the socket and consume the PID greeting.
    pub fn connect(sock: &Path) -> anyhow::Result<WireClient> {
        let mut stream = UnixStream::connect(sock).context("dialing session socket")?;
        stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .context("setting read timeout")?;

        let deadline = Instant::now() + WAIT;
        loop {
            match Packet::read_from(&mut stream) {
                Ok(Some(Packet::Pid(pid))) => return Ok(WireClient { stream, server_pid: pid }),
                Ok(Some(_)) => continue,
                Ok(None) => {
                    if Instant::now() > deadline {
                        bail!("server never sent its greeting");
                    }
                }
                Err(e) => return Err(e).context("reading greeting"),
            }
        }
    }

    pub fn attach(&mut self) -> anyhow::Result<()> {
        self.attach_with(AttachFlags::default())
    }

    pub fn attach_with(&mut self, flags: AttachFlags) -> anyhow::Result<()> {
        Packet::Attach(flags).write_to(&mut self.stream).context("sending attach")
    }

    pub fn resize(&mut self, rows: u16, cols: u16) -> anyhow::Result<()> {
        Packet::Resize(Some(WinSize { rows, cols }))
            .write_to(&mut self.stream)
            .context("sending resize")
    }

    pub fn send(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        Packet::Content(bytes.to_vec()).write_to(&mut self.stream).context("sending content")
    }

    pub fn detach(&mut self) -> anyhow::Result<()> {
        Packet::Detach.write_to(&mut self.stream).context("sending detach")
    }

    /// Accumulate CONTENT payloads until the collected output
    /// contains `needle`.
    pub fn read_output_until(&mut self, needle: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut collected = Vec::new();
        let deadline = Instant::now() + WAIT;
        loop {
            if collected.windows(needle.len().max(1)).any(|w| w == needle) {
                return Ok(collected);
            }
            if Instant::now() > deadline {
                bail!(
                    "timed out waiting for output {:?}, saw {:?}",
                    String::from_utf8_lossy(needle),
                    String::from_utf8_lossy(&collected)
                );
            }
            match Packet::read_from(&mut self.stream) {
                Ok(Some(Packet::Content(payload))) => collected.extend_from_slice(&payload),
                Ok(Some(_)) | Ok(None) => {}
                Err(e) => return Err(e).context("reading session output"),
            }
        }
    }

    /// Assert that no CONTENT containing `needle` shows up for the
    /// given duration.
    pub fn assert_no_output_containing(&mut self, needle: &[u8], dur: Duration) {
        let mut collected: Vec<u8> = Vec::new();
        let deadline = Instant::now() + dur;
        while Instant::now() < deadline {
            if let Ok(Some(Packet::Content(payload))) = Packet::read_from(&mut self.stream) {
                collected.extend_from_slice(&payload);
            }
            assert!(
                !collected.windows(needle.len().max(1)).any(|w| w == needle),
                "unexpected output {:?} showed up",
                String::from_utf8_lossy(needle)
            );
        }
    }

    /// Read until the server announces the child's exit status, then
    /// acknowledge it the way a real client does.
    pub fn wait_exit(&mut self) -> anyhow::Result<i32> {
        let deadline = Instant::now() + WAIT;
        loop {
            if Instant::now() > deadline {
                bail!("timed out waiting for the exit status");
            }
            match Packet::read_from(&mut self.stream) {
                Ok(Some(Packet::Exit(status))) => {
                    let _ = Packet::Exit(status).write_to(&mut self.stream);
                    return Ok(status);
                }
                Ok(Some(_)) | Ok(None) => {}
                Err(e) => return Err(e).context("waiting for exit status"),
            }
        }
    }

    /// Wait for the empty RESIZE with which the server asks a newly
    /// promoted primary client to re-announce its window size.
    pub fn wait_resize_request(&mut self) -> anyhow::Result<()> {
        let deadline = Instant::now() + WAIT;
        loop {
            if Instant::now() > deadline {
                bail!("timed out waiting for a resize request");
            }
            match Packet::read_from(&mut self.stream) {
                Ok(Some(Packet::Resize(None))) => return Ok(()),
                Ok(Some(_)) | Ok(None) => {}
                Err(e) => return Err(e).context("waiting for resize request"),
            }
        }
    }

    /// Wait for the server to close the connection.
    pub fn wait_closed(&mut self) -> anyhow::Result<()> {
        let deadline = Instant::now() + WAIT;
        loop {
            if Instant::now() > deadline {
                bail!("timed out waiting for the server to hang up");
            }
            match Packet::read_from(&mut self.stream) {
                Ok(_) => {}
                Err(_) => return Ok(()),
            }
        }
    }
}
