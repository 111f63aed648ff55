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

//! The rendezvous layer: where session socket files live and how a
//! user supplied session name maps to a socket path.

use std::{
    env, fs,
    os::unix::net::UnixListener,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context};
use nix::{
    sys::stat::{lstat, umask, Mode},
    unistd::{gethostname, getpid, mkdir},
};
use tracing::{debug, instrument};

use crate::{consts, user};

struct Candidate {
    env: Option<&'static str>,
    fixed: Option<&'static str>,
    /// Personal directories live under data the user already owns, so
    /// they get a dot-prefixed directory and no per-user subdirectory.
    personal: bool,
}

/// Where to place the directory holding session socket files. The
/// first candidate to pass every check is used.
const CANDIDATES: &[Candidate] = &[
    Candidate { env: Some(consts::ENV_SOCKET_DIR), fixed: None, personal: false },
    Candidate { env: Some("XDG_RUNTIME_DIR"), fixed: None, personal: false },
    Candidate { env: Some("XDG_CACHE_HOME"), fixed: None, personal: true },
    Candidate { env: Some("HOME"), fixed: None, personal: true },
    Candidate { env: Some("TMPDIR"), fixed: None, personal: false },
    Candidate { env: None, fixed: Some("/tmp"), personal: false },
];

/// The `@<hostname>` suffix appended to session names so that session
/// directories can be shared across hosts over NFS.
pub fn hostname_suffix() -> String {
    match gethostname() {
        Ok(host) => format!("@{}", host.to_string_lossy()),
        Err(_) => String::from("@localhost"),
    }
}

/// A resolved session socket.
#[derive(Debug, Clone)]
pub struct SessionPath {
    pub path: PathBuf,
    /// The name reported to the user and exported to the child, with
    /// any directory and host components stripped.
    pub session_name: String,
}

/// Map a user supplied name to a socket path. Absolute names and
/// names starting with `./` or `../` are used as filesystem paths;
/// anything else lands in the per-user session directory with the
/// hostname appended.
pub fn resolve(name: &str, host: &str) -> anyhow::Result<SessionPath> {
    let (path, session_name) = if name.starts_with('/') {
        (PathBuf::from(name), basename(name))
    } else if name.starts_with("./") || name.starts_with("../") {
        let cwd = env::current_dir().context("resolving working directory")?;
        (cwd.join(name), basename(name))
    } else {
        (socket_dir()?.join(format!("{name}{host}")), String::from(name))
    };

    if path.as_os_str().len() >= consts::SUN_PATH_MAX {
        bail!("socket path '{}' is too long for a unix socket", path.display());
    }

    Ok(SessionPath { path, session_name })
}

fn basename(name: &str) -> String {
    name.rsplit('/').find(|part| !part.is_empty()).unwrap_or(name).to_string()
}

/// Locate (creating it if needed) the per-user session directory.
///
/// Candidates are probed in order; a candidate is only accepted if the
/// final directory is a real directory (not a symlink), is owned by
/// the current user with no group or other access, and a throwaway
/// socket can actually be bound inside it.
#[instrument]
pub fn socket_dir() -> anyhow::Result<PathBuf> {
    let user_info = user::info().ok();

    for candidate in CANDIDATES {
        let base = match candidate_base(candidate, user_info.as_ref()) {
            Some(b) => b,
            None => continue,
        };

        let mut dir = PathBuf::from(base);
        dir.push(format!(
            "{}{}",
            if candidate.personal { "." } else { "" },
            consts::PROG_NAME
        ));

        // A shared base gets a world writable sticky directory, like
        // /tmp itself; the per-user subdirectory below provides the
        // actual isolation.
        let mode = if candidate.personal {
            Mode::S_IRWXU
        } else {
            Mode::S_IRWXU | Mode::S_IRWXG | Mode::S_IRWXO | Mode::S_ISVTX
        };
        if !make_dir(&dir, mode) {
            continue;
        }

        if !candidate.personal {
            match user_info.as_ref() {
                Some(info) => dir.push(&info.user),
                None => dir.push(format!("{}", nix::unistd::getuid())),
            }
            if !make_dir(&dir, Mode::S_IRWXU) {
                continue;
            }
        }

        if !dir_is_private(&dir) {
            debug!("skipping session dir candidate {:?}: bad ownership or mode", dir);
            continue;
        }

        if !bind_probe(&dir) {
            debug!("skipping session dir candidate {:?}: bind probe failed", dir);
            continue;
        }

        return Ok(dir);
    }

    Err(anyhow!("no usable session directory, tried ABDUCO_SOCKET_DIR, XDG_RUNTIME_DIR, XDG_CACHE_HOME, HOME, TMPDIR and /tmp"))
}

fn candidate_base(candidate: &Candidate, user_info: Option<&user::Info>) -> Option<String> {
    if let Some(var) = candidate.env {
        let mut val = env::var(var).ok().filter(|v| !v.is_empty());
        if val.is_none() && var == "HOME" {
            // fall back on the passwd entry when HOME is unset
            val = user_info.map(|info| info.home_dir.clone());
        }
        return val;
    }
    candidate.fixed.map(String::from)
}

fn make_dir(dir: &Path, mode: Mode) -> bool {
    let prev_umask = umask(Mode::empty());
    let res = mkdir(dir, mode);
    umask(prev_umask);
    match res {
        Ok(()) => true,
        Err(nix::errno::Errno::EEXIST) => true,
        Err(_) => false,
    }
}

/// lstat based so a symlink planted at the expected path is rejected
/// rather than followed.
fn dir_is_private(dir: &Path) -> bool {
    let st = match lstat(dir) {
        Ok(st) => st,
        Err(_) => return false,
    };
    if st.st_mode & libc::S_IFMT != libc::S_IFDIR {
        return false;
    }
    if st.st_uid != nix::unistd::getuid().as_raw() {
        return false;
    }
    st.st_mode & (libc::S_IRWXG | libc::S_IRWXO) == 0
}

/// The authoritative writability check: bind a throwaway socket in
/// the directory and unlink it again.
fn bind_probe(dir: &Path) -> bool {
    let probe = dir.join(format!(".{}-{}", consts::PROG_NAME, getpid()));
    match UnixListener::bind(&probe) {
        Ok(listener) => {
            drop(listener);
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn absolute_and_relative_names_are_paths() {
        let host = "@testhost";

        let sp = resolve("/tmp/some-session-sock", host).expect("absolute name to resolve");
        assert_eq!(sp.path, PathBuf::from("/tmp/some-session-sock"));
        assert_eq!(sp.session_name, "some-session-sock");

        let sp = resolve("./sock", host).expect("relative name to resolve");
        assert!(sp.path.is_absolute());
        assert!(sp.path.ends_with("./sock") || sp.path.ends_with("sock"));
        assert_eq!(sp.session_name, "sock");
    }

    #[test]
    fn over_long_names_are_rejected() {
        let long = format!("/{}", "x".repeat(200));
        assert!(resolve(&long, "@h").is_err());
    }

    // one test so the env var mutation can't race a parallel test
    #[test]
    fn plain_names_land_in_a_private_session_dir() {
        let dir = tempfile::tempdir().expect("tmp dir");
        // the first candidate wins when ABDUCO_SOCKET_DIR points
        // somewhere usable, so everything must land under it
        std::env::set_var(consts::ENV_SOCKET_DIR, dir.path());

        let got = socket_dir().expect("socket dir to resolve");
        assert!(got.starts_with(dir.path()));
        let st = lstat(&got).expect("stat on fresh session dir");
        assert_eq!(st.st_mode & (libc::S_IRWXG | libc::S_IRWXO), 0);

        let sp = resolve("work", "@testhost").expect("plain name to resolve");
        assert!(sp.path.starts_with(dir.path()));
        assert!(sp.path.to_string_lossy().ends_with("work@testhost"));
        assert_eq!(sp.session_name, "work");

        std::env::remove_var(consts::ENV_SOCKET_DIR);
    }
}
