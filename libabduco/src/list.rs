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

//! The `abduco` invocation with no arguments: list the sessions in
//! the session directory. Session state comes straight out of the
//! socket file mode bits, so the whole listing is a directory scan
//! plus one liveness probe per local session.

use std::fs;

use anyhow::Context;
use chrono::{DateTime, Local};
use nix::sys::stat::stat;

use crate::{probe, session_dir};

struct Row {
    mtime: i64,
    status: char,
    pid: u64,
    name: String,
}

pub fn run(host: &str) -> anyhow::Result<()> {
    let dir = session_dir::socket_dir()?;

    let mut rows: Vec<Row> = Vec::new();
    for entry in fs::read_dir(&dir).context("scanning session directory")? {
        let entry = entry.context("scanning session directory")?;
        let fname = entry.file_name().to_string_lossy().into_owned();
        if !fname.contains(host) {
            continue;
        }

        let path = entry.path();
        let st = match stat(&path) {
            Ok(st) => st,
            Err(_) => continue,
        };
        if st.st_mode & libc::S_IFMT != libc::S_IFSOCK {
            continue;
        }

        let mut name = fname.clone();
        let mut pid = 0;
        if let Some(local_name) = fname.strip_suffix(host) {
            // a dead local session is silently dropped; the probe
            // already unlinked its stale socket
            match probe::session_pid(&path) {
                Some(p) => pid = p,
                None => continue,
            }
            name = String::from(local_name);
        }

        let status = if st.st_mode & libc::S_IXUSR != 0 {
            '*'
        } else if st.st_mode & libc::S_IXGRP != 0 {
            '+'
        } else {
            ' '
        };

        rows.push(Row { mtime: st.st_mtime, status, pid, name });
    }

    rows.sort_by_key(|row| row.mtime);

    println!("Active sessions (on host {})", &host[1..]);
    for row in rows {
        let when = DateTime::from_timestamp(row.mtime, 0)
            .map(|utc| utc.with_timezone(&Local).format("%a\t%F %T").to_string())
            .unwrap_or_default();
        println!("{} {}\t{}\t{}", row.status, when, row.pid, row.name);
    }

    Ok(())
}
