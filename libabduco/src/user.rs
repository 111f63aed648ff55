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

use anyhow::{anyhow, Context};
use nix::unistd::{getuid, User};

#[derive(Debug)]
pub struct Info {
    pub user: String,
    pub home_dir: String,
}

pub fn info() -> anyhow::Result<Info> {
    let uid = getuid();
    let user = User::from_uid(uid)
        .context("resolving user info")?
        .ok_or_else(|| anyhow!("no passwd entry for uid {}", uid))?;

    Ok(Info { user: user.name, home_dir: user.dir.to_string_lossy().into_owned() })
}
