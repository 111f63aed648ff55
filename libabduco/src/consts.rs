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

use std::time;

/// The program name. Used for the session directory
/// (`<base>/[.]abduco/`) and for probe socket names, independent of
/// how the binary was invoked.
pub const PROG_NAME: &str = "abduco";

/// Read timeout while waiting for the PID greeting of a session we
/// are only probing for liveness.
pub const PROBE_TIMEOUT: time::Duration = time::Duration::from_millis(200);

/// Window geometry to fall back on when stdin is not a terminal.
pub const DEFAULT_ROWS: u16 = 25;
pub const DEFAULT_COLS: u16 = 80;

/// `sun_path` is 108 bytes on Linux; leave room for the trailing NUL
/// and a little slack, the way the kernel headers suggest.
pub const SUN_PATH_MAX: usize = 104;

/// Lines of pty output the server keeps for replay to late attachers
/// when the config does not say otherwise.
pub const DEFAULT_SCROLLBACK_LINES: usize = 25;

/// The default detach hotkey, CTRL-\.
pub const DEFAULT_DETACH_KEY: u8 = 0x1c;

pub const ENV_SOCKET_DIR: &str = "ABDUCO_SOCKET_DIR";
pub const ENV_DEFAULT_CMD: &str = "ABDUCO_CMD";
pub const ENV_SESSION: &str = "ABDUCO_SESSION";
pub const ENV_SOCKET: &str = "ABDUCO_SOCKET";
