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

use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use serde_derive::Deserialize;
use tracing::{info, instrument};

use crate::{consts, user};

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml (1)")?;
        config = toml::from_str(&config_str).context("parsing config file (1)")?;
    } else {
        let user_info = user::info()?;
        let mut config_path = PathBuf::from(user_info.home_dir);
        config_path.push(".config");
        config_path.push(consts::PROG_NAME);
        config_path.push("config.toml");
        if config_path.exists() {
            let config_str = fs::read_to_string(config_path).context("reading config toml (2)")?;
            config = toml::from_str(&config_str).context("parsing config file (2)")?;
        }
    }

    Ok(config)
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// The hotkey that detaches the client, either a literal
    /// character or caret notation such as "^\\". Overridden by the
    /// `-e` flag. Defaults to CTRL-\.
    pub detach_key: Option<String>,

    /// An optional hotkey that makes the client re-announce its
    /// window size to force a redraw. Off by default.
    pub redraw_key: Option<String>,

    /// The command to run when none is given on the command line and
    /// ABDUCO_CMD is unset. Defaults to /bin/sh.
    pub default_cmd: Option<String>,

    /// Switch the client terminal to the alternate screen while
    /// attached. Off by default.
    pub alternate_screen: Option<bool>,

    /// How many lines of output the session server keeps in memory
    /// and replays to a freshly attached client. 0 disables replay.
    pub scrollback_lines: Option<usize>,

    /// Suppress informational messages, as if -q were always given.
    pub quiet: Option<bool>,
}

impl Config {
    pub fn detach_key(&self) -> anyhow::Result<u8> {
        match &self.detach_key {
            Some(s) => parse_key(s),
            None => Ok(consts::DEFAULT_DETACH_KEY),
        }
    }

    pub fn redraw_key(&self) -> anyhow::Result<Option<u8>> {
        self.redraw_key.as_deref().map(parse_key).transpose()
    }

    pub fn scrollback_lines(&self) -> usize {
        self.scrollback_lines.unwrap_or(consts::DEFAULT_SCROLLBACK_LINES)
    }
}

/// Parse a hotkey spec: either a single literal byte or caret
/// notation ("^x" means CTRL-x).
pub fn parse_key(spec: &str) -> anyhow::Result<u8> {
    let bytes = spec.as_bytes();
    match bytes {
        [] => Err(anyhow!("empty key spec")),
        [b'^', c, ..] => Ok(c & 0x1f),
        [c, ..] => Ok(*c),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_key_specs() {
        assert_eq!(parse_key("^\\").unwrap(), 0x1c);
        assert_eq!(parse_key("^a").unwrap(), 0x01);
        assert_eq!(parse_key("^A").unwrap(), 0x01);
        assert_eq!(parse_key("q").unwrap(), b'q');
        assert!(parse_key("").is_err());
    }

    #[test]
    fn parse_toml() {
        let config: Config = toml::from_str(
            r#"
            detach_key = "^d"
            scrollback_lines = 100
            alternate_screen = true
            "#,
        )
        .expect("config to parse");

        assert_eq!(config.detach_key().unwrap(), 0x04);
        assert_eq!(config.scrollback_lines(), 100);
        assert_eq!(config.alternate_screen, Some(true));
        assert_eq!(config.redraw_key().unwrap(), None);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").expect("empty config to parse");
        assert_eq!(config.detach_key().unwrap(), consts::DEFAULT_DETACH_KEY);
        assert_eq!(config.scrollback_lines(), consts::DEFAULT_SCROLLBACK_LINES);
    }
}
