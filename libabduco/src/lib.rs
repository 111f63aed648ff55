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

use std::{env, fs, io, path::Path, process, sync::Mutex, time};

use anyhow::{bail, Context};
use clap::Parser;
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

use abduco_protocol::{AttachFlags, Packet};

mod attach;
mod config;
mod consts;
mod daemon;
mod list;
mod probe;
mod session_dir;
mod tty;
mod user;

/// The command line arguments that abduco expects. Short flags follow
/// the traditional getopt interface; the long flags are extras that
/// only affect logging and configuration.
#[derive(Parser, Debug)]
#[clap(
    author,
    about = "keep terminal programs running in detachable sessions",
    override_usage = "abduco [-a|-A|-c|-n] [-p] [-r] [-q] [-l] [-f] [-e detachkey] name command..."
)]
pub struct Args {
    #[clap(short = 'a', group = "action", help = "Attach to an existing session")]
    pub attach: bool,

    #[clap(
        short = 'A',
        group = "action",
        help = "Attach to the session, creating it first if necessary"
    )]
    pub attach_or_create: bool,

    #[clap(short = 'c', group = "action", help = "Create a new session and attach to it")]
    pub create: bool,

    #[clap(short = 'n', group = "action", help = "Create a new session without attaching")]
    pub create_detached: bool,

    #[clap(
        short = 'e',
        value_name = "detachkey",
        help = "Set the detach key, either literally or in ^X notation"
    )]
    pub detach_key: Option<String>,

    #[clap(short = 'f', help = "When creating over a dead session, replace it")]
    pub force: bool,

    #[clap(short = 'l', help = "Attach with low priority, never driving the window size")]
    pub low_priority: bool,

    #[clap(short = 'p', help = "Pass-through mode: forward stdin, suppress output")]
    pub passthrough: bool,

    #[clap(short = 'q', help = "Suppress informational messages")]
    pub quiet: bool,

    #[clap(short = 'r', help = "Attach read-only, input is discarded")]
    pub read_only: bool,

    #[clap(short = 'v', help = "Print version")]
    pub version: bool,

    #[clap(
        long,
        action,
        long_help = "The file to write logs to

Logs are discarded by default; the session server writes there too,
since its stderr ends up on /dev/null."
    )]
    pub log_file: Option<String>,

    #[clap(
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times"
    )]
    pub verbose: u8,

    #[clap(long, action, help = "A toml file containing configuration")]
    pub config_file: Option<String>,

    #[clap(help = "The name of the session")]
    pub name: Option<String>,

    #[clap(
        trailing_var_arg = true,
        allow_hyphen_values = true,
        help = "The command to run inside the session"
    )]
    pub command: Vec<String>,
}

enum Action {
    Attach,
    AttachOrCreate,
    Create { detached: bool },
}

/// Run the abduco tool with the given arguments.
pub fn run(args: Args) -> anyhow::Result<()> {
    let trace_level = if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };
    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    }

    let res = dispatch(&args);
    if let Err(err) = res {
        error!("{:?}", err);
        eprintln!("{}: {:#}", consts::PROG_NAME, err);
        process::exit(1);
    }
    Ok(())
}

fn dispatch(args: &Args) -> anyhow::Result<()> {
    let config = config::read_config(&args.config_file)?;
    let host = session_dir::hostname_suffix();

    let mut action = if args.create {
        Some(Action::Create { detached: false })
    } else if args.create_detached {
        Some(Action::Create { detached: true })
    } else if args.attach {
        Some(Action::Attach)
    } else if args.attach_or_create {
        Some(Action::AttachOrCreate)
    } else {
        None
    };

    let mut quiet = args.quiet || config.quiet.unwrap_or(false);
    let mut flags =
        AttachFlags { read_only: args.read_only, low_priority: args.low_priority };

    // piping data at a named session implies pass-through
    let mut passthrough = args.passthrough;
    if args.name.is_some() && !tty::stdin_is_tty() {
        passthrough = true;
    }
    if passthrough {
        if action.is_none() {
            action = Some(Action::Attach);
        }
        quiet = true;
        flags.low_priority = true;
    }

    let (action, name) = match (action, &args.name) {
        (None, None) => return list::run(&host),
        (Some(action), Some(name)) => (action, name.clone()),
        _ => bail!(
            "usage: abduco [-a|-A|-c|-n] [-p] [-r] [-q] [-l] [-f] [-e detachkey] name command..."
        ),
    };

    let detach_key = match &args.detach_key {
        Some(spec) => config::parse_key(spec)
            .with_context(|| format!("bad detach key spec '{spec}'"))?,
        None => config.detach_key()?,
    };
    let opts = attach::AttachOpts {
        flags,
        passthrough,
        detach_key,
        redraw_key: config.redraw_key()?,
        alternate_screen: config.alternate_screen.unwrap_or(false),
    };

    let sock = session_dir::resolve(&name, &host)?;

    match action {
        Action::Attach => {
            if attach_session(&sock.path, &opts, quiet, &name, true)?.is_none() {
                bail!("attach-session: no session named '{name}'");
            }
        }
        Action::Create { detached } => {
            create_session(args, &config, &sock, &name, &host, quiet, passthrough)?;
            if !detached && attach_session(&sock.path, &opts, quiet, &name, true)?.is_none() {
                bail!("attach-session: could not reach the fresh session '{name}'");
            }
        }
        Action::AttachOrCreate => {
            if probe::alive(&sock.path) {
                if attach_session(&sock.path, &opts, quiet, &name, true)?.is_none() {
                    bail!("attach-session: session '{name}' vanished");
                }
            } else {
                // collect the remains of a terminated session, if any
                if let Some(status) = collect_exit(&sock.path, quiet, &name) {
                    if !args.force {
                        process::exit(status);
                    }
                    daemon::await_socket_removal(&sock.path);
                }
                create_session(args, &config, &sock, &name, &host, quiet, passthrough)?;
                if attach_session(&sock.path, &opts, quiet, &name, true)?.is_none() {
                    bail!("attach-session: could not reach the fresh session '{name}'");
                }
            }
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn create_session(
    args: &Args,
    config: &config::Config,
    sock: &session_dir::SessionPath,
    name: &str,
    host: &str,
    quiet: bool,
    passthrough: bool,
) -> anyhow::Result<()> {
    if args.force {
        if probe::alive(&sock.path) {
            info_msg(quiet, name, "session exists and has not yet terminated");
            process::exit(1);
        }
        if probe::session_pid(&sock.path).is_some() {
            // deliver the old exit status, then replace the session
            if collect_exit(&sock.path, quiet, name).is_some() {
                daemon::await_socket_removal(&sock.path);
            }
        }
    }

    let command = resolve_command(&args.command, config);
    let term = if passthrough { None } else { tty::snapshot() };
    let size = tty::Size::from_fd(libc::STDIN_FILENO)
        .unwrap_or(tty::Size { rows: consts::DEFAULT_ROWS, cols: consts::DEFAULT_COLS });

    daemon::create_session(daemon::SessionSpec {
        sock: sock.clone(),
        name: String::from(name),
        host: String::from(host),
        command,
        term,
        size,
        read_pty_at_start: args.create_detached,
        scrollback_lines: config.scrollback_lines(),
    })
    .context("create-session")
}

fn resolve_command(command: &[String], config: &config::Config) -> Vec<String> {
    if !command.is_empty() {
        return command.to_vec();
    }
    if let Ok(cmd) = env::var(consts::ENV_DEFAULT_CMD) {
        if !cmd.is_empty() {
            return vec![String::from("/bin/sh"), String::from("-c"), cmd];
        }
    }
    vec![config.default_cmd.clone().unwrap_or_else(|| String::from("/bin/sh"))]
}

/// Attach to the session at `path` and see it through. Returns `None`
/// when no server answers there. When the child has terminated and
/// `terminate` is set, the process exits with the child's status, the
/// way an un-detached invocation is expected to.
fn attach_session(
    path: &Path,
    opts: &attach::AttachOpts,
    quiet: bool,
    name: &str,
    terminate: bool,
) -> anyhow::Result<Option<attach::Outcome>> {
    let stream = match probe::connect(path) {
        Ok(stream) => stream,
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            return Err(e).context("connecting to session");
        }
        Err(_) => return Ok(None),
    };

    let outcome = attach::run(stream, opts)?;
    match outcome {
        attach::Outcome::Detached => info_msg(quiet, name, "detached"),
        attach::Outcome::IoError => {
            info_msg(quiet, name, "exited due to I/O errors");
            process::exit(1);
        }
        attach::Outcome::Exit(status) => {
            info_msg(quiet, name, &format!("session terminated with exit status {status}"));
            if terminate {
                process::exit(status);
            }
        }
    }
    Ok(Some(outcome))
}

/// Deliver the exit status of a terminated, lingering session without
/// touching the terminal: attach on the wire, take the EXIT packet,
/// acknowledge it so the old server can wind down. Returns `None`
/// when there is no lingering session to collect.
fn collect_exit(path: &Path, quiet: bool, name: &str) -> Option<i32> {
    let mut stream = probe::connect(path).ok()?;
    stream.set_read_timeout(Some(time::Duration::from_secs(5))).ok()?;
    Packet::Attach(AttachFlags::default()).write_to(&mut stream).ok()?;

    let deadline = time::Instant::now() + time::Duration::from_secs(5);
    loop {
        if time::Instant::now() > deadline {
            return None;
        }
        match Packet::read_from(&mut stream) {
            Ok(Some(Packet::Exit(status))) => {
                let _ = Packet::Exit(status).write_to(&mut stream);
                info_msg(
                    quiet,
                    name,
                    &format!("session terminated with exit status {status}"),
                );
                return Some(status);
            }
            Ok(Some(_)) => continue,
            // a read timeout here means the session is actually
            // still running; leave it alone
            Ok(None) | Err(_) => return None,
        }
    }
}

fn info_msg(quiet: bool, session: &str, msg: &str) {
    if !quiet {
        eprintln!("{}: {}: {}", consts::PROG_NAME, session, msg);
    }
}
