//! Command line, environment and config file.
//!
//! Every option may come from the command line, from a `DBG_RELAY_*` environment variable or from
//! a TOML file (`~/.config/dbg-relay/config.toml` unless `--config` says otherwise), in that
//! order of precedence.

use crate::muted_error;
use crate::relay::accept::DEFAULT_ACCEPT_SLICE;
use crate::relay::session::{SessionConfig, DEFAULT_DEBUGGER, DEFAULT_FRONTEND};
use crate::relay::ProxyOptions;
use crate::transport::Address;
use anyhow::Context;
use clap::Parser;
use nix::unistd::Pid;
use serde::Deserialize;
use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strum_macros::{Display, EnumString};

/// Environment variable with the proxy address, set for a spawned debugger.
pub const ADDRESS_ENV: &str = "DBG_RELAY_ADDRESS";

/// Where the proxy gets its connections from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Standard input/output is the debugger pipe, front-ends connect to the listener.
    #[default]
    Listen,
    /// Standard input/output is a tunneled connection that announces its name like any other.
    Tunnel,
    /// Persistent listener, every debugger that connects gets its own session.
    Server,
}

#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Connection topology: listen, tunnel or server
    #[clap(long, env = "DBG_RELAY_MODE")]
    pub mode: Option<Mode>,

    /// Listen address, `host:port` or `unix:/path` (default: 127.0.0.1:0)
    #[clap(long, env = "DBG_RELAY_LISTEN")]
    pub listen: Option<String>,

    /// Write the bound address (JSON) into this file
    #[clap(long, env = "DBG_RELAY_ADDRESS_FILE")]
    pub address_file: Option<PathBuf>,

    /// Endpoint name of the debugger (default: gdb)
    #[clap(long, env = "DBG_RELAY_DEBUGGER")]
    pub debugger: Option<String>,

    /// Endpoint name of the front-end refreshed by `trap` (default: vim)
    #[clap(long, env = "DBG_RELAY_FRONTEND")]
    pub frontend: Option<String>,

    /// Pid of the debugger process (default in listen mode: parent process)
    #[clap(long, env = "DBG_RELAY_DEBUGGER_PID")]
    pub debugger_pid: Option<i32>,

    /// Terminate the debugger when the session ends and end the session when the debugger
    /// disconnects
    #[clap(long, env = "DBG_RELAY_MANAGED")]
    pub managed: bool,

    /// Tmux pane of the front-end, used for out of band notifications
    #[clap(long, env = "VIM_TMUX_PANE")]
    pub tmux_pane: Option<String>,

    /// Pump poll interval in milliseconds
    #[clap(long, env = "DBG_RELAY_TICK_MS")]
    pub tick_ms: Option<u64>,

    /// Accept wait between two shutdown checks, in milliseconds
    #[clap(long)]
    pub accept_window_ms: Option<u64>,

    /// Pause between two attempts of non-blocking accept, in milliseconds
    #[clap(long)]
    pub accept_slice_ms: Option<u64>,

    /// Time a new connection has to announce its name, in milliseconds
    #[clap(long)]
    pub handshake_timeout_ms: Option<u64>,

    /// Append logs to this file instead of stderr
    #[clap(long, env = "DBG_RELAY_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Mute relay logs
    #[clap(short, long)]
    pub quiet: bool,

    /// Config file
    #[clap(long, env = "DBG_RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Start the debugger, command after `--`
    #[clap(last = true)]
    pub spawn: Vec<String>,
}

/// Config file contents, every key is optional.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileConfig {
    pub mode: Option<Mode>,
    pub listen: Option<String>,
    pub address_file: Option<PathBuf>,
    pub debugger: Option<String>,
    pub frontend: Option<String>,
    pub managed: Option<bool>,
    pub tmux_pane: Option<String>,
    pub tick_ms: Option<u64>,
    pub accept_window_ms: Option<u64>,
    pub accept_slice_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    pub log_file: Option<PathBuf>,
    pub spawn: Option<Vec<String>>,
}

impl FileConfig {
    const DEFAULT_PATH: &'static str = ".config/dbg-relay/config.toml";

    /// Load a config file. An explicit `path` must exist, a missing default file means no
    /// config.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let data = match path {
            Some(path) => read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?,
            None => {
                let Some(home) = home::home_dir() else {
                    return Ok(Self::default());
                };
                match muted_error!(read_to_string(home.join(Self::DEFAULT_PATH))) {
                    Some(data) => data,
                    None => return Ok(Self::default()),
                }
            }
        };
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> anyhow::Result<Self> {
        toml::from_str(data).context("parse config")
    }
}

/// Resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub listen: Address,
    pub address_file: Option<PathBuf>,
    pub session: SessionConfig,
    pub proxy: ProxyOptions,
    pub accept_slice: Duration,
    pub log_file: Option<PathBuf>,
    pub quiet: bool,
    pub spawn: Vec<String>,
}

impl Config {
    pub fn load(args: Args) -> anyhow::Result<Self> {
        let file = FileConfig::load(args.config.as_deref())?;
        Self::merge(args, file)
    }

    /// Combine command line (first) and file (second) values.
    pub fn merge(args: Args, file: FileConfig) -> anyhow::Result<Self> {
        let defaults = ProxyOptions::default();
        let ms = |arg: Option<u64>, from_file: Option<u64>, default: Duration| {
            arg.or(from_file).map(Duration::from_millis).unwrap_or(default)
        };

        let mode = args.mode.or(file.mode).unwrap_or_default();
        let listen = match args.listen.or(file.listen) {
            Some(addr) => addr
                .parse::<Address>()
                .with_context(|| format!("listen address `{addr}`"))?,
            None => Address::default(),
        };

        let spawn = if args.spawn.is_empty() {
            file.spawn.unwrap_or_default()
        } else {
            args.spawn
        };
        if !spawn.is_empty() && mode != Mode::Listen {
            anyhow::bail!("a debugger can only be spawned in listen mode");
        }

        let session = SessionConfig {
            debugger: args
                .debugger
                .or(file.debugger)
                .unwrap_or_else(|| DEFAULT_DEBUGGER.to_string()),
            frontend: args
                .frontend
                .or(file.frontend)
                .unwrap_or_else(|| DEFAULT_FRONTEND.to_string()),
            pid: args.debugger_pid.map(Pid::from_raw),
            managed: args.managed || file.managed.unwrap_or(false) || !spawn.is_empty(),
            tmux_pane: args.tmux_pane.or(file.tmux_pane),
        };

        Ok(Self {
            mode,
            listen,
            address_file: args.address_file.or(file.address_file),
            session,
            proxy: ProxyOptions {
                tick: ms(args.tick_ms, file.tick_ms, defaults.tick),
                accept_window: ms(
                    args.accept_window_ms,
                    file.accept_window_ms,
                    defaults.accept_window,
                ),
                handshake_timeout: ms(
                    args.handshake_timeout_ms,
                    file.handshake_timeout_ms,
                    defaults.handshake_timeout,
                ),
            },
            accept_slice: ms(args.accept_slice_ms, file.accept_slice_ms, DEFAULT_ACCEPT_SLICE),
            log_file: args.log_file.or(file.log_file),
            quiet: args.quiet,
            spawn,
        })
    }
}
