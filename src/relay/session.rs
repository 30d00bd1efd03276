//! Session lifecycle controller.
//!
//! One [`Session`] exists per routed debugging session. It owns the facts about the debugger
//! (name, pid, whether its life is ours), interprets control plane requests and performs the
//! single teardown shared by every trigger: `quit`, loss of a managed debugger, or an external
//! termination request.

use crate::error::{Error, Result};
use crate::proto::{Body, Message, Packet};
use crate::relay::registry::{Endpoint, Registry, Role};
use crate::{muted_error, relay_debug, relay_info, relay_warn, weak_error};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fmt::{Display, Formatter};
use std::io;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use strum_macros::Display;

pub const DEFAULT_DEBUGGER: &str = "gdb";
pub const DEFAULT_FRONTEND: &str = "vim";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Starting,
    Listening,
    Running,
    ShuttingDown,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// `quit` control message from an endpoint.
    Quit { from: String },
    /// Managed debugger connection is gone.
    DebuggerLost { name: String },
    /// Termination requested from outside (signal, server stop).
    External,
}

impl Display for ShutdownReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Quit { from } => write!(f, "quit requested by `{from}`"),
            ShutdownReason::DebuggerLost { name } => write!(f, "debugger `{name}` disconnected"),
            ShutdownReason::External => f.write_str("termination requested"),
        }
    }
}

/// Delivers signals to the debugger process.
pub trait Signaller: Send + Sync {
    fn signal(&self, pid: Pid, sig: Signal) -> Result<()>;
}

/// Sends real signals with `kill(2)`.
pub struct ProcessSignaller;

impl Signaller for ProcessSignaller {
    fn signal(&self, pid: Pid, sig: Signal) -> Result<()> {
        signal::kill(pid, sig).map_err(|e| Error::Syscall("kill", e))
    }
}

/// Out of band notification for a front-end that can't watch its socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Notice {
    /// Proxy address is known, front-end may connect.
    Connect,
    /// New messages are waiting.
    Refresh,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, pane: &str, notice: Notice) -> Result<()>;
}

/// Types `:Gdb<Notice>` into the front-end tmux pane.
pub struct TmuxNotifier;

impl Notifier for TmuxNotifier {
    fn notify(&self, pane: &str, notice: Notice) -> Result<()> {
        let keys = format!("\x1b\x1b:Gdb{notice}");
        let status = Command::new("tmux")
            .args(["send-keys", "-t", pane, &keys, "ENTER"])
            .status()?;
        if !status.success() {
            return Err(Error::IO(io::Error::new(
                io::ErrorKind::Other,
                format!("tmux send-keys exit with {status}"),
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Name of the debugger endpoint.
    pub debugger: String,
    /// Name of the front-end refreshed by `trap`.
    pub frontend: String,
    /// Debugger process, target of interrupts.
    pub pid: Option<Pid>,
    /// If true the debugger life is bound to the session: its loss ends the session and the
    /// session end terminates it.
    pub managed: bool,
    pub tmux_pane: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debugger: DEFAULT_DEBUGGER.to_string(),
            frontend: DEFAULT_FRONTEND.to_string(),
            pid: None,
            managed: false,
            tmux_pane: None,
        }
    }
}

pub struct Session {
    config: SessionConfig,
    registry: Arc<Registry>,
    state: Mutex<State>,
    shutdown: Arc<AtomicBool>,
    torn_down: AtomicBool,
    reason: Mutex<Option<ShutdownReason>>,
    tmux_pane: OnceLock<String>,
    signaller: Box<dyn Signaller>,
    notifier: Box<dyn Notifier>,
}

impl Session {
    pub fn new(config: SessionConfig, registry: Arc<Registry>) -> Self {
        let tmux_pane = OnceLock::new();
        if let Some(pane) = config.tmux_pane.clone() {
            _ = tmux_pane.set(pane);
        }

        Self {
            config,
            registry,
            state: Mutex::new(State::Starting),
            shutdown: Arc::new(AtomicBool::new(false)),
            torn_down: AtomicBool::new(false),
            reason: Mutex::new(None),
            tmux_pane,
            signaller: Box::new(ProcessSignaller),
            notifier: Box::new(TmuxNotifier),
        }
    }

    pub fn with_signaller(self, signaller: impl Signaller + 'static) -> Self {
        Self {
            signaller: Box::new(signaller),
            ..self
        }
    }

    pub fn with_notifier(self, notifier: impl Notifier + 'static) -> Self {
        Self {
            notifier: Box::new(notifier),
            ..self
        }
    }

    /// Share the termination flag, e.g. with a signal handler. Raising it from outside is seen
    /// as an external shutdown request.
    pub fn with_shutdown_flag(self, flag: Arc<AtomicBool>) -> Self {
        Self {
            shutdown: flag,
            ..self
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn debugger(&self) -> &str {
        &self.config.debugger
    }

    pub fn frontend(&self) -> &str {
        &self.config.frontend
    }

    pub fn is_managed(&self) -> bool {
        self.config.managed
    }

    pub fn pid(&self) -> Option<Pid> {
        self.config.pid
    }

    pub fn tmux_pane(&self) -> Option<&str> {
        self.tmux_pane.get().map(String::as_str)
    }

    pub fn role_of(&self, name: &str) -> Role {
        if name == self.config.debugger {
            Role::Debugger
        } else {
            Role::Frontend
        }
    }

    pub fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    /// Move forward to `to`. Going back is ignored, return false in that case.
    pub fn advance(&self, to: State) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state >= to {
            return false;
        }
        relay_debug!(target: "relay", "session state: {} -> {to}", *state);
        *state = to;
        true
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().unwrap().clone()
    }

    /// Called once an endpoint joined the registry.
    pub fn on_registered(&self, endpoint: &Endpoint) {
        relay_info!(target: "relay", "{} `{}` connected", endpoint.role, endpoint.name);
        self.advance(State::Running);
    }

    /// Called by a pump whose connection is gone.
    pub fn on_endpoint_lost(&self, name: &str, role: Role) {
        match role {
            Role::Debugger if self.config.managed => {
                self.shutdown(ShutdownReason::DebuggerLost {
                    name: name.to_string(),
                });
            }
            Role::Debugger => {
                if !self.is_shutting_down() {
                    relay_warn!(target: "relay", "debugger `{name}` disconnected, session continues");
                }
            }
            Role::Frontend => {
                relay_info!(target: "relay", "front-end `{name}` disconnected");
            }
        }
    }

    /// Execute a control plane packet sent by `from`.
    ///
    /// Unknown or misplaced operations are [`Error::MalformedPacket`], the sender keeps its
    /// connection.
    pub fn handle_control(&self, from: &str, packet: &Packet) -> Result<()> {
        let msg = packet.to_message()?;
        match msg.body {
            Body::Trap { target } => {
                self.trap(target.as_deref().unwrap_or(&self.config.debugger))?;
            }
            Body::Quit => {
                self.shutdown(ShutdownReason::Quit {
                    from: from.to_string(),
                });
            }
            Body::Print { msg } => {
                log::info!(target: "relay", "[{from}] {msg}");
            }
            Body::TmuxPane { pane } => {
                if self.tmux_pane.set(pane.clone()).is_err() {
                    relay_debug!(target: "relay", "tmux pane already known, `{pane}` from `{from}` ignored");
                }
            }
            Body::Name { name } => {
                relay_warn!(target: "relay", "`{from}` tries to rename itself to `{name}`, ignored");
            }
            other => {
                return Err(Error::MalformedPacket(format!(
                    "`{}` is not a control operation",
                    other.op()
                )));
            }
        }
        Ok(())
    }

    /// Interrupt the debugger or wake up the front-end, depending on `target`.
    ///
    /// Any other target is an [`Error::MalformedPacket`].
    pub fn trap(&self, target: &str) -> Result<()> {
        if target == self.config.debugger {
            match self.config.pid {
                Some(pid) => {
                    relay_debug!(target: "relay", "interrupt debugger {pid}");
                    weak_error!(self.signaller.signal(pid, Signal::SIGINT), "interrupt debugger:");
                }
                None => {
                    relay_warn!(target: "relay", "trap: no debugger process to interrupt");
                }
            }
        } else if target == self.frontend() {
            self.notify(Notice::Refresh);
        } else {
            return Err(Error::MalformedPacket(format!(
                "unknown trap target `{target}`"
            )));
        }
        Ok(())
    }

    /// Send a notice to the front-end pane, if one is known.
    pub fn notify(&self, notice: Notice) {
        match self.tmux_pane.get() {
            Some(pane) => {
                weak_error!(self.notifier.notify(pane, notice), "front-end notification:");
            }
            None => relay_debug!(target: "relay", "no front-end pane, {notice} notice dropped"),
        }
    }

    /// Stop the session.
    ///
    /// Only the first call does anything: it raises the shutdown flag, asks front-ends to quit,
    /// closes every connection and terminates a managed debugger. Return true for that call.
    pub fn shutdown(&self, reason: ShutdownReason) -> bool {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            relay_debug!(target: "relay", "already shutting down, {reason} ignored");
            return false;
        }

        relay_info!(target: "relay", "shutdown: {reason}");
        *self.reason.lock().unwrap() = Some(reason);
        self.advance(State::ShuttingDown);
        self.shutdown.store(true, Ordering::SeqCst);

        for endpoint in self.registry.drain() {
            if endpoint.role == Role::Frontend {
                let quit = Message::from_proxy(&endpoint.name, Body::Quit);
                muted_error!(endpoint.sender.send_message(&quit), "send quit:");
            }
            endpoint.sender.close();
        }

        if self.config.managed {
            if let Some(pid) = self.config.pid {
                relay_debug!(target: "relay", "terminate debugger {pid}");
                weak_error!(self.signaller.signal(pid, Signal::SIGTERM), "terminate debugger:");
            }
        }
        true
    }

    /// Shutdown on an externally raised flag, no-op otherwise.
    pub fn observe_external_shutdown(&self) {
        if self.is_shutting_down() {
            self.shutdown(ShutdownReason::External);
        }
    }

    /// Final state, every pump is gone.
    pub fn finish(&self) {
        self.advance(State::Terminated);
    }
}
