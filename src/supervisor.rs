//! Process level setup of a relay: opens the listener, links the debugger, reports the address
//! and runs the mode specific loop until the session ends.

use crate::config::{Config, Mode, ADDRESS_ENV};
use crate::proto::{Body, Message};
use crate::relay::session::Notice;
use crate::relay::{accept, Proxy, Registry, Server, Session, ShutdownReason};
use crate::transport::{Address, Connection, FrameSender};
use crate::{muted_error, relay_info, relay_warn, weak_error};
use anyhow::Context;
use nix::unistd::{getppid, Pid};
use std::fs;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Time a spawned debugger has to exit after the session ended.
const CHILD_EXIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Start `command` with its standard input/output connected to the relay.
fn spawn_debugger(command: &[String], address: &Address) -> anyhow::Result<(Connection, Child)> {
    let (program, args) = command.split_first().context("empty debugger command")?;

    let (from_debugger, debugger_stdout) = os_pipe::pipe()?;
    let (debugger_stdin, to_debugger) = os_pipe::pipe()?;

    // the command holds the child ends of both pipes, it is dropped once the child runs
    let child = {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .env(ADDRESS_ENV, address.to_string())
            .stdin(Stdio::from(debugger_stdin))
            .stdout(Stdio::from(debugger_stdout));
        cmd.spawn()
            .with_context(|| format!("spawn debugger `{program}`"))?
    };
    relay_info!(target: "relay", "debugger `{program}` started, pid {}", child.id());

    Ok((
        Connection::from_pipes(from_debugger, to_debugger, program.clone()),
        child,
    ))
}

/// Runs the relay in the configured mode.
pub struct Supervisor;

impl Supervisor {
    pub fn run(config: Config) -> anyhow::Result<()> {
        let shutdown = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))
            .context("install SIGTERM handler")?;
        signal_hook::flag::register(signal_hook::consts::SIGHUP, Arc::clone(&shutdown))
            .context("install SIGHUP handler")?;
        // interrupts are for the debugger, the relay keeps running
        signal_hook::flag::register(
            signal_hook::consts::SIGINT,
            Arc::new(AtomicBool::new(false)),
        )
        .context("install SIGINT handler")?;

        match config.mode {
            Mode::Listen => Self::listen(config, shutdown),
            Mode::Tunnel => Self::tunnel(config, shutdown),
            Mode::Server => Self::server(config, shutdown),
        }
    }

    /// Standard input/output (or a spawned debugger) is the debugger endpoint, front-ends come
    /// through the listener.
    fn listen(config: Config, shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
        let debugger = config.session.debugger.clone();

        // an inherited pipe exists before the listener, a spawned debugger needs the address
        let inherited = if config.spawn.is_empty() {
            Some(Connection::stdio().context("open stdio")?)
        } else {
            None
        };

        let mut acceptor = match accept::bind(&config.listen, config.accept_slice) {
            Ok(acceptor) => acceptor,
            Err(e) => {
                if let Some(conn) = &inherited {
                    abort(&conn.sender(), &debugger, &e.to_string());
                }
                return Err(e).with_context(|| format!("listen on {}", config.listen));
            }
        };
        let address = acceptor.local_address().clone();

        let (conn, child) = match inherited {
            Some(conn) => (conn, None),
            None => {
                let (conn, child) = spawn_debugger(&config.spawn, &address)?;
                (conn, Some(child))
            }
        };

        let mut session_config = config.session.clone();
        session_config.pid = session_config
            .pid
            .or_else(|| child.as_ref().map(|c| Pid::from_raw(c.id() as i32)))
            .or_else(|| Some(getppid()));

        let session = Arc::new(
            Session::new(session_config, Arc::new(Registry::new())).with_shutdown_flag(shutdown),
        );
        let proxy = Proxy::new(session.clone(), config.proxy);

        let sender = conn.sender();
        proxy.attach(&debugger, conn).context("attach debugger")?;

        if let Err(e) = report(&sender, &debugger, &address, config.address_file.as_deref()) {
            abort(&sender, &debugger, &format!("{e:#}"));
            session.shutdown(ShutdownReason::External);
            proxy.wait();
            return Err(e);
        }
        session.notify(Notice::Connect);

        proxy.run(acceptor.as_mut())?;
        if let Some(reason) = session.reason() {
            relay_info!(target: "relay", "session end: {reason}");
        }

        if let Some(child) = child {
            reap(child);
        }
        Ok(())
    }

    /// Standard input/output is a tunneled endpoint that names itself, others come through the
    /// listener.
    fn tunnel(config: Config, shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
        let mut acceptor = accept::bind(&config.listen, config.accept_slice)
            .with_context(|| format!("listen on {}", config.listen))?;
        let address = acceptor.local_address().clone();
        write_address_file(config.address_file.as_deref(), &address)?;

        let session = Arc::new(
            Session::new(config.session.clone(), Arc::new(Registry::new()))
                .with_shutdown_flag(shutdown),
        );
        let proxy = Proxy::new(session, config.proxy);

        let tunnel = Connection::stdio().context("open stdio")?;
        proxy
            .admit(tunnel, Some(address.to_init()))
            .context("admit tunnel")?;

        proxy.run(acceptor.as_mut())?;
        Ok(())
    }

    /// Session server: every debugger that connects gets its own session.
    fn server(config: Config, shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
        let mut acceptor = accept::bind(&config.listen, config.accept_slice)
            .with_context(|| format!("listen on {}", config.listen))?;
        write_address_file(config.address_file.as_deref(), acceptor.local_address())?;

        let server = Server::new(config.session.clone(), config.proxy, config.accept_slice)
            .with_shutdown_flag(shutdown);
        server.run(acceptor.as_mut())?;
        Ok(())
    }
}

/// Tell the debugger where front-ends can connect.
fn report(
    sender: &FrameSender,
    debugger: &str,
    address: &Address,
    address_file: Option<&Path>,
) -> anyhow::Result<()> {
    write_address_file(address_file, address)?;
    sender
        .send_message(&Message::from_proxy(debugger, address.to_init()))
        .context("report address to debugger")?;
    relay_info!(target: "relay", "address {address} reported to `{debugger}`");
    Ok(())
}

fn write_address_file(path: Option<&Path>, address: &Address) -> anyhow::Result<()> {
    if let Some(path) = path {
        let json = serde_json::to_string(address)?;
        fs::write(path, json).with_context(|| format!("write address file {}", path.display()))?;
    }
    Ok(())
}

/// Tell the spawner that the relay will not come up.
fn abort(sender: &FrameSender, debugger: &str, msg: &str) {
    let body = Body::Abort {
        msg: msg.to_string(),
    };
    muted_error!(
        sender.send_message(&Message::from_proxy(debugger, body)),
        "send abort:"
    );
}

/// Wait for a spawned debugger, kill it if it outlives the session for too long.
fn reap(mut child: Child) {
    let deadline = Instant::now() + CHILD_EXIT_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                relay_info!(target: "relay", "debugger exit with {status}");
                return;
            }
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
            Ok(None) => {
                relay_warn!(target: "relay", "debugger does not exit, kill it");
                weak_error!(child.kill(), "kill debugger:");
                weak_error!(child.wait(), "wait debugger:");
                return;
            }
            Err(e) => {
                relay_warn!(target: "relay", "wait debugger: {e}");
                return;
            }
        }
    }
}
