//! Multi-session server.
//!
//! A long lived listener where debuggers open sessions. Each debugger that announces itself gets
//! a sub-instance: its own registry, controller and listener. The server answers with the
//! sub-instance address and hands the debugger connection over to it.

use crate::error::{Error, Result};
use crate::proto::{Message, Packet};
use crate::relay::accept::{self, Acceptor};
use crate::relay::proxy::{Proxy, ProxyOptions};
use crate::relay::registry::Registry;
use crate::relay::session::{Session, SessionConfig, ShutdownReason};
use crate::transport::{Address, Connection};
use crate::{muted_error, relay_info, relay_warn, weak_error};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use uuid::Uuid;

struct SessionHandle {
    session: Arc<Session>,
    address: Address,
}

pub struct Server {
    options: ProxyOptions,
    base: SessionConfig,
    accept_slice: Duration,
    shutdown: Arc<AtomicBool>,
    sessions: Arc<Mutex<HashMap<Uuid, SessionHandle>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// `base` is the configuration of every sub-session. They are always managed: a sub-session
    /// lives as long as its debugger connection.
    pub fn new(base: SessionConfig, options: ProxyOptions, accept_slice: Duration) -> Self {
        Self {
            options,
            base: SessionConfig {
                managed: true,
                pid: None,
                ..base
            },
            accept_slice,
            shutdown: Arc::new(AtomicBool::new(false)),
            sessions: Arc::default(),
            threads: Mutex::default(),
        }
    }

    pub fn with_shutdown_flag(self, flag: Arc<AtomicBool>) -> Self {
        Self {
            shutdown: flag,
            ..self
        }
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Addresses of live sessions.
    pub fn sessions(&self) -> Vec<(Uuid, Address)> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .map(|(id, handle)| (*id, handle.address.clone()))
            .collect()
    }

    /// Serve until the shutdown flag is raised, then stop every session.
    pub fn run(&self, acceptor: &mut dyn Acceptor) -> Result<()> {
        relay_info!(target: "relay", "session server on {}", acceptor.local_address());
        let base_address = acceptor.local_address().clone();

        while !self.shutdown.load(Ordering::SeqCst) {
            match acceptor.accept_timeout(self.options.accept_window) {
                Ok(Some(conn)) => {
                    weak_error!(self.open(conn, &base_address), "open session:");
                }
                Ok(None) => {}
                Err(e) => {
                    relay_warn!(target: "relay", "accept: {e}");
                    thread::sleep(self.options.tick);
                }
            }
        }

        let sessions = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .map(|handle| handle.session.clone())
            .collect::<Vec<_>>();
        for session in sessions {
            session.shutdown(ShutdownReason::External);
        }

        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for handle in threads {
            if handle.join().is_err() {
                relay_warn!(target: "relay", "session thread panicked");
            }
        }
        Ok(())
    }

    /// Handshake a connection and start a sub-session for it in a new thread.
    fn open(&self, conn: Connection, base_address: &Address) -> Result<()> {
        let id = Uuid::new_v4();
        let base = self.base.clone();
        let options = self.options;
        let slice = self.accept_slice;
        let sessions = self.sessions.clone();
        let server_shutdown = self.shutdown.clone();
        let address = base_address.sibling(&id.simple().to_string());

        let handle = thread::Builder::new()
            .name(format!("session-{id}"))
            .spawn(move || {
                let (mut receiver, sender, peer) = conn.into_parts();
                let refuse = |e: Error| {
                    relay_warn!(target: "relay", "refuse {peer}: {e}");
                    muted_error!(sender.send(&Packet::violation("", e.to_string())));
                    sender.close();
                };

                let name = match accept::read_name(&mut receiver, options.handshake_timeout) {
                    Ok(name) if name == base.debugger => name,
                    Ok(name) => {
                        refuse(Error::Handshake(format!(
                            "only `{}` may open a session, not `{name}`",
                            base.debugger
                        )));
                        return;
                    }
                    Err(e) => {
                        refuse(e);
                        return;
                    }
                };

                let mut acceptor = match accept::bind(&address, slice) {
                    Ok(acceptor) => acceptor,
                    Err(e) => {
                        refuse(e);
                        return;
                    }
                };
                let bound = acceptor.local_address().clone();

                let session = Arc::new(Session::new(base, Arc::new(Registry::new())));
                sessions.lock().unwrap().insert(
                    id,
                    SessionHandle {
                        session: session.clone(),
                        address: bound.clone(),
                    },
                );
                relay_info!(target: "relay", "session {id} for `{name}` on {bound}");
                // the server may have stopped while this session was set up
                if server_shutdown.load(Ordering::SeqCst) {
                    session.shutdown(ShutdownReason::External);
                }

                let proxy = Proxy::new(session, options);
                let conn = Connection::from_parts(receiver, sender.clone(), peer);
                if weak_error!(proxy.attach(&name, conn), "attach debugger:").is_some() {
                    weak_error!(
                        sender.send_message(&Message::from_proxy(&name, bound.to_init())),
                        "report session address:"
                    );
                    weak_error!(proxy.run(acceptor.as_mut()), "session:");
                }

                sessions.lock().unwrap().remove(&id);
                relay_info!(target: "relay", "session {id} finished");
            })
            .map_err(Error::IO)?;

        let mut threads = self.threads.lock().unwrap();
        threads.retain(|h| !h.is_finished());
        threads.push(handle);
        Ok(())
    }
}
