use crate::error::{Error, Result};
use crate::proto::{Body, Message, Packet};
use crate::relay::accept::{self, Acceptor};
use crate::relay::pump::Pump;
use crate::relay::registry::Endpoint;
use crate::relay::session::{Session, State};
use crate::transport::{Connection, FrameReceiver, FrameSender};
use crate::{muted_error, relay_debug, relay_warn, weak_error};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct ProxyOptions {
    /// Longest time a pump waits for a frame before it looks at the shutdown flag again.
    pub tick: Duration,
    /// Longest time the accept loop waits for a connection before it looks at the shutdown flag
    /// again.
    pub accept_window: Duration,
    /// Time a fresh connection has to announce its name.
    pub handshake_timeout: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            accept_window: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// Router of a single session: admits connections, runs a pump for each of them and waits for
/// the session end.
pub struct Proxy {
    session: Arc<Session>,
    options: ProxyOptions,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Proxy {
    pub fn new(session: Arc<Session>, options: ProxyOptions) -> Self {
        Self {
            session,
            options,
            threads: Mutex::default(),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    /// Register a connection whose name is already known (no handshake) and start its pump.
    pub fn attach(&self, name: &str, conn: Connection) -> Result<()> {
        let (receiver, sender, peer) = conn.into_parts();
        relay_debug!(target: "relay", "attach `{name}` ({peer})");
        let pump = register(&self.session, name, receiver, sender, self.options.tick)?;
        self.spawn(format!("pump-{name}"), move || pump.run())
    }

    /// Handshake a fresh connection in its own thread, then register and pump it.
    ///
    /// `greeting` is sent to the endpoint right after it is registered.
    pub fn admit(&self, conn: Connection, greeting: Option<Body>) -> Result<()> {
        let session = self.session.clone();
        let options = self.options;

        self.spawn(format!("conn-{}", conn.peer()), move || {
            let (mut receiver, sender, peer) = conn.into_parts();

            let name = match accept::read_name(&mut receiver, options.handshake_timeout) {
                Ok(name) => name,
                Err(e) => {
                    relay_warn!(target: "relay", "refuse {peer}: {e}");
                    muted_error!(sender.send(&Packet::violation("", e.to_string())));
                    sender.close();
                    return;
                }
            };

            let Some(pump) = weak_error!(
                register(&session, &name, receiver, sender.clone(), options.tick),
                "refuse connection:"
            ) else {
                return;
            };

            if let Some(body) = greeting {
                weak_error!(
                    sender.send_message(&Message::from_proxy(&name, body)),
                    "greeting:"
                );
            }
            pump.run();
        })
    }

    /// Accept and pump connections until the session shuts down, then wait for every pump.
    pub fn run(&self, acceptor: &mut dyn Acceptor) -> Result<()> {
        self.session.advance(State::Listening);
        log::info!(target: "relay", "listen on {}", acceptor.local_address());

        while !self.session.is_shutting_down() {
            match acceptor.accept_timeout(self.options.accept_window) {
                Ok(Some(conn)) => {
                    relay_debug!(target: "relay", "accepted {}", conn.peer());
                    weak_error!(self.admit(conn, None), "admit connection:");
                }
                Ok(None) => {}
                Err(e) => {
                    relay_warn!(target: "relay", "accept: {e}");
                    thread::sleep(self.options.tick);
                }
            }
        }

        self.join();
        Ok(())
    }

    /// Wait for the session end without accepting anything.
    pub fn wait(&self) {
        self.session.advance(State::Listening);
        while !self.session.is_shutting_down() {
            thread::sleep(self.options.tick);
        }
        self.join();
    }

    fn join(&self) {
        self.session.observe_external_shutdown();

        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for handle in threads {
            if handle.join().is_err() {
                relay_warn!(target: "relay", "connection thread panicked");
            }
        }
        self.session.finish();
    }

    fn spawn(&self, name: String, f: impl FnOnce() + Send + 'static) -> Result<()> {
        let handle = thread::Builder::new()
            .name(name)
            .spawn(f)
            .map_err(Error::IO)?;

        let mut threads = self.threads.lock().unwrap();
        threads.retain(|h| !h.is_finished());
        threads.push(handle);
        Ok(())
    }
}

/// Put a named connection into the registry. On refusal the endpoint is told why and the
/// connection is closed.
fn register(
    session: &Arc<Session>,
    name: &str,
    receiver: FrameReceiver,
    sender: FrameSender,
    tick: Duration,
) -> Result<Pump> {
    let role = session.role_of(name);
    let endpoint = Endpoint::new(name, role, sender.clone());

    if let Err(e) = session.registry().register(endpoint.clone()) {
        muted_error!(sender.send(&Packet::violation(name, e.to_string())));
        sender.close();
        return Err(e);
    }
    session.on_registered(&endpoint);

    Ok(Pump::new(
        name,
        role,
        receiver,
        sender,
        session.clone(),
        tick,
    ))
}
