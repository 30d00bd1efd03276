#![allow(dead_code)]

use dbg_relay::client::Client;
use dbg_relay::error::Result;
use dbg_relay::proto::Packet;
use dbg_relay::relay::accept;
use dbg_relay::relay::session::{Notice, Notifier, Signaller};
use dbg_relay::relay::{Proxy, ProxyOptions, Registry, Session, SessionConfig};
use dbg_relay::transport::frame;
use dbg_relay::transport::Address;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const DEBUGGER_PID: i32 = 4242;
pub const WAIT: Duration = Duration::from_secs(3);
pub const SILENCE: Duration = Duration::from_millis(150);

pub fn options() -> ProxyOptions {
    ProxyOptions {
        tick: Duration::from_millis(10),
        accept_window: Duration::from_millis(20),
        handshake_timeout: Duration::from_secs(1),
    }
}

pub fn slice() -> Duration {
    Duration::from_millis(5)
}

/// Signals and notices that would have left the process.
#[derive(Default, Clone)]
pub struct Recorder {
    pub signals: Arc<Mutex<Vec<(Pid, Signal)>>>,
    pub notices: Arc<Mutex<Vec<(String, Notice)>>>,
}

impl Recorder {
    pub fn signals(&self) -> Vec<Signal> {
        self.signals.lock().unwrap().iter().map(|(_, s)| *s).collect()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().iter().map(|(_, n)| *n).collect()
    }
}

impl Signaller for Recorder {
    fn signal(&self, pid: Pid, sig: Signal) -> Result<()> {
        self.signals.lock().unwrap().push((pid, sig));
        Ok(())
    }
}

impl Notifier for Recorder {
    fn notify(&self, pane: &str, notice: Notice) -> Result<()> {
        self.notices.lock().unwrap().push((pane.to_string(), notice));
        Ok(())
    }
}

/// In-process relay on an ephemeral TCP port.
pub struct Relay {
    pub session: Arc<Session>,
    pub address: Address,
    pub recorder: Recorder,
    thread: Option<JoinHandle<()>>,
}

impl Relay {
    pub fn start(managed: bool) -> Self {
        Self::with_config(SessionConfig {
            pid: Some(Pid::from_raw(DEBUGGER_PID)),
            managed,
            ..SessionConfig::default()
        })
    }

    pub fn with_config(config: SessionConfig) -> Self {
        let recorder = Recorder::default();
        let session = Arc::new(
            Session::new(config, Arc::new(Registry::new()))
                .with_signaller(recorder.clone())
                .with_notifier(recorder.clone()),
        );

        let mut acceptor = accept::bind(&Address::default(), slice()).unwrap();
        let address = acceptor.local_address().clone();

        let proxy_session = session.clone();
        let thread = thread::spawn(move || {
            let proxy = Proxy::new(proxy_session, options());
            proxy.run(acceptor.as_mut()).unwrap();
        });

        Self {
            session,
            address,
            recorder,
            thread: Some(thread),
        }
    }

    /// Connect an endpoint and wait until the proxy has registered it.
    pub fn connect(&self, name: &str) -> Client {
        let client = Client::connect(&self.address, name).unwrap();
        assert!(
            wait_until(|| self.session.registry().contains(name)),
            "`{name}` not registered"
        );
        client
    }

    pub fn wait_gone(&self, name: &str) {
        assert!(
            wait_until(|| !self.session.registry().contains(name)),
            "`{name}` still registered"
        );
    }

    /// Wait for the accept loop and every pump to finish.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.session.shutdown(dbg_relay::relay::ShutdownReason::External);
        if let Some(thread) = self.thread.take() {
            _ = thread.join();
        }
    }
}

pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Endpoint that writes frames by hand.
pub struct RawEndpoint {
    stream: TcpStream,
}

impl RawEndpoint {
    pub fn connect(address: &Address) -> Self {
        let Address::Tcp(host, port) = address else {
            panic!("tcp address expected");
        };
        let stream = TcpStream::connect((host.as_str(), *port)).unwrap();
        stream.set_read_timeout(Some(WAIT)).unwrap();
        Self { stream }
    }

    pub fn write_payload(&mut self, payload: &[u8]) {
        self.stream.write_all(&frame::encode(payload).unwrap()).unwrap();
    }

    pub fn write_json(&mut self, value: serde_json::Value) {
        self.write_payload(value.to_string().as_bytes());
    }

    pub fn read_packet(&mut self) -> Packet {
        let mut len = [0u8; frame::LEN_PREFIX];
        self.stream.read_exact(&mut len).unwrap();
        let mut payload = vec![0u8; u32::from_be_bytes(len) as usize];
        self.stream.read_exact(&mut payload).unwrap();
        Packet::decode(&payload).unwrap()
    }

    /// True if the proxy closed the connection.
    pub fn is_closed(&mut self) -> bool {
        let mut byte = [0u8; 1];
        matches!(self.stream.read(&mut byte), Ok(0))
    }
}

pub fn event(client: &mut Client, op: &str) -> Packet {
    client
        .wait_event(op, WAIT)
        .unwrap()
        .unwrap_or_else(|| panic!("`{}` got no `{op}`", client.name()))
}
