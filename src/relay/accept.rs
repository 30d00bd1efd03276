//! Sources of new connections and the naming handshake.

use crate::error::{Error, Result};
use crate::proto::{Body, PROXY};
use crate::relay_debug;
use crate::transport::{Address, Connection, FrameReceiver, Stream};
use std::io;
use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

/// Pause between two accept attempts of a non-blocking listener.
pub const DEFAULT_ACCEPT_SLICE: Duration = Duration::from_millis(20);

pub trait Acceptor: Send {
    /// Wait at most `timeout` for a new connection.
    fn accept_timeout(&mut self, timeout: Duration) -> Result<Option<Connection>>;

    /// Bound address, the one to report.
    fn local_address(&self) -> &Address;
}

/// Open a listener on `addr`.
pub fn bind(addr: &Address, slice: Duration) -> Result<Box<dyn Acceptor>> {
    Ok(match addr {
        Address::Tcp(host, port) => Box::new(TcpAcceptor::bind(host, *port, slice)?),
        Address::Unix(path) => Box::new(UnixAcceptor::bind(path.clone(), slice)?),
    })
}

/// Poll a non-blocking accept in slices until something arrives or `timeout` elapses.
fn sliced_accept<S: Stream>(
    mut accept: impl FnMut() -> io::Result<S>,
    timeout: Duration,
    slice: Duration,
) -> Result<Option<Connection>> {
    let deadline = Instant::now() + timeout;
    loop {
        match accept() {
            Ok(stream) => return Connection::from_stream(stream).map(Some),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Ok(None);
                }
                thread::sleep(slice.min(left));
            }
            Err(e) => return Err(Error::IO(e)),
        }
    }
}

pub struct TcpAcceptor {
    listener: TcpListener,
    address: Address,
    slice: Duration,
}

impl TcpAcceptor {
    pub fn bind(host: &str, port: u16, slice: Duration) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).map_err(Error::IO)?;
        listener.set_nonblocking(true).map_err(Error::IO)?;
        let local = listener.local_addr().map_err(Error::IO)?;
        Ok(Self {
            listener,
            address: Address::Tcp(local.ip().to_string(), local.port()),
            slice,
        })
    }
}

impl Acceptor for TcpAcceptor {
    fn accept_timeout(&mut self, timeout: Duration) -> Result<Option<Connection>> {
        let listener = &self.listener;
        sliced_accept(|| listener.accept().map(|(s, _)| s), timeout, self.slice)
    }

    fn local_address(&self) -> &Address {
        &self.address
    }
}

/// Unix socket listener, the socket file is removed on drop.
pub struct UnixAcceptor {
    listener: UnixListener,
    address: Address,
    path: PathBuf,
    slice: Duration,
}

impl UnixAcceptor {
    pub fn bind(path: PathBuf, slice: Duration) -> Result<Self> {
        let listener = UnixListener::bind(&path).map_err(Error::IO)?;
        listener.set_nonblocking(true).map_err(Error::IO)?;
        Ok(Self {
            listener,
            address: Address::Unix(path.clone()),
            path,
            slice,
        })
    }
}

impl Acceptor for UnixAcceptor {
    fn accept_timeout(&mut self, timeout: Duration) -> Result<Option<Connection>> {
        let listener = &self.listener;
        sliced_accept(|| listener.accept().map(|(s, _)| s), timeout, self.slice)
    }

    fn local_address(&self) -> &Address {
        &self.address
    }
}

impl Drop for UnixAcceptor {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            relay_debug!(target: "relay", "remove socket {}: {e}", self.path.display());
        }
    }
}

/// Read the first frame of a fresh connection, it must be a `name` announce addressed to the
/// proxy. Anything else, or silence for `timeout`, is an [`Error::Handshake`].
pub fn read_name(receiver: &mut FrameReceiver, timeout: Duration) -> Result<String> {
    let packet = match receiver.receive_timeout(timeout) {
        Ok(Some(packet)) => packet,
        Ok(None) => {
            return Err(Error::Handshake(format!(
                "no name announced in {timeout:?}"
            )))
        }
        Err(Error::MalformedPacket(msg)) => return Err(Error::Handshake(msg)),
        Err(e) => return Err(e),
    };

    if !packet.is_control() || packet.op != "name" {
        return Err(Error::Handshake(format!(
            "expect `name` announce, got `{}` for `{}`",
            packet.op, packet.dst
        )));
    }

    let msg = packet
        .to_message()
        .map_err(|e| Error::Handshake(e.to_string()))?;
    let name = match msg.body {
        Body::Name { name } => name,
        other => {
            return Err(Error::Handshake(format!(
                "expect `name` announce, got `{}`",
                other.op()
            )))
        }
    };

    if name.is_empty() || name == PROXY {
        return Err(Error::Handshake(format!("name `{name}` is reserved")));
    }
    Ok(name)
}
