//! Framed transport over byte streams.
//!
//! A [`Connection`] is split into a [`FrameReceiver`], owned by the single thread reading the
//! connection, and a [`FrameSender`] that may be cloned and shared between every thread writing
//! to it.

pub mod address;
pub mod frame;
pub mod signal;

pub use address::Address;

use crate::error::{Error, Result};
use crate::{muted_error, relay_debug};
use crate::proto::{Message, Packet};
use frame::FrameBuffer;
use signal::SignalGuard;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use timeout_readwrite::{TimeoutReader, TimeoutWriter};

const READ_CHUNK: usize = 4096;

/// Longest time a frame write may wait for a peer that does not read.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Readable file descriptor.
pub trait RawRead: Read + AsRawFd + Send {}

impl<T: Read + AsRawFd + Send> RawRead for T {}

/// Writable file descriptor.
pub trait RawWrite: Write + AsRawFd + Send {}

impl<T: Write + AsRawFd + Send> RawWrite for T {}

/// Lends a reader to a short lived [`TimeoutReader`].
struct Borrowed<'a>(&'a mut dyn RawRead);

impl Read for Borrowed<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl AsRawFd for Borrowed<'_> {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// Read half of a connection.
pub struct FrameReceiver {
    reader: Box<dyn RawRead>,
    frames: FrameBuffer,
    eof: bool,
}

impl FrameReceiver {
    pub fn new(reader: impl RawRead + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            frames: FrameBuffer::default(),
            eof: false,
        }
    }

    /// Read available bytes, waiting at most `timeout` (forever if `None`).
    /// Return false if nothing was read.
    fn fill(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut reader = TimeoutReader::new(Borrowed(self.reader.as_mut()), timeout);
        match reader.read(&mut chunk) {
            Ok(0) => {
                self.eof = true;
                Ok(false)
            }
            Ok(n) => {
                self.frames.extend(&chunk[..n]);
                Ok(true)
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) => {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Wait until [`FrameReceiver::receive`] can return without blocking, at most `timeout`.
    ///
    /// Nothing is consumed. True means a complete frame is buffered or the peer hung up.
    pub fn poll(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.frames.has_frame() || self.eof {
                return Ok(true);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(false);
            }
            self.fill(Some(left))?;
        }
    }

    /// Block until a frame arrives and decode it.
    ///
    /// A frame that does not decode is an [`Error::MalformedPacket`], the following frames are
    /// still readable. Hang up, including a hang up in the middle of a frame, is
    /// [`Error::TransportClosed`].
    pub fn receive(&mut self) -> Result<Packet> {
        loop {
            if let Some(payload) = self.frames.next_frame() {
                return Packet::decode(&payload);
            }
            if self.eof {
                if self.frames.pending() > 0 {
                    relay_debug!(target: "transport", "{} bytes of truncated frame dropped", self.frames.pending());
                }
                return Err(Error::TransportClosed);
            }
            self.fill(None)?;
        }
    }

    /// Receive with a deadline, `None` if no frame arrived in time.
    pub fn receive_timeout(&mut self, timeout: Duration) -> Result<Option<Packet>> {
        if self.poll(timeout)? {
            self.receive().map(Some)
        } else {
            Ok(None)
        }
    }
}

pub type Closer = Box<dyn Fn() -> io::Result<()> + Send + Sync>;

struct SenderInner {
    writer: Mutex<Box<dyn Write + Send>>,
    closer: Option<Closer>,
    closed: AtomicBool,
}

/// Write half of a connection. Clones share the underlying stream, frames written by different
/// clones never interleave.
#[derive(Clone)]
pub struct FrameSender {
    inner: Arc<SenderInner>,
}

impl FrameSender {
    pub fn new(writer: impl Write + Send + 'static, closer: Option<Closer>) -> Self {
        Self {
            inner: Arc::new(SenderInner {
                writer: Mutex::new(Box::new(writer)),
                closer,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Sender whose writes give up after `timeout`, so a peer that stops reading can't hold the
    /// writer forever.
    pub fn with_write_timeout(
        writer: impl RawWrite + 'static,
        timeout: Duration,
        closer: Option<Closer>,
    ) -> Self {
        Self::new(TimeoutWriter::new(writer, timeout), closer)
    }

    /// Write a packet as a single frame.
    /// Termination signals are held back until the frame is written.
    ///
    /// A failed write may leave part of a frame in the stream, the sender is closed then.
    pub fn send(&self, packet: &Packet) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }
        let frame = frame::encode(&packet.encode()?)?;

        let _guard = SignalGuard::termination();
        let mut writer = self.inner.writer.lock().unwrap();
        if let Err(e) = writer.write_all(&frame).and_then(|_| writer.flush()) {
            drop(writer);
            relay_debug!(target: "transport", "write failed, close connection: {e}");
            self.close();
            return Err(e.into());
        }
        Ok(())
    }

    pub fn send_message(&self, msg: &Message) -> Result<()> {
        self.send(&msg.to_packet()?)
    }

    /// Shut the stream down, the reading side observes a hang up. Repeated calls do nothing.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(closer) = self.inner.closer.as_ref() {
            muted_error!(closer().map_err(Error::from), "close connection:");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// True if both senders write to the same connection.
    pub fn same_as(&self, other: &FrameSender) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Socket a [`Connection`] can be made of.
pub trait Stream: Read + Write + AsRawFd + Send + Sync + Sized + 'static {
    fn try_clone(&self) -> io::Result<Self>;
    fn shutdown(&self) -> io::Result<()>;
    fn peer(&self) -> String;

    /// Called once before the stream is used.
    fn prepare(&self) -> io::Result<()> {
        Ok(())
    }
}

impl Stream for TcpStream {
    fn try_clone(&self) -> io::Result<Self> {
        TcpStream::try_clone(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn peer(&self) -> String {
        self.peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "tcp".to_string())
    }

    fn prepare(&self) -> io::Result<()> {
        // accepted from a non-blocking listener
        self.set_nonblocking(false)?;
        self.set_nodelay(true)
    }
}

impl Stream for UnixStream {
    fn try_clone(&self) -> io::Result<Self> {
        UnixStream::try_clone(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        UnixStream::shutdown(self, Shutdown::Both)
    }

    fn peer(&self) -> String {
        self.peer_addr()
            .ok()
            .and_then(|addr| addr.as_pathname().map(|p| p.display().to_string()))
            .unwrap_or_else(|| "unix".to_string())
    }

    fn prepare(&self) -> io::Result<()> {
        self.set_nonblocking(false)
    }
}

/// Bidirectional framed connection.
pub struct Connection {
    receiver: FrameReceiver,
    sender: FrameSender,
    peer: String,
}

impl Connection {
    pub fn from_stream<S: Stream>(stream: S) -> Result<Self> {
        stream.prepare()?;
        let peer = stream.peer();
        let reader = stream.try_clone()?;
        let handle = stream.try_clone()?;
        Ok(Self {
            receiver: FrameReceiver::new(reader),
            sender: FrameSender::with_write_timeout(
                stream,
                DEFAULT_WRITE_TIMEOUT,
                Some(Box::new(move || handle.shutdown())),
            ),
            peer,
        })
    }

    /// Connection over a pair of pipes. Closing it only stops further writes.
    pub fn from_pipes(
        reader: impl RawRead + 'static,
        writer: impl RawWrite + 'static,
        peer: impl Into<String>,
    ) -> Self {
        Self {
            receiver: FrameReceiver::new(reader),
            sender: FrameSender::with_write_timeout(writer, DEFAULT_WRITE_TIMEOUT, None),
            peer: peer.into(),
        }
    }

    /// Connection over the process standard input and output.
    ///
    /// Descriptors are duplicated, reads bypass the buffered [`std::io::Stdin`] so the read
    /// timeout sees every byte.
    pub fn stdio() -> Result<Self> {
        let reader = os_pipe::dup_stdin()?;
        let writer = os_pipe::dup_stdout()?;
        Ok(Self::from_pipes(reader, writer, "stdio"))
    }

    pub fn connect(addr: &Address) -> Result<Self> {
        match addr {
            Address::Tcp(host, port) => Self::from_stream(TcpStream::connect((host.as_str(), *port))?),
            Address::Unix(path) => Self::from_stream(UnixStream::connect(path)?),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    pub fn receiver(&mut self) -> &mut FrameReceiver {
        &mut self.receiver
    }

    pub fn send(&self, packet: &Packet) -> Result<()> {
        self.sender.send(packet)
    }

    pub fn send_message(&self, msg: &Message) -> Result<()> {
        self.sender.send_message(msg)
    }

    pub fn receive(&mut self) -> Result<Packet> {
        self.receiver.receive()
    }

    /// Inverse of [`Connection::into_parts`].
    pub fn from_parts(receiver: FrameReceiver, sender: FrameSender, peer: String) -> Self {
        Self {
            receiver,
            sender,
            peer,
        }
    }

    pub fn into_parts(self) -> (FrameReceiver, FrameSender, String) {
        (self.receiver, self.sender, self.peer)
    }
}
