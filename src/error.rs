use std::io;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- transport errors ------------------------------------------
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
    #[error("transport closed")]
    TransportClosed,
    #[error(transparent)]
    IO(io::Error),

    // --------------------------------- routing errors --------------------------------------------
    #[error("endpoint `{0}` already registered")]
    DuplicateName(String),
    #[error("endpoint `{0}` is not connected")]
    RoutingMiss(String),
    #[error("handshake: {0}")]
    Handshake(String),

    #[error("bad address: {0}")]
    BadAddress(String),

    // --------------------------------- caller side errors ----------------------------------------
    #[error("no response for request {0} in {1:?}")]
    RequestTimeout(u64, Duration),

    // --------------------------------- codec errors ----------------------------------------------
    #[error("serialize packet: {0}")]
    Json(#[from] serde_json::Error),

    // --------------------------------- syscall errors --------------------------------------------
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, nix::Error),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected => Error::TransportClosed,
            _ => Error::IO(e),
        }
    }
}

impl Error {
    /// Return a hint to a connection owner - keep reading after error or close the connection.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::MalformedPacket(_) => false,
            Error::DuplicateName(_) => false,
            Error::RoutingMiss(_) => false,
            Error::RequestTimeout(_, _) => false,
            Error::BadAddress(_) => false,
            Error::Json(_) => false,
            Error::Syscall(_, _) => false,

            // connection is unusable after these
            Error::TransportClosed => true,
            Error::IO(_) => true,
            Error::Handshake(_) => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "relay", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "relay", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
