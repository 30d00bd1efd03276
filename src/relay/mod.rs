//! Message routing between the debugger and its front-ends.

pub mod accept;
pub mod proxy;
pub mod pump;
pub mod registry;
pub mod server;
pub mod session;

pub use accept::Acceptor;
pub use proxy::{Proxy, ProxyOptions};
pub use registry::{Endpoint, Registry, Role};
pub use server::Server;
pub use session::{Session, SessionConfig, ShutdownReason, State};
