pub mod client;
pub mod config;
pub mod error;
pub mod log;
pub mod proto;
pub mod relay;
pub mod supervisor;
pub mod transport;
