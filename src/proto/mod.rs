pub mod contents;
pub mod message;
pub mod packet;

pub use message::{Body, Message};
pub use packet::{Packet, PROXY};
