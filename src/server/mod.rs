//! Server module
//!
//! Accepts connections, resolves their protocol and routes them either to
//! the default handlers or into a multiplexed session.

mod connection;
mod facade;
mod handler;
mod message;
mod peek;
mod socket;

pub use connection::{ConnectionContext, ConnectionPipeline};
pub use facade::Server;
pub use handler::{DefaultHandler, Dispatcher};
pub use message::{create_channel, ServerHandle, ServerMessage};
pub use peek::PeekStream;
pub use socket::{BoxedIo, Duplex, Socket, SocketHandle, SocketInfo};
