//! Multiplexed sessions
//!
//! The engine seam ([`SessionEngine`], [`Session`], [`LogicalStream`]), the
//! bootstrapper that wires a session's lifecycle to its connection, and a
//! reference HTTP/2 engine.

mod bootstrap;
mod engine;
pub mod http2;

pub use bootstrap::Bootstrapper;
pub use engine::{
    LogicalStream, PushedStream, RequestHead, Session, SessionEngine, SessionEvent, SessionOptions,
};
pub use http2::{H2Engine, H2Session, H2Stream};
