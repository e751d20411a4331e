//! Stream-socket adaptation
//!
//! Exposes each logical multiplexed stream as a single-connection-like
//! socket so it can flow through code written for one request per socket.

mod adapter;

pub use adapter::{
    dispatch, StreamContext, StreamControl, StreamHandle, StreamShared, StreamSocket, X_FORWARDED_FOR,
};
