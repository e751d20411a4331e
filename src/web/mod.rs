//! HTTP layer
//!
//! An HTTP/1.x default handler plus the request/response shim that lets the
//! same application code answer plain connections and multiplexed streams.

mod handler;
mod response;
mod shim;

pub use handler::{Application, HttpHandler};
pub use response::{
    strip_hop_by_hop, PlainWriter, PushResponse, ResponseWriter, ServerResponse, StreamWriter,
};
pub use shim::{install, RequestExt, RequestProtocol};
