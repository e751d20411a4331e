//! Default connection handlers
//!
//! Sockets that do not (or no longer) need protocol switching are delegated
//! to an ordered list of default handlers through a single dispatch entry
//! point.

use std::sync::Arc;

use futures::future::{self, BoxFuture};
use log::{debug, warn};

use super::socket::{Socket, SocketInfo};
use crate::common::{Result, SwitchError};

/// Handler receiving pass-through connections and adapted streams alike
#[cfg_attr(test, mockall::automock)]
pub trait DefaultHandler: Send + Sync {
    /// Whether this handler wants the socket
    fn accepts(&self, _info: &SocketInfo) -> bool {
        true
    }

    /// Take ownership of the socket
    ///
    /// The returned future is driven on its own task.
    fn handle(&self, socket: Socket) -> BoxFuture<'static, ()>;
}

/// Ordered list of default handlers
///
/// The first handler whose [`DefaultHandler::accepts`] returns true receives
/// the socket.
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Vec<Arc<dyn DefaultHandler>>,
}

impl Dispatcher {
    /// Create a dispatcher
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `handlers` is empty.
    pub fn new(handlers: Vec<Arc<dyn DefaultHandler>>) -> Result<Self> {
        if handlers.is_empty() {
            return Err(SwitchError::Config(
                "at least one default connection handler is required".to_string(),
            ));
        }

        Ok(Self { handlers })
    }

    /// Hand `socket` to the first accepting handler
    ///
    /// The handler is invoked synchronously; only the returned future is
    /// left to the caller. A socket nobody accepts is dropped, which closes it.
    pub fn dispatch(&self, socket: Socket) -> BoxFuture<'static, ()> {
        match self.handlers.iter().find(|h| h.accepts(&socket.info)) {
            Some(handler) => {
                debug!(
                    "Dispatching {} socket of connection {}",
                    if socket.info.is_stream() { "stream" } else { "raw" },
                    socket.info.connection_id
                );
                handler.handle(socket)
            }
            None => {
                warn!("No default handler accepted connection {}, closing", socket.info.connection_id);
                drop(socket);
                Box::pin(future::ready(()))
            }
        }
    }
}
