//! Session bootstrapper
//!
//! Builds the multiplexed session for a connection, pins its version and
//! drives its events: every announced stream is adapted and dispatched, a
//! session error destroys the connection, and a closed socket tears down
//! every live adapter.

use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, error, warn};
use metrics::counter;
use tokio::task::JoinSet;

use super::engine::{Session, SessionEngine, SessionEvent, SessionOptions};
use crate::common::Result;
use crate::config::ConnectionOptions;
use crate::protocol::{ProtocolFamily, ProtocolVersion};
use crate::server::{BoxedIo, ConnectionContext, Dispatcher};
use crate::stream::{self, StreamContext, StreamControl, StreamShared};

/// Time handlers get to wind down after their session ended
const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

type Adapted<E> = StreamShared<<<E as SessionEngine>::Session as Session>::Stream>;

/// Session bootstrapper
pub struct Bootstrapper<E: SessionEngine> {
    engine: Arc<E>,
    dispatcher: Arc<Dispatcher>,
    connection: ConnectionOptions,
    x_forwarded_for: bool,
}

impl<E: SessionEngine> Bootstrapper<E> {
    /// Create a new bootstrapper
    ///
    /// # Parameters
    ///
    /// * `engine` - Session engine
    /// * `dispatcher` - Default handlers adapted streams are handed to
    /// * `connection` - Pass-through session options
    /// * `x_forwarded_for` - Append the peer address to synthesized request heads
    pub fn new(
        engine: Arc<E>,
        dispatcher: Arc<Dispatcher>,
        connection: ConnectionOptions,
        x_forwarded_for: bool,
    ) -> Self {
        Self {
            engine,
            dispatcher,
            connection,
            x_forwarded_for,
        }
    }

    /// Run a session over `io` until the connection ends
    ///
    /// A construction failure closes the socket and is reported as an error,
    /// never as a panic.
    ///
    /// # Parameters
    ///
    /// * `io` - Raw duplex, with any peeked bytes still readable
    /// * `ctx` - Connection context
    /// * `family` - Session family
    /// * `version` - Version to pin, `None` to read it from the wire
    pub async fn run(
        &self,
        io: BoxedIo,
        ctx: &ConnectionContext,
        family: ProtocolFamily,
        version: Option<ProtocolVersion>,
    ) -> Result<()> {
        let options = SessionOptions::server(family, self.connection.clone());
        let mut session = match self.engine.create_session(io, options) {
            Ok(session) => session,
            Err(e) => {
                warn!("Failed to create {} session for connection {}: {}", family, ctx.id, e);
                counter!("mux_gate.session.errors", "stage" => "create").increment(1);
                return Err(e);
            }
        };

        if let Some(version) = version {
            debug!("Pinning connection {} to {}", ctx.id, version);
            session.pin_version(version);
        }

        let protocol = ctx.protocol.clone().unwrap_or_else(|| family.to_string());
        let mut live: Vec<Weak<Adapted<E>>> = Vec::new();
        let mut tasks = JoinSet::new();

        let result = loop {
            tokio::select! {
                event = session.next_event() => match event {
                    Some(SessionEvent::Stream(logical)) => {
                        counter!("mux_gate.streams", "family" => family.to_string()).increment(1);

                        let stream_ctx = StreamContext {
                            connection_id: ctx.id,
                            peer_addr: ctx.peer_addr,
                            encrypted: ctx.encrypted,
                            protocol: protocol.clone(),
                            version: session.version().unwrap_or_else(|| family.default_version()),
                            x_forwarded_for: self.x_forwarded_for,
                        };

                        let (adapter, task) = stream::dispatch(logical, &stream_ctx, &self.dispatcher);
                        live.retain(|w| w.strong_count() > 0);
                        live.push(adapter);
                        tasks.spawn(task);
                    }
                    Some(SessionEvent::Error(e)) => {
                        warn!("Session error on connection {}: {}", ctx.id, e);
                        counter!("mux_gate.session.errors", "stage" => "session").increment(1);
                        break Err(e);
                    }
                    None => {
                        debug!("Connection {} closed", ctx.id);
                        break Ok(());
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Stream handler on connection {} panicked", ctx.id);
                        }
                    }
                }
            }
        };

        // Dropping the session releases the raw socket
        drop(session);

        let torn_down = teardown(&live);
        if torn_down > 0 {
            debug!("Tore down {} live stream(s) of connection {}", torn_down, ctx.id);
        }

        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(STREAM_DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("Stream handlers of connection {} did not finish, aborting them", ctx.id);
        }

        result
    }
}

/// Destroy every adapter still alive
///
/// # Returns
///
/// The number of adapters that were torn down by this call
fn teardown<S: crate::session::LogicalStream>(live: &[Weak<StreamShared<S>>]) -> usize {
    let mut count = 0;
    for adapter in live.iter().filter_map(Weak::upgrade) {
        if !adapter.is_destroyed() {
            adapter.destroy();
            count += 1;
        }
    }
    count
}
