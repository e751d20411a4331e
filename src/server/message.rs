//! Server control messages
//!
//! A running server is controlled through a message channel, so callers
//! never hold a lock on the accept loop.

use std::net::SocketAddr;

use tokio::sync::{mpsc, watch};

use crate::common::{Result, SwitchError};

/// Messages accepted by a running server
#[derive(Debug)]
pub enum ServerMessage {
    /// Stop accepting, drain in-flight connections and exit
    Shutdown,
}

/// Server control handle
#[derive(Debug, Clone)]
pub struct ServerHandle {
    /// Message sender
    sender: mpsc::Sender<ServerMessage>,
    /// Bound listener address
    local_addr: SocketAddr,
    /// Flips to `true` once the accept loop exited
    stopped: watch::Receiver<bool>,
}

impl ServerHandle {
    /// Create a new server handle
    pub fn new(
        sender: mpsc::Sender<ServerMessage>,
        local_addr: SocketAddr,
        stopped: watch::Receiver<bool>,
    ) -> Self {
        Self {
            sender,
            local_addr,
            stopped,
        }
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send a message to the server
    ///
    /// # Parameters
    ///
    /// * `message` - Message to send
    ///
    /// # Returns
    ///
    /// Returns an error if the server already exited
    pub async fn send(&self, message: ServerMessage) -> Result<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| SwitchError::Other("Failed to send message to server".to_string()))
    }

    /// Wait until the server exited
    pub async fn stopped(&self) {
        let mut stopped = self.stopped.clone();
        // Err means the server task is gone, which is just as final
        let _ = stopped.wait_for(|done| *done).await;
    }

    /// Shut the server down and wait for the drain to finish
    pub async fn shutdown(&self) -> Result<()> {
        if *self.stopped.borrow() {
            return Ok(());
        }
        self.send(ServerMessage::Shutdown).await?;
        self.stopped().await;
        Ok(())
    }
}

/// Create a new server message channel
///
/// # Returns
///
/// Returns the sender and receiver pair
pub fn create_channel() -> (mpsc::Sender<ServerMessage>, mpsc::Receiver<ServerMessage>) {
    mpsc::channel(16)
}
