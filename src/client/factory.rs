use std::net::SocketAddr;
use std::sync::Arc;

use super::{Client, ClientConfig, ClientInner, StateListener};
use crate::error::{Result, TransportError};
use crate::server::CommandDispatcher;

/// Builds [`Client`]s that share one configuration.
///
/// A dispatcher is only needed when the agent answers commands from the
/// collector (duplex links).
pub struct ClientFactory {
    config: ClientConfig,
    dispatcher: Option<Arc<CommandDispatcher>>,
    listeners: Vec<Arc<dyn StateListener>>,
}

impl ClientFactory {
    /// Create a factory.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            dispatcher: None,
            listeners: Vec::new(),
        }
    }

    /// Handle inbound commands with `dispatcher`.
    pub fn with_dispatcher(mut self, dispatcher: CommandDispatcher) -> Self {
        self.dispatcher = Some(Arc::new(dispatcher));
        self
    }

    /// Attach a state listener to every client this factory creates.
    pub fn with_state_listener(mut self, listener: impl StateListener) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// Settings used for new clients.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connect to the collector at `addr`.
    ///
    /// Makes up to `sync_connect_attempts` attempts back to back. If all
    /// of them fail the client is returned in `Reconnecting` state with a
    /// background reconnect loop running.
    ///
    /// # Errors
    ///
    /// Only `HandshakeRejected`: a collector that refuses the agent is
    /// not retried.
    pub async fn connect(&self, addr: SocketAddr) -> Result<Client> {
        let inner = ClientInner::new(
            addr,
            self.config.clone(),
            self.dispatcher.clone(),
            self.listeners.clone(),
        );

        for attempt in 1..=self.config.sync_connect_attempts {
            match inner.connect_once().await {
                Ok(conn) => {
                    inner.install(conn);
                    tracing::info!("connected to {} on attempt {}", addr, attempt);
                    return Ok(Client::from_inner(inner));
                }
                Err(TransportError::HandshakeRejected) => {
                    inner.close();
                    return Err(TransportError::HandshakeRejected);
                }
                Err(e) => {
                    tracing::warn!(
                        "connect to {} failed (attempt {}/{}): {}",
                        addr,
                        attempt,
                        self.config.sync_connect_attempts,
                        e
                    );
                }
            }
        }

        tracing::warn!("{} unreachable, reconnecting in the background", addr);
        inner.start_reconnecting();
        Ok(Client::from_inner(inner))
    }
}
