//! Collector side: accepts agent connections and routes their commands.
//!
//! ```text
//! TcpListener ─► accept loop ─► Connection::accept (handshake policy)
//!                                   │
//!                                   ├─► registry (live connections)
//!                                   └─► CommandDispatcher (shared)
//! ```

mod context;
mod dispatcher;

pub use context::RequestContext;
pub use dispatcher::{
    BoxFuture, CommandDispatcher, MessageHandler, RequestHandler, StreamHandler, TypedHandler,
};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::connection::{wait_closed, Connection, ConnectionConfig};
use crate::error::Result;
use crate::handshake::{DefaultHandshakePolicy, HandshakePolicy};

/// Acceptor settings.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Settings applied to every accepted connection.
    pub connection: ConnectionConfig,
}

impl ServerConfig {
    /// Set the per-connection settings.
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }
}

type Registry = Arc<Mutex<HashMap<u64, Connection>>>;

/// Pause after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Listening socket plus the registry of handshaken connections.
pub struct ServerAcceptor {
    local_addr: SocketAddr,
    registry: Registry,
    accept_task: JoinHandle<()>,
}

impl ServerAcceptor {
    /// Bind and start accepting with the default handshake policy.
    pub async fn bind(
        addr: SocketAddr,
        config: ServerConfig,
        dispatcher: CommandDispatcher,
    ) -> Result<Self> {
        Self::bind_with_policy(addr, config, dispatcher, Arc::new(DefaultHandshakePolicy)).await
    }

    /// Bind and start accepting; `policy` decides each handshake.
    pub async fn bind_with_policy(
        addr: SocketAddr,
        config: ServerConfig,
        dispatcher: CommandDispatcher,
        policy: Arc<dyn HandshakePolicy>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));

        let accept_task = tokio::spawn(accept_loop(
            listener,
            config,
            Arc::new(dispatcher),
            policy,
            registry.clone(),
        ));

        tracing::info!("collector listening on {}", local_addr);
        Ok(Self {
            local_addr,
            registry,
            accept_task,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Snapshot of the live connections.
    pub fn connections(&self) -> Vec<Connection> {
        self.registry.lock().values().cloned().collect()
    }

    /// First live connection whose handshake carried `key == value`.
    ///
    /// Used to pick the agent a server-initiated command goes to.
    pub fn find_by_property(&self, key: &str, value: impl Into<Value>) -> Option<Connection> {
        let value = value.into();
        self.registry
            .lock()
            .values()
            .find(|conn| {
                conn.remote_properties()
                    .and_then(|props| props.get(key))
                    .is_some_and(|v| *v == value)
            })
            .cloned()
    }

    /// Stop accepting and close every live connection.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        let connections: Vec<Connection> = self.registry.lock().drain().map(|(_, c)| c).collect();
        for conn in &connections {
            conn.close();
        }
        tracing::info!(
            "collector on {} shut down, closed {} connections",
            self.local_addr,
            connections.len()
        );
    }
}

impl Drop for ServerAcceptor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: ServerConfig,
    dispatcher: Arc<CommandDispatcher>,
    policy: Arc<dyn HandshakePolicy>,
    registry: Registry,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("accept failed: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };

        tokio::spawn(serve(
            stream,
            peer,
            config.connection.clone(),
            dispatcher.clone(),
            policy.clone(),
            registry.clone(),
        ));
    }
}

async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    config: ConnectionConfig,
    dispatcher: Arc<CommandDispatcher>,
    policy: Arc<dyn HandshakePolicy>,
    registry: Registry,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("set_nodelay for {}: {}", peer, e);
    }

    let conn = match Connection::accept(stream, Some(peer), config, policy, Some(dispatcher)).await
    {
        Ok(conn) => conn,
        Err(e) => {
            tracing::info!("handshake with {} failed: {}", peer, e);
            return;
        }
    };

    let id = conn.id();
    let closed = conn.closed_signal();
    registry.lock().insert(id, conn);
    drop_after_close(closed, id, registry).await;
}

async fn drop_after_close(
    closed: tokio::sync::watch::Receiver<bool>,
    id: u64,
    registry: Registry,
) {
    wait_closed(closed).await;
    if registry.lock().remove(&id).is_some() {
        tracing::debug!("connection {} left the registry", id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{keys, HandshakeProperties};

    async fn wait_for_connections(server: &ServerAcceptor, n: usize) {
        for _ in 0..200 {
            if server.connections().len() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} connections, have {}", n, server.connections().len());
    }

    #[tokio::test]
    async fn test_registry_tracks_connections() {
        let server = ServerAcceptor::bind(
            "127.0.0.1:0".parse().unwrap(),
            ServerConfig::default(),
            CommandDispatcher::new(),
        )
        .await
        .unwrap();

        let props = HandshakeProperties::new().with(keys::AGENT_ID, "agent-7");
        let client = Connection::connect(
            server.local_addr(),
            ConnectionConfig::local(),
            props,
            None,
        )
        .await
        .unwrap();

        wait_for_connections(&server, 1).await;
        let found = server.find_by_property(keys::AGENT_ID, "agent-7").unwrap();
        assert!(found.is_connected());
        assert!(server.find_by_property(keys::AGENT_ID, "agent-8").is_none());

        client.close();
        wait_for_connections(&server, 0).await;
    }
}
