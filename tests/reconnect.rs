//! Agent client: synchronous attempts, background reconnect, loss
//! recovery and state notifications.

mod common;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentlink::handshake::{HandshakeDecision, HandshakeProperties};
use agentlink::protocol::{HandshakeCode, Payload};
use agentlink::server::{ServerAcceptor, ServerConfig};
use agentlink::state::ConnectionState;
use agentlink::stream::NoopListener;
use agentlink::{ClientConfig, ClientFactory, CommandDispatcher, TransportError};
use bytes::Bytes;
use tokio::net::TcpListener;

use common::*;

fn fast_config() -> ClientConfig {
    ClientConfig::default()
        .with_connection(test_config())
        .with_reconnect_delay(Duration::from_millis(20), Duration::from_millis(100))
}

/// An address nothing listens on (for now).
async fn vacant_addr() -> SocketAddr {
    let listener = TcpListener::bind(loopback()).await.unwrap();
    listener.local_addr().unwrap()
}

async fn collector_at(addr: SocketAddr) -> ServerAcceptor {
    let (dispatcher, _observed) = collector_dispatcher();
    ServerAcceptor::bind(
        addr,
        ServerConfig::default().with_connection(test_config()),
        dispatcher,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_connects_on_first_attempt() {
    let (server, _observed) = start_collector().await;
    let client = ClientFactory::new(fast_config())
        .connect(server.local_addr())
        .await
        .unwrap();

    assert!(client.is_connected());
    assert_eq!(client.state(), ConnectionState::Connected);
    let echo = client
        .request(Payload::new(KIND_ECHO, Bytes::from_static(b"hi")))
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(echo.body(), b"hi");
}

#[tokio::test]
async fn test_unreachable_collector_goes_to_background() {
    let addr = vacant_addr().await;
    let client = ClientFactory::new(fast_config()).connect(addr).await.unwrap();

    assert_eq!(client.state(), ConnectionState::Reconnecting);
    assert!(matches!(
        client.request(Payload::empty(KIND_ECHO)).await,
        Err(TransportError::NotConnected)
    ));
    assert!(matches!(
        client.open_stream(Payload::empty(KIND_TAIL), NoopListener).await,
        Err(TransportError::NotConnected)
    ));

    client.send(Payload::empty(KIND_SPAN)).await.unwrap();
    client.send(Payload::empty(KIND_SPAN)).await.unwrap();
    assert_eq!(client.dropped_sends(), 2);

    client.close();
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(matches!(
        client.send(Payload::empty(KIND_SPAN)).await,
        Err(TransportError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_background_reconnect_completes_request() {
    let addr = vacant_addr().await;
    let client = ClientFactory::new(fast_config()).connect(addr).await.unwrap();
    assert_eq!(client.state(), ConnectionState::Reconnecting);

    let _server = collector_at(addr).await;

    tokio::time::timeout(
        Duration::from_secs(5),
        client.wait_for(ConnectionState::Connected),
    )
    .await
    .unwrap()
    .unwrap();

    let echo = client
        .request(Payload::new(KIND_ECHO, Bytes::from_static(b"back")))
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(echo.body(), b"back");
}

#[tokio::test]
async fn test_lost_connection_is_replaced() {
    let (server, _observed) = start_collector().await;
    let client = ClientFactory::new(fast_config())
        .connect(server.local_addr())
        .await
        .unwrap();
    let first = client.connection().unwrap();

    assert!(eventually(|| server.connections().len() == 1).await);
    for conn in server.connections() {
        conn.close();
    }

    tokio::time::timeout(Duration::from_secs(2), first.closed())
        .await
        .unwrap();
    assert!(
        eventually(|| client
            .connection()
            .is_some_and(|conn| conn.id() != first.id()))
        .await
    );
    assert!(client.is_connected());

    let echo = client
        .request(Payload::new(KIND_ECHO, Bytes::from_static(b"again")))
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(echo.body(), b"again");
}

#[tokio::test]
async fn test_rejected_handshake_is_returned() {
    let policy = |_remote: &HandshakeProperties| HandshakeDecision {
        code: HandshakeCode::Reject,
        properties: HandshakeProperties::new(),
    };
    let server = ServerAcceptor::bind_with_policy(
        loopback(),
        ServerConfig::default().with_connection(test_config()),
        CommandDispatcher::new(),
        Arc::new(policy),
    )
    .await
    .unwrap();

    let result = ClientFactory::new(fast_config())
        .connect(server.local_addr())
        .await;
    assert!(matches!(result, Err(TransportError::HandshakeRejected)));
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    let addr = vacant_addr().await;
    let config = fast_config()
        .with_sync_connect_attempts(1)
        .with_max_reconnect_attempts(Some(2));
    let client = ClientFactory::new(config).connect(addr).await.unwrap();

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        client.wait_for(ConnectionState::Connected),
    )
    .await
    .unwrap();
    assert!(matches!(outcome, Err(TransportError::ConnectionClosed)));
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_state_listener_sees_transitions() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();

    let addr = vacant_addr().await;
    let client = ClientFactory::new(fast_config())
        .with_state_listener(move |from: ConnectionState, to: ConnectionState| {
            record.lock().unwrap().push((from, to))
        })
        .connect(addr)
        .await
        .unwrap();

    let _server = collector_at(addr).await;
    tokio::time::timeout(
        Duration::from_secs(5),
        client.wait_for(ConnectionState::Connected),
    )
    .await
    .unwrap()
    .unwrap();
    client.close();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            (ConnectionState::New, ConnectionState::Reconnecting),
            (ConnectionState::Reconnecting, ConnectionState::Connected),
            (ConnectionState::Connected, ConnectionState::Closed),
        ]
    );
}
