//! Shared fixtures: a loopback collector with a small command set.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use agentlink::connection::ConnectionConfig;
use agentlink::handshake::HandshakeProperties;
use agentlink::protocol::Payload;
use agentlink::server::{RequestContext, ServerAcceptor, ServerConfig};
use agentlink::stream::{StreamContext, StreamEvent};
use agentlink::{CommandDispatcher, Connection, Result};
use tokio::sync::mpsc;

pub const KIND_ECHO: u16 = 1;
pub const KIND_HANG: u16 = 2;
pub const KIND_PANIC: u16 = 3;
pub const KIND_ADD_ONE: u16 = 4;
pub const KIND_SPAN: u16 = 20;
pub const KIND_TAIL: u16 = 30;
pub const KIND_REFUSED: u16 = 31;

pub fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Connection settings for tests: no keep-alive, short deadlines.
pub fn test_config() -> ConnectionConfig {
    ConnectionConfig::local().without_ping()
}

async fn explode(_payload: Payload, _ctx: RequestContext) -> Result<Payload> {
    panic!("handler exploded")
}

/// Events seen by the collector.
pub struct Observed {
    pub spans: mpsc::UnboundedReceiver<Payload>,
    pub stream_events: mpsc::UnboundedReceiver<StreamEvent>,
}

pub fn collector_dispatcher() -> (CommandDispatcher, Observed) {
    let (span_tx, spans) = mpsc::unbounded_channel();
    let (event_tx, stream_events) = mpsc::unbounded_channel();

    let dispatcher = CommandDispatcher::new()
        .handle(KIND_ECHO, |payload, _ctx| async move { Ok(payload) })
        .handle(KIND_HANG, |_payload, _ctx| async {
            std::future::pending::<Result<Payload>>().await
        })
        .handle(KIND_PANIC, explode)
        .handle_typed(KIND_ADD_ONE, |n: u64, _ctx| async move { Ok(n + 1) })
        .on_message(KIND_SPAN, move |payload, _ctx| {
            let _ = span_tx.send(payload);
            async { Ok(()) }
        })
        .handle_stream(KIND_TAIL, move |_payload, stream: StreamContext| {
            let tx = event_tx.clone();
            async move {
                stream.set_listener(move |_stream: &StreamContext, event: StreamEvent| {
                    let _ = tx.send(event);
                });
                Ok(())
            }
        })
        .handle_stream(KIND_REFUSED, |_payload, _stream| async {
            Err(agentlink::TransportError::IllegalState("not today".into()))
        });

    (
        dispatcher,
        Observed {
            spans,
            stream_events,
        },
    )
}

pub async fn start_collector() -> (ServerAcceptor, Observed) {
    let (dispatcher, observed) = collector_dispatcher();
    let server = ServerAcceptor::bind(
        loopback(),
        ServerConfig::default().with_connection(test_config()),
        dispatcher,
    )
    .await
    .unwrap();
    (server, observed)
}

pub async fn connect(server: &ServerAcceptor) -> Connection {
    Connection::connect(
        server.local_addr(),
        test_config(),
        HandshakeProperties::new(),
        None,
    )
    .await
    .unwrap()
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}
