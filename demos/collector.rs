//! Collector - accepts agents, stores their spans and polls them.
//!
//! This example demonstrates:
//! - Binding a [`ServerAcceptor`] with a command dispatcher
//! - Fire-and-forget span messages, typed requests and an inbound stream
//! - Collector-initiated commands over duplex links
//!
//! # Running
//!
//! ```text
//! RUST_LOG=info cargo run --example collector
//! RUST_LOG=info cargo run --example agent
//! ```

use std::time::Duration;

use agentlink::handshake::keys;
use agentlink::protocol::Payload;
use agentlink::server::{ServerAcceptor, ServerConfig};
use agentlink::stream::{StreamContext, StreamEvent};
use agentlink::{CommandDispatcher, ConnectionConfig};
use serde::{Deserialize, Serialize};

const KIND_SPAN: u16 = 40;
const KIND_AGENT_INFO: u16 = 41;
const KIND_THREAD_COUNT: u16 = 50;
const KIND_ACTIVE_REQUESTS: u16 = 60;

#[derive(Deserialize, Debug)]
struct Span {
    trace_id: String,
    rpc: String,
    elapsed_ms: u32,
}

#[derive(Deserialize, Debug)]
struct AgentInfo {
    hostname: String,
    pid: u32,
}

#[derive(Serialize, Debug)]
struct Ack {
    accepted: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let dispatcher = CommandDispatcher::new()
        .on_message(KIND_SPAN, |payload, ctx| async move {
            let span: Span = payload.decode()?;
            let agent = ctx
                .remote_properties()
                .and_then(|props| props.get_str(keys::AGENT_ID))
                .unwrap_or("?")
                .to_string();
            println!(
                "[{}] {} {} took {}ms",
                agent, span.trace_id, span.rpc, span.elapsed_ms
            );
            Ok(())
        })
        .handle_typed(KIND_AGENT_INFO, |info: AgentInfo, _ctx| async move {
            println!("agent on {} (pid {}) registered", info.hostname, info.pid);
            Ok(Ack { accepted: true })
        })
        .handle_stream(KIND_ACTIVE_REQUESTS, |_payload, stream: StreamContext| async move {
            stream.set_listener(|stream: &StreamContext, event: StreamEvent| match event {
                StreamEvent::Data(payload) => match payload.decode::<u32>() {
                    Ok(active) => println!("stream {}: {} active requests", stream.id(), active),
                    Err(e) => eprintln!("stream {}: bad sample: {}", stream.id(), e),
                },
                StreamEvent::Closed(code) => println!("stream {} closed ({:?})", stream.id(), code),
                _ => {}
            });
            Ok(())
        });

    let config = ServerConfig::default().with_connection(ConnectionConfig::local());
    let server = ServerAcceptor::bind("127.0.0.1:9994".parse()?, config, dispatcher).await?;
    println!("collector listening on {}", server.local_addr());

    let mut poll = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = poll.tick() => {
                for conn in server.connections() {
                    if !conn.handshake().is_some_and(|h| h.is_duplex()) {
                        continue;
                    }
                    match conn.request(Payload::empty(KIND_THREAD_COUNT)).await {
                        Ok(response) => match response.await.and_then(|p| p.decode::<u32>()) {
                            Ok(threads) => println!("{:?}: {} threads", conn.peer_addr(), threads),
                            Err(e) => eprintln!("{:?}: thread count failed: {}", conn.peer_addr(), e),
                        },
                        Err(e) => eprintln!("{:?}: {}", conn.peer_addr(), e),
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    server.shutdown();
    Ok(())
}
