//! Agent - ships spans to a collector and answers its commands.
//!
//! This example demonstrates:
//! - Connecting through [`ClientFactory`] with background reconnect
//! - Fire-and-forget sends, a typed request and an outbound stream
//! - Answering collector commands on a duplex link
//!
//! Start the collector first (`cargo run --example collector`). Stopping
//! and restarting it shows the client reconnecting; spans sent while
//! disconnected are dropped and counted.

use std::time::Duration;

use agentlink::client::LoggingStateListener;
use agentlink::handshake::{keys, HandshakeProperties};
use agentlink::protocol::Payload;
use agentlink::stream::{NoopListener, StreamContext};
use agentlink::{ClientConfig, ClientFactory, CommandDispatcher, ConnectionConfig};
use serde::{Deserialize, Serialize};

const KIND_SPAN: u16 = 40;
const KIND_AGENT_INFO: u16 = 41;
const KIND_THREAD_COUNT: u16 = 50;
const KIND_ACTIVE_REQUESTS: u16 = 60;

#[derive(Serialize, Debug)]
struct Span {
    trace_id: String,
    rpc: String,
    elapsed_ms: u32,
}

#[derive(Serialize, Debug)]
struct AgentInfo {
    hostname: String,
    pid: u32,
}

#[derive(Deserialize, Debug)]
struct Ack {
    accepted: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let pid = std::process::id();
    let properties = HandshakeProperties::new()
        .with(keys::AGENT_ID, format!("demo-agent-{}", pid))
        .with(keys::APPLICATION_NAME, "demo")
        .with(keys::HOSTNAME, "localhost")
        .with(keys::PID, pid)
        .with(keys::SUPPORT_COMMAND, true);

    let commands = CommandDispatcher::new().handle(KIND_THREAD_COUNT, |_payload, ctx| async move {
        let threads = std::thread::available_parallelism().map_or(1, |n| n.get() as u32);
        ctx.reply(&threads)
    });

    let config = ClientConfig::default()
        .with_connection(ConnectionConfig::local())
        .with_properties(properties);
    let client = ClientFactory::new(config)
        .with_dispatcher(commands)
        .with_state_listener(LoggingStateListener)
        .connect("127.0.0.1:9994".parse()?)
        .await?;

    if client.is_connected() {
        let info = AgentInfo {
            hostname: "localhost".to_string(),
            pid,
        };
        let ack: Ack = client
            .request(Payload::encode(KIND_AGENT_INFO, &info)?)
            .await?
            .await?
            .decode()?;
        println!("collector accepted agent: {}", ack.accepted);
    }

    let mut active: Option<StreamContext> = None;
    let mut tick = tokio::time::interval(Duration::from_millis(500));
    for seq in 0u32.. {
        tokio::select! {
            _ = tick.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        let span = Span {
            trace_id: format!("demo-agent-{}^{}", pid, seq),
            rpc: "/checkout".to_string(),
            elapsed_ms: 5 + seq % 40,
        };
        if let Err(e) = client.send(Payload::encode(KIND_SPAN, &span)?).await {
            eprintln!("span {} not sent: {}", seq, e);
        }

        if active.as_ref().is_some_and(|s| s.state().is_terminal()) {
            active = None;
        }
        if !client.is_connected() {
            active = None;
            continue;
        }
        if active.is_none() {
            match client
                .open_stream(Payload::empty(KIND_ACTIVE_REQUESTS), NoopListener)
                .await
            {
                Ok(stream) => active = Some(stream),
                Err(e) => eprintln!("could not open stream: {}", e),
            }
        }
        if let Some(stream) = &active {
            if stream.is_connected() {
                let sample = Payload::encode(KIND_ACTIVE_REQUESTS, &(seq % 8))?;
                if let Err(e) = stream.send(sample).await {
                    eprintln!("stream {}: {}", stream.id(), e);
                }
            }
        }
    }

    println!("dropped {} spans while disconnected", client.dropped_sends());
    client.close();
    Ok(())
}
