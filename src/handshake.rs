//! Handshake: the one-time property exchange after connect.
//!
//! The connecting side sends its [`HandshakeProperties`] as a JSON object
//! and waits for the acceptor's code. The acceptor asks its
//! [`HandshakePolicy`] and answers with `SuccessDuplex`, `SuccessSimplex`
//! or `Reject` plus its own properties.
//!
//! # Example
//!
//! ```
//! use agentlink::handshake::{HandshakeProperties, keys};
//!
//! let props = HandshakeProperties::new()
//!     .with(keys::AGENT_ID, "checkout-7f9c")
//!     .with(keys::PID, 4242)
//!     .with(keys::SUPPORT_COMMAND, true);
//!
//! let bytes = props.to_bytes().unwrap();
//! let back = HandshakeProperties::from_bytes(&bytes).unwrap();
//! assert_eq!(back.get_str(keys::AGENT_ID), Some("checkout-7f9c"));
//! ```

use std::time::Duration;

use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::error::{Result, TransportError};
use crate::protocol::{Frame, HandshakeCode};
use crate::writer::WriterHandle;

/// Well-known property keys.
pub mod keys {
    /// Unique agent identifier.
    pub const AGENT_ID: &str = "agentId";
    /// Logical application the agent belongs to.
    pub const APPLICATION_NAME: &str = "applicationName";
    /// Host the agent runs on.
    pub const HOSTNAME: &str = "hostName";
    /// Agent address as seen by the agent.
    pub const IP: &str = "ip";
    /// Agent process id.
    pub const PID: &str = "pid";
    /// Agent software version.
    pub const VERSION: &str = "version";
    /// Wire protocol version.
    pub const PROTOCOL_VERSION: &str = "protocolVersion";
    /// Whether the agent accepts commands from the collector.
    pub const SUPPORT_COMMAND: &str = "supportCommand";
    /// Largest frame body the sender accepts.
    pub const MAX_BODY_SIZE: &str = "maxBodySize";
}

/// Protocol version advertised by this crate.
pub const PROTOCOL_VERSION: i64 = 1;

/// Correlation ID used by the handshake exchange.
pub(crate) const HANDSHAKE_REQUEST_ID: u32 = 1;

/// Ordered map of string keys to scalar values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandshakeProperties {
    values: Map<String, Value>,
}

impl HandshakeProperties {
    /// Empty property set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a property, builder style.
    ///
    /// Non-scalar values (arrays, objects) are ignored with a warning.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Add or replace a property.
    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        if !is_scalar(&value) {
            tracing::warn!("ignoring non-scalar handshake property {}", key);
            return;
        }
        self.values.insert(key.to_string(), value);
    }

    /// Raw value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// String value.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Integer value.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    /// Boolean value.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Number of properties.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Encode as a JSON object.
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(&self.values)?))
    }

    /// Decode a JSON object; an empty body is an empty set.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::new());
        }
        let values: Map<String, Value> = serde_json::from_slice(bytes)?;
        if let Some((key, _)) = values.iter().find(|(_, v)| !is_scalar(v)) {
            return Err(TransportError::ProtocolAnomaly(format!(
                "handshake property {} is not a scalar",
                key
            )));
        }
        Ok(Self { values })
    }
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

/// Outcome of a completed handshake.
#[derive(Debug, Clone)]
pub struct Handshake {
    code: HandshakeCode,
    local: HandshakeProperties,
    remote: HandshakeProperties,
}

impl Handshake {
    pub(crate) fn new(
        code: HandshakeCode,
        local: HandshakeProperties,
        remote: HandshakeProperties,
    ) -> Self {
        Self {
            code,
            local,
            remote,
        }
    }

    /// Negotiated code.
    pub fn code(&self) -> HandshakeCode {
        self.code
    }

    /// Whether the link carries commands in both directions.
    pub fn is_duplex(&self) -> bool {
        self.code == HandshakeCode::SuccessDuplex
    }

    /// Largest body the peer accepts, if it said so.
    pub fn remote_max_body_size(&self) -> Option<u32> {
        self.remote
            .get_i64(keys::MAX_BODY_SIZE)
            .and_then(|limit| u32::try_from(limit).ok())
    }

    /// Properties this side sent.
    pub fn local(&self) -> &HandshakeProperties {
        &self.local
    }

    /// Properties the peer sent.
    pub fn remote(&self) -> &HandshakeProperties {
        &self.remote
    }
}

/// Acceptor-side decision for an incoming handshake.
#[derive(Debug, Clone)]
pub struct HandshakeDecision {
    /// Code to answer with.
    pub code: HandshakeCode,
    /// Properties sent back to the connecting side.
    pub properties: HandshakeProperties,
}

/// Decides how to answer a connecting peer.
pub trait HandshakePolicy: Send + Sync + 'static {
    /// Inspect the peer's properties and pick a code.
    fn decide(&self, remote: &HandshakeProperties) -> HandshakeDecision;
}

impl<F> HandshakePolicy for F
where
    F: Fn(&HandshakeProperties) -> HandshakeDecision + Send + Sync + 'static,
{
    fn decide(&self, remote: &HandshakeProperties) -> HandshakeDecision {
        self(remote)
    }
}

/// Accepts every peer that speaks a compatible protocol version.
///
/// The link is duplex unless the peer advertises
/// `supportCommand: false`.
#[derive(Debug, Clone, Default)]
pub struct DefaultHandshakePolicy;

impl HandshakePolicy for DefaultHandshakePolicy {
    fn decide(&self, remote: &HandshakeProperties) -> HandshakeDecision {
        let properties = HandshakeProperties::new().with(keys::PROTOCOL_VERSION, PROTOCOL_VERSION);

        let code = match remote.get_i64(keys::PROTOCOL_VERSION) {
            Some(v) if v != PROTOCOL_VERSION => HandshakeCode::Reject,
            _ if remote.get_bool(keys::SUPPORT_COMMAND) == Some(false) => {
                HandshakeCode::SuccessSimplex
            }
            _ => HandshakeCode::SuccessDuplex,
        };

        HandshakeDecision { code, properties }
    }
}

/// Run the connecting side of the handshake.
///
/// `reply` receives the first handshake frame the reader sees.
pub(crate) async fn initiate(
    writer: &WriterHandle,
    reply: oneshot::Receiver<Frame>,
    mut local: HandshakeProperties,
    timeout: Duration,
) -> Result<Handshake> {
    // Before the handshake the writer limit is the local inbound limit.
    local.insert(keys::MAX_BODY_SIZE, writer.body_limit());
    writer
        .send(&Frame::HandshakeRequest {
            request_id: HANDSHAKE_REQUEST_ID,
            properties: local.to_bytes()?,
        })
        .await?;

    let frame = match tokio::time::timeout(timeout, reply).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(_)) => return Err(TransportError::ConnectionClosed),
        Err(_) => return Err(TransportError::HandshakeTimeout),
    };

    match frame {
        Frame::HandshakeResponse {
            request_id,
            code,
            properties,
        } => {
            if request_id != HANDSHAKE_REQUEST_ID {
                tracing::warn!("handshake response for request {}", request_id);
            }
            if !code.is_success() {
                return Err(TransportError::HandshakeRejected);
            }
            let remote = HandshakeProperties::from_bytes(&properties)?;
            Ok(Handshake::new(code, local, remote))
        }
        other => Err(TransportError::UnexpectedFrame(other.frame_type())),
    }
}

/// Run the accepting side of the handshake.
pub(crate) async fn answer(
    writer: &WriterHandle,
    request: oneshot::Receiver<Frame>,
    policy: &dyn HandshakePolicy,
    timeout: Duration,
) -> Result<Handshake> {
    let frame = match tokio::time::timeout(timeout, request).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(_)) => return Err(TransportError::ConnectionClosed),
        Err(_) => return Err(TransportError::HandshakeTimeout),
    };

    let (request_id, body) = match frame {
        Frame::HandshakeRequest {
            request_id,
            properties,
        } => (request_id, properties),
        other => return Err(TransportError::UnexpectedFrame(other.frame_type())),
    };

    let remote = HandshakeProperties::from_bytes(&body)?;
    let mut decision = policy.decide(&remote);
    if decision.code.is_success() {
        decision
            .properties
            .insert(keys::MAX_BODY_SIZE, writer.body_limit());
    }

    writer
        .send(&Frame::HandshakeResponse {
            request_id,
            code: decision.code,
            properties: decision.properties.to_bytes()?,
        })
        .await?;

    if !decision.code.is_success() {
        tracing::info!("handshake rejected: {:?}", remote.get_str(keys::AGENT_ID));
        return Err(TransportError::HandshakeRejected);
    }
    Ok(Handshake::new(decision.code, decision.properties, remote))
}
