//! Context handed to inbound request and message handlers.
//!
//! # Example
//!
//! ```ignore
//! async fn echo(payload: Payload, ctx: RequestContext) -> Result<Payload> {
//!     let text: String = payload.decode()?;
//!     ctx.reply(&text)
//! }
//! ```

use serde::Serialize;

use crate::connection::Connection;
use crate::error::Result;
use crate::handshake::HandshakeProperties;
use crate::protocol::Payload;

/// Context for one inbound request or message.
///
/// Cloneable; handlers may move it into spawned tasks. Responses are the
/// handler's return value, so there is exactly one per request.
#[derive(Clone, Debug)]
pub struct RequestContext {
    connection: Connection,
    request_id: u32,
    kind: u16,
}

impl RequestContext {
    pub(crate) fn new(connection: Connection, request_id: u32, kind: u16) -> Self {
        Self {
            connection,
            request_id,
            kind,
        }
    }

    /// Correlation ID (0 for fire-and-forget messages).
    #[inline]
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// Payload kind of the request.
    #[inline]
    pub fn kind(&self) -> u16 {
        self.kind
    }

    /// Connection the request arrived on.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Handshake properties of the peer that sent the request.
    pub fn remote_properties(&self) -> Option<&HandshakeProperties> {
        self.connection.remote_properties()
    }

    /// Encode a response with the request's kind.
    pub fn reply<T: Serialize>(&self, value: &T) -> Result<Payload> {
        Payload::encode(self.kind, value)
    }
}
