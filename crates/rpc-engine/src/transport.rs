//! Object-stream transport abstraction (§4.5.1): Open/Read/Write/Close over
//! a framed JSON-RPC message stream. Two implementations live alongside this
//! trait: [`crate::ws_transport::WebSocketTransport`] and
//! [`crate::broker_transport::BrokerTransport`].

use async_trait::async_trait;
use control_proto::RawMessage;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("send queue is full")]
    BufferFull,
    #[error("transport is closed")]
    Closed,
    #[error("write deadline exceeded")]
    WriteTimeout,
    #[error("ping timeout: no pong within the deadline")]
    PingTimeout,
    #[error("transport io error: {0}")]
    Io(String),
}

/// A bidirectional stream of JSON-RPC wire messages.
#[async_trait]
pub trait ObjectStream: Send + Sync {
    /// Idempotent: a second `open` on an already-open stream is a no-op.
    async fn open(&self) -> Result<(), TransportError>;

    /// Reads one message. Any error closes the stream.
    async fn read(&self) -> Result<RawMessage, TransportError>;

    async fn write(&self, msg: RawMessage) -> Result<(), TransportError>;

    /// Idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}
