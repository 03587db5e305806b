//! JSON-RPC engine (C5): framing, correlation and async dispatch shared by
//! the signaling gateway's WebSocket peers and its broker-backed room-state
//! mirror. Generalizes the forwarder socket's bounded writer-queue pattern
//! into a transport-agnostic connection object sitting on top of the wire
//! types in [`control_proto::jsonrpc`].

pub mod broker_transport;
pub mod connection;
pub mod errors;
pub mod registry;
pub mod timeout;
pub mod transport;
pub mod ws_transport;

pub use broker_transport::{BrokerClient, BrokerError, BrokerTransport};
pub use connection::Connection;
pub use errors::{ConnectionError, RegistryError};
pub use registry::HandlerRegistry;
pub use timeout::TimeoutConnection;
pub use transport::{ObjectStream, TransportError};
pub use ws_transport::{Frame, WebSocketTransport};
