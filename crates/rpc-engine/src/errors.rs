use control_proto::jsonrpc::RpcErrorObject;
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection is closed")]
    Closed,
    #[error("call was cancelled")]
    Cancelled,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("remote returned an rpc error: {0:?}")]
    Remote(RpcErrorObject),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("method {0} is already registered")]
    DuplicateMethod(String),
}
