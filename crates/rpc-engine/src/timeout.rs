//! Generic timeout wrapper (§4.5.4): bounds `Call`/`Notify` by a deadline.
//! Cancellation semantics are inherited from [`Connection::call`] — on
//! expiry we cancel the in-flight call the same way an external caller
//! cancelling its own token would.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::errors::ConnectionError;

pub struct TimeoutConnection<C> {
    inner: Arc<Connection<C>>,
    default_timeout: Duration,
}

impl<C: Clone + Send + Sync + 'static> TimeoutConnection<C> {
    #[must_use]
    pub fn new(inner: Arc<Connection<C>>, default_timeout: Duration) -> Self {
        Self { inner, default_timeout }
    }

    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, ConnectionError> {
        self.call_with_timeout(method, params, self.default_timeout).await
    }

    pub async fn call_with_timeout(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value, ConnectionError> {
        let cancel = CancellationToken::new();
        let call_fut = self.inner.call(cancel.clone(), method, params);
        match tokio::time::timeout(timeout, call_fut).await {
            Ok(result) => result,
            Err(_elapsed) => {
                cancel.cancel();
                Err(ConnectionError::Cancelled)
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ConnectionError> {
        self.inner.notify(method, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HandlerRegistry;
    use crate::transport::{ObjectStream, TransportError};
    use async_trait::async_trait;
    use control_proto::jsonrpc::RawMessage;

    struct StallingTransport;

    #[async_trait]
    impl ObjectStream for StallingTransport {
        async fn open(&self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn read(&self) -> Result<RawMessage, TransportError> {
            std::future::pending().await
        }
        async fn write(&self, _msg: RawMessage) -> Result<(), TransportError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn call_with_timeout_times_out_when_no_response_arrives() {
        let registry: Arc<HandlerRegistry<()>> = Arc::new(HandlerRegistry::new());
        let conn = Connection::new(Arc::new(StallingTransport), registry, ());
        conn.open(CancellationToken::new()).await.unwrap();
        let timeout_conn = TimeoutConnection::new(conn, Duration::from_millis(20));
        let result = timeout_conn.call("join", None).await;
        assert!(matches!(result, Err(ConnectionError::Cancelled)));
    }
}
