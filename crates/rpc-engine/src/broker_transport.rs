//! Broker object-stream implementation (§4.5.1b): one shared inbound
//! stream of notifications destined for this peer, one outbound stream of
//! requests this peer emits, with an optional consumer group for
//! load-balanced consumption and idle-entry trimming.

use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use control_proto::jsonrpc::RawMessage;
use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::transport::{ObjectStream, TransportError};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker is unavailable: {0}")]
    Unavailable(String),
}

impl From<BrokerError> for TransportError {
    fn from(err: BrokerError) -> Self {
        TransportError::Io(err.to_string())
    }
}

pub type BrokerEntryStream = Pin<Box<dyn Stream<Item = Result<(String, Vec<u8>), BrokerError>> + Send>>;

/// Minimal broker operations the JSON-RPC engine needs: publish an entry,
/// subscribe (optionally as part of a consumer group), trim acknowledged
/// entries older than a given id.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn publish(&self, stream: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    async fn subscribe(&self, stream: &str, group: Option<&str>) -> Result<BrokerEntryStream, BrokerError>;

    async fn trim_before(&self, stream: &str, before_id: &str) -> Result<(), BrokerError>;
}

/// Object stream backed by two broker streams: reads come off
/// `inbound_stream`, writes go to `outbound_stream`. A background task
/// periodically trims `inbound_stream` up to the last-acknowledged entry.
pub struct BrokerTransport {
    broker: std::sync::Arc<dyn BrokerClient>,
    inbound_stream: String,
    outbound_stream: String,
    consumer_group: Option<String>,
    subscription: tokio::sync::Mutex<Option<BrokerEntryStream>>,
    last_acked: std::sync::Arc<Mutex<Option<String>>>,
    trim_task: tokio::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    idle_trim_interval: Duration,
}

impl BrokerTransport {
    #[must_use]
    pub fn new(
        broker: std::sync::Arc<dyn BrokerClient>,
        inbound_stream: impl Into<String>,
        outbound_stream: impl Into<String>,
        consumer_group: Option<String>,
        idle_trim_interval: Duration,
    ) -> Self {
        Self {
            broker,
            inbound_stream: inbound_stream.into(),
            outbound_stream: outbound_stream.into(),
            consumer_group,
            subscription: tokio::sync::Mutex::new(None),
            last_acked: std::sync::Arc::new(Mutex::new(None)),
            trim_task: tokio::sync::Mutex::new(None),
            idle_trim_interval,
        }
    }
}

#[async_trait]
impl ObjectStream for BrokerTransport {
    async fn open(&self) -> Result<(), TransportError> {
        let mut subscription = self.subscription.lock().await;
        if subscription.is_some() {
            return Ok(());
        }
        let stream = self.broker.subscribe(&self.inbound_stream, self.consumer_group.as_deref()).await?;
        *subscription = Some(stream);
        drop(subscription);

        let mut trim_task = self.trim_task.lock().await;
        if trim_task.is_none() {
            let cancel = CancellationToken::new();
            let task_cancel = cancel.clone();
            let broker = std::sync::Arc::clone(&self.broker);
            let inbound_stream = self.inbound_stream.clone();
            let interval = self.idle_trim_interval;
            let last_acked = std::sync::Arc::clone(&self.last_acked);
            let task = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        () = task_cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            let before = last_acked.lock().expect("broker transport mutex poisoned").clone();
                            if let Some(before_id) = before {
                                if let Err(err) = broker.trim_before(&inbound_stream, &before_id).await {
                                    warn!(error = %err, "idle trim failed");
                                }
                            }
                        }
                    }
                }
            });
            *trim_task = Some((cancel, task));
        }
        Ok(())
    }

    async fn read(&self) -> Result<RawMessage, TransportError> {
        let mut subscription = self.subscription.lock().await;
        let stream = subscription.as_mut().ok_or(TransportError::Closed)?;
        match stream.next().await {
            Some(Ok((entry_id, payload))) => {
                *self.last_acked.lock().expect("broker transport mutex poisoned") = Some(entry_id);
                serde_json::from_slice(&payload).map_err(|e| TransportError::Io(e.to_string()))
            }
            Some(Err(err)) => Err(err.into()),
            None => Err(TransportError::Closed),
        }
    }

    async fn write(&self, msg: RawMessage) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(&msg).map_err(|e| TransportError::Io(e.to_string()))?;
        self.broker.publish(&self.outbound_stream, payload).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some((cancel, task)) = self.trim_task.lock().await.take() {
            cancel.cancel();
            let _ = task.await;
        }
        *self.subscription.lock().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use control_proto::jsonrpc::RequestId;
    use futures_util::stream;
    use std::collections::VecDeque;
    use std::sync::Arc;

    struct MemoryBroker {
        published: Mutex<VecDeque<(String, Vec<u8>)>>,
        inbox: Mutex<Option<Vec<(String, Vec<u8>)>>>,
    }

    #[async_trait]
    impl BrokerClient for MemoryBroker {
        async fn publish(&self, stream: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
            self.published.lock().unwrap().push_back((stream.to_owned(), payload));
            Ok(())
        }

        async fn subscribe(&self, _stream: &str, _group: Option<&str>) -> Result<BrokerEntryStream, BrokerError> {
            let entries = self.inbox.lock().unwrap().take().unwrap_or_default();
            Ok(Box::pin(stream::iter(entries.into_iter().map(Ok))))
        }

        async fn trim_before(&self, _stream: &str, _before_id: &str) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn write_publishes_to_outbound_stream() {
        let broker = Arc::new(MemoryBroker { published: Mutex::new(VecDeque::new()), inbox: Mutex::new(Some(vec![])) });
        let transport = BrokerTransport::new(broker.clone(), "inbound", "outbound", None, Duration::from_secs(60));
        transport.open().await.unwrap();
        let raw = RawMessage::request(RequestId::Str("1".into()), "join", None);
        transport.write(raw).await.unwrap();
        let (stream_name, _) = broker.published.lock().unwrap().pop_front().unwrap();
        assert_eq!(stream_name, "outbound");
    }

    #[tokio::test]
    async fn read_deserializes_inbound_entry() {
        let raw = RawMessage::notification("room_closed", None);
        let payload = serde_json::to_vec(&raw).unwrap();
        let broker = Arc::new(MemoryBroker {
            published: Mutex::new(VecDeque::new()),
            inbox: Mutex::new(Some(vec![("1-0".to_owned(), payload)])),
        });
        let transport = BrokerTransport::new(broker, "inbound", "outbound", None, Duration::from_secs(60));
        transport.open().await.unwrap();
        let got = transport.read().await.unwrap();
        assert_eq!(got.method.as_deref(), Some("room_closed"));
    }
}
