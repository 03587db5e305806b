//! WebSocket object-stream implementation (§4.5.1a): a writer task owns a
//! bounded send queue and periodic pings; `read` is a plain pull off the
//! inbound half. This crate is agnostic to the concrete socket type
//! (`axum::extract::ws::WebSocket` on the server side, `tokio-tungstenite`
//! on the client side) — callers adapt their socket's split halves into
//! [`Frame`] streams/sinks, mirroring the writer-task-plus-bounded-queue
//! shape the forwarder socket handler uses for its own WS sessions.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use control_proto::RawMessage;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::transport::{ObjectStream, TransportError};

const SEND_QUEUE_CAPACITY: usize = 16;
const WRITE_DEADLINE: Duration = Duration::from_secs(3);
const PING_INTERVAL: Duration = Duration::from_secs(10);
const PONG_TIMEOUT: Duration = Duration::from_secs(3);

/// WS close code for a peer that violated the wire protocol, e.g. by
/// outrunning its send queue (§4.5.1a backpressure policy).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// A socket-agnostic WebSocket frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<u16>),
}

type BoxedSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;
type BoxedStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

enum Outbound {
    Message(RawMessage),
    Pong(Vec<u8>),
}

/// Object stream over a split WebSocket. Construct from any pair of
/// `Sink<Frame>` / `Stream<Item = Result<Frame, _>>` halves.
pub struct WebSocketTransport {
    outbound_tx: mpsc::Sender<Outbound>,
    force_close_tx: mpsc::UnboundedSender<u16>,
    inbound: tokio::sync::Mutex<BoxedStream>,
    last_pong: Arc<Mutex<Instant>>,
    closed: Arc<AtomicBool>,
    writer_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    pub fn new(
        sink: impl Sink<Frame, Error = TransportError> + Send + 'static,
        stream: impl Stream<Item = Result<Frame, TransportError>> + Send + 'static,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let (force_close_tx, force_close_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let writer_task = spawn_writer(Box::pin(sink), outbound_rx, force_close_rx, Arc::clone(&closed));
        Self {
            outbound_tx,
            force_close_tx,
            inbound: tokio::sync::Mutex::new(Box::pin(stream)),
            last_pong: Arc::new(Mutex::new(Instant::now())),
            closed,
            writer_task: tokio::sync::Mutex::new(Some(writer_task)),
        }
    }
}

fn spawn_writer(
    mut sink: BoxedSink,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    mut force_close_rx: mpsc::UnboundedReceiver<u16>,
    closed: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                // Bypasses the bounded queue: a full queue is exactly the
                // condition this signals, so it cannot itself be queued.
                code = force_close_rx.recv() => {
                    if let Some(code) = code {
                        warn!(code, "peer exceeded send queue capacity, closing");
                        let _ = tokio::time::timeout(WRITE_DEADLINE, sink.send(Frame::Close(Some(code)))).await;
                    }
                    break;
                }
                item = outbound_rx.recv() => {
                    let Some(item) = item else { break };
                    let frame = match item {
                        Outbound::Message(msg) => match serde_json::to_string(&msg) {
                            Ok(text) => Frame::Text(text),
                            Err(err) => {
                                warn!(error = %err, "dropping message that failed to serialize");
                                continue;
                            }
                        },
                        Outbound::Pong(payload) => Frame::Pong(payload),
                    };
                    match tokio::time::timeout(WRITE_DEADLINE, sink.send(frame)).await {
                        Ok(Ok(())) => {}
                        _ => {
                            warn!("write deadline exceeded or send failed, closing");
                            break;
                        }
                    }
                }
                _ = ping_interval.tick() => {
                    if tokio::time::timeout(WRITE_DEADLINE, sink.send(Frame::Ping(Vec::new()))).await.is_err() {
                        warn!("ping send failed, closing");
                        break;
                    }
                }
            }
        }
        closed.store(true, Ordering::SeqCst);
        let _ = sink.close().await;
    })
}

#[async_trait]
impl ObjectStream for WebSocketTransport {
    async fn open(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn read(&self) -> Result<RawMessage, TransportError> {
        let mut inbound = self.inbound.lock().await;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            match inbound.next().await {
                Some(Ok(Frame::Text(text))) => {
                    return serde_json::from_str(&text).map_err(|e| TransportError::Io(e.to_string()));
                }
                Some(Ok(Frame::Ping(payload))) => {
                    // auto-reply; ignore a saturated queue, the remote will retry.
                    let _ = self.outbound_tx.try_send(Outbound::Pong(payload));
                }
                Some(Ok(Frame::Pong(_))) => {
                    *self.last_pong.lock().expect("ws transport mutex poisoned") = Instant::now();
                }
                Some(Ok(Frame::Close(_))) | None => {
                    self.closed.store(true, Ordering::SeqCst);
                    return Err(TransportError::Closed);
                }
                Some(Err(err)) => {
                    self.closed.store(true, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }
    }

    async fn write(&self, msg: RawMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.outbound_tx.try_send(Outbound::Message(msg)).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                // A saturated queue means the peer is reading too slowly;
                // close immediately rather than let it grow unbounded.
                self.closed.store(true, Ordering::SeqCst);
                let _ = self.force_close_tx.send(CLOSE_POLICY_VIOLATION);
                TransportError::BufferFull
            }
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.writer_task.lock().await.take() {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use control_proto::{jsonrpc::RequestId, RawMessage};
    use futures_util::stream;

    fn text_stream(messages: Vec<Frame>) -> BoxedStream {
        Box::pin(stream::iter(messages.into_iter().map(Ok)))
    }

    struct NullSink;
    impl Sink<Frame> for NullSink {
        type Error = TransportError;
        fn poll_ready(self: Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }
        fn start_send(self: Pin<&mut Self>, _item: Frame) -> Result<(), Self::Error> {
            Ok(())
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }
        fn poll_close(self: Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn reads_text_frame_as_raw_message() {
        let raw = RawMessage::request(RequestId::Str("1".into()), "join", None);
        let json = serde_json::to_string(&raw).unwrap();
        let transport = WebSocketTransport::new(NullSink, text_stream(vec![Frame::Text(json)]));
        let got = transport.read().await.unwrap();
        assert_eq!(got.method.as_deref(), Some("join"));
    }

    #[tokio::test]
    async fn close_frame_reports_closed() {
        let transport = WebSocketTransport::new(NullSink, text_stream(vec![Frame::Close(None)]));
        assert!(matches!(transport.read().await, Err(TransportError::Closed)));
    }

    /// A sink whose `poll_ready` never completes: the writer task blocks
    /// forever trying to send the first item it pulls off the queue, so
    /// the queue behind it fills up from further `write` calls.
    struct StuckSink;
    impl Sink<Frame> for StuckSink {
        type Error = TransportError;
        fn poll_ready(self: Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Pending
        }
        fn start_send(self: Pin<&mut Self>, _item: Frame) -> Result<(), Self::Error> {
            Ok(())
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Pending
        }
        fn poll_close(self: Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn write_backpressure_closes_the_transport() {
        let transport = WebSocketTransport::new(StuckSink, text_stream(vec![]));
        let raw = RawMessage::notification("tick", None);

        let mut saw_buffer_full = false;
        for _ in 0..(SEND_QUEUE_CAPACITY + 4) {
            match transport.write(raw.clone()).await {
                Ok(()) => {}
                Err(TransportError::BufferFull) => {
                    saw_buffer_full = true;
                    break;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(saw_buffer_full, "expected a full send queue to report BufferFull");
        assert!(matches!(transport.write(raw).await, Err(TransportError::Closed)));
    }
}
