//! Adapts a split `axum::extract::ws::WebSocket` into the `Sink`/`Stream`
//! halves `rpc_engine::WebSocketTransport` is generic over. The transport
//! itself is socket-agnostic; this is the thin per-socket-library glue the
//! forwarder's own WS handler doesn't need because it talks to `WebSocket`
//! directly rather than through a reusable transport.

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::extract::ws::{CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, Stream};
use rpc_engine::{Frame, TransportError};

pub struct AxumWsSink {
    inner: SplitSink<WebSocket, WsMessage>,
}

impl AxumWsSink {
    #[must_use]
    pub fn new(inner: SplitSink<WebSocket, WsMessage>) -> Self {
        Self { inner }
    }
}

impl Sink<Frame> for AxumWsSink {
    type Error = TransportError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_ready(cx).map_err(|e| TransportError::Io(e.to_string()))
    }

    fn start_send(mut self: Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        let message = match item {
            Frame::Text(text) => WsMessage::Text(text.into()),
            Frame::Ping(payload) => WsMessage::Ping(payload.into()),
            Frame::Pong(payload) => WsMessage::Pong(payload.into()),
            Frame::Close(code) => {
                WsMessage::Close(code.map(|code| CloseFrame { code, reason: Utf8Bytes::from_static("") }))
            }
        };
        Pin::new(&mut self.inner).start_send(message).map_err(|e| TransportError::Io(e.to_string()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(|e| TransportError::Io(e.to_string()))
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_close(cx).map_err(|e| TransportError::Io(e.to_string()))
    }
}

pub struct AxumWsStream {
    inner: SplitStream<WebSocket>,
}

impl AxumWsStream {
    #[must_use]
    pub fn new(inner: SplitStream<WebSocket>) -> Self {
        Self { inner }
    }
}

impl Stream for AxumWsStream {
    type Item = Result<Frame, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            return match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(WsMessage::Text(text)))) => Poll::Ready(Some(Ok(Frame::Text(text.to_string())))),
                Poll::Ready(Some(Ok(WsMessage::Ping(payload)))) => Poll::Ready(Some(Ok(Frame::Ping(payload.to_vec())))),
                Poll::Ready(Some(Ok(WsMessage::Pong(payload)))) => Poll::Ready(Some(Ok(Frame::Pong(payload.to_vec())))),
                Poll::Ready(Some(Ok(WsMessage::Close(frame)))) => {
                    Poll::Ready(Some(Ok(Frame::Close(frame.map(|f| f.code)))))
                }
                // Binary frames carry nothing the signaling wire protocol
                // uses; drop and keep polling rather than surfacing an error.
                Poll::Ready(Some(Ok(WsMessage::Binary(_)))) => continue,
                Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(TransportError::Io(err.to_string())))),
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            };
        }
    }
}
